//! Performance benchmarks for `rtasm_thumb2`.
//!
//! Measures:
//! - Full emit/link/encode pipeline throughput on an immediate-heavy stream
//! - Label-heavy workloads (hundreds of forward branches to one label)
//!
//! Run with: `cargo bench`

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use rtasm_thumb2::Assembler;

const STOP: u32 = 0;
const REL_LG: u32 = 5 << 16;
const LABEL_LG: u32 = 6 << 16;
const IMM16: u32 = 12 << 16;
const BL_STUB: u32 = 0xF000_D000;

// ─── Immediate-heavy pipeline ────────────────────────────────────────────────

fn bench_movw_stream(c: &mut Criterion) {
    const N: usize = 256;
    // N groups of: movw stub, IMM16, stop.
    let mut actions = Vec::new();
    for _ in 0..N {
        actions.push(0xF240_0000);
        actions.push(IMM16 | (16 << 5));
        actions.push(STOP);
    }
    let args: Vec<i32> = (0..N as i32).collect();

    let mut group = c.benchmark_group("pipeline");
    group.throughput(Throughput::Bytes((N * 4) as u64));
    group.bench_function("movw_256", |b| {
        let mut asm = Assembler::new(1);
        let mut buf = vec![0u8; N * 4];
        b.iter(|| {
            asm.setup(&actions);
            for i in 0..N {
                asm.put(i * 3, &args[i..=i]).unwrap();
            }
            let size = asm.link().unwrap();
            asm.encode(&mut buf[..size]).unwrap();
            black_box(&buf);
        })
    });
    group.finish();
}

// ─── Label-heavy workload ────────────────────────────────────────────────────

fn bench_forward_branches(c: &mut Criterion) {
    const N: usize = 256;
    // N groups of: bl >1, then a single group defining local 1.
    let mut actions = Vec::new();
    for _ in 0..N {
        actions.push(BL_STUB);
        actions.push(REL_LG | 0x8000 | 0x4000 | 1);
        actions.push(STOP);
    }
    let define = actions.len();
    actions.push(LABEL_LG | 11);
    actions.push(STOP);

    let mut group = c.benchmark_group("labels");
    group.throughput(Throughput::Bytes((N * 4) as u64));
    group.bench_function("forward_branches_256", |b| {
        let mut asm = Assembler::new(1);
        asm.setup_global(0);
        let mut buf = vec![0u8; N * 4];
        b.iter(|| {
            asm.setup(&actions);
            for i in 0..N {
                asm.put(i * 3, &[]).unwrap();
            }
            asm.put(define, &[]).unwrap();
            let size = asm.link().unwrap();
            asm.encode(&mut buf[..size]).unwrap();
            black_box(&buf);
        })
    });
    group.finish();
}

criterion_group!(benches, bench_movw_stream, bench_forward_branches);
criterion_main!(benches);
