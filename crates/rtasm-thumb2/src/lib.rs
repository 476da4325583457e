//! # rtasm-thumb2 — Runtime Thumb-2 (ARMv7-M) Encoding Engine
//!
//! `rtasm-thumb2` is the runtime half of a dynamic-assembler toolchain: a
//! compile-time preprocessor turns assembly templates into a static *action
//! list* (a stream of 32-bit action words) plus `put` calls carrying
//! runtime-computed operands. This crate consumes those inputs, resolves
//! labels, computes branch displacements, patches immediates, and produces
//! an executable Thumb-2 byte image ready to be copied into executable
//! memory.
//!
//! ## Quick Start
//!
//! ```rust
//! use rtasm_thumb2::Assembler;
//!
//! // Action stream as a preprocessor would emit it:
//! //   ->target:             (define global label 20)
//! //   bl ->target           (wide branch back to the label)
//! const ACTIONS: &[u32] = &[
//!     6 << 16 | 20,                    // label definition
//!     0xF000_D000,                     // BL stub
//!     5 << 16 | 0x8000 | 0x4000 | 20,  // wide-branch reference
//!     0,                               // stop
//! ];
//!
//! let mut asm = Assembler::new(1);
//! asm.setup_global(1);
//! asm.setup(ACTIONS);
//! asm.put(0, &[])?;
//! let size = asm.link()?;
//! let mut code = vec![0u8; size];
//! asm.encode(&mut code)?;
//! // BL with displacement -4, in on-wire half-word order.
//! assert_eq!(code, [0xFF, 0xF7, 0xFE, 0xFF]);
//! # Ok::<(), rtasm_thumb2::Error>(())
//! ```
//!
//! ## Features
//!
//! - **Pure Rust** — no C dependency, `#![forbid(unsafe_code)]`.
//! - **`no_std` + `alloc`** — embeddable in firmware and JIT hosts.
//! - **Three-pass engine** — emit (`put`), [`link`](Assembler::link),
//!   [`encode`](Assembler::encode), with sticky error reporting carrying
//!   the offending action index.
//! - **Bit-exact Thumb-2** — modified 12-bit immediates, `movw`/`movt`
//!   splits, S/I1/I2/J1/J2 branch interleaving, VFP register lists, and
//!   the little-endian half-word swap.

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]
// ── Lint policy ──────────────────────────────────────────────────────────
// An encoding engine lives off narrowing casts between i32/u32/usize and
// dense hex literals (0xF3AF8000, 0x00FF_FFFF). The lints below are
// expected and acceptable in this context.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_lossless,
    clippy::cast_possible_wrap,
    clippy::unreadable_literal,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::uninlined_format_args,
    clippy::match_same_arms,
    clippy::too_many_lines
)]

extern crate alloc;

/// The action opcode contract shared with the preprocessor.
pub mod action;
/// Assembler state, lifecycle, and the emit pass.
pub mod assembler;
/// The encode pass: image emission, patching, and the extern hook.
pub mod encoder;
/// Error types and packed status codes.
pub mod error;
pub(crate) mod label;
mod linker;
/// Section buffers and the position composite.
pub mod section;
/// Bit-exact Thumb-2 field codecs.
pub mod thumb;

// Re-exports
pub use action::Action;
pub use assembler::{Assembler, PcLookup};
pub use encoder::ExternResolver;
pub use error::Error;
pub use section::Pos;
