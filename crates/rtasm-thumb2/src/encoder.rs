//! The encode pass: produce the executable image.
//!
//! Encode walks every section buffer in lockstep with the action list a
//! final time. Literal words are emitted; patch actions OR their bits into
//! the most recently emitted word. Because later actions may still mutate
//! that word, the half-word swap to on-wire order is deferred: a word is
//! converted only when the next word is about to be written, or when the
//! image is complete.

use crate::action::{payload, Action};
use crate::assembler::Assembler;
use crate::error::Error;
use crate::section::Pos;
use crate::thumb;

/// Resolves external-label references during [`Assembler::encode_with`].
///
/// Implemented for any `FnMut(usize, u16, bool) -> i32` closure. The
/// resolver must not touch the assembler; it sees the byte offset of the
/// patch site, the external index from the action payload, and whether the
/// site is a data reference (as opposed to a branch), and returns the
/// displacement to patch in.
pub trait ExternResolver {
    /// Resolve external label `index` referenced at `site` bytes into the
    /// output image.
    fn resolve(&mut self, site: usize, index: u16, is_data: bool) -> i32;
}

impl<F: FnMut(usize, u16, bool) -> i32> ExternResolver for F {
    fn resolve(&mut self, site: usize, index: u16, is_data: bool) -> i32 {
        self(site, index, is_data)
    }
}

/// Word-granular output cursor with the deferred half-word swap.
///
/// The most recently pushed word stays pending (still patchable); pushing
/// the next word commits it through [`thumb::image_bytes`].
struct WordCursor<'b> {
    buf: &'b mut [u8],
    written: usize,
    pending: Option<u32>,
}

impl<'b> WordCursor<'b> {
    fn new(buf: &'b mut [u8]) -> Self {
        WordCursor {
            buf,
            written: 0,
            pending: None,
        }
    }

    /// Byte offset just past the pending word — the encoder's notion of
    /// "here" for displacement arithmetic.
    fn offset(&self) -> usize {
        self.written + if self.pending.is_some() { 4 } else { 0 }
    }

    fn push(&mut self, word: u32) -> Result<(), Error> {
        self.commit()?;
        self.pending = Some(word);
        Ok(())
    }

    /// OR bits into the pending word. Failing means a patch action arrived
    /// before any instruction word — a malformed action stream.
    fn or_into(&mut self, bits: u32) -> Result<(), Error> {
        match self.pending.as_mut() {
            Some(word) => {
                *word |= bits;
                Ok(())
            }
            None => Err(Error::Phase),
        }
    }

    fn commit(&mut self) -> Result<(), Error> {
        if let Some(word) = self.pending.take() {
            let end = self.written + 4;
            let dst = self
                .buf
                .get_mut(self.written..end)
                .ok_or(Error::Phase)?;
            dst.copy_from_slice(&thumb::image_bytes(word));
            self.written = end;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<usize, Error> {
        self.commit()?;
        Ok(self.written)
    }
}

impl Assembler<'_> {
    /// Encode the image into `buf`, resolving externals to displacement 0.
    ///
    /// Returns the bytes written (always the linked code size). Call after
    /// [`Assembler::link`].
    pub fn encode(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        fn unresolved(_site: usize, _index: u16, _is_data: bool) -> i32 {
            0
        }
        let mut resolver = unresolved;
        self.encode_with(buf, &mut resolver)
    }

    /// Encode the image into `buf`, resolving externals through `externs`.
    pub fn encode_with<R: ExternResolver>(
        &mut self,
        buf: &mut [u8],
        externs: &mut R,
    ) -> Result<usize, Error> {
        self.status()?;
        match self.encode_inner(buf, externs) {
            Ok(written) => Ok(written),
            Err(err) => {
                self.status = Some(err);
                Err(err)
            }
        }
    }

    fn encode_inner<R: ExternResolver>(
        &mut self,
        buf: &mut [u8],
        externs: &mut R,
    ) -> Result<usize, Error> {
        if buf.len() < self.codesize {
            return Err(Error::BufferTooSmall {
                needed: self.codesize,
                len: buf.len(),
            });
        }
        // Base address for absolute targets and resolved globals. The
        // engine targets 32-bit cores, so address arithmetic wraps at 32
        // bits like the hardware.
        let base_addr = buf.as_ptr() as usize;
        let mut cur = WordCursor::new(buf);

        for sec in 0..self.sections.len() {
            let mut pos = 0;
            while pos < self.sections[sec].entries.len() {
                let mut ip = self.sections[sec].entries[pos] as usize;
                pos += 1;
                loop {
                    let idx = ip;
                    let ins = self.action_word(ip)?;
                    ip += 1;
                    let Some(action) = Action::from_word(ins) else {
                        cur.push(ins)?;
                        continue;
                    };

                    let slots = action.slots();
                    let mut n = 0;
                    let mut n2 = 0;
                    if slots >= 1 {
                        n = self.sections[sec]
                            .entries
                            .get(pos)
                            .copied()
                            .ok_or(Error::Phase)?;
                        pos += 1;
                    }
                    if slots >= 2 {
                        n2 = self.sections[sec]
                            .entries
                            .get(pos)
                            .copied()
                            .ok_or(Error::Phase)?;
                        pos += 1;
                    }

                    match action {
                        Action::Stop | Action::Section => break,
                        Action::Esc => {
                            let datum = self.action_word(ip)?;
                            ip += 1;
                            cur.push(datum)?;
                        }
                        Action::RelExt => {
                            let index = (ins & payload::LABEL_MASK) as u16;
                            let is_data = ins & payload::EXTERN_DATA != 0;
                            let disp = externs.resolve(cur.offset(), index, is_data);
                            patch_rel(&mut cur, ins, disp, idx)?;
                        }
                        Action::Align => {
                            let mask = payload::low_byte(ins) as usize;
                            while cur.offset() & mask != 0 {
                                cur.push(thumb::NOP_W)?;
                            }
                        }
                        Action::RelLg => {
                            if n < 0 {
                                return Err(Error::UndefinedGlobal { action: idx });
                            }
                            let target = self.entry(Pos::from_raw(n as u32))?;
                            let disp = target.wrapping_sub(cur.offset() as i32);
                            patch_rel(&mut cur, ins, disp, idx)?;
                        }
                        Action::RelPc => {
                            let target = self.entry(Pos::from_raw(n as u32))?;
                            let disp = target.wrapping_sub(cur.offset() as i32);
                            patch_rel(&mut cur, ins, disp, idx)?;
                        }
                        Action::RelApc => {
                            // The stored value is an absolute address; turn
                            // it into a displacement from this instruction.
                            let here = (base_addr as u32).wrapping_add(cur.offset() as u32);
                            let disp = (n as u32).wrapping_sub(here).wrapping_add(4) as i32;
                            patch_branch(&mut cur, ins, disp, idx)?;
                        }
                        Action::LabelLg => {
                            let number = (ins & payload::LABEL_MASK) as usize;
                            self.set_global(number, base_addr.wrapping_add(n as u32 as usize))?;
                        }
                        Action::LabelPc => {}
                        Action::Imm => {
                            let mut value = n;
                            let scale = if ins & payload::SIGNED != 0 {
                                value = value.wrapping_add(payload::imm_adjust(ins));
                                0
                            } else {
                                payload::scale(ins)
                            };
                            let mask = (1u32 << payload::bits(ins)) - 1;
                            cur.or_into((((value >> scale) as u32) & mask) << payload::shift(ins))?;
                        }
                        Action::Imm12 => match thumb::encode_modified_imm(n as u32) {
                            Some(bits) => cur.or_into(bits)?,
                            None => return Err(Error::ImmediateRange { action: idx }),
                        },
                        Action::Imm16 => cur.or_into(thumb::movw_split(n as u32))?,
                        Action::Imm32 => cur.or_into(n as u32)?,
                        Action::ImmL | Action::ImmV8 => {
                            cur.or_into(thumb::load_offset_bits(n))?;
                        }
                        Action::ImmShift => {
                            cur.or_into((ins & 0xFFFF) << (n & 31) as u32)?;
                        }
                        Action::VrList => {
                            cur.or_into(thumb::vreg_list_bits(ins & 1 != 0, n, n2))?;
                        }
                    }
                }
            }
        }

        let written = cur.finish()?;
        if written != self.codesize {
            return Err(Error::Phase);
        }
        Ok(written)
    }
}

/// Patch a PC-relative reference according to its payload flags: branch,
/// VFP load, ADR, or plain 12-bit load offset.
fn patch_rel(cur: &mut WordCursor<'_>, ins: u32, n: i32, action: usize) -> Result<(), Error> {
    if ins & payload::BRANCH != 0 {
        return patch_branch(cur, ins, n, action);
    }
    if ins & payload::WIDE != 0 {
        // VFP load: 8-bit offset in words.
        if n & 3 != 0 || !(-1020..=1020).contains(&n) {
            return Err(Error::DisplacementRange { action });
        }
        return cur.or_into(thumb::load_offset_bits(n / 4));
    }
    if ins & payload::ADR != 0 {
        if n & 1 != 0 || n <= -4096 || n >= 4096 {
            return Err(Error::DisplacementRange { action });
        }
        let (sub, magnitude) = if n < 0 { (0x00A0_0000, -n) } else { (0, n) };
        return cur.or_into(sub | thumb::adr_split(magnitude as u32));
    }
    if n & 3 != 0 || !(-4096..4096).contains(&n) {
        return Err(Error::DisplacementRange { action });
    }
    cur.or_into(thumb::load_offset_bits(n))
}

fn patch_branch(cur: &mut WordCursor<'_>, ins: u32, n: i32, action: usize) -> Result<(), Error> {
    let wide = ins & payload::WIDE != 0;
    if !thumb::branch_in_range(n, wide) {
        return Err(Error::DisplacementRange { action });
    }
    cur.or_into(thumb::branch_bits(n, wide))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    const STOP: u32 = 0;
    const NOP_W: u32 = thumb::NOP_W;

    fn word(action: u32, payload: u32) -> u32 {
        (action << 16) | payload
    }

    fn run(actions: &[u32], args: &[i32]) -> Vec<u8> {
        let mut asm = Assembler::new(1);
        asm.setup(actions);
        asm.put(0, args).unwrap();
        let size = asm.link().unwrap();
        let mut buf = vec![0u8; size];
        let written = asm.encode(&mut buf).unwrap();
        assert_eq!(written, size);
        buf
    }

    fn words(image: &[u8]) -> Vec<u32> {
        image
            .chunks_exact(4)
            .map(|c| {
                let raw = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                raw.rotate_left(16)
            })
            .collect()
    }

    #[test]
    fn literal_is_half_word_swapped() {
        let image = run(&[0xF000_D000, STOP], &[]);
        assert_eq!(image, [0x00, 0xF0, 0x00, 0xD0]);
    }

    #[test]
    fn imm32_patches_the_pending_word() {
        let actions = [0xF000_0000, word(13, 0), STOP];
        let image = run(&actions, &[0x0000_0F0F]);
        assert_eq!(words(&image), [0xF000_0F0F]);
    }

    #[test]
    fn esc_emits_raw_datum() {
        let actions = [word(2, 0), 0x0000_0001, STOP];
        let image = run(&actions, &[]);
        assert_eq!(words(&image), [0x0000_0001]);
    }

    #[test]
    fn align_pads_with_nop() {
        let actions = [NOP_W, word(4, 7), NOP_W, STOP];
        let image = run(&actions, &[]);
        assert_eq!(words(&image), [NOP_W, NOP_W, NOP_W]);
    }

    #[test]
    fn patch_before_any_word_is_a_phase_error() {
        let actions = [word(13, 0), STOP];
        let mut asm = Assembler::new(1);
        asm.setup(&actions);
        asm.put(0, &[1]).unwrap();
        asm.link().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(asm.encode(&mut buf), Err(Error::Phase));
    }

    #[test]
    fn buffer_too_small_is_rejected_up_front() {
        let actions = [NOP_W, NOP_W, STOP];
        let mut asm = Assembler::new(1);
        asm.setup(&actions);
        asm.put(0, &[]).unwrap();
        asm.link().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(
            asm.encode(&mut buf),
            Err(Error::BufferTooSmall { needed: 8, len: 4 })
        );
    }
}
