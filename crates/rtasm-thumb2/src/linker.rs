//! The link pass: section layout and chain cleanup.
//!
//! Link re-walks every emitted group in lockstep with the action list to
//! shrink alignment padding to its real size, rebase label offsets onto the
//! concatenated layout (sections follow each other in index order), and
//! collapse forward references to never-defined globals into negative
//! markers the encoder can report.

use crate::action::{payload, Action};
use crate::assembler::Assembler;
use crate::error::Error;
use crate::label::{LabelSlot, LOCAL_SLOTS};
use crate::section::Pos;

impl Assembler<'_> {
    /// Lay the sections out and return the total code size in bytes.
    ///
    /// Fails if a PC label is still undefined or an earlier pass recorded
    /// an error; the failure is sticky either way.
    pub fn link(&mut self) -> Result<usize, Error> {
        self.status()?;
        match self.link_inner() {
            Ok(size) => Ok(size),
            Err(err) => {
                self.status = Some(err);
                Err(err)
            }
        }
    }

    fn link_inner(&mut self) -> Result<usize, Error> {
        for label in 0..self.pc.len() {
            if matches!(self.pc[label], LabelSlot::Chain(_)) {
                return Err(Error::UndefinedPc { label });
            }
        }

        // Globals never defined in this run: collapse each chain into a
        // negative marker so the encoder can name the failure.
        for slot in LOCAL_SLOTS..self.lg.len() {
            if let LabelSlot::Chain(head) = self.lg[slot] {
                let marker = -(slot as i32);
                let mut link = head.raw() as i32;
                while link > 0 {
                    let node = Pos::from_raw(link as u32);
                    let entry = self
                        .sections
                        .get_mut(node.section())
                        .and_then(|sec| sec.entries.get_mut(node.index()))
                        .ok_or(Error::Phase)?;
                    link = core::mem::replace(entry, marker);
                }
            }
        }

        // `delta` tracks the cumulative layout correction: bytes saved by
        // shrinking aligns, plus the sizes of all previous sections.
        let mut delta: i32 = 0;
        for sec in 0..self.sections.len() {
            let mut pos = 0;
            while pos < self.sections[sec].entries.len() {
                let mut ip = self.sections[sec].entries[pos] as usize;
                pos += 1;
                loop {
                    let ins = self.action_word(ip)?;
                    ip += 1;
                    let Some(action) = Action::from_word(ins) else {
                        continue;
                    };
                    match action {
                        Action::Stop | Action::Section => break,
                        Action::Esc => ip += 1,
                        Action::RelExt => {}
                        Action::Align => {
                            // Replace the worst-case estimate with the real
                            // padding at the corrected offset.
                            let estimate = self
                                .sections[sec]
                                .entries
                                .get(pos)
                                .copied()
                                .ok_or(Error::Phase)?;
                            pos += 1;
                            delta -= (estimate + delta) & payload::low_byte(ins) as i32;
                        }
                        Action::LabelLg | Action::LabelPc => {
                            let entry = self.sections[sec]
                                .entries
                                .get_mut(pos)
                                .ok_or(Error::Phase)?;
                            *entry += delta;
                            pos += 1;
                        }
                        Action::VrList => pos += 2,
                        _ => pos += 1,
                    }
                }
            }
            delta += self.sections[sec].ofs;
        }

        self.codesize = delta as usize;
        Ok(self.codesize)
    }
}
