//! Assembler state and the emit pass.
//!
//! An [`Assembler`] is driven by a preprocessor-built action list plus the
//! runtime operands supplied to [`Assembler::put`]. Emitting buffers the
//! operands and threads label chains; [`Assembler::link`](crate::Assembler::link)
//! lays the sections out; [`Assembler::encode`](crate::Assembler::encode)
//! produces the executable image.
//!
//! Errors are sticky: the first failure is recorded and every later pass
//! short-circuits until the next [`Assembler::setup`].

use alloc::vec;
use alloc::vec::Vec;

use crate::action::{payload, Action};
use crate::error::Error;
use crate::label::{LabelSlot, FIRST_GLOBAL, LOCAL_SLOTS, NUMBER_BIAS};
use crate::section::{Pos, Section, MAX_SECTIONS};

/// Result of querying a PC label with [`Assembler::pc_label`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PcLookup {
    /// Defined; the byte offset of the label from the image base. Only
    /// final once `link` has run.
    Defined(i32),
    /// Referenced but never defined.
    Undefined,
    /// Never touched, or outside the table sized by `grow_pc`.
    Unused,
}

/// The runtime encoding engine for one assembly run.
///
/// # Lifecycle
///
/// `new` → (`setup_global` | `grow_pc`)* → `setup` → `put`* → `link` →
/// `encode`. A new `setup` resets all buffered state and starts the next
/// run; storage is reused.
///
/// ```
/// use rtasm_thumb2::Assembler;
///
/// // NOP.W followed by a stop action.
/// const ACTIONS: &[u32] = &[0xF3AF_8000, 0x0000_0000];
///
/// let mut asm = Assembler::new(1);
/// asm.setup(ACTIONS);
/// asm.put(0, &[])?;
/// let size = asm.link()?;
/// let mut code = vec![0u8; size];
/// asm.encode(&mut code)?;
/// assert_eq!(code, [0xAF, 0xF3, 0x00, 0x80]);
/// # Ok::<(), rtasm_thumb2::Error>(())
/// ```
#[derive(Debug)]
pub struct Assembler<'a> {
    /// The installed action list (static data owned by the host).
    pub(crate) actions: &'a [u32],
    pub(crate) sections: Vec<Section>,
    /// Index of the section `put` currently appends to.
    pub(crate) active: usize,
    /// Local/global label table: slots 0..=9 locals, 10.. globals.
    pub(crate) lg: Vec<LabelSlot>,
    /// PC label table, sized by `grow_pc`.
    pub(crate) pc: Vec<LabelSlot>,
    /// Global label addresses resolved during encode.
    pub(crate) globals: Vec<Option<usize>>,
    /// Total byte size of all sections, computed by `link`.
    pub(crate) codesize: usize,
    pub(crate) status: Option<Error>,
}

impl<'a> Assembler<'a> {
    /// Create an engine with the given number of sections (clamped to the
    /// 8-bit section space, 1..=256).
    #[must_use]
    pub fn new(max_sections: usize) -> Self {
        let count = max_sections.clamp(1, MAX_SECTIONS);
        let mut sections = Vec::new();
        sections.resize_with(count, Section::default);
        Assembler {
            actions: &[],
            sections,
            active: 0,
            lg: Vec::new(),
            pc: Vec::new(),
            globals: Vec::new(),
            codesize: 0,
            status: None,
        }
    }

    /// Size the local/global label table for `max_globals` global labels.
    ///
    /// Resolved global addresses are read back with [`Assembler::global`]
    /// after `encode`. Call before [`Assembler::setup`].
    pub fn setup_global(&mut self, max_globals: usize) {
        self.lg = vec![LabelSlot::Unused; LOCAL_SLOTS + max_globals];
        self.globals = vec![None; max_globals];
    }

    /// Grow the PC label table to at least `max_pc` slots. New slots start
    /// unused; existing slots keep their state, so this may also be called
    /// between `put`s.
    pub fn grow_pc(&mut self, max_pc: usize) {
        if max_pc > self.pc.len() {
            self.pc.resize(max_pc, LabelSlot::Unused);
        }
    }

    /// Install an action list and reset for a fresh run.
    ///
    /// Clears the sticky status, all label state, every section buffer, and
    /// makes section 0 active.
    pub fn setup(&mut self, actions: &'a [u32]) {
        self.actions = actions;
        self.status = None;
        self.active = 0;
        self.codesize = 0;
        self.lg.fill(LabelSlot::Unused);
        self.pc.fill(LabelSlot::Unused);
        self.globals.fill(None);
        for sec in &mut self.sections {
            sec.reset();
        }
    }

    /// The sticky status: `Ok` or the first recorded error.
    pub fn status(&self) -> Result<(), Error> {
        match self.status {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The packed 32-bit status word (0 when OK). See [`Error::code`].
    #[must_use]
    pub fn status_code(&self) -> u32 {
        self.status.map_or(0, |err| err.code())
    }

    /// Total code size in bytes, valid after [`Assembler::link`].
    #[must_use]
    pub fn code_size(&self) -> usize {
        self.codesize
    }

    /// Number of configured sections.
    #[must_use]
    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    /// Index of the currently active section.
    #[must_use]
    pub fn active_section(&self) -> usize {
        self.active
    }

    /// Address of global label `index`, resolved during `encode`.
    #[must_use]
    pub fn global(&self, index: usize) -> Option<usize> {
        self.globals.get(index).copied().flatten()
    }

    /// All resolved global label addresses, indexed by global number.
    #[must_use]
    pub fn globals(&self) -> &[Option<usize>] {
        &self.globals
    }

    /// Query a PC label's byte offset (final after `link`).
    #[must_use]
    pub fn pc_label(&self, pc: usize) -> PcLookup {
        match self.pc.get(pc) {
            Some(LabelSlot::Defined(pos)) => match self.entry(*pos) {
                Ok(ofs) => PcLookup::Defined(ofs),
                Err(_) => PcLookup::Unused,
            },
            Some(LabelSlot::Chain(_)) => PcLookup::Undefined,
            _ => PcLookup::Unused,
        }
    }

    /// Sanity check between isolated encoding steps.
    ///
    /// Fails on a forward local reference with no definition, resets local
    /// labels 1..=9 for the next step, and (when `expected_section` is
    /// given) verifies the active section. The result is sticky.
    pub fn check_step(&mut self, expected_section: Option<usize>) -> Result<(), Error> {
        if self.status.is_none() {
            let end = LOCAL_SLOTS.min(self.lg.len());
            for label in 1..end {
                if matches!(self.lg[label], LabelSlot::Chain(_)) {
                    self.status = Some(Error::UndefinedLocal { label });
                    break;
                }
                self.lg[label] = LabelSlot::Unused;
            }
        }
        if self.status.is_none() {
            if let Some(expected) = expected_section {
                if expected != self.active {
                    self.status = Some(Error::SectionMismatch {
                        section: self.active,
                    });
                }
            }
        }
        self.status()
    }

    // ── emit pass ──────────────────────────────────────────

    /// Emit one action group, consuming runtime operands from `args` in the
    /// order the opcode table dictates.
    ///
    /// `start` is the action-list offset the preprocessor paired with these
    /// operands. On failure the error is recorded and later passes
    /// short-circuit.
    pub fn put(&mut self, start: usize, args: &[i32]) -> Result<(), Error> {
        self.status()?;
        match self.put_inner(start, args) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.status = Some(err);
                Err(err)
            }
        }
    }

    fn put_inner(&mut self, start: usize, args: &[i32]) -> Result<(), Error> {
        let sec = self.active;
        self.sections[sec].reserve_group()?;
        self.sections[sec].entries.push(start as i32);
        let mut ofs = self.sections[sec].ofs;
        let mut args = args.iter().copied();
        let mut ip = start;

        loop {
            let idx = ip;
            let ins = self.action_word(ip)?;
            ip += 1;
            let Some(action) = Action::from_word(ins) else {
                ofs += 4;
                continue;
            };

            let wanted = action.args();
            let mut next_arg = || args.next().ok_or(Error::ArgumentMismatch { action: idx });
            let n = if wanted >= 1 { next_arg()? } else { 0 };
            let n2 = if wanted >= 2 { next_arg()? } else { 0 };

            match action {
                Action::Stop => break,
                Action::Section => {
                    let target = payload::low_byte(ins) as usize;
                    if target >= self.sections.len() {
                        return Err(Error::SectionRange { action: idx });
                    }
                    self.active = target;
                    break;
                }
                Action::Esc => {
                    ip += 1;
                    ofs += 4;
                }
                Action::RelExt => {}
                Action::Align => {
                    // Conservative worst-case padding; link shrinks it.
                    ofs += payload::low_byte(ins) as i32;
                    self.sections[sec].entries.push(ofs);
                }
                Action::RelLg => {
                    let number = (ins & payload::LABEL_MASK) as usize;
                    if number >= NUMBER_BIAS {
                        // Backward local or global reference.
                        let slot = number - NUMBER_BIAS;
                        let state = *self
                            .lg
                            .get(slot)
                            .ok_or(Error::GlobalRange { action: idx })?;
                        if slot < LOCAL_SLOTS && !matches!(state, LabelSlot::Defined(_)) {
                            return Err(Error::GlobalRange { action: idx });
                        }
                        put_ref(&mut self.sections, &mut self.lg, sec, slot);
                    } else {
                        // Forward local reference. A previous definition is
                        // ignored: locals restart per step, so this always
                        // chains.
                        if number >= self.lg.len() {
                            return Err(Error::GlobalRange { action: idx });
                        }
                        let pos = Pos::new(sec, self.sections[sec].entries.len());
                        let link = self.lg[number].chain_link();
                        self.sections[sec].entries.push(link);
                        self.lg[number] = LabelSlot::Chain(pos);
                    }
                }
                Action::RelPc => {
                    let slot = pc_slot(&self.pc, n, idx)?;
                    put_ref(&mut self.sections, &mut self.pc, sec, slot);
                }
                Action::LabelLg => {
                    let number = (ins & payload::LABEL_MASK) as usize;
                    let slot = number
                        .checked_sub(NUMBER_BIAS)
                        .filter(|&s| s < self.lg.len())
                        .ok_or(Error::GlobalRange { action: idx })?;
                    put_label(&mut self.sections, &mut self.lg, sec, slot, ofs)?;
                }
                Action::LabelPc => {
                    let slot = pc_slot(&self.pc, n, idx)?;
                    put_label(&mut self.sections, &mut self.pc, sec, slot, ofs)?;
                }
                Action::Imm | Action::Imm16 => {
                    #[cfg(feature = "checks")]
                    check_imm(ins, n, idx)?;
                    self.sections[sec].entries.push(n);
                }
                Action::Imm12 => {
                    #[cfg(feature = "checks")]
                    if crate::thumb::encode_modified_imm(n as u32).is_none() {
                        return Err(Error::ImmediateRange { action: idx });
                    }
                    self.sections[sec].entries.push(n);
                }
                Action::ImmL => {
                    #[cfg(feature = "checks")]
                    check_imm_load(ins, n, idx)?;
                    self.sections[sec].entries.push(n);
                }
                Action::ImmV8 => {
                    #[cfg(feature = "checks")]
                    if n & 3 != 0 {
                        return Err(Error::ImmediateRange { action: idx });
                    }
                    // Scaled once here; the encoder packs the quarter value.
                    let scaled = n >> 2;
                    #[cfg(feature = "checks")]
                    check_imm_load(ins, scaled, idx)?;
                    self.sections[sec].entries.push(scaled);
                }
                Action::Imm32 | Action::RelApc | Action::ImmShift => {
                    self.sections[sec].entries.push(n);
                }
                Action::VrList => {
                    #[cfg(feature = "checks")]
                    if !(0..=30).contains(&n) || !(0..=30).contains(&n2) {
                        return Err(Error::ImmediateRange { action: idx });
                    }
                    self.sections[sec].entries.push(n);
                    self.sections[sec].entries.push(n2);
                }
            }
        }

        self.sections[sec].ofs = ofs;
        Ok(())
    }

    // ── shared internals ───────────────────────────────────

    pub(crate) fn action_word(&self, ip: usize) -> Result<u32, Error> {
        self.actions.get(ip).copied().ok_or(Error::Phase)
    }

    /// Read the buffer entry a position names.
    pub(crate) fn entry(&self, pos: Pos) -> Result<i32, Error> {
        self.sections
            .get(pos.section())
            .and_then(|sec| sec.entries.get(pos.index()))
            .copied()
            .ok_or(Error::Phase)
    }

    /// Record a resolved global label address, if the label number names a
    /// host-visible global.
    pub(crate) fn set_global(&mut self, number: usize, addr: usize) -> Result<(), Error> {
        if number < FIRST_GLOBAL {
            return Ok(());
        }
        let slot = self
            .globals
            .get_mut(number - FIRST_GLOBAL)
            .ok_or(Error::Phase)?;
        *slot = Some(addr);
        Ok(())
    }
}

/// Resolve a runtime PC label number to a table slot.
fn pc_slot(table: &[LabelSlot], n: i32, idx: usize) -> Result<usize, Error> {
    usize::try_from(n)
        .ok()
        .filter(|&slot| slot < table.len())
        .ok_or(Error::PcRange { action: idx })
}

/// Store a reference: a defined label resolves to its position, anything
/// else becomes the new head of the forward chain.
fn put_ref(sections: &mut [Section], table: &mut [LabelSlot], sec: usize, slot: usize) {
    let pos = Pos::new(sec, sections[sec].entries.len());
    match table[slot] {
        LabelSlot::Defined(target) => sections[sec].entries.push(target.raw() as i32),
        other => {
            sections[sec].entries.push(other.chain_link());
            table[slot] = LabelSlot::Chain(pos);
        }
    }
}

/// Define a label here: collapse its forward chain onto this position and
/// store the pass-1 offset estimate.
fn put_label(
    sections: &mut [Section],
    table: &mut [LabelSlot],
    sec: usize,
    slot: usize,
    ofs: i32,
) -> Result<(), Error> {
    let pos = Pos::new(sec, sections[sec].entries.len());
    if let LabelSlot::Chain(head) = table[slot] {
        let mut link = head.raw() as i32;
        while link > 0 {
            let node = Pos::from_raw(link as u32);
            let entry = sections
                .get_mut(node.section())
                .and_then(|s| s.entries.get_mut(node.index()))
                .ok_or(Error::Phase)?;
            link = core::mem::replace(entry, pos.raw() as i32);
        }
    }
    table[slot] = LabelSlot::Defined(pos);
    sections[sec].entries.push(ofs);
    Ok(())
}

#[cfg(feature = "checks")]
fn check_imm(ins: u32, n: i32, idx: usize) -> Result<(), Error> {
    let scale = payload::scale(ins);
    if i64::from(n) & ((1i64 << scale) - 1) != 0 {
        return Err(Error::ImmediateRange { action: idx });
    }
    let bits = payload::bits(ins);
    let fits = if ins & payload::SIGNED != 0 {
        let half = 1i64 << bits.saturating_sub(1);
        (i64::from(n) + half) >> bits == 0
    } else {
        i64::from(n) >> bits == 0
    };
    if fits {
        Ok(())
    } else {
        Err(Error::ImmediateRange { action: idx })
    }
}

#[cfg(feature = "checks")]
fn check_imm_load(ins: u32, n: i32, idx: usize) -> Result<(), Error> {
    let bits = payload::bits(ins);
    if i64::from(n).unsigned_abs() >> bits == 0 {
        Ok(())
    } else {
        Err(Error::ImmediateRange { action: idx })
    }
}
