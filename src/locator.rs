//! Tagged symbolic references to storage and label targets.
//!
//! A [`Locator`] names a function slot, an argument or return slot, a
//! global memory member, a block label, or interned ROM data. Instructions
//! carry locators instead of addresses; the emitter resolves them after
//! layout. Locators also carry a small offset and a byte selector so that
//! switch tables can reference `(target - 1).lo` / `.hi` without extra
//! instruction kinds.

use std::fmt;

use crate::fns::{FnId, GmemberId};
use crate::ir::CfgId;
use crate::rom_array::RomArrayId;

/// The tag half of a locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocKind {
    None,
    /// A function entry (call target).
    Fn(FnId),
    /// An argument slot of a function.
    Arg(FnId, u8),
    /// A return slot of a function.
    Return(FnId, u8),
    /// A global memory member.
    Gmember(GmemberId),
    /// A basic-block label. The second field is the entrance index;
    /// 0 is the primary entrance.
    CfgLabel(CfgId, u8),
    /// A synthesized label with no CFG identity.
    MinorLabel(u32),
    /// The low-byte half of a switch dispatch table.
    SwitchLoTable(CfgId),
    /// The high-byte half of a switch dispatch table.
    SwitchHiTable(CfgId),
    /// Interned read-only data.
    RomArray(RomArrayId),
    /// A literal byte, used to fill switch-table holes.
    ConstByte(u8),
    /// A register-allocation temporary named after its SSA definition.
    Ssa(u32),
    /// A register-allocation temporary for a phi web.
    Phi(u32),
}

/// Which byte of the resolved address a `Data` entry takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteSel {
    Whole,
    PtrLo,
    PtrHi,
}

/// A tagged storage/label reference with an address offset and byte
/// selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Locator {
    kind: LocKind,
    offset: i16,
    sel: ByteSel,
}

impl Locator {
    const fn of(kind: LocKind) -> Self {
        Self {
            kind,
            offset: 0,
            sel: ByteSel::Whole,
        }
    }

    pub const NONE: Locator = Locator::of(LocKind::None);

    pub fn fn_entry(f: FnId) -> Self {
        Self::of(LocKind::Fn(f))
    }

    pub fn arg(f: FnId, index: u8) -> Self {
        Self::of(LocKind::Arg(f, index))
    }

    pub fn ret(f: FnId, index: u8) -> Self {
        Self::of(LocKind::Return(f, index))
    }

    pub fn gmember(g: GmemberId) -> Self {
        Self::of(LocKind::Gmember(g))
    }

    pub fn cfg_label(c: CfgId) -> Self {
        Self::of(LocKind::CfgLabel(c, 0))
    }

    /// A secondary entrance label of the same block.
    pub fn cfg_entrance(c: CfgId, entrance: u8) -> Self {
        Self::of(LocKind::CfgLabel(c, entrance))
    }

    pub fn minor_label(n: u32) -> Self {
        Self::of(LocKind::MinorLabel(n))
    }

    pub fn switch_lo_table(c: CfgId) -> Self {
        Self::of(LocKind::SwitchLoTable(c))
    }

    pub fn switch_hi_table(c: CfgId) -> Self {
        Self::of(LocKind::SwitchHiTable(c))
    }

    pub fn rom_array(id: RomArrayId, offset: u16) -> Self {
        Self {
            kind: LocKind::RomArray(id),
            offset: offset as i16,
            sel: ByteSel::Whole,
        }
    }

    pub fn const_byte(b: u8) -> Self {
        Self::of(LocKind::ConstByte(b))
    }

    pub fn ssa_var(n: u32) -> Self {
        Self::of(LocKind::Ssa(n))
    }

    pub fn phi_var(n: u32) -> Self {
        Self::of(LocKind::Phi(n))
    }

    pub fn kind(self) -> LocKind {
        self.kind
    }

    pub fn offset(self) -> i16 {
        self.offset
    }

    pub fn byte_sel(self) -> ByteSel {
        self.sel
    }

    pub fn is_none(self) -> bool {
        self.kind == LocKind::None
    }

    pub fn is_some(self) -> bool {
        !self.is_none()
    }

    /// The function a `Fn`/`Arg`/`Return` locator belongs to.
    pub fn fn_id(self) -> Option<FnId> {
        match self.kind {
            LocKind::Fn(f) | LocKind::Arg(f, _) | LocKind::Return(f, _) => Some(f),
            _ => None,
        }
    }

    pub fn gmember_id(self) -> Option<GmemberId> {
        match self.kind {
            LocKind::Gmember(g) => Some(g),
            _ => None,
        }
    }

    pub fn cfg_id(self) -> Option<CfgId> {
        match self.kind {
            LocKind::CfgLabel(c, _)
            | LocKind::SwitchLoTable(c)
            | LocKind::SwitchHiTable(c) => Some(c),
            _ => None,
        }
    }

    /// Strips the offset and byte selection, leaving the bare storage head.
    pub fn mem_head(self) -> Self {
        Self::of(self.kind)
    }

    pub fn advance_offset(&mut self, delta: i32) {
        self.offset = self.offset.wrapping_add(delta as i16);
    }

    pub fn with_advance_offset(mut self, delta: i32) -> Self {
        self.advance_offset(delta);
        self
    }

    pub fn with_byte_sel(mut self, sel: ByteSel) -> Self {
        self.sel = sel;
        self
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            LocKind::None => write!(f, "-")?,
            LocKind::Fn(id) => write!(f, "fn{}", id.index())?,
            LocKind::Arg(id, i) => write!(f, "fn{}.arg{}", id.index(), i)?,
            LocKind::Return(id, i) => write!(f, "fn{}.ret{}", id.index(), i)?,
            LocKind::Gmember(g) => write!(f, "gm{}", g.index())?,
            LocKind::CfgLabel(c, 0) => write!(f, "L{}", c.index())?,
            LocKind::CfgLabel(c, e) => write!(f, "L{}.{}", c.index(), e)?,
            LocKind::MinorLabel(n) => write!(f, "l{n}")?,
            LocKind::SwitchLoTable(c) => write!(f, "switch_lo{}", c.index())?,
            LocKind::SwitchHiTable(c) => write!(f, "switch_hi{}", c.index())?,
            LocKind::RomArray(id) => write!(f, "rom{}", id.index())?,
            LocKind::ConstByte(b) => write!(f, "#{b:#04x}")?,
            LocKind::Ssa(n) => write!(f, "s{n}")?,
            LocKind::Phi(n) => write!(f, "p{n}")?,
        }
        if self.offset != 0 {
            write!(f, "{:+}", self.offset)?;
        }
        match self.sel {
            ByteSel::Whole => Ok(()),
            ByteSel::PtrLo => write!(f, ".lo"),
            ByteSel::PtrHi => write!(f, ".hi"),
        }
    }
}
