//! The 6502 pseudo-instruction vocabulary the assembly graph operates on.
//!
//! An [`Op`] pairs a mnemonic with an addressing mode. Besides the real CPU
//! instructions there are pseudo mnemonics: `Label` and `Data` structure the
//! linear stream, `Pruned` marks instructions removed in place, `Switch` is
//! the table-dispatch terminator, and `StoreC`/`StoreZ` store processor
//! flags through a small expansion sequence. The `Maybe` addressing mode
//! marks speculative stores that liveness later promotes or prunes.

use std::fmt;

use crate::locator::Locator;

// ─── Op flag bits ───────────────────────────────────────────────────────────

/// Unconditional control transfer to the argument label.
pub const ASMF_JUMP: u32 = 1 << 0;
/// Conditional short branch.
pub const ASMF_BRANCH: u32 = 1 << 1;
/// Table dispatch; outputs carry case values.
pub const ASMF_SWITCH: u32 = 1 << 2;
/// Transfers to a function and comes back.
pub const ASMF_CALL: u32 = 1 << 3;
/// Ends the function.
pub const ASMF_RETURN: u32 = 1 << 4;
/// Speculative store, resolved by liveness.
pub const ASMF_MAYBE_STORE: u32 = 1 << 5;

// ─── Register bits ──────────────────────────────────────────────────────────

pub const REGF_A: u8 = 1 << 0;
pub const REGF_X: u8 = 1 << 1;
pub const REGF_Y: u8 = 1 << 2;
pub const REGF_C: u8 = 1 << 3;
pub const REGF_Z: u8 = 1 << 4;
pub const REGF_N: u8 = 1 << 5;
/// The memory operand named by the instruction's locator.
pub const REGF_M: u8 = 1 << 6;

// ─── Mnemonics and addressing modes ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mn {
    // Loads / stores.
    Lda,
    Ldx,
    Ldy,
    Sta,
    Stx,
    Sty,
    // ALU.
    Adc,
    Sbc,
    And,
    Ora,
    Eor,
    Cmp,
    Cpx,
    Cpy,
    // Read-modify-write.
    Inc,
    Dec,
    Asl,
    Lsr,
    Rol,
    Ror,
    // Register moves / stack.
    Tax,
    Tay,
    Txa,
    Tya,
    Pha,
    Pla,
    // Flags.
    Clc,
    Sec,
    Nop,
    // Increments.
    Inx,
    Dex,
    Iny,
    Dey,
    // Control flow.
    Beq,
    Bne,
    Bcc,
    Bcs,
    Bmi,
    Bpl,
    Jmp,
    Jsr,
    Rts,
    Rti,
    /// Table dispatch through the lo/hi tables named by `arg`/`alt`.
    Switch,
    /// Store the carry flag to memory.
    StoreC,
    /// Store the zero flag to memory.
    StoreZ,
    // Stream pseudo ops.
    Label,
    Data,
    Pruned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Implied,
    Immediate,
    ZeroPage,
    Absolute,
    AbsoluteX,
    AbsoluteY,
    IndirectY,
    Relative,
    /// Speculative store slot; resolved to `Absolute` or `Pruned`.
    Maybe,
}

impl Mode {
    /// Whether this mode dereferences the instruction's memory operand.
    pub fn accesses_mem(self) -> bool {
        matches!(
            self,
            Mode::ZeroPage
                | Mode::Absolute
                | Mode::AbsoluteX
                | Mode::AbsoluteY
                | Mode::IndirectY
                | Mode::Maybe
        )
    }

    /// Indirect modes carry the pointer's high byte in `alt`.
    pub fn is_indirect(self) -> bool {
        matches!(self, Mode::IndirectY)
    }

    fn size(self) -> u32 {
        match self {
            Mode::Implied => 1,
            Mode::Immediate | Mode::ZeroPage | Mode::IndirectY | Mode::Relative => 2,
            Mode::Absolute | Mode::AbsoluteX | Mode::AbsoluteY | Mode::Maybe => 3,
        }
    }
}

/// One opcode: a mnemonic in a specific addressing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Op {
    pub mn: Mn,
    pub mode: Mode,
}

impl Op {
    pub const fn new(mn: Mn, mode: Mode) -> Self {
        Self { mn, mode }
    }

    pub const JMP_ABSOLUTE: Op = Op::new(Mn::Jmp, Mode::Absolute);
    pub const JSR_ABSOLUTE: Op = Op::new(Mn::Jsr, Mode::Absolute);
    pub const RTS_IMPLIED: Op = Op::new(Mn::Rts, Mode::Implied);
    pub const RTI_IMPLIED: Op = Op::new(Mn::Rti, Mode::Implied);
    pub const SWITCH_IMPLIED: Op = Op::new(Mn::Switch, Mode::Implied);
    pub const MAYBE_STORE_C: Op = Op::new(Mn::StoreC, Mode::Maybe);
    pub const MAYBE_STORE_Z: Op = Op::new(Mn::StoreZ, Mode::Maybe);
    pub const STORE_C_ABSOLUTE: Op = Op::new(Mn::StoreC, Mode::Absolute);
    pub const STORE_Z_ABSOLUTE: Op = Op::new(Mn::StoreZ, Mode::Absolute);
    pub const ASM_LABEL: Op = Op::new(Mn::Label, Mode::Implied);
    pub const ASM_DATA: Op = Op::new(Mn::Data, Mode::Implied);
    pub const ASM_PRUNED: Op = Op::new(Mn::Pruned, Mode::Implied);

    /// Static attribute bits.
    pub fn flags(self) -> u32 {
        let mut flags = match self.mn {
            Mn::Jmp => ASMF_JUMP,
            Mn::Beq | Mn::Bne | Mn::Bcc | Mn::Bcs | Mn::Bmi | Mn::Bpl => ASMF_BRANCH,
            Mn::Switch => ASMF_SWITCH,
            Mn::Jsr => ASMF_CALL,
            Mn::Rts | Mn::Rti => ASMF_RETURN,
            _ => 0,
        };
        if self.mode == Mode::Maybe {
            flags |= ASMF_MAYBE_STORE;
        }
        flags
    }

    /// Estimated encoded size in bytes.
    pub fn size(self) -> u32 {
        match self.mn {
            Mn::Label | Mn::Pruned => 0,
            Mn::Data => 1,
            // lda hi,x / pha / lda lo,x / pha / rts
            Mn::Switch => 9,
            // Flag stores expand to a short load/store sequence.
            Mn::StoreC | Mn::StoreZ => 5,
            _ => self.mode.size(),
        }
    }

    /// Registers the instruction reads. `REGF_M` covers the memory operand.
    pub fn input_regs(self) -> u8 {
        let mem_read = |base: u8| {
            if self.mode.accesses_mem() {
                base | REGF_M
            } else {
                base
            }
        };
        match self.mn {
            Mn::Lda | Mn::Ldx | Mn::Ldy => mem_read(0),
            Mn::Sta => REGF_A,
            Mn::Stx => REGF_X,
            Mn::Sty => REGF_Y,
            Mn::Adc | Mn::Sbc => mem_read(REGF_A | REGF_C),
            Mn::And | Mn::Ora | Mn::Eor | Mn::Cmp => mem_read(REGF_A),
            Mn::Cpx => mem_read(REGF_X),
            Mn::Cpy => mem_read(REGF_Y),
            Mn::Inc | Mn::Dec => REGF_M,
            Mn::Asl | Mn::Lsr => mem_read(0) | implied_acc(self.mode),
            Mn::Rol | Mn::Ror => mem_read(REGF_C) | implied_acc(self.mode),
            Mn::Tax | Mn::Tay | Mn::Pha => REGF_A,
            Mn::Txa => REGF_X,
            Mn::Tya => REGF_Y,
            Mn::Inx | Mn::Dex => REGF_X,
            Mn::Iny | Mn::Dey => REGF_Y,
            Mn::Beq | Mn::Bne => REGF_Z,
            Mn::Bcc | Mn::Bcs => REGF_C,
            Mn::Bmi | Mn::Bpl => REGF_N,
            Mn::Switch => REGF_X,
            Mn::StoreC => REGF_C,
            Mn::StoreZ => REGF_Z,
            _ => 0,
        }
    }

    /// Registers the instruction writes. `REGF_M` covers the memory operand.
    pub fn output_regs(self) -> u8 {
        let flags_nz = REGF_Z | REGF_N;
        match self.mn {
            Mn::Lda => REGF_A | flags_nz,
            Mn::Ldx => REGF_X | flags_nz,
            Mn::Ldy => REGF_Y | flags_nz,
            Mn::Sta | Mn::Stx | Mn::Sty => REGF_M,
            Mn::Adc | Mn::Sbc => REGF_A | REGF_C | flags_nz,
            Mn::And | Mn::Ora | Mn::Eor => REGF_A | flags_nz,
            Mn::Cmp | Mn::Cpx | Mn::Cpy => REGF_C | flags_nz,
            Mn::Inc | Mn::Dec => REGF_M | flags_nz,
            Mn::Asl | Mn::Lsr | Mn::Rol | Mn::Ror => {
                let target = if self.mode == Mode::Implied {
                    REGF_A
                } else {
                    REGF_M
                };
                target | REGF_C | flags_nz
            }
            Mn::Tax => REGF_X | flags_nz,
            Mn::Tay => REGF_Y | flags_nz,
            Mn::Txa | Mn::Pla => REGF_A | flags_nz,
            Mn::Tya => REGF_A | flags_nz,
            Mn::Clc | Mn::Sec => REGF_C,
            Mn::Inx | Mn::Dex => REGF_X | flags_nz,
            Mn::Iny | Mn::Dey => REGF_Y | flags_nz,
            Mn::StoreC | Mn::StoreZ => REGF_M,
            _ => 0,
        }
    }

    /// The opposite branch condition, for fall-through inversion.
    pub fn invert_branch(self) -> Option<Op> {
        let mn = match self.mn {
            Mn::Beq => Mn::Bne,
            Mn::Bne => Mn::Beq,
            Mn::Bcc => Mn::Bcs,
            Mn::Bcs => Mn::Bcc,
            Mn::Bmi => Mn::Bpl,
            Mn::Bpl => Mn::Bmi,
            _ => return None,
        };
        Some(Op::new(mn, self.mode))
    }

    /// The jump form replacing a call followed by a return.
    pub fn tail_call_op(self) -> Option<Op> {
        match self {
            Op::JSR_ABSOLUTE => Some(Op::JMP_ABSOLUTE),
            _ => None,
        }
    }

    /// Re-addresses the op, or `None` when the mnemonic has no plain
    /// encoding in `mode` (flag stores expand instead of re-addressing).
    pub fn change_addr_mode(self, mode: Mode) -> Option<Op> {
        let ok = match self.mn {
            Mn::Lda | Mn::Adc | Mn::Sbc | Mn::And | Mn::Ora | Mn::Eor | Mn::Cmp => matches!(
                mode,
                Mode::Immediate
                    | Mode::ZeroPage
                    | Mode::Absolute
                    | Mode::AbsoluteX
                    | Mode::AbsoluteY
                    | Mode::IndirectY
            ),
            Mn::Ldx | Mn::Ldy | Mn::Cpx | Mn::Cpy => {
                matches!(mode, Mode::Immediate | Mode::ZeroPage | Mode::Absolute)
            }
            Mn::Sta => matches!(
                mode,
                Mode::ZeroPage
                    | Mode::Absolute
                    | Mode::AbsoluteX
                    | Mode::AbsoluteY
                    | Mode::IndirectY
                    | Mode::Maybe
            ),
            Mn::Stx | Mn::Sty => {
                matches!(mode, Mode::ZeroPage | Mode::Absolute | Mode::Maybe)
            }
            Mn::Inc | Mn::Dec | Mn::Asl | Mn::Lsr | Mn::Rol | Mn::Ror => matches!(
                mode,
                Mode::ZeroPage | Mode::Absolute | Mode::AbsoluteX
            ),
            _ => false,
        };
        ok.then(|| Op::new(self.mn, mode))
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = format!("{:?}", self.mn).to_ascii_lowercase();
        match self.mode {
            Mode::Implied => write!(f, "{name}"),
            mode => write!(f, "{name}.{mode:?}"),
        }
    }
}

// ─── Instructions ───────────────────────────────────────────────────────────

/// One pseudo-instruction: an opcode plus up to two locator operands.
/// `alt` carries the pointer high byte for indirect modes and the hi-table
/// label for switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsmInst {
    pub op: Op,
    pub arg: Locator,
    pub alt: Locator,
}

impl AsmInst {
    pub fn of(op: Op) -> Self {
        Self {
            op,
            arg: Locator::NONE,
            alt: Locator::NONE,
        }
    }

    pub fn with_arg(op: Op, arg: Locator) -> Self {
        Self {
            op,
            arg,
            alt: Locator::NONE,
        }
    }

    pub fn is_return(&self) -> bool {
        self.op.flags() & ASMF_RETURN != 0
    }
}

impl fmt::Display for AsmInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op)?;
        if self.arg.is_some() {
            write!(f, " {}", self.arg)?;
        }
        if self.alt.is_some() {
            write!(f, " {}", self.alt)?;
        }
        Ok(())
    }
}

fn implied_acc(mode: Mode) -> u8 {
    if mode == Mode::Implied {
        REGF_A
    } else {
        0
    }
}

/// Total encoded size of an instruction run.
pub fn size_in_bytes<'a>(insts: impl IntoIterator<Item = &'a AsmInst>) -> u32 {
    insts.into_iter().map(|inst| inst.op.size()).sum()
}
