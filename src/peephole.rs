//! Block-local peephole rewrites.
//!
//! Operates on one block's code vector at a time; anything that needs
//! cross-block knowledge belongs to the graph passes instead. Rewrites
//! mark instructions `Pruned` during the scan and compact the vector once
//! at the end.

use crate::asm::{AsmInst, Mn, Mode, Op};

fn same_mem_operand(a: &AsmInst, b: &AsmInst) -> bool {
    a.op.mode.accesses_mem()
        && b.op.mode.accesses_mem()
        && a.op.mode != Mode::Maybe
        && b.op.mode != Mode::Maybe
        && a.arg == b.arg
        && a.alt == b.alt
}

fn store_of(mn: Mn) -> Option<Mn> {
    match mn {
        Mn::Sta => Some(Mn::Lda),
        Mn::Stx => Some(Mn::Ldx),
        Mn::Sty => Some(Mn::Ldy),
        _ => None,
    }
}

fn is_plain_load(mn: Mn) -> bool {
    matches!(mn, Mn::Lda | Mn::Ldx | Mn::Ldy)
}

/// One local pass over `code`. Returns whether anything changed.
pub fn run(code: &mut Vec<AsmInst>) -> bool {
    let mut changed = false;

    loop {
        let mut pass_changed = false;

        for i in 0..code.len().saturating_sub(1) {
            let a = code[i];
            let b = code[i + 1];
            if a.op == Op::ASM_PRUNED || b.op == Op::ASM_PRUNED {
                continue;
            }

            // Store then reload of the same slot: the register already
            // holds the value.
            if let Some(load) = store_of(a.op.mn) {
                if b.op.mn == load && same_mem_operand(&a, &b) {
                    code[i + 1] = AsmInst::of(Op::ASM_PRUNED);
                    pass_changed = true;
                    continue;
                }
            }

            // Load then store back to the same slot: the store writes what
            // was just read.
            if is_plain_load(a.op.mn) {
                if store_of(b.op.mn) == Some(a.op.mn) && same_mem_operand(&a, &b) {
                    code[i + 1] = AsmInst::of(Op::ASM_PRUNED);
                    pass_changed = true;
                    continue;
                }
            }

            // Back-to-back loads of the same register: the first is dead.
            if is_plain_load(a.op.mn) && a.op.mn == b.op.mn {
                code[i] = AsmInst::of(Op::ASM_PRUNED);
                pass_changed = true;
                continue;
            }

            // Redundant flag ops.
            if matches!(a.op.mn, Mn::Clc | Mn::Sec) && matches!(b.op.mn, Mn::Clc | Mn::Sec) {
                let dead = if a.op.mn == b.op.mn { i + 1 } else { i };
                code[dead] = AsmInst::of(Op::ASM_PRUNED);
                pass_changed = true;
                continue;
            }

            // Transfer round-trips leave the register file unchanged.
            let round_trip = matches!(
                (a.op.mn, b.op.mn),
                (Mn::Tax, Mn::Txa) | (Mn::Txa, Mn::Tax) | (Mn::Tay, Mn::Tya) | (Mn::Tya, Mn::Tay)
            );
            if round_trip {
                code[i + 1] = AsmInst::of(Op::ASM_PRUNED);
                pass_changed = true;
            }
        }

        if !pass_changed {
            break;
        }
        changed = true;
        code.retain(|inst| inst.op != Op::ASM_PRUNED);
    }

    changed
}
