//! Backward liveness over the assembly graph, and the passes it drives:
//! interference-graph construction for register allocation and
//! speculative-store resolution.
//!
//! Liveness recomputes from scratch on every call; the per-block bitsets
//! live on the nodes and are resized for whichever locator map is being
//! analyzed.

use bitvec::vec::BitVec;
use tracing::debug;

use crate::asm::{AsmInst, Mode, Op, ASMF_CALL, ASMF_MAYBE_STORE, REGF_M};
use crate::asm_graph::{AsmGraph, AsmId};
use crate::fns::{FnClass, FnId, Fns};
use crate::ir::{FLAG_IN_WORKLIST, FLAG_PROCESSED};
use crate::locator::{LocKind, Locator};
use crate::lvar::{LocSet, LvarsManager};
use crate::worklist::Worklist;

/// Classifies one instruction's reads and writes against the locator map.
/// `rw(index, read, write)` fires once per affected map entry.
pub(crate) fn do_inst_rw(
    fns: &Fns,
    fn_id: FnId,
    map: &LocSet,
    inst: &AsmInst,
    mut rw: impl FnMut(usize, bool, bool),
) {
    if let LocKind::Fn(call_id) = inst.arg.kind() {
        let call = fns.info(call_id);

        for (i, loc) in map.iter().enumerate() {
            // The callee's own slots: arguments are read, returns written.
            if loc.fn_id() == Some(call_id) {
                rw(
                    i,
                    matches!(loc.kind(), LocKind::Arg(..)),
                    matches!(loc.kind(), LocKind::Return(..)),
                );
            }

            if let LocKind::Gmember(g) = loc.kind() {
                match call.fclass {
                    FnClass::Mode => {
                        rw(i, call.prechecks_group(fns.gmember_group(g)), false)
                    }
                    FnClass::Fn => rw(i, call.reads_gmember(g), call.writes_gmember(g)),
                }
            }
        }
    }

    if inst.is_return() {
        for (i, loc) in map.iter().enumerate() {
            // Every return slot is read by the rts.
            if matches!(loc.kind(), LocKind::Return(..)) {
                rw(i, true, false);
            }
            // Gmembers this function writes become observable here.
            if let LocKind::Gmember(g) = loc.kind() {
                rw(i, fns.info(fn_id).writes_gmember(g), false);
            }
        }
    } else if !matches!(inst.arg.kind(), LocKind::Fn(_)) {
        let reads = inst.op.input_regs() & REGF_M != 0;
        let writes = inst.op.output_regs() & REGF_M != 0;
        let mut test_loc = |loc: Locator| {
            if let Some(i) = map.index_of(loc.mem_head()) {
                rw(i, reads, writes);
            }
        };

        test_loc(inst.arg);

        // Indirect modes also touch the pointer's high byte.
        if inst.op.mode.is_indirect() {
            debug_assert!(inst.arg.is_some());
            debug_assert!(inst.alt.is_some() && inst.alt != inst.arg);
            test_loc(inst.alt);
        }
    }
}

impl AsmGraph {
    /// Backward dataflow to a fixed point. Afterwards every block's
    /// `live_in` is `GEN | (union of successor ins) & !KILL` and
    /// `live_out` is the union of its successors' ins. Returns the bitset
    /// width (the map size).
    pub fn calc_liveness(&mut self, fns: &Fns, fn_id: FnId, map: &LocSet) -> usize {
        let n = map.len();
        let list: Vec<AsmId> = self.node_ids().to_vec();

        for &h in &list {
            let node = &mut self[h];
            node.live_in = BitVec::repeat(false, n);
            node.live_out = BitVec::repeat(false, n);
            node.flags &= !(FLAG_IN_WORKLIST | FLAG_PROCESSED);
        }

        // Seed each block's `in` with GEN (read before written) and park
        // the complement of KILL in `out` while the fixed point runs.
        for &h in &list {
            let mut gen = BitVec::repeat(false, n);
            let mut not_kill = BitVec::repeat(true, n);
            for idx in 0..self[h].code().len() {
                let inst = self[h].code()[idx];
                do_inst_rw(fns, fn_id, map, &inst, |i, read, write| {
                    // Order matters: the read check precedes the write.
                    if read && not_kill[i] {
                        gen.set(i, true);
                    }
                    if write {
                        not_kill.set(i, false);
                    }
                });
            }
            self[h].live_in = gen;
            self[h].live_out = not_kill;
        }

        // Arguments are read before any code in the entry block runs.
        let root = *self
            .label_map
            .get(&self.entry_label())
            .expect("entry block missing");
        for (i, loc) in map.iter().enumerate() {
            if matches!(loc.kind(), LocKind::Arg(..)) {
                self[root].live_in.set(i, true);
            }
        }

        let mut worklist: Worklist<AsmId> = Worklist::new();
        for &h in &list {
            if self[h].outputs().is_empty() {
                worklist.push(self, h);
            }
        }

        loop {
            while let Some(h) = worklist.pop(self) {
                // Live-out is the union of the successors' live-in sets;
                // from it, the new live-in.
                let mut temp = BitVec::repeat(false, n);
                for k in 0..self[h].outputs().len() {
                    let succ = self[h].outputs()[k].node.expect("resolved edge");
                    temp |= self[succ].live_in.as_bitslice();
                }
                temp &= self[h].live_out.as_bitslice(); // live_out holds !KILL
                temp |= self[h].live_in.as_bitslice();

                if self[h].flags & FLAG_PROCESSED == 0 || temp != self[h].live_in {
                    self[h].flags |= FLAG_PROCESSED;
                    for k in 0..self[h].inputs().len() {
                        let input = self[h].inputs()[k];
                        worklist.push(self, input);
                    }
                }

                self[h].live_in = temp;
            }

            // Blocks unreachable backwards from any exit (infinite loops)
            // still need processing.
            for &h in &list {
                if self[h].flags & FLAG_PROCESSED == 0 {
                    worklist.push(self, h);
                }
            }
            if worklist.is_empty() {
                break;
            }
        }

        // Now give `out` its real meaning.
        for &h in &list {
            self[h].flags &= !(FLAG_IN_WORKLIST | FLAG_PROCESSED);
            let mut out = BitVec::repeat(false, n);
            for k in 0..self[h].outputs().len() {
                let succ = self[h].outputs()[k].node.expect("resolved edge");
                out |= self[succ].live_in.as_bitslice();
            }
            self[h].live_out = out;
        }

        n
    }

    /// Builds the interference graph driving local-variable allocation:
    /// a reverse walk per block keeps a running live set, adding all-pairs
    /// interference after every instruction and call interference at each
    /// call site.
    pub fn build_lvars(&mut self, fns: &Fns, fn_id: FnId) -> LvarsManager {
        let mut lvars = LvarsManager::new(fn_id, self);
        let map = lvars.map().clone();
        let n = self.calc_liveness(fns, fn_id, &map);

        let list: Vec<AsmId> = self.node_ids().to_vec();
        let mut live = BitVec::repeat(false, n);

        for &h in &list {
            // Walking backwards, so start from the block's out state.
            live.clone_from(&self[h].live_out);
            lvars.add_lvar_interferences(&live);

            for idx in (0..self[h].code().len()).rev() {
                let inst = self[h].code()[idx];

                if inst.op.flags() & ASMF_CALL != 0 {
                    if let LocKind::Fn(callee) = inst.arg.kind() {
                        // Every lvar live across the call interferes with
                        // whatever the callee clobbers.
                        for i in live.iter_ones() {
                            lvars.add_fn_interference(i, callee);
                        }
                    }
                }

                do_inst_rw(fns, fn_id, &map, &inst, |i, read, write| {
                    if read {
                        live.set(i, true);
                    } else if write {
                        // Only reached when `read` is false.
                        live.set(i, false);
                    }
                });

                lvars.add_lvar_interferences(&live);
            }
        }

        // All referenced parameters are live together at entry.
        live.fill(false);
        for &loc in &fns.info(fn_id).referenced_params {
            if let Some(i) = lvars.index_of(loc.mem_head()) {
                live.set(i, true);
            }
        }
        lvars.add_lvar_interferences(&live);

        lvars
    }

    /// Resolves speculative stores: promoted to their absolute form when
    /// the stored slot is live, rewritten to `Pruned` otherwise.
    pub fn remove_maybes(&mut self, fns: &Fns, fn_id: FnId) {
        let mut map = LocSet::new();
        self.for_each_inst(|inst| {
            if inst.op.flags() & ASMF_MAYBE_STORE == 0 {
                return;
            }
            if inst.arg.is_some() {
                map.insert(inst.arg.mem_head());
            }
            if inst.alt.is_some() {
                map.insert(inst.alt.mem_head());
            }
        });

        let n = self.calc_liveness(fns, fn_id, &map);

        let list: Vec<AsmId> = self.node_ids().to_vec();
        let mut live = BitVec::repeat(false, n);

        for &h in &list {
            live.clone_from(&self[h].live_out);

            for idx in (0..self[h].code().len()).rev() {
                if self[h].code()[idx].op.flags() & ASMF_MAYBE_STORE != 0 {
                    let inst = self[h].code()[idx];
                    let i = map
                        .index_of(inst.arg.mem_head())
                        .expect("speculative store to untracked slot");
                    debug_assert!(inst.op.output_regs() & REGF_M != 0);

                    if live[i] {
                        let promoted = match inst.op.change_addr_mode(Mode::Absolute) {
                            Some(op) => op,
                            None => match inst.op {
                                Op::MAYBE_STORE_C => Op::STORE_C_ABSOLUTE,
                                Op::MAYBE_STORE_Z => Op::STORE_Z_ABSOLUTE,
                                _ => unreachable!("speculative store with no absolute form"),
                            },
                        };
                        self[h].code[idx].op = promoted;
                    } else {
                        debug!(slot = %inst.arg, "pruned speculative store");
                        let inst = &mut self[h].code[idx];
                        inst.op = Op::ASM_PRUNED;
                        inst.arg = Locator::NONE;
                        inst.alt = Locator::NONE;
                    }
                }

                // Classify the (possibly rewritten) instruction.
                let inst = self[h].code()[idx];
                do_inst_rw(fns, fn_id, &map, &inst, |i, read, write| {
                    if read {
                        live.set(i, true);
                    } else if write {
                        live.set(i, false);
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::Mn;
    use crate::asm_graph::SwitchTables;
    use crate::fns::FnInfo;
    use crate::ir::Id;

    fn entry() -> Locator {
        Locator::cfg_label(Id::new(0))
    }

    fn lda(loc: Locator) -> AsmInst {
        AsmInst::with_arg(Op::new(Mn::Lda, Mode::Absolute), loc)
    }

    fn sta(loc: Locator) -> AsmInst {
        AsmInst::with_arg(Op::new(Mn::Sta, Mode::Absolute), loc)
    }

    fn sta_maybe(loc: Locator) -> AsmInst {
        AsmInst::with_arg(Op::new(Mn::Sta, Mode::Maybe), loc)
    }

    fn ora(loc: Locator) -> AsmInst {
        AsmInst::with_arg(Op::new(Mn::Ora, Mode::Absolute), loc)
    }

    fn rts() -> AsmInst {
        AsmInst::of(Op::RTS_IMPLIED)
    }

    // No optimize() here: these tests pin down analysis results, and the
    // peephole would rewrite some of the probed sequences.
    fn build(stream: &[AsmInst]) -> AsmGraph {
        let mut graph = AsmGraph::new(entry());
        graph.append_code(stream, &SwitchTables::default());
        graph.finish_appending().unwrap();
        graph
    }

    fn one_fn() -> (Fns, FnId) {
        let mut fns = Fns::new();
        let f = fns.add_fn(FnInfo::new(FnClass::Fn));
        (fns, f)
    }

    #[test]
    fn diamond_liveness_fixed_point() {
        let (fns, f) = one_fn();
        let v0 = Locator::ssa_var(0);
        let v1 = Locator::ssa_var(1);
        let a = Locator::cfg_label(Id::new(1));
        let x = Locator::cfg_label(Id::new(2));

        // entry reads v0 and branches; both arms write v1; the join
        // reads v1 and returns.
        let mut graph = build(&[
            AsmInst::with_arg(Op::ASM_LABEL, entry()),
            lda(v0),
            AsmInst::with_arg(Op::new(Mn::Beq, Mode::Relative), a),
            sta(v1),
            AsmInst::with_arg(Op::JMP_ABSOLUTE, x),
            AsmInst::with_arg(Op::ASM_LABEL, a),
            sta(v1),
            AsmInst::with_arg(Op::JMP_ABSOLUTE, x),
            AsmInst::with_arg(Op::ASM_LABEL, x),
            lda(v1),
            rts(),
        ]);

        let mut map = LocSet::new();
        let i0 = map.insert(v0);
        let i1 = map.insert(v1);
        graph.calc_liveness(&fns, f, &map);

        let entry_node = graph.label_map[&entry()];
        let join = graph.label_map[&x];

        // The join needs v1; nothing is live after it.
        assert!(graph[join].live_in[i1]);
        assert!(!graph[join].live_in[i0]);
        assert!(graph[join].live_out.not_any());

        // v0 is consumed in the entry block; v1 is born in the arms.
        assert!(graph[entry_node].live_in[i0]);
        assert!(!graph[entry_node].live_in[i1]);
        assert!(!graph[entry_node].live_out[i1]);

        // Fixed-point equations hold everywhere.
        for &h in graph.node_ids() {
            let mut union: BitVec = BitVec::repeat(false, map.len());
            for edge in graph[h].outputs() {
                union |= graph[edge.node.unwrap()].live_in.as_bitslice();
            }
            assert_eq!(graph[h].live_out, union);
        }
    }

    #[test]
    fn infinite_loop_still_converges() {
        let (fns, f) = one_fn();
        let v0 = Locator::ssa_var(0);

        let mut graph = AsmGraph::new(entry());
        graph.append_code(
            &[
                AsmInst::with_arg(Op::ASM_LABEL, entry()),
                lda(v0),
                AsmInst::with_arg(Op::JMP_ABSOLUTE, entry()),
            ],
            &SwitchTables::default(),
        );
        graph.finish_appending().unwrap();

        let mut map = LocSet::new();
        let i0 = map.insert(v0);
        graph.calc_liveness(&fns, f, &map);

        let root = graph.label_map[&entry()];
        assert!(graph[root].live_in[i0]);
        assert!(graph[root].live_out[i0]);
    }

    #[test]
    fn simultaneously_live_lvars_interfere() {
        let (fns, f) = one_fn();
        let v0 = Locator::ssa_var(0);
        let v1 = Locator::ssa_var(1);

        let mut graph = build(&[
            AsmInst::with_arg(Op::ASM_LABEL, entry()),
            sta(v0),
            sta(v1),
            lda(v0),
            ora(v1),
            rts(),
        ]);

        let lvars = graph.build_lvars(&fns, f);
        let i0 = lvars.index_of(v0).unwrap();
        let i1 = lvars.index_of(v1).unwrap();
        assert!(lvars.interferes(i0, i1));
        assert!(lvars.interferes(i1, i0));
    }

    #[test]
    fn disjoint_lifetimes_do_not_interfere() {
        let (fns, f) = one_fn();
        let v0 = Locator::ssa_var(0);
        let v1 = Locator::ssa_var(1);

        // v0 dies before v1 is born.
        let mut graph = build(&[
            AsmInst::with_arg(Op::ASM_LABEL, entry()),
            sta(v0),
            lda(v0),
            sta(v1),
            lda(v1),
            rts(),
        ]);

        let lvars = graph.build_lvars(&fns, f);
        let i0 = lvars.index_of(v0).unwrap();
        let i1 = lvars.index_of(v1).unwrap();
        assert!(!lvars.interferes(i0, i1));
    }

    #[test]
    fn lvar_live_across_call_interferes_with_callee() {
        let mut fns = Fns::new();
        let this = fns.add_fn(FnInfo::new(FnClass::Fn));
        let callee = fns.add_fn(FnInfo::new(FnClass::Fn));
        let v0 = Locator::ssa_var(0);

        let mut graph = build(&[
            AsmInst::with_arg(Op::ASM_LABEL, entry()),
            sta(v0),
            AsmInst::with_arg(Op::JSR_ABSOLUTE, Locator::fn_entry(callee)),
            lda(v0),
            rts(),
        ]);

        let lvars = graph.build_lvars(&fns, this);
        let i0 = lvars.index_of(v0).unwrap();
        assert!(lvars.fn_interferes(i0, callee));
        assert!(!lvars.fn_interferes(i0, this));
    }

    #[test]
    fn maybe_stores_promote_or_prune() {
        let (fns, f) = one_fn();
        let g0 = Locator::gmember(Id::new(0));
        let g1 = Locator::gmember(Id::new(1));

        let mut graph = AsmGraph::new(entry());
        graph.append_code(
            &[
                AsmInst::with_arg(Op::ASM_LABEL, entry()),
                sta_maybe(g0),
                sta_maybe(g1),
                lda(g0),
                rts(),
            ],
            &SwitchTables::default(),
        );
        graph.finish_appending().unwrap();

        graph.remove_maybes(&fns, f);

        let root = graph.label_map[&entry()];
        let code = graph[root].code();
        // g0 is read below its store: promoted. g1 never is: pruned.
        assert_eq!(code[0].op, Op::new(Mn::Sta, Mode::Absolute));
        assert_eq!(code[0].arg, g0);
        assert_eq!(code[1].op, Op::ASM_PRUNED);
        assert!(code[1].arg.is_none());
        // No speculative stores survive resolution.
        graph.for_each_inst(|inst| {
            assert!(inst.op.flags() & ASMF_MAYBE_STORE == 0);
        });
    }

    #[test]
    fn flag_store_promotion_uses_expanded_form() {
        let (fns, f) = one_fn();
        let g0 = Locator::gmember(Id::new(0));

        let mut graph = AsmGraph::new(entry());
        graph.append_code(
            &[
                AsmInst::with_arg(Op::ASM_LABEL, entry()),
                AsmInst::with_arg(Op::MAYBE_STORE_C, g0),
                lda(g0),
                rts(),
            ],
            &SwitchTables::default(),
        );
        graph.finish_appending().unwrap();

        graph.remove_maybes(&fns, f);

        let root = graph.label_map[&entry()];
        assert_eq!(graph[root].code()[0].op, Op::STORE_C_ABSOLUTE);
    }

    #[test]
    fn callee_summaries_decide_gmember_stores() {
        use bitvec::bitvec;
        use bitvec::order::Lsb0;

        let mut fns = Fns::new();
        let group = fns.add_group();
        let g0 = fns.add_gmember(group);
        let g1 = fns.add_gmember(group);
        let this = fns.add_fn(FnInfo::new(FnClass::Fn));

        // The callee reads g0 but not g1.
        let mut callee_info = FnInfo::new(FnClass::Fn);
        callee_info.ir_reads = bitvec![usize, Lsb0; 1, 0];
        let callee = fns.add_fn(callee_info);

        let mut graph = AsmGraph::new(entry());
        graph.append_code(
            &[
                AsmInst::with_arg(Op::ASM_LABEL, entry()),
                sta_maybe(Locator::gmember(g0)),
                sta_maybe(Locator::gmember(g1)),
                AsmInst::with_arg(Op::JSR_ABSOLUTE, Locator::fn_entry(callee)),
                rts(),
            ],
            &SwitchTables::default(),
        );
        graph.finish_appending().unwrap();

        graph.remove_maybes(&fns, this);

        let root = graph.label_map[&entry()];
        let code = graph[root].code();
        assert_eq!(code[0].op, Op::new(Mn::Sta, Mode::Absolute));
        assert_eq!(code[1].op, Op::ASM_PRUNED);
    }

    #[test]
    fn mode_calls_read_prechecked_groups() {
        use bitvec::bitvec;
        use bitvec::order::Lsb0;

        let mut fns = Fns::new();
        let checked = fns.add_group();
        let unchecked = fns.add_group();
        let g0 = fns.add_gmember(checked);
        let g1 = fns.add_gmember(unchecked);
        let this = fns.add_fn(FnInfo::new(FnClass::Fn));

        let mut mode_info = FnInfo::new(FnClass::Mode);
        mode_info.precheck_group_vars = bitvec![usize, Lsb0; 1, 0];
        let mode = fns.add_fn(mode_info);

        let mut graph = AsmGraph::new(entry());
        graph.append_code(
            &[
                AsmInst::with_arg(Op::ASM_LABEL, entry()),
                sta_maybe(Locator::gmember(g0)),
                sta_maybe(Locator::gmember(g1)),
                AsmInst::with_arg(Op::JSR_ABSOLUTE, Locator::fn_entry(mode)),
                rts(),
            ],
            &SwitchTables::default(),
        );
        graph.finish_appending().unwrap();

        graph.remove_maybes(&fns, this);

        let root = graph.label_map[&entry()];
        let code = graph[root].code();
        // g0's group survives the mode precheck; g1's does not.
        assert_eq!(code[0].op, Op::new(Mn::Sta, Mode::Absolute));
        assert_eq!(code[1].op, Op::ASM_PRUNED);
    }

    #[test]
    fn callee_args_are_read_at_calls() {
        let mut fns = Fns::new();
        let this = fns.add_fn(FnInfo::new(FnClass::Fn));
        let callee = fns.add_fn(FnInfo::new(FnClass::Fn));
        let arg0 = Locator::arg(callee, 0);

        // A speculative store into the callee's argument slot is kept
        // alive by the call itself.
        let mut graph = AsmGraph::new(entry());
        graph.append_code(
            &[
                AsmInst::with_arg(Op::ASM_LABEL, entry()),
                sta_maybe(arg0),
                AsmInst::with_arg(Op::JSR_ABSOLUTE, Locator::fn_entry(callee)),
                rts(),
            ],
            &SwitchTables::default(),
        );
        graph.finish_appending().unwrap();

        graph.remove_maybes(&fns, this);

        let root = graph.label_map[&entry()];
        assert_eq!(graph[root].code()[0].op, Op::new(Mn::Sta, Mode::Absolute));
    }
}
