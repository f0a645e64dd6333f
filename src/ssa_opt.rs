//! SSA dead-code elimination.
//!
//! Two passes share the work. The linked prune removes whole fused
//! clusters whose outputs never leave the cluster, including pure calls
//! whose results go nowhere. The no-effect prune is a classic
//! mark-live-from-sinks sweep over everything else. Callers typically run
//! [`o_remove_unused_ssa`] until it reports no change.

use smallvec::SmallVec;

use crate::fns::Fns;
use crate::ir::{
    CfgId, InputClass, Ir, SsaId, SsaOp, FLAG_IN_WORKLIST, FLAG_PRUNED, SSAF_IMPURE,
    SSAF_WRITE_GLOBALS,
};
use crate::worklist::Worklist;

/// Whether `h` may seed a prune attempt.
fn can_prune(ir: &Ir, fns: &Fns, h: SsaId) -> bool {
    let node = ir.ssa_node(h);

    // Linked clusters prune all at once, driven from the root; skip the
    // non-root members here.
    if node.op().input0_class() == InputClass::Link {
        return false;
    }

    match node.op() {
        SsaOp::If | SsaOp::Return => false,
        SsaOp::FnCall => callee_of(ir, h)
            .map(|f| fns.info(f).ir_io_pure())
            .unwrap_or(false),
        op => op.flags() & SSAF_IMPURE == 0,
    }
}

fn callee_of(ir: &Ir, h: SsaId) -> Option<crate::fns::FnId> {
    let node = ir.ssa_node(h);
    (node.input_size() > 1).then(|| node.input(1).fn_id()).flatten()
}

/// Collects `h`'s transitive link closure in post-order, `h` last.
/// Fails (leaving `vec` meaningless) if any output leaves the cluster
/// through a non-link edge.
fn build_linked(ir: &Ir, h: SsaId, vec: &mut SmallVec<[SsaId; 16]>) -> bool {
    let node = ir.ssa_node(h);
    for i in 0..node.output_size() {
        let oe = node.output_edge(i);
        let class = ir.ssa_node(oe.user).op().input_class(oe.slot as usize);
        if class != InputClass::Link || !build_linked(ir, oe.user, vec) {
            return false;
        }
    }
    vec.push(h);
    true
}

/// Walks link edges up to the cluster root.
fn get_link_head(ir: &Ir, mut h: SsaId) -> SsaId {
    while ir.ssa_node(h).op().input0_class() == InputClass::Link {
        match ir.ssa_node(h).input(0).handle() {
            Some(root) => h = root,
            None => break,
        }
    }
    h
}

fn all_nodes(ir: &Ir) -> Vec<SsaId> {
    let mut out = Vec::new();
    for cfg in ir.cfg_ids() {
        out.extend_from_slice(ir.cfg_node(cfg).ssa_nodes());
    }
    out
}

/// Removes linked clusters (and plain pure nodes) whose entire output tree
/// stays inside the cluster.
pub fn o_remove_unused_linked(ir: &mut Ir, fns: &Fns) -> bool {
    let mut changed = false;
    let mut worklist: Worklist<SsaId> = Worklist::new();

    for h in all_nodes(ir) {
        debug_assert!(!ir.ssa_node(h).test_flags(FLAG_IN_WORKLIST));
        if can_prune(ir, fns, h) {
            worklist.push(ir, h);
        }
    }

    let mut linked: SmallVec<[SsaId; 16]> = SmallVec::new();

    while let Some(root) = worklist.pop(ir) {
        debug_assert!(can_prune(ir, fns, root));

        linked.clear();
        if !build_linked(ir, root, &mut linked) {
            continue;
        }
        debug_assert!(!linked.is_empty());

        for idx in 0..linked.len() {
            let h = linked[idx];

            // Whatever fed the cluster may become dead next; re-seed its
            // cluster roots.
            for slot in 0..ir.ssa_node(h).input_size() {
                if let Some(input) = ir.ssa_node(h).input(slot).handle() {
                    let head = get_link_head(ir, input);
                    if head != root && can_prune(ir, fns, head) {
                        worklist.push(ir, head);
                    }
                }
            }

            debug_assert!(!ir.ssa_node(h).test_flags(FLAG_IN_WORKLIST));
            ir.prune_ssa(h);
        }

        changed = true;
    }

    ir.assert_valid();
    changed
}

/// Mark-and-sweep from side-effecting roots: everything not reachable by
/// reverse data/order dependence from a root of effect is removed.
pub fn o_remove_no_effect(ir: &mut Ir) -> bool {
    let mut worklist: Worklist<SsaId> = Worklist::new();
    let nodes = all_nodes(ir);

    for &h in &nodes {
        debug_assert!(!ir.ssa_node(h).test_flags(FLAG_IN_WORKLIST));
        ir.ssa_node_mut(h).set_flags(FLAG_PRUNED);
    }

    for &h in &nodes {
        let op = ir.ssa_node(h).op();
        // Link members are handled by the linked prune; keep them
        // conservatively live here.
        if op == SsaOp::If
            || op.flags() & (SSAF_WRITE_GLOBALS | SSAF_IMPURE) != 0
            || op.input0_class() == InputClass::Link
        {
            ir.ssa_node_mut(h).clear_flags(FLAG_PRUNED);
            worklist.push(ir, h);
        }
    }

    while let Some(h) = worklist.pop(ir) {
        for slot in 0..ir.ssa_node(h).input_size() {
            if let Some(input) = ir.ssa_node(h).input(slot).handle() {
                if ir.ssa_node(input).test_flags(FLAG_PRUNED) {
                    ir.ssa_node_mut(input).clear_flags(FLAG_PRUNED);
                    worklist.push(ir, input);
                }
            }
        }
    }

    let mut changed = false;
    let cfgs: Vec<CfgId> = ir.cfg_ids().collect();
    for cfg in cfgs {
        let mut i = 0;
        while i < ir.cfg_node(cfg).ssa_nodes().len() {
            let h = ir.cfg_node(cfg).ssa_nodes()[i];
            if ir.ssa_node(h).test_flags(FLAG_PRUNED) {
                ir.prune_ssa(h);
                changed = true;
            } else {
                i += 1;
            }
        }
    }

    changed
}

/// Runs the linked prune, then the no-effect prune.
pub fn o_remove_unused_ssa(ir: &mut Ir, fns: &Fns) -> bool {
    let mut changed = false;
    changed |= o_remove_unused_linked(ir, fns);
    changed |= o_remove_no_effect(ir);
    changed
}
