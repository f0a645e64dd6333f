//! Assembly-level control-flow graph.
//!
//! Instruction selection hands over a linear stream of pseudo-instructions;
//! [`AsmGraph::append_code`] splits it into basic blocks, resolving labels
//! lazily so forward references cost nothing. [`AsmGraph::optimize`] runs
//! the block-level cleanups to a fixed point, [`AsmGraph::order`] picks a
//! linear layout via a greedy path cover refined by seeded annealing, and
//! [`AsmGraph::to_linear`] flattens the chosen order back into a labeled
//! instruction vector for the emitter.
//!
//! The liveness analyses over this graph live in [`crate::liveness`].

use std::fmt;

use bitvec::vec::BitVec;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::asm::{size_in_bytes, AsmInst, Mn, Op, ASMF_BRANCH, ASMF_JUMP, ASMF_SWITCH};
use crate::ir::{CfgId, Id, Ir};
use crate::locator::{ByteSel, LocKind, Locator};
use crate::worklist::FlagStore;

/// One switch's dispatch table: `(case value, target label)` pairs.
pub type SwitchTable = Vec<(u8, Locator)>;
/// Dispatch tables keyed by the switch's CFG node.
pub type SwitchTables = FxHashMap<CfgId, SwitchTable>;

/// Derives a switch table from a block's `SwitchFull` terminator: case
/// values come from the terminator's constant inputs, targets from the
/// caller's successor labels, in matching order.
pub fn switch_table_for(ir: &Ir, cfg: CfgId, targets: &[Locator]) -> SwitchTable {
    let branch = ir
        .cfg_node(cfg)
        .last_daisy()
        .expect("switch block has no terminator");
    let node = ir.ssa_node(branch);
    assert_eq!(node.op(), crate::ir::SsaOp::SwitchFull);
    assert_eq!(node.input_size() - 1, targets.len());

    (0..targets.len())
        .map(|i| {
            let case = node
                .input(i + 1)
                .whole()
                .expect("switch case must be constant");
            (case as u8, targets[i])
        })
        .collect()
}

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsmGraphError {
    /// A referenced label was never defined in the stream.
    MissingLabel(Locator),
}

impl fmt::Display for AsmGraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingLabel(label) => write!(f, "missing label {label} in assembly"),
        }
    }
}

impl std::error::Error for AsmGraphError {}

// ─── Nodes and edges ────────────────────────────────────────────────────────

pub type AsmId = Id<AsmNode>;

/// An outgoing edge. `case_value >= 0` only on switch edges. The target is
/// `None` while a label lookup is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsmEdge {
    pub node: Option<AsmId>,
    pub case_value: i32,
}

impl AsmEdge {
    fn to(node: AsmId) -> Self {
        Self {
            node: Some(node),
            case_value: -1,
        }
    }
}

/// A post-instruction-selection basic block.
pub struct AsmNode {
    pub(crate) code: Vec<AsmInst>,
    /// The block's terminator, when it has one. Return blocks keep their
    /// return instruction in `code` and leave this `None`.
    pub(crate) output_inst: Option<AsmInst>,
    pub(crate) outputs: SmallVec<[AsmEdge; 2]>,
    pub(crate) inputs: SmallVec<[AsmId; 2]>,
    pub(crate) label: Locator,
    pub(crate) cfg: Option<CfgId>,
    pub(crate) original_order: u32,
    pub(crate) flags: u8,

    // Scratch: linearization id.
    vid: u32,
    // Scratch: path cover.
    path_input: i32,
    path_output: i32,
    list_end: Option<AsmId>,
    // Scratch: path ordering.
    path: u32,
    offset: i32,
    code_size: u32,
    // Scratch: liveness.
    pub(crate) live_in: BitVec,
    pub(crate) live_out: BitVec,
}

impl AsmNode {
    fn new(label: Locator, original_order: u32) -> Self {
        Self {
            code: Vec::new(),
            output_inst: None,
            outputs: SmallVec::new(),
            inputs: SmallVec::new(),
            label,
            cfg: None,
            original_order,
            flags: 0,
            vid: 0,
            path_input: -1,
            path_output: -1,
            list_end: None,
            path: 0,
            offset: 0,
            code_size: 0,
            live_in: BitVec::new(),
            live_out: BitVec::new(),
        }
    }

    pub fn code(&self) -> &[AsmInst] {
        &self.code
    }

    pub fn output_inst(&self) -> Option<AsmInst> {
        self.output_inst
    }

    pub fn outputs(&self) -> &[AsmEdge] {
        &self.outputs
    }

    pub fn inputs(&self) -> &[AsmId] {
        &self.inputs
    }

    pub fn label(&self) -> Locator {
        self.label
    }

    pub fn is_switch(&self) -> bool {
        self.output_inst
            .map(|oi| oi.op.flags() & ASMF_SWITCH != 0)
            .unwrap_or(false)
    }
}

struct DelayedLookup {
    node: AsmId,
    output: usize,
    label: Locator,
}

// ─── Graph ──────────────────────────────────────────────────────────────────

/// The assembly CFG of one function.
pub struct AsmGraph {
    nodes: crate::ir::Arena<AsmNode>,
    /// Active nodes, in stream order. Pruned nodes leave this list; their
    /// arena slots stay behind.
    pub(crate) list: Vec<AsmId>,
    pub(crate) label_map: FxHashMap<Locator, AsmId>,
    to_lookup: Vec<DelayedLookup>,
    entry_label: Locator,
    original_order: u32,
}

impl FlagStore<AsmId> for AsmGraph {
    fn flags_mut(&mut self, h: AsmId) -> &mut u8 {
        &mut self.nodes[h].flags
    }
}

impl std::ops::Index<AsmId> for AsmGraph {
    type Output = AsmNode;
    fn index(&self, id: AsmId) -> &AsmNode {
        &self.nodes[id]
    }
}

impl std::ops::IndexMut<AsmId> for AsmGraph {
    fn index_mut(&mut self, id: AsmId) -> &mut AsmNode {
        &mut self.nodes[id]
    }
}

impl AsmGraph {
    pub fn new(entry_label: Locator) -> Self {
        // Minor labels get rewritten during linearization; the entry must
        // survive it.
        assert!(!matches!(entry_label.kind(), LocKind::MinorLabel(_)));

        let mut graph = Self {
            nodes: crate::ir::Arena::new(),
            list: Vec::new(),
            label_map: FxHashMap::default(),
            to_lookup: Vec::new(),
            entry_label,
            original_order: 0,
        };
        graph.push_node(Locator::NONE, false);
        graph
    }

    pub fn entry_label(&self) -> Locator {
        self.entry_label
    }

    /// Active node handles in list order.
    pub fn node_ids(&self) -> &[AsmId] {
        &self.list
    }

    pub fn for_each_inst(&self, mut f: impl FnMut(&AsmInst)) {
        for &h in &self.list {
            for inst in &self.nodes[h].code {
                f(inst);
            }
            if let Some(oi) = &self.nodes[h].output_inst {
                f(oi);
            }
        }
    }

    // ─── Construction ────────────────────────────────────────────────

    fn push_node(&mut self, label: Locator, succeed: bool) -> AsmId {
        let order = self.original_order;
        self.original_order += 1;
        let id = self.nodes.push(AsmNode::new(label, order));

        if succeed {
            if let Some(&prev) = self.list.last() {
                self.push_output(prev, AsmEdge::to(id));
                self.nodes[id].cfg = self.nodes[prev].cfg;
            }
        }

        if label.is_some() {
            let prev = self.label_map.insert(label, id);
            assert!(prev.is_none(), "duplicate label {label}");
        }

        self.list.push(id);
        id
    }

    fn delay_lookup(&mut self, node: AsmId, label: Locator, case_value: i32) {
        self.to_lookup.push(DelayedLookup {
            node,
            output: self.nodes[node].outputs.len(),
            label,
        });
        self.push_output(
            node,
            AsmEdge {
                node: None,
                case_value,
            },
        );
    }

    /// Splits a linear instruction stream into blocks, appending to the
    /// graph. Label targets resolve in [`Self::finish_appending`].
    pub fn append_code(&mut self, code: &[AsmInst], switch_tables: &SwitchTables) {
        let mut i = 0;
        while i < code.len() {
            let inst = code[i];
            let cur = *self.list.last().expect("graph has a current node");

            if inst.op.mn == Mn::Label {
                self.nodes[cur].output_inst = Some(AsmInst::of(Op::JMP_ABSOLUTE));
                let new = self.push_node(inst.arg, true);
                if let LocKind::CfgLabel(cfg, _) = inst.arg.kind() {
                    self.nodes[new].cfg = Some(cfg);
                }
            } else if inst.is_return() {
                self.nodes[cur].code.push(inst);
                self.push_node(Locator::NONE, false);
            } else if inst.op.flags() & ASMF_SWITCH != 0 {
                let cfg = inst
                    .arg
                    .cfg_id()
                    .expect("switch argument names no block");
                let table = switch_tables
                    .get(&cfg)
                    .expect("switch block has no table");
                for &(case_value, label) in table {
                    self.delay_lookup(cur, label, case_value as i32);
                }
                self.nodes[cur].output_inst = Some(inst);
                self.push_node(Locator::NONE, false);
            } else if inst.op.flags() & ASMF_JUMP != 0 {
                assert!(inst.arg.is_some());
                self.nodes[cur].output_inst = Some(inst);
                self.delay_lookup(cur, inst.arg, -1);
                self.push_node(Locator::NONE, false);
            } else if inst.op.flags() & ASMF_BRANCH != 0 {
                assert!(inst.arg.is_some());
                self.nodes[cur].output_inst = Some(inst);
                self.delay_lookup(cur, inst.arg, -1);
                // A branch followed by its inverse is a two-way split with
                // no fall-through block.
                if i + 1 < code.len() && Some(inst.op) == code[i + 1].op.invert_branch() {
                    self.delay_lookup(cur, code[i + 1].arg, -1);
                    i += 1;
                    self.push_node(Locator::NONE, false);
                } else {
                    self.push_node(Locator::NONE, true);
                }
            } else if inst.op != Op::ASM_PRUNED {
                self.nodes[cur].code.push(inst);
            }

            i += 1;
        }
    }

    /// Resolves every deferred label lookup.
    pub fn finish_appending(&mut self) -> Result<(), AsmGraphError> {
        let lookups = std::mem::take(&mut self.to_lookup);
        for lookup in lookups {
            match self.label_map.get(&lookup.label) {
                Some(&target) => self.replace_output(lookup.node, lookup.output, Some(target)),
                None => return Err(AsmGraphError::MissingLabel(lookup.label)),
            }
        }
        Ok(())
    }

    // ─── Edge bookkeeping ────────────────────────────────────────────

    fn push_output(&mut self, from: AsmId, edge: AsmEdge) {
        self.nodes[from].outputs.push(edge);
        if let Some(to) = edge.node {
            self.nodes[to].inputs.push(from);
        }
    }

    fn remove_outputs_input(&mut self, from: AsmId, i: usize) {
        if let Some(to) = self.nodes[from].outputs[i].node {
            let pos = self.nodes[to]
                .inputs
                .iter()
                .position(|&input| input == from)
                .expect("edge symmetry broken");
            self.nodes[to].inputs.swap_remove(pos);
        }
    }

    fn remove_output(&mut self, from: AsmId, i: usize) {
        self.remove_outputs_input(from, i);
        self.nodes[from].outputs.swap_remove(i);
    }

    fn replace_output(&mut self, from: AsmId, i: usize, with: Option<AsmId>) {
        self.remove_outputs_input(from, i);
        if let Some(to) = with {
            self.nodes[to].inputs.push(from);
        }
        self.nodes[from].outputs[i].node = with;
    }

    fn find_output(&self, from: AsmId, target: AsmId) -> usize {
        self.nodes[from]
            .outputs
            .iter()
            .position(|edge| edge.node == Some(target))
            .expect("missing output edge")
    }

    pub(crate) fn find_input(&self, node: AsmId, pred: AsmId) -> usize {
        self.nodes[node]
            .inputs
            .iter()
            .position(|&input| input == pred)
            .expect("missing input edge")
    }

    fn prune_node(&mut self, h: AsmId) {
        assert_ne!(self.nodes[h].label, self.entry_label);
        while !self.nodes[h].outputs.is_empty() {
            self.remove_output(h, 0);
        }
        assert!(self.nodes[h].inputs.is_empty());
        if self.nodes[h].label.is_some() {
            self.label_map.remove(&self.nodes[h].label);
        }
        let pos = self
            .list
            .iter()
            .position(|&x| x == h)
            .expect("node not in list");
        self.list.remove(pos);
    }

    // ─── Optimization ────────────────────────────────────────────────

    /// Runs the block-level cleanups to a fixed point.
    pub fn optimize(&mut self) {
        loop {
            let mut changed = false;
            changed |= self.o_remove_stubs();
            changed |= self.o_remove_branches();
            changed |= self.o_returns();
            changed |= self.o_peephole();
            if !changed {
                break;
            }
        }
    }

    /// Deletes empty blocks: unreachable ones outright, single-successor
    /// ones by rerouting their predecessors.
    fn o_remove_stubs(&mut self) -> bool {
        let mut changed = false;

        let mut i = 0;
        while i < self.list.len() {
            let h = self.list[i];

            if !self.nodes[h].code.is_empty() || self.nodes[h].label == self.entry_label {
                i += 1;
                continue;
            }

            if self.nodes[h].inputs.is_empty() {
                self.prune_node(h);
                changed = true;
                continue;
            }

            if self.nodes[h].outputs.len() == 1 && self.nodes[h].outputs[0].node != Some(h) {
                let output = self.nodes[h].outputs[0]
                    .node
                    .expect("unresolved edge survived finish_appending");
                while !self.nodes[h].inputs.is_empty() {
                    let input = self.nodes[h].inputs[0];
                    let slot = self.find_output(input, h);
                    self.replace_output(input, slot, Some(output));
                }
                self.prune_node(h);
                changed = true;
                continue;
            }

            i += 1;
        }

        changed
    }

    /// Collapses branches and switches whose outputs all reach one target
    /// into a plain jump.
    fn o_remove_branches(&mut self) -> bool {
        let mut changed = false;

        for idx in 0..self.list.len() {
            let h = self.list[idx];
            let node = &self.nodes[h];
            if node.outputs.len() < 2 {
                continue;
            }
            let first = node.outputs[0].node;
            if node.outputs[1..].iter().any(|edge| edge.node != first) {
                continue;
            }

            while self.nodes[h].outputs.len() > 1 {
                self.remove_output(h, 0);
            }
            self.nodes[h].outputs[0].case_value = -1;
            self.nodes[h].output_inst = Some(AsmInst::of(Op::JMP_ABSOLUTE));
            changed = true;
        }

        changed
    }

    /// Return-block cleanups: tail-call rewriting, then merging of
    /// duplicated tails into a shared block.
    fn o_returns(&mut self) -> bool {
        let mut changed = false;

        let returns: SmallVec<[AsmId; 8]> = self
            .list
            .iter()
            .copied()
            .filter(|&h| self.nodes[h].outputs.is_empty())
            .collect();

        // Tail-call optimize: a call followed only by the return becomes a
        // jump.
        for &h in &returns {
            let code = &mut self.nodes[h].code;
            let n = code.len();
            if n < 2 || code[n - 1].op != Op::RTS_IMPLIED {
                continue;
            }
            if let Some(new_op) = code[n - 2].op.tail_call_op() {
                let mut call = code[n - 2];
                call.op = new_op;
                code.truncate(n - 2);
                code.push(call);
                changed = true;
            }
        }

        // Combine duplicated code.
        for i in 0..returns.len() {
            for j in i + 1..returns.len() {
                let a = returns[i];
                let b = returns[j];
                if !self.nodes[a].outputs.is_empty() || !self.nodes[b].outputs.is_empty() {
                    continue;
                }
                if self.nodes[a].output_inst != self.nodes[b].output_inst {
                    continue;
                }
                if self.nodes[a].is_switch() || self.nodes[b].is_switch() {
                    continue;
                }

                // Length of the maximal common code suffix.
                let code_a = &self.nodes[a].code;
                let code_b = &self.nodes[b].code;
                let min_size = code_a.len().min(code_b.len());
                let mut match_len = 0;
                while match_len < min_size
                    && code_a[code_a.len() - 1 - match_len] == code_b[code_b.len() - 1 - match_len]
                {
                    match_len += 1;
                }

                if match_len >= 2 {
                    let suffix: Vec<AsmInst> =
                        code_a[code_a.len() - match_len..].to_vec();

                    let merged = self.push_node(Locator::NONE, false);
                    self.nodes[merged].cfg = self.nodes[a].cfg.or(self.nodes[b].cfg);
                    self.nodes[merged].code = suffix;
                    self.nodes[merged].output_inst = self.nodes[a].output_inst;

                    let keep_a = self.nodes[a].code.len() - match_len;
                    let keep_b = self.nodes[b].code.len() - match_len;
                    self.nodes[a].code.truncate(keep_a);
                    self.nodes[b].code.truncate(keep_b);

                    self.push_output(a, AsmEdge::to(merged));
                    self.push_output(b, AsmEdge::to(merged));
                    self.nodes[a].output_inst = Some(AsmInst::of(Op::JMP_ABSOLUTE));
                    self.nodes[b].output_inst = Some(AsmInst::of(Op::JMP_ABSOLUTE));

                    changed = true;
                }
            }
        }

        changed
    }

    fn o_peephole(&mut self) -> bool {
        let mut changed = false;
        for idx in 0..self.list.len() {
            let h = self.list[idx];
            changed |= crate::peephole::run(&mut self.nodes[h].code);
        }
        changed
    }

    // ─── Ordering ────────────────────────────────────────────────────

    /// Loop-nest depth of the edge between two blocks' CFG nodes.
    fn edge_depth(&self, ir_depths: Option<&FxHashMap<CfgId, u32>>, a: CfgId, b: CfgId) -> u32 {
        match ir_depths {
            Some(depths) => {
                let da = depths.get(&a).copied().unwrap_or(0);
                let db = depths.get(&b).copied().unwrap_or(0);
                da.min(db)
            }
            None => 0,
        }
    }

    /// Collects the CFG nodes feeding a secondary entrance, so its edges
    /// weigh by the depth they actually come from.
    fn build_incoming(&self, incoming: &mut SmallVec<[CfgId; 8]>, h: AsmId, cfg: CfgId) {
        let node = &self.nodes[h];
        if node.cfg != Some(cfg) {
            if let Some(other) = node.cfg {
                if !incoming.contains(&other) {
                    incoming.push(other);
                }
            }
        } else if matches!(node.label.kind(), LocKind::CfgLabel(_, e) if e > 0) {
            for idx in 0..node.inputs.len() {
                self.build_incoming(incoming, node.inputs[idx], cfg);
            }
        }
    }

    /// Chooses a linear block order: greedy path cover over weighted edges,
    /// then path permutation search minimizing branch-distance penalties.
    ///
    /// `cfg_depths` supplies loop-nesting depths per CFG node; edges inside
    /// hot loops get exponentially heavier and stay fall-throughs.
    pub fn order_with_depths(
        &mut self,
        cfg_depths: Option<&FxHashMap<CfgId, u32>>,
    ) -> Vec<AsmId> {
        struct EdgeCand {
            from: AsmId,
            output: usize,
            weight: u64,
        }

        // Build an elimination order for graph edges.
        let mut elim_order: Vec<EdgeCand> = Vec::with_capacity(self.list.len() * 2);

        for idx in 0..self.list.len() {
            let h = self.list[idx];

            let scale = |graph: &Self, other: AsmId| -> u64 {
                let node_cfg = graph.nodes[h].cfg;
                let other_cfg = graph.nodes[other].cfg.or(node_cfg);
                let Some(node_cfg) = node_cfg else {
                    return 1;
                };
                let other_cfg = other_cfg.expect("cfg known");

                let mut incoming: SmallVec<[CfgId; 8]> = SmallVec::new();
                if node_cfg == other_cfg {
                    graph.build_incoming(&mut incoming, h, node_cfg);
                }

                let depth = if incoming.is_empty() {
                    graph.edge_depth(cfg_depths, node_cfg, other_cfg)
                } else {
                    incoming
                        .iter()
                        .map(|&cfg| graph.edge_depth(cfg_depths, cfg, other_cfg))
                        .max()
                        .unwrap_or(0)
                };

                1u64 << depth.saturating_mul(2).min(16)
            };

            let outputs = &self.nodes[h].outputs;
            match outputs.len() {
                0 => {}
                1 => {
                    // Weight unconditional fall-through the highest.
                    let to = outputs[0].node.expect("resolved edge");
                    elim_order.push(EdgeCand {
                        from: h,
                        output: 0,
                        weight: 3 * scale(self, to),
                    });
                }
                2 => {
                    // Gently prefer keeping the original stream order.
                    let to0 = outputs[0].node.expect("resolved edge");
                    let to1 = outputs[1].node.expect("resolved edge");
                    let i = usize::from(
                        self.nodes[to0].original_order > self.nodes[to1].original_order,
                    );
                    let targets = [to0, to1];
                    elim_order.push(EdgeCand {
                        from: h,
                        output: i,
                        weight: 2 * scale(self, targets[i]),
                    });
                    elim_order.push(EdgeCand {
                        from: h,
                        output: 1 - i,
                        weight: scale(self, targets[1 - i]),
                    });
                }
                _ => {
                    for output in 0..outputs.len() {
                        elim_order.push(EdgeCand {
                            from: h,
                            output,
                            weight: 0,
                        });
                    }
                }
            }

            // Reset path-cover scratch.
            let node = &mut self.nodes[h];
            node.path_input = -1;
            node.path_output = -1;
            node.list_end = None;
        }

        elim_order.sort_by(|l, r| r.weight.cmp(&l.weight));

        // Build the path cover greedily.
        for edge in &elim_order {
            let to = self.nodes[edge.from].outputs[edge.output]
                .node
                .expect("resolved edge");
            trace!(weight = edge.weight, "path cover edge");

            if self.nodes[edge.from].path_output >= 0 {
                continue; // Path already exists.
            }
            if self.nodes[to].path_input >= 0 {
                continue; // Path already exists.
            }

            // Verify that no cycle is created.
            let mut end = to;
            while let Some(next) = self.nodes[end].list_end {
                end = next;
            }
            if end == edge.from {
                continue;
            }

            self.nodes[edge.from].list_end = Some(end);
            self.nodes[edge.from].path_output = edge.output as i32;
            let input_idx = self.find_input(to, edge.from) as i32;
            self.nodes[to].path_input = input_idx;
        }

        // Collect the paths. A path starts wherever no cover edge enters.
        struct PathBranch {
            from_offset: i32,
            to_offset: i32,
            to_path: usize,
        }
        struct Path {
            nodes: Vec<AsmId>,
            branches: Vec<PathBranch>,
            code_size: u32,
            offset: i32,
        }

        let mut paths: Vec<Path> = Vec::new();
        for idx in 0..self.list.len() {
            let h = self.list[idx];
            if self.nodes[h].path_input >= 0 {
                continue;
            }
            let mut nodes = Vec::new();
            let mut it = h;
            loop {
                nodes.push(it);
                let po = self.nodes[it].path_output;
                if po < 0 {
                    break;
                }
                it = self.nodes[it].outputs[po as usize]
                    .node
                    .expect("resolved edge");
            }
            paths.push(Path {
                nodes,
                branches: Vec::new(),
                code_size: 0,
                offset: 0,
            });
        }

        debug!(paths = paths.len(), "path cover built");

        // Gather code sizes and in-path offsets.
        for (pi, path) in paths.iter_mut().enumerate() {
            let last = *path.nodes.last().expect("paths are nonempty");
            for &h in &path.nodes {
                let term_size = self.nodes[h]
                    .output_inst
                    .map(|oi| oi.op.size())
                    .unwrap_or(0);
                let extra = match self.nodes[h].outputs.len() {
                    // Branch, plus a jump when the fall-through leaves the
                    // path.
                    2 => 1 + u32::from(h == last),
                    1 => u32::from(h == last),
                    _ => 1,
                };

                let node = &mut self.nodes[h];
                node.path = pi as u32;
                node.offset = path.code_size as i32;
                node.code_size = size_in_bytes(node.code.iter()) + extra * term_size;
                path.code_size += node.code_size;
            }
        }

        // Gather cross-path branches.
        for pi in 0..paths.len() {
            let mut branches = Vec::new();
            for &h in &paths[pi].nodes {
                let is_branch = self.nodes[h]
                    .output_inst
                    .map(|oi| oi.op.flags() & ASMF_BRANCH != 0)
                    .unwrap_or(false);
                if !is_branch {
                    continue;
                }
                for edge in self.nodes[h].outputs.iter() {
                    let out = edge.node.expect("resolved edge");
                    if self.nodes[out].path as usize != pi {
                        branches.push(PathBranch {
                            from_offset: self.nodes[h].offset,
                            to_offset: self.nodes[out].offset,
                            to_path: self.nodes[out].path as usize,
                        });
                    }
                }
            }
            paths[pi].branches = branches;
        }

        // Cost of a candidate path permutation: +1 per page-crossing
        // branch, +3 per branch outside the short window.
        let cost_fn = |paths: &mut [Path], order: &[usize]| -> u32 {
            let mut code_size = 0i32;
            for &pi in order {
                paths[pi].offset = code_size;
                code_size += paths[pi].code_size as i32;
            }

            let mut cost = 0;
            for &pi in order {
                for branch in &paths[pi].branches {
                    let from = branch.from_offset + paths[pi].offset;
                    let to = branch.to_offset + paths[branch.to_path].offset;
                    let distance = (from - to).abs();

                    if (from >> 8) != (to >> 8) {
                        cost += 1;
                    }
                    if distance > 127 - 4 {
                        cost += 3;
                    }
                }
            }
            cost
        };

        let mut lowest_cost = u32::MAX;
        let mut best_order: Vec<usize> = Vec::new();
        let mut order: Vec<usize> = (0..paths.len()).collect();

        const SOLVE_OPTIMALLY_LIMIT: usize = 4;
        if paths.len() <= SOLVE_OPTIMALLY_LIMIT {
            // Small sizes solve optimally by enumeration.
            loop {
                let cost = cost_fn(&mut paths, &order);
                if cost < lowest_cost {
                    lowest_cost = cost;
                    best_order = order.clone();
                }
                if lowest_cost == 0 || !next_permutation(&mut order) {
                    break;
                }
            }
        } else {
            let mut rng = StdRng::seed_from_u64(0xDEAD_BEEF);

            let check =
                |paths: &mut [Path], order: &[usize], lowest: &mut u32, best: &mut Vec<usize>| {
                    let cost = cost_fn(paths, order);
                    if cost < *lowest {
                        *lowest = cost;
                        *best = order.to_vec();
                    }
                };

            check(&mut paths, &order, &mut lowest_cost, &mut best_order);

            // A few random starts first.
            const INITIAL_SHUFFLES: usize = 4;
            for _ in 0..INITIAL_SHUFFLES {
                order.shuffle(&mut rng);
                check(&mut paths, &order, &mut lowest_cost, &mut best_order);
            }

            // Simulated annealing descent.
            const ATTEMPTS_PER_ITER: usize = 4;
            'anneal: for swaps in (1..=paths.len()).rev() {
                for _ in 0..ATTEMPTS_PER_ITER {
                    order.clone_from(&best_order);
                    for _ in 0..swaps {
                        let a = rng.gen_range(0..paths.len());
                        let b = rng.gen_range(0..paths.len());
                        order.swap(a, b);
                    }
                    check(&mut paths, &order, &mut lowest_cost, &mut best_order);
                    if lowest_cost == 0 {
                        break 'anneal;
                    }
                }
            }
        }

        debug!(cost = lowest_cost, "block layout chosen");

        let mut result = Vec::with_capacity(self.list.len());
        for &pi in &best_order {
            result.extend_from_slice(&paths[pi].nodes);
        }
        result
    }

    /// [`Self::order_with_depths`] with no loop-depth information.
    pub fn order(&mut self) -> Vec<AsmId> {
        self.order_with_depths(None)
    }

    // ─── Linearization ───────────────────────────────────────────────

    fn emit_label_of(&self, h: AsmId) -> Locator {
        let node = &self.nodes[h];
        if node.label.is_some() && !matches!(node.label.kind(), LocKind::MinorLabel(_)) {
            return node.label;
        }
        Locator::minor_label(node.vid)
    }

    /// Flattens the ordered blocks into a labeled instruction vector,
    /// emitting labels, branches, and switch tables only where needed.
    pub fn to_linear(&mut self, order: &[AsmId]) -> Vec<AsmInst> {
        let mut code: Vec<AsmInst> = Vec::new();
        let mut table_code: Vec<AsmInst> = Vec::new();

        let mut estimated_size = 0;
        for (vid, &h) in order.iter().enumerate() {
            self.nodes[h].vid = vid as u32;
            estimated_size += self.nodes[h].code.len() + 2;
        }
        code.reserve(estimated_size);

        // Prepare switch tables first.
        for &h in order {
            if !self.nodes[h].is_switch() {
                continue;
            }

            let mut min = 0xFF;
            let mut max = 0;
            for edge in self.nodes[h].outputs.iter() {
                assert!(edge.case_value >= 0, "switch edge without case");
                assert!(edge.case_value <= 0xFF);
                min = min.min(edge.case_value);
                max = max.max(edge.case_value);
            }
            let size = (max - min + 1) as usize;

            // Shift the terminator's table offset so the table can start
            // at the lowest case.
            let oi = self.nodes[h].output_inst.as_mut().expect("switch inst");
            oi.arg.advance_offset(-min);
            oi.alt.advance_offset(-min);
            let cfg = oi.arg.cfg_id().expect("switch table names its block");

            let mut table = vec![Locator::const_byte(0); size];
            for i in 0..self.nodes[h].outputs.len() {
                let edge = self.nodes[h].outputs[i];
                let target = edge.node.expect("resolved edge");
                table[(edge.case_value - min) as usize] =
                    self.emit_label_of(target).with_advance_offset(-1);
            }

            table_code.reserve(table.len() * 2 + 2);
            table_code.push(AsmInst::with_arg(
                Op::ASM_LABEL,
                Locator::switch_lo_table(cfg),
            ));
            for &loc in &table {
                table_code.push(AsmInst::with_arg(
                    Op::ASM_DATA,
                    loc.with_byte_sel(ByteSel::PtrLo),
                ));
            }
            table_code.push(AsmInst::with_arg(
                Op::ASM_LABEL,
                Locator::switch_hi_table(cfg),
            ));
            for &loc in &table {
                table_code.push(AsmInst::with_arg(
                    Op::ASM_DATA,
                    loc.with_byte_sel(ByteSel::PtrHi),
                ));
            }
        }

        // Now the main code.
        for i in 0..order.len() {
            let h = order[i];
            let prev = if i > 0 { Some(order[i - 1]) } else { None };
            let next = order.get(i + 1).copied();

            let node = &self.nodes[h];
            let needs_label = node.inputs.len() > 1
                || (node.inputs.len() == 1 && prev != Some(node.inputs[0]))
                || node.label == self.entry_label
                || node
                    .inputs
                    .iter()
                    .any(|&input| self.nodes[input].is_switch());
            if needs_label {
                code.push(AsmInst::with_arg(Op::ASM_LABEL, self.emit_label_of(h)));
            }

            code.extend_from_slice(&self.nodes[h].code);

            if let Some(oi) = self.nodes[h].output_inst {
                if self.nodes[h].is_switch() || self.nodes[h].outputs.is_empty() {
                    code.push(oi);
                } else {
                    let outputs = self.nodes[h].outputs.clone();
                    assert!(outputs.len() <= 2);
                    for (j, edge) in outputs.iter().enumerate() {
                        let target = edge.node.expect("resolved edge");
                        if Some(target) == next {
                            continue;
                        }
                        let mut op = oi.op;
                        if j > 0 {
                            op = op.invert_branch().unwrap_or(op);
                        }
                        code.push(AsmInst::with_arg(op, self.emit_label_of(target)));
                    }
                }
            } else {
                assert!(self.nodes[h].outputs.is_empty());
            }
        }

        code.extend_from_slice(&table_code);
        code
    }
}

/// Lexicographic next permutation, mirroring the exhaustive small-size
/// search.
fn next_permutation(order: &mut [usize]) -> bool {
    if order.len() < 2 {
        return false;
    }
    let mut i = order.len() - 1;
    while i > 0 && order[i - 1] >= order[i] {
        i -= 1;
    }
    if i == 0 {
        return false;
    }
    let mut j = order.len() - 1;
    while order[j] <= order[i - 1] {
        j -= 1;
    }
    order.swap(i - 1, j);
    order[i..].reverse();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::Mode;

    fn label(n: u32) -> Locator {
        Locator::minor_label(n)
    }

    fn nop() -> AsmInst {
        AsmInst::of(Op::new(Mn::Nop, Mode::Implied))
    }

    fn rts() -> AsmInst {
        AsmInst::of(Op::RTS_IMPLIED)
    }

    fn entry() -> Locator {
        Locator::cfg_label(Id::new(0))
    }

    fn lda_imm(v: u8) -> AsmInst {
        AsmInst::with_arg(Op::new(Mn::Lda, Mode::Immediate), Locator::const_byte(v))
    }

    fn sta(loc: Locator) -> AsmInst {
        AsmInst::with_arg(Op::new(Mn::Sta, Mode::Absolute), loc)
    }

    fn build(entry_label: Locator, stream: &[AsmInst]) -> AsmGraph {
        let mut graph = AsmGraph::new(entry_label);
        graph.append_code(stream, &SwitchTables::default());
        graph.finish_appending().unwrap();
        graph
    }

    #[test]
    fn missing_label_is_an_error() {
        let mut graph = AsmGraph::new(entry());
        graph.append_code(
            &[
                AsmInst::with_arg(Op::ASM_LABEL, entry()),
                AsmInst::with_arg(Op::JMP_ABSOLUTE, label(99)),
            ],
            &SwitchTables::default(),
        );
        assert_eq!(
            graph.finish_appending(),
            Err(AsmGraphError::MissingLabel(label(99)))
        );
    }

    #[test]
    fn stub_blocks_dissolve() {
        // L1: NOP; JMP L2; L2: RTS  =>  linear [L1: NOP, RTS]
        let l2 = Locator::cfg_label(Id::new(1));
        let mut graph = build(
            entry(),
            &[
                AsmInst::with_arg(Op::ASM_LABEL, entry()),
                nop(),
                AsmInst::with_arg(Op::JMP_ABSOLUTE, l2),
                AsmInst::with_arg(Op::ASM_LABEL, l2),
                rts(),
            ],
        );
        graph.optimize();

        let order = graph.order();
        let linear = graph.to_linear(&order);
        let expected = [
            AsmInst::with_arg(Op::ASM_LABEL, entry()),
            nop(),
            rts(),
        ];
        assert_eq!(linear, expected);
    }

    #[test]
    fn edge_symmetry_after_construction() {
        let l2 = Locator::cfg_label(Id::new(1));
        let graph = build(
            entry(),
            &[
                AsmInst::with_arg(Op::ASM_LABEL, entry()),
                AsmInst::with_arg(Op::new(Mn::Beq, Mode::Relative), l2),
                nop(),
                rts(),
                AsmInst::with_arg(Op::ASM_LABEL, l2),
                rts(),
            ],
        );

        for &h in graph.node_ids() {
            for edge in graph[h].outputs() {
                let to = edge.node.expect("resolved");
                let count = graph[to].inputs().iter().filter(|&&x| x == h).count();
                assert_eq!(count, 1);
            }
        }
    }

    #[test]
    fn tail_returns_merge() {
        let gm = Locator::gmember(Id::new(0));
        let l2 = Locator::cfg_label(Id::new(1));
        let mut graph = build(
            entry(),
            &[
                AsmInst::with_arg(Op::ASM_LABEL, entry()),
                AsmInst::with_arg(Op::new(Mn::Beq, Mode::Relative), l2),
                lda_imm(1),
                sta(gm),
                rts(),
                AsmInst::with_arg(Op::ASM_LABEL, l2),
                lda_imm(2),
                sta(gm),
                rts(),
            ],
        );
        graph.optimize();

        // Both return blocks got truncated and now jump to a shared tail.
        let tails: Vec<AsmId> = graph
            .node_ids()
            .iter()
            .copied()
            .filter(|&h| graph[h].code() == [sta(gm), rts()])
            .collect();
        assert_eq!(tails.len(), 1);
        let tail = tails[0];
        assert_eq!(graph[tail].inputs().len(), 2);

        for &pred in graph[tail].inputs() {
            let code = graph[pred].code();
            assert_eq!(code.len(), 1);
            assert!(code == [lda_imm(1)] || code == [lda_imm(2)]);
            assert_eq!(graph[pred].output_inst().unwrap().op, Op::JMP_ABSOLUTE);
        }
    }

    #[test]
    fn tail_call_rewrites_jsr_rts() {
        let f = Locator::fn_entry(Id::new(0));
        let mut graph = build(
            entry(),
            &[
                AsmInst::with_arg(Op::ASM_LABEL, entry()),
                nop(),
                AsmInst::with_arg(Op::JSR_ABSOLUTE, f),
                rts(),
            ],
        );
        graph.optimize();

        let entry_node = graph.label_map[&entry()];
        assert_eq!(
            graph[entry_node].code(),
            [nop(), AsmInst::with_arg(Op::JMP_ABSOLUTE, f)]
        );
    }

    #[test]
    fn branch_to_single_target_collapses() {
        // Both branch arms reach l2.
        let l2 = Locator::cfg_label(Id::new(1));
        let mut graph = build(
            entry(),
            &[
                AsmInst::with_arg(Op::ASM_LABEL, entry()),
                nop(),
                AsmInst::with_arg(Op::new(Mn::Beq, Mode::Relative), l2),
                AsmInst::with_arg(Op::new(Mn::Bne, Mode::Relative), l2),
                AsmInst::with_arg(Op::ASM_LABEL, l2),
                rts(),
            ],
        );
        graph.optimize();

        let entry_node = graph.label_map[&entry()];
        assert_eq!(graph[entry_node].outputs().len(), 1);
        assert_eq!(graph[entry_node].output_inst().unwrap().op, Op::JMP_ABSOLUTE);
    }

    #[test]
    fn optimize_is_idempotent() {
        let gm = Locator::gmember(Id::new(0));
        let l2 = Locator::cfg_label(Id::new(1));
        let stream = [
            AsmInst::with_arg(Op::ASM_LABEL, entry()),
            AsmInst::with_arg(Op::new(Mn::Beq, Mode::Relative), l2),
            lda_imm(1),
            sta(gm),
            rts(),
            AsmInst::with_arg(Op::ASM_LABEL, l2),
            lda_imm(2),
            sta(gm),
            rts(),
        ];

        let mut graph = build(entry(), &stream);
        graph.optimize();
        let order = graph.order();
        let first = graph.to_linear(&order);

        graph.optimize();
        let order = graph.order();
        let second = graph.to_linear(&order);
        assert_eq!(first, second);
    }

    #[test]
    fn path_cover_is_disjoint() {
        let l2 = Locator::cfg_label(Id::new(1));
        let l3 = Locator::cfg_label(Id::new(2));
        let mut graph = build(
            entry(),
            &[
                AsmInst::with_arg(Op::ASM_LABEL, entry()),
                AsmInst::with_arg(Op::new(Mn::Beq, Mode::Relative), l3),
                nop(),
                AsmInst::with_arg(Op::ASM_LABEL, l2),
                nop(),
                rts(),
                AsmInst::with_arg(Op::ASM_LABEL, l3),
                nop(),
                AsmInst::with_arg(Op::JMP_ABSOLUTE, l2),
            ],
        );
        graph.optimize();

        let order = graph.order();
        // Every active node appears exactly once.
        assert_eq!(order.len(), graph.node_ids().len());
        let mut seen = order.clone();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), order.len());
    }

    #[test]
    fn layout_pulls_branch_target_into_range() {
        // entry branches to `far`, with a 133-byte pad path between them
        // in stream order and a 203-byte unreachable island. The layout
        // search must not leave `far` beyond the short-branch window.
        let far = Locator::cfg_label(Id::new(1));
        let pad = Locator::cfg_label(Id::new(2));
        let farpre = Locator::cfg_label(Id::new(3));
        let island = Locator::cfg_label(Id::new(4));

        let mut stream = vec![
            AsmInst::with_arg(Op::ASM_LABEL, entry()),
            lda_imm(0),
            AsmInst::with_arg(Op::new(Mn::Beq, Mode::Relative), far),
            AsmInst::with_arg(Op::new(Mn::Bne, Mode::Relative), pad),
            AsmInst::with_arg(Op::ASM_LABEL, pad),
        ];
        stream.extend(std::iter::repeat(nop()).take(130));
        stream.push(lda_imm(3));
        stream.push(rts());
        stream.push(AsmInst::with_arg(Op::ASM_LABEL, farpre));
        stream.push(nop());
        stream.push(AsmInst::with_arg(Op::JMP_ABSOLUTE, far));
        stream.push(AsmInst::with_arg(Op::ASM_LABEL, far));
        stream.push(nop());
        stream.push(lda_imm(1));
        stream.push(rts());
        stream.push(AsmInst::with_arg(Op::ASM_LABEL, island));
        stream.extend(std::iter::repeat(nop()).take(200));
        stream.push(lda_imm(2));
        stream.push(rts());

        let mut graph = build(entry(), &stream);
        graph.optimize();
        let order = graph.order();

        let entry_node = graph.label_map[&entry()];
        let far_node = graph.label_map[&far];
        let pos_entry = order.iter().position(|&h| h == entry_node).unwrap();
        let pos_far = order.iter().position(|&h| h == far_node).unwrap();

        // Three paths survive, so the permutation search is exhaustive:
        // `far`'s path lands directly before the entry block.
        assert!(pos_far < pos_entry);
        assert_eq!(pos_entry - pos_far, 1);

        // Every emitted short branch reaches its target.
        let linear = graph.to_linear(&order);
        let mut label_offsets: FxHashMap<Locator, i32> = FxHashMap::default();
        let mut offset = 0i32;
        for inst in &linear {
            if inst.op == Op::ASM_LABEL {
                label_offsets.insert(inst.arg, offset);
            }
            offset += inst.op.size() as i32;
        }
        let mut offset = 0i32;
        for inst in &linear {
            if inst.op.flags() & ASMF_BRANCH != 0 {
                let target = label_offsets[&inst.arg];
                assert!((target - offset).abs() <= 127, "branch out of range");
            }
            offset += inst.op.size() as i32;
        }

        // Determinism: a second run picks the identical layout.
        let again = graph.order();
        assert_eq!(order, again);
    }

    #[test]
    fn switch_table_derived_from_terminator() {
        use crate::ir::{SsaOp, SsaValue};

        let mut ir = Ir::new();
        let bb = ir.new_cfg(0);
        let sel = ir.new_ssa(bb, SsaOp::Const, &[SsaValue::Const(0)]);
        ir.new_ssa(
            bb,
            SsaOp::SwitchFull,
            &[SsaValue::Handle(sel), SsaValue::Const(3), SsaValue::Const(7)],
        );

        let t0 = Locator::cfg_label(Id::new(1));
        let t1 = Locator::cfg_label(Id::new(2));
        let table = switch_table_for(&ir, bb, &[t0, t1]);
        assert_eq!(table, vec![(3, t0), (7, t1)]);
    }

    #[test]
    fn switch_emits_lo_hi_tables() {
        let cfg: CfgId = Id::new(0);
        let c1 = Locator::cfg_label(Id::new(1));
        let c2 = Locator::cfg_label(Id::new(2));

        let mut tables = SwitchTables::default();
        tables.insert(cfg, vec![(2, c1), (4, c2)]);

        let switch_inst = AsmInst {
            op: Op::SWITCH_IMPLIED,
            arg: Locator::switch_lo_table(cfg),
            alt: Locator::switch_hi_table(cfg),
        };

        let mut graph = AsmGraph::new(entry());
        graph.append_code(
            &[
                AsmInst::with_arg(Op::ASM_LABEL, entry()),
                switch_inst,
                AsmInst::with_arg(Op::ASM_LABEL, c1),
                lda_imm(1),
                rts(),
                AsmInst::with_arg(Op::ASM_LABEL, c2),
                lda_imm(2),
                rts(),
            ],
            &tables,
        );
        graph.finish_appending().unwrap();
        graph.optimize();

        let order = graph.order();
        let linear = graph.to_linear(&order);

        // The terminator's table argument was advanced by -min.
        let switch_out = linear
            .iter()
            .find(|inst| inst.op == Op::SWITCH_IMPLIED)
            .unwrap();
        assert_eq!(switch_out.arg.offset(), -2);

        // Case targets carry labels (they follow a switch).
        let lo_at = linear
            .iter()
            .position(|inst| {
                inst.op == Op::ASM_LABEL && inst.arg == Locator::switch_lo_table(cfg)
            })
            .unwrap();
        // max_case - min_case + 1 = 3 entries per table.
        let entries: Vec<_> = linear[lo_at + 1..lo_at + 4]
            .iter()
            .map(|inst| {
                assert_eq!(inst.op, Op::ASM_DATA);
                inst.arg
            })
            .collect();
        assert_eq!(entries[0], c1.with_advance_offset(-1).with_byte_sel(ByteSel::PtrLo));
        // The hole between cases 2 and 4 is a filler byte.
        assert_eq!(entries[1], Locator::const_byte(0).with_byte_sel(ByteSel::PtrLo));
        assert_eq!(entries[2], c2.with_advance_offset(-1).with_byte_sel(ByteSel::PtrLo));

        let hi_at = linear
            .iter()
            .position(|inst| {
                inst.op == Op::ASM_LABEL && inst.arg == Locator::switch_hi_table(cfg)
            })
            .unwrap();
        assert!(hi_at > lo_at);
    }
}
