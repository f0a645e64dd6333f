//! Local-variable tracking for register allocation.
//!
//! An lvar is a storage locator eligible for allocation: the function's own
//! argument and return slots plus the temporaries instruction selection
//! named. The [`LvarsManager`] assigns each a dense index (its bit position
//! in every liveness set) and records which lvars are ever simultaneously
//! live, plus which calls each lvar spans.

use bitvec::slice::BitSlice;
use bitvec::vec::BitVec;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::asm_graph::AsmGraph;
use crate::fns::FnId;
use crate::locator::{LocKind, Locator};

// ─── Indexed locator set ────────────────────────────────────────────────────

/// Insertion-ordered set of locators with O(1) index lookup. The index of
/// a locator is its bit position in every liveness bitset.
#[derive(Default, Clone)]
pub struct LocSet {
    locs: Vec<Locator>,
    index: FxHashMap<Locator, u32>,
}

impl LocSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a locator, returning its (possibly preexisting) index.
    pub fn insert(&mut self, loc: Locator) -> usize {
        match self.index.get(&loc) {
            Some(&i) => i as usize,
            None => {
                let i = self.locs.len();
                self.locs.push(loc);
                self.index.insert(loc, i as u32);
                i
            }
        }
    }

    pub fn index_of(&self, loc: Locator) -> Option<usize> {
        self.index.get(&loc).map(|&i| i as usize)
    }

    pub fn get(&self, i: usize) -> Locator {
        self.locs[i]
    }

    pub fn len(&self) -> usize {
        self.locs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Locator> + '_ {
        self.locs.iter().copied()
    }
}

// ─── Lvars manager ──────────────────────────────────────────────────────────

/// The lvar map and its interference graph for one function.
pub struct LvarsManager {
    map: LocSet,
    /// Symmetric adjacency matrix: row `i` holds the lvars `i` interferes
    /// with.
    interference: Vec<BitVec>,
    /// Calls each lvar is live across; allocation must avoid whatever
    /// those calls clobber.
    fn_interference: Vec<SmallVec<[FnId; 2]>>,
}

/// Whether a locator is an allocation candidate for `fn_id`.
pub fn is_lvar(fn_id: FnId, loc: Locator) -> bool {
    match loc.kind() {
        LocKind::Ssa(_) | LocKind::Phi(_) => true,
        LocKind::Arg(f, _) | LocKind::Return(f, _) => f == fn_id,
        _ => false,
    }
}

impl LvarsManager {
    /// Scans the graph for allocation candidates, in first-appearance
    /// order.
    pub fn new(fn_id: FnId, graph: &AsmGraph) -> Self {
        let mut map = LocSet::new();
        graph.for_each_inst(|inst| {
            for loc in [inst.arg, inst.alt] {
                if loc.is_some() && is_lvar(fn_id, loc.mem_head()) {
                    map.insert(loc.mem_head());
                }
            }
        });

        let n = map.len();
        Self {
            map,
            interference: vec![BitVec::repeat(false, n); n],
            fn_interference: vec![SmallVec::new(); n],
        }
    }

    pub fn map(&self) -> &LocSet {
        &self.map
    }

    pub fn num_lvars(&self) -> usize {
        self.map.len()
    }

    pub fn index_of(&self, loc: Locator) -> Option<usize> {
        self.map.index_of(loc)
    }

    /// Records all-pairs interference among the set bits of `live`.
    pub fn add_lvar_interferences(&mut self, live: &BitSlice) {
        for i in live.iter_ones() {
            self.interference[i] |= live;
        }
        for i in live.iter_ones() {
            self.interference[i].set(i, false);
        }
    }

    pub fn add_fn_interference(&mut self, i: usize, f: FnId) {
        let list = &mut self.fn_interference[i];
        if !list.contains(&f) {
            list.push(f);
        }
    }

    pub fn interferes(&self, a: usize, b: usize) -> bool {
        self.interference[a][b]
    }

    pub fn fn_interferes(&self, i: usize, f: FnId) -> bool {
        self.fn_interference[i].contains(&f)
    }
}
