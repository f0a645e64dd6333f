//! Interning of immutable ROM data.
//!
//! Identical byte sequences produced while compiling different functions
//! collapse to one array. The intern table is the one structure shared
//! across workers: lookups take the service-wide lock, while each entry's
//! usage bitsets sit behind their own lock so membership updates don't
//! serialize against interning. A caller never holds both locks at once.

use std::sync::{Arc, Mutex};

use bitvec::vec::BitVec;
use rustc_hash::FxHashMap;

use crate::fns::{FnId, GroupId};
use crate::ir::Id;
use crate::locator::Locator;

pub struct RomArrayMarker;
/// Handle to an interned ROM array.
pub type RomArrayId = Id<RomArrayMarker>;

/// An immutable sequence of locator-valued bytes destined for ROM.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RomArray {
    pub data: Vec<Locator>,
}

#[derive(Default)]
struct RomArrayUse {
    used_by_fns: BitVec,
    used_by_group_data: BitVec,
}

/// Per-array usage metadata, each entry under its own lock.
#[derive(Default)]
pub struct RomArrayMeta {
    used: Mutex<RomArrayUse>,
}

impl RomArrayMeta {
    fn mark(bits: &mut BitVec, index: usize) {
        if bits.len() <= index {
            bits.resize(index + 1, false);
        }
        bits.set(index, true);
    }

    pub fn mark_used_by_fn(&self, f: FnId) {
        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        Self::mark(&mut used.used_by_fns, f.index());
    }

    pub fn mark_used_by_group_data(&self, g: GroupId) {
        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        Self::mark(&mut used.used_by_group_data, g.index());
    }

    pub fn used_by_fn(&self, f: FnId) -> bool {
        let used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        used.used_by_fns.get(f.index()).map(|b| *b).unwrap_or(false)
    }

    pub fn used_by_group_data(&self, g: GroupId) -> bool {
        let used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        used.used_by_group_data
            .get(g.index())
            .map(|b| *b)
            .unwrap_or(false)
    }
}

struct Intern {
    map: FxHashMap<RomArray, RomArrayId>,
    metas: Vec<Arc<RomArrayMeta>>,
}

/// The ROM-array intern service. One instance is shared by every worker
/// of a compilation.
pub struct RomArrays {
    intern: Mutex<Intern>,
}

impl Default for RomArrays {
    fn default() -> Self {
        Self::new()
    }
}

impl RomArrays {
    pub fn new() -> Self {
        Self {
            intern: Mutex::new(Intern {
                map: FxHashMap::default(),
                metas: Vec::new(),
            }),
        }
    }

    /// Interns `array` (or finds the existing entry equal to it), records
    /// the user, and returns a locator addressing it at `offset`.
    pub fn lookup(
        &self,
        fn_id: Option<FnId>,
        group_data: Option<GroupId>,
        array: RomArray,
        offset: u16,
    ) -> Locator {
        let (id, meta) = {
            let mut intern = self.intern.lock().unwrap_or_else(|e| e.into_inner());
            let id = match intern.map.get(&array) {
                Some(&id) => id,
                None => {
                    let id: RomArrayId = Id::new(intern.metas.len() as u32);
                    intern.metas.push(Arc::new(RomArrayMeta::default()));
                    intern.map.insert(array, id);
                    id
                }
            };
            (id, Arc::clone(&intern.metas[id.index()]))
        };

        // The intern lock is released; only the entry's own lock is held
        // below.
        if let Some(f) = fn_id {
            meta.mark_used_by_fn(f);
        }
        if let Some(g) = group_data {
            meta.mark_used_by_group_data(g);
        }

        Locator::rom_array(id, offset)
    }

    pub fn meta(&self, id: RomArrayId) -> Arc<RomArrayMeta> {
        let intern = self.intern.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&intern.metas[id.index()])
    }

    pub fn len(&self) -> usize {
        let intern = self.intern.lock().unwrap_or_else(|e| e.into_inner());
        intern.metas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
