//! Per-function summaries consumed by the core's analyses.
//!
//! The front end computes these; the core only reads them. `ir_reads` /
//! `ir_writes` index global members, `precheck_group_vars` indexes variable
//! groups (used by mode calls, whose data flow is resolved before entry).

use bitvec::vec::BitVec;

use crate::ir::Id;
use crate::locator::Locator;

pub struct FnMarker;
/// Handle to a function's summary in [`Fns`].
pub type FnId = Id<FnMarker>;

pub struct GmemberMarker;
/// Handle to a global memory member.
pub type GmemberId = Id<GmemberMarker>;

pub struct GroupMarker;
/// Handle to a variable group.
pub type GroupId = Id<GroupMarker>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnClass {
    /// An ordinary function.
    Fn,
    /// A mode: a top-level state the program jumps into. Its global
    /// data flow is prechecked per group rather than summarized per member.
    Mode,
}

/// One function's precomputed interface summary.
pub struct FnInfo {
    pub fclass: FnClass,
    /// True when the function's IR neither reads nor writes anything
    /// observable; calls to it are removable when their results are unused.
    pub io_pure: bool,
    /// Global members the function's IR may read, by gmember index.
    pub ir_reads: BitVec,
    /// Global members the function's IR may write, by gmember index.
    pub ir_writes: BitVec,
    /// For modes: groups whose variables are live across entry.
    pub precheck_group_vars: BitVec,
    /// Parameter locators that are actually referenced anywhere.
    pub referenced_params: Vec<Locator>,
}

impl FnInfo {
    pub fn new(fclass: FnClass) -> Self {
        Self {
            fclass,
            io_pure: false,
            ir_reads: BitVec::new(),
            ir_writes: BitVec::new(),
            precheck_group_vars: BitVec::new(),
            referenced_params: Vec::new(),
        }
    }

    pub fn ir_io_pure(&self) -> bool {
        self.io_pure
    }

    pub fn reads_gmember(&self, g: GmemberId) -> bool {
        self.ir_reads.get(g.index()).map(|b| *b).unwrap_or(false)
    }

    pub fn writes_gmember(&self, g: GmemberId) -> bool {
        self.ir_writes.get(g.index()).map(|b| *b).unwrap_or(false)
    }

    pub fn prechecks_group(&self, g: GroupId) -> bool {
        self.precheck_group_vars
            .get(g.index())
            .map(|b| *b)
            .unwrap_or(false)
    }
}

/// One global member's placement.
pub struct GmemberInfo {
    pub group: GroupId,
}

/// Registry of function summaries and global-member metadata.
///
/// Owned by the compilation driver; every core pass that needs callee
/// information borrows it.
#[derive(Default)]
pub struct Fns {
    fns: Vec<FnInfo>,
    gmembers: Vec<GmemberInfo>,
    group_count: u32,
}

impl Fns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_fn(&mut self, info: FnInfo) -> FnId {
        let id = Id::new(self.fns.len() as u32);
        self.fns.push(info);
        id
    }

    pub fn add_group(&mut self) -> GroupId {
        let id = Id::new(self.group_count);
        self.group_count += 1;
        id
    }

    pub fn add_gmember(&mut self, group: GroupId) -> GmemberId {
        let id = Id::new(self.gmembers.len() as u32);
        self.gmembers.push(GmemberInfo { group });
        id
    }

    pub fn info(&self, f: FnId) -> &FnInfo {
        &self.fns[f.index()]
    }

    pub fn info_mut(&mut self, f: FnId) -> &mut FnInfo {
        &mut self.fns[f.index()]
    }

    pub fn gmember_group(&self, g: GmemberId) -> GroupId {
        self.gmembers[g.index()].group
    }
}
