//! Mid-to-back-end optimization core for an ahead-of-time compiler
//! targeting a 6502-family CPU.
//!
//! The front end hands over typed, lowered SSA; instruction selection
//! (external) turns it into a pseudo-instruction stream. This crate owns
//! what happens in between and after:
//!
//! - the SSA representation and its two dead-code passes
//!   ([`o_remove_unused_ssa`]),
//! - the assembly control-flow graph: construction from the linear stream,
//!   block-level optimization, path-cover layout, and linearization
//!   ([`AsmGraph`]),
//! - backward liveness driving local-variable interference
//!   ([`AsmGraph::build_lvars`]) and speculative-store resolution
//!   ([`AsmGraph::remove_maybes`]),
//! - the shared ROM-array interner ([`RomArrays`]).
//!
//! The output is a flat, labeled instruction vector handed to the
//! emitter; byte encoding, linking, and banking happen elsewhere.

pub mod asm;
pub mod asm_graph;
pub mod fns;
pub mod ir;
pub mod liveness;
pub mod locator;
pub mod lvar;
pub mod peephole;
pub mod rom_array;
pub mod ssa_opt;
pub mod worklist;

pub use asm::{AsmInst, Op};
pub use asm_graph::{switch_table_for, AsmGraph, AsmGraphError, SwitchTable, SwitchTables};
pub use fns::{FnClass, FnId, FnInfo, Fns, GmemberId, GroupId};
pub use ir::{CfgId, Ir, SsaId, SsaOp, SsaValue};
pub use locator::{LocKind, Locator};
pub use lvar::LvarsManager;
pub use rom_array::{RomArray, RomArrays};
pub use ssa_opt::{o_remove_no_effect, o_remove_unused_linked, o_remove_unused_ssa};
