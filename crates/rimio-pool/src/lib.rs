//! RimIO Pool - The versioned cluster topology placement reads
//!
//! The pool map is a tree of components (root, grouping domains, fault
//! domains, server ranks, storage targets), each carrying a status and the
//! version bookkeeping that makes layouts replayable: the version a
//! component joined at, its failure sequence, and its in/out sequences.
//!
//! The map is built from a serialized pool buffer ([`buf::PoolBuf`]),
//! mutated only through [`map::PoolMap::extend`] and the atomic
//! [`map::PoolMap::target_state_update`], and read by the placement engine
//! through immutable snapshots.

pub mod buf;
pub mod component;
pub mod map;
pub mod transition;

pub use buf::{PoolBuf, PoolBufBuilder, swap_pool_buf};
pub use component::{COMPONENT_RECORD_SIZE, Component};
pub use map::{Domain, PoolMap, PoolQuery, RebuildStatus};
pub use transition::TargetStateOp;
