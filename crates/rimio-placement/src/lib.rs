//! RimIO Placement - Deterministic object-to-target layout
//!
//! The placement engine maps an object identifier plus a redundancy schema
//! to an ordered list of storage targets, and decides on membership change
//! which shards must move and where to.
//!
//! # Structure
//!
//! A [`RimMap`] is an immutable snapshot bound to one pool-map version. It
//! holds `R` *rims*: pseudo-random permutations of all targets, built from
//! a fault-domain aware shuffle so that striding through a rim visits
//! distinct domains. An object hashes to one rim and to a start index on
//! it; redundancy groups are contiguous runs at a fixed stride, with spare
//! positions reserved between groups for failure substitution.
//!
//! The same (pool map, rim map) pair drives four pure computations:
//!
//! - [`RimMap::place`] - resolve the current layout
//! - [`RimMap::find_rebuild`] - shards to move off failed/draining targets
//! - [`RimMap::find_reint`] - shards to move back to recovered targets
//! - [`RimMap::find_addition`] - shards that prefer newly added targets
//!
//! [`PlacementService`] wires a pool map and its current rim map together
//! behind the reader/writer locking the engine requires, and
//! [`PlacementRegistry`] hands out per-pool service handles.

pub mod remap;
pub mod rim;
pub mod select;
pub mod service;
mod shuffle;

pub use remap::{RemapEntry, dedup_remap_entries};
pub use rim::RimMap;
pub use select::{GOLDEN_PRIME_64, ObjLayout, SelectMode, ShardPlacement};
pub use service::{PlacementRegistry, PlacementService};
