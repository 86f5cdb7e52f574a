//! RimIO Erasure - Reed-Solomon coding for striped objects
//!
//! This crate provides the parity arithmetic behind erasure-coded object
//! classes: a Reed-Solomon [`ErasureCodec`] over the shards of one
//! redundancy group, and a [`StripeAggregator`] that folds epoch-stamped
//! partial-stripe writes into full-stripe parity at an aggregation epoch.

pub mod aggregate;
pub mod codec;

pub use aggregate::{AggregatedStripe, StripeAggregator};
pub use codec::{ErasureCodec, ErasureError};
