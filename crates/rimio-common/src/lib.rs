//! RimIO Common - Shared types and utilities
//!
//! This crate provides the common vocabulary of the placement engine:
//! object identifiers, object classes and schemas, component status codes,
//! error definitions, and the hash primitives every layout computation is
//! built on.

pub mod config;
pub mod error;
pub mod hash;
pub mod types;

pub use config::{Config, PlacementConfig, PoolAttrs};
pub use error::{Error, Result};
pub use types::*;
