//! Configuration types for RimIO
//!
//! This module defines the configuration structures consumed by the
//! placement service and the CLI.

use crate::types::{ComponentType, ObjectClass};
use serde::{Deserialize, Serialize};

/// Root configuration for RimIO
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Placement engine configuration
    pub placement: PlacementConfig,
    /// Pool attributes reported by query
    pub pool: PoolAttrs,
}

/// Placement engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlacementConfig {
    /// Number of rims in a rim map
    pub nrims: u32,
    /// Fault-domain level placement isolates across
    pub domain: ComponentType,
    /// Object class used when the caller does not specify one
    pub default_class: ObjectClass,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            nrims: 64,
            domain: ComponentType::Node,
            default_class: ObjectClass::EC_4P2G1,
        }
    }
}

/// Pool ownership attributes
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PoolAttrs {
    /// Owning user id
    pub uid: u32,
    /// Owning group id
    pub gid: u32,
    /// Access mode bits
    pub mode: u32,
}

impl Default for PoolAttrs {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            mode: 0o750,
        }
    }
}
