//! Core type definitions for RimIO
//!
//! This module defines the fundamental types shared across the pool map and
//! the placement engine: object identifiers, object classes and their
//! decoded schemas, and the component vocabulary (types, status codes,
//! flags) of the pool-map tree.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique identifier for an object: a 128-bit value in two 64-bit halves
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    /// High 64 bits
    pub hi: u64,
    /// Low 64 bits
    pub lo: u64,
}

impl ObjectId {
    /// Create an object id from its two halves
    #[must_use]
    pub const fn new(hi: u64, lo: u64) -> Self {
        Self { hi, lo }
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({:#x}.{:#x})", self.hi, self.lo)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}.{:x}", self.hi, self.lo)
    }
}

/// Externally visible identifier of a storage target
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
)]
#[display("{_0}")]
pub struct Rank(u32);

impl Rank {
    /// Create a rank from its raw value
    #[must_use]
    pub const fn new(rank: u32) -> Self {
        Self(rank)
    }

    /// Raw rank value
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rank({})", self.0)
    }
}

impl From<Rank> for u64 {
    fn from(rank: Rank) -> Self {
        Self::from(rank.0)
    }
}

/// Pool-map component type tag
///
/// The numeric values are part of the wire format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ComponentType {
    /// Tree root
    Root = 0,
    /// Pool-level grouping domain
    Grp = 1,
    /// Fault domain used for placement isolation by default
    Node = 2,
    /// Server rank, the immediate parent of targets
    Rank = 3,
    /// Storage target
    Target = 4,
}

impl ComponentType {
    /// Check whether this type is a domain (anything above a target)
    #[must_use]
    pub const fn is_domain(self) -> bool {
        !matches!(self, Self::Target)
    }
}

impl TryFrom<u16> for ComponentType {
    type Error = crate::Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Root),
            1 => Ok(Self::Grp),
            2 => Ok(Self::Node),
            3 => Ok(Self::Rank),
            4 => Ok(Self::Target),
            _ => Err(crate::Error::invalid_format(format!(
                "unknown component type: {value}"
            ))),
        }
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => write!(f, "root"),
            Self::Grp => write!(f, "grp"),
            Self::Node => write!(f, "node"),
            Self::Rank => write!(f, "rank"),
            Self::Target => write!(f, "target"),
        }
    }
}

/// Pool-map component status
///
/// Encoded as single bits so status sets can be tested with a mask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ComponentStatus {
    /// Added to the map but not yet activated by an extend
    #[default]
    New = 0x01,
    /// Activated, data is flowing in (extend or reintegration in progress)
    Up = 0x02,
    /// Fully integrated: owns data and accepts new writes
    UpIn = 0x04,
    /// Failed, rebuild pending or in progress
    Down = 0x08,
    /// Excluded, all shards moved away
    DownOut = 0x10,
    /// Graceful exclude: still owns shards until drained
    Drain = 0x20,
}

impl ComponentStatus {
    /// Check membership against a bit mask of statuses
    #[must_use]
    pub const fn matches(self, mask: u8) -> bool {
        (self as u8) & mask != 0
    }

    /// Target currently owns shards in resolved layouts
    ///
    /// DRAIN still owns its shards until the drain completes.
    #[must_use]
    pub const fn owns_shards(self) -> bool {
        matches!(self, Self::UpIn | Self::Drain)
    }

    /// Target may serve reads at the epoch being read
    #[must_use]
    pub const fn is_readable(self) -> bool {
        matches!(self, Self::UpIn | Self::Drain | Self::Down)
    }

    /// Target accepts newly placed shards (spare-walk destinations)
    #[must_use]
    pub const fn is_upin(self) -> bool {
        matches!(self, Self::UpIn)
    }

    /// Target is out of service (counted as disabled in queries)
    #[must_use]
    pub const fn is_disabled(self) -> bool {
        matches!(self, Self::Down | Self::DownOut)
    }
}

impl TryFrom<u8> for ComponentStatus {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::New),
            0x02 => Ok(Self::Up),
            0x04 => Ok(Self::UpIn),
            0x08 => Ok(Self::Down),
            0x10 => Ok(Self::DownOut),
            0x20 => Ok(Self::Drain),
            _ => Err(crate::Error::invalid_format(format!(
                "unknown component status: {value:#x}"
            ))),
        }
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "NEW"),
            Self::Up => write!(f, "UP"),
            Self::UpIn => write!(f, "UPIN"),
            Self::Down => write!(f, "DOWN"),
            Self::DownOut => write!(f, "DOWNOUT"),
            Self::Drain => write!(f, "DRAIN"),
        }
    }
}

/// Per-component flag bits
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into,
)]
pub struct ComponentFlags(u8);

impl ComponentFlags {
    /// No flags set
    pub const NONE: Self = Self(0);
    /// The component reached DOWNOUT from DOWN (rebuild completed)
    pub const DOWN_TO_OUT: Self = Self(0x01);
    /// The component reached UP from DOWN (reintegration in progress)
    pub const DOWN_TO_UP: Self = Self(0x02);

    /// Check whether all bits of `other` are set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`
    #[must_use]
    pub const fn insert(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Raw flag bits
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }
}

/// Object redundancy class
///
/// Class names follow the `EC_<k>P<p>G<g>` / `RP_<r>G<g>` convention:
/// `EC_8P2G2` is 8 data + 2 parity shards per group, 2 groups; `RP_4G1` is
/// 4-way replication, 1 group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectClass {
    /// Replication: `replicas` copies per group
    Replicated {
        /// Copies per redundancy group
        replicas: u16,
        /// Number of redundancy groups
        groups: u16,
    },
    /// Erasure coding: `data` + `parity` shards per group
    Erasure {
        /// Data shards per group (k)
        data: u16,
        /// Parity shards per group (p)
        parity: u16,
        /// Number of redundancy groups
        groups: u16,
    },
}

impl ObjectClass {
    /// `RP_2G2`
    pub const RP_2G2: Self = Self::Replicated { replicas: 2, groups: 2 };
    /// `RP_3G1`
    pub const RP_3G1: Self = Self::Replicated { replicas: 3, groups: 1 };
    /// `RP_4G1`
    pub const RP_4G1: Self = Self::Replicated { replicas: 4, groups: 1 };
    /// `RP_4G2`
    pub const RP_4G2: Self = Self::Replicated { replicas: 4, groups: 2 };
    /// `EC_4P2G1`
    pub const EC_4P2G1: Self = Self::Erasure { data: 4, parity: 2, groups: 1 };
    /// `EC_8P2G2`
    pub const EC_8P2G2: Self = Self::Erasure { data: 8, parity: 2, groups: 2 };

    /// Create a replicated class
    #[must_use]
    pub const fn replicated(replicas: u16, groups: u16) -> Self {
        Self::Replicated { replicas, groups }
    }

    /// Create an erasure-coded class
    #[must_use]
    pub const fn erasure(data: u16, parity: u16, groups: u16) -> Self {
        Self::Erasure { data, parity, groups }
    }

    /// Shards per redundancy group
    #[must_use]
    pub const fn group_size(&self) -> u32 {
        match self {
            Self::Replicated { replicas, .. } => *replicas as u32,
            Self::Erasure { data, parity, .. } => *data as u32 + *parity as u32,
        }
    }

    /// Number of redundancy groups
    #[must_use]
    pub const fn group_count(&self) -> u32 {
        match self {
            Self::Replicated { groups, .. } | Self::Erasure { groups, .. } => *groups as u32,
        }
    }

    /// Total shards of an object of this class
    #[must_use]
    pub const fn total_shards(&self) -> u32 {
        self.group_size() * self.group_count()
    }

    /// Decode into the placement schema consumed by the resolver
    #[must_use]
    pub const fn schema(&self) -> ObjectSchema {
        let (data, parity) = match self {
            Self::Replicated { replicas, .. } => (*replicas as u32, 0),
            Self::Erasure { data, parity, .. } => (*data as u32, *parity as u32),
        };
        ObjectSchema {
            grp_size: self.group_size(),
            data,
            parity,
            grp_nr: self.group_count(),
            nspares: 1,
            spare_skip: 0,
            stride: 0,
        }
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replicated { replicas, groups } => write!(f, "RP_{replicas}G{groups}"),
            Self::Erasure { data, parity, groups } => write!(f, "EC_{data}P{parity}G{groups}"),
        }
    }
}

/// Error parsing an object class name
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid object class: {0}")]
pub struct ObjectClassParseError(String);

impl FromStr for ObjectClass {
    type Err = ObjectClassParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ObjectClassParseError(s.to_string());

        if let Some(rest) = s.strip_prefix("RP_") {
            let (r, g) = rest.split_once('G').ok_or_else(err)?;
            let replicas = r.parse().map_err(|_| err())?;
            let groups = g.parse().map_err(|_| err())?;
            if replicas == 0 || groups == 0 {
                return Err(err());
            }
            return Ok(Self::Replicated { replicas, groups });
        }

        if let Some(rest) = s.strip_prefix("EC_") {
            let (k, rest) = rest.split_once('P').ok_or_else(err)?;
            let (p, g) = rest.split_once('G').ok_or_else(err)?;
            let data = k.parse().map_err(|_| err())?;
            let parity = p.parse().map_err(|_| err())?;
            let groups = g.parse().map_err(|_| err())?;
            if data == 0 || parity == 0 || groups == 0 {
                return Err(err());
            }
            return Ok(Self::Erasure { data, parity, groups });
        }

        Err(err())
    }
}

/// Decoded placement schema
///
/// The resolver consumes only this; the class-to-schema mapping is fixed by
/// [`ObjectClass::schema`]. `stride` is the fixed-point rim distance of the
/// object, recorded back on first placement so later placements at other
/// map versions keep the same spacing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSchema {
    /// Shards per redundancy group (G)
    pub grp_size: u32,
    /// Data shards per group (replica count for replication)
    pub data: u32,
    /// Parity shards per group (0 for replication)
    pub parity: u32,
    /// Number of redundancy groups / stripes (S)
    pub grp_nr: u32,
    /// Spare positions reserved after each group on the rim
    pub nspares: u32,
    /// Per-object randomization bound for spare preference
    pub spare_skip: u32,
    /// Fixed-point rim stride; 0 until the first placement records it
    pub stride: u64,
}

impl ObjectSchema {
    /// Total shards of the object
    #[must_use]
    pub const fn total_shards(&self) -> u32 {
        self.grp_size * self.grp_nr
    }

    /// Stripe index owning a shard id
    #[must_use]
    pub const fn shard_stripe(&self, sid: u32) -> u32 {
        sid / self.grp_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_display() {
        let oid = ObjectId::new(0xab, 0xcd);
        assert_eq!(oid.to_string(), "ab.cd");
    }

    #[test]
    fn test_status_predicates() {
        assert!(ComponentStatus::UpIn.owns_shards());
        assert!(ComponentStatus::Drain.owns_shards());
        assert!(!ComponentStatus::Down.owns_shards());
        assert!(ComponentStatus::Down.is_readable());
        assert!(!ComponentStatus::DownOut.is_readable());
        assert!(ComponentStatus::Down.is_disabled());
        assert!(ComponentStatus::DownOut.is_disabled());
        assert!(!ComponentStatus::Drain.is_disabled());
    }

    #[test]
    fn test_status_mask() {
        let mask = ComponentStatus::Down as u8 | ComponentStatus::DownOut as u8;
        assert!(ComponentStatus::Down.matches(mask));
        assert!(!ComponentStatus::UpIn.matches(mask));
    }

    #[test]
    fn test_class_schema() {
        let schema = ObjectClass::EC_8P2G2.schema();
        assert_eq!(schema.grp_size, 10);
        assert_eq!(schema.grp_nr, 2);
        assert_eq!(schema.total_shards(), 20);

        let schema = ObjectClass::RP_4G1.schema();
        assert_eq!(schema.grp_size, 4);
        assert_eq!(schema.parity, 0);
        assert_eq!(schema.total_shards(), 4);
    }

    #[test]
    fn test_class_parse_roundtrip() {
        for class in [
            ObjectClass::RP_2G2,
            ObjectClass::RP_4G1,
            ObjectClass::EC_4P2G1,
            ObjectClass::EC_8P2G2,
        ] {
            let parsed: ObjectClass = class.to_string().parse().unwrap();
            assert_eq!(parsed, class);
        }
        assert!("EC_8G2".parse::<ObjectClass>().is_err());
        assert!("RP_0G1".parse::<ObjectClass>().is_err());
        assert!("bogus".parse::<ObjectClass>().is_err());
    }

    #[test]
    fn test_shard_stripe() {
        let schema = ObjectClass::RP_2G2.schema();
        assert_eq!(schema.shard_stripe(0), 0);
        assert_eq!(schema.shard_stripe(1), 0);
        assert_eq!(schema.shard_stripe(2), 1);
        assert_eq!(schema.shard_stripe(3), 1);
    }
}
