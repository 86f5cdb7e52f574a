//! Rim placement maps
//!
//! A rim map is an immutable snapshot bound to one pool-map version. It
//! holds `R` rims (pseudo-random target permutations), a consistent-hash
//! ring over the rims, and a consistent-hash ring over target positions.
//! Objects hash onto one rim and one start position; everything else the
//! resolver does is arithmetic over those.

use crate::shuffle::ShuffleBuf;
use rimio_common::hash::{chash_search, power2_nbits, u32_hash, u64_hash};
use rimio_common::{ComponentType, Error, ObjectId, Result};
use rimio_pool::PoolMap;
use tracing::debug;

/// Minimum key-range bits per target in the consistent hash
const TARGET_BITS: u32 = 10;
/// Key-range bits reserved for domains (one million domains)
const DOMAIN_BITS: u32 = 20;
/// Maximum bits for a target hash ring
const TARGET_HASH_BITS: u32 = 45;
/// Bits for the rim hash ring (up to 8 million rims)
const RIM_HASH_BITS: u32 = 23;

/// Absorbs float rounding when converting strides to distances
const RIM_PRECISION: f64 = 0.00001;
/// Fixed-point factor for stride storage; must stay below 128K
const RIM_PRECISION_FACTOR: f64 = 100_000.0;
/// Bits consumed by the fixed-point factor
const RIM_PRECISION_BITS: u32 = 17;

const _: () = assert!(TARGET_HASH_BITS + RIM_PRECISION_BITS < 64);

/// One rim: a pseudo-random permutation of target positions
#[derive(Clone, Debug)]
pub(crate) struct Rim {
    /// Pool-wide target arena index at each rim position
    targets: Vec<u32>,
}

impl Rim {
    /// Target arena index at a rim position
    #[inline]
    pub fn pos(&self, at: usize) -> usize {
        self.targets[at] as usize
    }
}

/// Immutable placement snapshot for one pool-map version
#[derive(Clone, Debug)]
pub struct RimMap {
    version: u32,
    domain: ComponentType,
    ndomains: u32,
    ntargets: u32,
    target_hbits: u32,
    /// Hash-range distance between adjacent target positions
    stride: f64,
    rims: Vec<Rim>,
    rim_hashes: Vec<u64>,
    target_hashes: Vec<u64>,
}

impl RimMap {
    /// Build a rim map from `map` as of `version`
    ///
    /// Only components with `co_ver <= version` participate, so a rim map
    /// for an older version can be rebuilt from a newer pool map.
    pub fn build(map: &PoolMap, version: u32, nrims: u32, domain: ComponentType) -> Result<Self> {
        if nrims == 0 {
            return Err(Error::invalid_argument("rim map needs at least one rim"));
        }
        if version == 0 || version > map.version() {
            return Err(Error::invalid_argument(format!(
                "rim build version {version} outside pool map version {}",
                map.version()
            )));
        }
        if domain == ComponentType::Root || !domain.is_domain() {
            return Err(Error::invalid_argument(format!(
                "{domain} is not a fault-domain level"
            )));
        }

        let buf = ShuffleBuf::create(map, domain, version)?;
        let ndomains = buf.domains.len() as u32;
        let ntargets = buf.ntargets as u32;

        let mut rims = Vec::with_capacity(nrims as usize);
        for seed in 0..nrims {
            rims.push(Self::generate_rim(&buf, u64::from(seed)));
        }

        let dom_ntgs = ntargets / ndomains;
        let target_hbits =
            (DOMAIN_BITS + TARGET_BITS + power2_nbits(dom_ntgs)).min(TARGET_HASH_BITS);

        let range = 1u64 << target_hbits;
        let stride = range as f64 / f64::from(ntargets);
        let target_hashes = hash_ring(stride, ntargets as usize);

        let rim_range = 1u64 << RIM_HASH_BITS;
        let rim_stride = rim_range as f64 / f64::from(nrims);
        let rim_hashes = hash_ring(rim_stride, nrims as usize);

        debug!(
            version,
            nrims,
            ndomains,
            ntargets,
            target_hbits,
            "built rim map"
        );
        Ok(Self {
            version,
            domain,
            ndomains,
            ntargets,
            target_hbits,
            stride,
            rims,
            rim_hashes,
            target_hashes,
        })
    }

    /// Fill one rim by walking the shuffled domains round-robin
    fn generate_rim(buf: &ShuffleBuf, seed: u64) -> Rim {
        let mut shuffled = buf.clone();
        shuffled.shuffle(seed);

        let mut targets = Vec::with_capacity(buf.ntargets);
        let mut round = 0;
        while targets.len() < buf.ntargets {
            for dom in &shuffled.domains {
                if let Some(target) = dom.targets.get(round) {
                    targets.push(target.pos);
                }
            }
            round += 1;
        }
        Rim { targets }
    }

    /// Pool-map version this snapshot is bound to
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// Fault-domain level used for isolation
    #[must_use]
    pub const fn domain_level(&self) -> ComponentType {
        self.domain
    }

    /// Number of fault domains at build time
    #[must_use]
    pub const fn ndomains(&self) -> u32 {
        self.ndomains
    }

    /// Number of target positions on each rim
    #[must_use]
    pub const fn ntargets(&self) -> u32 {
        self.ntargets
    }

    /// Number of rims
    #[must_use]
    pub fn nrims(&self) -> u32 {
        self.rims.len() as u32
    }

    /// Hash-range distance between adjacent target positions
    #[must_use]
    pub const fn stride(&self) -> f64 {
        self.stride
    }

    /// Hash an object id onto one of the rims
    pub(crate) fn rim_for(&self, oid: ObjectId) -> &Rim {
        let key = oid.hi.wrapping_add(oid.lo);

        // Swizzle the low bytes so nearby ids spread over the ring.
        let mut hash = (key >> 32) << 32;
        hash |= (key >> 8) & 0xff;
        hash |= (key & 0xff) << 8;
        hash |= ((key >> 16) & 0xff) << 24;
        hash |= ((key >> 24) & 0xff) << 16;

        let hash = u32_hash(hash, RIM_HASH_BITS);
        let idx = chash_search(&self.rim_hashes, u64::from(hash));
        &self.rims[idx]
    }

    /// Hash an object id to its start position within a rim
    pub(crate) fn start_index(&self, oid: ObjectId) -> usize {
        let mut hash = oid.hi;
        hash ^= hash << 29;
        hash = hash.wrapping_add(hash << 11);
        hash = hash.wrapping_sub(oid.lo);

        let hash = u64_hash(hash, TARGET_HASH_BITS) & ((1u64 << self.target_hbits) - 1);
        chash_search(&self.target_hashes, hash)
    }

    /// Convert a stride to its fixed-point storage form
    #[must_use]
    pub fn stride_to_fixed(stride: f64) -> u64 {
        debug_assert!(stride < (1u64 << (64 - RIM_PRECISION_BITS)) as f64);
        (stride * RIM_PRECISION_FACTOR) as u64
    }

    /// Convert a fixed-point stride back to a float
    #[must_use]
    pub fn fixed_to_stride(fixed: u64) -> f64 {
        fixed as f64 / RIM_PRECISION_FACTOR
    }

    /// Rim distance between consecutive shards for an object stride
    pub(crate) fn shard_dist(&self, fixed_stride: u64) -> Result<i64> {
        let stride = Self::fixed_to_stride(fixed_stride);
        let dist = (stride / self.stride + RIM_PRECISION) as i64;
        if dist <= 0 {
            return Err(Error::invalid_argument(format!(
                "object stride {stride} below rim stride {}",
                self.stride
            )));
        }
        Ok(dist)
    }
}

/// Evenly spaced consistent-hash ring
fn hash_ring(stride: f64, count: usize) -> Vec<u64> {
    let mut hashes = Vec::with_capacity(count);
    let mut hash = 0f64;
    for _ in 0..count {
        hashes.push(hash as u64);
        hash += stride;
    }
    hashes
}
