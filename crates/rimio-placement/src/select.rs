//! Placement resolver
//!
//! Given an object id and schema, emits the ordered shard-to-target
//! mapping. Shards of one redundancy group sit at consecutive stride
//! positions on the object's rim; groups are separated by reserved spare
//! positions. A shard whose primary target no longer owns data walks the
//! object's spare sequence until it finds a fully integrated target.

use crate::rim::{Rim, RimMap};
use rimio_common::{Error, ObjectId, ObjectSchema, Rank, Result};
use rimio_pool::PoolMap;
use serde::{Deserialize, Serialize};

/// Prime stirred into the object id for spare selection
pub const GOLDEN_PRIME_64: u64 = 0x9e37_ffff_fffc_0001;

/// Shard selection opcode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectMode {
    /// All shards from the cursor onward
    #[default]
    All,
    /// Only the shard at the cursor
    Cur,
    /// The cursor's redundancy group
    GrpCur,
    /// The redundancy group after the cursor's
    GrpNext,
    /// Reserved
    GrpPrev,
    /// Reserved
    GrpSplit,
}

/// One resolved shard
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardPlacement {
    /// Rank of the target holding the shard
    pub rank: Rank,
    /// Logical shard position in the object
    pub shard_id: u32,
    /// Fixed-point object stride
    pub stride: u64,
}

/// Resolved layout of a whole object
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObjLayout {
    /// Shards per redundancy group
    pub grp_size: u32,
    /// Number of redundancy groups
    pub grp_nr: u32,
    /// Shard placements in shard-id order
    pub shards: Vec<ShardPlacement>,
}

impl ObjLayout {
    /// Placement of one shard
    #[must_use]
    pub fn shard(&self, shard_id: u32) -> Option<&ShardPlacement> {
        self.shards.iter().find(|s| s.shard_id == shard_id)
    }

    /// Whether any shard lives on the given rank
    #[must_use]
    pub fn contains_rank(&self, rank: Rank) -> bool {
        self.shards.iter().any(|s| s.rank == rank)
    }

    /// Ranks in shard order
    #[must_use]
    pub fn ranks(&self) -> Vec<Rank> {
        self.shards.iter().map(|s| s.rank).collect()
    }
}

/// Pick the first spare position for a redundancy group
///
/// `first` is the rim position of the group's first shard. The object id
/// decides the walk direction and how many whole group spans to skip, so
/// different objects sharing a group region prefer different spares.
/// Intermediate values are deliberately signed; the result wraps into
/// `[0, ntargets)`.
pub(crate) fn select_spare(
    oid: ObjectId,
    first: i64,
    dist: i64,
    ntargets: i64,
    schema: &ObjectSchema,
) -> i64 {
    let hash = (oid.hi ^ oid.lo).wrapping_mul(GOLDEN_PRIME_64);
    let skip = hash % u64::from(schema.spare_skip + 1);
    let sign: i64 = if hash & 1 == 0 { -1 } else { 1 };

    let mut first = first;
    for _ in 0..skip {
        first += sign * dist * i64::from(schema.grp_size + schema.nspares);
    }
    if sign > 0 {
        first += i64::from(schema.grp_size) * dist;
    } else {
        first -= i64::from(schema.nspares) * dist;
    }
    first.rem_euclid(ntargets)
}

/// Advance the spare cursor one stride
pub(crate) fn next_spare(spare: i64, dist: i64, ntargets: i64) -> i64 {
    (spare + dist).rem_euclid(ntargets)
}

/// Walk the spare sequence to the next fully integrated target
///
/// Returns the target arena index and leaves `spare` past the used
/// position. Errors when a full lap finds nothing usable.
pub(crate) fn spare_walk(
    rim: &Rim,
    map: &PoolMap,
    spare: &mut i64,
    dist: i64,
    ntargets: i64,
) -> Result<usize> {
    let mut steps = 0i64;
    loop {
        let pos = rim.pos(spare.rem_euclid(ntargets) as usize);
        *spare = next_spare(*spare, dist, ntargets);
        if map.targets()[pos].co_status.is_upin() {
            return Ok(pos);
        }
        steps += 1;
        if steps > ntargets {
            return Err(Error::invalid_argument("no usable target on the rim"));
        }
    }
}

impl RimMap {
    /// Resolve the full layout of an object
    ///
    /// Records the rim stride into `schema` on the object's first
    /// placement so later resolutions keep the same spacing.
    pub fn place(
        &self,
        map: &PoolMap,
        oid: ObjectId,
        schema: &mut ObjectSchema,
    ) -> Result<ObjLayout> {
        let total = schema.total_shards() as usize;
        let mut shards = Vec::with_capacity(total);
        self.place_into(map, oid, schema, SelectMode::All, None, None, total, &mut shards)?;
        Ok(ObjLayout {
            grp_size: schema.grp_size,
            grp_nr: schema.grp_nr,
            shards,
        })
    }

    /// Resolve up to `limit` shard placements into `out`
    ///
    /// `cursor` is the shard id the selection mode is relative to; without
    /// one the whole object is walked from shard 0. `start` overrides the
    /// hashed rim start position. Returns the number of placements
    /// appended.
    #[allow(clippy::too_many_arguments)]
    pub fn place_into(
        &self,
        map: &PoolMap,
        oid: ObjectId,
        schema: &mut ObjectSchema,
        mode: SelectMode,
        cursor: Option<u32>,
        start: Option<u32>,
        limit: usize,
        out: &mut Vec<ShardPlacement>,
    ) -> Result<usize> {
        if matches!(mode, SelectMode::GrpPrev | SelectMode::GrpSplit) {
            return Err(Error::invalid_argument(format!("reserved select mode {mode:?}")));
        }
        if schema.grp_size == 0 || schema.grp_nr == 0 {
            return Err(Error::invalid_argument("empty schema"));
        }
        if schema.grp_size > self.ndomains() {
            return Err(Error::invalid_argument(format!(
                "group size {} exceeds {} fault domains",
                schema.grp_size,
                self.ndomains()
            )));
        }

        if schema.stride == 0 {
            schema.stride = Self::stride_to_fixed(self.stride());
        }
        let dist = self.shard_dist(schema.stride)?;
        let ntargets = i64::from(self.ntargets());
        let grp_dist = i64::from(schema.grp_size + schema.nspares) * dist;

        let mut limit = limit;
        let (mut sid, stripe0, mut member) = match cursor {
            None => (0, 0, 0),
            Some(cur) => {
                let stripe = cur / schema.grp_size;
                let member = cur % schema.grp_size;
                match mode {
                    SelectMode::All => (cur, stripe, member),
                    SelectMode::Cur => {
                        limit = 1;
                        (cur, stripe, member)
                    }
                    SelectMode::GrpCur => {
                        limit = limit.min(schema.grp_size as usize);
                        (cur - member, stripe, 0)
                    }
                    SelectMode::GrpNext => {
                        limit = limit.min(schema.grp_size as usize);
                        (cur + schema.grp_size - member, stripe + 1, 0)
                    }
                    SelectMode::GrpPrev | SelectMode::GrpSplit => unreachable!(),
                }
            }
        };

        let rim = self.rim_for(oid);
        let mut index = start.map_or_else(|| self.start_index(oid) as i64, i64::from);
        index += i64::from(stripe0) * grp_dist;

        let targets = map.targets();
        let mut written = 0;
        let mut stripe = stripe0;
        while stripe < schema.grp_nr && limit > 0 {
            let mut spare = select_spare(oid, index, dist, ntargets, schema);

            while member < schema.grp_size && limit > 0 {
                let primary = (index + i64::from(member) * dist).rem_euclid(ntargets);
                let mut pos = rim.pos(primary as usize);
                if !targets[pos].co_status.owns_shards() {
                    pos = spare_walk(rim, map, &mut spare, dist, ntargets)?;
                }

                out.push(ShardPlacement {
                    rank: targets[pos].co_rank,
                    shard_id: sid,
                    stride: schema.stride,
                });
                sid += 1;
                written += 1;
                limit -= 1;
                member += 1;
            }
            index += grp_dist;
            member = 0;
            stripe += 1;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rimio_common::{ComponentType, ObjectClass};
    use rimio_pool::TargetStateOp;
    use rimio_pool::buf::PoolBufBuilder;
    use std::collections::HashMap;

    fn pool(doms: u32, ranks: u32, targets: u32) -> PoolMap {
        let buf = PoolBufBuilder::new(1).build(1, doms, ranks, targets).unwrap();
        PoolMap::create(&buf, 1).unwrap()
    }

    fn rim(map: &PoolMap) -> RimMap {
        RimMap::build(map, map.version(), 64, ComponentType::Node).unwrap()
    }

    fn oid(i: u64) -> ObjectId {
        ObjectId::new(i.wrapping_mul(0x9e37_79b9), i.wrapping_mul(7919))
    }

    #[test]
    fn test_placement_deterministic() {
        let map = pool(4, 2, 4);
        let rim_map = rim(&map);

        for i in 0..64 {
            let mut s1 = ObjectClass::EC_4P2G1.schema();
            let mut s2 = ObjectClass::EC_4P2G1.schema();
            let a = rim_map.place(&map, oid(i), &mut s1).unwrap();
            let b = rim_map.place(&map, oid(i), &mut s2).unwrap();
            assert_eq!(a.ranks(), b.ranks());
            assert_eq!(s1.stride, s2.stride);
        }
    }

    #[test]
    fn test_placement_unique_targets() {
        let map = pool(16, 2, 4);
        let rim_map = rim(&map);

        for i in 0..256 {
            let mut schema = ObjectClass::EC_8P2G2.schema();
            let layout = rim_map.place(&map, oid(i), &mut schema).unwrap();
            assert_eq!(layout.shards.len(), 20);

            let mut ranks = layout.ranks();
            ranks.sort_unstable();
            ranks.dedup();
            assert_eq!(ranks.len(), 20, "duplicate target for object {i}");
        }
    }

    #[test]
    fn test_group_members_on_distinct_domains() {
        let map = pool(16, 2, 4);
        let rim_map = rim(&map);
        // Builder assigns target ranks depth-first: 8 per fault domain.
        let dom_of = |rank: Rank| rank.get() / 8;

        for i in 0..256 {
            let mut schema = ObjectClass::EC_8P2G2.schema();
            let layout = rim_map.place(&map, oid(i), &mut schema).unwrap();
            for grp in layout.shards.chunks(schema.grp_size as usize) {
                let mut doms: Vec<u32> = grp.iter().map(|s| dom_of(s.rank)).collect();
                doms.sort_unstable();
                doms.dedup();
                assert_eq!(doms.len(), grp.len(), "colocated group for object {i}");
            }
        }
    }

    #[test]
    fn test_width_exceeding_domains_rejected() {
        let map = pool(4, 2, 4);
        let rim_map = rim(&map);
        let mut schema = ObjectClass::EC_8P2G2.schema(); // group of 10 > 4 domains
        assert!(matches!(
            rim_map.place(&map, oid(1), &mut schema),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_reserved_modes_rejected() {
        let map = pool(4, 2, 4);
        let rim_map = rim(&map);
        for mode in [SelectMode::GrpPrev, SelectMode::GrpSplit] {
            let mut schema = ObjectClass::RP_2G2.schema();
            let mut out = Vec::new();
            let err = rim_map
                .place_into(&map, oid(1), &mut schema, mode, Some(0), None, 16, &mut out)
                .unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)));
        }
    }

    #[test]
    fn test_select_modes() {
        let map = pool(4, 2, 4);
        let rim_map = rim(&map);
        let mut schema = ObjectClass::RP_2G2.schema();
        let full = rim_map.place(&map, oid(9), &mut schema).unwrap();

        // Cur returns exactly the cursor shard.
        let mut out = Vec::new();
        let n = rim_map
            .place_into(&map, oid(9), &mut schema, SelectMode::Cur, Some(3), None, 16, &mut out)
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(out[0].shard_id, 3);
        assert_eq!(out[0].rank, full.shard(3).unwrap().rank);

        // GrpCur clips to the cursor's group.
        let mut out = Vec::new();
        let n = rim_map
            .place_into(&map, oid(9), &mut schema, SelectMode::GrpCur, Some(3), None, 16, &mut out)
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(out[0].shard_id, 2);
        assert_eq!(out[1].shard_id, 3);

        // GrpNext advances to the following group.
        let mut out = Vec::new();
        let n = rim_map
            .place_into(&map, oid(9), &mut schema, SelectMode::GrpNext, Some(0), None, 16, &mut out)
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(out[0].shard_id, 2);
        assert_eq!(out[0].rank, full.shard(2).unwrap().rank);
    }

    #[test]
    fn test_down_target_replaced_by_upin() {
        let mut map = pool(4, 1, 4);
        let rim_map = rim(&map);
        let mut schema = ObjectClass::RP_4G1.schema();
        let before = rim_map.place(&map, oid(5), &mut schema).unwrap();

        // Fail the target holding shard 0.
        let failed = before.shard(0).unwrap().rank;
        let failed_id = map
            .targets()
            .iter()
            .find(|t| t.co_rank == failed)
            .unwrap()
            .co_id;
        map.target_state_update(&[failed_id], TargetStateOp::Exclude, false).unwrap();

        let rim_map = RimMap::build(&map, map.version(), 64, ComponentType::Node).unwrap();
        let after = rim_map.place(&map, oid(5), &mut schema).unwrap();

        assert!(!after.contains_rank(failed));
        for shard in &after.shards {
            let tgt = map.targets().iter().find(|t| t.co_rank == shard.rank).unwrap();
            assert!(tgt.co_status.owns_shards());
        }
        // Untouched shards stay put.
        for sid in 1..4 {
            assert_eq!(
                after.shard(sid).unwrap().rank,
                before.shard(sid).unwrap().rank
            );
        }
    }

    #[test]
    fn test_draining_target_keeps_its_shards() {
        let mut map = pool(4, 1, 4);
        let rim_map = rim(&map);
        let mut schema = ObjectClass::RP_4G1.schema();
        let before = rim_map.place(&map, oid(11), &mut schema).unwrap();

        let draining = before.shard(0).unwrap().rank;
        let draining_id = map
            .targets()
            .iter()
            .find(|t| t.co_rank == draining)
            .unwrap()
            .co_id;
        map.target_state_update(&[draining_id], TargetStateOp::Drain, false).unwrap();

        let rim_map = RimMap::build(&map, map.version(), 64, ComponentType::Node).unwrap();
        let after = rim_map.place(&map, oid(11), &mut schema).unwrap();
        assert_eq!(after.ranks(), before.ranks());
    }

    #[test]
    fn test_balance_s1() {
        // 16 domains x 8 ranks x 8 targets = 1024 targets, 1024 objects of
        // EC_8P2G2: per-target shard-count deviation must stay under half
        // the mean.
        use rand::{Rng, SeedableRng};

        let map = pool(16, 8, 8);
        let rim_map = rim(&map);
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);

        let mut counts: HashMap<Rank, u64> = HashMap::new();
        for _ in 0..1024 {
            let mut schema = ObjectClass::EC_8P2G2.schema();
            let id = ObjectId::new(rng.r#gen(), rng.r#gen());
            let layout = rim_map.place(&map, id, &mut schema).unwrap();
            for shard in &layout.shards {
                *counts.entry(shard.rank).or_default() += 1;
            }
        }

        let total: u64 = counts.values().sum();
        assert_eq!(total, 1024 * 20);
        let mean = total as f64 / 1024.0;
        let var = map
            .targets()
            .iter()
            .map(|t| {
                let c = *counts.get(&t.co_rank).unwrap_or(&0) as f64;
                (c - mean) * (c - mean)
            })
            .sum::<f64>()
            / 1024.0;
        let sigma = var.sqrt();
        assert!(
            sigma < 0.5 * mean,
            "placement imbalance: sigma {sigma:.2}, mean {mean:.2}"
        );
    }

    #[test]
    fn test_spare_selection_in_range() {
        let mut schema = ObjectClass::RP_4G1.schema();
        for skip in [0, 3, 7] {
            schema.spare_skip = skip;
            for i in 0..512 {
                let spare = select_spare(oid(i), 7, 1, 16, &schema);
                assert!((0..16).contains(&spare));
                assert_eq!(spare, select_spare(oid(i), 7, 1, 16, &schema));
                let next = next_spare(spare, 1, 16);
                assert!((0..16).contains(&next));
            }
        }
    }

    #[test]
    fn test_spare_skip_spreads_preference() {
        // A nonzero skip factor must let different objects prefer
        // different spare regions for the same group position.
        let mut schema = ObjectClass::RP_4G1.schema();
        schema.spare_skip = 3;
        let mut seen: Vec<i64> = (0..512)
            .map(|i| select_spare(oid(i), 40, 1, 128, &schema))
            .collect();
        seen.sort_unstable();
        seen.dedup();
        assert!(seen.len() > 2);
    }
}
