//! Remap engine
//!
//! Decides shard movement on membership change by replaying layout
//! computation: which shards must move off failed or draining targets
//! ([`RimMap::find_rebuild`]), back onto recovered targets
//! ([`RimMap::find_reint`]), or onto newly added targets
//! ([`RimMap::find_addition`]). All three are pure over a
//! (pool map, rim map) pair and return at most one destination per shard.
//!
//! Overlapping operations may produce non-disjoint entries; callers
//! deduplicate by shard id with [`dedup_remap_entries`], newest map
//! version winning.

use crate::rim::RimMap;
use crate::select::{select_spare, spare_walk};
use rimio_common::{ComponentStatus, Error, ObjectId, ObjectSchema, Rank, Result};
use rimio_pool::PoolMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One shard movement decision
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemapEntry {
    /// Shard to move
    pub shard_id: u32,
    /// Destination target
    pub rank: Rank,
    /// Pool-map version the entry was generated at
    pub version: u32,
}

/// Deduplicate remap entries by shard id, newest version winning
///
/// Entries from one call share a version; ties therefore only occur
/// between calls, where the later call's entry replaces the earlier one.
#[must_use]
pub fn dedup_remap_entries(entries: Vec<RemapEntry>) -> Vec<RemapEntry> {
    let mut newest: HashMap<u32, RemapEntry> = HashMap::with_capacity(entries.len());
    for entry in entries {
        newest
            .entry(entry.shard_id)
            .and_modify(|cur| {
                if entry.version >= cur.version {
                    *cur = entry;
                }
            })
            .or_insert(entry);
    }
    let mut out: Vec<RemapEntry> = newest.into_values().collect();
    out.sort_unstable_by_key(|e| e.shard_id);
    out
}

impl RimMap {
    /// Shards of `oid` whose target failed or started draining after
    /// `since`, with the replacement each one walks to
    ///
    /// Scans every redundancy group. A group only contributes entries when
    /// it has a coordinator (a first fully integrated shard), and, if
    /// `caller` is given, when the coordinator's rank matches it: only the
    /// group coordinator drives a rebuild, everyone else observes nothing.
    pub fn find_rebuild(
        &self,
        map: &PoolMap,
        oid: ObjectId,
        schema: &mut ObjectSchema,
        since: u32,
        caller: Option<Rank>,
        max: usize,
    ) -> Result<Vec<RemapEntry>> {
        if schema.stride == 0 {
            schema.stride = Self::stride_to_fixed(self.stride());
        }
        let dist = self.shard_dist(schema.stride)?;
        let ntargets = i64::from(self.ntargets());
        let grp_dist = i64::from(schema.grp_size + schema.nspares) * dist;

        let rim = self.rim_for(oid);
        let start = self.start_index(oid) as i64;
        let targets = map.targets();
        let version = map.version();

        let mut out = Vec::new();
        for stripe in 0..schema.grp_nr {
            let index = start + i64::from(stripe) * grp_dist;
            let mut spare = select_spare(oid, index, dist, ntargets, schema);
            let mut coordinator = None;
            let mut group = Vec::new();

            for member in 0..schema.grp_size {
                let primary = (index + i64::from(member) * dist).rem_euclid(ntargets);
                let pos = rim.pos(primary as usize);
                let tgt = &targets[pos];

                if tgt.co_status.is_upin() {
                    // The first fully integrated shard leads the group.
                    if coordinator.is_none() {
                        coordinator = Some(tgt.co_rank);
                    }
                    continue;
                }

                // The member is relocated (or will be, once its drain
                // completes); walk the spare sequence to its destination.
                let dest = spare_walk(rim, map, &mut spare, dist, ntargets)?;
                let moving = matches!(tgt.co_status, ComponentStatus::Down | ComponentStatus::Drain)
                    && tgt.co_fseq > since;
                if moving {
                    group.push(RemapEntry {
                        shard_id: stripe * schema.grp_size + member,
                        rank: targets[dest].co_rank,
                        version,
                    });
                }
            }

            if coordinator.is_some() && caller.is_none_or(|rank| coordinator == Some(rank)) {
                out.extend(group);
            }
            if out.len() >= max {
                out.truncate(max);
                break;
            }
        }
        Ok(out)
    }

    /// Shards of `oid` whose primary target came back UP after `since`
    ///
    /// Each entry names the recovered target the shard moves back to.
    pub fn find_reint(
        &self,
        map: &PoolMap,
        oid: ObjectId,
        schema: &mut ObjectSchema,
        since: u32,
        max: usize,
    ) -> Result<Vec<RemapEntry>> {
        if schema.stride == 0 {
            schema.stride = Self::stride_to_fixed(self.stride());
        }
        let dist = self.shard_dist(schema.stride)?;
        let ntargets = i64::from(self.ntargets());
        let grp_dist = i64::from(schema.grp_size + schema.nspares) * dist;

        let rim = self.rim_for(oid);
        let start = self.start_index(oid) as i64;
        let targets = map.targets();
        let version = map.version();

        let mut out = Vec::new();
        for sid in 0..schema.total_shards() {
            let stripe = sid / schema.grp_size;
            let member = sid % schema.grp_size;
            let primary = (start + i64::from(stripe) * grp_dist + i64::from(member) * dist)
                .rem_euclid(ntargets);
            let tgt = &targets[rim.pos(primary as usize)];

            if tgt.co_status == ComponentStatus::Up && tgt.co_in_ver > since {
                out.push(RemapEntry {
                    shard_id: sid,
                    rank: tgt.co_rank,
                    version,
                });
                if out.len() >= max {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Shards of `oid` that prefer a target added after `old`'s version
    ///
    /// Compares primary placements between the two snapshots; an entry is
    /// produced when the newer snapshot maps a shard onto a target that
    /// did not exist in the older one.
    pub fn find_addition(
        &self,
        old: &Self,
        map: &PoolMap,
        oid: ObjectId,
        schema: &mut ObjectSchema,
        max: usize,
    ) -> Result<Vec<RemapEntry>> {
        if old.version() > self.version() {
            return Err(Error::invalid_argument(
                "older rim map has the newer version",
            ));
        }
        if schema.stride == 0 {
            schema.stride = Self::stride_to_fixed(old.stride());
        }
        let new_dist = self.shard_dist(schema.stride)?;
        let old_dist = old.shard_dist(schema.stride)?;
        let new_n = i64::from(self.ntargets());
        let old_n = i64::from(old.ntargets());
        let new_grp = i64::from(schema.grp_size + schema.nspares) * new_dist;
        let old_grp = i64::from(schema.grp_size + schema.nspares) * old_dist;

        let new_rim = self.rim_for(oid);
        let old_rim = old.rim_for(oid);
        let new_start = self.start_index(oid) as i64;
        let old_start = old.start_index(oid) as i64;
        let targets = map.targets();
        let version = map.version();

        let mut out = Vec::new();
        for sid in 0..schema.total_shards() {
            let stripe = i64::from(sid / schema.grp_size);
            let member = i64::from(sid % schema.grp_size);

            let new_pos = (new_start + stripe * new_grp + member * new_dist).rem_euclid(new_n);
            let old_pos = (old_start + stripe * old_grp + member * old_dist).rem_euclid(old_n);
            let new_tgt = &targets[new_rim.pos(new_pos as usize)];
            let old_tgt = &targets[old_rim.pos(old_pos as usize)];

            let added = new_tgt.co_ver > old.version();
            let usable = matches!(
                new_tgt.co_status,
                ComponentStatus::Up | ComponentStatus::UpIn
            );
            if added && usable && new_tgt.co_rank != old_tgt.co_rank {
                out.push(RemapEntry {
                    shard_id: sid,
                    rank: new_tgt.co_rank,
                    version,
                });
                if out.len() >= max {
                    break;
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rimio_common::{ComponentType, ObjectClass};
    use rimio_pool::TargetStateOp;
    use rimio_pool::buf::PoolBufBuilder;

    fn pool(doms: u32, ranks: u32, targets: u32) -> PoolMap {
        let buf = PoolBufBuilder::new(1).build(1, doms, ranks, targets).unwrap();
        PoolMap::create(&buf, 1).unwrap()
    }

    fn rim(map: &PoolMap) -> RimMap {
        RimMap::build(map, map.version(), 64, ComponentType::Node).unwrap()
    }

    fn oid(i: u64) -> ObjectId {
        ObjectId::new(i.wrapping_mul(0x517c_c1b7_2722_0a95), i)
    }

    fn target_id_of(map: &PoolMap, rank: Rank) -> u32 {
        map.targets().iter().find(|t| t.co_rank == rank).unwrap().co_id
    }

    #[test]
    fn test_rebuild_one_down_s2() {
        let mut map = pool(4, 1, 4);
        let mut schema = ObjectClass::RP_4G1.schema();
        let before = rim(&map).place(&map, oid(3), &mut schema).unwrap();

        let failed = before.shard(0).unwrap().rank;
        map.target_state_update(&[target_id_of(&map, failed)], TargetStateOp::Exclude, false)
            .unwrap();

        let rim_map = rim(&map);
        let entries = rim_map
            .find_rebuild(&map, oid(3), &mut schema, 1, None, usize::MAX)
            .unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].shard_id, 0);
        assert_ne!(entries[0].rank, failed);
        assert_eq!(entries[0].version, 2);

        // The replacement is a usable target outside the surviving members.
        let survivors: Vec<Rank> = (1..4).map(|s| before.shard(s).unwrap().rank).collect();
        assert!(!survivors.contains(&entries[0].rank));
        // And it is where the resolver now puts shard 0.
        let after = rim_map.place(&map, oid(3), &mut schema).unwrap();
        assert_eq!(after.shard(0).unwrap().rank, entries[0].rank);
    }

    #[test]
    fn test_rebuild_idempotent_and_bounded() {
        let mut map = pool(4, 2, 4);
        let mut schema = ObjectClass::RP_4G2.schema();
        let before = rim(&map).place(&map, oid(7), &mut schema).unwrap();

        let failed: Vec<Rank> = vec![
            before.shard(0).unwrap().rank,
            before.shard(5).unwrap().rank,
        ];
        let ids: Vec<u32> = failed.iter().map(|&r| target_id_of(&map, r)).collect();
        map.target_state_update(&ids, TargetStateOp::Exclude, false).unwrap();

        let rim_map = rim(&map);
        let a = rim_map
            .find_rebuild(&map, oid(7), &mut schema, 1, None, usize::MAX)
            .unwrap();
        let b = rim_map
            .find_rebuild(&map, oid(7), &mut schema, 1, None, usize::MAX)
            .unwrap();
        assert_eq!(a, b);
        // No more entries than shards on failed targets.
        assert!(a.len() <= 2);
        assert!(!a.is_empty());
        for entry in &a {
            assert!(!failed.contains(&entry.rank));
        }
    }

    #[test]
    fn test_rebuild_since_filters_old_failures() {
        let mut map = pool(4, 1, 4);
        let mut schema = ObjectClass::RP_4G1.schema();
        let before = rim(&map).place(&map, oid(3), &mut schema).unwrap();

        let failed = before.shard(0).unwrap().rank;
        map.target_state_update(&[target_id_of(&map, failed)], TargetStateOp::Exclude, false)
            .unwrap();

        // From the post-failure version there is nothing new to rebuild.
        let rim_map = rim(&map);
        let entries = rim_map
            .find_rebuild(&map, oid(3), &mut schema, 2, None, usize::MAX)
            .unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_rebuild_coordinator_rule() {
        let mut map = pool(4, 1, 4);
        let mut schema = ObjectClass::RP_4G1.schema();
        let before = rim(&map).place(&map, oid(3), &mut schema).unwrap();

        let failed = before.shard(0).unwrap().rank;
        map.target_state_update(&[target_id_of(&map, failed)], TargetStateOp::Exclude, false)
            .unwrap();
        let rim_map = rim(&map);

        // Shard 0 failed, so shard 1 leads the group.
        let coordinator = before.shard(1).unwrap().rank;
        let led = rim_map
            .find_rebuild(&map, oid(3), &mut schema, 1, Some(coordinator), usize::MAX)
            .unwrap();
        assert_eq!(led.len(), 1);

        let bystander = before.shard(2).unwrap().rank;
        let observed = rim_map
            .find_rebuild(&map, oid(3), &mut schema, 1, Some(bystander), usize::MAX)
            .unwrap();
        assert!(observed.is_empty());
    }

    #[test]
    fn test_drain_produces_rebuild_entries() {
        let mut map = pool(4, 1, 4);
        let mut schema = ObjectClass::RP_4G1.schema();
        let before = rim(&map).place(&map, oid(21), &mut schema).unwrap();

        let draining = before.shard(2).unwrap().rank;
        map.target_state_update(&[target_id_of(&map, draining)], TargetStateOp::Drain, false)
            .unwrap();

        let rim_map = rim(&map);
        let entries = rim_map
            .find_rebuild(&map, oid(21), &mut schema, 1, None, usize::MAX)
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].shard_id, 2);
        assert_ne!(entries[0].rank, draining);

        // While draining, the source still owns the shard in the layout.
        let layout = rim_map.place(&map, oid(21), &mut schema).unwrap();
        assert_eq!(layout.shard(2).unwrap().rank, draining);
    }

    #[test]
    fn test_reint_returns_rebuilt_shards_s4() {
        let mut map = pool(4, 1, 4);
        let mut schema = ObjectClass::RP_4G1.schema();
        let before = rim(&map).place(&map, oid(13), &mut schema).unwrap();

        let failed = before.shard(0).unwrap().rank;
        let failed_id = target_id_of(&map, failed);
        map.target_state_update(&[failed_id], TargetStateOp::Exclude, false).unwrap();

        let rebuilt = rim(&map)
            .find_rebuild(&map, oid(13), &mut schema, 1, None, usize::MAX)
            .unwrap();
        assert_eq!(rebuilt.len(), 1);

        // Bring the target back; the same shard wants to move home.
        map.target_state_update(&[failed_id], TargetStateOp::Reint, false).unwrap();
        let rim_map = rim(&map);
        let reint = rim_map
            .find_reint(&map, oid(13), &mut schema, 2, usize::MAX)
            .unwrap();

        assert_eq!(reint.len(), 1);
        assert_eq!(reint[0].shard_id, rebuilt[0].shard_id);
        assert_eq!(reint[0].rank, failed);

        // From before the failure, the reintegration is equally visible.
        let reint = rim_map
            .find_reint(&map, oid(13), &mut schema, 1, usize::MAX)
            .unwrap();
        assert_eq!(reint.len(), 1);
    }

    #[test]
    fn test_addition_moves_toward_new_targets() {
        let mut map = pool(4, 1, 4);
        let old_rim = rim(&map);

        let root = *map.root().comp();
        let grp = *map.domains(ComponentType::Grp).next().unwrap().comp();
        let delta = PoolBufBuilder::extension(2, 1000, 100, 100)
            .build_under(root, grp, 4, 1, 4)
            .unwrap();
        map.extend(2, &delta).unwrap();
        let new_ids: Vec<u32> = map
            .targets()
            .iter()
            .filter(|t| t.co_ver == 2)
            .map(|t| t.co_id)
            .collect();
        map.target_state_update(&new_ids, TargetStateOp::Extend, false).unwrap();
        map.target_state_update(&new_ids, TargetStateOp::AddIn, false).unwrap();

        let new_rim = RimMap::build(&map, map.version(), 64, ComponentType::Node).unwrap();

        let mut moved = 0;
        for i in 0..256 {
            let mut schema = ObjectClass::RP_4G1.schema();
            let entries = new_rim
                .find_addition(&old_rim, &map, oid(i), &mut schema, usize::MAX)
                .unwrap();
            moved += entries.len();
            for entry in &entries {
                // Every destination is one of the extended targets.
                assert!(entry.rank.get() >= 100);
            }
        }
        // Doubling the pool pulls roughly half the shards; anything in a
        // wide band proves movement happens and stays bounded.
        let frac = moved as f64 / (256.0 * 4.0);
        assert!(frac > 0.15 && frac < 0.85, "moved fraction {frac:.2}");
    }

    #[test]
    fn test_dedup_last_writer_wins() {
        let entries = vec![
            RemapEntry { shard_id: 0, rank: Rank::new(1), version: 2 },
            RemapEntry { shard_id: 1, rank: Rank::new(2), version: 2 },
            RemapEntry { shard_id: 0, rank: Rank::new(3), version: 3 },
        ];
        let deduped = dedup_remap_entries(entries);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].rank, Rank::new(3));
        assert_eq!(deduped[1].rank, Rank::new(2));
    }
}
