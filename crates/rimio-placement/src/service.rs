//! Per-pool placement service
//!
//! Binds a pool map to its current rim map behind the locking the engine
//! requires: mutators take the pool writer lock, then rebuild the rim map
//! off the critical path and swap it in; readers clone the current
//! `Arc<RimMap>` and keep whichever snapshot they started with.

use crate::remap::RemapEntry;
use crate::rim::RimMap;
use crate::select::ObjLayout;
use dashmap::DashMap;
use parking_lot::RwLock;
use rimio_common::{Error, ObjectId, ObjectSchema, PlacementConfig, Rank, Result};
use rimio_pool::{PoolBuf, PoolMap, PoolQuery, TargetStateOp};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Placement handle for one pool
pub struct PlacementService {
    uuid: Uuid,
    config: PlacementConfig,
    pool: RwLock<PoolMap>,
    rim: RwLock<Arc<RimMap>>,
}

impl PlacementService {
    /// Create a service over an existing pool map
    pub fn create(uuid: Uuid, map: PoolMap, config: PlacementConfig) -> Result<Arc<Self>> {
        let rim = RimMap::build(&map, map.version(), config.nrims, config.domain)?;
        info!(%uuid, version = map.version(), "placement service created");
        Ok(Arc::new(Self {
            uuid,
            config,
            pool: RwLock::new(map),
            rim: RwLock::new(Arc::new(rim)),
        }))
    }

    /// Pool UUID this service is keyed by
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Placement configuration
    #[must_use]
    pub const fn config(&self) -> &PlacementConfig {
        &self.config
    }

    /// The current rim-map snapshot
    #[must_use]
    pub fn rim_map(&self) -> Arc<RimMap> {
        self.rim.read().clone()
    }

    /// Run a closure under the pool reader lock
    pub fn with_pool<R>(&self, f: impl FnOnce(&PoolMap) -> R) -> R {
        f(&self.pool.read())
    }

    /// Pool query snapshot
    #[must_use]
    pub fn query(&self) -> PoolQuery {
        self.pool.read().query()
    }

    /// Resolve the layout of an object against the current snapshot pair
    pub fn place(&self, oid: ObjectId, schema: &mut ObjectSchema) -> Result<ObjLayout> {
        let rim = self.rim_map();
        let pool = self.pool.read();
        rim.place(&pool, oid, schema)
    }

    /// Shards to move off targets failed or draining since `since`
    pub fn find_rebuild(
        &self,
        oid: ObjectId,
        schema: &mut ObjectSchema,
        since: u32,
        caller: Option<Rank>,
    ) -> Result<Vec<RemapEntry>> {
        let rim = self.rim_map();
        let pool = self.pool.read();
        rim.find_rebuild(&pool, oid, schema, since, caller, usize::MAX)
    }

    /// Shards to move back onto targets recovered since `since`
    pub fn find_reint(
        &self,
        oid: ObjectId,
        schema: &mut ObjectSchema,
        since: u32,
    ) -> Result<Vec<RemapEntry>> {
        let rim = self.rim_map();
        let pool = self.pool.read();
        rim.find_reint(&pool, oid, schema, since, usize::MAX)
    }

    /// Shards preferring targets added since the map version `since`
    ///
    /// Rebuilds a rim snapshot at `since` to diff against; callers doing
    /// bulk scans should hold onto the old snapshot instead.
    pub fn find_addition(
        &self,
        oid: ObjectId,
        schema: &mut ObjectSchema,
        since: u32,
    ) -> Result<Vec<RemapEntry>> {
        let rim = self.rim_map();
        let pool = self.pool.read();
        let old = RimMap::build(&pool, since, self.config.nrims, self.config.domain)?;
        rim.find_addition(&old, &pool, oid, schema, usize::MAX)
    }

    /// Mark targets failed
    ///
    /// With `targets` unset, every target under the given ranks is
    /// excluded and rank-level eviction is applied.
    pub fn exclude(&self, ranks: &[Rank], targets: Option<&[u32]>) -> Result<u32> {
        self.apply(ranks, targets, TargetStateOp::Exclude, targets.is_none())
    }

    /// Start draining targets
    pub fn drain(&self, ranks: &[Rank], targets: Option<&[u32]>) -> Result<u32> {
        self.apply(ranks, targets, TargetStateOp::Drain, false)
    }

    /// Start reintegrating targets
    pub fn reintegrate(&self, ranks: &[Rank], targets: Option<&[u32]>) -> Result<u32> {
        self.apply(ranks, targets, TargetStateOp::Reint, false)
    }

    /// Activate the NEW targets under the given ranks
    pub fn extend(&self, ranks: &[Rank]) -> Result<u32> {
        self.apply(ranks, None, TargetStateOp::Extend, false)
    }

    /// Complete integration of UP targets
    pub fn add_in(&self, ranks: &[Rank], targets: Option<&[u32]>) -> Result<u32> {
        self.apply(ranks, targets, TargetStateOp::AddIn, false)
    }

    /// Complete exclusion of DOWN/DRAIN targets
    pub fn exclude_out(&self, ranks: &[Rank], targets: Option<&[u32]>) -> Result<u32> {
        self.apply(ranks, targets, TargetStateOp::ExcludeOut, false)
    }

    /// Splice an extension buffer into the pool map
    pub fn extend_map(&self, version: u32, buf: &PoolBuf) -> Result<()> {
        {
            let mut pool = self.pool.write();
            pool.extend(version, buf)?;
        }
        self.refresh()
    }

    /// Apply one state op to the resolved target set
    fn apply(
        &self,
        ranks: &[Rank],
        targets: Option<&[u32]>,
        op: TargetStateOp,
        exclude_rank: bool,
    ) -> Result<u32> {
        let version = {
            let mut pool = self.pool.write();
            let ids = match targets {
                Some(ids) => ids.to_vec(),
                None => {
                    let mut ids = Vec::new();
                    for &rank in ranks {
                        let dom = pool.find_domain_by_rank(rank).ok_or_else(|| {
                            Error::not_found(format!("rank {rank}"))
                        })?;
                        ids.extend(
                            dom.target_indices()
                                .iter()
                                .map(|&t| pool.targets()[t as usize].co_id),
                        );
                    }
                    ids
                }
            };
            pool.target_state_update(&ids, op, exclude_rank)?
        };

        if version == 0 {
            debug!(?op, "state update was a no-op");
            return Ok(0);
        }
        self.refresh()?;
        Ok(version)
    }

    /// Rebuild the rim map from the current pool map and swap it in
    ///
    /// Built outside the rim lock so in-flight readers keep their snapshot
    /// until the pointer swap.
    fn refresh(&self) -> Result<()> {
        let new_rim = {
            let pool = self.pool.read();
            RimMap::build(&pool, pool.version(), self.config.nrims, self.config.domain)?
        };
        let version = new_rim.version();
        *self.rim.write() = Arc::new(new_rim);
        debug!(version, "rim map swapped");
        Ok(())
    }
}

/// Process-wide registry of placement services, keyed by pool UUID
///
/// Lifetimes are refcount-owned: the registry holds one reference, every
/// connected user another, and dropping the last one tears the service
/// down.
#[derive(Default)]
pub struct PlacementRegistry {
    pools: DashMap<Uuid, Arc<PlacementService>>,
}

impl PlacementRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service, replacing any previous handle for the pool
    pub fn insert(&self, service: Arc<PlacementService>) {
        self.pools.insert(service.uuid(), service);
    }

    /// Look up the service for a pool
    #[must_use]
    pub fn get(&self, uuid: Uuid) -> Option<Arc<PlacementService>> {
        self.pools.get(&uuid).map(|s| s.clone())
    }

    /// Drop the registry's reference to a pool
    pub fn remove(&self, uuid: Uuid) -> Option<Arc<PlacementService>> {
        self.pools.remove(&uuid).map(|(_, s)| s)
    }

    /// Number of registered pools
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Whether no pools are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}
