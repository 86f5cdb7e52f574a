//! In-memory pool map
//!
//! The pool map is an arena-backed tree: domains (root, grouping domains,
//! fault domains, server ranks) in one depth-first array, targets in
//! another. Parent/child links are arena indices rather than owned
//! references, and iteration order is arena order, so walks are
//! reproducible and the tree has no reference cycles.

use crate::buf::PoolBuf;
use crate::component::Component;
use rimio_common::{ComponentStatus, ComponentType, Error, PoolAttrs, Rank, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// One domain of the pool-map tree with its arena links
#[derive(Clone, Debug)]
pub struct Domain {
    comp: Component,
    parent: Option<u32>,
    children: Vec<u32>,
    /// All targets in this domain's subtree, in arena order
    targets: Vec<u32>,
}

impl Domain {
    /// The domain's component record
    #[must_use]
    pub const fn comp(&self) -> &Component {
        &self.comp
    }

    /// Arena indices of all targets in the subtree
    #[must_use]
    pub fn target_indices(&self) -> &[u32] {
        &self.targets
    }

    /// Arena indices of the direct child domains
    #[must_use]
    pub fn child_indices(&self) -> &[u32] {
        &self.children
    }

    pub(crate) const fn comp_mut(&mut self) -> &mut Component {
        &mut self.comp
    }

    pub(crate) fn targets_snapshot(&self) -> Vec<u32> {
        self.targets.clone()
    }
}

/// Rebuild activity derived from target states
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebuildStatus {
    /// No data movement pending
    Idle,
    /// At least one target is rebuilding, draining or reintegrating
    Busy,
}

/// Pool query result for the enclosing service
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PoolQuery {
    /// Owning user id
    pub uid: u32,
    /// Owning group id
    pub gid: u32,
    /// Access mode bits
    pub mode: u32,
    /// Current map version
    pub map_version: u32,
    /// Number of targets out of service (DOWN or DOWNOUT)
    pub n_disabled: u32,
    /// Whether any rebuild/drain/reintegration is pending
    pub rebuild_status: RebuildStatus,
}

/// The versioned cluster topology
#[derive(Clone, Debug)]
pub struct PoolMap {
    version: u32,
    attrs: PoolAttrs,
    domains: Vec<Domain>,
    targets: Vec<Component>,
    /// Rank-domain arena index of each target
    target_parents: Vec<u32>,
    /// Sorted (co_id, arena index) for targets
    target_ids: Vec<(u32, u32)>,
    /// Sorted (co_id, arena index) for domains
    domain_ids: Vec<(u32, u32)>,
    /// Sorted (co_rank, arena index) for rank-level domains
    rank_ids: Vec<(u32, u32)>,
}

impl PoolMap {
    /// Build a pool map from a parsed buffer
    ///
    /// `version` becomes the map version and must cover every component in
    /// the buffer.
    pub fn create(buf: &PoolBuf, version: u32) -> Result<Self> {
        if version == 0 || version < buf.max_version() {
            return Err(Error::InvalidVersion {
                given: version,
                current: buf.max_version(),
            });
        }

        let mut map = Self {
            version,
            attrs: PoolAttrs::default(),
            domains: Vec::with_capacity(buf.domain_count()),
            targets: Vec::with_capacity(buf.target_count()),
            target_parents: Vec::with_capacity(buf.target_count()),
            target_ids: Vec::new(),
            domain_ids: Vec::new(),
            rank_ids: Vec::new(),
        };
        map.splice(None, buf.components(), 0)?;
        map.rebuild_indexes()?;

        debug!(
            version,
            domains = map.domains.len(),
            targets = map.targets.len(),
            "created pool map"
        );
        Ok(map)
    }

    /// Splice a subtree of `components` starting at `at` under `parent`,
    /// returning the record index past the subtree
    fn splice(&mut self, parent: Option<u32>, components: &[Component], at: usize) -> Result<usize> {
        let comp = components[at];

        if comp.co_type == ComponentType::Target {
            let tidx = self.targets.len() as u32;
            let Some(rank_dom) = parent else {
                return Err(Error::invalid_format("target without a rank domain"));
            };
            self.targets.push(comp);
            self.target_parents.push(rank_dom);
            // Record the target on every ancestor domain.
            let mut dom = Some(rank_dom);
            while let Some(didx) = dom {
                self.domains[didx as usize].targets.push(tidx);
                dom = self.domains[didx as usize].parent;
            }
            return Ok(at + 1);
        }

        let didx = self.domains.len() as u32;
        self.domains.push(Domain {
            comp,
            parent,
            children: Vec::new(),
            targets: Vec::new(),
        });
        if let Some(pidx) = parent {
            self.domains[pidx as usize].children.push(didx);
        }

        let mut next = at + 1;
        for _ in 0..comp.co_nr {
            next = self.splice(Some(didx), components, next)?;
        }
        Ok(next)
    }

    /// Rebuild the sorted id indexes, rejecting duplicates
    fn rebuild_indexes(&mut self) -> Result<()> {
        self.target_ids = self
            .targets
            .iter()
            .enumerate()
            .map(|(i, c)| (c.co_id, i as u32))
            .collect();
        self.target_ids.sort_unstable();
        self.domain_ids = self
            .domains
            .iter()
            .enumerate()
            .map(|(i, d)| (d.comp.co_id, i as u32))
            .collect();
        self.domain_ids.sort_unstable();

        let dup_id = self
            .target_ids
            .windows(2)
            .chain(self.domain_ids.windows(2))
            .any(|w| w[0].0 == w[1].0);
        let mut ids: Vec<u32> = self
            .target_ids
            .iter()
            .map(|(id, _)| *id)
            .chain(self.domain_ids.iter().map(|(id, _)| *id))
            .collect();
        ids.sort_unstable();
        if dup_id || ids.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::invalid_format("duplicate component id"));
        }

        let mut ranks: Vec<u32> = self.targets.iter().map(|c| c.co_rank.get()).collect();
        ranks.sort_unstable();
        if ranks.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::invalid_format("duplicate target rank"));
        }

        self.rank_ids = self
            .domains
            .iter()
            .enumerate()
            .filter(|(_, d)| d.comp.co_type == ComponentType::Rank)
            .map(|(i, d)| (d.comp.co_rank.get(), i as u32))
            .collect();
        self.rank_ids.sort_unstable();
        if self.rank_ids.windows(2).any(|w| w[0].0 == w[1].0) {
            return Err(Error::invalid_format("duplicate rank-domain rank"));
        }
        Ok(())
    }

    /// Current map version
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    pub(crate) const fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    /// Pool ownership attributes
    #[must_use]
    pub const fn attrs(&self) -> PoolAttrs {
        self.attrs
    }

    /// Set pool ownership attributes
    pub const fn set_attrs(&mut self, attrs: PoolAttrs) {
        self.attrs = attrs;
    }

    /// All targets in arena order
    #[must_use]
    pub fn targets(&self) -> &[Component] {
        &self.targets
    }

    /// Number of targets in the map
    #[must_use]
    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub(crate) fn target_mut(&mut self, idx: usize) -> &mut Component {
        &mut self.targets[idx]
    }

    pub(crate) fn domain_mut(&mut self, idx: usize) -> &mut Domain {
        &mut self.domains[idx]
    }

    /// The root domain
    #[must_use]
    pub fn root(&self) -> &Domain {
        &self.domains[0]
    }

    /// Domains of one tree level, in arena (depth-first) order
    pub fn domains(&self, level: ComponentType) -> impl Iterator<Item = &Domain> {
        self.domains.iter().filter(move |d| d.comp.co_type == level)
    }

    /// Number of domains at one tree level
    #[must_use]
    pub fn domain_count(&self, level: ComponentType) -> usize {
        self.domains(level).count()
    }

    /// Find a target by component id: `(arena index, component)`
    #[must_use]
    pub fn find_target(&self, id: u32) -> Option<(usize, &Component)> {
        let at = self.target_ids.binary_search_by_key(&id, |(id, _)| *id).ok()?;
        let idx = self.target_ids[at].1 as usize;
        Some((idx, &self.targets[idx]))
    }

    /// Find a domain by component id: `(arena index, domain)`
    #[must_use]
    pub fn find_domain(&self, id: u32) -> Option<(usize, &Domain)> {
        let at = self.domain_ids.binary_search_by_key(&id, |(id, _)| *id).ok()?;
        let idx = self.domain_ids[at].1 as usize;
        Some((idx, &self.domains[idx]))
    }

    /// Find the rank-level domain with the given rank
    #[must_use]
    pub fn find_domain_by_rank(&self, rank: Rank) -> Option<&Domain> {
        let at = self
            .rank_ids
            .binary_search_by_key(&rank.get(), |(rank, _)| *rank)
            .ok()?;
        Some(&self.domains[self.rank_ids[at].1 as usize])
    }

    /// Rank-domain arena index owning a target
    pub(crate) fn target_parent(&self, tidx: usize) -> u32 {
        self.target_parents[tidx]
    }

    /// Number of targets out of service
    #[must_use]
    pub fn disabled_count(&self) -> usize {
        self.targets.iter().filter(|t| t.co_status.is_disabled()).count()
    }

    /// Pool query snapshot
    #[must_use]
    pub fn query(&self) -> PoolQuery {
        let moving = ComponentStatus::Down as u8
            | ComponentStatus::Drain as u8
            | ComponentStatus::Up as u8;
        let busy = self.targets.iter().any(|t| t.co_status.matches(moving));
        PoolQuery {
            uid: self.attrs.uid,
            gid: self.attrs.gid,
            mode: self.attrs.mode,
            map_version: self.version,
            n_disabled: self.disabled_count() as u32,
            rebuild_status: if busy { RebuildStatus::Busy } else { RebuildStatus::Idle },
        }
    }

    /// Splice an extension buffer into the map, advancing the version
    ///
    /// The delta's root is matched by type; every other domain is matched
    /// by component id. Domains with known ids are descended into, unknown
    /// subtrees are appended. Existing components are never modified, so
    /// all existing ids survive.
    pub fn extend(&mut self, version: u32, buf: &PoolBuf) -> Result<()> {
        if version <= self.version {
            return Err(Error::InvalidVersion {
                given: version,
                current: self.version,
            });
        }

        let components = buf.components();
        let root = components[0];
        if root.co_type != ComponentType::Root {
            return Err(Error::invalid_format("extension buffer does not start at root"));
        }
        for comp in components {
            let known = match comp.co_type {
                ComponentType::Root => true,
                ComponentType::Target => self.find_target(comp.co_id).is_some(),
                _ => self.find_domain(comp.co_id).is_some(),
            };
            if !known && (comp.co_status != ComponentStatus::New || comp.co_ver != version) {
                return Err(Error::invalid_format(
                    "extension component is not NEW at the extension version",
                ));
            }
        }

        // Splice into a scratch copy so a malformed delta leaves the map
        // untouched.
        let mut next_map = self.clone();
        let mut next = 1;
        for _ in 0..root.co_nr {
            next = next_map.extend_subtree(0, components, next)?;
        }
        if next != components.len() {
            return Err(Error::invalid_format("trailing extension records"));
        }

        next_map.rebuild_indexes()?;
        next_map.version = version;
        *self = next_map;
        info!(version, targets = self.targets.len(), "extended pool map");
        Ok(())
    }

    /// Merge one delta subtree under the existing domain `parent`
    fn extend_subtree(&mut self, parent: u32, components: &[Component], at: usize) -> Result<usize> {
        let comp = components[at];

        if comp.co_type == ComponentType::Target {
            if self.find_target(comp.co_id).is_some() {
                return Err(Error::invalid_format(format!(
                    "extension target {} already exists",
                    comp.co_id
                )));
            }
            return self.splice(Some(parent), components, at);
        }

        let known = self
            .find_domain(comp.co_id)
            .map(|(didx, dom)| (didx as u32, dom.comp.co_type));
        match known {
            Some((didx, co_type)) => {
                if co_type != comp.co_type {
                    return Err(Error::invalid_format(format!(
                        "extension domain {} changes type",
                        comp.co_id
                    )));
                }
                let mut next = at + 1;
                for _ in 0..comp.co_nr {
                    next = self.extend_subtree(didx, components, next)?;
                }
                Ok(next)
            }
            None => self.splice(Some(parent), components, at),
        }
    }

    /// Serialize the current tree back into a pool buffer
    pub fn to_buf(&self) -> Result<PoolBuf> {
        let mut components = Vec::with_capacity(self.domains.len() + self.targets.len());
        self.serialize_domain(0, &mut components);
        PoolBuf::new(components)
    }

    fn serialize_domain(&self, didx: usize, out: &mut Vec<Component>) {
        let dom = &self.domains[didx];
        let co_nr = if dom.comp.co_type == ComponentType::Rank {
            dom.targets.len() as u32
        } else {
            dom.children.len() as u32
        };
        out.push(Component { co_nr, ..dom.comp });

        if dom.comp.co_type == ComponentType::Rank {
            for &tidx in &dom.targets {
                out.push(self.targets[tidx as usize]);
            }
        } else {
            for &cidx in &dom.children {
                self.serialize_domain(cidx as usize, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::PoolBufBuilder;

    fn small_map() -> PoolMap {
        let buf = PoolBufBuilder::new(1).build(1, 4, 2, 4).unwrap();
        PoolMap::create(&buf, 1).unwrap()
    }

    #[test]
    fn test_create_counts() {
        let map = small_map();
        assert_eq!(map.version(), 1);
        assert_eq!(map.target_count(), 32);
        assert_eq!(map.domain_count(ComponentType::Node), 4);
        assert_eq!(map.domain_count(ComponentType::Rank), 8);
        assert_eq!(map.root().target_indices().len(), 32);
    }

    #[test]
    fn test_subtree_target_lists() {
        let map = small_map();
        for dom in map.domains(ComponentType::Node) {
            assert_eq!(dom.target_indices().len(), 8);
        }
        for dom in map.domains(ComponentType::Rank) {
            assert_eq!(dom.target_indices().len(), 4);
        }
    }

    #[test]
    fn test_find_target_and_domain() {
        let map = small_map();
        let (idx, target) = map.find_target(map.targets()[5].co_id).unwrap();
        assert_eq!(idx, 5);
        assert_eq!(target.co_type, ComponentType::Target);
        assert!(map.find_target(9999).is_none());

        let rank = map.domains(ComponentType::Rank).next().unwrap().comp().co_rank;
        let dom = map.find_domain_by_rank(rank).unwrap();
        assert_eq!(dom.comp().co_type, ComponentType::Rank);
    }

    #[test]
    fn test_query_idle() {
        let map = small_map();
        let query = map.query();
        assert_eq!(query.map_version, 1);
        assert_eq!(query.n_disabled, 0);
        assert_eq!(query.rebuild_status, RebuildStatus::Idle);
    }

    #[test]
    fn test_to_buf_roundtrip() {
        let map = small_map();
        let buf = map.to_buf().unwrap();
        let again = PoolMap::create(&buf, map.version()).unwrap();
        assert_eq!(again.target_count(), map.target_count());
        assert_eq!(
            again.targets().iter().map(|t| t.co_id).collect::<Vec<_>>(),
            map.targets().iter().map(|t| t.co_id).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_extend_appends_domains() {
        let mut map = small_map();
        let root = *map.root().comp();
        let grp = *map.domains(ComponentType::Grp).next().unwrap().comp();

        let delta = PoolBufBuilder::extension(2, 1000, 32, 100)
            .build_under(root, grp, 2, 2, 4)
            .unwrap();
        map.extend(2, &delta).unwrap();

        assert_eq!(map.version(), 2);
        assert_eq!(map.domain_count(ComponentType::Node), 6);
        assert_eq!(map.target_count(), 48);
        // New targets arrive NEW and are excluded from disabled counting.
        assert_eq!(map.query().n_disabled, 0);
    }

    #[test]
    fn test_extend_rejects_stale_version() {
        let mut map = small_map();
        let root = *map.root().comp();
        let grp = *map.domains(ComponentType::Grp).next().unwrap().comp();
        let delta = PoolBufBuilder::extension(1, 1000, 32, 100)
            .build_under(root, grp, 1, 1, 1)
            .unwrap();
        assert!(matches!(
            map.extend(1, &delta),
            Err(Error::InvalidVersion { .. })
        ));
    }

    #[test]
    fn test_extend_rejects_duplicate_target() {
        let mut map = small_map();
        let root = *map.root().comp();
        let grp = *map.domains(ComponentType::Grp).next().unwrap().comp();
        // Reuses target ids 0.. which already exist.
        let delta = PoolBufBuilder::extension(2, 1000, 0, 100)
            .build_under(root, grp, 1, 1, 2)
            .unwrap();
        assert!(map.extend(2, &delta).is_err());
    }

    #[test]
    fn test_create_rejects_version_below_components() {
        let buf = PoolBufBuilder::new(3).build(1, 2, 1, 2).unwrap();
        assert!(PoolMap::create(&buf, 2).is_err());
        assert!(PoolMap::create(&buf, 3).is_ok());
    }
}
