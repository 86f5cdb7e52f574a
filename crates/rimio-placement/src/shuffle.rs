//! Fault-domain shuffle buffer
//!
//! Scratch structure behind rim construction. For one build version it
//! groups the pool's targets by fault domain, then reorders both the
//! domains and the targets inside each domain by hashed rank, version run
//! by version run. Sorting version-major and interleaving each newer run
//! into the already-merged prefix keeps the relative order of older
//! components stable, which is what bounds data movement when the pool
//! grows.
//!
//! The bit mixes feeding the 37-bit hash are a durability contract, like
//! the hash constants themselves.

use rimio_common::hash::u64_hash;
use rimio_common::{ComponentType, Error, Rank, Result};
use rimio_pool::PoolMap;
use std::cmp::Ordering;

/// One target inside the shuffle buffer
#[derive(Clone, Copy, Debug)]
pub(crate) struct ShuffleTarget {
    /// Pool-wide index into the target arena
    pub pos: u32,
    ver: u32,
    rank: Rank,
}

/// One fault domain with its version-filtered targets
#[derive(Clone, Debug)]
pub(crate) struct ShuffleDomain {
    ver: u32,
    rank: Rank,
    pub targets: Vec<ShuffleTarget>,
}

/// Scratch buffer for reshuffling domains and targets
#[derive(Clone, Debug)]
pub(crate) struct ShuffleBuf {
    pub domains: Vec<ShuffleDomain>,
    pub ntargets: usize,
}

impl ShuffleBuf {
    /// Collect the domains of `level` and their targets present at
    /// `version`
    pub fn create(map: &PoolMap, level: ComponentType, version: u32) -> Result<Self> {
        let mut domains = Vec::new();
        let mut ntargets = 0;

        for dom in map.domains(level) {
            if dom.comp().co_ver > version {
                continue;
            }
            let targets: Vec<ShuffleTarget> = dom
                .target_indices()
                .iter()
                .map(|&pos| (pos, &map.targets()[pos as usize]))
                .filter(|(_, t)| t.co_ver <= version)
                .map(|(pos, t)| ShuffleTarget {
                    pos,
                    ver: t.co_ver,
                    rank: t.co_rank,
                })
                .collect();
            ntargets += targets.len();
            domains.push(ShuffleDomain {
                ver: dom.comp().co_ver,
                rank: dom.comp().co_rank,
                targets,
            });
        }

        if domains.is_empty() || ntargets == 0 {
            return Err(Error::invalid_argument(format!(
                "no {level} domains at version {version}"
            )));
        }
        Ok(Self { domains, ntargets })
    }

    /// Reorder the buffer for one rim seed
    ///
    /// Guaranteed to produce the same pseudo-random order for all versions:
    /// components added later are only ever woven into the existing order,
    /// never allowed to reorder it.
    pub fn shuffle(&mut self, seed: u64) {
        self.domains.sort_by_key(|d| d.ver);
        for dom in &mut self.domains {
            shuffle_targets(dom, seed);
        }

        let mut doms = std::mem::take(&mut self.domains);
        let mut merged: Vec<ShuffleDomain> = Vec::with_capacity(doms.len());
        while !doms.is_empty() {
            let ver = doms[0].ver;
            let split = doms.iter().position(|d| d.ver != ver).unwrap_or(doms.len());
            let mut run: Vec<ShuffleDomain> = doms.drain(..split).collect();
            run.sort_by(|a, b| dom_shuffle_cmp(a, b, seed));
            merged = interleave(merged, run);
        }
        self.domains = merged;
    }
}

/// Sort one domain's targets by hashed rank, version run by version run
fn shuffle_targets(dom: &mut ShuffleDomain, seed: u64) {
    dom.targets.sort_by_key(|t| t.ver);
    for run in dom.targets.chunk_by_mut(|a, b| a.ver == b.ver) {
        run.sort_by(|a, b| target_shuffle_cmp(a, b, seed));
    }
}

fn target_shuffle_key(rank: u64, seed: u64) -> u64 {
    let r = rank ^ (rank << 22);
    let s = seed ^ (seed << 28);
    u64_hash(s.wrapping_add(r), 37)
}

fn target_shuffle_cmp(a: &ShuffleTarget, b: &ShuffleTarget, seed: u64) -> Ordering {
    let ka = target_shuffle_key(a.rank.into(), seed);
    let kb = target_shuffle_key(b.rank.into(), seed);
    ka.cmp(&kb).then_with(|| match a.rank.cmp(&b.rank) {
        // Target ranks are unique; an equal pair means a corrupt map.
        Ordering::Equal => panic!("duplicate target rank {} in shuffle", a.rank),
        ord => ord,
    })
}

fn dom_shuffle_key(rank: u64, seed: u64) -> u64 {
    let r = rank ^ (rank << 26);
    let s = seed ^ (seed << 26);
    u64_hash(s.wrapping_add(r), 37)
}

fn dom_shuffle_cmp(a: &ShuffleDomain, b: &ShuffleDomain, seed: u64) -> Ordering {
    let ka = dom_shuffle_key(a.rank.into(), seed);
    let kb = dom_shuffle_key(b.rank.into(), seed);
    ka.cmp(&kb).then_with(|| match a.rank.cmp(&b.rank) {
        Ordering::Equal => panic!("duplicate domain rank {} in shuffle", a.rank),
        ord => ord,
    })
}

/// Weave a newly-sorted version run into the merged prefix, 1:1
///
/// Even slots take from the merged prefix, odd slots from the new run; the
/// longer side drains its tail in place. Older components therefore keep
/// their relative order while newer ones spread evenly between them.
fn interleave(old: Vec<ShuffleDomain>, new: Vec<ShuffleDomain>) -> Vec<ShuffleDomain> {
    let mut out = Vec::with_capacity(old.len() + new.len());
    let mut old = old.into_iter();
    let mut new = new.into_iter();
    let mut old_done = false;
    let mut new_done = false;
    let mut slot = 0usize;

    while !(old_done && new_done) {
        if slot % 2 == 0 {
            match old.next() {
                Some(dom) => out.push(dom),
                None => old_done = true,
            }
        } else {
            match new.next() {
                Some(dom) => out.push(dom),
                None => new_done = true,
            }
        }
        slot += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rimio_pool::buf::PoolBufBuilder;

    fn map(doms: u32, ranks: u32, targets: u32) -> PoolMap {
        let buf = PoolBufBuilder::new(1).build(1, doms, ranks, targets).unwrap();
        PoolMap::create(&buf, 1).unwrap()
    }

    fn ranks_of(buf: &ShuffleBuf) -> Vec<Vec<u32>> {
        buf.domains
            .iter()
            .map(|d| d.targets.iter().map(|t| t.rank.get()).collect())
            .collect()
    }

    #[test]
    fn test_create_filters_by_version() {
        let mut map = map(4, 2, 2);
        let root = *map.root().comp();
        let grp = *map.domains(ComponentType::Grp).next().unwrap().comp();
        let delta = PoolBufBuilder::extension(2, 1000, 100, 100)
            .build_under(root, grp, 2, 1, 2)
            .unwrap();
        map.extend(2, &delta).unwrap();

        let old = ShuffleBuf::create(&map, ComponentType::Node, 1).unwrap();
        assert_eq!(old.domains.len(), 4);
        assert_eq!(old.ntargets, 16);

        let new = ShuffleBuf::create(&map, ComponentType::Node, 2).unwrap();
        assert_eq!(new.domains.len(), 6);
        assert_eq!(new.ntargets, 20);
    }

    #[test]
    fn test_shuffle_deterministic() {
        let map = map(4, 2, 4);
        let mut a = ShuffleBuf::create(&map, ComponentType::Node, 1).unwrap();
        let mut b = a.clone();
        a.shuffle(7);
        b.shuffle(7);
        assert_eq!(ranks_of(&a), ranks_of(&b));
    }

    #[test]
    fn test_shuffle_seed_changes_order() {
        let map = map(8, 2, 4);
        let mut a = ShuffleBuf::create(&map, ComponentType::Node, 1).unwrap();
        let mut b = a.clone();
        a.shuffle(0);
        b.shuffle(1);
        assert_ne!(ranks_of(&a), ranks_of(&b));
    }

    #[test]
    fn test_shuffle_is_permutation() {
        let map = map(4, 2, 4);
        let mut buf = ShuffleBuf::create(&map, ComponentType::Node, 1).unwrap();
        buf.shuffle(3);

        let mut seen: Vec<u32> = buf
            .domains
            .iter()
            .flat_map(|d| d.targets.iter().map(|t| t.pos))
            .collect();
        seen.sort_unstable();
        let expected: Vec<u32> = (0..32).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_shuffle_preserves_old_domain_order() {
        // Newer domains may only be woven between older ones.
        let mut map = map(4, 1, 2);
        let root = *map.root().comp();
        let grp = *map.domains(ComponentType::Grp).next().unwrap().comp();
        let delta = PoolBufBuilder::extension(2, 1000, 100, 100)
            .build_under(root, grp, 2, 1, 2)
            .unwrap();
        map.extend(2, &delta).unwrap();

        let mut old = ShuffleBuf::create(&map, ComponentType::Node, 1).unwrap();
        old.shuffle(5);
        let old_order: Vec<u32> = old.domains.iter().map(|d| d.rank.get()).collect();

        let mut new = ShuffleBuf::create(&map, ComponentType::Node, 2).unwrap();
        new.shuffle(5);
        let new_order: Vec<u32> = new
            .domains
            .iter()
            .map(|d| d.rank.get())
            .filter(|r| old_order.contains(r))
            .collect();

        assert_eq!(old_order, new_order);
    }

    #[test]
    fn test_interleave_even_odd() {
        let dom = |rank: u32| ShuffleDomain {
            ver: 1,
            rank: Rank::new(rank),
            targets: Vec::new(),
        };
        let old = vec![dom(0), dom(1), dom(2)];
        let new = vec![dom(10), dom(11)];
        let woven: Vec<u32> = interleave(old, new).iter().map(|d| d.rank.get()).collect();
        assert_eq!(woven, vec![0, 10, 1, 11, 2]);
    }
}
