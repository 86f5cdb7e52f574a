//! Serialized pool-map buffers
//!
//! A pool buffer is the wire form of a pool map: a 16-byte header followed
//! by component records in depth-first order. The header checksum (crc32c)
//! covers all record bytes.

use crate::component::{COMPONENT_RECORD_SIZE, Component, swap_component_record};
use bytes::{Buf, BufMut, BytesMut};
use rimio_common::{ComponentStatus, ComponentType, Error, Rank, Result};

/// Encoded size of the pool-buffer header
pub const POOL_BUF_HEADER_SIZE: usize = 16;

/// A parsed pool buffer: component records in depth-first order
///
/// The first record must be the root; every domain record is immediately
/// followed by the records of its `co_nr` children.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolBuf {
    components: Vec<Component>,
}

impl PoolBuf {
    /// Wrap a record list, validating tree shape and counts
    pub fn new(components: Vec<Component>) -> Result<Self> {
        let buf = Self { components };
        buf.validate()?;
        Ok(buf)
    }

    /// Parse a serialized pool buffer
    pub fn parse(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < POOL_BUF_HEADER_SIZE {
            return Err(Error::invalid_format("truncated pool buffer header"));
        }
        let csum = bytes.get_u32_ne();
        let nr = bytes.get_u32_ne() as usize;
        let domain_nr = bytes.get_u32_ne() as usize;
        let target_nr = bytes.get_u32_ne() as usize;

        if bytes.remaining() != nr * COMPONENT_RECORD_SIZE {
            return Err(Error::invalid_format(format!(
                "pool buffer body is {} bytes, expected {} records",
                bytes.remaining(),
                nr
            )));
        }
        if crc32c::crc32c(bytes) != csum {
            return Err(Error::invalid_format("pool buffer checksum mismatch"));
        }

        let mut components = Vec::with_capacity(nr);
        for _ in 0..nr {
            components.push(Component::decode(&mut bytes)?);
        }

        let buf = Self::new(components)?;
        if buf.domain_count() != domain_nr || buf.target_count() != target_nr {
            return Err(Error::invalid_format(format!(
                "header counts ({domain_nr} domains, {target_nr} targets) do not match records"
            )));
        }
        Ok(buf)
    }

    /// Serialize into wire form, computing the checksum
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut body = BytesMut::with_capacity(self.components.len() * COMPONENT_RECORD_SIZE);
        for comp in &self.components {
            comp.encode(&mut body);
        }

        let mut out = Vec::with_capacity(POOL_BUF_HEADER_SIZE + body.len());
        out.put_u32_ne(crc32c::crc32c(&body));
        out.put_u32_ne(self.components.len() as u32);
        out.put_u32_ne(self.domain_count() as u32);
        out.put_u32_ne(self.target_count() as u32);
        out.extend_from_slice(&body);
        out
    }

    /// Component records in depth-first order
    #[must_use]
    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// Number of domain records (root included)
    #[must_use]
    pub fn domain_count(&self) -> usize {
        self.components.iter().filter(|c| c.is_domain()).count()
    }

    /// Number of target records
    #[must_use]
    pub fn target_count(&self) -> usize {
        self.components.len() - self.domain_count()
    }

    /// Highest map version recorded anywhere in the buffer
    #[must_use]
    pub fn max_version(&self) -> u32 {
        self.components
            .iter()
            .map(|c| {
                c.co_ver
                    .max(c.co_in_ver)
                    .max(c.co_fseq)
                    .max(c.co_out_ver)
            })
            .max()
            .unwrap_or(0)
    }

    /// Validate tree shape: a single root, children following their parent
    /// depth-first, targets only under rank domains, strictly descending
    /// type levels
    fn validate(&self) -> Result<()> {
        let Some(root) = self.components.first() else {
            return Err(Error::invalid_format("empty pool buffer"));
        };
        if root.co_type != ComponentType::Root {
            return Err(Error::invalid_format("pool buffer does not start at root"));
        }

        let consumed = Self::validate_subtree(&self.components, 0)?;
        if consumed != self.components.len() {
            return Err(Error::invalid_format(format!(
                "{} trailing component records",
                self.components.len() - consumed
            )));
        }
        Ok(())
    }

    /// Walk one subtree starting at `at`, returning the index past it
    fn validate_subtree(components: &[Component], at: usize) -> Result<usize> {
        let comp = components
            .get(at)
            .ok_or_else(|| Error::invalid_format("component tree truncated"))?;

        if comp.co_type == ComponentType::Target {
            if comp.co_nr != 0 {
                return Err(Error::invalid_format("target record with children"));
            }
            return Ok(at + 1);
        }

        let mut next = at + 1;
        for _ in 0..comp.co_nr {
            let child = components
                .get(next)
                .ok_or_else(|| Error::invalid_format("component tree truncated"))?;
            if child.co_type <= comp.co_type {
                return Err(Error::invalid_format(format!(
                    "{} under {} breaks the tree ordering",
                    child.co_type, comp.co_type
                )));
            }
            if child.co_type == ComponentType::Target && comp.co_type != ComponentType::Rank {
                return Err(Error::invalid_format("target not under a rank domain"));
            }
            next = Self::validate_subtree(components, next)?;
        }
        Ok(next)
    }
}

/// Byte-reverse every header and record field in declaration order, for
/// cross-endian import
pub fn swap_pool_buf(bytes: &mut [u8]) -> Result<()> {
    if bytes.len() < POOL_BUF_HEADER_SIZE
        || (bytes.len() - POOL_BUF_HEADER_SIZE) % COMPONENT_RECORD_SIZE != 0
    {
        return Err(Error::invalid_format("pool buffer size is not record-aligned"));
    }
    let (header, body) = bytes.split_at_mut(POOL_BUF_HEADER_SIZE);
    for field in header.chunks_exact_mut(4) {
        field.reverse();
    }
    for rec in body.chunks_exact_mut(COMPONENT_RECORD_SIZE) {
        swap_component_record(rec);
    }
    Ok(())
}

/// Builder for test and bootstrap topologies
///
/// Produces uniform trees: one or more grouping domains, each with fault
/// domains, server ranks and targets.
/// Component ids and ranks are assigned sequentially from the configured
/// bases so extension buffers can continue where the base map stopped.
#[derive(Clone, Debug)]
pub struct PoolBufBuilder {
    version: u32,
    status: ComponentStatus,
    next_id: u32,
    next_target_rank: u32,
    next_dom_rank: u32,
}

impl PoolBufBuilder {
    /// Builder for a fresh pool at `version`, components UPIN
    #[must_use]
    pub const fn new(version: u32) -> Self {
        Self {
            version,
            status: ComponentStatus::UpIn,
            next_id: 0,
            next_target_rank: 0,
            next_dom_rank: 0,
        }
    }

    /// Builder for an extension buffer: components NEW, id and rank
    /// allocation starting past the given bases
    #[must_use]
    pub const fn extension(version: u32, id_base: u32, target_rank_base: u32, dom_rank_base: u32) -> Self {
        Self {
            version,
            status: ComponentStatus::New,
            next_id: id_base,
            next_target_rank: target_rank_base,
            next_dom_rank: dom_rank_base,
        }
    }

    /// Build a uniform tree: `grps` grouping domains, each holding `doms`
    /// fault domains of `ranks` server ranks with `targets` targets each
    pub fn build(&mut self, grps: u32, doms: u32, ranks: u32, targets: u32) -> Result<PoolBuf> {
        if grps == 0 || doms == 0 || ranks == 0 || targets == 0 {
            return Err(Error::invalid_argument("empty topology"));
        }

        let mut components = Vec::new();
        components.push(self.component(ComponentType::Root, Rank::new(0), grps));
        for _ in 0..grps {
            self.push_grp(&mut components, doms, ranks, targets);
        }
        PoolBuf::new(components)
    }

    /// Build an extension delta adding `doms` fault domains under an
    /// existing grouping domain
    ///
    /// `root` and `grp` are the existing components the delta splices
    /// into; their records are carried with adjusted child counts so the
    /// delta is a well-formed tree of its own.
    pub fn build_under(
        &mut self,
        root: Component,
        grp: Component,
        doms: u32,
        ranks: u32,
        targets: u32,
    ) -> Result<PoolBuf> {
        if doms == 0 || ranks == 0 || targets == 0 {
            return Err(Error::invalid_argument("empty topology"));
        }

        let mut components = Vec::new();
        components.push(Component { co_nr: 1, ..root });
        components.push(Component { co_nr: doms, ..grp });
        for _ in 0..doms {
            self.push_node(&mut components, ranks, targets);
        }
        PoolBuf::new(components)
    }

    fn push_grp(&mut self, out: &mut Vec<Component>, doms: u32, ranks: u32, targets: u32) {
        let rank = self.alloc_dom_rank();
        out.push(self.component(ComponentType::Grp, rank, doms));
        for _ in 0..doms {
            self.push_node(out, ranks, targets);
        }
    }

    fn push_node(&mut self, out: &mut Vec<Component>, ranks: u32, targets: u32) {
        let rank = self.alloc_dom_rank();
        out.push(self.component(ComponentType::Node, rank, ranks));
        for _ in 0..ranks {
            self.push_rank(out, targets);
        }
    }

    fn push_rank(&mut self, out: &mut Vec<Component>, targets: u32) {
        let rank = self.alloc_dom_rank();
        out.push(self.component(ComponentType::Rank, rank, targets));
        for _ in 0..targets {
            let trank = Rank::new(self.next_target_rank);
            self.next_target_rank += 1;
            out.push(self.component(ComponentType::Target, trank, 0));
        }
    }

    fn component(&mut self, co_type: ComponentType, co_rank: Rank, co_nr: u32) -> Component {
        let co_id = self.next_id;
        self.next_id += 1;
        match self.status {
            ComponentStatus::New => Component::fresh(co_type, co_id, co_rank, self.version, co_nr),
            _ => Component::up_in(co_type, co_id, co_rank, self.version, co_nr),
        }
    }

    fn alloc_dom_rank(&mut self) -> Rank {
        let rank = Rank::new(self.next_dom_rank);
        self.next_dom_rank += 1;
        rank
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_counts() {
        let buf = PoolBufBuilder::new(1).build(1, 4, 2, 4).unwrap();
        // root + 1 grp + 4 nodes + 8 ranks = 14 domains, 32 targets
        assert_eq!(buf.domain_count(), 14);
        assert_eq!(buf.target_count(), 32);
        assert_eq!(buf.max_version(), 1);
    }

    #[test]
    fn test_serialize_parse_roundtrip() {
        let buf = PoolBufBuilder::new(1).build(1, 4, 2, 4).unwrap();
        let bytes = buf.serialize();
        let parsed = PoolBuf::parse(&bytes).unwrap();
        assert_eq!(parsed, buf);
    }

    #[test]
    fn test_parse_rejects_corruption() {
        let buf = PoolBufBuilder::new(1).build(1, 2, 1, 2).unwrap();
        let mut bytes = buf.serialize();

        // Flip a body byte: checksum must catch it.
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(PoolBuf::parse(&bytes).is_err());

        // Truncated body.
        let bytes = buf.serialize();
        assert!(PoolBuf::parse(&bytes[..bytes.len() - 8]).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_tree() {
        let mut components = PoolBufBuilder::new(1).build(1, 2, 1, 2).unwrap().components().to_vec();
        // A target cannot claim children.
        let target = components
            .iter()
            .position(|c| c.co_type == ComponentType::Target)
            .unwrap();
        components[target].co_nr = 1;
        assert!(PoolBuf::new(components).is_err());
    }

    #[test]
    fn test_swap_roundtrip() {
        let buf = PoolBufBuilder::new(1).build(1, 2, 2, 2).unwrap();
        let bytes = buf.serialize();

        let mut swapped = bytes.clone();
        swap_pool_buf(&mut swapped).unwrap();
        assert_ne!(swapped, bytes);

        swap_pool_buf(&mut swapped).unwrap();
        assert_eq!(swapped, bytes);
        // A double swap is parseable again.
        assert!(PoolBuf::parse(&swapped).is_ok());
    }

    #[test]
    fn test_extension_builder_continues_ids() {
        let base = PoolBufBuilder::new(1).build(1, 2, 1, 2).unwrap();
        let max_id = base.components().iter().map(|c| c.co_id).max().unwrap();

        let ext = PoolBufBuilder::extension(2, max_id + 1, 4, 10)
            .build(1, 1, 1, 2)
            .unwrap();
        assert!(ext.components().iter().all(|c| c.co_id > max_id));
        assert!(
            ext.components()
                .iter()
                .all(|c| c.co_status == ComponentStatus::New && c.co_ver == 2)
        );
    }
}
