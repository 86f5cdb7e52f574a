//! Pool-map component records
//!
//! A component is one node of the pool-map tree. Its 32-byte wire encoding
//! is a compatibility contract: field order and widths must not change.

use bytes::{Buf, BufMut};
use rimio_common::{ComponentFlags, ComponentStatus, ComponentType, Error, Rank, Result};
use serde::{Deserialize, Serialize};

/// Encoded size of one component record
pub const COMPONENT_RECORD_SIZE: usize = 32;

/// One node of the pool-map tree
///
/// Wire layout (native-endian):
///
/// ```text
/// co_type:u16  co_status:u8  co_flags:u8
/// co_id:u32    co_rank:u32   co_ver:u32
/// co_in_ver:u32  co_fseq:u32  co_out_ver:u32  co_nr:u32
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    /// Component type tag
    pub co_type: ComponentType,
    /// Current status
    pub co_status: ComponentStatus,
    /// Flag bits (DOWN2OUT / DOWN2UP)
    pub co_flags: ComponentFlags,
    /// Stable numeric id, unique across the map
    pub co_id: u32,
    /// Rank; for targets this is the externally visible target identifier
    pub co_rank: Rank,
    /// Map version the component was added at
    pub co_ver: u32,
    /// Map version of the last transition into UP or UPIN
    pub co_in_ver: u32,
    /// Failure sequence, set on DOWN/DRAIN transitions
    pub co_fseq: u32,
    /// Map version of the transition to DOWNOUT
    pub co_out_ver: u32,
    /// Number of direct children following in depth-first order
    pub co_nr: u32,
}

impl Component {
    /// Create a component that joined the map at `ver` in UPIN state
    #[must_use]
    pub const fn up_in(co_type: ComponentType, co_id: u32, co_rank: Rank, ver: u32, co_nr: u32) -> Self {
        Self {
            co_type,
            co_status: ComponentStatus::UpIn,
            co_flags: ComponentFlags::NONE,
            co_id,
            co_rank,
            co_ver: ver,
            co_in_ver: ver,
            co_fseq: 0,
            co_out_ver: 0,
            co_nr,
        }
    }

    /// Create a component freshly appended at `ver`, awaiting an extend
    #[must_use]
    pub const fn fresh(co_type: ComponentType, co_id: u32, co_rank: Rank, ver: u32, co_nr: u32) -> Self {
        Self {
            co_type,
            co_status: ComponentStatus::New,
            co_flags: ComponentFlags::NONE,
            co_id,
            co_rank,
            co_ver: ver,
            co_in_ver: 0,
            co_fseq: 0,
            co_out_ver: 0,
            co_nr,
        }
    }

    /// Check whether this component is a domain (anything above a target)
    #[must_use]
    pub const fn is_domain(&self) -> bool {
        self.co_type.is_domain()
    }

    /// Encode into a wire buffer, native-endian
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16_ne(self.co_type as u16);
        buf.put_u8(self.co_status as u8);
        buf.put_u8(self.co_flags.bits());
        buf.put_u32_ne(self.co_id);
        buf.put_u32_ne(self.co_rank.get());
        buf.put_u32_ne(self.co_ver);
        buf.put_u32_ne(self.co_in_ver);
        buf.put_u32_ne(self.co_fseq);
        buf.put_u32_ne(self.co_out_ver);
        buf.put_u32_ne(self.co_nr);
    }

    /// Decode from a wire buffer
    ///
    /// The caller must guarantee at least [`COMPONENT_RECORD_SIZE`] bytes
    /// remain.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < COMPONENT_RECORD_SIZE {
            return Err(Error::invalid_format("truncated component record"));
        }
        Ok(Self {
            co_type: ComponentType::try_from(buf.get_u16_ne())?,
            co_status: ComponentStatus::try_from(buf.get_u8())?,
            co_flags: ComponentFlags::from(buf.get_u8()),
            co_id: buf.get_u32_ne(),
            co_rank: Rank::new(buf.get_u32_ne()),
            co_ver: buf.get_u32_ne(),
            co_in_ver: buf.get_u32_ne(),
            co_fseq: buf.get_u32_ne(),
            co_out_ver: buf.get_u32_ne(),
            co_nr: buf.get_u32_ne(),
        })
    }
}

/// Byte-reverse every field of one encoded record, in declaration order
///
/// Used for cross-endian import; single-byte fields are left in place.
pub(crate) fn swap_component_record(rec: &mut [u8]) {
    debug_assert_eq!(rec.len(), COMPONENT_RECORD_SIZE);
    rec[0..2].reverse();
    // co_status and co_flags are single bytes
    for field in rec[4..].chunks_exact_mut(4) {
        field.reverse();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn sample() -> Component {
        Component {
            co_type: ComponentType::Target,
            co_status: ComponentStatus::Down,
            co_flags: ComponentFlags::DOWN_TO_UP,
            co_id: 17,
            co_rank: Rank::new(9),
            co_ver: 3,
            co_in_ver: 1,
            co_fseq: 4,
            co_out_ver: 0,
            co_nr: 0,
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let comp = sample();
        let mut buf = BytesMut::new();
        comp.encode(&mut buf);
        assert_eq!(buf.len(), COMPONENT_RECORD_SIZE);

        let decoded = Component::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, comp);
    }

    #[test]
    fn test_decode_rejects_bad_tags() {
        let comp = sample();
        let mut buf = BytesMut::new();
        comp.encode(&mut buf);

        let mut bytes = buf.to_vec();
        bytes[0] = 0xff; // unknown component type
        assert!(Component::decode(&mut &bytes[..]).is_err());

        let mut bytes = buf.to_vec();
        bytes[2] = 0x03; // not a single status bit
        assert!(Component::decode(&mut &bytes[..]).is_err());
    }

    #[test]
    fn test_decode_truncated() {
        let comp = sample();
        let mut buf = BytesMut::new();
        comp.encode(&mut buf);
        let bytes = buf.freeze();
        assert!(Component::decode(&mut &bytes[..COMPONENT_RECORD_SIZE - 1]).is_err());
    }

    #[test]
    fn test_swap_is_involution() {
        let comp = sample();
        let mut buf = BytesMut::new();
        comp.encode(&mut buf);
        let mut bytes = buf.to_vec();

        swap_component_record(&mut bytes);
        assert_ne!(bytes, buf.to_vec());
        swap_component_record(&mut bytes);
        assert_eq!(bytes, buf.to_vec());
    }
}
