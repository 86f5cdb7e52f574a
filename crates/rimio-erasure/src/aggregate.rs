//! Epoch-stamped stripe aggregation
//!
//! Partial-stripe writes land as extents stamped with the epoch they were
//! committed at. Aggregation replays every extent visible at an epoch, in
//! epoch order, into the full stripe and computes the parity over the
//! resulting data cells: the parity of the aggregated stripe is the
//! parity of the data as of that epoch, regardless of how the writes were
//! split.

use crate::codec::{ErasureCodec, ErasureError, Result};

/// One recorded partial-stripe write
#[derive(Clone, Debug)]
struct StripeWrite {
    epoch: u64,
    offset: usize,
    data: Vec<u8>,
}

/// A stripe materialized at an aggregation epoch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregatedStripe {
    /// Epoch the stripe was aggregated at
    pub epoch: u64,
    /// Data cells, one per data shard
    pub data: Vec<Vec<u8>>,
    /// Parity cells, one per parity shard
    pub parity: Vec<Vec<u8>>,
}

/// Replays epoch-stamped writes into full-stripe parity
pub struct StripeAggregator {
    codec: ErasureCodec,
    cell_size: usize,
    writes: Vec<StripeWrite>,
}

impl StripeAggregator {
    /// Create an aggregator for `data` x `cell_size` stripes with
    /// `parity` parity cells
    pub fn new(data: usize, parity: usize, cell_size: usize) -> Result<Self> {
        if cell_size == 0 || cell_size % 2 != 0 {
            return Err(ErasureError::InvalidConfig(
                "cell size must be even and non-zero".into(),
            ));
        }
        Ok(Self {
            codec: ErasureCodec::new(data, parity)?,
            cell_size,
            writes: Vec::new(),
        })
    }

    /// Bytes covered by the stripe's data extent
    #[must_use]
    pub const fn stripe_size(&self) -> usize {
        self.codec.data_shards() * self.cell_size
    }

    /// Record a write of `data` at `offset`, committed at `epoch`
    ///
    /// Later records at the same epoch overwrite earlier ones where they
    /// overlap.
    pub fn record(&mut self, epoch: u64, offset: usize, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(ErasureError::InvalidConfig("empty write".into()));
        }
        if offset + data.len() > self.stripe_size() {
            return Err(ErasureError::InvalidConfig(format!(
                "write [{offset}, {}) outside stripe of {} bytes",
                offset + data.len(),
                self.stripe_size()
            )));
        }
        self.writes.push(StripeWrite {
            epoch,
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }

    /// Materialize the stripe as of `epoch` and compute its parity
    pub fn aggregate(&self, epoch: u64) -> Result<AggregatedStripe> {
        let mut stripe = vec![0u8; self.stripe_size()];

        // Stable order: epoch-major, then commit order within one epoch.
        let mut visible: Vec<&StripeWrite> =
            self.writes.iter().filter(|w| w.epoch <= epoch).collect();
        visible.sort_by_key(|w| w.epoch);
        for write in visible {
            stripe[write.offset..write.offset + write.data.len()].copy_from_slice(&write.data);
        }

        let data: Vec<Vec<u8>> = stripe.chunks(self.cell_size).map(<[u8]>::to_vec).collect();
        let parity = self.codec.encode(&data)?;
        Ok(AggregatedStripe {
            epoch,
            data,
            parity,
        })
    }
}
