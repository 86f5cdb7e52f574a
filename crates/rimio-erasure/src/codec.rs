//! Reed-Solomon encoder/decoder
//!
//! Thin codec over `reed-solomon-simd` for one redundancy group: k data
//! cells in, k+p shards out, any k of them sufficient to reconstruct.

use reed_solomon_simd::{ReedSolomonDecoder, ReedSolomonEncoder};
use rimio_common::hash::{MUR_DEFAULT_SEED, murmur64};
use rimio_common::{Error as CommonError, ObjectClass};
use thiserror::Error;

/// Errors specific to erasure coding operations
#[derive(Debug, Error)]
pub enum ErasureError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    #[error("decoding failed: {0}")]
    DecodingFailed(String),

    #[error("insufficient shards: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    #[error("shard size mismatch")]
    ShardSizeMismatch,
}

impl From<ErasureError> for CommonError {
    fn from(e: ErasureError) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

/// Result type for erasure operations
pub type Result<T> = std::result::Result<T, ErasureError>;

/// Reed-Solomon codec for one redundancy group
pub struct ErasureCodec {
    data_shards: usize,
    parity_shards: usize,
}

impl ErasureCodec {
    /// Create a codec with `data` data shards and `parity` parity shards
    pub fn new(data: usize, parity: usize) -> Result<Self> {
        if data == 0 {
            return Err(ErasureError::InvalidConfig("data shards must be > 0".into()));
        }
        if parity == 0 {
            return Err(ErasureError::InvalidConfig("parity shards must be > 0".into()));
        }
        Ok(Self {
            data_shards: data,
            parity_shards: parity,
        })
    }

    /// Create a codec from an erasure-coded object class
    pub fn for_class(class: &ObjectClass) -> Result<Self> {
        match class {
            ObjectClass::Erasure { data, parity, .. } => {
                Self::new(*data as usize, *parity as usize)
            }
            ObjectClass::Replicated { .. } => Err(ErasureError::InvalidConfig(
                "replicated classes carry no parity".into(),
            )),
        }
    }

    /// Number of data shards (k)
    #[must_use]
    pub const fn data_shards(&self) -> usize {
        self.data_shards
    }

    /// Number of parity shards (p)
    #[must_use]
    pub const fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    /// Compute the parity shards over equally sized data cells
    pub fn encode(&self, data: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
        if data.len() != self.data_shards {
            return Err(ErasureError::InvalidConfig(format!(
                "expected {} data shards, got {}",
                self.data_shards,
                data.len()
            )));
        }
        let shard_size = data[0].len();
        if data.iter().any(|cell| cell.len() != shard_size) {
            return Err(ErasureError::ShardSizeMismatch);
        }

        let mut encoder = ReedSolomonEncoder::new(self.data_shards, self.parity_shards, shard_size)
            .map_err(|e| ErasureError::InvalidConfig(e.to_string()))?;
        for cell in data {
            encoder
                .add_original_shard(cell)
                .map_err(|e| ErasureError::EncodingFailed(e.to_string()))?;
        }
        let result = encoder
            .encode()
            .map_err(|e| ErasureError::EncodingFailed(e.to_string()))?;

        Ok(result.recovery_iter().map(<[u8]>::to_vec).collect())
    }

    /// Reconstruct the missing data shards
    ///
    /// `shards` holds `k + p` entries, `None` for missing ones; returns
    /// the full set of data shards.
    pub fn reconstruct(&self, shards: &[Option<Vec<u8>>]) -> Result<Vec<Vec<u8>>> {
        let (k, p) = (self.data_shards, self.parity_shards);
        if shards.len() != k + p {
            return Err(ErasureError::InvalidConfig(format!(
                "expected {} shards, got {}",
                k + p,
                shards.len()
            )));
        }
        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < k {
            return Err(ErasureError::InsufficientShards {
                available,
                required: k,
            });
        }
        let Some(shard_size) = shards.iter().flatten().map(Vec::len).next() else {
            return Err(ErasureError::ShardSizeMismatch);
        };

        let mut decoder = ReedSolomonDecoder::new(k, p, shard_size)
            .map_err(|e| ErasureError::InvalidConfig(e.to_string()))?;
        for (i, shard) in shards.iter().enumerate().take(k) {
            if let Some(cell) = shard {
                decoder
                    .add_original_shard(i, cell)
                    .map_err(|e| ErasureError::DecodingFailed(e.to_string()))?;
            }
        }
        for (i, shard) in shards.iter().enumerate().skip(k) {
            if let Some(cell) = shard {
                decoder
                    .add_recovery_shard(i - k, cell)
                    .map_err(|e| ErasureError::DecodingFailed(e.to_string()))?;
            }
        }
        let result = decoder
            .decode()
            .map_err(|e| ErasureError::DecodingFailed(e.to_string()))?;

        let mut data = Vec::with_capacity(k);
        for (i, shard) in shards.iter().enumerate().take(k) {
            match shard {
                Some(cell) => data.push(cell.clone()),
                None => match result.restored_original(i) {
                    Some(cell) => data.push(cell.to_vec()),
                    None => {
                        return Err(ErasureError::DecodingFailed(format!(
                            "failed to restore data shard {i}"
                        )));
                    }
                },
            }
        }
        Ok(data)
    }

    /// Check that the parity shards match the data shards
    pub fn verify(&self, data: &[Vec<u8>], parity: &[Vec<u8>]) -> Result<bool> {
        if parity.len() != self.parity_shards {
            return Ok(false);
        }
        let expected = self.encode(data)?;
        Ok(expected == parity)
    }

    /// Group-internal rotation of the parity cells for one distribution key
    ///
    /// Rotating parity per dkey spreads the parity-update load over the
    /// whole group instead of pinning it to the trailing cells.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn parity_rotation(&self, dkey: &[u8]) -> usize {
        let width = (self.data_shards + self.parity_shards) as u64;
        (murmur64(dkey, MUR_DEFAULT_SEED) % width) as usize
    }
}
