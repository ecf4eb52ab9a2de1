//! Per-row validity masks.
//!
//! A [`RowMask`] is a `u8` tensor shaped `[batch, len]` where `len` equals the
//! key length of the call. Bit `[b, i]` governs query row `i` as a whole: a
//! cleared bit masks every key for that row, which then falls back to a zero
//! output. Rows with an index beyond `len` (possible only when the query
//! sequence is longer than the key sequence) are treated as valid.

use candle_core::{Device, Tensor};

use super::MASK_DTYPE;
use crate::core::{AttentionError, AttentionShape};

/// Validity mask shaped `[batch, len]`, `1` = valid.
#[derive(Debug, Clone)]
pub struct RowMask {
    valid: Tensor,
}

impl RowMask {
    /// Wraps an existing `u8` tensor shaped `[batch, len]`.
    pub fn new(valid: Tensor) -> Result<Self, AttentionError> {
        if valid.dtype() != MASK_DTYPE {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("mask expects {MASK_DTYPE:?}, got {:?}", valid.dtype()),
            });
        }
        if valid.rank() != 2 {
            return Err(AttentionError::shape(format!(
                "mask must have shape [batch, len], got {:?}",
                valid.dims()
            )));
        }
        Ok(Self { valid })
    }

    /// Builds a mask from boolean flags, `true` marking a valid position.
    ///
    /// Every inner slice corresponds to a batch element and must share the
    /// same length.
    pub fn from_booleans(device: &Device, valid: &[Vec<bool>]) -> Result<Self, AttentionError> {
        let len = valid.first().map(Vec::len).unwrap_or(0);
        if let Some(bad) = valid.iter().position(|row| row.len() != len) {
            return Err(AttentionError::shape(format!(
                "mask row {bad} has length {} but row 0 has {len}",
                valid[bad].len()
            )));
        }
        let data: Vec<u8> = valid
            .iter()
            .flat_map(|row| row.iter().map(|&flag| u8::from(flag)))
            .collect();
        let tensor = Tensor::from_vec(data, (valid.len(), len), device)?;
        Self::new(tensor)
    }

    /// Marks the first `lengths[b]` positions of each batch element valid.
    pub fn from_lengths(
        device: &Device,
        lengths: &[usize],
        len: usize,
    ) -> Result<Self, AttentionError> {
        let mut data = vec![0u8; lengths.len() * len];
        for (b, &valid) in lengths.iter().enumerate() {
            let valid = valid.min(len);
            data[b * len..b * len + valid].fill(1);
        }
        let tensor = Tensor::from_vec(data, (lengths.len(), len), device)?;
        Self::new(tensor)
    }

    /// Underlying `[batch, len]` tensor.
    pub fn tensor(&self) -> &Tensor {
        &self.valid
    }

    pub fn batch(&self) -> usize {
        self.valid.dims()[0]
    }

    pub fn len(&self) -> usize {
        self.valid.dims()[1]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Moves the mask to `device`.
    pub fn to_device(&self, device: &Device) -> Result<Self, AttentionError> {
        Ok(Self {
            valid: self.valid.to_device(device)?,
        })
    }

    /// Checks the mask against the call it is applied to: batch and length
    /// must match `shape`, and the mask must live on the queries' `device`.
    pub fn validate(
        &self,
        shape: &AttentionShape,
        device: &Device,
    ) -> Result<(), AttentionError> {
        if !self.valid.device().same_device(device) {
            return Err(AttentionError::shape(format!(
                "mask lives on {:?} but the queries on {:?}",
                self.valid.device().location(),
                device.location()
            )));
        }
        if self.batch() != shape.batch || self.len() != shape.k_len {
            return Err(AttentionError::shape(format!(
                "mask expected [{}, {}] got {:?}",
                shape.batch,
                shape.k_len,
                self.valid.dims()
            )));
        }
        Ok(())
    }

    /// Validity bits for query rows `start..start + rows`, shaped
    /// `[batch, 1, rows, 1]` so they broadcast over heads and keys.
    pub fn rows(&self, start: usize, rows: usize) -> Result<Tensor, AttentionError> {
        let batch = self.batch();
        let covered = self.len().saturating_sub(start).min(rows);
        let slice = if covered == rows {
            self.valid.narrow(1, start, rows)?
        } else {
            let tail = Tensor::ones((batch, rows - covered), MASK_DTYPE, self.valid.device())?;
            if covered == 0 {
                tail
            } else {
                let head = self.valid.narrow(1, start, covered)?;
                Tensor::cat(&[&head, &tail], 1)?
            }
        };
        Ok(slice.reshape((batch, 1, rows, 1))?)
    }
}
