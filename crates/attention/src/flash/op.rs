//! Binding of the chunked kernels into candle's autograd graph.
//!
//! [`FlashAttentionOp`] runs the forward engine on CPU storage and stashes the
//! per-row statistics. When the graph is differentiated, candle hands the
//! original inputs, the output and the upstream gradient to
//! [`CustomOp3::bwd`], which consumes the stash and runs the backward engine.
//! The stash is taken, so each forward pass backs exactly one backward pass.

use std::sync::Mutex;

use candle_core::{CpuStorage, CustomOp3, Device, Error, Layout, Result, Shape, Tensor};

use super::{backward, forward, SavedState};
use crate::core::{AttentionError, Config};
use crate::masks::RowMask;

/// Custom candle op computing chunked attention over `(q, k, v)`.
#[derive(Debug)]
pub struct FlashAttentionOp {
    mask: Option<RowMask>,
    config: Config,
    saved: Mutex<Option<SavedState>>,
}

impl FlashAttentionOp {
    pub fn new(mask: Option<RowMask>, config: Config) -> Self {
        Self {
            mask,
            config,
            saved: Mutex::new(None),
        }
    }

    fn stash(&self, state: SavedState) -> Result<()> {
        let mut guard = self
            .saved
            .lock()
            .map_err(|_| Error::Msg("saved state mutex poisoned".into()))?;
        *guard = Some(state);
        Ok(())
    }

    fn take_saved(&self) -> Result<SavedState> {
        let mut guard = self
            .saved
            .lock()
            .map_err(|_| Error::Msg("saved state mutex poisoned".into()))?;
        guard.take().ok_or_else(|| {
            to_candle_err(AttentionError::InvalidConfiguration {
                context: "backward invoked without the saved state of a matching forward pass"
                    .to_string(),
            })
        })
    }
}

impl CustomOp3 for FlashAttentionOp {
    fn name(&self) -> &'static str {
        "chunked-attention"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
        s3: &CpuStorage,
        l3: &Layout,
    ) -> Result<(CpuStorage, Shape)> {
        let q = storage_to_tensor("q", s1, l1)?;
        let k = storage_to_tensor("k", s2, l2)?;
        let v = storage_to_tensor("v", s3, l3)?;

        let (output, saved) =
            forward(&q, &k, &v, self.mask.as_ref(), &self.config).map_err(to_candle_err)?;
        self.stash(saved)?;

        let shape = output.shape().clone();
        Ok((tensor_to_storage(&output)?, shape))
    }

    fn bwd(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        res: &Tensor,
        grad_res: &Tensor,
    ) -> Result<(Option<Tensor>, Option<Tensor>, Option<Tensor>)> {
        let saved = self.take_saved()?;
        let grads = backward(
            grad_res,
            q,
            k,
            v,
            res,
            &saved,
            self.mask.as_ref(),
            &self.config,
        )
        .map_err(to_candle_err)?;
        Ok((Some(grads.dq), Some(grads.dk), Some(grads.dv)))
    }
}

fn to_candle_err(err: AttentionError) -> Error {
    Error::Msg(err.to_string())
}

fn storage_to_tensor(name: &str, storage: &CpuStorage, layout: &Layout) -> Result<Tensor> {
    let (start, end) = layout
        .contiguous_offsets()
        .ok_or_else(|| Error::Msg(format!("chunked attention expects contiguous {name}")))?;
    let shape = layout.shape().clone();
    let device = Device::Cpu;
    match storage {
        CpuStorage::F32(data) => Tensor::from_slice(&data[start..end], shape, &device),
        CpuStorage::F16(data) => Tensor::from_slice(&data[start..end], shape, &device),
        CpuStorage::BF16(data) => Tensor::from_slice(&data[start..end], shape, &device),
        _ => Err(Error::Msg(format!(
            "chunked attention supports f32, f16 and bf16 {name}"
        ))),
    }
}

fn tensor_to_storage(tensor: &Tensor) -> Result<CpuStorage> {
    let flat = tensor.flatten_all()?;
    match tensor.dtype() {
        candle_core::DType::F32 => Ok(CpuStorage::F32(flat.to_vec1::<f32>()?)),
        candle_core::DType::F16 => Ok(CpuStorage::F16(flat.to_vec1::<half::f16>()?)),
        candle_core::DType::BF16 => Ok(CpuStorage::BF16(flat.to_vec1::<half::bf16>()?)),
        other => Err(Error::Msg(format!(
            "chunked attention cannot emit {other:?} output"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn backward_without_forward_is_rejected() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 1, 2, 2), DType::F32, &device).unwrap();
        let op = FlashAttentionOp::new(None, Config::with_chunks(1, 1));
        let err = op.bwd(&q, &q, &q, &q, &q).unwrap_err();
        assert!(err.to_string().contains("backward invoked without"));
    }

    #[test]
    fn saved_state_serves_a_single_backward() -> Result<()> {
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (1, 2, 3, 4), &device)?;
        let k = Tensor::randn(0f32, 1.0, (1, 2, 5, 4), &device)?;
        let v = Tensor::randn(0f32, 1.0, (1, 2, 5, 4), &device)?;
        let op = FlashAttentionOp::new(None, Config::with_chunks(2, 2));

        let (s1, l1) = q.storage_and_layout();
        let (s2, l2) = k.storage_and_layout();
        let (s3, l3) = v.storage_and_layout();
        let (storage, shape) = match (&*s1, &*s2, &*s3) {
            (
                candle_core::Storage::Cpu(s1),
                candle_core::Storage::Cpu(s2),
                candle_core::Storage::Cpu(s3),
            ) => op.cpu_fwd(s1, l1, s2, l2, s3, l3)?,
            _ => unreachable!("tensors were created on the cpu"),
        };
        assert_eq!(shape.dims(), &[1, 2, 3, 4]);
        let output = match storage {
            CpuStorage::F32(data) => Tensor::from_vec(data, shape, &device)?,
            _ => unreachable!("f32 inputs produce f32 output"),
        };

        let grad = Tensor::ones_like(&output)?;
        let (dq, dk, dv) = op.bwd(&q, &k, &v, &output, &grad)?;
        assert_eq!(dq.expect("dq").dims(), q.dims());
        assert_eq!(dk.expect("dk").dims(), k.dims());
        assert_eq!(dv.expect("dv").dims(), v.dims());

        assert!(op.bwd(&q, &k, &v, &output, &grad).is_err());
        Ok(())
    }
}
