//! Dtype-agnostic projection: optional pre-projection RMSNorm (the BitNet
//! "sub_norm" pattern, kept generic so non-ternary architectures simply omit
//! it) → matmul against a `WeightHandle`-backed weight → optional LoRA delta
//! added before the caller applies a residual.

use crate::error::{LoomError, Result};
use crate::gpu::kernel::{
    CommandRecorder, GpuTensor, KernelRunner, MatmulRole, TransposeB,
};
use crate::model::weights::WeightHandle;

/// One active LoRA adapter's contribution to a single projection:
/// `delta = (x @ A^T) @ B^T`, `A: [rank, in_dim]`, `B: [out_dim, rank]`. The
/// `alpha/rank` scale factor is baked into `b`'s uploaded bytes at adapter
/// load time (`lora::adapter`) rather than applied here, since the kernel
/// façade has no scalar-multiply primitive.
pub struct LoraDelta {
    pub a: GpuTensor,
    pub b: GpuTensor,
    pub rank: usize,
}

pub struct Linear {
    weight: GpuTensor,
    norm: Option<GpuTensor>,
    eps: f32,
    in_dim: usize,
    out_dim: usize,
}

impl Linear {
    pub fn new(
        weight_handle: &WeightHandle,
        norm: Option<GpuTensor>,
        eps: f32,
        in_dim: usize,
        out_dim: usize,
    ) -> Result<Self> {
        let buffer = weight_handle.as_gpu_buffer().cloned().ok_or_else(|| {
            LoomError::Other(format!(
                "projection weight has {} shards; sharded matmul is not supported by the reference kernel backend",
                match weight_handle {
                    WeightHandle::Quantized { shards, .. } => shards.len(),
                    _ => 0,
                }
            ))
        })?;
        let weight = GpuTensor::new(buffer, vec![out_dim, in_dim], crate::dtype::Dtype::F32);
        Ok(Self {
            weight,
            norm,
            eps,
            in_dim,
            out_dim,
        })
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// `x: [n, in_dim] -> [n, out_dim]`, optionally pre-normed and with a
    /// LoRA delta summed in before the caller's residual add.
    pub fn forward(
        &self,
        kernel: &dyn KernelRunner,
        x: &GpuTensor,
        n: usize,
        lora: Option<&LoraDelta>,
        mut recorder: Option<&mut dyn CommandRecorder>,
    ) -> Result<GpuTensor> {
        let normed;
        let input = if let Some(ref norm) = self.norm {
            normed = kernel.rmsnorm(x, norm, self.eps, false, recorder.as_deref_mut())?;
            &normed
        } else {
            x
        };

        let out = kernel.matmul(
            input,
            &self.weight,
            n,
            self.out_dim,
            self.in_dim,
            TransposeB::True,
            MatmulRole::Projection,
            recorder.as_deref_mut(),
        )?;

        let Some(lora) = lora else {
            return Ok(out);
        };

        let low_rank = kernel.matmul(
            input,
            &lora.a,
            n,
            lora.rank,
            self.in_dim,
            TransposeB::True,
            MatmulRole::Projection,
            recorder.as_deref_mut(),
        )?;
        let delta = kernel.matmul(
            &low_rank,
            &lora.b,
            n,
            self.out_dim,
            lora.rank,
            TransposeB::True,
            MatmulRole::Projection,
            recorder.as_deref_mut(),
        )?;
        kernel.elementwise(&out, &delta, 0, recorder)
    }
}
