//! Final projection (C8): `final_norm` → `lm_head` → optional softcap.
//!
//! `lm_head` is either a dedicated weight or, when `tieWordEmbeddings` is
//! set, the embedding table reused transposed — both are plain `[V, H]`
//! matmul weights from the kernel façade's point of view. When the weight
//! was sharded at load time (oversized for one storage binding), each shard
//! covers a contiguous row range of the vocabulary; chunks are computed
//! independently and concatenated host-side, the same host-round-trip
//! pattern `nn::moe` uses for its masked combination.

use std::sync::Arc;

use wgpu::BufferUsages;

use crate::dtype::Dtype;
use crate::error::Result;
use crate::gpu::kernel::{CommandRecorder, GpuTensor, KernelRunner, MatmulRole, TransposeB};
use crate::model::config::ModelConfig;
use crate::model::weights::{WeightHandle, WeightStore};

enum LmHead {
    Dense(GpuTensor),
    /// `(shard weight [rows, hidden], row_offset)`, contiguous and ordered.
    Sharded(Vec<(GpuTensor, usize)>),
}

pub struct LogitsHead {
    device: Arc<wgpu::Device>,
    final_norm: GpuTensor,
    lm_head: LmHead,
    eps: f32,
    vocab_size: usize,
    hidden_size: usize,
    softcap: Option<f32>,
}

impl LogitsHead {
    pub fn load(device: Arc<wgpu::Device>, weights: &WeightStore, config: &ModelConfig) -> Result<Self> {
        let final_norm_handle = weights
            .get("final_norm.weight")
            .ok_or_else(|| crate::error::LoomError::MissingWeight("final_norm.weight".into()))?;
        let final_norm = GpuTensor::new(
            final_norm_handle
                .as_gpu_buffer()
                .cloned()
                .ok_or_else(|| crate::error::LoomError::Other("final_norm.weight: expected a single dense buffer".into()))?,
            final_norm_handle.shape().to_vec(),
            Dtype::F32,
        );

        let head_name = if config.tie_word_embeddings {
            "embed.weight"
        } else {
            "lm_head.weight"
        };
        let head_handle = weights
            .get(head_name)
            .ok_or_else(|| crate::error::LoomError::MissingWeight(head_name.into()))?;

        let lm_head = match head_handle {
            WeightHandle::GpuDense { buffer, shape, .. } => {
                LmHead::Dense(GpuTensor::new(buffer.clone(), shape.clone(), Dtype::F32))
            }
            WeightHandle::Quantized { shards, .. } if shards.len() == 1 => {
                LmHead::Dense(GpuTensor::new(
                    shards[0].clone(),
                    vec![config.vocab_size, config.hidden_size],
                    Dtype::F32,
                ))
            }
            WeightHandle::Quantized { shards, .. } => {
                let mut chunks = Vec::with_capacity(shards.len());
                let mut row_offset = 0;
                for shard in shards {
                    let rows = (shard.size() as usize) / (config.hidden_size * 4);
                    chunks.push((
                        GpuTensor::new(shard.clone(), vec![rows, config.hidden_size], Dtype::F32),
                        row_offset,
                    ));
                    row_offset += rows;
                }
                LmHead::Sharded(chunks)
            }
            WeightHandle::CpuDense { .. } => {
                return Err(crate::error::LoomError::Other(format!(
                    "{head_name}: lm_head weight must be GPU-resident"
                )))
            }
        };

        Ok(Self {
            device,
            final_norm,
            lm_head,
            eps: config.rms_norm_eps,
            vocab_size: config.vocab_size,
            hidden_size: config.hidden_size,
            softcap: config.final_logit_softcapping,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// `x: [n, hidden] -> [n, vocab]` raw logits, softcapped if configured.
    /// `n_out`, when less than the full vocabulary, restricts the computed
    /// columns to `[0, n_out)` and pads the remainder with `-inf` so callers
    /// always see a `vocab_size`-wide row.
    pub fn forward(
        &self,
        kernel: &dyn KernelRunner,
        x: &GpuTensor,
        n: usize,
        n_out: Option<usize>,
        mut recorder: Option<&mut dyn CommandRecorder>,
    ) -> Result<GpuTensor> {
        let normed = kernel.rmsnorm(x, &self.final_norm, self.eps, false, recorder.as_deref_mut())?;

        let logits = match &self.lm_head {
            LmHead::Dense(w) => kernel.matmul(
                &normed,
                w,
                n,
                self.vocab_size,
                self.hidden_size,
                TransposeB::True,
                MatmulRole::LmHead,
                recorder.as_deref_mut(),
            )?,
            LmHead::Sharded(chunks) => {
                let mut host = vec![0f32; n * self.vocab_size];
                for (weight, row_offset) in chunks {
                    let rows = weight.shape[0];
                    let part = kernel.matmul(
                        &normed,
                        weight,
                        n,
                        rows,
                        self.hidden_size,
                        TransposeB::True,
                        MatmulRole::LmHead,
                        recorder.as_deref_mut(),
                    )?;
                    let part_host = kernel.read_f32(&part)?;
                    for t in 0..n {
                        let dst = &mut host[t * self.vocab_size + row_offset..t * self.vocab_size + row_offset + rows];
                        dst.copy_from_slice(&part_host[t * rows..(t + 1) * rows]);
                    }
                }
                upload_f32(&self.device, &host, vec![n, self.vocab_size])
            }
        };

        let logits = if let Some(rows) = n_out.filter(|&r| r < self.vocab_size) {
            self.pad_to_vocab(kernel, &logits, n, rows)?
        } else {
            logits
        };

        match self.softcap {
            Some(c) => kernel.softcap(&logits, c, recorder),
            None => Ok(logits),
        }
    }

    fn pad_to_vocab(
        &self,
        kernel: &dyn KernelRunner,
        logits: &GpuTensor,
        n: usize,
        n_out: usize,
    ) -> Result<GpuTensor> {
        let computed = kernel.read_f32(logits)?;
        let mut padded = vec![f32::NEG_INFINITY; n * self.vocab_size];
        for t in 0..n {
            padded[t * self.vocab_size..t * self.vocab_size + n_out]
                .copy_from_slice(&computed[t * n_out..(t + 1) * n_out]);
        }
        Ok(upload_f32(&self.device, &padded, vec![n, self.vocab_size]))
    }
}

/// Host mirror of `shaders/softcap.wgsl`'s `y = cap * tanh(x / cap)`, kept in
/// sync with the kernel dispatch in `forward` so the formula has a plain unit
/// test independent of a GPU device.
#[allow(dead_code)]
fn softcap_value(x: f32, cap: f32) -> f32 {
    cap * (x / cap).tanh()
}

fn upload_f32(device: &wgpu::Device, data: &[f32], shape: Vec<usize>) -> GpuTensor {
    let bytes = bytemuck::cast_slice(data);
    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("logits_head_concat"),
        size: bytes.len().max(4) as u64,
        usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
        mapped_at_creation: true,
    });
    {
        let mut view = buffer.slice(..).get_mapped_range_mut();
        view[..bytes.len()].copy_from_slice(bytes);
    }
    buffer.unmap();
    GpuTensor::new(Arc::new(buffer), shape, Dtype::F32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softcap_saturates_large_logit_toward_cap() {
        let capped = softcap_value(1e6, 30.0);
        assert!((capped - 30.0).abs() < 1e-6);
    }

    #[test]
    fn softcap_is_near_identity_for_small_logits() {
        let capped = softcap_value(1.0, 30.0);
        assert!((capped - 1.0).abs() < 1e-3);
    }
}
