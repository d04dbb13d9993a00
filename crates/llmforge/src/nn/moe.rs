//! Mixture-of-experts feed-forward: a router projects hidden states onto
//! `num_experts` logits, the top-`k` experts per token are selected and
//! softmax-weighted, and their outputs are combined.
//!
//! The kernel façade has no masked gather/scatter or per-row scalar-multiply
//! primitive (§C3's contract only covers whole-tensor elementwise ops), so
//! routing decisions and the final weighted combination happen host-side via
//! `read_f32`/re-upload. This keeps every GPU op in the shipped contract at
//! the cost of a CPU round-trip per MoE layer — acceptable for the few-token
//! batches (decode: 1, prefill: prompt length) this runtime targets.

use std::sync::Arc;

use wgpu::BufferUsages;

use crate::dtype::Dtype;
use crate::error::Result;
use crate::gpu::kernel::{CommandRecorder, GpuTensor, KernelRunner};
use crate::model::config::{MoeConfig, ModelConfig};
use crate::model::weights::WeightStore;
use crate::nn::ffn::{Ffn, FfnLora};
use crate::nn::linear::Linear;

pub struct Moe {
    device: Arc<wgpu::Device>,
    router: Linear,
    experts: Vec<Ffn>,
    top_k: usize,
    routing_normalize: bool,
    hidden_size: usize,
}

impl Moe {
    pub fn load(
        device: Arc<wgpu::Device>,
        weights: &WeightStore,
        config: &ModelConfig,
        moe_config: &MoeConfig,
        layer: usize,
    ) -> Result<Self> {
        let prefix = format!("layer.{layer}");
        let router_handle = weights
            .get(&format!("{prefix}.router.weight"))
            .cloned()
            .ok_or_else(|| {
                crate::error::LoomError::MissingWeight(format!("{prefix}.router.weight"))
            })?;
        let router = Linear::new(
            &router_handle,
            None,
            config.rms_norm_eps,
            config.hidden_size,
            moe_config.num_experts,
        )?;

        let experts = (0..moe_config.num_experts)
            .map(|e| load_expert(weights, config, layer, e))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            device,
            router,
            experts,
            top_k: moe_config.top_k,
            routing_normalize: moe_config.routing_normalize,
            hidden_size: config.hidden_size,
        })
    }

    pub fn forward(
        &self,
        kernel: &dyn KernelRunner,
        x: &GpuTensor,
        n: usize,
        mut recorder: Option<&mut dyn CommandRecorder>,
    ) -> Result<GpuTensor> {
        let logits = self.router.forward(kernel, x, n, None, recorder.as_deref_mut())?;
        let logits_host = kernel.read_f32(&logits)?;

        let num_experts = self.experts.len();
        let mut routing = vec![Vec::with_capacity(self.top_k); n];
        for t in 0..n {
            routing[t] = top_k_softmax(
                &logits_host[t * num_experts..(t + 1) * num_experts],
                self.top_k,
                self.routing_normalize,
            );
        }

        let mut used: Vec<usize> = routing.iter().flatten().map(|(e, _)| *e).collect();
        used.sort_unstable();
        used.dedup();

        let mut expert_outputs = Vec::with_capacity(used.len());
        for &e in &used {
            let out = self.experts[e].forward(kernel, x, n, &FfnLora::default(), recorder.as_deref_mut())?;
            expert_outputs.push((e, kernel.read_f32(&out)?));
        }

        let mut combined = vec![0f32; n * self.hidden_size];
        for t in 0..n {
            for &(expert, weight) in &routing[t] {
                let (_, out) = expert_outputs.iter().find(|(e, _)| *e == expert).unwrap();
                let row = &out[t * self.hidden_size..(t + 1) * self.hidden_size];
                let dst = &mut combined[t * self.hidden_size..(t + 1) * self.hidden_size];
                for (d, v) in dst.iter_mut().zip(row) {
                    *d += weight * v;
                }
            }
        }

        Ok(upload_f32(&self.device, &combined, vec![n, self.hidden_size]))
    }
}

fn load_expert(weights: &WeightStore, config: &ModelConfig, layer: usize, expert: usize) -> Result<Ffn> {
    Ffn::load_prefixed(weights, config, &format!("layer.{layer}.expert.{expert}"))
}

/// Softmax the full logit row, then keep the `k` largest entries, optionally
/// renormalizing their weights to sum to 1 (spec.md's `routingNormalize`).
fn top_k_softmax(logits: &[f32], k: usize, normalize: bool) -> Vec<(usize, f32)> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    let probs: Vec<f32> = exps.iter().map(|&e| e / sum).collect();

    let mut indexed: Vec<(usize, f32)> = probs.into_iter().enumerate().collect();
    indexed.sort_unstable_by(|a, b| b.1.total_cmp(&a.1));
    indexed.truncate(k);

    if normalize {
        let total: f32 = indexed.iter().map(|(_, w)| w).sum();
        if total > 0.0 {
            for (_, w) in indexed.iter_mut() {
                *w /= total;
            }
        }
    }

    indexed
}

fn upload_f32(device: &wgpu::Device, data: &[f32], shape: Vec<usize>) -> GpuTensor {
    let bytes = bytemuck::cast_slice(data);
    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("moe_combined"),
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
    fn top_k_softmax_picks_largest_and_sums_near_one_when_normalized() {
        let logits = [1.0, 5.0, 0.5, 3.0];
        let picked = top_k_softmax(&logits, 2, true);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].0, 1);
        assert_eq!(picked[1].0, 3);
        let total: f32 = picked.iter().map(|(_, w)| w).sum();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn top_k_softmax_without_normalize_keeps_raw_softmax_weights() {
        let logits = [0.0, 0.0, 0.0, 0.0];
        let picked = top_k_softmax(&logits, 2, false);
        for (_, w) in picked {
            assert!((w - 0.25).abs() < 1e-5);
        }
    }
}
