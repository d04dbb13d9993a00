//! Per-layer state machine (C7): attn_norm → attention → residual →
//! ffn_norm → (dense FFN or MoE) → residual. Each projection accepts an
//! optional LoRA delta supplied by the caller for the currently enabled
//! adapter set.

use crate::error::Result;
use crate::gpu::kernel::{AttnMask, CommandRecorder, GpuTensor, KernelRunner};
use crate::model::config::ModelConfig;
use crate::model::weights::WeightStore;
use crate::nn::attention::{Attention, AttentionLora};
use crate::nn::ffn::{Ffn, FfnLora};
use crate::nn::kv_cache::KvCache;
use crate::nn::moe::Moe;
use crate::nn::rope_table::RopeTable;

enum Mlp {
    Dense(Ffn),
    Moe(Moe),
}

pub struct Layer {
    attn_norm: GpuTensor,
    ffn_norm: GpuTensor,
    attention: Attention,
    mlp: Mlp,
    eps: f32,
}

/// Per-layer LoRA deltas; every field defaults to "no adapter active" so a
/// layer with nothing enabled behaves identically to the base model.
#[derive(Default)]
pub struct LayerLora<'a> {
    pub attn: AttentionLora<'a>,
    pub ffn: FfnLora<'a>,
}

impl Layer {
    pub fn load(
        device: std::sync::Arc<wgpu::Device>,
        weights: &WeightStore,
        config: &ModelConfig,
        layer: usize,
    ) -> Result<Self> {
        let prefix = format!("layer.{layer}");
        let attn_norm = norm_tensor(weights, &format!("{prefix}.attn_norm.weight"))?;
        let ffn_norm = norm_tensor(weights, &format!("{prefix}.ffn_norm.weight"))?;

        let mlp = match &config.moe {
            Some(moe_config) => Mlp::Moe(Moe::load(device, weights, config, moe_config, layer)?),
            None => Mlp::Dense(Ffn::load(weights, config, layer)?),
        };

        Ok(Self {
            attn_norm,
            ffn_norm,
            attention: Attention::load(weights, config, layer)?,
            mlp,
            eps: config.rms_norm_eps,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        kernel: &dyn KernelRunner,
        x: &GpuTensor,
        n: usize,
        rope: &RopeTable,
        kv_cache: &mut KvCache,
        layer: usize,
        position_base: usize,
        mask: AttnMask,
        lora: &LayerLora<'_>,
        mut recorder: Option<&mut dyn CommandRecorder>,
    ) -> Result<GpuTensor> {
        let normed = kernel.rmsnorm(x, &self.attn_norm, self.eps, false, recorder.as_deref_mut())?;
        let attn_out = self.attention.forward(
            kernel,
            &normed,
            n,
            rope,
            kv_cache,
            layer,
            position_base,
            mask,
            &lora.attn,
            recorder.as_deref_mut(),
        )?;
        let residual = kernel.elementwise(x, &attn_out, 0, recorder.as_deref_mut())?;

        let normed = kernel.rmsnorm(&residual, &self.ffn_norm, self.eps, false, recorder.as_deref_mut())?;
        let mlp_out = match &self.mlp {
            Mlp::Dense(ffn) => ffn.forward(kernel, &normed, n, &lora.ffn, recorder.as_deref_mut())?,
            Mlp::Moe(moe) => moe.forward(kernel, &normed, n, recorder.as_deref_mut())?,
        };

        kernel.elementwise(&residual, &mlp_out, 0, recorder)
    }
}

fn norm_tensor(weights: &WeightStore, name: &str) -> Result<GpuTensor> {
    let handle = weights
        .get(name)
        .ok_or_else(|| crate::error::LoomError::MissingWeight(name.to_string()))?;
    let buffer = handle
        .as_gpu_buffer()
        .cloned()
        .ok_or_else(|| crate::error::LoomError::Other(format!("{name}: expected a single dense buffer")))?;
    Ok(GpuTensor::new(buffer, handle.shape().to_vec(), crate::dtype::Dtype::F32))
}
