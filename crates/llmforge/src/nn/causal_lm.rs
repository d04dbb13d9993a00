//! Whole-model forward: embedding lookup → N layers → logits head. This is
//! the per-step orchestration `Generator` drives; everything GPU-specific
//! below this point goes through the kernel façade, never a raw encoder.

use std::sync::Arc;

use wgpu::BufferUsages;

use crate::dtype::Dtype;
use crate::error::{LoomError, Result};
use crate::gpu::kernel::{AttnMask, CommandRecorder, GpuTensor, KernelRunner};
use crate::model::config::ModelConfig;
use crate::model::weights::WeightStore;
use crate::nn::kv_cache::KvCache;
use crate::nn::layer::{Layer, LayerLora};
use crate::nn::logits_head::LogitsHead;
use crate::nn::rope_table::RopeTable;

/// Per-layer LoRA state for a whole forward pass, indexed by layer.
#[derive(Default)]
pub struct ModelLora<'a> {
    pub per_layer: std::collections::HashMap<usize, LayerLora<'a>>,
}

impl<'a> ModelLora<'a> {
    fn for_layer(&self, layer: usize) -> LayerLora<'_> {
        match self.per_layer.get(&layer) {
            Some(l) => LayerLora {
                attn: crate::nn::attention::AttentionLora {
                    q: l.attn.q,
                    k: l.attn.k,
                    v: l.attn.v,
                    o: l.attn.o,
                },
                ffn: crate::nn::ffn::FfnLora {
                    gate: l.ffn.gate,
                    up: l.ffn.up,
                    down: l.ffn.down,
                },
            },
            None => LayerLora::default(),
        }
    }
}

pub struct CausalLm {
    device: Arc<wgpu::Device>,
    embed: GpuTensor,
    layers: Vec<Layer>,
    logits_head: LogitsHead,
    rope_global: RopeTable,
    rope_local: Option<RopeTable>,
    embedding_scale: Option<f32>,
    hidden_size: usize,
}

impl CausalLm {
    pub fn load(
        device: Arc<wgpu::Device>,
        weights: &WeightStore,
        config: &ModelConfig,
        max_seq_len: usize,
    ) -> Result<Self> {
        let embed_handle = weights
            .get("embed.weight")
            .ok_or_else(|| LoomError::MissingWeight("embed.weight".into()))?;
        let embed = GpuTensor::new(
            embed_handle
                .as_gpu_buffer()
                .cloned()
                .ok_or_else(|| LoomError::Other("embed.weight: expected a single dense buffer".into()))?,
            vec![config.vocab_size, config.hidden_size],
            Dtype::F32,
        );

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(Layer::load(Arc::clone(&device), weights, config, i)?);
        }

        let logits_head = LogitsHead::load(Arc::clone(&device), weights, config)?;

        let rope_global = RopeTable::build(&device, config.rope_theta, max_seq_len, config.head_dim());
        let rope_local = config
            .rope_theta_local
            .map(|theta| RopeTable::build(&device, theta, max_seq_len, config.head_dim()));

        Ok(Self {
            device,
            embed,
            layers,
            logits_head,
            rope_global,
            rope_local,
            embedding_scale: config.embedding_scale,
            hidden_size: config.hidden_size,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.logits_head.vocab_size()
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Runs `token_ids` through the model, appending to `kv_cache` at
    /// `position_base`. `mask` is `Causal` for multi-token prefill, `None`
    /// for a single-token decode step. `n_out` restricts the logits row
    /// width (vocab padding), e.g. a quantization-padded vocabulary.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        kernel: &dyn KernelRunner,
        token_ids: &[u32],
        kv_cache: &mut KvCache,
        position_base: usize,
        mask: AttnMask,
        n_out: Option<usize>,
        lora: &ModelLora<'_>,
        mut recorder: Option<&mut dyn CommandRecorder>,
    ) -> Result<GpuTensor> {
        let n = token_ids.len();
        kv_cache.check_capacity(n)?;

        let mut hidden = kernel.embedding(token_ids, &self.embed, self.hidden_size, recorder.as_deref_mut())?;
        if let Some(scale) = self.embedding_scale {
            hidden = self.scale_hidden(kernel, &hidden, scale)?;
        }

        for (i, layer) in self.layers.iter().enumerate() {
            let rope = if i % 2 == 1 {
                self.rope_local.as_ref().unwrap_or(&self.rope_global)
            } else {
                &self.rope_global
            };
            hidden = layer.forward(
                kernel,
                &hidden,
                n,
                rope,
                kv_cache,
                i,
                position_base,
                mask,
                &lora.for_layer(i),
                recorder.as_deref_mut(),
            )?;
        }

        kv_cache.advance(n)?;

        self.logits_head.forward(kernel, &hidden, n, n_out, recorder)
    }

    /// Host round-trip scalar multiply: the kernel façade has no
    /// broadcast-scalar primitive, so embedding scaling (used by a handful
    /// of architectures that scale by `sqrt(hidden_size)`) goes through CPU
    /// the same way `nn::moe`'s combination step does.
    fn scale_hidden(&self, kernel: &dyn KernelRunner, x: &GpuTensor, scale: f32) -> Result<GpuTensor> {
        let mut host = kernel.read_f32(x)?;
        for v in host.iter_mut() {
            *v *= scale;
        }
        let bytes = bytemuck::cast_slice(&host);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("embedding_scale"),
            size: bytes.len().max(4) as u64,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            mapped_at_creation: true,
        });
        {
            let mut view = buffer.slice(..).get_mapped_range_mut();
            view[..bytes.len()].copy_from_slice(bytes);
        }
        buffer.unmap();
        Ok(GpuTensor::new(Arc::new(buffer), x.shape.clone(), x.dtype))
    }
}
