//! Grouped-query attention block: q/k/v projections (optionally LoRA-composed)
//! → RoPE → append to the layer's KV cache → scaled dot-product attention
//! with a causal mask on prefill, none on decode → output projection.

use crate::error::Result;
use crate::gpu::kernel::{AttnMask, CommandRecorder, GpuTensor, KernelRunner};
use crate::model::config::ModelConfig;
use crate::model::weights::WeightStore;
use crate::nn::kv_cache::KvCache;
use crate::nn::linear::{Linear, LoraDelta};
use crate::nn::rope_table::RopeTable;

/// Active LoRA deltas for this layer's four attention projections; `None`
/// slots simply fall through to the base projection untouched.
#[derive(Default)]
pub struct AttentionLora<'a> {
    pub q: Option<&'a LoraDelta>,
    pub k: Option<&'a LoraDelta>,
    pub v: Option<&'a LoraDelta>,
    pub o: Option<&'a LoraDelta>,
}

pub struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_q_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    pub fn load(weights: &WeightStore, config: &ModelConfig, layer: usize) -> Result<Self> {
        let prefix = format!("layer.{layer}");
        let h = config.hidden_size;
        let head_dim = config.head_dim();
        let num_q_heads = config.num_attention_heads;
        let num_kv_heads = config.num_key_value_heads;

        let get = |slot: &str| -> Result<_> {
            weights
                .get(&format!("{prefix}.{slot}.weight"))
                .cloned()
                .ok_or_else(|| {
                    crate::error::LoomError::MissingWeight(format!("{prefix}.{slot}.weight"))
                })
        };

        Ok(Self {
            q_proj: Linear::new(&get("q_proj")?, None, config.rms_norm_eps, h, num_q_heads * head_dim)?,
            k_proj: Linear::new(&get("k_proj")?, None, config.rms_norm_eps, h, num_kv_heads * head_dim)?,
            v_proj: Linear::new(&get("v_proj")?, None, config.rms_norm_eps, h, num_kv_heads * head_dim)?,
            o_proj: Linear::new(&get("o_proj")?, None, config.rms_norm_eps, num_q_heads * head_dim, h)?,
            num_q_heads,
            num_kv_heads,
            head_dim,
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
        lora: &AttentionLora<'_>,
        mut recorder: Option<&mut dyn CommandRecorder>,
    ) -> Result<GpuTensor> {
        let q = self.q_proj.forward(kernel, x, n, lora.q, recorder.as_deref_mut())?;
        let k = self.k_proj.forward(kernel, x, n, lora.k, recorder.as_deref_mut())?;
        let v = self.v_proj.forward(kernel, x, n, lora.v, recorder.as_deref_mut())?;

        let q = reshape_heads(q, n, self.num_q_heads, self.head_dim);
        let k = reshape_heads(k, n, self.num_kv_heads, self.head_dim);
        let v = reshape_heads(v, n, self.num_kv_heads, self.head_dim);

        let (q, k) = kernel.rope(&q, &k, &rope.cos, &rope.sin, position_base, recorder.as_deref_mut())?;

        kernel.append_kv(
            &kv_cache.key_buffer(layer),
            &kv_cache.value_buffer(layer),
            &k,
            &v,
            kv_cache.seq_len(),
            recorder.as_deref_mut(),
        )?;

        let seq_len = kv_cache.seq_len() + n;
        let attn_out = kernel.attention(
            &q,
            &kv_cache.key_buffer(layer),
            &kv_cache.value_buffer(layer),
            seq_len,
            self.num_q_heads,
            self.num_kv_heads,
            self.head_dim,
            mask,
            recorder.as_deref_mut(),
        )?;

        let attn_out = GpuTensor::new(
            attn_out.buffer,
            vec![n, self.num_q_heads * self.head_dim],
            attn_out.dtype,
        );

        self.o_proj.forward(kernel, &attn_out, n, lora.o, recorder)
    }
}

/// Reinterprets a `[n, num_heads*head_dim]` projection output as
/// `[n, num_heads, head_dim]` for the rope/attention kernel entry points —
/// the underlying buffer layout is identical, only the shape metadata
/// changes.
fn reshape_heads(t: GpuTensor, n: usize, num_heads: usize, head_dim: usize) -> GpuTensor {
    GpuTensor::new(t.buffer, vec![n, num_heads, head_dim], t.dtype)
}
