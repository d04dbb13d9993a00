/// Model architecture configuration, fixed for the lifetime of a loaded
/// model (§4.1's "immutable after load" block).
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub max_position_embeddings: usize,
    pub rms_norm_eps: f32,
    pub rope_theta: f32,
    /// Local (sliding-window-layer) RoPE base, when the architecture
    /// alternates global/local attention. `None` means every layer uses
    /// `rope_theta`.
    pub rope_theta_local: Option<f32>,
    pub tie_word_embeddings: bool,
    pub activation: Activation,
    /// Scale applied to embedding lookups before layer 0, e.g. `sqrt(H)`.
    pub embedding_scale: Option<f32>,
    /// Final-logit softcap `c`; when set, `y = tanh(y/c) * c` is applied to
    /// the raw LM-head output before sampling.
    pub final_logit_softcapping: Option<f32>,
    pub moe: Option<MoeConfig>,
    pub quantization: QuantizationKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu2,
    Silu,
    Swiglu,
    Gelu,
}

/// Mixture-of-experts router/combination parameters (§4.3's MoE path).
#[derive(Debug, Clone, Copy)]
pub struct MoeConfig {
    pub num_experts: usize,
    pub top_k: usize,
    pub routing_normalize: bool,
}

/// Tag carried through from the manifest describing how dense weights are
/// stored on disk; the weight loader and kernel façade branch on this to
/// pick a `WeightHandle` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantizationKind {
    F32,
    F16,
    Bf16,
    TernaryI2S,
}

impl ModelConfig {
    /// Head dimension = hidden_size / num_attention_heads
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// GQA group size = num_attention_heads / num_key_value_heads
    pub fn gqa_group_size(&self) -> usize {
        self.num_attention_heads / self.num_key_value_heads
    }
}

/// Default config for microsoft/bitnet-b1.58-2B-4T
pub fn bitnet_2b_4t_config() -> ModelConfig {
    ModelConfig {
        vocab_size: 128256,
        hidden_size: 2560,
        intermediate_size: 6912,
        num_hidden_layers: 30,
        num_attention_heads: 20,
        num_key_value_heads: 5,
        max_position_embeddings: 4096,
        rms_norm_eps: 1e-5,
        rope_theta: 500000.0,
        rope_theta_local: None,
        tie_word_embeddings: true,
        activation: Activation::Relu2,
        embedding_scale: None,
        final_logit_softcapping: None,
        moe: None,
        quantization: QuantizationKind::TernaryI2S,
    }
}

/// Default config for 1bitLLM/bitnet_b1_58-large (0.7B)
pub fn bitnet_0_7b_config() -> ModelConfig {
    ModelConfig {
        vocab_size: 32002,
        hidden_size: 1536,
        intermediate_size: 4096,
        num_hidden_layers: 24,
        num_attention_heads: 16,
        num_key_value_heads: 16,
        max_position_embeddings: 2048,
        rms_norm_eps: 1e-6,
        rope_theta: 10000.0,
        rope_theta_local: None,
        tie_word_embeddings: false,
        activation: Activation::Silu,
        embedding_scale: None,
        final_logit_softcapping: None,
        moe: None,
        quantization: QuantizationKind::TernaryI2S,
    }
}
