//! Top-level model manifest parser (C11): validates the on-disk JSON
//! describing architecture, quantization, and shard layout, and exposes a
//! `ModelConfig` plus the tensor→shard offset map to the weight loader.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{LoomError, Result};
use crate::model::config::{Activation, ModelConfig, MoeConfig, QuantizationKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Architecture {
    pub num_layers: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub head_dim: usize,
    pub vocab_size: usize,
    pub max_seq_len: usize,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f32,
    #[serde(default)]
    pub activation: Option<String>,
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

fn default_rms_norm_eps() -> f32 {
    1e-5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoeManifestConfig {
    pub num_experts: usize,
    pub top_k: usize,
    #[serde(default)]
    pub routing_normalize: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardEntry {
    pub filename: String,
    pub size: u64,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorEntry {
    pub shape: Vec<usize>,
    pub dtype: String,
    pub shard: usize,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelManifest {
    pub model_id: String,
    pub model_type: String,
    pub architecture: Architecture,
    pub quantization: String,
    pub shards: Vec<ShardEntry>,
    pub tensors: HashMap<String, TensorEntry>,
    #[serde(default, rename = "moeConfig")]
    pub moe_config: Option<MoeManifestConfig>,
    #[serde(default, rename = "ropeTheta")]
    pub rope_theta: Option<f32>,
    #[serde(default, rename = "ropeLocalTheta")]
    pub rope_local_theta: Option<f32>,
    #[serde(default, rename = "ropeScaling")]
    pub rope_scaling: Option<f32>,
    #[serde(default, rename = "embeddingScale")]
    pub embedding_scale: Option<f32>,
    #[serde(default, rename = "finalLogitSoftcapping")]
    pub final_logit_softcapping: Option<f32>,
}

/// Parse and validate a manifest from raw JSON bytes.
pub fn parse_manifest(bytes: &[u8]) -> Result<ModelManifest> {
    let manifest: ModelManifest = serde_json::from_slice(bytes)?;
    validate_manifest(&manifest)?;
    Ok(manifest)
}

/// Structural checks beyond what serde's required fields already enforce:
/// every tensor's `shard` index must land inside `shards`, and GQA/head-dim
/// arithmetic must be internally consistent.
pub fn validate_manifest(manifest: &ModelManifest) -> Result<()> {
    let arch = &manifest.architecture;

    if arch.num_attention_heads == 0 || arch.num_key_value_heads == 0 {
        return Err(LoomError::InvalidManifest {
            field: "architecture.numAttentionHeads".into(),
            reason: "must be non-zero".into(),
        });
    }
    if arch.num_attention_heads % arch.num_key_value_heads != 0 {
        return Err(LoomError::InvalidManifest {
            field: "architecture.numKeyValueHeads".into(),
            reason: "numAttentionHeads must be a multiple of numKeyValueHeads".into(),
        });
    }

    for (name, entry) in &manifest.tensors {
        if entry.shard >= manifest.shards.len() {
            return Err(LoomError::InvalidManifest {
                field: format!("tensors.{name}.shard"),
                reason: format!("shard index {} out of range", entry.shard),
            });
        }
    }

    Ok(())
}

/// Build the architecture/quantization/feature portion of `ModelConfig`
/// from a validated manifest. Weight loading is a separate step (C5).
pub fn config_from_manifest(manifest: &ModelManifest) -> Result<ModelConfig> {
    let arch = &manifest.architecture;

    let activation = match arch.activation.as_deref() {
        Some("relu2") => Activation::Relu2,
        Some("silu") => Activation::Silu,
        Some("swiglu") => Activation::Swiglu,
        Some("gelu") => Activation::Gelu,
        Some(other) => {
            return Err(LoomError::InvalidManifest {
                field: "architecture.activation".into(),
                reason: format!("unknown activation '{other}'"),
            })
        }
        None => Activation::Silu,
    };

    let quantization = match manifest.quantization.as_str() {
        "f32" => QuantizationKind::F32,
        "f16" => QuantizationKind::F16,
        "bf16" => QuantizationKind::Bf16,
        "i2_s" | "ternary" => QuantizationKind::TernaryI2S,
        other => {
            return Err(LoomError::InvalidManifest {
                field: "quantization".into(),
                reason: format!("unknown quantization '{other}'"),
            })
        }
    };

    Ok(ModelConfig {
        vocab_size: arch.vocab_size,
        hidden_size: arch.hidden_size,
        intermediate_size: arch.intermediate_size,
        num_hidden_layers: arch.num_layers,
        num_attention_heads: arch.num_attention_heads,
        num_key_value_heads: arch.num_key_value_heads,
        max_position_embeddings: arch.max_seq_len,
        rms_norm_eps: arch.rms_norm_eps,
        rope_theta: manifest.rope_theta.unwrap_or(10000.0),
        rope_theta_local: manifest.rope_local_theta,
        tie_word_embeddings: arch.tie_word_embeddings,
        activation,
        embedding_scale: manifest.embedding_scale,
        final_logit_softcapping: manifest.final_logit_softcapping,
        moe: manifest.moe_config.as_ref().map(|m| MoeConfig {
            num_experts: m.num_experts,
            top_k: m.top_k,
            routing_normalize: m.routing_normalize,
        }),
        quantization,
    })
}

/// `scale = alpha / rank`, shared by the model-side quantization scale
/// bookkeeping and the LoRA adapter's own `computeLoRAScale` (lora::manifest).
pub fn compute_scale(alpha: f32, rank: usize) -> f32 {
    alpha / rank as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> ModelManifest {
        ModelManifest {
            model_id: "test-model".into(),
            model_type: "llama".into(),
            architecture: Architecture {
                num_layers: 2,
                hidden_size: 64,
                intermediate_size: 128,
                num_attention_heads: 8,
                num_key_value_heads: 2,
                head_dim: 8,
                vocab_size: 1000,
                max_seq_len: 512,
                rms_norm_eps: 1e-5,
                activation: Some("silu".into()),
                tie_word_embeddings: false,
            },
            quantization: "f16".into(),
            shards: vec![ShardEntry {
                filename: "model-00000.safetensors".into(),
                size: 1024,
                hash: "deadbeef".into(),
            }],
            tensors: HashMap::new(),
            moe_config: None,
            rope_theta: Some(10000.0),
            rope_local_theta: None,
            rope_scaling: None,
            embedding_scale: None,
            final_logit_softcapping: None,
        }
    }

    #[test]
    fn rejects_non_divisible_gqa_heads() {
        let mut m = sample_manifest();
        m.architecture.num_attention_heads = 7;
        m.architecture.num_key_value_heads = 2;
        assert!(validate_manifest(&m).is_err());
    }

    #[test]
    fn rejects_out_of_range_shard_index() {
        let mut m = sample_manifest();
        m.tensors.insert(
            "model.embed_tokens.weight".into(),
            TensorEntry {
                shape: vec![1000, 64],
                dtype: "f16".into(),
                shard: 5,
                offset: 0,
                length: 128000,
            },
        );
        assert!(validate_manifest(&m).is_err());
    }

    #[test]
    fn config_from_manifest_round_trips_architecture() {
        let m = sample_manifest();
        let config = config_from_manifest(&m).unwrap();
        assert_eq!(config.hidden_size, 64);
        assert_eq!(config.gqa_group_size(), 4);
    }

    #[test]
    fn compute_scale_matches_alpha_over_rank() {
        assert!((compute_scale(16.0, 8) - 2.0).abs() < 1e-6);
    }
}
