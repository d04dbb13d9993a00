use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::dtype::{convert_bf16_bytes_to_f32, convert_f16_bytes_to_f32, Dtype};
use crate::error::{LoomError, Result};
use crate::model::config::{Activation, ModelConfig};
use crate::model::gguf::{self, GgufMetadata, GgufParser, GgufValue, GGML_TYPE_F16, GGML_TYPE_I2_S};
use crate::model::manifest::{config_from_manifest, parse_manifest, ModelManifest};
use crate::model::safetensors::SafetensorsFile;
use crate::model::weights::WeightStore;

/// Stages reported through `LoadOptions::on_progress`, matching the
/// generator's own stage vocabulary so a UI can show one continuous bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    Manifest,
    Shards,
    Layers,
    Tokenizer,
    Finalize,
}

#[derive(Debug, Clone)]
pub struct LoadProgress {
    pub phase: LoadPhase,
    pub loaded: u64,
    pub total: u64,
    pub fraction: f64,
}

#[derive(Default)]
pub struct LoadOptions {
    pub on_progress: Option<Box<dyn Fn(LoadProgress) + Send>>,
    pub cache_dir: Option<PathBuf>,
}

pub struct LoadResult {
    pub config: ModelConfig,
    pub weights: WeightStore,
    pub metadata: Option<GgufMetadata>,
}

/// Byte-range access to a manifest's shard files. The core only needs
/// `load_shard(index) -> bytes`; how bytes get there (disk, OPFS, HTTP) is
/// entirely the implementor's concern.
#[async_trait]
pub trait ShardLoader: Send + Sync {
    async fn load_shard(&self, index: usize, filename: &str) -> Result<Vec<u8>>;
}

/// Fetches shard files relative to a base directory or URL prefix, with the
/// same disk cache used for single-file downloads.
pub struct HttpShardLoader {
    base: String,
    cache_dir: Option<PathBuf>,
}

impl HttpShardLoader {
    pub fn new(base: impl Into<String>, cache_dir: Option<PathBuf>) -> Self {
        Self {
            base: base.into(),
            cache_dir,
        }
    }
}

#[async_trait]
impl ShardLoader for HttpShardLoader {
    async fn load_shard(&self, _index: usize, filename: &str) -> Result<Vec<u8>> {
        let source = format!("{}/{}", self.base.trim_end_matches('/'), filename);
        fetch_bytes(&source, self.cache_dir.as_deref(), &|_| {}).await
    }
}

/// Load a model from a URL or local path. Dispatches on the source
/// extension: a `.gguf` file goes through the legacy single-file path
/// (§ gguf.rs); anything else is treated as a top-level JSON manifest whose
/// shards are safetensors files sitting alongside it.
pub async fn load_model(
    source: &str,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    options: LoadOptions,
) -> Result<LoadResult> {
    if source.ends_with(".gguf") {
        return load_gguf_source(source, device, queue, options).await;
    }

    let progress = |p: LoadProgress| {
        if let Some(ref cb) = options.on_progress {
            cb(p);
        }
    };

    progress(LoadProgress {
        phase: LoadPhase::Manifest,
        loaded: 0,
        total: 1,
        fraction: 0.0,
    });

    let manifest_bytes = fetch_bytes(source, options.cache_dir.as_deref(), &progress).await?;
    let manifest = parse_manifest(&manifest_bytes)?;
    let config = config_from_manifest(&manifest)?;

    progress(LoadProgress {
        phase: LoadPhase::Manifest,
        loaded: 1,
        total: 1,
        fraction: 1.0,
    });

    let base = source.rsplit_once('/').map(|(dir, _)| dir).unwrap_or(".");
    let shard_loader = HttpShardLoader::new(base, options.cache_dir.clone());
    let weights =
        load_weights_from_manifest(&manifest, &shard_loader, &device, &queue, &progress).await?;

    progress(LoadProgress {
        phase: LoadPhase::Finalize,
        loaded: 1,
        total: 1,
        fraction: 1.0,
    });

    Ok(LoadResult {
        config,
        weights,
        metadata: None,
    })
}

async fn load_weights_from_manifest(
    manifest: &ModelManifest,
    shard_loader: &dyn ShardLoader,
    device: &Arc<wgpu::Device>,
    queue: &Arc<wgpu::Queue>,
    progress: &dyn Fn(LoadProgress),
) -> Result<WeightStore> {
    let max_binding = device.limits().max_storage_buffer_binding_size as u64;
    let mut store = WeightStore::new(Arc::clone(device), Arc::clone(queue));

    let mut shard_bytes = Vec::with_capacity(manifest.shards.len());
    for (i, shard) in manifest.shards.iter().enumerate() {
        let bytes = shard_loader.load_shard(i, &shard.filename).await?;
        verify_shard_hash(&bytes, &shard.hash)?;
        shard_bytes.push(SafetensorsFile::parse(&bytes)?);
        progress(LoadProgress {
            phase: LoadPhase::Shards,
            loaded: (i + 1) as u64,
            total: manifest.shards.len() as u64,
            fraction: (i + 1) as f64 / manifest.shards.len() as f64,
        });
    }

    let total_tensors = manifest.tensors.len();
    for (i, (name, entry)) in manifest.tensors.iter().enumerate() {
        let shard = shard_bytes
            .get(entry.shard)
            .ok_or_else(|| LoomError::InvalidManifest {
                field: format!("tensors.{name}.shard"),
                reason: "shard index out of range".into(),
            })?;
        let raw = shard.tensor_bytes(name).ok_or_else(|| LoomError::MissingWeight(name.clone()))?;
        let dtype = Dtype::from_safetensors_str(&entry.dtype).ok_or_else(|| LoomError::InvalidManifest {
            field: format!("tensors.{name}.dtype"),
            reason: format!("unsupported dtype '{}'", entry.dtype),
        })?;

        let (upload_bytes, upload_dtype): (Vec<u8>, Dtype) = match dtype {
            Dtype::F16 => (convert_f16_bytes_to_f32(raw), Dtype::F32),
            Dtype::Bf16 => (convert_bf16_bytes_to_f32(raw), Dtype::F32),
            _ => (raw.to_vec(), dtype),
        };

        if let Some(prefix) = name.strip_suffix(".gate_up_proj.weight") {
            split_gate_up(&mut store, prefix, &upload_bytes, upload_dtype, &entry.shape, max_binding);
        } else {
            store.upload_dense(name, &upload_bytes, upload_dtype, entry.shape.clone(), max_binding);
        }

        progress(LoadProgress {
            phase: LoadPhase::Layers,
            loaded: (i + 1) as u64,
            total: total_tensors as u64,
            fraction: (i + 1) as f64 / total_tensors as f64,
        });
    }

    Ok(store)
}

/// A fused `gate_up_proj` weight (`[2*intermediate, hidden]`, gate rows
/// first) is split into separate `gate_proj`/`up_proj` entries at load time
/// rather than carried as one tensor, since the kernel façade's matmul has no
/// notion of a sub-buffer view — `nn::ffn` only ever sees two ordinary
/// projections.
fn split_gate_up(
    store: &mut WeightStore,
    prefix: &str,
    bytes: &[u8],
    dtype: Dtype,
    shape: &[usize],
    max_binding: u64,
) {
    let rows = shape[0];
    let cols: usize = shape[1..].iter().product();
    let row_bytes = cols * dtype.byte_size();
    let half_rows = rows / 2;
    let split = half_rows * row_bytes;
    let mut gate_shape = shape.to_vec();
    gate_shape[0] = half_rows;

    store.upload_dense(
        &format!("{prefix}.gate_proj.weight"),
        &bytes[..split],
        dtype,
        gate_shape.clone(),
        max_binding,
    );
    store.upload_dense(
        &format!("{prefix}.up_proj.weight"),
        &bytes[split..],
        dtype,
        gate_shape,
        max_binding,
    );
}

fn verify_shard_hash(bytes: &[u8], expected_hex: &str) -> Result<()> {
    if expected_hex.is_empty() {
        return Ok(());
    }
    let actual = format!("{:x}", Sha256::digest(bytes));
    if actual != expected_hex {
        return Err(LoomError::IntegrityFailure(format!(
            "shard hash mismatch: expected {expected_hex}, got {actual}"
        )));
    }
    Ok(())
}

// --- Legacy single-file GGUF path ---

async fn load_gguf_source(
    source: &str,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    options: LoadOptions,
) -> Result<LoadResult> {
    let progress = |p: LoadProgress| {
        if let Some(ref cb) = options.on_progress {
            cb(p);
        }
    };

    progress(LoadProgress {
        phase: LoadPhase::Shards,
        loaded: 0,
        total: 0,
        fraction: 0.0,
    });

    let data = fetch_bytes(source, options.cache_dir.as_deref(), &progress).await?;

    progress(LoadProgress {
        phase: LoadPhase::Manifest,
        loaded: 0,
        total: 1,
        fraction: 0.0,
    });

    load_gguf(&data, device, queue, &progress)
}

fn load_gguf(
    data: &[u8],
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    progress: &dyn Fn(LoadProgress),
) -> Result<LoadResult> {
    let mut parser = GgufParser::new(data);
    let gguf = parser.parse()?;

    let mut config = config_from_gguf_metadata(&gguf.metadata);

    let has_output_weight = gguf.tensors.iter().any(|t| t.name == "output.weight");
    config.tie_word_embeddings = !has_output_weight;

    debug!(
        "config: heads={}, kv_heads={}, head_dim={}, hidden={}, intermediate={}, layers={}, tied={}",
        config.num_attention_heads,
        config.num_key_value_heads,
        config.head_dim(),
        config.hidden_size,
        config.intermediate_size,
        config.num_hidden_layers,
        config.tie_word_embeddings,
    );

    let mut store = WeightStore::new(Arc::clone(&device), Arc::clone(&queue));
    let max_binding = device.limits().max_storage_buffer_binding_size as u64;
    let total_tensors = gguf.tensors.len();

    for (i, tensor) in gguf.tensors.iter().enumerate() {
        let data_offset = gguf.tensor_data_offset + tensor.offset as usize;

        let num_elements: u64 = tensor.shape.iter().product();
        let byte_size = if tensor.tensor_type == GGML_TYPE_I2_S {
            num_elements.div_ceil(4) as usize + 32
        } else {
            let elem_size = gguf::ggml_type_size(tensor.tensor_type)?;
            (num_elements as f64 * elem_size).ceil() as usize
        };

        let tensor_data = &data[data_offset..data_offset + byte_size];
        let hf_name = remap_gguf_name(&tensor.name);
        let shape: Vec<usize> = tensor.shape.iter().map(|&d| d as usize).collect();

        debug!(
            "tensor: {} -> {} (type={}, {} bytes)",
            tensor.name, hf_name, tensor.tensor_type, byte_size
        );

        if tensor.tensor_type == GGML_TYPE_I2_S {
            let packed_bytes = num_elements.div_ceil(4) as usize;
            let weight_data = &tensor_data[..packed_bytes];
            store.upload_dense(&hf_name, weight_data, Dtype::U16, shape.clone(), max_binding);

            let scale_bytes = &tensor_data[packed_bytes..packed_bytes + 4];
            let tensor_scale = f32::from_le_bytes(scale_bytes.try_into().unwrap());
            let out_dim = tensor.shape.get(1).copied().unwrap_or(1) as usize;
            let scale_name = hf_name.replace(".weight", ".weight_scale");
            let scale_data: Vec<u8> = std::iter::repeat_n(tensor_scale.to_le_bytes(), out_dim)
                .flatten()
                .collect();
            store.upload_dense(&scale_name, &scale_data, Dtype::F32, vec![out_dim], max_binding);
        } else if tensor.tensor_type == GGML_TYPE_F16 {
            if hf_name == "model.embed_tokens.weight" {
                store.upload_dense(&hf_name, tensor_data, Dtype::F16, shape, max_binding);
            } else {
                let f32_bytes = convert_f16_bytes_to_f32(tensor_data);
                store.upload_dense(&hf_name, &f32_bytes, Dtype::F32, shape, max_binding);
            }
        } else {
            store.upload_dense(&hf_name, tensor_data, Dtype::F32, shape, max_binding);
        }

        progress(LoadProgress {
            phase: LoadPhase::Layers,
            loaded: (i + 1) as u64,
            total: total_tensors as u64,
            fraction: (i + 1) as f64 / total_tensors as f64,
        });
    }

    info!("{} tensors loaded", total_tensors);

    create_dummy_scales(&mut store, &config, max_binding);

    progress(LoadProgress {
        phase: LoadPhase::Finalize,
        loaded: 1,
        total: 1,
        fraction: 1.0,
    });

    Ok(LoadResult {
        config,
        weights: store,
        metadata: Some(gguf.metadata),
    })
}

fn remap_gguf_name(name: &str) -> String {
    match name {
        "token_embd.weight" => return "embed.weight".to_string(),
        "output_norm.weight" => return "final_norm.weight".to_string(),
        "output.weight" => return "lm_head.weight".to_string(),
        _ => {}
    }

    if let Some(rest) = name.strip_prefix("blk.") {
        if let Some(dot_pos) = rest.find('.') {
            let layer = &rest[..dot_pos];
            let component = &rest[dot_pos + 1..];
            let prefix = format!("layer.{layer}");

            let mapped = match component {
                "attn_q.weight" => "q_proj.weight",
                "attn_k.weight" => "k_proj.weight",
                "attn_v.weight" => "v_proj.weight",
                "attn_output.weight" => "o_proj.weight",
                "attn_norm.weight" => "attn_norm.weight",
                "ffn_norm.weight" => "ffn_norm.weight",
                "attn_sub_norm.weight" => "attn_sub_norm.weight",
                "ffn_sub_norm.weight" => "ffn_sub_norm.weight",
                "ffn_up.weight" => "up_proj.weight",
                "ffn_down.weight" => "down_proj.weight",
                "ffn_gate.weight" => "gate_proj.weight",
                other => return format!("{prefix}.{other}"),
            };
            return format!("{prefix}.{mapped}");
        }
    }

    name.to_string()
}

fn config_from_gguf_metadata(metadata: &GgufMetadata) -> ModelConfig {
    let arch = metadata
        .get("general.architecture")
        .and_then(|v| v.as_str())
        .unwrap_or("bitnet")
        .to_string();

    let get = |suffix: &str| -> Option<&GgufValue> {
        metadata
            .get(&format!("{arch}.{suffix}"))
            .or_else(|| metadata.get(&format!("llama.{suffix}")))
            .or_else(|| metadata.get(&format!("bitnet.{suffix}")))
            .or_else(|| metadata.get(&format!("bitnet-25.{suffix}")))
    };

    let hidden_size = get("embedding_length")
        .and_then(|v| v.as_u32())
        .unwrap_or(2560) as usize;
    let num_layers = get("block_count").and_then(|v| v.as_u32()).unwrap_or(30) as usize;
    let num_heads = get("attention.head_count")
        .and_then(|v| v.as_u32())
        .unwrap_or(20) as usize;
    let num_kv_heads = get("attention.head_count_kv")
        .and_then(|v| v.as_u32())
        .unwrap_or(num_heads as u32) as usize;

    let vocab_size = get("vocab_size")
        .and_then(|v| v.as_u32())
        .map(|v| v as usize)
        .or_else(|| {
            metadata
                .get("tokenizer.ggml.tokens")
                .and_then(|v| v.as_string_array())
                .map(|a| a.len())
        })
        .unwrap_or(128256);

    let intermediate_size = get("feed_forward_length")
        .and_then(|v| v.as_u32())
        .unwrap_or(6912) as usize;

    let is_official = vocab_size > 100000 || arch.contains("bitnet");

    ModelConfig {
        vocab_size,
        hidden_size,
        intermediate_size,
        num_hidden_layers: num_layers,
        num_attention_heads: num_heads,
        num_key_value_heads: num_kv_heads,
        max_position_embeddings: get("context_length")
            .and_then(|v| v.as_u32())
            .unwrap_or(4096) as usize,
        rms_norm_eps: get("attention.layer_norm_rms_epsilon")
            .and_then(|v| v.as_f32())
            .unwrap_or(1e-5),
        rope_theta: get("rope.freq_base")
            .and_then(|v| v.as_f32())
            .unwrap_or(if is_official { 500000.0 } else { 10000.0 }),
        rope_theta_local: None,
        tie_word_embeddings: false,
        activation: if is_official {
            Activation::Relu2
        } else {
            Activation::Silu
        },
        embedding_scale: None,
        final_logit_softcapping: None,
        moe: None,
        quantization: crate::model::config::QuantizationKind::TernaryI2S,
    }
}

fn create_dummy_scales(store: &mut WeightStore, config: &ModelConfig, max_binding: u64) {
    let head_d = config.head_dim();

    for i in 0..config.num_hidden_layers {
        let p = format!("layer.{i}");
        let entries = [
            (format!("{p}.q_proj.weight_scale"), config.num_attention_heads * head_d),
            (format!("{p}.k_proj.weight_scale"), config.num_key_value_heads * head_d),
            (format!("{p}.v_proj.weight_scale"), config.num_key_value_heads * head_d),
            (format!("{p}.o_proj.weight_scale"), config.hidden_size),
            (format!("{p}.up_proj.weight_scale"), config.intermediate_size),
            (format!("{p}.down_proj.weight_scale"), config.hidden_size),
            (format!("{p}.gate_proj.weight_scale"), config.intermediate_size),
        ];

        for (name, dim) in entries {
            if !store.has(&name) {
                let data: Vec<u8> = std::iter::repeat_n(1.0f32.to_le_bytes(), dim).flatten().collect();
                store.upload_dense(&name, &data, Dtype::F32, vec![dim], max_binding);
            }
        }
    }

    let lm_head_scale = "lm_head.weight_scale".to_string();
    if !store.has(&lm_head_scale) {
        let data: Vec<u8> = std::iter::repeat_n(1.0f32.to_le_bytes(), config.vocab_size)
            .flatten()
            .collect();
        store.upload_dense(&lm_head_scale, &data, Dtype::F32, vec![config.vocab_size], max_binding);
    }
}

/// Fetch raw bytes from a URL or local path, with disk caching for remote
/// sources. Shared by the manifest path (manifest + each shard) and the
/// legacy single-file GGUF path.
pub(crate) async fn fetch_bytes(
    source: &str,
    cache_dir: Option<&std::path::Path>,
    progress: &dyn Fn(LoadProgress),
) -> Result<Vec<u8>> {
    if source.starts_with('/') || source.starts_with('.') || !source.contains("://") {
        let data = tokio::fs::read(source)
            .await
            .map_err(|e| LoomError::ModelNotFound(format!("{source}: {e}")))?;
        progress(LoadProgress {
            phase: LoadPhase::Shards,
            loaded: data.len() as u64,
            total: data.len() as u64,
            fraction: 1.0,
        });
        return Ok(data);
    }

    let cache_dir = cache_dir
        .map(PathBuf::from)
        .or_else(|| dirs::cache_dir().map(|d| d.join("llmforge")));

    if let Some(ref cache_dir) = cache_dir {
        let hash = format!("{:x}", Sha256::digest(source.as_bytes()));
        let cache_path = cache_dir.join(&hash);
        if cache_path.exists() {
            info!("Loading from cache: {}", cache_path.display());
            let data = tokio::fs::read(&cache_path).await?;
            progress(LoadProgress {
                phase: LoadPhase::Shards,
                loaded: data.len() as u64,
                total: data.len() as u64,
                fraction: 1.0,
            });
            return Ok(data);
        }
    }

    info!("Downloading: {source}");
    let response = reqwest::get(source).await?;
    let total = response.content_length().unwrap_or(0);
    let bytes = response.bytes().await?;
    let data = bytes.to_vec();

    progress(LoadProgress {
        phase: LoadPhase::Shards,
        loaded: data.len() as u64,
        total,
        fraction: 1.0,
    });

    if let Some(ref cache_dir) = cache_dir {
        let hash = format!("{:x}", Sha256::digest(source.as_bytes()));
        let cache_path = cache_dir.join(&hash);
        if let Err(e) = tokio::fs::create_dir_all(cache_dir).await {
            warn!("Failed to create cache dir: {e}");
        } else if let Err(e) = tokio::fs::write(&cache_path, &data).await {
            warn!("Failed to write cache: {e}");
        } else {
            info!("Cached to: {}", cache_path.display());
        }
    }

    Ok(data)
}
