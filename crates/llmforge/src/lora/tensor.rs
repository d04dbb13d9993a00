//! Tensor materialization for LoRA manifests: inline arrays, inline base64,
//! OPFS-style paths, HTTP URLs, or a name inside a companion safetensors
//! file. Only `f32` is supported for inline sources; `f16`/`bf16` are only
//! reachable via the safetensors path, converted through `crate::dtype`.

use async_trait::async_trait;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::dtype::{convert_bf16_bytes_to_f32, convert_f16_bytes_to_f32, Dtype};
use crate::error::{LoomError, Result};
use std::collections::HashMap;

use crate::lora::adapter::{LoraAdapter, ProjectionWeights, TensorResidency};
use crate::lora::manifest::{
    compute_lora_scale, parse_tensor_name, ChecksumAlgorithm, LoraLayerEntry, LoraManifest,
    LoraTensorEntry, TensorSource,
};
use crate::model::safetensors::SafetensorsFile;

#[async_trait]
pub trait OpfsReader: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
}

#[async_trait]
pub trait UrlFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Optional collaborators a tensor source may need; `None` for a collaborator
/// whose source variant never appears in a given manifest is fine.
#[derive(Default)]
pub struct MaterializeContext<'a> {
    pub safetensors: Option<&'a SafetensorsFile<'a>>,
    pub opfs: Option<&'a dyn OpfsReader>,
    pub fetcher: Option<&'a dyn UrlFetcher>,
}

pub async fn materialize(
    source: &TensorSource,
    shape: &[usize],
    ctx: &MaterializeContext<'_>,
) -> Result<Vec<f32>> {
    let values = match source {
        TensorSource::Inline { data } => data.clone(),
        TensorSource::InlineBase64 { data } => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(data)
                .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(data))
                .map_err(|e| LoomError::Other(format!("invalid base64 LoRA tensor: {e}")))?;
            bytes_to_f32(&bytes)
        }
        TensorSource::Opfs { path } => {
            let reader = ctx
                .opfs
                .ok_or_else(|| LoomError::Other(format!("opfs tensor '{path}' needs a reader")))?;
            bytes_to_f32(&reader.read(path).await?)
        }
        TensorSource::Http { url } => {
            let fetcher = ctx
                .fetcher
                .ok_or_else(|| LoomError::Other(format!("http tensor '{url}' needs a fetcher")))?;
            bytes_to_f32(&fetcher.fetch(url).await?)
        }
        TensorSource::Safetensors { name } => {
            let file = ctx
                .safetensors
                .ok_or_else(|| LoomError::Other(format!("safetensors tensor '{name}' needs a shard")))?;
            let info = file
                .tensors
                .get(name)
                .ok_or_else(|| LoomError::MissingWeight(name.clone()))?;
            let bytes = file.tensor_bytes(name).ok_or_else(|| LoomError::MissingWeight(name.clone()))?;
            match Dtype::from_safetensors_str(&info.dtype) {
                Some(Dtype::F16) => bytes_to_f32(&convert_f16_bytes_to_f32(bytes)),
                Some(Dtype::Bf16) => bytes_to_f32(&convert_bf16_bytes_to_f32(bytes)),
                Some(Dtype::F32) => bytes_to_f32(bytes),
                _ => {
                    return Err(LoomError::Other(format!(
                        "lora tensor '{name}': unsupported safetensors dtype '{}'",
                        info.dtype
                    )))
                }
            }
        }
    };

    let expected: usize = shape.iter().product();
    if values.len() != expected {
        return Err(LoomError::ShapeMismatch {
            expected: shape.to_vec(),
            actual: vec![values.len()],
        });
    }
    Ok(values)
}

fn bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

/// Hashes the full weights file (`weightsPath` case) or, for inline tensors,
/// the concatenation of every tensor's `f32` little-endian bytes in manifest
/// order. Only `sha256` is implemented in this version; any other algorithm
/// is treated as unverifiable (caller gets `checksum_valid = false`, not a
/// hard failure — spec.md §4.6 never fails the load on a mismatch).
pub fn verify_sha256(bytes: &[u8], expected_hex: &str) -> bool {
    format!("{:x}", Sha256::digest(bytes)) == expected_hex.to_lowercase()
}

pub fn concat_inline_tensors(tensors: &[Vec<f32>]) -> Vec<u8> {
    let mut out = Vec::new();
    for t in tensors {
        for v in t {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    out
}

/// Discovers a manifest's per-layer tensor entries from a companion
/// safetensors file's own tensor names (`layer.{i}.{module}.lora_{a|b}`)
/// rather than requiring the manifest to enumerate every entry explicitly.
/// Unrecognized or unpaired tensor names are skipped.
fn discover_layers_from_safetensors(
    file: &SafetensorsFile<'_>,
) -> HashMap<usize, HashMap<String, LoraLayerEntry>> {
    let mut halves: HashMap<(usize, String), (Option<LoraTensorEntry>, Option<LoraTensorEntry>)> =
        HashMap::new();

    for (name, info) in &file.tensors {
        let Some(parsed) = parse_tensor_name(name) else {
            continue;
        };
        let tensor_entry = LoraTensorEntry {
            shape: info.shape.clone(),
            source: TensorSource::Safetensors { name: name.clone() },
        };
        let slot = halves.entry((parsed.layer, parsed.module)).or_default();
        if parsed.is_a {
            slot.0 = Some(tensor_entry);
        } else {
            slot.1 = Some(tensor_entry);
        }
    }

    let mut layers: HashMap<usize, HashMap<String, LoraLayerEntry>> = HashMap::new();
    for ((layer, module), (a, b)) in halves {
        if let (Some(lora_a), Some(lora_b)) = (a, b) {
            layers.entry(layer).or_default().insert(module, LoraLayerEntry { lora_a, lora_b });
        }
    }
    layers
}

/// Assembles a runtime `LoraAdapter` from a parsed manifest (C6): materializes
/// every layer/module's `A`/`B` tensors through `materialize`, then verifies
/// the manifest's checksum against either the companion weights file
/// (`weightsPath` case, `weights_bytes` must be the raw file bytes) or the
/// concatenation of the materialized tensors in `(layer, module)` order
/// (inline case). A checksum that can't be verified — unsupported algorithm,
/// or a `weightsPath` manifest with no `weights_bytes` supplied — leaves
/// `checksum_valid = None` rather than failing the load, matching
/// `verify_sha256`'s own "never a hard failure" contract.
pub async fn build_adapter(
    manifest: &LoraManifest,
    ctx: &MaterializeContext<'_>,
    weights_bytes: Option<&[u8]>,
) -> Result<LoraAdapter> {
    let discovered;
    let source_layers = if manifest.layers.is_empty() {
        match ctx.safetensors {
            Some(file) => {
                discovered = discover_layers_from_safetensors(file);
                &discovered
            }
            None => &manifest.layers,
        }
    } else {
        &manifest.layers
    };

    let mut layer_indices: Vec<&usize> = source_layers.keys().collect();
    layer_indices.sort();

    let mut layers = HashMap::new();
    let mut inline_concat: Vec<Vec<f32>> = Vec::new();

    for &&layer in &layer_indices {
        let modules = &source_layers[&layer];
        let mut module_names: Vec<&String> = modules.keys().collect();
        module_names.sort();

        let mut out_modules = HashMap::new();
        for &module in &module_names {
            let entry = &modules[module];
            let a = materialize(&entry.lora_a.source, &entry.lora_a.shape, ctx).await?;
            let b = materialize(&entry.lora_b.source, &entry.lora_b.shape, ctx).await?;
            inline_concat.push(a.clone());
            inline_concat.push(b.clone());

            let scale = compute_lora_scale(manifest.rank, manifest.alpha);
            out_modules.insert(
                module.clone(),
                ProjectionWeights {
                    a: TensorResidency::Cpu(a),
                    a_shape: entry.lora_a.shape.clone(),
                    b: TensorResidency::Cpu(b),
                    b_shape: entry.lora_b.shape.clone(),
                    rank: manifest.rank,
                    alpha: manifest.alpha,
                    scale,
                },
            );
        }
        layers.insert(layer, out_modules);
    }

    let checksum_valid = match (&manifest.checksum, manifest.checksum_algorithm) {
        (Some(expected), ChecksumAlgorithm::Sha256) => {
            if manifest.weights_path.is_some() {
                weights_bytes.map(|bytes| verify_sha256(bytes, expected))
            } else {
                Some(verify_sha256(&concat_inline_tensors(&inline_concat), expected))
            }
        }
        _ => None,
    };

    Ok(LoraAdapter {
        id: manifest.id.clone(),
        name: manifest.name.clone(),
        version: manifest.version.clone(),
        base_model: manifest.base_model.clone(),
        rank: manifest.rank,
        alpha: manifest.alpha,
        target_modules: manifest.target_modules.clone(),
        layers,
        checksum_valid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inline_source_round_trips() {
        let source = TensorSource::Inline {
            data: vec![1.0, 2.0, 3.0, 4.0],
        };
        let ctx = MaterializeContext::default();
        let values = materialize(&source, &[2, 2], &ctx).await.unwrap();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[tokio::test]
    async fn shape_mismatch_is_rejected() {
        let source = TensorSource::Inline { data: vec![1.0, 2.0] };
        let ctx = MaterializeContext::default();
        assert!(materialize(&source, &[2, 2], &ctx).await.is_err());
    }

    #[tokio::test]
    async fn build_adapter_from_inline_manifest_verifies_checksum() {
        use crate::lora::manifest::{LoraLayerEntry, LoraTensorEntry};

        let mut modules = HashMap::new();
        modules.insert(
            "q_proj".to_string(),
            LoraLayerEntry {
                lora_a: LoraTensorEntry {
                    shape: vec![2, 2],
                    source: TensorSource::Inline { data: vec![1.0, 0.0, 0.0, 1.0] },
                },
                lora_b: LoraTensorEntry {
                    shape: vec![2, 2],
                    source: TensorSource::Inline { data: vec![1.0, 1.0, 1.0, 1.0] },
                },
            },
        );
        let mut layers = HashMap::new();
        layers.insert(0, modules);

        let expected_bytes =
            concat_inline_tensors(&[vec![1.0, 0.0, 0.0, 1.0], vec![1.0, 1.0, 1.0, 1.0]]);
        let checksum = format!("{:x}", Sha256::digest(&expected_bytes));

        let manifest = LoraManifest {
            id: "a".into(),
            name: "A".into(),
            version: "1.0.0".into(),
            base_model: "base".into(),
            rank: 8,
            alpha: 16.0,
            target_modules: vec!["q_proj".into()],
            layers,
            weights_path: None,
            checksum: Some(checksum),
            checksum_algorithm: ChecksumAlgorithm::Sha256,
            weights_format: "safetensors".into(),
            tags: Vec::new(),
        };

        let ctx = MaterializeContext::default();
        let adapter = build_adapter(&manifest, &ctx, None).await.unwrap();
        assert_eq!(adapter.checksum_valid, Some(true));
        let TensorResidency::Cpu(ref a) = adapter.layers[&0]["q_proj"].a else { panic!() };
        assert_eq!(a, &vec![1.0, 0.0, 0.0, 1.0]);
    }

    #[tokio::test]
    async fn build_adapter_discovers_layers_from_safetensors_names() {
        let header = r#"{"layer.0.q_proj.lora_a":{"dtype":"F32","shape":[2,2],"data_offsets":[0,16]},"layer.0.q_proj.lora_b":{"dtype":"F32","shape":[2,2],"data_offsets":[16,32]}}"#;
        let mut payload = vec![0u8; 32];
        for (i, v) in [1.0f32, 0.0, 0.0, 1.0].iter().enumerate() {
            payload[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
        for (i, v) in [2.0f32, 2.0, 2.0, 2.0].iter().enumerate() {
            payload[16 + i * 4..16 + i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
        let mut data = Vec::new();
        data.extend_from_slice(&(header.len() as u64).to_le_bytes());
        data.extend_from_slice(header.as_bytes());
        data.extend_from_slice(&payload);

        let file = SafetensorsFile::parse(&data).unwrap();
        let ctx = MaterializeContext {
            safetensors: Some(&file),
            ..Default::default()
        };

        let manifest = LoraManifest {
            id: "a".into(),
            name: "A".into(),
            version: "1.0.0".into(),
            base_model: "base".into(),
            rank: 8,
            alpha: 16.0,
            target_modules: vec!["q_proj".into()],
            layers: HashMap::new(),
            weights_path: Some("adapter.safetensors".into()),
            checksum: None,
            checksum_algorithm: ChecksumAlgorithm::Sha256,
            weights_format: "safetensors".into(),
            tags: Vec::new(),
        };

        let adapter = build_adapter(&manifest, &ctx, None).await.unwrap();
        let TensorResidency::Cpu(ref a) = adapter.layers[&0]["q_proj"].a else { panic!() };
        assert_eq!(a, &vec![1.0, 0.0, 0.0, 1.0]);
        let TensorResidency::Cpu(ref b) = adapter.layers[&0]["q_proj"].b else { panic!() };
        assert_eq!(b, &vec![2.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn sha256_matches_known_digest() {
        assert!(verify_sha256(b"", "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"));
    }
}
