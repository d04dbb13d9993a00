//! LoRA adapter manifest (C6): the on-disk JSON describing an adapter's
//! identity, target modules, and per-layer tensor locations.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{LoomError, Result};

/// The only projections a LoRA adapter may target (spec.md §3's data model).
pub const TARGET_MODULES: &[&str] = &[
    "q_proj", "k_proj", "v_proj", "o_proj", "gate_proj", "up_proj", "down_proj", "gate_up_proj",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha256,
    Blake3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TensorSource {
    /// Inline `f32` values, row-major.
    Inline { data: Vec<f32> },
    /// Base64-encoded little-endian `f32` bytes.
    InlineBase64 { data: String },
    /// Path into an Origin Private File System-style store; resolved by a
    /// caller-supplied reader.
    Opfs { path: String },
    /// Fetched over HTTP by a caller-supplied loader.
    Http { url: String },
    /// A named tensor inside a companion safetensors weights file.
    Safetensors { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraTensorEntry {
    pub shape: Vec<usize>,
    pub source: TensorSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraLayerEntry {
    pub lora_a: LoraTensorEntry,
    pub lora_b: LoraTensorEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub base_model: String,
    pub rank: u32,
    pub alpha: f32,
    pub target_modules: Vec<String>,
    /// `layer index -> module name -> tensor pair`.
    pub layers: HashMap<usize, HashMap<String, LoraLayerEntry>>,
    #[serde(default)]
    pub weights_path: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default = "default_checksum_algorithm")]
    pub checksum_algorithm: ChecksumAlgorithm,
    #[serde(default = "default_weights_format")]
    pub weights_format: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_checksum_algorithm() -> ChecksumAlgorithm {
    ChecksumAlgorithm::Sha256
}

fn default_weights_format() -> String {
    "safetensors".into()
}

static ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());
static SEMVER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.\d+\.\d+([-+][0-9A-Za-z.-]+)?$").unwrap());

/// Validation failures, collected rather than short-circuited so a caller
/// can report everything wrong with a manifest at once.
pub fn validate(manifest: &LoraManifest) -> Vec<String> {
    let mut errors = Vec::new();

    if !ID_RE.is_match(&manifest.id) {
        errors.push(format!("id '{}' must match ^[A-Za-z0-9_-]+$", manifest.id));
    }
    if manifest.name.is_empty() || manifest.name.len() > 256 {
        errors.push("name must be 1..256 characters".into());
    }
    if !SEMVER_RE.is_match(&manifest.version) {
        errors.push(format!("version '{}' is not valid semver", manifest.version));
    }
    if !(1..=1024).contains(&manifest.rank) {
        errors.push(format!("rank {} must be in [1, 1024]", manifest.rank));
    }
    if manifest.alpha < 0.1 {
        errors.push(format!("alpha {} must be >= 0.1", manifest.alpha));
    }
    if manifest.target_modules.is_empty() {
        errors.push("targetModules must be non-empty".into());
    }
    let mut seen = std::collections::HashSet::new();
    for m in &manifest.target_modules {
        if !TARGET_MODULES.contains(&m.as_str()) {
            errors.push(format!("targetModules: unknown module '{m}'"));
        }
        if !seen.insert(m.as_str()) {
            errors.push(format!("targetModules: duplicate '{m}'"));
        }
    }
    if let Some(ref checksum) = manifest.checksum {
        if checksum.len() != 64 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            errors.push("checksum must be 64 hex characters".into());
        }
    }
    for (layer, modules) in &manifest.layers {
        for (module, entry) in modules {
            if !is_valid_lora_shape(&entry.lora_a.shape, manifest.rank)
                || !is_valid_lora_shape(&entry.lora_b.shape, manifest.rank)
            {
                errors.push(format!(
                    "layer {layer}.{module}: lora_a/lora_b shape must have an axis equal to rank {}",
                    manifest.rank
                ));
            }
        }
    }

    errors
}

fn is_valid_lora_shape(shape: &[usize], rank: u32) -> bool {
    shape.len() == 2 && (shape[0] == rank as usize || shape[1] == rank as usize)
}

/// The required fields for a new adapter manifest; everything else takes the
/// registry's v1 defaults (`version=1.0.0`, `checksumAlgorithm=sha256`,
/// `weightsFormat=safetensors`).
pub struct MinimalManifest {
    pub id: String,
    pub name: String,
    pub base_model: String,
    pub rank: u32,
    pub alpha: f32,
    pub target_modules: Vec<String>,
    pub layers: HashMap<usize, HashMap<String, LoraLayerEntry>>,
}

pub fn create_manifest(minimal: MinimalManifest) -> LoraManifest {
    LoraManifest {
        id: minimal.id,
        name: minimal.name,
        version: "1.0.0".into(),
        base_model: minimal.base_model,
        rank: minimal.rank,
        alpha: minimal.alpha,
        target_modules: minimal.target_modules,
        layers: minimal.layers,
        weights_path: None,
        checksum: None,
        checksum_algorithm: ChecksumAlgorithm::Sha256,
        weights_format: default_weights_format(),
        tags: Vec::new(),
    }
}

pub fn parse(bytes: &[u8]) -> Result<LoraManifest> {
    let manifest: LoraManifest = serde_json::from_slice(bytes)?;
    let errors = validate(&manifest);
    if !errors.is_empty() {
        return Err(LoomError::InvalidManifest {
            field: "lora".into(),
            reason: errors.join("; "),
        });
    }
    Ok(manifest)
}

/// `scale = alpha / rank`, `rank = 0 ⇒ 1` (only reachable for manually
/// constructed manifests since `validate` already rejects `rank < 1`).
pub fn compute_lora_scale(rank: u32, alpha: f32) -> f32 {
    if rank == 0 {
        1.0
    } else {
        alpha / rank as f32
    }
}

static TENSOR_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^layers?\.?(\d+)\.([^.]+)\.lora_([ab])$").unwrap());

/// Parsed components of a `layer.{i}.{module}.lora_{a|b}` tensor name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTensorName {
    pub layer: usize,
    pub module: String,
    pub is_a: bool,
}

/// Normalizes short aliases (`q`, `gate`, ...) to their canonical module name.
fn normalize_module(raw: &str) -> Option<&'static str> {
    match raw.to_ascii_lowercase().as_str() {
        "q" | "q_proj" => Some("q_proj"),
        "k" | "k_proj" => Some("k_proj"),
        "v" | "v_proj" => Some("v_proj"),
        "o" | "o_proj" => Some("o_proj"),
        "gate" | "gate_proj" => Some("gate_proj"),
        "up" | "up_proj" => Some("up_proj"),
        "down" | "down_proj" => Some("down_proj"),
        "gate_up" | "gate_up_proj" => Some("gate_up_proj"),
        _ => None,
    }
}

/// Returns `None` (logging a warning) for names that don't match the
/// `layers?\.?(\d+)\.([^.]+)\.lora_([ab])` pattern or whose module alias is
/// unrecognized.
pub fn parse_tensor_name(name: &str) -> Option<ParsedTensorName> {
    let caps = TENSOR_NAME_RE.captures(name)?;
    let layer: usize = caps[1].parse().ok()?;
    let module = normalize_module(&caps[2])?;
    let is_a = caps[3].eq_ignore_ascii_case("a");
    Some(ParsedTensorName {
        layer,
        module: module.to_string(),
        is_a,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_name_parser_matches_documented_forms() {
        assert!(parse_tensor_name("layer.0.q_proj.lora_a").is_some());
        assert!(parse_tensor_name("layers.12.gate_proj.lora_b").is_some());
        assert!(parse_tensor_name("layer0.v_proj.lora_a").is_some()); // the "." before the index is optional
        assert!(parse_tensor_name("lora.q_proj.a").is_none());
        assert!(parse_tensor_name("layer.0.unknown.lora_a").is_none());
    }

    #[test]
    fn compute_lora_scale_matches_alpha_over_rank() {
        assert!((compute_lora_scale(8, 16.0) - 2.0).abs() < 1e-6);
        assert_eq!(compute_lora_scale(0, 16.0), 1.0);
    }

    #[test]
    fn create_manifest_applies_v1_defaults() {
        let m = create_manifest(MinimalManifest {
            id: "my-adapter".into(),
            name: "My Adapter".into(),
            base_model: "base".into(),
            rank: 8,
            alpha: 16.0,
            target_modules: vec!["q_proj".into()],
            layers: HashMap::new(),
        });
        assert_eq!(m.version, "1.0.0");
        assert_eq!(m.checksum_algorithm, ChecksumAlgorithm::Sha256);
        assert_eq!(m.weights_format, "safetensors");
        assert!(validate(&m).is_empty());
    }

    #[test]
    fn validate_rejects_bad_id_and_rank() {
        let m = LoraManifest {
            id: "bad id!".into(),
            name: "x".into(),
            version: "1.0.0".into(),
            base_model: "base".into(),
            rank: 0,
            alpha: 16.0,
            target_modules: vec!["q_proj".into()],
            layers: HashMap::new(),
            weights_path: None,
            checksum: None,
            checksum_algorithm: ChecksumAlgorithm::Sha256,
            weights_format: "safetensors".into(),
            tags: Vec::new(),
        };
        let errors = validate(&m);
        assert!(errors.iter().any(|e| e.contains("id")));
        assert!(errors.iter().any(|e| e.contains("rank")));
    }

    #[test]
    fn validate_flags_every_malformed_field_at_once() {
        let m = LoraManifest {
            id: "my adapter".into(),
            name: "x".into(),
            version: "1.0.0".into(),
            base_model: "m".into(),
            rank: 0,
            alpha: 0.05,
            target_modules: vec!["z_proj".into(), "q_proj".into(), "q_proj".into()],
            layers: HashMap::new(),
            weights_path: None,
            checksum: None,
            checksum_algorithm: ChecksumAlgorithm::Sha256,
            weights_format: "safetensors".into(),
            tags: Vec::new(),
        };
        let errors = validate(&m);
        assert!(errors.iter().any(|e| e.contains("id")), "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("rank")), "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("alpha")), "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("z_proj")), "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("duplicate")), "{errors:?}");
    }
}
