pub mod config;
pub mod gguf;
pub mod loader;
pub mod manifest;
pub mod safetensors;
pub mod weights;

pub use config::ModelConfig;
pub use loader::{load_model, HttpShardLoader, LoadOptions, LoadPhase, LoadProgress, ShardLoader};
pub use manifest::{config_from_manifest, parse_manifest, ModelManifest};
pub use weights::{WeightHandle, WeightStore};
