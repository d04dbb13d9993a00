//! Adapter lifecycle manager: load/register/enable/disable/toggle/unload
//! plus the derived "active composite" the layer executor reads each step.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::info;

use crate::error::{LoomError, Result};
use crate::lora::adapter::{derive_active_adapter, ActiveComposite, LoraAdapter, StackOptions};
use crate::lora::manifest;
use crate::lora::tensor::{build_adapter, MaterializeContext};
use crate::model::loader::fetch_bytes;
use crate::model::safetensors::SafetensorsFile;

#[derive(Debug, Clone)]
pub enum LoraEvent {
    AdapterLoaded(String),
    AdapterEnabled(String),
    AdapterDisabled(String),
    AdapterUnloaded(String),
    ActiveAdaptersChanged,
}

struct Entry {
    adapter: LoraAdapter,
    weight: f32,
    enabled: bool,
}

/// Owns every loaded adapter for one base model and derives the single
/// composite delta currently active across them.
pub struct LoraManager {
    base_model: String,
    options: StackOptions,
    entries: HashMap<String, Entry>,
    listeners: Mutex<Vec<Box<dyn Fn(&LoraEvent) + Send + Sync>>>,
}

impl LoraManager {
    pub fn new(base_model: impl Into<String>, options: StackOptions) -> Self {
        Self {
            base_model: base_model.into(),
            options,
            entries: HashMap::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn on_event(&self, listener: impl Fn(&LoraEvent) + Send + Sync + 'static) {
        self.listeners.lock().unwrap().push(Box::new(listener));
    }

    fn emit(&self, event: LoraEvent) {
        info!(event = ?event, "lora event");
        for listener in self.listeners.lock().unwrap().iter() {
            listener(&event);
        }
    }

    /// Registers an already-assembled adapter (spec's `register(id, adapter,
    /// manifest)`: no I/O), disabled by default. Rejects a duplicate id
    /// (`AlreadyLoaded`) or a base-model mismatch.
    pub fn register(&mut self, adapter: LoraAdapter) -> Result<()> {
        if self.entries.contains_key(&adapter.id) {
            return Err(LoomError::AlreadyLoaded(adapter.id));
        }
        if adapter.base_model != self.base_model {
            return Err(LoomError::BaseModelMismatch {
                expected: self.base_model.clone(),
                actual: adapter.base_model,
            });
        }
        let id = adapter.id.clone();
        self.entries.insert(
            id.clone(),
            Entry {
                adapter,
                weight: 1.0,
                enabled: false,
            },
        );
        self.emit(LoraEvent::AdapterLoaded(id));
        Ok(())
    }

    /// Fetches a manifest (and, if `weightsPath` is set, its companion
    /// weights file) from a local path or URL, materializes every tensor,
    /// and registers the resulting adapter. `id` must match the manifest's
    /// own `id` (`AlreadyLoaded` if already present, before any I/O runs).
    pub async fn load(&mut self, id: &str, manifest_path: &str) -> Result<()> {
        if self.entries.contains_key(id) {
            return Err(LoomError::AlreadyLoaded(id.to_string()));
        }

        let manifest_bytes = fetch_bytes(manifest_path, None, &|_| {}).await?;
        let parsed = manifest::parse(&manifest_bytes)?;
        if parsed.id != id {
            return Err(LoomError::InvalidManifest {
                field: "id".into(),
                reason: format!("manifest id '{}' does not match requested id '{id}'", parsed.id),
            });
        }

        let weights_bytes = match &parsed.weights_path {
            Some(weights_path) => Some(fetch_bytes(weights_path, None, &|_| {}).await?),
            None => None,
        };
        let safetensors = match &weights_bytes {
            Some(bytes) if parsed.weights_format == "safetensors" => Some(SafetensorsFile::parse(bytes)?),
            _ => None,
        };
        let ctx = MaterializeContext {
            safetensors: safetensors.as_ref(),
            opfs: None,
            fetcher: None,
        };

        let adapter = build_adapter(&parsed, &ctx, weights_bytes.as_deref()).await?;
        self.register(adapter)
    }

    pub fn get(&self, id: &str) -> Option<&LoraAdapter> {
        self.entries.get(id).map(|e| &e.adapter)
    }

    pub fn list(&self) -> Vec<&LoraAdapter> {
        self.entries.values().map(|e| &e.adapter).collect()
    }

    /// Enables `id` at `weight` (clamped to `[0.0, 1.0]` by rejecting values
    /// outside it, matching the manifest's `alpha`/weight domain). Idempotent:
    /// re-enabling an already-enabled adapter just updates its weight.
    pub fn enable(&mut self, id: &str, weight: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&weight) {
            return Err(LoomError::InvalidWeight {
                weight,
                min: 0.0,
                max: 1.0,
            });
        }
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| LoomError::AdapterNotFound(id.to_string()))?;
        entry.enabled = true;
        entry.weight = weight;
        self.emit(LoraEvent::AdapterEnabled(id.to_string()));
        self.emit(LoraEvent::ActiveAdaptersChanged);
        Ok(())
    }

    /// Idempotent: disabling an already-disabled adapter is a no-op beyond
    /// the lookup check.
    pub fn disable(&mut self, id: &str) -> Result<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| LoomError::AdapterNotFound(id.to_string()))?;
        let was_enabled = entry.enabled;
        entry.enabled = false;
        if was_enabled {
            self.emit(LoraEvent::AdapterDisabled(id.to_string()));
            self.emit(LoraEvent::ActiveAdaptersChanged);
        }
        Ok(())
    }

    pub fn toggle(&mut self, id: &str) -> Result<()> {
        let enabled = self
            .entries
            .get(id)
            .ok_or_else(|| LoomError::AdapterNotFound(id.to_string()))?
            .enabled;
        if enabled {
            self.disable(id)
        } else {
            self.enable(id, self.entries[id].weight)
        }
    }

    pub fn disable_all(&mut self) {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.enabled)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            let _ = self.disable(&id);
        }
    }

    /// Disables every adapter not named in `ids`, enabling those that are
    /// (at their existing weight, defaulting to `1.0` for one never enabled).
    pub fn enable_only(&mut self, ids: &[&str]) -> Result<()> {
        for id in ids {
            if !self.entries.contains_key(*id) {
                return Err(LoomError::AdapterNotFound(id.to_string()));
            }
        }
        let keep: std::collections::HashSet<&str> = ids.iter().copied().collect();
        let all_ids: Vec<String> = self.entries.keys().cloned().collect();
        for id in all_ids {
            if keep.contains(id.as_str()) {
                let weight = self.entries[&id].weight;
                self.enable(&id, weight)?;
            } else {
                self.disable(&id)?;
            }
        }
        Ok(())
    }

    pub fn unload(&mut self, id: &str) -> Result<()> {
        if self.entries.remove(id).is_none() {
            return Err(LoomError::AdapterNotFound(id.to_string()));
        }
        self.emit(LoraEvent::AdapterUnloaded(id.to_string()));
        self.emit(LoraEvent::ActiveAdaptersChanged);
        Ok(())
    }

    /// The single composite delta produced by every currently-enabled
    /// adapter, or `None` if nothing is enabled.
    pub fn active_adapter(&self) -> Option<ActiveComposite> {
        let enabled: Vec<(&LoraAdapter, f32)> = self
            .entries
            .values()
            .filter(|e| e.enabled)
            .map(|e| (&e.adapter, e.weight))
            .collect();
        derive_active_adapter(&enabled, self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn adapter(id: &str, base_model: &str) -> LoraAdapter {
        LoraAdapter {
            id: id.into(),
            name: id.into(),
            version: "1.0.0".into(),
            base_model: base_model.into(),
            rank: 8,
            alpha: 16.0,
            target_modules: vec!["q_proj".into()],
            layers: Map::new(),
            checksum_valid: None,
        }
    }

    fn options() -> StackOptions {
        StackOptions {
            strategy: crate::lora::adapter::MergeStrategy::WeightedSum,
            normalize_weights: true,
        }
    }

    #[test]
    fn rejects_base_model_mismatch() {
        let mut mgr = LoraManager::new("base-a", options());
        let err = mgr.register(adapter("x", "base-b")).unwrap_err();
        assert!(matches!(err, LoomError::BaseModelMismatch { .. }));
    }

    #[test]
    fn enable_disable_round_trip_toggles_active_adapter() {
        let mut mgr = LoraManager::new("base", options());
        mgr.register(adapter("x", "base")).unwrap();
        assert!(mgr.active_adapter().is_none());
        mgr.enable("x", 1.0).unwrap();
        assert!(mgr.active_adapter().is_some());
        mgr.disable("x").unwrap();
        assert!(mgr.active_adapter().is_none());
    }

    #[test]
    fn enable_only_disables_everything_else() {
        let mut mgr = LoraManager::new("base", options());
        mgr.register(adapter("x", "base")).unwrap();
        mgr.register(adapter("y", "base")).unwrap();
        mgr.enable("x", 1.0).unwrap();
        mgr.enable("y", 1.0).unwrap();
        mgr.enable_only(&["y"]).unwrap();
        assert!(!mgr.entries["x"].enabled);
        assert!(mgr.entries["y"].enabled);
    }

    #[test]
    fn unknown_adapter_is_not_found() {
        let mut mgr = LoraManager::new("base", options());
        assert!(matches!(mgr.enable("missing", 1.0), Err(LoomError::AdapterNotFound(_))));
    }

    #[tokio::test]
    async fn load_rejects_duplicate_id_before_any_io() {
        let mut mgr = LoraManager::new("base", options());
        mgr.register(adapter("x", "base")).unwrap();
        // A bogus path would fail I/O anyway; the duplicate-id check must
        // short-circuit before `load` ever tries to fetch it.
        let err = mgr.load("x", "/nonexistent/path/does/not/matter.json").await.unwrap_err();
        assert!(matches!(err, LoomError::AlreadyLoaded(_)));
    }
}
