//! Runtime LoRA adapter data model: per-`(layer, module)` low-rank tensors
//! plus the weighted/sequential merge that produces the single "active
//! composite" the layer executor consumes (§4.6's `getActiveAdapter`).

use std::collections::HashMap;

use tracing::warn;

use crate::gpu::buffer_pool::GpuBuf;
use crate::lora::manifest::compute_lora_scale;

/// Where a projection's `A`/`B` tensor currently lives. GPU-resident entries
/// participate in inference directly (via `nn::linear::LoraDelta`) but are
/// skipped, with a warning, by CPU-side merge — matching spec.md §4.6's
/// "merging zero-rank/GPU tensors" rule: the caller must pre-materialize to
/// CPU before merging such an adapter with another.
#[derive(Clone)]
pub enum TensorResidency {
    Cpu(Vec<f32>),
    Gpu(GpuBuf),
}

impl TensorResidency {
    pub fn as_cpu(&self) -> Option<&[f32]> {
        match self {
            TensorResidency::Cpu(v) => Some(v),
            TensorResidency::Gpu(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct ProjectionWeights {
    /// `[rank, in_dim]`, row-major.
    pub a: TensorResidency,
    pub a_shape: Vec<usize>,
    /// `[out_dim, rank]`, row-major.
    pub b: TensorResidency,
    pub b_shape: Vec<usize>,
    pub rank: u32,
    pub alpha: f32,
    pub scale: f32,
}

#[derive(Clone)]
pub struct LoraAdapter {
    pub id: String,
    pub name: String,
    pub version: String,
    pub base_model: String,
    pub rank: u32,
    pub alpha: f32,
    pub target_modules: Vec<String>,
    /// `layer -> module -> weights`.
    pub layers: HashMap<usize, HashMap<String, ProjectionWeights>>,
    pub checksum_valid: Option<bool>,
}

impl LoraAdapter {
    /// Produces a new adapter with `alpha' = alpha * w` (and every
    /// projection's `alpha'/scale'` scaled the same way), leaving `A`, `B`,
    /// and `rank` untouched. Identity when `w == 1.0`.
    pub fn apply_weight(&self, w: f32) -> LoraAdapter {
        if w == 1.0 {
            return self.clone();
        }
        let layers = self
            .layers
            .iter()
            .map(|(&layer, modules)| {
                let scaled = modules
                    .iter()
                    .map(|(module, weights)| {
                        (
                            module.clone(),
                            ProjectionWeights {
                                alpha: weights.alpha * w,
                                scale: weights.scale * w,
                                ..weights.clone()
                            },
                        )
                    })
                    .collect();
                (layer, scaled)
            })
            .collect();

        LoraAdapter {
            alpha: self.alpha * w,
            layers,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    WeightedSum,
    Sequential,
}

#[derive(Debug, Clone, Copy)]
pub struct StackOptions {
    pub strategy: MergeStrategy,
    pub normalize_weights: bool,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            strategy: MergeStrategy::WeightedSum,
            normalize_weights: true,
        }
    }
}

/// The effective per-(layer,module) delta the layer executor applies. `None`
/// when no adapter is active.
pub type ActiveComposite = HashMap<usize, HashMap<String, ProjectionWeights>>;

/// Derives the single active composite from a set of `(adapter, weight)`
/// pairs already filtered to the enabled set. Returns `None` for an empty
/// input (spec.md: "merging zero adapters yields none").
pub fn derive_active_adapter(
    adapters: &[(&LoraAdapter, f32)],
    options: StackOptions,
) -> Option<ActiveComposite> {
    if adapters.is_empty() {
        return None;
    }
    if adapters.len() == 1 {
        let (adapter, w) = adapters[0];
        return Some(adapter.apply_weight(w).layers);
    }

    match options.strategy {
        MergeStrategy::Sequential => {
            let (adapter, w) = *adapters.last().unwrap();
            Some(adapter.apply_weight(w).layers)
        }
        MergeStrategy::WeightedSum => Some(weighted_sum(adapters, options.normalize_weights)),
    }
}

fn weighted_sum(adapters: &[(&LoraAdapter, f32)], normalize: bool) -> ActiveComposite {
    let total_weight: f32 = adapters.iter().map(|(_, w)| w).sum();
    let norm = |w: f32| if normalize && total_weight > 0.0 { w / total_weight } else { w };

    let mut merged: ActiveComposite = HashMap::new();

    for &(adapter, w) in adapters {
        let w = norm(w);
        for (&layer, modules) in &adapter.layers {
            for (module, weights) in modules {
                let (a_cpu, b_cpu) = match (&weights.a, &weights.b) {
                    (TensorResidency::Cpu(a), TensorResidency::Cpu(b)) => (a, b),
                    _ => {
                        warn!(
                            adapter = %adapter.id,
                            layer,
                            module,
                            "skipping GPU-resident LoRA tensor in weighted_sum merge; pre-materialize to CPU first"
                        );
                        continue;
                    }
                };

                let slot = merged.entry(layer).or_default();
                match slot.get_mut(module) {
                    None => {
                        slot.insert(
                            module.clone(),
                            ProjectionWeights {
                                a: TensorResidency::Cpu(a_cpu.iter().map(|v| v * w).collect()),
                                a_shape: weights.a_shape.clone(),
                                b: TensorResidency::Cpu(b_cpu.iter().map(|v| v * w).collect()),
                                b_shape: weights.b_shape.clone(),
                                rank: weights.rank,
                                alpha: weights.alpha * w,
                                scale: compute_lora_scale(weights.rank, weights.alpha * w),
                            },
                        );
                    }
                    Some(existing) if existing.rank == weights.rank => {
                        accumulate(&mut existing.a, a_cpu, w);
                        accumulate(&mut existing.b, b_cpu, w);
                        existing.alpha += weights.alpha * w;
                        existing.scale = compute_lora_scale(existing.rank, existing.alpha);
                    }
                    Some(_) => {
                        warn!(
                            adapter = %adapter.id,
                            layer,
                            module,
                            "skipping LoRA tensor whose rank differs from the first-seen rank for this module"
                        );
                    }
                }
            }
        }
    }

    merged
}

fn accumulate(dst: &mut TensorResidency, src: &[f32], w: f32) {
    if let TensorResidency::Cpu(d) = dst {
        for (d, s) in d.iter_mut().zip(src) {
            *d += s * w;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(id: &str, rank: u32, alpha: f32, a: Vec<f32>, b: Vec<f32>) -> LoraAdapter {
        let mut modules = HashMap::new();
        modules.insert(
            "q_proj".to_string(),
            ProjectionWeights {
                a: TensorResidency::Cpu(a),
                a_shape: vec![rank as usize, 2],
                b: TensorResidency::Cpu(b),
                b_shape: vec![2, rank as usize],
                rank,
                alpha,
                scale: compute_lora_scale(rank, alpha),
            },
        );
        let mut layers = HashMap::new();
        layers.insert(0, modules);
        LoraAdapter {
            id: id.into(),
            name: id.into(),
            version: "1.0.0".into(),
            base_model: "base".into(),
            rank,
            alpha,
            target_modules: vec!["q_proj".into()],
            layers,
            checksum_valid: None,
        }
    }

    #[test]
    fn single_active_adapter_matches_apply_weight() {
        let a = adapter("a", 8, 16.0, vec![1.0, 2.0], vec![3.0, 4.0]);
        let composite = derive_active_adapter(
            &[(&a, 0.5)],
            StackOptions {
                strategy: MergeStrategy::WeightedSum,
                normalize_weights: false,
            },
        )
        .unwrap();
        let expected = a.apply_weight(0.5).layers;
        let got_alpha = composite[&0]["q_proj"].alpha;
        let expected_alpha = expected[&0]["q_proj"].alpha;
        assert!((got_alpha - expected_alpha).abs() < 1e-6);
    }

    #[test]
    fn weighted_sum_combines_equal_weights() {
        let a = adapter("a", 8, 16.0, vec![1.0, 0.0], vec![1.0, 0.0]);
        let b = adapter("b", 8, 32.0, vec![0.0, 1.0], vec![0.0, 1.0]);
        let composite = derive_active_adapter(
            &[(&a, 0.5), (&b, 0.5)],
            StackOptions {
                strategy: MergeStrategy::WeightedSum,
                normalize_weights: true,
            },
        )
        .unwrap();
        let merged = &composite[&0]["q_proj"];
        let TensorResidency::Cpu(ref a_data) = merged.a else { panic!() };
        assert!((a_data[0] - 0.5).abs() < 1e-6);
        assert!((a_data[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn weighted_sum_matches_worked_example_scales() {
        // A: alpha=16, rank=8 (scale=2); B: alpha=32, rank=8 (scale=4);
        // equal weights, normalized -> merged alpha = 0.5*16 + 0.5*32 = 24,
        // merged scale = compute_lora_scale(8, 24) = 3.
        let a = adapter("a", 8, 16.0, vec![1.0, 0.0], vec![1.0, 0.0]);
        let b = adapter("b", 8, 32.0, vec![0.0, 1.0], vec![0.0, 1.0]);
        assert!((a.layers[&0]["q_proj"].scale - 2.0).abs() < 1e-6);
        assert!((b.layers[&0]["q_proj"].scale - 4.0).abs() < 1e-6);

        let composite = derive_active_adapter(
            &[(&a, 0.5), (&b, 0.5)],
            StackOptions {
                strategy: MergeStrategy::WeightedSum,
                normalize_weights: true,
            },
        )
        .unwrap();
        let merged = &composite[&0]["q_proj"];
        assert!((merged.alpha - 24.0).abs() < 1e-6);
        assert!((merged.scale - 3.0).abs() < 1e-6);
    }

    #[test]
    fn empty_adapter_list_yields_none() {
        assert!(derive_active_adapter(
            &[],
            StackOptions {
                strategy: MergeStrategy::WeightedSum,
                normalize_weights: false,
            }
        )
        .is_none());
    }
}
