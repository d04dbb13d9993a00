//! Feed-forward block: gated activation over `gate_proj`/`up_proj`, then
//! `down_proj` back to hidden size.
//!
//! Gated ReLU^2 (BitNet): `down(relu2(gate(x)) * up(x))`
//! SwiGLU (LLaMA-family community checkpoints): `down(silu(gate(x)) * up(x))`

use crate::error::Result;
use crate::gpu::kernel::{CommandRecorder, GpuTensor, KernelRunner};
use crate::model::config::{Activation, ModelConfig};
use crate::model::weights::WeightStore;
use crate::nn::linear::{Linear, LoraDelta};

#[derive(Default)]
pub struct FfnLora<'a> {
    pub gate: Option<&'a LoraDelta>,
    pub up: Option<&'a LoraDelta>,
    pub down: Option<&'a LoraDelta>,
}

pub struct Ffn {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
    activation: Activation,
}

impl Ffn {
    pub fn load(weights: &WeightStore, config: &ModelConfig, layer: usize) -> Result<Self> {
        Self::load_prefixed(weights, config, &format!("layer.{layer}"))
    }

    /// Like `load`, but with an explicit tensor-name prefix — used both for
    /// a transformer block's dense FFN (`layer.{i}`) and for each MoE expert
    /// (`layer.{i}.expert.{e}`).
    pub fn load_prefixed(weights: &WeightStore, config: &ModelConfig, prefix: &str) -> Result<Self> {
        let h = config.hidden_size;
        let inter = config.intermediate_size;

        let get = |slot: &str| -> Result<_> {
            weights
                .get(&format!("{prefix}.{slot}.weight"))
                .cloned()
                .ok_or_else(|| {
                    crate::error::LoomError::MissingWeight(format!("{prefix}.{slot}.weight"))
                })
        };

        Ok(Self {
            gate_proj: Linear::new(&get("gate_proj")?, None, config.rms_norm_eps, h, inter)?,
            up_proj: Linear::new(&get("up_proj")?, None, config.rms_norm_eps, h, inter)?,
            down_proj: Linear::new(&get("down_proj")?, None, config.rms_norm_eps, inter, h)?,
            activation: config.activation,
        })
    }

    pub fn forward(
        &self,
        kernel: &dyn KernelRunner,
        x: &GpuTensor,
        n: usize,
        lora: &FfnLora<'_>,
        mut recorder: Option<&mut dyn CommandRecorder>,
    ) -> Result<GpuTensor> {
        let gate = self.gate_proj.forward(kernel, x, n, lora.gate, recorder.as_deref_mut())?;
        let up = self.up_proj.forward(kernel, x, n, lora.up, recorder.as_deref_mut())?;

        let kind = match self.activation {
            Activation::Relu2 => 0,
            Activation::Silu | Activation::Swiglu => 1,
            Activation::Gelu => 2,
        };
        let activated = kernel.activation(&gate, kind, recorder.as_deref_mut())?;
        let gated = kernel.elementwise(&activated, &up, 1, recorder.as_deref_mut())?;

        self.down_proj.forward(kernel, &gated, n, lora.down, recorder)
    }
}
