//! # llmforge
//!
//! Client-side GPU inference runtime for quantized decoder-only
//! transformers, built on wgpu. Covers prefill/decode, grouped-query
//! attention with rotary position embeddings, KV-cache snapshot/replay,
//! mixture-of-experts layers, LoRA adapter stacking, and a sampler with
//! repetition penalty, top-k, and nucleus sampling.
//!
//! ```no_run
//! use llmforge::{CancellationToken, Engine, GenerateOptions};
//!
//! # async fn example() -> llmforge::Result<()> {
//! let mut engine = Engine::load("model.gguf", Default::default()).await?;
//! let cancel = CancellationToken::new();
//!
//! engine.generate("Hello!", GenerateOptions::default(), &cancel, |_id, text| {
//!     print!("{text}");
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod dtype;
pub mod error;
pub mod generator;
pub mod gpu;
pub mod lora;
pub mod model;
pub mod nn;
pub mod sampling;
pub mod tokenizer;

pub use error::{LoomError, LoomExitCode, Result};
pub use generator::{CancellationToken, GenerateOptions, GenerationStats, Generator, KvSnapshot};
pub use lora::{
    AdapterRegistry, LoraAdapter, LoraEvent, LoraManager, MergeStrategy, StackOptions,
};
pub use model::config::{Activation, ModelConfig};
pub use model::loader::{LoadOptions, LoadProgress};
pub use nn::CausalLm;
pub use tokenizer::{ChatMessage, Tokenizer};

use std::sync::Arc;

use gpu::buffer_pool::BufferPool;
use gpu::device::init_gpu;
use gpu::wgpu_backend::WgpuKernelRunner;
use gpu::SharedKernelRunner;
use lora::adapter::ActiveComposite;
use lora::MemoryKvStore;
use model::loader::load_model;

/// Owns one loaded model's GPU resources and generation session, plus the
/// LoRA manager and adapter registry scoped to it. Adapter lifecycle is
/// independent of any particular `generate` call: enable/disable what you
/// want active, then call `generate`, which reads the manager's current
/// composite each time.
pub struct Engine {
    pub generator: Generator,
    pub lora_manager: LoraManager,
    pub adapters: AdapterRegistry,
}

impl Engine {
    /// Loads a model from a local path or URL, initializes wgpu, and builds
    /// a ready-to-use generation session. `max_seq_len` for the KV cache is
    /// taken from the model's own `max_position_embeddings`.
    pub async fn load(source: &str, options: LoadOptions) -> Result<Self> {
        let gpu = init_gpu().await?;
        let result = load_model(source, Arc::clone(&gpu.device), Arc::clone(&gpu.queue), options).await?;

        let tokenizer = match &result.metadata {
            Some(metadata) => Tokenizer::from_gguf_metadata(metadata)?,
            None => {
                return Err(LoomError::Tokenizer(
                    "no tokenizer metadata available for this model source".into(),
                ))
            }
        };

        let max_seq_len = result.config.max_position_embeddings;
        let model = CausalLm::load(Arc::clone(&gpu.device), &result.weights, &result.config, max_seq_len)?;

        let pool = Arc::new(BufferPool::new(Arc::clone(&gpu.device), 256));
        let kernel: SharedKernelRunner = Arc::new(WgpuKernelRunner::new(
            Arc::clone(&gpu.device),
            Arc::clone(&gpu.queue),
            pool,
        ));

        let generator = Generator::new(
            Arc::clone(&gpu.device),
            Arc::clone(&gpu.queue),
            kernel,
            Arc::new(model),
            Arc::new(tokenizer),
            result.config.clone(),
            max_seq_len,
        );

        let lora_manager = LoraManager::new(source.to_string(), StackOptions::default());
        let adapters = AdapterRegistry::new(Box::new(MemoryKvStore::default()), 32);

        Ok(Self {
            generator,
            lora_manager,
            adapters,
        })
    }

    /// Runs `generate` against whatever composite the LoRA manager currently
    /// has active (`None` enabled adapters means no LoRA delta is applied).
    pub fn generate(
        &mut self,
        prompt: &str,
        opts: GenerateOptions,
        cancel: &CancellationToken,
        on_token: impl FnMut(u32, &str),
    ) -> Result<GenerationStats> {
        let lora = self.lora_manager.active_adapter().unwrap_or_else(ActiveComposite::new);
        self.generator.generate(prompt, opts, &lora, cancel, on_token)
    }
}
