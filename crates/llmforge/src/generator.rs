//! Generation session orchestration (C10): chat templating, prefill, the
//! decode loop, stop conditions, and prefix-KV snapshot/replay. One
//! `Generator` owns exactly one KV cache and refuses re-entrant generation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::{LoomError, Result};
use crate::gpu::buffer_pool::BufferPool;
use crate::gpu::kernel::{AttnMask, KernelRunner, SharedKernelRunner};
use crate::lora::adapter::ActiveComposite;
use crate::model::config::ModelConfig;
use crate::nn::causal_lm::{CausalLm, ModelLora};
use crate::nn::kv_cache::KvCache;
use crate::sampling::{sample_token, SamplingParams};
use crate::tokenizer::{ChatMessage, Tokenizer};

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    pub stop_token_ids: Vec<u32>,
    pub stop_sequences: Vec<String>,
    pub use_chat_template: bool,
    /// Optional intent-bundle guard: the top-K token ids the caller expects
    /// immediately after prefill. `intent_drift_max_diff` bounds the
    /// symmetric difference against the actual prefill top-K before it is
    /// treated as drift.
    pub expected_top_k: Option<Vec<u32>>,
    pub intent_drift_max_diff: usize,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 1.0,
            top_k: 50,
            top_p: 1.0,
            repeat_penalty: 1.0,
            repeat_last_n: 64,
            stop_token_ids: Vec::new(),
            stop_sequences: Vec::new(),
            use_chat_template: false,
            expected_top_k: None,
            intent_drift_max_diff: 0,
        }
    }
}

impl GenerateOptions {
    fn sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            repeat_penalty: self.repeat_penalty,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerationStats {
    pub tokens_generated: usize,
    pub prompt_tokens: usize,
}

/// A point-in-time, independently owned copy of a generation session's KV
/// cache. May be replayed via `generate_with_prefix_kv` any number of times;
/// replay never mutates the snapshot.
pub struct KvSnapshot {
    cache: KvCache,
    pub seq_len: usize,
    pub tokens: Vec<u32>,
}

/// Cancellation is a plain shared flag: the decode loop checks it at the top
/// of each iteration and completes the in-flight submission before stopping.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Generator {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    kernel: SharedKernelRunner,
    model: Arc<CausalLm>,
    tokenizer: Arc<Tokenizer>,
    config: ModelConfig,
    pool: BufferPool,
    kv_cache: KvCache,
    is_generating: AtomicBool,
}

impl Generator {
    pub fn new(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        kernel: SharedKernelRunner,
        model: Arc<CausalLm>,
        tokenizer: Arc<Tokenizer>,
        config: ModelConfig,
        max_seq_len: usize,
    ) -> Self {
        let kv_cache = KvCache::new(Arc::clone(&device), Arc::clone(&queue), &config, max_seq_len);
        let pool = BufferPool::new(Arc::clone(&device), 256);
        Self {
            device,
            queue,
            kernel,
            model,
            tokenizer,
            config,
            pool,
            kv_cache,
            is_generating: AtomicBool::new(false),
        }
    }

    pub fn is_generating(&self) -> bool {
        self.is_generating.load(Ordering::SeqCst)
    }

    fn acquire_generation_guard(&self) -> Result<GenerationGuard<'_>> {
        if self
            .is_generating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(LoomError::GenerationInProgress);
        }
        Ok(GenerationGuard { flag: &self.is_generating })
    }

    /// Runs chat templating (if requested), prefill, and the decode loop,
    /// invoking `on_token(id, text)` for every emitted token in order.
    pub fn generate(
        &mut self,
        prompt: &str,
        opts: GenerateOptions,
        lora: &ActiveComposite,
        cancel: &CancellationToken,
        on_token: impl FnMut(u32, &str),
    ) -> Result<GenerationStats> {
        let _guard = self.acquire_generation_guard()?;
        let input_ids = self.encode_prompt(prompt, opts.use_chat_template)?;
        self.run_generate(input_ids, opts, lora, cancel, on_token)
    }

    /// Renders a full chat history through the tokenizer's own template
    /// (multi-turn, unlike `generate`'s single-message `use_chat_template`)
    /// before running the same prefill/decode loop.
    pub fn generate_chat(
        &mut self,
        messages: &[ChatMessage],
        opts: GenerateOptions,
        lora: &ActiveComposite,
        cancel: &CancellationToken,
        on_token: impl FnMut(u32, &str),
    ) -> Result<GenerationStats> {
        let _guard = self.acquire_generation_guard()?;
        let input_ids = self.tokenizer.apply_chat_template(messages)?;
        self.run_generate(input_ids, opts, lora, cancel, on_token)
    }

    fn run_generate(
        &mut self,
        input_ids: Vec<u32>,
        opts: GenerateOptions,
        lora: &ActiveComposite,
        cancel: &CancellationToken,
        mut on_token: impl FnMut(u32, &str),
    ) -> Result<GenerationStats> {
        let mut generated_ids = input_ids.clone();
        let materialized = if lora.is_empty() {
            MaterializedLora::empty()
        } else {
            MaterializedLora::upload(&self.device, lora)
        };
        let model_lora = materialized.model_lora();

        let position_base = self.kv_cache.seq_len();
        let mut recorder = self.kernel.create_recorder("prefill");
        let first_logits = self.model.forward(
            self.kernel.as_ref(),
            &input_ids,
            &mut self.kv_cache,
            position_base,
            AttnMask::Causal,
            None,
            &model_lora,
            Some(&mut *recorder),
        )?;
        recorder.submit();

        let mut logits_host = self.kernel.read_f32(&first_logits)?;
        check_intent_drift(&logits_host, &opts)?;

        let mut stats = GenerationStats {
            tokens_generated: 0,
            prompt_tokens: input_ids.len(),
        };

        let recent = |ids: &[u32], last_n: usize| -> Vec<u32> {
            let start = ids.len().saturating_sub(last_n);
            ids[start..].to_vec()
        };

        let sampling = opts.sampling();
        let mut decoded_tail = String::new();

        let token = sample_token(&mut logits_host, sampling, &recent(&generated_ids, opts.repeat_last_n));
        generated_ids.push(token);
        stats.tokens_generated += 1;
        let text = self.tokenizer.decode_one(token).unwrap_or_default();
        decoded_tail.push_str(&text);
        on_token(token, &text);

        if self.should_stop(token, &decoded_tail, &opts, &stats) {
            return Ok(stats);
        }

        loop {
            if cancel.is_cancelled() {
                return Err(LoomError::Cancelled);
            }

            let position_base = self.kv_cache.seq_len();
            let mut recorder = self.kernel.create_recorder("decode_step");
            let step_logits = self.model.forward(
                self.kernel.as_ref(),
                &[token],
                &mut self.kv_cache,
                position_base,
                AttnMask::None,
                None,
                &model_lora,
                Some(&mut *recorder),
            )?;
            recorder.submit();
            let mut logits_host = self.kernel.read_f32(&step_logits)?;

            let next = sample_token(
                &mut logits_host,
                sampling,
                &recent(&generated_ids, opts.repeat_last_n),
            );
            generated_ids.push(next);
            stats.tokens_generated += 1;
            let text = self.tokenizer.decode_one(next).unwrap_or_default();
            decoded_tail.push_str(&text);
            trim_decoded_tail(&mut decoded_tail, 256);
            on_token(next, &text);

            if self.should_stop(next, &decoded_tail, &opts, &stats) {
                break;
            }
        }

        Ok(stats)
    }

    /// Runs prefill without sampling and returns a reusable snapshot of the
    /// resulting cache state.
    pub fn prefill_kv_only(&mut self, prompt: &str, use_chat_template: bool) -> Result<KvSnapshot> {
        let _guard = self.acquire_generation_guard()?;
        let tokens = self.encode_prompt(prompt, use_chat_template)?;
        let position_base = self.kv_cache.seq_len();
        let model_lora = MaterializedLora::empty().model_lora();

        let mut recorder = self.kernel.create_recorder("prefill_kv_only");
        self.model.forward(
            self.kernel.as_ref(),
            &tokens,
            &mut self.kv_cache,
            position_base,
            AttnMask::Causal,
            None,
            &model_lora,
            Some(&mut *recorder),
        )?;
        recorder.submit();

        Ok(KvSnapshot {
            cache: self.kv_cache.clone_snapshot(&self.pool),
            seq_len: self.kv_cache.seq_len(),
            tokens,
        })
    }

    /// Clones `prefix` into this session's cache, continues prefill with
    /// `prompt` at `prefix.seq_len`, then runs the ordinary decode loop.
    /// `prefix` is never consumed: cloning makes every call an independent
    /// replay.
    pub fn generate_with_prefix_kv(
        &mut self,
        prefix: &KvSnapshot,
        prompt: &str,
        opts: GenerateOptions,
        lora: &ActiveComposite,
        cancel: &CancellationToken,
        on_token: impl FnMut(u32, &str),
    ) -> Result<GenerationStats> {
        self.kv_cache = prefix.cache.clone_snapshot(&self.pool);
        self.generate(prompt, opts, lora, cancel, on_token)
    }

    pub fn reset(&mut self) {
        self.kv_cache.clear();
    }

    fn encode_prompt(&self, prompt: &str, use_chat_template: bool) -> Result<Vec<u32>> {
        if use_chat_template {
            self.tokenizer.apply_chat_template(&[ChatMessage {
                role: "user".into(),
                content: prompt.to_string(),
            }])
        } else {
            self.tokenizer.encode(prompt, true)
        }
    }

    fn should_stop(&self, token: u32, decoded_tail: &str, opts: &GenerateOptions, stats: &GenerationStats) -> bool {
        if stats.tokens_generated >= opts.max_tokens {
            return true;
        }
        if token == self.tokenizer.eos_token_id() || opts.stop_token_ids.contains(&token) {
            return true;
        }
        if Some(token) == self.tokenizer.eot_token_id() || Some(token) == self.tokenizer.im_end_token_id() {
            return true;
        }
        matches_stop_sequence(decoded_tail, &opts.stop_sequences)
    }
}

/// True as soon as any configured stop sequence is a suffix of the decoded
/// continuation so far — checked after every emitted token, never waiting
/// for more text than the match itself requires.
/// Truncates `decoded_tail` to at most `max_bytes`, keeping its suffix and
/// rounding the cut point forward to the next UTF-8 char boundary so a
/// multi-byte token split across the 256-byte window never panics.
fn trim_decoded_tail(decoded_tail: &mut String, max_bytes: usize) {
    if decoded_tail.len() <= max_bytes {
        return;
    }
    let mut trim_at = decoded_tail.len() - max_bytes;
    while !decoded_tail.is_char_boundary(trim_at) {
        trim_at += 1;
    }
    decoded_tail.replace_range(..trim_at, "");
}

fn matches_stop_sequence(decoded_tail: &str, stop_sequences: &[String]) -> bool {
    stop_sequences.iter().any(|seq| decoded_tail.ends_with(seq.as_str()))
}

fn check_intent_drift(logits: &[f32], opts: &GenerateOptions) -> Result<()> {
    let Some(expected) = &opts.expected_top_k else {
        return Ok(());
    };
    let k = expected.len();
    let mut indexed: Vec<(usize, f32)> = logits.iter().copied().enumerate().collect();
    indexed.sort_unstable_by(|a, b| b.1.total_cmp(&a.1));
    let actual: std::collections::HashSet<u32> = indexed.iter().take(k).map(|&(i, _)| i as u32).collect();
    let expected_set: std::collections::HashSet<u32> = expected.iter().copied().collect();
    let symmetric_diff = actual.symmetric_difference(&expected_set).count();
    if symmetric_diff > opts.intent_drift_max_diff {
        debug!(symmetric_diff, threshold = opts.intent_drift_max_diff, "intent drift detected");
        return Err(LoomError::IntentDrift);
    }
    Ok(())
}

/// Uploads a CPU-resident LoRA composite (the output of `weighted_sum`
/// merging) to GPU tensors once per `generate` call, and owns them for the
/// duration of the forward pass. GPU-resident entries in the composite are
/// wrapped without a copy.
struct MaterializedLora {
    per_layer: std::collections::HashMap<usize, std::collections::HashMap<String, crate::nn::linear::LoraDelta>>,
}

impl MaterializedLora {
    fn empty() -> Self {
        Self {
            per_layer: std::collections::HashMap::new(),
        }
    }

    fn upload(device: &wgpu::Device, composite: &ActiveComposite) -> Self {
        let mut per_layer = std::collections::HashMap::new();
        for (&layer, modules) in composite {
            let mut uploaded = std::collections::HashMap::new();
            for (module, weights) in modules {
                uploaded.insert(module.clone(), to_lora_delta(device, weights));
            }
            per_layer.insert(layer, uploaded);
        }
        Self { per_layer }
    }

    fn model_lora(&self) -> ModelLora<'_> {
        use crate::nn::attention::AttentionLora;
        use crate::nn::ffn::FfnLora;
        use crate::nn::layer::LayerLora;

        let mut per_layer_lora = std::collections::HashMap::new();
        for (&layer, modules) in &self.per_layer {
            let mut lora = LayerLora {
                attn: AttentionLora::default(),
                ffn: FfnLora::default(),
            };
            for (module, delta) in modules {
                match module.as_str() {
                    "q_proj" => lora.attn.q = Some(delta),
                    "k_proj" => lora.attn.k = Some(delta),
                    "v_proj" => lora.attn.v = Some(delta),
                    "o_proj" => lora.attn.o = Some(delta),
                    "gate_proj" => lora.ffn.gate = Some(delta),
                    "up_proj" => lora.ffn.up = Some(delta),
                    "down_proj" => lora.ffn.down = Some(delta),
                    _ => {}
                }
            }
            per_layer_lora.insert(layer, lora);
        }
        ModelLora { per_layer: per_layer_lora }
    }
}

fn to_lora_delta(device: &wgpu::Device, weights: &crate::lora::adapter::ProjectionWeights) -> crate::nn::linear::LoraDelta {
    use crate::lora::adapter::TensorResidency;
    use crate::nn::linear::LoraDelta;

    let a = match &weights.a {
        TensorResidency::Cpu(data) => upload_f32(device, data, weights.a_shape.clone()),
        TensorResidency::Gpu(buf) => crate::gpu::kernel::GpuTensor::new(buf.clone(), weights.a_shape.clone(), crate::dtype::Dtype::F32),
    };
    let b = match &weights.b {
        TensorResidency::Cpu(data) => upload_f32(device, data, weights.b_shape.clone()),
        TensorResidency::Gpu(buf) => crate::gpu::kernel::GpuTensor::new(buf.clone(), weights.b_shape.clone(), crate::dtype::Dtype::F32),
    };
    LoraDelta {
        a,
        b,
        rank: weights.rank as usize,
    }
}

fn upload_f32(device: &wgpu::Device, data: &[f32], shape: Vec<usize>) -> crate::gpu::kernel::GpuTensor {
    use wgpu::BufferUsages;
    let bytes = bytemuck::cast_slice(data);
    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("lora_delta_upload"),
        size: bytes.len().max(4) as u64,
        usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
        mapped_at_creation: true,
    });
    {
        let mut view = buffer.slice(..).get_mapped_range_mut();
        view[..bytes.len()].copy_from_slice(bytes);
    }
    buffer.unmap();
    crate::gpu::kernel::GpuTensor::new(Arc::new(buffer), shape, crate::dtype::Dtype::F32)
}

struct GenerationGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for GenerationGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_token_round_trips() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn intent_drift_within_threshold_passes() {
        let opts = GenerateOptions {
            expected_top_k: Some(vec![0, 1]),
            intent_drift_max_diff: 1,
            ..Default::default()
        };
        let logits = vec![5.0, 4.0, 0.0, 0.0];
        assert!(check_intent_drift(&logits, &opts).is_ok());
    }

    #[test]
    fn intent_drift_beyond_threshold_fails() {
        let opts = GenerateOptions {
            expected_top_k: Some(vec![2, 3]),
            intent_drift_max_diff: 0,
            ..Default::default()
        };
        let logits = vec![5.0, 4.0, 0.0, 0.0];
        assert!(matches!(check_intent_drift(&logits, &opts), Err(LoomError::IntentDrift)));
    }

    #[test]
    fn stop_sequence_matches_decoded_suffix() {
        let stop_sequences = vec!["\n\n".to_string()];
        assert!(matches_stop_sequence("foo\n\n", &stop_sequences));
        assert!(!matches_stop_sequence("foo\n", &stop_sequences));
    }

    #[test]
    fn trim_decoded_tail_never_splits_a_multi_byte_char() {
        // "字" is 3 bytes; pad so the naive `len - max_bytes` cut point lands
        // inside it instead of on a char boundary.
        let mut tail = "a".repeat(255);
        tail.push('字');
        assert_eq!(tail.len(), 258);
        trim_decoded_tail(&mut tail, 256);
        assert!(tail.is_char_boundary(0));
        assert!(tail.ends_with('字'));
    }

    #[test]
    fn trim_decoded_tail_is_noop_under_the_limit() {
        let mut tail = "short".to_string();
        trim_decoded_tail(&mut tail, 256);
        assert_eq!(tail, "short");
    }
}
