//! Kernel façade (C3): typed entry points the layer executor, logits head,
//! and KV cache call into. Per the purpose statement, the raw shader code is
//! a deliberately out-of-scope collaborator — this module specifies the
//! *contract* (shapes, dtypes, call order) a kernel backend must satisfy.
//! `super::wgpu_backend::WgpuKernelRunner` is the shipped reference backend.

use std::sync::Arc;

use crate::dtype::Dtype;
use crate::error::Result;
use crate::gpu::buffer_pool::GpuBuf;

/// Attention mask mode. `Causal` is used for multi-token prefill; `None` for
/// a single-token decode step, where the KV cache's `seqLen` already bounds
/// the valid range so there is nothing further to mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttnMask {
    Causal,
    None,
}

/// `transposeB` selector for `matmul`. `Auto` infers from the weight's
/// declared shape: HF-style `[N, K]` weights imply `transpose_b = true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransposeB {
    True,
    False,
    Auto,
}

/// A GPU-resident tensor: a buffer plus the shape/dtype metadata the kernel
/// façade needs to compute dispatch sizes. Mirrors spec.md's tensor
/// descriptor (§4.1) bound to a concrete storage buffer.
#[derive(Clone)]
pub struct GpuTensor {
    pub buffer: GpuBuf,
    pub shape: Vec<usize>,
    pub dtype: Dtype,
}

impl GpuTensor {
    pub fn new(buffer: GpuBuf, shape: Vec<usize>, dtype: Dtype) -> Self {
        Self {
            buffer,
            shape,
            dtype,
        }
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Disambiguates which role a matmul plays, since weight layout conventions
/// (row vs. column major, tied-embedding reuse) differ by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatmulRole {
    Projection,
    LmHead,
    Router,
}

/// Opaque handle for batching kernel dispatches into a single GPU submission.
/// When present, `KernelRunner` implementations record into it instead of
/// submitting eagerly; `submit()` flushes all recorded work in program
/// order. Either path is semantically identical (spec.md §4.3).
pub trait CommandRecorder: Send {
    fn submit(self: Box<Self>);

    /// Lets a `KernelRunner` recover its own concrete recorder type back from
    /// the trait object it handed the caller. A recorder is only ever valid
    /// with the runner that created it.
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

/// The kernel façade contract. All operations are pure: none mutate inputs
/// except `append_kv`, whose entire purpose is the mutation it documents.
pub trait KernelRunner: Send + Sync {
    /// `y_t = (x_t / sqrt(mean(x_t^2) + eps)) * (weight_offset ? (1+w) : w)`
    fn rmsnorm(
        &self,
        x: &GpuTensor,
        weight: &GpuTensor,
        eps: f32,
        weight_offset: bool,
        recorder: Option<&mut dyn CommandRecorder>,
    ) -> Result<GpuTensor>;

    /// `C[M,N] = A[M,K] @ B`. With `TransposeB::Auto`, the shape of `b` vs.
    /// `(n, k)` decides whether `b` is stored as `[K,N]` or `[N,K]`.
    fn matmul(
        &self,
        a: &GpuTensor,
        b: &GpuTensor,
        m: usize,
        n: usize,
        k: usize,
        transpose_b: TransposeB,
        role: MatmulRole,
        recorder: Option<&mut dyn CommandRecorder>,
    ) -> Result<GpuTensor>;

    /// Applies complex-pair rotation to `q`/`k` at positions
    /// `position_base..position_base+T` using the device-resident cos/sin
    /// tables.
    fn rope(
        &self,
        q: &GpuTensor,
        k: &GpuTensor,
        cos: &GpuTensor,
        sin: &GpuTensor,
        position_base: usize,
        recorder: Option<&mut dyn CommandRecorder>,
    ) -> Result<(GpuTensor, GpuTensor)>;

    /// Grouped-query attention: `Nq` query heads share each of `Nkv` k/v
    /// heads. `seq_len` bounds the valid K/V rows (decode steps must
    /// `append_kv` first so the row just written is visible here).
    #[allow(clippy::too_many_arguments)]
    fn attention(
        &self,
        q: &GpuTensor,
        k_cache: &GpuTensor,
        v_cache: &GpuTensor,
        seq_len: usize,
        num_q_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        mask: AttnMask,
        recorder: Option<&mut dyn CommandRecorder>,
    ) -> Result<GpuTensor>;

    /// Writes rows `[start, start+T)` of `k`/`v` into the per-layer cache.
    fn append_kv(
        &self,
        k_cache: &GpuTensor,
        v_cache: &GpuTensor,
        k: &GpuTensor,
        v: &GpuTensor,
        start: usize,
        recorder: Option<&mut dyn CommandRecorder>,
    ) -> Result<()>;

    /// Elementwise `y = tanh(x/c) * c`. Used for final-logit softcapping.
    fn softcap(
        &self,
        x: &GpuTensor,
        c: f32,
        recorder: Option<&mut dyn CommandRecorder>,
    ) -> Result<GpuTensor>;

    /// Elementwise activation. `kind`: 0 = ReLU^2, 1 = SiLU, 2 = GELU.
    fn activation(
        &self,
        x: &GpuTensor,
        kind: u32,
        recorder: Option<&mut dyn CommandRecorder>,
    ) -> Result<GpuTensor>;

    /// Elementwise binary op. `op`: 0 = add, 1 = mul.
    fn elementwise(
        &self,
        a: &GpuTensor,
        b: &GpuTensor,
        op: u32,
        recorder: Option<&mut dyn CommandRecorder>,
    ) -> Result<GpuTensor>;

    /// Row-gather embedding lookup: `token_ids[T] -> hidden[T, H]`.
    fn embedding(
        &self,
        token_ids: &[u32],
        embed_table: &GpuTensor,
        hidden_size: usize,
        recorder: Option<&mut dyn CommandRecorder>,
    ) -> Result<GpuTensor>;

    /// Host-visible readback, gated by `allow_readback` outside of debug.
    fn read_f32(&self, tensor: &GpuTensor) -> Result<Vec<f32>>;

    fn create_recorder(&self, label: &str) -> Box<dyn CommandRecorder>;

    fn max_buffer_binding_size(&self) -> u64;
}

pub type SharedKernelRunner = Arc<dyn KernelRunner>;
