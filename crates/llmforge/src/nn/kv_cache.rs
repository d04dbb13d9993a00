//! Per-layer key/value cache (C4): `Smax x Nkv x D` storage per layer plus a
//! monotonic `seq_len`, the currently filled prefix. Exclusively owned by one
//! generation session; `clone_snapshot` produces an independently owned copy
//! so a shared prompt prefix can be replayed without aliasing.

use std::sync::Arc;

use wgpu::BufferUsages;

use crate::error::{LoomError, Result};
use crate::gpu::buffer_pool::{BufferPool, GpuBuf};
use crate::gpu::kernel::GpuTensor;
use crate::model::config::ModelConfig;

struct LayerKv {
    key: GpuBuf,
    value: GpuBuf,
}

/// Owns every layer's K/V buffers and the single `seq_len` they share — all
/// layers advance together since prefill/decode always writes every layer
/// for the same set of token positions.
pub struct KvCache {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    layers: Vec<LayerKv>,
    num_kv_heads: usize,
    head_dim: usize,
    max_seq_len: usize,
    seq_len: usize,
}

impl KvCache {
    pub fn new(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        config: &ModelConfig,
        max_seq_len: usize,
    ) -> Self {
        let num_kv_heads = config.num_key_value_heads;
        let head_dim = config.head_dim();
        let layers = (0..config.num_hidden_layers)
            .map(|_| LayerKv {
                key: Self::alloc_row_buffer(&device, max_seq_len, num_kv_heads, head_dim),
                value: Self::alloc_row_buffer(&device, max_seq_len, num_kv_heads, head_dim),
            })
            .collect();

        Self {
            device,
            queue,
            layers,
            num_kv_heads,
            head_dim,
            max_seq_len,
            seq_len: 0,
        }
    }

    fn alloc_row_buffer(
        device: &wgpu::Device,
        max_seq_len: usize,
        num_kv_heads: usize,
        head_dim: usize,
    ) -> GpuBuf {
        let size = (max_seq_len * num_kv_heads * head_dim * 4) as u64;
        Arc::new(device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("kv_cache_row"),
            size,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        }))
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Rows `[seq_len, seq_len + added)` of layer `i` as a GPU tensor,
    /// truncated to the currently valid length for reads, or the full
    /// capacity for appends — callers distinguish via `key_tensor`/
    /// `value_tensor` (valid rows only) vs. the raw buffer for writes.
    pub fn key_tensor(&self, layer: usize) -> GpuTensor {
        GpuTensor::new(
            Arc::clone(&self.layers[layer].key),
            vec![self.seq_len, self.num_kv_heads, self.head_dim],
            crate::dtype::Dtype::F32,
        )
    }

    pub fn value_tensor(&self, layer: usize) -> GpuTensor {
        GpuTensor::new(
            Arc::clone(&self.layers[layer].value),
            vec![self.seq_len, self.num_kv_heads, self.head_dim],
            crate::dtype::Dtype::F32,
        )
    }

    /// The full-capacity buffer backing layer `i`'s keys/values, used as the
    /// append destination by `KernelRunner::append_kv`.
    pub fn key_buffer(&self, layer: usize) -> GpuTensor {
        GpuTensor::new(
            Arc::clone(&self.layers[layer].key),
            vec![self.max_seq_len, self.num_kv_heads, self.head_dim],
            crate::dtype::Dtype::F32,
        )
    }

    pub fn value_buffer(&self, layer: usize) -> GpuTensor {
        GpuTensor::new(
            Arc::clone(&self.layers[layer].value),
            vec![self.max_seq_len, self.num_kv_heads, self.head_dim],
            crate::dtype::Dtype::F32,
        )
    }

    /// Reserve `added` rows without writing them — `append_kv` fills the
    /// actual data, then `seq_len` advances so those rows become visible to
    /// subsequent attention calls. The layer executor calls this once per
    /// decode step (at layer 0) rather than once per layer: every layer
    /// advances the same `seq_len`.
    pub fn check_capacity(&self, added: usize) -> Result<()> {
        if self.seq_len + added > self.max_seq_len {
            return Err(LoomError::SequenceOverflow {
                seq_len: self.seq_len,
                added,
                max_seq_len: self.max_seq_len,
            });
        }
        Ok(())
    }

    pub fn advance(&mut self, added: usize) -> Result<()> {
        self.check_capacity(added)?;
        self.seq_len += added;
        Ok(())
    }

    /// Deep-copy every layer's K/V buffers into freshly allocated storage,
    /// so the clone is an independent owner and mutating one does not affect
    /// the other. Used for prompt-prefix snapshot/replay (`Generator::snapshot_kv`).
    /// Submits its own copy commands immediately rather than threading a
    /// recorder through, since a snapshot is a point-in-time operation
    /// outside the normal per-step command stream.
    pub fn clone_snapshot(&self, pool: &BufferPool) -> Self {
        let row_bytes = (self.max_seq_len * self.num_kv_heads * self.head_dim * 4) as u64;
        let layers = self
            .layers
            .iter()
            .map(|l| LayerKv {
                key: self.copy_buffer(pool, &l.key, row_bytes),
                value: self.copy_buffer(pool, &l.value, row_bytes),
            })
            .collect();

        Self {
            device: Arc::clone(&self.device),
            queue: Arc::clone(&self.queue),
            layers,
            num_kv_heads: self.num_kv_heads,
            head_dim: self.head_dim,
            max_seq_len: self.max_seq_len,
            seq_len: self.seq_len,
        }
    }

    fn copy_buffer(&self, pool: &BufferPool, src: &GpuBuf, size: u64) -> GpuBuf {
        let dst = pool.acquire(
            size,
            BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
        );
        let mut encoder = self.device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(src, 0, &dst, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));
        dst
    }

    pub fn clear(&mut self) {
        self.seq_len = 0;
    }
}
