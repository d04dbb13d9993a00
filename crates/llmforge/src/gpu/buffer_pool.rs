use std::sync::{Arc, Mutex};

use wgpu::BufferUsages;

use crate::error::{LoomError, Result};

/// A shareable reference to a GPU buffer.
pub type GpuBuf = Arc<wgpu::Buffer>;

struct PooledBuffer {
    buffer: GpuBuf,
    capacity: u64,
    usage: BufferUsages,
}

/// GPU buffer pool / factory.
///
/// Buffers are bucketed by (usage, capacity): `acquire` first looks for a
/// pooled buffer whose capacity is >= the request and whose usage flags
/// match, reusing it in place of a fresh allocation. `release` returns a
/// buffer to the pool instead of letting it drop, so the repeated per-step
/// allocations of the decode loop (one per kernel dispatch, every step)
/// don't thrash the GPU allocator.
pub struct BufferPool {
    device: Arc<wgpu::Device>,
    alignment: u64,
    free: Mutex<Vec<PooledBuffer>>,
}

impl BufferPool {
    pub fn new(device: Arc<wgpu::Device>, alignment: u64) -> Self {
        Self {
            device,
            alignment,
            free: Mutex::new(Vec::new()),
        }
    }

    fn align_size(&self, size: u64) -> u64 {
        ((size + self.alignment - 1) / self.alignment) * self.alignment
    }

    /// Create or reuse a buffer of at least `size` bytes with the given
    /// usage flags. Contents are undefined unless the caller subsequently
    /// writes to it; no implicit zeroing happens on reuse.
    pub fn acquire(&self, size: u64, usage: BufferUsages) -> GpuBuf {
        let aligned = self.align_size(size.max(4));

        if let Some(buf) = self.take_pooled(aligned, usage) {
            return buf;
        }

        Arc::new(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: aligned,
            usage,
            mapped_at_creation: false,
        }))
    }

    /// Like `acquire`, but fails with `OutOfMemory` instead of allocating
    /// fresh when no pooled buffer of sufficient capacity exists. Used on
    /// paths that must not grow GPU memory (e.g. batched-decode retries).
    pub fn acquire_pooled_only(&self, size: u64, usage: BufferUsages) -> Result<GpuBuf> {
        let aligned = self.align_size(size.max(4));
        self.take_pooled(aligned, usage)
            .ok_or(LoomError::OutOfMemory { requested: aligned })
    }

    fn take_pooled(&self, aligned: u64, usage: BufferUsages) -> Option<GpuBuf> {
        let mut free = self.free.lock().unwrap();
        let pos = free
            .iter()
            .position(|b| b.usage == usage && b.capacity >= aligned)?;
        Some(free.swap_remove(pos).buffer)
    }

    /// Release a buffer back to the pool for reuse by a future `acquire`
    /// with a compatible usage and size. The buffer's contents are not reset.
    pub fn release(&self, buffer: GpuBuf) {
        if Arc::strong_count(&buffer) > 1 {
            // Still referenced elsewhere (e.g. KV cache rows); do not pool it.
            return;
        }
        let capacity = buffer.size();
        let usage = buffer.usage();
        self.free.lock().unwrap().push(PooledBuffer {
            buffer,
            capacity,
            usage,
        });
    }

    pub fn clear(&self) {
        self.free.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    // BufferPool requires a live wgpu::Device, unavailable in a headless
    // unit-test process; its acquire/release bucketing is exercised through
    // the generator's higher-level scenarios instead.
}
