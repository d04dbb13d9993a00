use std::collections::HashMap;
use std::sync::Arc;

use wgpu::BufferUsages;

use crate::dtype::Dtype;
use crate::gpu::buffer_pool::GpuBuf;

/// A single loaded tensor. The loader picks the variant per the manifest's
/// `quantization` tag and the tensor's own dtype/size: dense float weights
/// that fit a single binding go straight to the GPU, oversized ones get
/// tagged `Quantized` so the kernel façade can route them through sharded
/// dispatch, and CPU-resident weights (e.g. small routing tables a caller
/// wants to inspect host-side) stay off the GPU until first use.
#[derive(Clone)]
pub enum WeightHandle {
    GpuDense {
        buffer: GpuBuf,
        dtype: Dtype,
        shape: Vec<usize>,
    },
    CpuDense {
        data: Arc<Vec<u8>>,
        dtype: Dtype,
        shape: Vec<usize>,
    },
    Quantized {
        shards: Vec<GpuBuf>,
        tile_shape: Vec<usize>,
        scale_table: Option<GpuBuf>,
        dtype_tag: Dtype,
    },
}

impl WeightHandle {
    pub fn shape(&self) -> &[usize] {
        match self {
            WeightHandle::GpuDense { shape, .. } => shape,
            WeightHandle::CpuDense { shape, .. } => shape,
            WeightHandle::Quantized { tile_shape, .. } => tile_shape,
        }
    }

    /// The single GPU buffer backing this weight, when it has exactly one.
    /// Quantized weights with more than one shard return `None`; callers on
    /// that path must go through `shards()` instead.
    pub fn as_gpu_buffer(&self) -> Option<&GpuBuf> {
        match self {
            WeightHandle::GpuDense { buffer, .. } => Some(buffer),
            WeightHandle::Quantized { shards, .. } if shards.len() == 1 => shards.first(),
            _ => None,
        }
    }
}

/// Weight buffer management: maps tensor names to loaded weight handles.
pub struct WeightStore {
    weights: HashMap<String, WeightHandle>,
    device: Arc<wgpu::Device>,
}

impl WeightStore {
    pub fn new(device: Arc<wgpu::Device>, _queue: Arc<wgpu::Queue>) -> Self {
        Self {
            weights: HashMap::new(),
            device,
        }
    }

    /// Upload a dense tensor to the GPU as a storage buffer, sharding across
    /// multiple buffers if it exceeds `max_binding_size`.
    pub fn upload_dense(
        &mut self,
        name: &str,
        data: &[u8],
        dtype: Dtype,
        shape: Vec<usize>,
        max_binding_size: u64,
    ) -> &WeightHandle {
        let handle = if (data.len() as u64) <= max_binding_size {
            WeightHandle::GpuDense {
                buffer: self.upload_buffer(name, data),
                dtype,
                shape,
            }
        } else {
            let shards = self.upload_sharded(name, data, max_binding_size);
            WeightHandle::Quantized {
                shards,
                tile_shape: shape,
                scale_table: None,
                dtype_tag: dtype,
            }
        };
        self.weights.insert(name.to_string(), handle);
        self.weights.get(name).unwrap()
    }

    /// Store a quantized tensor (e.g. ternary-packed weights plus their
    /// per-block scale table) without a dense float representation.
    pub fn insert_quantized(
        &mut self,
        name: &str,
        shards: Vec<GpuBuf>,
        tile_shape: Vec<usize>,
        scale_table: Option<GpuBuf>,
        dtype_tag: Dtype,
    ) {
        self.weights.insert(
            name.to_string(),
            WeightHandle::Quantized {
                shards,
                tile_shape,
                scale_table,
                dtype_tag,
            },
        );
    }

    pub fn insert_cpu_dense(&mut self, name: &str, data: Vec<u8>, dtype: Dtype, shape: Vec<usize>) {
        self.weights.insert(
            name.to_string(),
            WeightHandle::CpuDense {
                data: Arc::new(data),
                dtype,
                shape,
            },
        );
    }

    fn upload_buffer(&self, name: &str, data: &[u8]) -> GpuBuf {
        let size = data.len().max(4) as u64;
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(name),
            size,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
            mapped_at_creation: true,
        });
        {
            let mut view = buffer.slice(..).get_mapped_range_mut();
            view[..data.len()].copy_from_slice(data);
        }
        buffer.unmap();
        Arc::new(buffer)
    }

    fn upload_sharded(&self, name: &str, data: &[u8], max_binding_size: u64) -> Vec<GpuBuf> {
        let max = max_binding_size as usize;
        let mut shards = Vec::new();
        let mut offset = 0usize;
        let mut shard_idx = 0;
        while offset < data.len() {
            let end = (offset + max).min(data.len());
            let shard_name = format!("{name}.shard_{shard_idx}");
            shards.push(self.upload_buffer(&shard_name, &data[offset..end]));
            offset = end;
            shard_idx += 1;
        }
        shards
    }

    pub fn get(&self, name: &str) -> Option<&WeightHandle> {
        self.weights.get(name)
    }

    /// Convenience accessor for the common case of a single-buffer dense
    /// weight, used throughout the layer executor.
    pub fn get_gpu_buffer(&self, name: &str) -> Option<&GpuBuf> {
        self.weights.get(name).and_then(|w| w.as_gpu_buffer())
    }

    pub fn has(&self, name: &str) -> bool {
        self.weights.contains_key(name)
    }
}
