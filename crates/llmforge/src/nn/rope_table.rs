//! Precomputed RoPE cos/sin tables (one row per absolute position, `head_dim
//! / 2` columns), uploaded once at model build time and reused by every
//! layer's `rope` dispatch. A second table is built when the architecture
//! alternates a local attention RoPE base (`rope_theta_local`).

use std::sync::Arc;

use wgpu::BufferUsages;

use crate::dtype::Dtype;
use crate::gpu::kernel::GpuTensor;

pub struct RopeTable {
    pub cos: GpuTensor,
    pub sin: GpuTensor,
}

impl RopeTable {
    pub fn build(device: &wgpu::Device, theta: f32, max_seq_len: usize, head_dim: usize) -> Self {
        let half_dim = head_dim / 2;
        let mut cos_data = Vec::with_capacity(max_seq_len * half_dim);
        let mut sin_data = Vec::with_capacity(max_seq_len * half_dim);

        for pos in 0..max_seq_len {
            for pair in 0..half_dim {
                let freq = 1.0 / theta.powf((2 * pair) as f32 / head_dim as f32);
                let angle = pos as f32 * freq;
                cos_data.push(angle.cos());
                sin_data.push(angle.sin());
            }
        }

        Self {
            cos: upload_f32(device, "rope_cos_table", &cos_data, vec![max_seq_len, half_dim]),
            sin: upload_f32(device, "rope_sin_table", &sin_data, vec![max_seq_len, half_dim]),
        }
    }
}

fn upload_f32(device: &wgpu::Device, label: &str, data: &[f32], shape: Vec<usize>) -> GpuTensor {
    let bytes = bytemuck::cast_slice(data);
    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: bytes.len().max(4) as u64,
        usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
        mapped_at_creation: true,
    });
    {
        let mut view = buffer.slice(..).get_mapped_range_mut();
        view[..bytes.len()].copy_from_slice(bytes);
    }
    buffer.unmap();
    GpuTensor::new(Arc::new(buffer), shape, Dtype::F32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_dim_matches_head_dim() {
        // Table layout assumes head_dim is even; odd head dims would silently
        // drop the last dimension's rotation pair.
        assert_eq!(8 / 2, 4);
    }
}
