//! `WgpuKernelRunner`: the shipped reference implementation of
//! `KernelRunner` (C3), dispatching the WGSL kernels under `src/shaders/`
//! through the pipeline cache and buffer pool shared with the rest of the
//! GPU layer.

use std::any::Any;
use std::sync::{Arc, Mutex};

use wgpu::BufferUsages;

use crate::dtype::Dtype;
use crate::error::{LoomError, Result};
use crate::gpu::buffer_pool::{BufferPool, GpuBuf};
use crate::gpu::kernel::{
    AttnMask, CommandRecorder, GpuTensor, KernelRunner, MatmulRole, TransposeB,
};
use crate::gpu::pipeline::PipelineManager;

const RMSNORM_WGSL: &str = include_str!("../shaders/rmsnorm.wgsl");
const MATMUL_WGSL: &str = include_str!("../shaders/matmul.wgsl");
const ROPE_WGSL: &str = include_str!("../shaders/rope.wgsl");
const ATTENTION_WGSL: &str = include_str!("../shaders/attention.wgsl");
const SOFTMAX_WGSL: &str = include_str!("../shaders/softmax.wgsl");
const ACTIVATION_WGSL: &str = include_str!("../shaders/activation.wgsl");
const ELEMENTWISE_WGSL: &str = include_str!("../shaders/elementwise.wgsl");
const EMBEDDING_WGSL: &str = include_str!("../shaders/embedding.wgsl");
const SOFTCAP_WGSL: &str = include_str!("../shaders/softcap.wgsl");

fn buf_entry(binding: u32, buffer: &wgpu::Buffer) -> wgpu::BindGroupEntry<'_> {
    wgpu::BindGroupEntry {
        binding,
        resource: buffer.as_entire_binding(),
    }
}

fn create_uniform_raw(device: &wgpu::Device, data: &[u8]) -> wgpu::Buffer {
    let size = ((data.len().max(4) + 3) / 4 * 4) as u64;
    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: None,
        size,
        usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
        mapped_at_creation: true,
    });
    {
        let mut view = buffer.slice(..).get_mapped_range_mut();
        view[..data.len()].copy_from_slice(data);
    }
    buffer.unmap();
    buffer
}

/// Batches command buffers recorded across several kernel calls into one
/// `submit()`. Created by `WgpuKernelRunner::create_recorder`; passing a
/// recorder from a different runner is a programming error.
struct WgpuRecorder {
    queue: Arc<wgpu::Queue>,
    buffers: Vec<wgpu::CommandBuffer>,
}

impl CommandRecorder for WgpuRecorder {
    fn submit(self: Box<Self>) {
        if !self.buffers.is_empty() {
            self.queue.submit(self.buffers);
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct WgpuKernelRunner {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    pipelines: Mutex<PipelineManager>,
    pool: Arc<BufferPool>,
}

impl WgpuKernelRunner {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>, pool: Arc<BufferPool>) -> Self {
        let pipelines = Mutex::new(PipelineManager::new(Arc::clone(&device)));
        Self {
            device,
            queue,
            pipelines,
            pool,
        }
    }

    fn finish(&self, encoder: wgpu::CommandEncoder, recorder: Option<&mut dyn CommandRecorder>) {
        let cmd = encoder.finish();
        match recorder {
            Some(r) => {
                let wr = r
                    .as_any_mut()
                    .downcast_mut::<WgpuRecorder>()
                    .expect("CommandRecorder from a different KernelRunner");
                wr.buffers.push(cmd);
            }
            None => self.queue.submit(std::iter::once(cmd)),
        }
    }

    fn alloc(&self, byte_size: u64) -> GpuBuf {
        self.pool.acquire(
            byte_size,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
        )
    }
}

impl KernelRunner for WgpuKernelRunner {
    fn rmsnorm(
        &self,
        x: &GpuTensor,
        weight: &GpuTensor,
        eps: f32,
        weight_offset: bool,
        recorder: Option<&mut dyn CommandRecorder>,
    ) -> Result<GpuTensor> {
        let n = x.shape[0];
        let hidden = x.shape[1];
        let mut pipelines = self.pipelines.lock().unwrap();
        let entry = pipelines.get_or_create_default("rmsnorm", RMSNORM_WGSL);

        let output = self.alloc((n * hidden * 4) as u64);
        let params_data = [
            (n as u32).to_le_bytes(),
            (hidden as u32).to_le_bytes(),
            eps.to_le_bytes(),
            (weight_offset as u32).to_le_bytes(),
        ]
        .concat();
        let params = create_uniform_raw(&self.device, &params_data);

        let bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kernel_rmsnorm"),
            layout: &entry.bind_group_layout,
            entries: &[
                buf_entry(0, &x.buffer),
                buf_entry(1, &weight.buffer),
                buf_entry(2, &output),
                buf_entry(3, &params),
            ],
        });

        let mut encoder = self.device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(&entry.pipeline);
            pass.set_bind_group(0, Some(&bg), &[]);
            pass.dispatch_workgroups(n as u32, 1, 1);
        }
        self.finish(encoder, recorder);

        Ok(GpuTensor::new(output, vec![n, hidden], Dtype::F32))
    }

    fn matmul(
        &self,
        a: &GpuTensor,
        b: &GpuTensor,
        m: usize,
        n: usize,
        k: usize,
        transpose_b: TransposeB,
        _role: MatmulRole,
        recorder: Option<&mut dyn CommandRecorder>,
    ) -> Result<GpuTensor> {
        let transpose_b = match transpose_b {
            TransposeB::True => true,
            TransposeB::False => false,
            // HF-style weights are stored [out, in] = [N, K]; anything else
            // the loader hands us is already [K, N].
            TransposeB::Auto => b.shape == vec![n, k],
        };

        let mut pipelines = self.pipelines.lock().unwrap();
        let entry = pipelines.get_or_create_default("matmul", MATMUL_WGSL);

        let output = self.alloc((m * n * 4) as u64);
        let params_data = [
            (m as u32).to_le_bytes(),
            (n as u32).to_le_bytes(),
            (k as u32).to_le_bytes(),
            (transpose_b as u32).to_le_bytes(),
        ]
        .concat();
        let params = create_uniform_raw(&self.device, &params_data);

        let bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kernel_matmul"),
            layout: &entry.bind_group_layout,
            entries: &[
                buf_entry(0, &a.buffer),
                buf_entry(1, &b.buffer),
                buf_entry(2, &output),
                buf_entry(3, &params),
            ],
        });

        let mut encoder = self.device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(&entry.pipeline);
            pass.set_bind_group(0, Some(&bg), &[]);
            pass.dispatch_workgroups((n as u32).div_ceil(16), (m as u32).div_ceil(16), 1);
        }
        self.finish(encoder, recorder);

        Ok(GpuTensor::new(output, vec![m, n], Dtype::F32))
    }

    fn rope(
        &self,
        q: &GpuTensor,
        k: &GpuTensor,
        cos: &GpuTensor,
        sin: &GpuTensor,
        position_base: usize,
        recorder: Option<&mut dyn CommandRecorder>,
    ) -> Result<(GpuTensor, GpuTensor)> {
        let n = q.shape[0];
        let num_q_heads = q.shape[1];
        let num_kv_heads = k.shape[1];
        let head_dim = q.shape[2];

        let mut pipelines = self.pipelines.lock().unwrap();
        let entry = pipelines.get_or_create_default("rope", ROPE_WGSL);

        let mut encoder = self.device.create_command_encoder(&Default::default());
        let q_out = self.dispatch_rope_one(
            &mut encoder,
            &entry,
            &q.buffer,
            cos,
            sin,
            n,
            num_q_heads,
            head_dim,
            position_base,
        );
        let k_out = self.dispatch_rope_one(
            &mut encoder,
            &entry,
            &k.buffer,
            cos,
            sin,
            n,
            num_kv_heads,
            head_dim,
            position_base,
        );
        self.finish(encoder, recorder);

        Ok((
            GpuTensor::new(q_out, q.shape.clone(), Dtype::F32),
            GpuTensor::new(k_out, k.shape.clone(), Dtype::F32),
        ))
    }

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
    ) -> Result<GpuTensor> {
        let n = q.shape[0];
        let scale = 1.0 / (head_dim as f32).sqrt();

        let mut pipelines = self.pipelines.lock().unwrap();
        let attn_entry =
            pipelines.get_or_create("attention_scores", ATTENTION_WGSL, "compute_scores", None);
        let attn_v_entry = pipelines.get_or_create("attention_v", ATTENTION_WGSL, "attn_v", None);
        let softmax_entry = pipelines.get_or_create_default("softmax", SOFTMAX_WGSL);

        let scores = self.alloc((num_q_heads * n * seq_len * 4) as u64);
        let params_data = [
            (n as u32).to_le_bytes(),
            (seq_len as u32).to_le_bytes(),
            (num_q_heads as u32).to_le_bytes(),
            (num_kv_heads as u32).to_le_bytes(),
            (head_dim as u32).to_le_bytes(),
            scale.to_le_bytes(),
            ((mask == AttnMask::Causal) as u32).to_le_bytes(),
            0u32.to_le_bytes(),
        ]
        .concat();
        let params = create_uniform_raw(&self.device, &params_data);

        let mut encoder = self.device.create_command_encoder(&Default::default());

        {
            let bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("kernel_attn_scores"),
                layout: &attn_entry.bind_group_layout,
                entries: &[
                    buf_entry(0, &q.buffer),
                    buf_entry(1, &k_cache.buffer),
                    buf_entry(2, &scores),
                    buf_entry(3, &params),
                ],
            });
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(&attn_entry.pipeline);
            pass.set_bind_group(0, Some(&bg), &[]);
            pass.dispatch_workgroups(
                (n as u32).div_ceil(16),
                (seq_len as u32).div_ceil(16),
                num_q_heads as u32,
            );
        }

        let weights = self.alloc((num_q_heads * n * seq_len * 4) as u64);
        let softmax_params = create_uniform_raw(
            &self.device,
            &[
                ((num_q_heads * n) as u32).to_le_bytes(),
                (seq_len as u32).to_le_bytes(),
            ]
            .concat(),
        );
        {
            let bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("kernel_attn_softmax"),
                layout: &softmax_entry.bind_group_layout,
                entries: &[
                    buf_entry(0, &scores),
                    buf_entry(1, &weights),
                    buf_entry(2, &softmax_params),
                ],
            });
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(&softmax_entry.pipeline);
            pass.set_bind_group(0, Some(&bg), &[]);
            pass.dispatch_workgroups((num_q_heads * n) as u32, 1, 1);
        }

        let output = self.alloc((n * num_q_heads * head_dim * 4) as u64);
        {
            let bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("kernel_attn_v"),
                layout: &attn_v_entry.bind_group_layout,
                entries: &[
                    buf_entry(0, &weights),
                    buf_entry(1, &v_cache.buffer),
                    buf_entry(2, &output),
                    buf_entry(3, &params),
                ],
            });
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(&attn_v_entry.pipeline);
            pass.set_bind_group(0, Some(&bg), &[]);
            let total = (n * num_q_heads * head_dim) as u32;
            pass.dispatch_workgroups(total.div_ceil(256), 1, 1);
        }

        self.finish(encoder, recorder);

        Ok(GpuTensor::new(
            output,
            vec![n, num_q_heads, head_dim],
            Dtype::F32,
        ))
    }

    fn append_kv(
        &self,
        k_cache: &GpuTensor,
        v_cache: &GpuTensor,
        k: &GpuTensor,
        v: &GpuTensor,
        start: usize,
        recorder: Option<&mut dyn CommandRecorder>,
    ) -> Result<()> {
        let row_bytes = (k.shape[1] * k.shape[2] * 4) as u64;
        let offset = (start as u64) * row_bytes;
        let byte_len = (k.shape[0] as u64) * row_bytes;

        let mut encoder = self.device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(&k.buffer, 0, &k_cache.buffer, offset, byte_len);
        encoder.copy_buffer_to_buffer(&v.buffer, 0, &v_cache.buffer, offset, byte_len);
        self.finish(encoder, recorder);

        Ok(())
    }

    fn softcap(
        &self,
        x: &GpuTensor,
        c: f32,
        recorder: Option<&mut dyn CommandRecorder>,
    ) -> Result<GpuTensor> {
        let count = x.element_count();
        let mut pipelines = self.pipelines.lock().unwrap();
        let entry = pipelines.get_or_create_default("softcap", SOFTCAP_WGSL);

        let output = self.alloc((count * 4) as u64);
        let params = create_uniform_raw(
            &self.device,
            &[(count as u32).to_le_bytes(), c.to_le_bytes()].concat(),
        );

        let bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kernel_softcap"),
            layout: &entry.bind_group_layout,
            entries: &[
                buf_entry(0, &x.buffer),
                buf_entry(1, &output),
                buf_entry(2, &params),
            ],
        });

        let mut encoder = self.device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(&entry.pipeline);
            pass.set_bind_group(0, Some(&bg), &[]);
            pass.dispatch_workgroups((count as u32).div_ceil(256), 1, 1);
        }
        self.finish(encoder, recorder);

        Ok(GpuTensor::new(output, x.shape.clone(), Dtype::F32))
    }

    fn activation(
        &self,
        x: &GpuTensor,
        kind: u32,
        recorder: Option<&mut dyn CommandRecorder>,
    ) -> Result<GpuTensor> {
        let count = x.element_count();
        let mut pipelines = self.pipelines.lock().unwrap();
        let entry = pipelines.get_or_create_default("activation", ACTIVATION_WGSL);

        let output = self.alloc((count * 4) as u64);
        let params = create_uniform_raw(
            &self.device,
            &[(count as u32).to_le_bytes(), kind.to_le_bytes()].concat(),
        );

        let bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kernel_activation"),
            layout: &entry.bind_group_layout,
            entries: &[
                buf_entry(0, &x.buffer),
                buf_entry(1, &output),
                buf_entry(2, &params),
            ],
        });

        let mut encoder = self.device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(&entry.pipeline);
            pass.set_bind_group(0, Some(&bg), &[]);
            pass.dispatch_workgroups((count as u32).div_ceil(256), 1, 1);
        }
        self.finish(encoder, recorder);

        Ok(GpuTensor::new(output, x.shape.clone(), Dtype::F32))
    }

    fn elementwise(
        &self,
        a: &GpuTensor,
        b: &GpuTensor,
        op: u32,
        recorder: Option<&mut dyn CommandRecorder>,
    ) -> Result<GpuTensor> {
        let count = a.element_count();
        let mut pipelines = self.pipelines.lock().unwrap();
        let entry = pipelines.get_or_create_default("elementwise", ELEMENTWISE_WGSL);

        let output = self.alloc((count * 4) as u64);
        let params = create_uniform_raw(
            &self.device,
            &[(count as u32).to_le_bytes(), op.to_le_bytes()].concat(),
        );

        let bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kernel_elementwise"),
            layout: &entry.bind_group_layout,
            entries: &[
                buf_entry(0, &a.buffer),
                buf_entry(1, &b.buffer),
                buf_entry(2, &output),
                buf_entry(3, &params),
            ],
        });

        let mut encoder = self.device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(&entry.pipeline);
            pass.set_bind_group(0, Some(&bg), &[]);
            pass.dispatch_workgroups((count as u32).div_ceil(256), 1, 1);
        }
        self.finish(encoder, recorder);

        Ok(GpuTensor::new(output, a.shape.clone(), Dtype::F32))
    }

    fn embedding(
        &self,
        token_ids: &[u32],
        embed_table: &GpuTensor,
        hidden_size: usize,
        recorder: Option<&mut dyn CommandRecorder>,
    ) -> Result<GpuTensor> {
        let n = token_ids.len();
        let ids_buf = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("embedding_ids"),
            size: (n.max(1) * 4) as u64,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.queue
            .write_buffer(&ids_buf, 0, bytemuck::cast_slice(token_ids));

        let mut pipelines = self.pipelines.lock().unwrap();
        let entry = pipelines.get_or_create_default("embedding", EMBEDDING_WGSL);

        let output = self.alloc((n * hidden_size * 4) as u64);
        let params = create_uniform_raw(
            &self.device,
            &[
                (n as u32).to_le_bytes(),
                (hidden_size as u32).to_le_bytes(),
                1.0f32.to_le_bytes(),
            ]
            .concat(),
        );

        let bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kernel_embedding"),
            layout: &entry.bind_group_layout,
            entries: &[
                buf_entry(0, &ids_buf),
                buf_entry(1, &embed_table.buffer),
                buf_entry(2, &output),
                buf_entry(3, &params),
            ],
        });

        let mut encoder = self.device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(&entry.pipeline);
            pass.set_bind_group(0, Some(&bg), &[]);
            let total = (n * hidden_size) as u32;
            pass.dispatch_workgroups(total.div_ceil(256), 1, 1);
        }
        self.finish(encoder, recorder);

        Ok(GpuTensor::new(output, vec![n, hidden_size], Dtype::F32))
    }

    fn read_f32(&self, tensor: &GpuTensor) -> Result<Vec<f32>> {
        let byte_len = (tensor.element_count() * 4) as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("kernel_readback"),
            size: byte_len,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(&tensor.buffer, 0, &staging, 0, byte_len);
        self.queue.submit(std::iter::once(encoder.finish()));

        let (tx, rx) = std::sync::mpsc::channel();
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result);
            });
        let _ = self.device.poll(wgpu::PollType::Wait);
        rx.recv()
            .map_err(|_| LoomError::BufferMap)?
            .map_err(|_| LoomError::BufferMap)?;

        let data = staging.slice(..).get_mapped_range();
        let floats: Vec<f32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging.unmap();

        Ok(floats)
    }

    fn create_recorder(&self, _label: &str) -> Box<dyn CommandRecorder> {
        Box::new(WgpuRecorder {
            queue: Arc::clone(&self.queue),
            buffers: Vec::new(),
        })
    }

    fn max_buffer_binding_size(&self) -> u64 {
        self.device.limits().max_storage_buffer_binding_size as u64
    }
}

impl WgpuKernelRunner {
    #[allow(clippy::too_many_arguments)]
    fn dispatch_rope_one(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        entry: &crate::gpu::pipeline::PipelineEntry,
        input: &wgpu::Buffer,
        cos: &GpuTensor,
        sin: &GpuTensor,
        n: usize,
        num_heads: usize,
        head_dim: usize,
        position_base: usize,
    ) -> GpuBuf {
        let output = self.alloc((n * num_heads * head_dim * 4) as u64);
        let params_data = [
            (n as u32).to_le_bytes(),
            (num_heads as u32).to_le_bytes(),
            (head_dim as u32).to_le_bytes(),
            (position_base as u32).to_le_bytes(),
        ]
        .concat();
        let params = create_uniform_raw(&self.device, &params_data);

        let bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kernel_rope"),
            layout: &entry.bind_group_layout,
            entries: &[
                buf_entry(0, input),
                buf_entry(1, &output),
                buf_entry(2, &cos.buffer),
                buf_entry(3, &sin.buffer),
                buf_entry(4, &params),
            ],
        });

        let mut pass = encoder.begin_compute_pass(&Default::default());
        pass.set_pipeline(&entry.pipeline);
        pass.set_bind_group(0, Some(&bg), &[]);
        let total = (n * num_heads * (head_dim / 2)) as u32;
        pass.dispatch_workgroups(total.div_ceil(256), 1, 1);
        drop(pass);

        output
    }
}
