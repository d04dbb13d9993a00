pub mod buffer_pool;
pub mod device;
pub mod kernel;
pub mod pipeline;
pub mod wgpu_backend;

pub use buffer_pool::BufferPool;
pub use device::init_gpu;
pub use kernel::{KernelRunner, SharedKernelRunner};
pub use pipeline::PipelineManager;
pub use wgpu_backend::WgpuKernelRunner;
