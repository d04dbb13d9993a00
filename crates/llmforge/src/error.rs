use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoomError {
    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("Failed to request GPU adapter")]
    NoAdapter,

    #[error("Failed to request GPU device: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    #[error("Buffer mapping failed")]
    BufferMap,

    #[error("Out of memory: requested {requested} bytes, no pooled buffer satisfied it")]
    OutOfMemory { requested: u64 },

    #[error("Invalid manifest: {field}: {reason}")]
    InvalidManifest { field: String, reason: String },

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Missing weight tensor: \"{0}\"")]
    MissingWeight(String),

    #[error("Ambiguous attention parameters: {0}")]
    AmbiguousAttentionParams(String),

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Sequence overflow: seqLen {seq_len} + {added} > Smax {max_seq_len}")]
    SequenceOverflow {
        seq_len: usize,
        added: usize,
        max_seq_len: usize,
    },

    #[error("Kernel failure ({kind}): {cause}")]
    KernelFailure { kind: String, cause: String },

    #[error("Generation already in progress")]
    GenerationInProgress,

    #[error("Adapter not found: {0}")]
    AdapterNotFound(String),

    #[error("Adapter already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("Base model mismatch: expected {expected}, adapter targets {actual}")]
    BaseModelMismatch { expected: String, actual: String },

    #[error("Invalid adapter weight {weight}: expected [{min}, {max}]")]
    InvalidWeight { weight: f32, min: f32, max: f32 },

    #[error("Intent drift detected: expected/actual top-k symmetric difference exceeded threshold")]
    IntentDrift,

    #[error("Generation cancelled")]
    Cancelled,

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Integrity check failed: {0}")]
    IntegrityFailure(String),

    #[error("Unsupported tensor element type: {0}")]
    UnsupportedGgmlType(u32),

    #[error("GGUF parse error: {0}")]
    GgufParse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Model not loaded")]
    NotLoaded,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, LoomError>;

/// Structured status codes mirroring the external status-code contract.
/// A CLI wrapper maps `LoomError` onto this set for process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoomExitCode {
    Ok,
    InvalidManifest,
    ModelNotFound,
    IntegrityFailure,
    SequenceOverflow,
    OutOfMemory,
    KernelFailure,
    GenerationInProgress,
    AdapterNotFound,
    BaseModelMismatch,
    IntentDrift,
    Cancelled,
    Other,
}

impl From<&LoomError> for LoomExitCode {
    fn from(err: &LoomError) -> Self {
        match err {
            LoomError::InvalidManifest { .. } => LoomExitCode::InvalidManifest,
            LoomError::ModelNotFound(_) => LoomExitCode::ModelNotFound,
            LoomError::IntegrityFailure(_) => LoomExitCode::IntegrityFailure,
            LoomError::SequenceOverflow { .. } => LoomExitCode::SequenceOverflow,
            LoomError::OutOfMemory { .. } => LoomExitCode::OutOfMemory,
            LoomError::KernelFailure { .. } => LoomExitCode::KernelFailure,
            LoomError::GenerationInProgress => LoomExitCode::GenerationInProgress,
            LoomError::AdapterNotFound(_) => LoomExitCode::AdapterNotFound,
            LoomError::BaseModelMismatch { .. } => LoomExitCode::BaseModelMismatch,
            LoomError::IntentDrift => LoomExitCode::IntentDrift,
            LoomError::Cancelled => LoomExitCode::Cancelled,
            _ => LoomExitCode::Other,
        }
    }
}
