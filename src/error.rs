use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Shape mismatch in {op}: {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },

    #[error("Buffer `{name}` is not bound in kernel `{kernel}`")]
    BindingResolution { kernel: String, name: String },

    #[error("Tensor `{name}` expects {expected} elements but got {actual}")]
    InputSizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Device error: {0}")]
    Device(String),

    #[error("Unknown tensor id {0}")]
    UnknownTensor(usize),

    #[error("A tensor named `{0}` already exists")]
    DuplicateName(String),

    #[error("Invalid tensor name `{0}`: use ASCII letters, digits and underscores")]
    InvalidName(String),

    #[error("Dropout rate must be in [0, 1), got {0}")]
    InvalidDropoutRate(f32),

    #[error("Graph has not been compiled")]
    NotCompiled,

    #[error("Kernel partition contains a cycle through context {0}")]
    CyclicKernels(usize),

    #[error("Interpreter error: {0}")]
    Interpreter(String),
}

pub type Result<T> = std::result::Result<T, GraphError>;
