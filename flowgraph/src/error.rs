use flowgraph_core::BufferError;

pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("expected exactly one port on each side of `connect`, found {src} output(s) and {dst} input(s)")]
    InvalidPortCount { src: usize, dst: usize },

    #[error("port `{0}` not found")]
    PortNotFound(String),

    #[error("underlying port not found while flattening an alias chain from `{0}`")]
    UnderlyingPortNotFound(String),

    #[error("input port `{0}` is already connected")]
    PortAlreadyConnected(String),

    #[error("input port `{0}` has no upstream connection")]
    InputPortUnconnected(String),

    #[error("graph contains a cycle (blocked on `{0}`)")]
    CyclicDependency(String),

    #[error("data type mismatch on connection into `{input}`: expected {expected:?}, found {found:?}")]
    DataTypeMismatch { input: String, expected: flowgraph_core::DataType, found: flowgraph_core::DataType },

    #[error("rate mismatch on block `{block}`: input 0 implies {expected} Hz, input {index} implies {found} Hz")]
    RateMismatch { block: String, index: usize, expected: f64, found: f64 },

    #[error("graph is not running")]
    NotRunning,

    #[error("graph is already running")]
    AlreadyRunning,

    #[error("block `{0}` is not part of the current run state")]
    BlockNotFound(String),

    #[error("no method named `{0}`")]
    UnknownMethod(String),

    #[error("block `{0}` panicked during `process`")]
    BlockPanicked(String),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("block `{block}` returned an error from `{method}`")]
    Block {
        block: String,
        method: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}
