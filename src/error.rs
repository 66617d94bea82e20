//! Error types for the SHARD orchestrator.

/// Result type alias for SHARD operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating device work.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The filtered device set came up empty
    #[error("no device matches the requested selection")]
    NoDevice,

    /// Kernel source failed to compile or a kernel name was not found
    #[error("kernel compilation failed: {0}")]
    Compile(String),

    /// Host<->device transfer failure
    #[error("transfer error: {0}")]
    Transfer(String),

    /// Kernel dispatch failure
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// Caller violated an API contract (alignment, stage counts, policies)
    #[error("contract violation: {0}")]
    Contract(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Runtime backend error
    #[error("backend error: {0}")]
    Backend(String),

    /// A prior failure rendered the orchestrator inert
    #[error("orchestrator is inert after a prior failure - poll error_message()")]
    Inert,
}

impl Error {
    /// Create a compile error
    pub fn compile<S: Into<String>>(msg: S) -> Self {
        Error::Compile(msg.into())
    }

    /// Create a transfer error
    pub fn transfer<S: Into<String>>(msg: S) -> Self {
        Error::Transfer(msg.into())
    }

    /// Create a dispatch error
    pub fn dispatch<S: Into<String>>(msg: S) -> Self {
        Error::Dispatch(msg.into())
    }

    /// Create a contract-violation error
    pub fn contract<S: Into<String>>(msg: S) -> Self {
        Error::Contract(msg.into())
    }

    /// Create a config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// Create a backend error
    pub fn backend<S: Into<String>>(msg: S) -> Self {
        Error::Backend(msg.into())
    }
}
