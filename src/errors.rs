use thiserror::Error;

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection exhausted after {attempts} attempts: {last_error}")]
    ConnectionExhausted { attempts: u32, last_error: String },

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("File access error: {0}")]
    FileAccessError(String),

    #[error("[{code}] {stderr}")]
    SubprocessError { code: i32, stderr: String },

    #[error("Upload error: {0}")]
    UploadError(String),

    #[error("Gateway error: {0}")]
    GatewayError(String),

    #[error("Duplicate command: {0}")]
    DuplicateCommand(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::IoError(err.to_string())
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        AgentError::GatewayError(err.to_string())
    }
}
