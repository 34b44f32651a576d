use thiserror::Error;

#[derive(Debug, Error)]
pub enum RefineryError {
    // Generation oracle errors
    #[error("Oracle request failed: {0}")]
    OracleRequest(String),

    #[error("Oracle response parse error: {0}")]
    OracleParse(String),

    #[error("Oracle provider not supported: {0}")]
    UnsupportedProvider(String),

    #[error("Response does not match schema '{schema}': {message}")]
    SchemaValidation { schema: String, message: String },

    // Sandbox errors
    #[error("Sandbox execution failed: {0}")]
    SandboxExecution(String),

    #[error("Sandbox timeout after {timeout_secs}s")]
    SandboxTimeout { timeout_secs: u64 },

    // Search errors
    #[error("Search failed: {0}")]
    Search(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("Missing credential for provider '{0}'")]
    MissingCredential(String),

    // Graph errors
    #[error("Graph definition error: {0}")]
    Graph(String),

    #[error("Graph exceeded step limit ({0}) without reaching END")]
    StepLimitExceeded(usize),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RefineryError {
    /// Whether a retry of the same request may succeed.
    ///
    /// Schema and sandbox failures are not transient at the transport level;
    /// the artifact loop retries them by generating a fresh candidate instead.
    pub fn is_transient(&self) -> bool {
        match self {
            RefineryError::OracleRequest(msg) => {
                msg.contains("429")
                    || msg.contains("500")
                    || msg.contains("502")
                    || msg.contains("503")
                    || msg.contains("timeout")
                    || msg.contains("connection")
            }
            RefineryError::SandboxTimeout { .. } => true,
            _ => false,
        }
    }

    /// Whether this error must abort a run before any node executes.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RefineryError::Config(_)
                | RefineryError::ConfigNotFound(_)
                | RefineryError::MissingCredential(_)
                | RefineryError::UnsupportedProvider(_)
                | RefineryError::Graph(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RefineryError>;
