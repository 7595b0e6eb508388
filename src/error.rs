use thiserror::Error;

/// Error kinds the pipeline can surface. Most of these never unwind past a
/// worker loop — they are logged and counted (see [`crate::stats::Stats`])
/// instead. Only [`NidsError::Config`] and [`NidsError::Capture`] at startup
/// propagate to the process exit code.
#[derive(Debug, Error)]
pub enum NidsError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("capture error: {0}")]
    Capture(String),

    #[error("sink error: {0}")]
    Sink(String),

    #[error("rule evaluation error in rule {rule}: {reason}")]
    Evaluation { rule: String, reason: String },

    #[error("ingress queue full, packet dropped")]
    DropOverflow,
}

pub type Result<T> = std::result::Result<T, NidsError>;

impl From<std::io::Error> for NidsError {
    fn from(err: std::io::Error) -> Self {
        NidsError::Capture(err.to_string())
    }
}

impl From<serde_yaml::Error> for NidsError {
    fn from(err: serde_yaml::Error) -> Self {
        NidsError::Config(err.to_string())
    }
}
