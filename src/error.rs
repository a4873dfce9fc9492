//! Error kinds surfaced by nimp.
//!
//! Library code returns `anyhow::Result` and attaches context at each
//! boundary. The kinds below are raised where a caller (retry policy, exit
//! code mapping) needs to tell failures apart with `downcast_ref`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NimpError {
    /// Missing key, unknown variant, invalid platform, incompatible flags.
    #[error("configuration error: {0}")]
    Config(String),

    /// Busy directory or locked file; retried by [`crate::retry`].
    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("{program} failed with exit code {code}")]
    Tool { program: String, code: i32 },

    #[error("network error: {0}")]
    Network(String),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{program} timed out after {after:?}")]
    Timeout { program: String, after: std::time::Duration },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("archive error: {0}")]
    ZipError(#[from] zip::result::ZipError),

    #[error("pattern error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl NimpError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn tool(program: impl Into<String>, code: i32) -> Self {
        Self::Tool {
            program: program.into(),
            code,
        }
    }

    /// Whether this failure is worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Filesystem(_) | Self::Network(_) | Self::IoError(_))
    }
}

/// Exit code carried by a tool failure anywhere in an error chain.
pub fn tool_exit_code(error: &anyhow::Error) -> Option<i32> {
    error.chain().find_map(|cause| match cause.downcast_ref::<NimpError>() {
        Some(NimpError::Tool { code, .. }) => Some(*code),
        _ => None,
    })
}
