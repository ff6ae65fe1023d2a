//! Failures while assembling an [`AppConfig`](super::AppConfig).

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A config file was named explicitly but is not there.
    #[error("config file {} does not exist", .0.display())]
    FileNotFound(PathBuf),

    /// Merging the layers or deserializing the result failed.
    #[error("cannot load configuration from {origin}: {message}")]
    Load { origin: String, message: String },

    /// A setting parsed but breaks a cross-field rule.
    #[error("invalid setting {key}: {message}")]
    Invalid { key: String, message: String },

    #[error("cannot encode built-in defaults: {0}")]
    Defaults(#[from] serde_json::Error),
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Dotted key of the offending setting, for [`ConfigError::Invalid`].
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Invalid { key, .. } => Some(key),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
