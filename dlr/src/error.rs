use std::path::PathBuf;

use thiserror::Error;

use crate::registry::ModelHandle;

/// Errors returned by DLR bridge operations.
#[derive(Debug, Error)]
pub enum DlrError {
    #[error("dlr: can't load runtime library {path:?}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("dlr: can't resolve symbol {symbol} in {path:?}: {reason}")]
    MissingSymbol {
        path: PathBuf,
        symbol: &'static str,
        reason: String,
    },

    #[error("dlr: {op} failed with status {code}: {message}")]
    Native {
        op: &'static str,
        code: i32,
        message: String,
    },

    #[error("dlr: invalid model handle {0}")]
    InvalidHandle(ModelHandle),

    #[error("dlr: invalid argument: {0}")]
    InvalidArgument(String),

    #[error("dlr: invalid output {index}: {reason}")]
    InvalidOutput { index: i32, reason: String },

    #[error("dlr: config: {0}")]
    Config(String),

    #[error("dlr: io: {0}")]
    Io(#[from] std::io::Error),
}

impl DlrError {
    /// Returns the runtime's last-error text for native failures.
    pub fn native_message(&self) -> Option<&str> {
        match self {
            DlrError::Native { message, .. } => Some(message),
            _ => None,
        }
    }
}
