//! Harness error type.

use pthreads_emu_core::Error;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{op} failed: {source}")]
    Primitive {
        op: &'static str,
        #[source]
        source: Error,
    },
    #[error("unknown scenario '{0}'")]
    UnknownScenario(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("{scenario}: invariant violated: {message}")]
    Invariant {
        scenario: &'static str,
        message: String,
    },
}

impl HarnessError {
    /// Error number behind a failed primitive call, if any.
    #[must_use]
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Primitive { source, .. } => Some(source.errno()),
            _ => None,
        }
    }
}

/// Attaches the operation name to a core result.
pub(crate) trait Context<T> {
    fn op(self, op: &'static str) -> Result<T, HarnessError>;
}

impl<T> Context<T> for pthreads_emu_core::Result<T> {
    fn op(self, op: &'static str) -> Result<T, HarnessError> {
        self.map_err(|source| HarnessError::Primitive { op, source })
    }
}
