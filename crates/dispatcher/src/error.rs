//! Dispatcher error types

use std::path::PathBuf;

use contracts::ContractError;
use thiserror::Error;

use crate::sinks::network::TransportError;

/// Dispatcher-specific errors
#[derive(Debug, Error)]
pub enum DispatcherError {
    /// Sink creation error
    #[error("failed to create sink '{name}': {message}")]
    SinkCreation { name: String, message: String },

    /// Sink write error (from contract)
    #[error("sink error: {0}")]
    Contract(#[from] ContractError),

    /// Sink error
    #[error(transparent)]
    Sink(#[from] SinkError),
}

impl DispatcherError {
    /// Create a sink creation error
    pub fn sink_creation(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SinkCreation {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Failure of one sink operation
#[derive(Debug, Error)]
pub enum SinkError {
    /// Directory creation, open, write or flush failed
    #[error("storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Every trust mode in the plan failed; later attempts are kept as suppressed
    #[error("connect failed: {first}{}", suppressed_suffix(suppressed))]
    Connect {
        #[source]
        first: TransportError,
        suppressed: Vec<TransportError>,
    },

    /// Transport operation on an established link failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Settings cannot be used as given
    #[error("invalid sink settings: {0}")]
    Config(String),

    /// Payload could not be encoded
    #[error(transparent)]
    Encode(#[from] ContractError),
}

impl SinkError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// Map into the workspace error, tagging it with the sink name
    pub fn into_contract(self, sink_name: &str) -> ContractError {
        match self {
            Self::Storage { .. } | Self::Config(_) => {
                ContractError::sink_write(sink_name, self.to_string())
            }
            Self::Connect { .. } | Self::Transport(_) => {
                ContractError::sink_connection(sink_name, self.to_string())
            }
            Self::Encode(inner) => inner,
        }
    }
}

fn suppressed_suffix(suppressed: &[TransportError]) -> String {
    if suppressed.is_empty() {
        return String::new();
    }
    let rest: Vec<String> = suppressed.iter().map(ToString::to_string).collect();
    format!(" (suppressed: {})", rest.join("; "))
}
