use std::path::PathBuf;

use thiserror::Error;

/// Common error type for promqtt components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read config file '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias using promqtt's Error.
pub type Result<T> = std::result::Result<T, Error>;
