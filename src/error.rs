//! Crate-wide error taxonomy.
//!
//! Call sites that only propagate use `anyhow::Result` with `?`; call sites
//! that branch on the specific failure kind match on [`Error`] directly
//! (the not-logged-in retry, destination fan-out aggregation, queue-full
//! logging).

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("bw exited with code {exit_code}: {stderr_tail}")]
    CliExit { exit_code: i32, stderr_tail: String },

    #[error("vault is not logged in")]
    NotLoggedIn,

    #[error("invalid ciphertext")]
    InvalidCiphertext,

    #[error("encryption key not set")]
    EncryptionKeyNotSet,

    #[error("destination {destination} failed: {source}")]
    Provider {
        destination: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("entity store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn provider(destination: impl Into<String>, source: anyhow::Error) -> Self {
        Error::Provider {
            destination: destination.into(),
            source,
        }
    }
}
