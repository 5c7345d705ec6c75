use thiserror::Error;

use crate::conversation::Conversation;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("write rejected: {0}")]
    Rejected(String),

    #[error("{0} is not supported by this store")]
    Unsupported(&'static str),

    #[error("malformed record: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Malformed(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// A view already hosts an open session; close it first.
    #[error("a session for {open} is already open in this view")]
    AlreadyOpen { open: Conversation },

    #[error("session is closed")]
    Closed,

    #[error("message is empty")]
    EmptyMessage,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {field}: {value}")]
    Invalid { field: &'static str, value: String },
}
