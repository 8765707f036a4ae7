use thiserror::Error;

#[derive(Debug, Error)]
pub enum SilverError {
    #[error("coordination store connection error: {0}")]
    Connection(String),

    #[error("engine error: {0}")]
    Engine(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("bucket {0} cannot be written inside a read-only transaction")]
    ReadOnlyTransaction(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<etcd_client::Error> for SilverError {
    fn from(error: etcd_client::Error) -> Self {
        SilverError::Connection(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SilverError>;
