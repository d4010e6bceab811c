use sfdb_codec::CodecError;
use sfdb_common::FdbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("truncated read from {uri}: expected {expected} bytes, got {got}")]
    Truncated {
        uri: String,
        expected: u64,
        got: u64,
    },
    #[error("unreachable: {msg} [endpoint={endpoint}]")]
    Unreachable { endpoint: String, msg: String },
    #[error("URI {0} does not belong to this store")]
    ForeignUri(String),
    #[error("store is closed")]
    Closed,
    #[error("field location is not retrievable by this store: {0}")]
    UnsupportedLocation(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Custom(String),
}

impl From<StoreError> for FdbError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => FdbError::NotFound(what),
            StoreError::Truncated { .. } => FdbError::Corruption(err.to_string()),
            StoreError::Unreachable { endpoint, msg } => FdbError::Transport { endpoint, msg },
            StoreError::Codec(e) => FdbError::Codec(e),
            StoreError::Io(e) => FdbError::Io(e),
            other => FdbError::Corruption(other.to_string()),
        }
    }
}
