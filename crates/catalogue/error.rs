use sfdb_codec::CodecError;
use sfdb_common::{schema::SchemaError, FdbError};
use sfdb_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogueError {
    #[error("database not found: {0}")]
    DbNotFound(String),
    #[error("no index selected for archive")]
    NoIndexSelected,
    #[error("flush expected {expected} archived fields, observed {observed}")]
    FlushCountMismatch { expected: usize, observed: usize },
    #[error("table of contents is locked by another writer: {0}")]
    TocLocked(String),
    #[error("corrupt table of contents: {0}")]
    TocCorrupt(String),
    #[error("unsupported serialisation version {found}, latest supported is {latest}")]
    UnsupportedVersion { found: u16, latest: u16 },
    #[error("sub-toc cycle detected at {0}")]
    SubTocCycle(String),
    #[error("keys insufficiently matching for mount: {host} vs {other}")]
    MountMismatch { host: String, other: String },
    #[error("wipe request leaves residual content: {0}")]
    WipeResidual(String),
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<CatalogueError> for FdbError {
    fn from(err: CatalogueError) -> Self {
        match err {
            CatalogueError::DbNotFound(what) => FdbError::NotFound(what),
            CatalogueError::NoIndexSelected | CatalogueError::Usage(_) => {
                FdbError::Usage(err.to_string())
            }
            CatalogueError::FlushCountMismatch { .. } => FdbError::Consistency(err.to_string()),
            CatalogueError::TocLocked(_) => FdbError::Capacity(err.to_string()),
            CatalogueError::TocCorrupt(_)
            | CatalogueError::UnsupportedVersion { .. }
            | CatalogueError::SubTocCycle(_) => FdbError::Corruption(err.to_string()),
            CatalogueError::MountMismatch { .. } => FdbError::Usage(err.to_string()),
            CatalogueError::WipeResidual(_) => FdbError::Usage(err.to_string()),
            CatalogueError::Schema(e) => FdbError::Usage(e.to_string()),
            CatalogueError::Store(e) => e.into(),
            CatalogueError::Codec(e) => FdbError::Codec(e),
            CatalogueError::Io(e) => FdbError::Io(e),
        }
    }
}
