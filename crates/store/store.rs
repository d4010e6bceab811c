pub mod error;
pub mod file;
pub mod handle;
pub mod location;
pub mod memory;

pub use error::StoreError;
pub use file::FileStore;
pub use handle::DataHandle;
pub use location::{FieldLocation, FieldSpan};
pub use memory::MemStore;

use async_trait::async_trait;
use bytes::Bytes;
use sfdb_common::{Key, SfdbUri};
use tokio::sync::oneshot;

/// Resolution slot for one archived field, completed by `flush`.
pub struct ArchiveSlot {
    tx: oneshot::Sender<Result<FieldLocation, StoreError>>,
}

impl ArchiveSlot {
    pub fn resolve(self, result: Result<FieldLocation, StoreError>) {
        // The caller may have dropped its half; that is not our problem.
        let _ = self.tx.send(result);
    }
}

/// Future side of an `archive` call. The location it yields is only durable
/// once the issuing store's `flush` has returned.
pub struct PendingArchive {
    rx: oneshot::Receiver<Result<FieldLocation, StoreError>>,
}

impl PendingArchive {
    pub async fn wait(self) -> Result<FieldLocation, StoreError> {
        self.rx
            .await
            .map_err(|_| StoreError::Custom("store dropped archive before flushing it".into()))?
    }
}

pub fn archive_channel() -> (ArchiveSlot, PendingArchive) {
    let (tx, rx) = oneshot::channel();
    (ArchiveSlot { tx }, PendingArchive { rx })
}

/// The bulk-bytes side of one database.
///
/// `archive` may batch and reorder between calls, but the bytes of a single
/// call are never split across logical units. `flush` is a barrier: every
/// archive issued before it is durable and resolved when it returns, and
/// nothing archived before a completed `flush` may be seen as unflushed by
/// `retrieve`.
#[async_trait]
pub trait Store: Send + Sync {
    /// The store's own root URI.
    fn uri(&self) -> SfdbUri;

    /// Enqueues one field for the given index grouping. Safe to call
    /// concurrently on the same store.
    async fn archive(&self, index_key: &Key, data: Bytes) -> Result<PendingArchive, StoreError>;

    /// Durability barrier; resolves all outstanding [`PendingArchive`]s.
    async fn flush(&self) -> Result<(), StoreError>;

    /// Opens exactly `[offset, offset + length)` of the located field.
    async fn retrieve(&self, location: &FieldLocation) -> Result<DataHandle, StoreError>;

    /// True iff the URI lies inside this store's namespace.
    fn uri_belongs(&self, uri: &SfdbUri) -> bool;

    /// Physical storage units (files, objects) owned by this store.
    async fn store_unit_uris(&self) -> Result<Vec<SfdbUri>, StoreError>;

    /// Best-effort deletion; a dry run (`doit == false`) only reports.
    async fn remove(&self, uri: &SfdbUri, doit: bool) -> Result<(), StoreError>;

    /// Flushes and shuts the store. Idempotent; a second close only warns.
    async fn close(&self) -> Result<(), StoreError>;
}
