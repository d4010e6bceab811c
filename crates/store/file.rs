use crate::{
    archive_channel, error::StoreError, handle::DataHandle, location::FieldLocation,
    ArchiveSlot, PendingArchive, Store,
};
use async_trait::async_trait;
use bytes::Bytes;
use sfdb_common::{Key, SfdbUri};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Extension shared by all data units so wipe can enumerate them.
pub const DATA_SUFFIX: &str = "data";

struct DataFile {
    path: PathBuf,
    /// Bytes already written and fsynced.
    committed: u64,
    /// Bytes enqueued but not yet flushed.
    reserved: u64,
}

struct PendingWrite {
    file_key: String,
    offset: u64,
    data: Bytes,
    slot: ArchiveSlot,
}

#[derive(Default)]
struct Inner {
    files: HashMap<String, DataFile>,
    pending: Vec<PendingWrite>,
    closed: bool,
}

/// Store keeping bulk bytes in per-index data files under the DB directory.
///
/// Writes are buffered per `archive` call and laid out at flush time; each
/// call's bytes occupy one contiguous span of exactly one data file.
pub struct FileStore {
    directory: PathBuf,
    inner: Mutex<Inner>,
}

impl FileStore {
    pub fn new(directory: impl AsRef<Path>) -> Result<Self, StoreError> {
        let directory = directory.as_ref().to_path_buf();
        std::fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Custom("file store lock poisoned".into()))
    }

    fn unit_path(&self, index_key: &Key) -> PathBuf {
        // A fresh unique name per (writer, index key): concurrent writers to
        // the same DB must never share a data file.
        let unique: u32 = rand::random();
        self.directory.join(format!(
            "{}.{unique:08x}.{DATA_SUFFIX}",
            index_key.values_to_string()
        ))
    }
}

#[async_trait]
impl Store for FileStore {
    fn uri(&self) -> SfdbUri {
        SfdbUri::file(&self.directory)
    }

    async fn archive(&self, index_key: &Key, data: Bytes) -> Result<PendingArchive, StoreError> {
        let (slot, pending) = archive_channel();
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(StoreError::Closed);
        }
        let file_key = index_key.values_to_string();
        if !inner.files.contains_key(&file_key) {
            let path = self.unit_path(index_key);
            inner.files.insert(
                file_key.clone(),
                DataFile {
                    path,
                    committed: 0,
                    reserved: 0,
                },
            );
        }
        let file = inner
            .files
            .get_mut(&file_key)
            .ok_or_else(|| StoreError::Custom("data file vanished under lock".into()))?;
        let offset = file.committed + file.reserved;
        file.reserved += data.len() as u64;
        inner.pending.push(PendingWrite {
            file_key,
            offset,
            data,
            slot,
        });
        Ok(pending)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if inner.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut inner.pending);
        debug!(
            units = inner.files.len(),
            fields = pending.len(),
            "flushing file store"
        );

        // Group writes per unit so each file is opened and synced once.
        let mut by_file: HashMap<String, Vec<(u64, Bytes, ArchiveSlot)>> = HashMap::new();
        for write in pending {
            by_file
                .entry(write.file_key)
                .or_default()
                .push((write.offset, write.data, write.slot));
        }

        for (file_key, mut writes) in by_file {
            writes.sort_by_key(|(offset, _, _)| *offset);
            let file = inner
                .files
                .get_mut(&file_key)
                .ok_or_else(|| StoreError::Custom("data file vanished under lock".into()))?;

            let result = append_writes(&file.path, &writes);
            match result {
                Ok(written) => {
                    file.committed += written;
                    file.reserved -= written;
                    let uri = SfdbUri::file(&file.path);
                    for (offset, data, slot) in writes {
                        slot.resolve(Ok(FieldLocation::file(
                            uri.clone(),
                            offset,
                            data.len() as u64,
                        )));
                    }
                }
                Err(err) => {
                    let msg = err.to_string();
                    for (_, _, slot) in writes {
                        slot.resolve(Err(StoreError::Custom(msg.clone())));
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn retrieve(&self, location: &FieldLocation) -> Result<DataHandle, StoreError> {
        match location.stable_location() {
            FieldLocation::File(span) => Ok(DataHandle::File {
                path: span.uri.as_path(),
                offset: span.offset,
                length: span.length,
            }),
            other => Err(StoreError::UnsupportedLocation(other.to_string())),
        }
    }

    fn uri_belongs(&self, uri: &SfdbUri) -> bool {
        uri.scheme() == "file" && uri.as_path().starts_with(&self.directory)
    }

    async fn store_unit_uris(&self) -> Result<Vec<SfdbUri>, StoreError> {
        let mut units = Vec::new();
        for entry in std::fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(DATA_SUFFIX) {
                units.push(SfdbUri::file(&path));
            }
        }
        units.sort();
        Ok(units)
    }

    async fn remove(&self, uri: &SfdbUri, doit: bool) -> Result<(), StoreError> {
        if !self.uri_belongs(uri) {
            return Err(StoreError::ForeignUri(uri.to_string()));
        }
        if !doit {
            debug!(%uri, "dry-run: would remove store unit");
            return Ok(());
        }
        match std::fs::remove_file(uri.as_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.flush().await?;
        let mut inner = self.lock()?;
        if inner.closed {
            warn!(directory = %self.directory.display(), "file store closed twice");
            return Ok(());
        }
        inner.closed = true;
        Ok(())
    }
}

fn append_writes(path: &Path, writes: &[(u64, Bytes, ArchiveSlot)]) -> Result<u64, StoreError> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let mut written = 0_u64;
    for (_, data, _) in writes {
        file.write_all(data)?;
        written += data.len() as u64;
    }
    file.sync_all()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(step: &str) -> Key {
        Key::from_pairs([("type", "fc"), ("levtype", "sfc"), ("step", step)])
    }

    #[tokio::test]
    async fn archive_resolves_after_flush_and_bytes_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path()).expect("store");

        let index_key = Key::from_pairs([("type", "fc")]);
        let pending_a = store
            .archive(&index_key, Bytes::from_static(b"\xde\xad\xbe\xef"))
            .await
            .expect("archive");
        let pending_b = store
            .archive(&index_key, Bytes::from_static(b"step-six"))
            .await
            .expect("archive");
        store.flush().await.expect("flush");

        let loc_a = pending_a.wait().await.expect("location a");
        let loc_b = pending_b.wait().await.expect("location b");
        assert_eq!(loc_a.length(), 4);
        assert_eq!(loc_b.offset(), 4);

        let bytes = store
            .retrieve(&loc_a)
            .await
            .expect("retrieve")
            .read_all()
            .await
            .expect("read");
        assert_eq!(bytes.as_ref(), b"\xde\xad\xbe\xef");
    }

    #[tokio::test]
    async fn fields_for_one_index_share_a_unit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path()).expect("store");

        let p1 = store.archive(&key("0"), Bytes::from_static(b"one")).await.expect("archive");
        let p2 = store.archive(&key("0"), Bytes::from_static(b"two")).await.expect("archive");
        store.flush().await.expect("flush");

        let l1 = p1.wait().await.expect("l1");
        let l2 = p2.wait().await.expect("l2");
        assert_eq!(l1.uri(), l2.uri());
        assert_eq!(store.store_unit_uris().await.expect("units").len(), 1);
    }

    #[tokio::test]
    async fn flush_without_archives_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path()).expect("store");
        store.flush().await.expect("flush");
        store.flush().await.expect("second flush");
        assert!(store.store_unit_uris().await.expect("units").is_empty());
    }

    #[tokio::test]
    async fn remove_honours_dry_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path()).expect("store");
        let pending = store
            .archive(&key("0"), Bytes::from_static(b"gone"))
            .await
            .expect("archive");
        store.flush().await.expect("flush");
        let location = pending.wait().await.expect("location");
        let unit = location.uri().expect("uri").clone();

        store.remove(&unit, false).await.expect("dry run");
        assert_eq!(store.store_unit_uris().await.expect("units").len(), 1);

        store.remove(&unit, true).await.expect("remove");
        assert!(store.store_unit_uris().await.expect("units").is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path()).expect("store");
        store.close().await.expect("close");
        store.close().await.expect("second close");
        assert!(store
            .archive(&key("0"), Bytes::from_static(b"late"))
            .await
            .is_err());
    }
}
