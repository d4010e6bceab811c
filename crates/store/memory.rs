use crate::{
    archive_channel, error::StoreError, handle::DataHandle, location::FieldLocation,
    ArchiveSlot, FieldSpan, PendingArchive, Store,
};
use async_trait::async_trait;
use bytes::Bytes;
use sfdb_common::{Key, SfdbUri};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

const SCHEME: &str = "mem";

struct PendingWrite {
    unit: String,
    offset: u64,
    data: Bytes,
    slot: ArchiveSlot,
}

#[derive(Default)]
struct Inner {
    units: HashMap<String, Vec<u8>>,
    pending: Vec<PendingWrite>,
    closed: bool,
}

/// Process-local store used by tests and ephemeral databases. Mirrors the
/// file store's layout (one unit per index key) so wipe behaves the same.
pub struct MemStore {
    name: String,
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Custom("memory store lock poisoned".into()))
    }

    fn unit_uri(&self, unit: &str) -> SfdbUri {
        SfdbUri::new(SCHEME, format!("{}/{unit}", self.name))
    }

    fn unit_of(&self, uri: &SfdbUri) -> Option<String> {
        let prefix = format!("{}/", self.name);
        uri.path().strip_prefix(&prefix).map(str::to_string)
    }
}

#[async_trait]
impl Store for MemStore {
    fn uri(&self) -> SfdbUri {
        SfdbUri::new(SCHEME, self.name.clone())
    }

    async fn archive(&self, index_key: &Key, data: Bytes) -> Result<PendingArchive, StoreError> {
        let (slot, pending) = archive_channel();
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(StoreError::Closed);
        }
        let unit = format!("{}.data", index_key.values_to_string());
        let pending_len: u64 = inner
            .pending
            .iter()
            .filter(|w| w.unit == unit)
            .map(|w| w.data.len() as u64)
            .sum();
        let offset = inner.units.get(&unit).map(|u| u.len() as u64).unwrap_or(0) + pending_len;
        inner.pending.push(PendingWrite {
            unit,
            offset,
            data,
            slot,
        });
        Ok(pending)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let pending = std::mem::take(&mut inner.pending);
        for write in pending {
            let uri = self.unit_uri(&write.unit);
            let unit = inner.units.entry(write.unit).or_default();
            unit.extend_from_slice(&write.data);
            write.slot.resolve(Ok(FieldLocation::File(FieldSpan::new(
                uri,
                write.offset,
                write.data.len() as u64,
            ))));
        }
        Ok(())
    }

    async fn retrieve(&self, location: &FieldLocation) -> Result<DataHandle, StoreError> {
        let span = match location.stable_location() {
            FieldLocation::File(span) => span,
            other => return Err(StoreError::UnsupportedLocation(other.to_string())),
        };
        let unit = self
            .unit_of(&span.uri)
            .ok_or_else(|| StoreError::ForeignUri(span.uri.to_string()))?;
        let inner = self.lock()?;
        let bytes = inner
            .units
            .get(&unit)
            .ok_or_else(|| StoreError::NotFound(span.uri.to_string()))?;
        let start = span.offset as usize;
        let end = start + span.length as usize;
        if end > bytes.len() {
            return Err(StoreError::Truncated {
                uri: span.uri.to_string(),
                expected: span.length,
                got: bytes.len().saturating_sub(start) as u64,
            });
        }
        Ok(DataHandle::Buffer(Bytes::copy_from_slice(
            &bytes[start..end],
        )))
    }

    fn uri_belongs(&self, uri: &SfdbUri) -> bool {
        uri.scheme() == SCHEME && self.unit_of(uri).is_some()
    }

    async fn store_unit_uris(&self) -> Result<Vec<SfdbUri>, StoreError> {
        let inner = self.lock()?;
        let mut units: Vec<SfdbUri> = inner.units.keys().map(|u| self.unit_uri(u)).collect();
        units.sort();
        Ok(units)
    }

    async fn remove(&self, uri: &SfdbUri, doit: bool) -> Result<(), StoreError> {
        let unit = self
            .unit_of(uri)
            .ok_or_else(|| StoreError::ForeignUri(uri.to_string()))?;
        if !doit {
            debug!(%uri, "dry-run: would remove store unit");
            return Ok(());
        }
        self.lock()?.units.remove(&unit);
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.flush().await?;
        let mut inner = self.lock()?;
        if inner.closed {
            warn!(name = %self.name, "memory store closed twice");
            return Ok(());
        }
        inner.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flush_is_the_durability_barrier() {
        let store = MemStore::new("testdb");
        let key = Key::from_pairs([("type", "fc")]);
        let pending = store
            .archive(&key, Bytes::from_static(b"\xde\xad\xbe\xef"))
            .await
            .expect("archive");

        store.flush().await.expect("flush");
        let location = pending.wait().await.expect("location");

        let bytes = store
            .retrieve(&location)
            .await
            .expect("retrieve")
            .read_all()
            .await
            .expect("read");
        assert_eq!(bytes.as_ref(), b"\xde\xad\xbe\xef");
    }

    #[tokio::test]
    async fn retrieve_out_of_range_is_truncated() {
        let store = MemStore::new("testdb");
        let key = Key::from_pairs([("type", "fc")]);
        let pending = store
            .archive(&key, Bytes::from_static(b"abc"))
            .await
            .expect("archive");
        store.flush().await.expect("flush");
        let location = pending.wait().await.expect("location");

        let uri = location.uri().expect("uri").clone();
        let bogus = FieldLocation::file(uri, 1, 10);
        assert!(matches!(
            store.retrieve(&bogus).await,
            Err(StoreError::Truncated { .. })
        ));
    }
}
