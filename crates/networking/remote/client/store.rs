use crate::client::connection::ClientConnection;
use crate::client::limiter::ReadLimiter;
use crate::error::RemoteError;
use crate::messages::{
    decode_payload, encode_payload, ArchiveBlob, FlushLocations, FlushRequest, Frame, MessageKind,
    ReadRequest, RegisterClient,
};
use async_trait::async_trait;
use bytes::Bytes;
use sfdb_common::{Key, SfdbUri};
use sfdb_store::{
    archive_channel, ArchiveSlot, DataHandle, FieldLocation, PendingArchive, Store, StoreError,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::mpsc;
use tracing::warn;

fn wire_error(err: RemoteError) -> StoreError {
    StoreError::Unreachable {
        endpoint: "<remote>".into(),
        msg: err.to_string(),
    }
}

/// Client-side proxy implementing the [`Store`] contract over the wire.
///
/// Archives stream as framed messages on the data connection under a
/// per-proxy request id; `flush` is a control RPC whose acknowledgement
/// carries the field locations, resolving every outstanding archive
/// future. Retrieval admits itself through the read limiter and consumes
/// an ordered Blob stream.
pub struct RemoteStore {
    connection: Arc<ClientConnection>,
    limiter: Arc<ReadLimiter>,
    db_key: Key,
    client_id: u32,
    archive_stream: OnceLock<u32>,
    sequence: AtomicU64,
    pending: Mutex<Vec<(u64, ArchiveSlot)>>,
}

impl RemoteStore {
    /// Registers a store client for `db_key` on the shared connection.
    pub async fn open(
        connection: Arc<ClientConnection>,
        limiter: Arc<ReadLimiter>,
        db_key: Key,
    ) -> Result<Self, RemoteError> {
        let client_id = connection.next_id();
        connection
            .rpc(
                MessageKind::Store,
                client_id,
                encode_payload(&RegisterClient {
                    db_key: db_key.clone(),
                }),
            )
            .await?;
        Ok(Self {
            connection,
            limiter,
            db_key,
            client_id,
            archive_stream: OnceLock::new(),
            sequence: AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn db_key(&self) -> &Key {
        &self.db_key
    }

    fn archive_stream_id(&self) -> u32 {
        // First archive on this proxy opens the stream; the id then tags
        // every archive frame it ever sends.
        *self.archive_stream.get_or_init(|| self.connection.next_id())
    }

    fn push_pending(&self, sequence: u64, slot: ArchiveSlot) -> Result<(), StoreError> {
        self.pending
            .lock()
            .map_err(|_| StoreError::Custom("remote store state poisoned".into()))?
            .push((sequence, slot));
        Ok(())
    }
}

#[async_trait]
impl Store for RemoteStore {
    fn uri(&self) -> SfdbUri {
        SfdbUri::new(
            "sfdbremote",
            format!(
                "{}/{}",
                self.connection.endpoint(),
                self.db_key.values_to_string()
            ),
        )
    }

    async fn archive(&self, index_key: &Key, data: Bytes) -> Result<PendingArchive, StoreError> {
        let (slot, pending) = archive_channel();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let blob = ArchiveBlob {
            sequence,
            index_key: index_key.clone(),
            data,
        };
        self.push_pending(sequence, slot)?;
        self.connection
            .send_data(Frame::data(
                MessageKind::Archive,
                self.client_id,
                self.archive_stream_id(),
                encode_payload(&blob),
            ))
            .await
            .map_err(wire_error)?;
        Ok(pending)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let outstanding: Vec<(u64, ArchiveSlot)> = {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| StoreError::Custom("remote store state poisoned".into()))?;
            std::mem::take(&mut *pending)
        };
        if outstanding.is_empty() {
            return Ok(());
        }

        let response = self
            .connection
            .rpc(
                MessageKind::Flush,
                self.client_id,
                encode_payload(&FlushRequest {
                    expected: outstanding.len() as u64,
                }),
            )
            .await
            .map_err(wire_error)?;
        let locations: FlushLocations = decode_payload(&response).map_err(wire_error)?;

        let mut resolved = 0_usize;
        for (sequence, slot) in outstanding {
            match locations
                .locations
                .iter()
                .find(|(seq, _)| *seq == sequence)
            {
                Some((_, location)) => {
                    // Wrap so downstream consumers know which server owns it.
                    slot.resolve(Ok(FieldLocation::remote(
                        self.connection.endpoint(),
                        location.clone(),
                    )));
                    resolved += 1;
                }
                None => slot.resolve(Err(StoreError::Custom(format!(
                    "server did not acknowledge archived field {sequence}"
                )))),
            }
        }
        if resolved != locations.locations.len() {
            return Err(StoreError::Custom(
                "server acknowledged fields this client never archived".into(),
            ));
        }
        Ok(())
    }

    async fn retrieve(&self, location: &FieldLocation) -> Result<DataHandle, StoreError> {
        let inner = location.stable_location().clone();
        let length = inner.length();
        let permit = self
            .limiter
            .admit(length)
            .await
            .map_err(wire_error)?;

        let (_, mut frames) = self
            .connection
            .rpc_stream(
                MessageKind::Read,
                self.client_id,
                encode_payload(&ReadRequest { location: inner }),
                16,
            )
            .await
            .map_err(wire_error)?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            // The permit lives for the duration of the transfer.
            let _permit = permit;
            while let Some(result) = frames.recv().await {
                let forward = match result {
                    Ok(frame) => match frame.kind {
                        MessageKind::Blob => Ok(frame.payload),
                        MessageKind::Complete => break,
                        other => Err(wire_error(RemoteError::UnexpectedMessage {
                            kind: other.to_string(),
                            request_id: frame.request_id,
                        })),
                    },
                    Err(e) => Err(wire_error(e)),
                };
                let failed = forward.is_err();
                if tx.send(forward).await.is_err() || failed {
                    return;
                }
            }
        });

        Ok(DataHandle::Stream {
            length,
            frames: rx,
        })
    }

    fn uri_belongs(&self, uri: &SfdbUri) -> bool {
        uri.scheme() == "sfdbremote" && uri.path().starts_with(self.connection.endpoint())
    }

    async fn store_unit_uris(&self) -> Result<Vec<SfdbUri>, StoreError> {
        Err(StoreError::Custom(
            "store units are not enumerable over the wire; wipe runs on the server".into(),
        ))
    }

    async fn remove(&self, _uri: &SfdbUri, _doit: bool) -> Result<(), StoreError> {
        Err(StoreError::Custom(
            "store units are not removable over the wire; wipe runs on the server".into(),
        ))
    }

    async fn close(&self) -> Result<(), StoreError> {
        let outstanding = self
            .pending
            .lock()
            .map(|p| p.len())
            .unwrap_or(0);
        if outstanding > 0 {
            warn!(db = %self.db_key, outstanding, "closing remote store with unflushed archives");
            self.flush().await?;
        }
        self.connection
            .rpc(MessageKind::Stop, self.client_id, Bytes::new())
            .await
            .map_err(wire_error)?;
        Ok(())
    }
}
