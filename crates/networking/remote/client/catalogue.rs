use crate::client::connection::ClientConnection;
use crate::error::RemoteError;
use crate::messages::{
    decode_payload, encode_payload, AxesRequest, AxesResponse, CatalogueArchive, ExistsResponse,
    FlushRequest, Frame, MessageKind, RegisterClient, RetrieveRequest, RetrieveResponse,
};
use async_trait::async_trait;
use bytes::Bytes;
use sfdb_catalogue::{Catalogue, CatalogueError, CatalogueReader, CatalogueWriter};
use sfdb_common::{ControlAction, ControlIdentifier, ControlIdentifiers, Key, SfdbUri};
use sfdb_store::FieldLocation;
use std::collections::BTreeSet;
use std::sync::Arc;

fn wire_error(err: RemoteError) -> CatalogueError {
    CatalogueError::Store(sfdb_store::StoreError::Unreachable {
        endpoint: "<remote>".into(),
        msg: err.to_string(),
    })
}

/// Client-side proxy implementing the catalogue contracts over the wire.
///
/// Index selection is local bookkeeping; retrieval and axis queries are
/// control RPCs; archived entries stream on the data connection and
/// `flush(n)` blocks until the server has recorded exactly `n` of them.
pub struct RemoteCatalogue {
    connection: Arc<ClientConnection>,
    db_key: Key,
    client_id: u32,
    disabled: ControlIdentifiers,
    exists: bool,
    selected: Option<Key>,
    archive_stream: Option<u32>,
    archived_since_flush: usize,
    /// Schema source fetched on demand, cached for the proxy's lifetime.
    schema_source: Option<String>,
}

impl RemoteCatalogue {
    /// Registers a catalogue client for `db_key` on the shared connection.
    pub async fn open(
        connection: Arc<ClientConnection>,
        db_key: Key,
    ) -> Result<Self, RemoteError> {
        let client_id = connection.next_id();
        let response = connection
            .rpc(
                MessageKind::Exists,
                client_id,
                encode_payload(&RegisterClient {
                    db_key: db_key.clone(),
                }),
            )
            .await?;
        let exists: ExistsResponse = decode_payload(&response)?;
        Ok(Self {
            connection,
            db_key,
            client_id,
            disabled: exists.disabled,
            exists: exists.exists,
            selected: None,
            archive_stream: None,
            archived_since_flush: 0,
            schema_source: None,
        })
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    /// The schema this database was written with, fetched once.
    pub async fn schema_source(&mut self) -> Result<&str, RemoteError> {
        if self.schema_source.is_none() {
            let payload = self
                .connection
                .rpc(MessageKind::Schema, self.client_id, Bytes::new())
                .await?;
            self.schema_source = Some(String::from_utf8_lossy(&payload).into_owned());
        }
        Ok(self
            .schema_source
            .as_deref()
            .unwrap_or_default())
    }

    fn selected_key(&self) -> Result<&Key, CatalogueError> {
        self.selected
            .as_ref()
            .ok_or(CatalogueError::NoIndexSelected)
    }
}

impl Catalogue for RemoteCatalogue {
    fn db_key(&self) -> &Key {
        &self.db_key
    }

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

    fn disabled(&self) -> ControlIdentifiers {
        self.disabled
    }
}

#[async_trait]
impl CatalogueReader for RemoteCatalogue {
    fn select_index(&mut self, index_key: &Key) -> bool {
        self.selected = Some(index_key.clone());
        // Whether anything matches is only known server-side.
        self.exists
    }

    fn deselect_index(&mut self) {
        self.selected = None;
    }

    async fn retrieve(
        &mut self,
        datum_key: &Key,
    ) -> Result<Option<FieldLocation>, CatalogueError> {
        let index_key = self.selected_key()?.clone();
        let response = self
            .connection
            .rpc(
                MessageKind::Retrieve,
                self.client_id,
                encode_payload(&RetrieveRequest {
                    index_key,
                    datum_key: datum_key.clone(),
                }),
            )
            .await
            .map_err(wire_error)?;
        let retrieved: RetrieveResponse = decode_payload(&response).map_err(wire_error)?;
        // Wrap so the caller knows which server can serve the bytes.
        Ok(retrieved
            .location
            .map(|inner| FieldLocation::remote(self.connection.endpoint(), inner)))
    }

    async fn axis(&mut self, keyword: &str) -> Result<Option<BTreeSet<String>>, CatalogueError> {
        let index_key = self.selected_key()?.clone();
        let response = self
            .connection
            .rpc(
                MessageKind::Axes,
                self.client_id,
                encode_payload(&AxesRequest {
                    index_key,
                    keyword: keyword.to_string(),
                }),
            )
            .await
            .map_err(wire_error)?;
        let axes: AxesResponse = decode_payload(&response).map_err(wire_error)?;
        Ok(axes.values.map(|v| v.into_iter().collect()))
    }
}

#[async_trait]
impl CatalogueWriter for RemoteCatalogue {
    fn select_index(&mut self, index_key: &Key) -> Result<(), CatalogueError> {
        self.selected = Some(index_key.clone());
        Ok(())
    }

    fn deselect_index(&mut self) {
        self.selected = None;
    }

    async fn archive(
        &mut self,
        datum_key: &Key,
        location: FieldLocation,
    ) -> Result<(), CatalogueError> {
        let index_key = self.selected_key()?.clone();
        let stream_id = match self.archive_stream {
            Some(id) => id,
            None => {
                let id = self.connection.next_id();
                self.archive_stream = Some(id);
                id
            }
        };
        // The server stores its own view of the location.
        let entry = CatalogueArchive {
            index_key,
            datum_key: datum_key.clone(),
            location: location.stable_location().clone(),
        };
        self.connection
            .send_data(Frame::data(
                MessageKind::Archive,
                self.client_id,
                stream_id,
                encode_payload(&entry),
            ))
            .await
            .map_err(wire_error)?;
        self.archived_since_flush += 1;
        Ok(())
    }

    async fn flush(&mut self, expected: usize) -> Result<(), CatalogueError> {
        if self.archived_since_flush != expected {
            return Err(CatalogueError::FlushCountMismatch {
                expected,
                observed: self.archived_since_flush,
            });
        }
        self.connection
            .rpc(
                MessageKind::Flush,
                self.client_id,
                encode_payload(&FlushRequest {
                    expected: expected as u64,
                }),
            )
            .await
            .map_err(wire_error)?;
        self.archived_since_flush = 0;
        self.exists = true;
        Ok(())
    }

    async fn overlay_db(
        &mut self,
        _other_db_key: &Key,
        _other_toc: SfdbUri,
        _varying: &BTreeSet<String>,
        _unmount: bool,
    ) -> Result<(), CatalogueError> {
        Err(CatalogueError::Usage(
            "overlay is not supported over the wire".into(),
        ))
    }

    async fn hide_contents(&mut self) -> Result<(), CatalogueError> {
        Err(CatalogueError::Usage(
            "hide-contents is not supported over the wire".into(),
        ))
    }

    async fn control(
        &mut self,
        action: ControlAction,
        identifiers: &[ControlIdentifier],
    ) -> Result<(), CatalogueError> {
        let mut disabled = self.disabled;
        disabled.apply(action, identifiers.iter().copied());
        let request = crate::messages::ControlRequest {
            request: self.db_key.as_request("control"),
            enable: matches!(action, ControlAction::Enable),
            identifiers: identifiers
                .iter()
                .fold(0_u64, |mask, id| mask | 1 << (*id as u8)),
        };
        self.connection
            .rpc(
                MessageKind::Control,
                self.client_id,
                encode_payload(&request),
            )
            .await
            .map_err(wire_error)?;
        self.disabled = disabled;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), CatalogueError> {
        if self.archived_since_flush > 0 {
            let archived = self.archived_since_flush;
            self.flush(archived).await?;
        }
        self.connection
            .rpc(MessageKind::Stop, self.client_id, Bytes::new())
            .await
            .map_err(wire_error)?;
        Ok(())
    }
}
