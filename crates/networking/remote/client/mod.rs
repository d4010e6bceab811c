pub mod catalogue;
pub mod connection;
pub mod limiter;
pub mod router;
pub mod store;

pub use catalogue::RemoteCatalogue;
pub use connection::ClientConnection;
pub use limiter::{ReadLimiter, ReadPermit};
pub use router::ClientConnectionRouter;
pub use store::RemoteStore;

use crate::messages::MessageKind;
use bytes::Bytes;
use sfdb_catalogue::visit::ListElement;
use sfdb_catalogue::{CatalogueReader as _, CatalogueWriter as _};
use sfdb_codec::SfdbDecode;
use sfdb_common::{Config, FdbError, Key, Request, Schema};
use sfdb_store::{DataHandle, PendingArchive, Store as _};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

type FdbResult<T> = Result<T, FdbError>;

struct DbClients {
    catalogue: RemoteCatalogue,
    store: RemoteStore,
    pending: Vec<(Key, Key, PendingArchive)>,
}

/// High-level remote client: the catalogue/store pair per database, plus
/// the archive bookkeeping the local engine does for local databases.
pub struct RemoteFdb {
    connection: Arc<ClientConnection>,
    limiter: Arc<ReadLimiter>,
    schema: Option<Arc<Schema>>,
    clients: HashMap<String, DbClients>,
}

impl RemoteFdb {
    pub async fn connect(
        router: &ClientConnectionRouter,
        endpoint: &str,
        config: &Config,
    ) -> FdbResult<Self> {
        let connection = router
            .connection(endpoint, config)
            .await
            .map_err(FdbError::from)?;
        Ok(Self {
            connection,
            limiter: ReadLimiter::with_default_budget(),
            schema: None,
            clients: HashMap::new(),
        })
    }

    /// The server's top-level schema, fetched once and cached.
    pub async fn schema(&mut self) -> FdbResult<Arc<Schema>> {
        if let Some(schema) = &self.schema {
            return Ok(schema.clone());
        }
        let payload = self
            .connection
            .rpc(MessageKind::Schema, 0, Bytes::new())
            .await
            .map_err(FdbError::from)?;
        let source = String::from_utf8_lossy(&payload);
        let schema = Schema::from_yaml(&source)
            .map_err(|e| FdbError::usage(format!("server schema: {e}")))?;
        let schema = Arc::new(schema);
        self.schema = Some(schema.clone());
        Ok(schema)
    }

    async fn clients_for(&mut self, db_key: &Key) -> FdbResult<&mut DbClients> {
        let fp = db_key.values_to_string();
        if !self.clients.contains_key(&fp) {
            let catalogue =
                RemoteCatalogue::open(self.connection.clone(), db_key.clone())
                    .await
                    .map_err(FdbError::from)?;
            let store = RemoteStore::open(
                self.connection.clone(),
                self.limiter.clone(),
                db_key.clone(),
            )
            .await
            .map_err(FdbError::from)?;
            debug!(db = %db_key, "opened remote catalogue/store pair");
            self.clients.insert(
                fp.clone(),
                DbClients {
                    catalogue,
                    store,
                    pending: Vec::new(),
                },
            );
        }
        self.clients
            .get_mut(&fp)
            .ok_or_else(|| FdbError::consistency("remote client slot vanished"))
    }

    /// Archives one field: bytes to the store stream now, the catalogue
    /// entry at flush time once the location is known.
    pub async fn archive(&mut self, key: &Key, data: Bytes) -> FdbResult<()> {
        let schema = self.schema().await?;
        let triple = schema
            .partition(key)
            .map_err(|e| FdbError::usage(e.to_string()))?;
        let clients = self.clients_for(&triple.db).await?;
        let pending = clients
            .store
            .archive(&triple.index, data)
            .await
            .map_err(FdbError::from)?;
        clients.pending.push((triple.index, triple.datum, pending));
        Ok(())
    }

    /// Flush barrier across every database touched: store flush resolves
    /// the locations, the catalogue records them, and `flush(n)` confirms
    /// the server saw exactly `n` entries.
    pub async fn flush(&mut self) -> FdbResult<()> {
        for clients in self.clients.values_mut() {
            if clients.pending.is_empty() {
                continue;
            }
            clients.store.flush().await.map_err(FdbError::from)?;
            let fields = std::mem::take(&mut clients.pending);
            let count = fields.len();
            for (index_key, datum_key, pending) in fields {
                let location = pending.wait().await.map_err(FdbError::from)?;
                sfdb_catalogue::CatalogueWriter::select_index(&mut clients.catalogue, &index_key)
                    .map_err(FdbError::from)?;
                clients
                    .catalogue
                    .archive(&datum_key, location)
                    .await
                    .map_err(FdbError::from)?;
            }
            clients
                .catalogue
                .flush(count)
                .await
                .map_err(FdbError::from)?;
        }
        Ok(())
    }

    /// Retrieves one field as a streamed handle.
    pub async fn retrieve(&mut self, key: &Key) -> FdbResult<DataHandle> {
        let schema = self.schema().await?;
        let triple = schema
            .partition(key)
            .map_err(|e| FdbError::usage(e.to_string()))?;
        let clients = self.clients_for(&triple.db).await?;
        sfdb_catalogue::CatalogueReader::select_index(&mut clients.catalogue, &triple.index);
        let location = clients
            .catalogue
            .retrieve(&triple.datum)
            .await
            .map_err(FdbError::from)?;
        match location {
            Some(location) => clients
                .store
                .retrieve(&location)
                .await
                .map_err(FdbError::from),
            None => Ok(DataHandle::empty()),
        }
    }

    /// Server-side listing, streamed element by element.
    pub async fn list(&mut self, request: &Request, dedup: bool) -> FdbResult<Vec<ListElement>> {
        let payload = crate::messages::encode_payload(&crate::messages::ListRequest {
            request: request.clone(),
            dedup,
        });
        let (_, mut frames) = self
            .connection
            .rpc_stream(MessageKind::List, 0, payload, 64)
            .await
            .map_err(FdbError::from)?;

        let mut elements = Vec::new();
        while let Some(result) = frames.recv().await {
            let frame = result.map_err(FdbError::from)?;
            match frame.kind {
                MessageKind::Blob => {
                    elements.push(
                        ListElement::decode(&frame.payload).map_err(FdbError::from)?,
                    );
                }
                MessageKind::Complete => break,
                other => {
                    return Err(FdbError::consistency(format!(
                        "unexpected {other} frame in list stream"
                    )))
                }
            }
        }
        Ok(elements)
    }

    /// Graceful shutdown of every per-database client and the connection.
    pub async fn close(&mut self) -> FdbResult<()> {
        self.flush().await?;
        for (_, mut clients) in self.clients.drain() {
            clients.catalogue.close().await.map_err(FdbError::from)?;
            clients.store.close().await.map_err(FdbError::from)?;
        }
        self.connection.teardown().await;
        Ok(())
    }
}
