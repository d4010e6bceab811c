pub mod ports;

pub use ports::AvailablePortList;

use crate::error::RemoteError;
use crate::messages::{
    decode_payload, encode_payload, ArchiveBlob, AxesRequest, AxesResponse, CatalogueArchive,
    ClientStartup, ControlRequest, DataStartup, ExistsResponse, FlushLocations, FlushRequest,
    Frame, FrameCodec, ListRequest, MessageKind, PurgeRequest, ReadRequest, RegisterClient,
    RetrieveRequest, RetrieveResponse, ServerStartup, SessionId, WipeRequest, BLOB_CHUNK,
};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use sfdb_catalogue::toc::SCHEMA_FILE_NAME;
use sfdb_catalogue::{
    Catalogue as _, CatalogueReader as _, CatalogueWriter as _, Engine, SerialisationVersion,
    TocCatalogueReader, TocCatalogueWriter,
};
use sfdb_codec::SfdbEncode;
use sfdb_common::{
    Config, ControlAction, ControlIdentifier, ControlIdentifiers, Key, Schema,
};
use sfdb_store::{FieldLocation, FileStore, PendingArchive, Store};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

const DATA_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);
const PORT_LEASE_FILE: &str = "sfdb-data-ports";

type Sink = SplitSink<Framed<TcpStream, FrameCodec>, Frame>;
type Stream = SplitStream<Framed<TcpStream, FrameCodec>>;

/// Shared, immutable server context handed to every connection handler.
struct ServerContext {
    config: Config,
    schema: Arc<Schema>,
    root: PathBuf,
    version: SerialisationVersion,
}

/// The SFDB network server: one accept loop, one handler task per
/// connected client process.
pub struct Server {
    config: Config,
    schema: Schema,
}

impl Server {
    pub fn new(config: Config, schema: Schema) -> Self {
        Self { config, schema }
    }

    /// Binds the control listener and starts serving in the background.
    pub async fn bind(self) -> Result<RunningServer, RemoteError> {
        let root = self
            .config
            .writable_root()
            .map_err(|e| RemoteError::Remote(e.to_string()))?;
        let version = SerialisationVersion::from_env()
            .map_err(|e| RemoteError::Remote(e.to_string()))?;
        let context = Arc::new(ServerContext {
            config: self.config.clone(),
            schema: Arc::new(self.schema),
            root,
            version,
        });

        let listener =
            TcpListener::bind(("0.0.0.0", self.config.server_port)).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "server listening");

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        debug!(%peer, "accepted control connection");
                        let context = context.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(socket, context).await {
                                warn!(%peer, error = %e, "connection handler ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        });

        Ok(RunningServer { local_addr, handle })
    }
}

/// Handle on a serving listener; aborting it stops accepting new clients.
pub struct RunningServer {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn endpoint(&self) -> String {
        format!("127.0.0.1:{}", self.local_addr.port())
    }

    pub fn shutdown(self) {
        self.handle.abort();
    }
}

struct StoreClient {
    db_key: Key,
    store: Arc<dyn Store>,
    pending: Vec<(u64, PendingArchive)>,
    stream_error: Option<String>,
    /// A flush that arrived before all of its archive frames. Control and
    /// data travel on different sockets, so the count may still be in
    /// flight; the flush completes when the last frame lands.
    pending_flush: Option<(Frame, u64)>,
}

struct CatClient {
    db_key: Key,
    writer: Option<TocCatalogueWriter>,
    archived: u64,
    stream_error: Option<String>,
    pending_flush: Option<(Frame, u64)>,
}

/// Per-connection server state: the catalogue/store instances owned on
/// behalf of each registered client id.
struct Handler {
    context: Arc<ServerContext>,
    stores: HashMap<String, Arc<dyn Store>>,
    store_clients: HashMap<u32, StoreClient>,
    cat_clients: HashMap<u32, CatClient>,
    control_tx: Arc<Mutex<Sink>>,
    data_tx: Arc<Mutex<Sink>>,
}

async fn handle_connection(
    control: TcpStream,
    context: Arc<ServerContext>,
) -> Result<(), RemoteError> {
    let local_ip = control.local_addr()?.ip();
    let mut control = Framed::new(control, FrameCodec);

    // Handshake, step 1: the client introduces its session.
    let first = control.next().await.ok_or(RemoteError::Disconnected)??;
    if first.kind != MessageKind::Startup {
        return Err(RemoteError::UnexpectedMessage {
            kind: first.kind.to_string(),
            request_id: first.request_id,
        });
    }
    let client_startup: ClientStartup = decode_payload(&first.payload)?;
    let server_session = SessionId::random();
    let single =
        client_startup.prefer_single_connection || context.config.single_connection;

    // Step 2: advertise the data endpoint (ourselves, in single mode).
    let data_listener = if single {
        None
    } else {
        Some(bind_data_listener(&context.config, local_ip).await?)
    };
    let data_endpoint = match &data_listener {
        Some(listener) => format!("{}:{}", local_ip, listener.local_addr()?.port()),
        None => format!("{}:{}", local_ip, 0),
    };
    control
        .send(Frame::control(
            MessageKind::Startup,
            0,
            0,
            encode_payload(&ServerStartup {
                client_session: client_startup.session,
                server_session,
                data_endpoint,
                single_connection: single,
            }),
        ))
        .await?;

    // Step 3: bind the data socket to the session, verifying both tokens.
    let data = match data_listener {
        Some(listener) => {
            let accepted =
                tokio::time::timeout(DATA_ACCEPT_TIMEOUT, listener.accept()).await;
            let (socket, _) = match accepted {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    return Err(RemoteError::transport(
                        "data",
                        "client never opened the data connection",
                    ))
                }
            };
            let mut data = Framed::new(socket, FrameCodec);
            let frame = data.next().await.ok_or(RemoteError::Disconnected)??;
            let startup: DataStartup = decode_payload(&frame.payload)?;
            if startup.client_session != client_startup.session
                || startup.server_session != server_session
            {
                // The misrouted data socket dies; the control socket learns why.
                let msg = format!(
                    "consistency: data connection carries sessions {}/{}, expected {}/{}",
                    startup.client_session,
                    startup.server_session,
                    client_startup.session,
                    server_session
                );
                warn!("{msg}");
                control.send(Frame::error(0, 0, &msg)).await?;
                return Err(RemoteError::SessionMismatch(msg));
            }
            Some(data)
        }
        None => None,
    };
    debug!(
        session = %client_startup.session,
        server_session = %server_session,
        single,
        "session established"
    );

    // Split both sockets; route every incoming frame into one queue.
    let (control_tx, control_rx) = control.split();
    let control_tx = Arc::new(Mutex::new(control_tx));
    let (frames_tx, mut frames_rx) = mpsc::channel::<Result<Frame, RemoteError>>(64);

    let mut handler = match data {
        Some(data) => {
            let (data_tx, data_rx) = data.split();
            let data_tx = Arc::new(Mutex::new(data_tx));
            spawn_reader(data_rx, frames_tx.clone());
            spawn_reader(control_rx, frames_tx);
            Handler::new(context, control_tx.clone(), data_tx)
        }
        None => {
            spawn_reader(control_rx, frames_tx);
            Handler::new(context, control_tx.clone(), control_tx.clone())
        }
    };

    let mut outcome = Ok(());
    while let Some(result) = frames_rx.recv().await {
        match result {
            Ok(frame) if frame.kind == MessageKind::Exit => {
                debug!("client requested exit");
                break;
            }
            Ok(frame) => {
                if let Err(e) = handler.dispatch(frame).await {
                    outcome = Err(e);
                    break;
                }
            }
            Err(e) => {
                outcome = Err(e);
                break;
            }
        }
    }
    handler.shutdown().await;
    outcome
}

async fn bind_data_listener(
    config: &Config,
    local_ip: std::net::IpAddr,
) -> Result<TcpListener, RemoteError> {
    if config.data_port_count > 0 {
        let lease_path = std::env::temp_dir().join(PORT_LEASE_FILE);
        let list = AvailablePortList::new(
            lease_path,
            config.data_port_start,
            config.data_port_count,
        );
        let _ = list.reap(Duration::from_secs(60));
        let port = list.acquire()?;
        Ok(TcpListener::bind((local_ip, port)).await?)
    } else {
        Ok(TcpListener::bind((local_ip, 0)).await?)
    }
}

fn spawn_reader(mut stream: Stream, queue: mpsc::Sender<Result<Frame, RemoteError>>) {
    tokio::spawn(async move {
        loop {
            match stream.next().await {
                Some(Ok(frame)) => {
                    if queue.send(Ok(frame)).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    let _ = queue.send(Err(e)).await;
                    return;
                }
                None => {
                    let _ = queue
                        .send(Ok(Frame::control(MessageKind::Exit, 0, 0, Bytes::new())))
                        .await;
                    return;
                }
            }
        }
    });
}

async fn send_frame(sink: &Arc<Mutex<Sink>>, frame: Frame) -> Result<(), RemoteError> {
    sink.lock().await.send(frame).await
}

impl Handler {
    fn new(
        context: Arc<ServerContext>,
        control_tx: Arc<Mutex<Sink>>,
        data_tx: Arc<Mutex<Sink>>,
    ) -> Self {
        Self {
            context,
            stores: HashMap::new(),
            store_clients: HashMap::new(),
            cat_clients: HashMap::new(),
            control_tx,
            data_tx,
        }
    }

    fn store_for(&mut self, db_key: &Key) -> Result<Arc<dyn Store>, RemoteError> {
        let fp = db_key.values_to_string();
        if let Some(store) = self.stores.get(&fp) {
            return Ok(store.clone());
        }
        let store: Arc<dyn Store> =
            Arc::new(FileStore::new(self.context.root.join(&fp)).map_err(to_remote)?);
        self.stores.insert(fp, store.clone());
        Ok(store)
    }

    fn engine(&self) -> Result<Engine, RemoteError> {
        Engine::with_schema(
            self.context.config.clone(),
            (*self.context.schema).clone(),
        )
        .map_err(|e| RemoteError::Remote(e.to_string()))
    }

    async fn reply(
        &self,
        frame: &Frame,
        kind: MessageKind,
        payload: Bytes,
    ) -> Result<(), RemoteError> {
        send_frame(
            &self.control_tx,
            Frame::control(kind, frame.client_id, frame.request_id, payload),
        )
        .await
    }

    async fn reply_error(&self, frame: &Frame, msg: &str) -> Result<(), RemoteError> {
        warn!(
            client_id = frame.client_id,
            request_id = frame.request_id,
            msg,
            "request failed"
        );
        send_frame(
            &self.control_tx,
            Frame::error(frame.client_id, frame.request_id, msg),
        )
        .await
    }

    async fn dispatch(&mut self, frame: Frame) -> Result<(), RemoteError> {
        match frame.kind {
            MessageKind::Store => self.on_register_store(frame).await,
            MessageKind::Exists => self.on_register_catalogue(frame).await,
            MessageKind::Schema => self.on_schema(frame).await,
            MessageKind::Archive => self.on_archive(frame).await,
            MessageKind::Flush => self.on_flush(frame).await,
            MessageKind::Retrieve => self.on_retrieve(frame).await,
            MessageKind::Axes => self.on_axes(frame).await,
            MessageKind::Read => self.on_read(frame).await,
            MessageKind::List => self.on_list(frame).await,
            MessageKind::Dump | MessageKind::Stats | MessageKind::Status => {
                self.on_report(frame).await
            }
            MessageKind::Wipe => self.on_wipe(frame).await,
            MessageKind::Purge => self.on_purge(frame).await,
            MessageKind::Control => self.on_control(frame).await,
            MessageKind::Stop => self.on_stop(frame).await,
            other => {
                self.reply_error(&frame, &format!("consistency: unexpected message {other}"))
                    .await
            }
        }
    }

    async fn on_register_store(&mut self, frame: Frame) -> Result<(), RemoteError> {
        let register: RegisterClient = decode_payload(&frame.payload)?;
        let store = self.store_for(&register.db_key)?;
        self.store_clients.insert(
            frame.client_id,
            StoreClient {
                db_key: register.db_key,
                store,
                pending: Vec::new(),
                stream_error: None,
                pending_flush: None,
            },
        );
        self.reply(&frame, MessageKind::Received, Bytes::new()).await
    }

    async fn on_register_catalogue(&mut self, frame: Frame) -> Result<(), RemoteError> {
        let register: RegisterClient = decode_payload(&frame.payload)?;
        let exists = TocCatalogueReader::exists(&self.context.root, &register.db_key);
        let disabled = if exists {
            TocCatalogueReader::open(&self.context.root, &register.db_key)
                .map(|r| r.disabled())
                .unwrap_or_else(|_| ControlIdentifiers::none())
        } else {
            ControlIdentifiers::none()
        };
        self.cat_clients.insert(
            frame.client_id,
            CatClient {
                db_key: register.db_key,
                writer: None,
                archived: 0,
                stream_error: None,
                pending_flush: None,
            },
        );
        self.reply(
            &frame,
            MessageKind::Blob,
            encode_payload(&ExistsResponse { exists, disabled }),
        )
        .await
    }

    async fn on_schema(&mut self, frame: Frame) -> Result<(), RemoteError> {
        // A registered catalogue client gets the schema its DB was written
        // with; anyone else gets the server's top-level schema.
        let source = match self.cat_clients.get(&frame.client_id) {
            Some(client) => {
                let db_schema = self
                    .context
                    .root
                    .join(client.db_key.values_to_string())
                    .join(SCHEMA_FILE_NAME);
                std::fs::read_to_string(db_schema)
                    .unwrap_or_else(|_| self.context.schema.source().to_string())
            }
            None => self.context.schema.source().to_string(),
        };
        self.reply(&frame, MessageKind::Blob, Bytes::from(source)).await
    }

    async fn on_archive(&mut self, frame: Frame) -> Result<(), RemoteError> {
        if let Some(client) = self.store_clients.get_mut(&frame.client_id) {
            let blob: ArchiveBlob = match decode_payload(&frame.payload) {
                Ok(blob) => blob,
                Err(e) => {
                    client.stream_error = Some(e.to_string());
                    return Ok(());
                }
            };
            match client.store.archive(&blob.index_key, blob.data).await {
                Ok(pending) => client.pending.push((blob.sequence, pending)),
                Err(e) => client.stream_error = Some(e.to_string()),
            }
            return self.try_complete_store_flush(frame.client_id).await;
        }

        if let Some(client) = self.cat_clients.get_mut(&frame.client_id) {
            let entry: CatalogueArchive = match decode_payload(&frame.payload) {
                Ok(entry) => entry,
                Err(e) => {
                    client.stream_error = Some(e.to_string());
                    return Ok(());
                }
            };
            if client.writer.is_none() {
                match TocCatalogueWriter::create(
                    &self.context.root,
                    client.db_key.clone(),
                    &self.context.schema,
                    self.context.version,
                    self.context.config.use_sub_toc,
                ) {
                    Ok(writer) => client.writer = Some(writer),
                    Err(e) => {
                        client.stream_error = Some(e.to_string());
                        return Ok(());
                    }
                }
            }
            if let Some(writer) = client.writer.as_mut() {
                let result = match writer.select_index(&entry.index_key) {
                    Ok(()) => writer.archive(&entry.datum_key, entry.location).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => client.archived += 1,
                    Err(e) => client.stream_error = Some(e.to_string()),
                }
            }
            return self.try_complete_cat_flush(frame.client_id).await;
        }

        warn!(client_id = frame.client_id, "archive frame for unknown client");
        Ok(())
    }

    async fn on_flush(&mut self, frame: Frame) -> Result<(), RemoteError> {
        let request: FlushRequest = decode_payload(&frame.payload)?;
        let client_id = frame.client_id;

        if let Some(client) = self.store_clients.get_mut(&client_id) {
            client.pending_flush = Some((frame, request.expected));
            return self.try_complete_store_flush(client_id).await;
        }

        if let Some(client) = self.cat_clients.get_mut(&client_id) {
            client.pending_flush = Some((frame, request.expected));
            return self.try_complete_cat_flush(client_id).await;
        }

        self.reply_error(&frame, "consistency: flush for unknown client")
            .await
    }

    /// Completes a store flush once every announced archive frame has
    /// landed. Announcing fewer frames than were sent is a consistency
    /// error; announcing more leaves the flush waiting for the remainder.
    async fn try_complete_store_flush(&mut self, client_id: u32) -> Result<(), RemoteError> {
        let Some(client) = self.store_clients.get_mut(&client_id) else {
            return Ok(());
        };
        let Some((frame, expected)) = client.pending_flush.take() else {
            return Ok(());
        };

        if let Some(msg) = client.stream_error.take() {
            client.pending.clear();
            return self.reply_error(&frame, &msg).await;
        }
        let seen = client.pending.len() as u64;
        if seen > expected {
            let msg = format!(
                "consistency: flush expected {expected} archived fields, server saw {seen}"
            );
            client.pending.clear();
            return self.reply_error(&frame, &msg).await;
        }
        if seen < expected {
            // Frames still in flight on the data socket.
            client.pending_flush = Some((frame, expected));
            return Ok(());
        }

        let store = client.store.clone();
        let db_key = client.db_key.clone();
        let outstanding = std::mem::take(&mut client.pending);
        if let Err(e) = store.flush().await {
            return self.reply_error(&frame, &e.to_string()).await;
        }
        let mut locations = Vec::with_capacity(outstanding.len());
        for (sequence, pending) in outstanding {
            match pending.wait().await {
                Ok(location) => locations.push((sequence, location)),
                Err(e) => {
                    return self.reply_error(&frame, &e.to_string()).await;
                }
            }
        }
        debug!(db = %db_key, count = locations.len(), "store flush acknowledged");
        self.reply(
            &frame,
            MessageKind::Complete,
            encode_payload(&FlushLocations { locations }),
        )
        .await
    }

    async fn try_complete_cat_flush(&mut self, client_id: u32) -> Result<(), RemoteError> {
        let Some(client) = self.cat_clients.get_mut(&client_id) else {
            return Ok(());
        };
        let Some((frame, expected)) = client.pending_flush.take() else {
            return Ok(());
        };

        if let Some(msg) = client.stream_error.take() {
            return self.reply_error(&frame, &msg).await;
        }
        if client.archived > expected {
            let msg = format!(
                "consistency: flush expected {expected} catalogue entries, server saw {}",
                client.archived
            );
            return self.reply_error(&frame, &msg).await;
        }
        if client.archived < expected {
            client.pending_flush = Some((frame, expected));
            return Ok(());
        }

        let result = match client.writer.as_mut() {
            Some(writer) => writer.flush(expected as usize).await,
            None if expected == 0 => Ok(()),
            None => Err(sfdb_catalogue::CatalogueError::FlushCountMismatch {
                expected: expected as usize,
                observed: 0,
            }),
        };
        client.archived = 0;
        match result {
            Ok(()) => self.reply(&frame, MessageKind::Complete, Bytes::new()).await,
            Err(e) => self.reply_error(&frame, &e.to_string()).await,
        }
    }

    async fn on_retrieve(&mut self, frame: Frame) -> Result<(), RemoteError> {
        let request: RetrieveRequest = decode_payload(&frame.payload)?;
        let Some(client) = self.cat_clients.get(&frame.client_id) else {
            return self
                .reply_error(&frame, "consistency: retrieve for unknown client")
                .await;
        };

        // A fresh snapshot per request: the client sees its own flushes.
        let location =
            match TocCatalogueReader::open(&self.context.root, &client.db_key) {
                Ok(mut reader) => {
                    if reader.enabled(ControlIdentifier::Retrieve) {
                        reader.select_index(&request.index_key);
                        reader
                            .retrieve(&request.datum_key)
                            .await
                            .map_err(to_remote)?
                    } else {
                        None
                    }
                }
                Err(_) => None,
            };
        self.reply(
            &frame,
            MessageKind::Blob,
            encode_payload(&RetrieveResponse { location }),
        )
        .await
    }

    async fn on_axes(&mut self, frame: Frame) -> Result<(), RemoteError> {
        let request: AxesRequest = decode_payload(&frame.payload)?;
        let Some(client) = self.cat_clients.get(&frame.client_id) else {
            return self
                .reply_error(&frame, "consistency: axes for unknown client")
                .await;
        };
        let values = match TocCatalogueReader::open(&self.context.root, &client.db_key) {
            Ok(mut reader) => {
                reader.select_index(&request.index_key);
                reader
                    .axis(&request.keyword)
                    .await
                    .map_err(to_remote)?
                    .map(|set| set.into_iter().collect::<Vec<String>>())
            }
            Err(_) => None,
        };
        self.reply(
            &frame,
            MessageKind::Blob,
            encode_payload(&AxesResponse { values }),
        )
        .await
    }

    /// Streams the bytes of one field location back on the data channel.
    async fn on_read(&mut self, frame: Frame) -> Result<(), RemoteError> {
        let request: ReadRequest = decode_payload(&frame.payload)?;
        let Some(client) = self.store_clients.get(&frame.client_id) else {
            return self
                .reply_error(&frame, "consistency: read for unknown client")
                .await;
        };

        let store = client.store.clone();
        let data_tx = self.data_tx.clone();
        let client_id = frame.client_id;
        let request_id = frame.request_id;
        tokio::spawn(async move {
            let result = read_field(store, &request.location).await;
            match result {
                Ok(bytes) => {
                    for chunk in bytes.chunks(BLOB_CHUNK) {
                        let frame = Frame::data(
                            MessageKind::Blob,
                            client_id,
                            request_id,
                            Bytes::copy_from_slice(chunk),
                        );
                        if send_frame(&data_tx, frame).await.is_err() {
                            return;
                        }
                    }
                    let _ = send_frame(
                        &data_tx,
                        Frame::data(MessageKind::Complete, client_id, request_id, Bytes::new()),
                    )
                    .await;
                }
                Err(e) => {
                    let _ = send_frame(
                        &data_tx,
                        Frame {
                            kind: MessageKind::Error,
                            control: false,
                            client_id,
                            request_id,
                            payload: Bytes::from(e.to_string()),
                        },
                    )
                    .await;
                }
            }
        });
        Ok(())
    }

    /// Streams list elements back on the data channel.
    async fn on_list(&mut self, frame: Frame) -> Result<(), RemoteError> {
        let request: ListRequest = decode_payload(&frame.payload)?;
        let engine = match self.engine() {
            Ok(engine) => engine,
            Err(e) => return self.reply_error(&frame, &e.to_string()).await,
        };
        let data_tx = self.data_tx.clone();
        let client_id = frame.client_id;
        let request_id = frame.request_id;
        tokio::spawn(async move {
            match engine.list(&request.request, request.dedup).await {
                Ok(elements) => {
                    for element in elements {
                        let frame = Frame::data(
                            MessageKind::Blob,
                            client_id,
                            request_id,
                            Bytes::from(element.encode_to_vec()),
                        );
                        if send_frame(&data_tx, frame).await.is_err() {
                            return;
                        }
                    }
                    let _ = send_frame(
                        &data_tx,
                        Frame::data(MessageKind::Complete, client_id, request_id, Bytes::new()),
                    )
                    .await;
                }
                Err(e) => {
                    let _ = send_frame(
                        &data_tx,
                        Frame {
                            kind: MessageKind::Error,
                            control: false,
                            client_id,
                            request_id,
                            payload: Bytes::from(e.to_string()),
                        },
                    )
                    .await;
                }
            }
        });
        Ok(())
    }

    async fn on_report(&mut self, frame: Frame) -> Result<(), RemoteError> {
        let request: ListRequest = decode_payload(&frame.payload)?;
        let engine = match self.engine() {
            Ok(engine) => engine,
            Err(e) => return self.reply_error(&frame, &e.to_string()).await,
        };
        let text = match frame.kind {
            MessageKind::Dump => engine.dump(&request.request).await.map_err(|e| e.to_string()),
            MessageKind::Stats => engine
                .stats(&request.request)
                .await
                .map(|s| {
                    format!(
                        "databases: {}\nindexes: {}\nfields: {}\nfield bytes: {}\n",
                        s.databases, s.indexes, s.fields, s.field_bytes
                    )
                })
                .map_err(|e| e.to_string()),
            _ => engine
                .status(&request.request)
                .await
                .map(|s| {
                    s.databases
                        .iter()
                        .map(|(db, disabled)| format!("{db}: {disabled}\n"))
                        .collect::<String>()
                })
                .map_err(|e| e.to_string()),
        };
        match text {
            Ok(text) => self.reply(&frame, MessageKind::Blob, Bytes::from(text)).await,
            Err(msg) => self.reply_error(&frame, &msg).await,
        }
    }

    async fn on_wipe(&mut self, frame: Frame) -> Result<(), RemoteError> {
        let request: WipeRequest = decode_payload(&frame.payload)?;
        let mut engine = match self.engine() {
            Ok(engine) => engine,
            Err(e) => return self.reply_error(&frame, &e.to_string()).await,
        };
        match engine
            .wipe(&request.request, request.doit, request.unsafe_wipe_all)
            .await
        {
            Ok(results) => {
                let mut text = String::new();
                for (db_key, plan) in results {
                    text.push_str(&format!(
                        "{db_key}: delete {} unit(s), keep {} safe, mask {} epoch(s), rewrite {}, full={}\n",
                        plan.delete_units.len(),
                        plan.safe_units.len(),
                        plan.mask_entries.len(),
                        plan.rewrite_epochs.len(),
                        plan.full,
                    ));
                }
                self.reply(&frame, MessageKind::Blob, Bytes::from(text)).await
            }
            Err(e) => self.reply_error(&frame, &e.to_string()).await,
        }
    }

    async fn on_purge(&mut self, frame: Frame) -> Result<(), RemoteError> {
        let request: PurgeRequest = decode_payload(&frame.payload)?;
        let mut engine = match self.engine() {
            Ok(engine) => engine,
            Err(e) => return self.reply_error(&frame, &e.to_string()).await,
        };
        match engine.purge(&request.request, request.doit).await {
            Ok(report) => {
                let text = format!(
                    "duplicate fields: {}\nmaskable epochs: {}\nremovable units: {}\n",
                    report.duplicate_fields,
                    report.maskable.len(),
                    report.removable_units.len()
                );
                self.reply(&frame, MessageKind::Blob, Bytes::from(text)).await
            }
            Err(e) => self.reply_error(&frame, &e.to_string()).await,
        }
    }

    async fn on_control(&mut self, frame: Frame) -> Result<(), RemoteError> {
        let request: ControlRequest = decode_payload(&frame.payload)?;
        let mut engine = match self.engine() {
            Ok(engine) => engine,
            Err(e) => return self.reply_error(&frame, &e.to_string()).await,
        };
        let action = if request.enable {
            ControlAction::Enable
        } else {
            ControlAction::Disable
        };
        let identifiers: Vec<ControlIdentifier> = ControlIdentifier::ALL
            .into_iter()
            .filter(|id| request.identifiers & (1 << (*id as u8)) != 0)
            .collect();
        match engine.control(&request.request, action, &identifiers).await {
            Ok(()) => self.reply(&frame, MessageKind::Complete, Bytes::new()).await,
            Err(e) => self.reply_error(&frame, &e.to_string()).await,
        }
    }

    async fn on_stop(&mut self, frame: Frame) -> Result<(), RemoteError> {
        if let Some(client) = self.store_clients.remove(&frame.client_id) {
            if let Err(e) = client.store.close().await {
                return self.reply_error(&frame, &e.to_string()).await;
            }
        }
        if let Some(mut client) = self.cat_clients.remove(&frame.client_id) {
            if let Some(writer) = client.writer.as_mut() {
                if let Err(e) = writer.close().await {
                    return self.reply_error(&frame, &e.to_string()).await;
                }
            }
        }
        self.reply(&frame, MessageKind::Received, Bytes::new()).await
    }

    /// Releases every per-client resource when the connection ends.
    async fn shutdown(&mut self) {
        for (_, mut client) in self.cat_clients.drain() {
            if let Some(writer) = client.writer.as_mut() {
                if let Err(e) = writer.close().await {
                    warn!(db = %client.db_key, error = %e, "failed to close catalogue on disconnect");
                }
            }
        }
        for (_, client) in self.store_clients.drain() {
            if let Err(e) = client.store.close().await {
                warn!(db = %client.db_key, error = %e, "failed to close store on disconnect");
            }
        }
    }
}

async fn read_field(
    store: Arc<dyn Store>,
    location: &FieldLocation,
) -> Result<Bytes, RemoteError> {
    let handle = store.retrieve(location).await.map_err(to_remote_store)?;
    handle.read_all().await.map_err(to_remote_store)
}

fn to_remote(err: impl std::fmt::Display) -> RemoteError {
    RemoteError::Remote(err.to_string())
}

fn to_remote_store(err: sfdb_store::StoreError) -> RemoteError {
    RemoteError::Remote(err.to_string())
}
