use crate::error::RemoteError;
use crate::messages::{
    decode_payload, encode_payload, ClientStartup, DataStartup, Frame, FrameCodec, MessageKind,
    ServerStartup, SessionId,
};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use sfdb_common::Config;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_BACKOFF: Duration = Duration::from_millis(500);

type Sink = SplitSink<Framed<TcpStream, FrameCodec>, Frame>;
type Stream = SplitStream<Framed<TcpStream, FrameCodec>>;

/// Demultiplexing state shared with the listener tasks.
#[derive(Default)]
struct Routing {
    /// One-shot RPC responses, by request id.
    promises: HashMap<u32, oneshot::Sender<Result<Bytes, RemoteError>>>,
    /// Streamed responses (list, read), by request id.
    streams: HashMap<u32, mpsc::Sender<Result<Frame, RemoteError>>>,
}

/// A control+data connection pair to one server, shared by every client
/// (catalogue or store proxy) talking to that endpoint.
///
/// A listener task per socket routes incoming frames to the issuing
/// request's promise or stream queue; outgoing bulk frames go through a
/// bounded write queue so archival applies backpressure instead of
/// buffering without limit.
pub struct ClientConnection {
    endpoint: String,
    session: SessionId,
    server_session: SessionId,
    single: bool,
    control_tx: tokio::sync::Mutex<Sink>,
    data_queue: mpsc::Sender<Frame>,
    routing: Arc<Mutex<Routing>>,
    next_id: AtomicU32,
    closed: AtomicBool,
}

impl ClientConnection {
    /// Dials the control endpoint, performs the session handshake, and (in
    /// dual-connection mode) opens and verifies the data connection.
    pub async fn connect(endpoint: &str, config: &Config) -> Result<Arc<Self>, RemoteError> {
        let session = SessionId::random();
        let control = dial(endpoint).await?;
        let mut control = Framed::new(control, FrameCodec);

        let startup = ClientStartup {
            session,
            control_endpoint: endpoint.to_string(),
            protocol_version: crate::messages::protocol_version(),
            prefer_single_connection: config.single_connection,
        };
        control
            .send(Frame::control(
                MessageKind::Startup,
                0,
                0,
                encode_payload(&startup),
            ))
            .await?;

        let response = control
            .next()
            .await
            .ok_or(RemoteError::Disconnected)??;
        if response.kind != MessageKind::Startup {
            return Err(RemoteError::UnexpectedMessage {
                kind: response.kind.to_string(),
                request_id: response.request_id,
            });
        }
        let server: ServerStartup = decode_payload(&response.payload)?;
        if server.client_session != session {
            return Err(RemoteError::SessionMismatch(format!(
                "server echoed session {} instead of {}",
                server.client_session, session
            )));
        }
        debug!(
            endpoint,
            session = %session,
            server_session = %server.server_session,
            single = server.single_connection,
            "connected"
        );

        let routing: Arc<Mutex<Routing>> = Arc::new(Mutex::new(Routing::default()));
        let (control_tx, control_rx) = control.split();

        let (data_queue_tx, data_queue_rx) = mpsc::channel(config.archive_queue_length());

        let connection = if server.single_connection {
            Arc::new(Self {
                endpoint: endpoint.to_string(),
                session,
                server_session: server.server_session,
                single: true,
                control_tx: tokio::sync::Mutex::new(control_tx),
                data_queue: data_queue_tx,
                routing,
                next_id: AtomicU32::new(1),
                closed: AtomicBool::new(false),
            })
        } else {
            // Dual mode: dial the advertised data endpoint and bind it to
            // the session by echoing both identifiers.
            let data = dial(&server.data_endpoint).await?;
            let mut data = Framed::new(data, FrameCodec);
            data.send(Frame::data(
                MessageKind::Startup,
                0,
                0,
                encode_payload(&DataStartup {
                    client_session: session,
                    server_session: server.server_session,
                }),
            ))
            .await?;
            let (data_tx, data_rx) = data.split();

            let connection = Arc::new(Self {
                endpoint: endpoint.to_string(),
                session,
                server_session: server.server_session,
                single: false,
                control_tx: tokio::sync::Mutex::new(control_tx),
                data_queue: data_queue_tx,
                routing,
                next_id: AtomicU32::new(1),
                closed: AtomicBool::new(false),
            });
            tokio::spawn(listen(connection.clone(), data_rx, "data"));
            tokio::spawn(data_writer(connection.clone(), data_queue_rx, Some(data_tx)));
            tokio::spawn(listen(connection.clone(), control_rx, "control"));
            return Ok(connection);
        };

        tokio::spawn(listen(connection.clone(), control_rx, "control"));
        tokio::spawn(data_writer(connection.clone(), data_queue_rx, None));
        Ok(connection)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn server_session(&self) -> SessionId {
        self.server_session
    }

    /// True when both streams share one socket.
    pub fn is_single(&self) -> bool {
        self.single
    }

    /// Ids are never reused within a connection; client ids and request
    /// ids draw from the same sequence.
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn write_control(&self, frame: Frame) -> Result<(), RemoteError> {
        let mut sink = self.control_tx.lock().await;
        sink.send(frame).await
    }

    /// RPC: one request frame on the control channel, one response frame
    /// routed back by the listener.
    pub async fn rpc(
        &self,
        kind: MessageKind,
        client_id: u32,
        payload: Bytes,
    ) -> Result<Bytes, RemoteError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RemoteError::Disconnected);
        }
        let request_id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.lock_routing()?.promises.insert(request_id, tx);

        self.write_control(Frame::control(kind, client_id, request_id, payload))
            .await?;
        rx.await.map_err(|_| RemoteError::Disconnected)?
    }

    /// Streamed request: frames tagged with the returned request id are
    /// pushed to the receiver, terminated by `Complete` or `Error`.
    pub async fn rpc_stream(
        &self,
        kind: MessageKind,
        client_id: u32,
        payload: Bytes,
        queue_depth: usize,
    ) -> Result<(u32, mpsc::Receiver<Result<Frame, RemoteError>>), RemoteError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RemoteError::Disconnected);
        }
        let request_id = self.next_id();
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        self.lock_routing()?.streams.insert(request_id, tx);

        self.write_control(Frame::control(kind, client_id, request_id, payload))
            .await?;
        Ok((request_id, rx))
    }

    /// Enqueues a bulk frame for the data channel; blocks when the queue
    /// is at capacity.
    pub async fn send_data(&self, frame: Frame) -> Result<(), RemoteError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RemoteError::Disconnected);
        }
        self.data_queue
            .send(frame)
            .await
            .map_err(|_| RemoteError::Disconnected)
    }

    fn lock_routing(&self) -> Result<std::sync::MutexGuard<'_, Routing>, RemoteError> {
        self.routing
            .lock()
            .map_err(|_| RemoteError::transport(&self.endpoint, "routing state poisoned"))
    }

    /// Severs the connection, failing every pending request with `cause`.
    fn invalidate(&self, cause: &RemoteError) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(mut routing) = self.routing.lock() else {
            return;
        };
        for (_, promise) in routing.promises.drain() {
            let _ = promise.send(Err(RemoteError::transport(
                &self.endpoint,
                cause.to_string(),
            )));
        }
        for (_, stream) in routing.streams.drain() {
            let _ = stream.try_send(Err(RemoteError::transport(
                &self.endpoint,
                cause.to_string(),
            )));
        }
    }

    /// Graceful shutdown: tells the server we are done and severs local
    /// state. Idempotent.
    pub async fn teardown(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let _ = self
            .write_control(Frame::control(MessageKind::Exit, 0, 0, Bytes::new()))
            .await;
        self.invalidate(&RemoteError::Disconnected);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

async fn dial(endpoint: &str) -> Result<TcpStream, RemoteError> {
    let mut last = None;
    for attempt in 0..CONNECT_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(CONNECT_BACKOFF * attempt).await;
        }
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last = Some(e.to_string()),
            Err(_) => last = Some("connect timed out".to_string()),
        }
    }
    Err(RemoteError::transport(
        endpoint,
        last.unwrap_or_else(|| "connect failed".to_string()),
    ))
}

/// Listener loop for one socket: routes frames by request id into the
/// issuing request's promise or stream, and propagates errors to every
/// consumer on teardown.
async fn listen(connection: Arc<ClientConnection>, mut stream: Stream, label: &'static str) {
    let cause = loop {
        let frame = match stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break e,
            None => break RemoteError::Disconnected,
        };

        if frame.kind == MessageKind::Exit {
            debug!(label, "listener stopping on exit");
            break RemoteError::Disconnected;
        }

        let result = match frame.kind {
            MessageKind::Error => Err(RemoteError::Remote(
                String::from_utf8_lossy(&frame.payload).into_owned(),
            )),
            _ => Ok(frame.clone()),
        };

        enum Route {
            Promise,
            Queue(mpsc::Sender<Result<Frame, RemoteError>>, Result<Frame, RemoteError>),
            None,
        }

        let route = {
            let Ok(mut routing) = connection.routing.lock() else {
                break RemoteError::transport(&connection.endpoint, "routing state poisoned");
            };
            if let Some(promise) = routing.promises.remove(&frame.request_id) {
                let _ = promise.send(result.map(|f| f.payload));
                Route::Promise
            } else if let Some(queue) = routing.streams.get(&frame.request_id).cloned() {
                let done = matches!(frame.kind, MessageKind::Complete | MessageKind::Error);
                if done {
                    routing.streams.remove(&frame.request_id);
                }
                Route::Queue(queue, result)
            } else {
                Route::None
            }
        };

        let routed = match route {
            Route::Promise => true,
            Route::Queue(queue, result) => {
                // Bounded: block the listener when the consumer lags, which
                // is exactly the back-pressure the queue exists for.
                let _ = queue.send(result).await;
                true
            }
            Route::None => false,
        };

        if !routed {
            warn!(
                label,
                kind = %frame.kind,
                request_id = frame.request_id,
                "dropping frame for unknown request"
            );
        }
    };

    connection.invalidate(&cause);
}

/// Writer loop draining the bounded data queue. In single-connection mode
/// frames are written to the control sink under its lock.
async fn data_writer(
    connection: Arc<ClientConnection>,
    mut queue: mpsc::Receiver<Frame>,
    mut sink: Option<Sink>,
) {
    while let Some(frame) = queue.recv().await {
        let result = match &mut sink {
            Some(sink) => sink.send(frame).await,
            None => connection.write_control(frame).await,
        };
        if let Err(e) = result {
            warn!(endpoint = %connection.endpoint, error = %e, "data write failed");
            connection.invalidate(&e);
            return;
        }
    }
}
