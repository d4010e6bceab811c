use sfdb_codec::CodecError;
use sfdb_common::FdbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("connection closed by peer")]
    Disconnected,
    #[error("{msg} [endpoint={endpoint}]")]
    Transport { endpoint: String, msg: String },
    #[error("session mismatch: {0}")]
    SessionMismatch(String),
    #[error("protocol version {found} not supported (ours is {ours})")]
    ProtocolVersion { found: u16, ours: u16 },
    #[error("malformed frame: {0}")]
    BadFrame(String),
    #[error("unexpected message {kind} for request {request_id}")]
    UnexpectedMessage { kind: String, request_id: u32 },
    #[error("remote error: {0}")]
    Remote(String),
    #[error("read limiter cannot ever admit {requested} bytes (budget {budget})")]
    OverBudget { requested: u64, budget: u64 },
    #[error("no free data port in the configured range")]
    PortsExhausted,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    pub fn transport(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            msg: msg.into(),
        }
    }
}

impl From<RemoteError> for FdbError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Disconnected => FdbError::transport("<closed>", "connection closed"),
            RemoteError::Transport { endpoint, msg } => FdbError::Transport { endpoint, msg },
            RemoteError::SessionMismatch(msg) => FdbError::Consistency(msg),
            RemoteError::ProtocolVersion { .. } => FdbError::Consistency(err.to_string()),
            RemoteError::BadFrame(msg) => FdbError::Corruption(msg),
            RemoteError::UnexpectedMessage { .. } => FdbError::Consistency(err.to_string()),
            RemoteError::Remote(msg) => FdbError::Transport {
                endpoint: "<remote>".into(),
                msg,
            },
            RemoteError::OverBudget { .. } | RemoteError::PortsExhausted => {
                FdbError::Capacity(err.to_string())
            }
            RemoteError::Codec(e) => FdbError::Codec(e),
            RemoteError::Io(e) => FdbError::Io(e),
        }
    }
}
