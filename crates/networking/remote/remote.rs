pub mod client;
pub mod error;
pub mod messages;
pub mod server;

pub use client::{
    ClientConnection, ClientConnectionRouter, ReadLimiter, RemoteCatalogue, RemoteFdb, RemoteStore,
};
pub use error::RemoteError;
pub use messages::{Frame, FrameCodec, MessageKind, SessionId, PROTOCOL_VERSION};
pub use server::{AvailablePortList, RunningServer, Server};
