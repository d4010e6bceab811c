use crate::error::RemoteError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sfdb_codec::{
    structs::{Decoder as FieldDecoder, Encoder as FieldEncoder},
    CodecError, SfdbDecode, SfdbEncode,
};
use sfdb_common::config::ENV_REMOTE_PROTOCOL_VERSION;
use sfdb_common::{Key, Request};
use sfdb_store::FieldLocation;
use std::fmt::Display;
use tokio_util::codec::{Decoder, Encoder};

pub const START_MARKER: [u8; 4] = *b"SFDB";
pub const END_MARKER: [u8; 4] = *b"EFDB";

/// First (and so far only) version of the wire protocol.
pub const PROTOCOL_VERSION: u16 = 1;

/// 4B marker + version + kind + client id + request id + payload length.
const HEADER_LEN: usize = 4 + 2 + 2 + 4 + 4 + 4;
const TRAILER_LEN: usize = END_MARKER.len();

/// Upper bound on a single frame payload; larger transfers are chunked
/// into Blob sequences by the sender.
pub const MAX_FRAME_PAYLOAD: usize = 512 * 1024 * 1024;

/// Preferred chunk size for streamed Blob payloads.
pub const BLOB_CHUNK: usize = 4 * 1024 * 1024;

/// The wire version in force, honouring `FDB_REMOTE_PROTOCOL_VERSION`.
pub fn protocol_version() -> u16 {
    std::env::var(ENV_REMOTE_PROTOCOL_VERSION)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|v| (1..=PROTOCOL_VERSION).contains(v))
        .unwrap_or(PROTOCOL_VERSION)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    None = 0,
    Startup = 1,
    Exit = 2,
    Error = 3,
    Received = 4,
    Complete = 5,
    Blob = 6,
    MultiBlob = 7,
    Flush = 8,
    Archive = 9,
    Retrieve = 10,
    List = 11,
    Dump = 12,
    Stats = 13,
    Status = 14,
    Wipe = 15,
    Purge = 16,
    Control = 17,
    Schema = 18,
    Stores = 19,
    Axes = 20,
    Exists = 21,
    Read = 22,
    Store = 23,
    Stop = 24,
}

impl MessageKind {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0 => Self::None,
            1 => Self::Startup,
            2 => Self::Exit,
            3 => Self::Error,
            4 => Self::Received,
            5 => Self::Complete,
            6 => Self::Blob,
            7 => Self::MultiBlob,
            8 => Self::Flush,
            9 => Self::Archive,
            10 => Self::Retrieve,
            11 => Self::List,
            12 => Self::Dump,
            13 => Self::Stats,
            14 => Self::Status,
            15 => Self::Wipe,
            16 => Self::Purge,
            17 => Self::Control,
            18 => Self::Schema,
            19 => Self::Stores,
            20 => Self::Axes,
            21 => Self::Exists,
            22 => Self::Read,
            23 => Self::Store,
            24 => Self::Stop,
            _ => return None,
        })
    }
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageKind::None => "None",
            MessageKind::Startup => "Startup",
            MessageKind::Exit => "Exit",
            MessageKind::Error => "Error",
            MessageKind::Received => "Received",
            MessageKind::Complete => "Complete",
            MessageKind::Blob => "Blob",
            MessageKind::MultiBlob => "MultiBlob",
            MessageKind::Flush => "Flush",
            MessageKind::Archive => "Archive",
            MessageKind::Retrieve => "Retrieve",
            MessageKind::List => "List",
            MessageKind::Dump => "Dump",
            MessageKind::Stats => "Stats",
            MessageKind::Status => "Status",
            MessageKind::Wipe => "Wipe",
            MessageKind::Purge => "Purge",
            MessageKind::Control => "Control",
            MessageKind::Schema => "Schema",
            MessageKind::Stores => "Stores",
            MessageKind::Axes => "Axes",
            MessageKind::Exists => "Exists",
            MessageKind::Read => "Read",
            MessageKind::Store => "Store",
            MessageKind::Stop => "Stop",
        };
        name.fmt(f)
    }
}

/// A 128-bit random session token, compared for equality only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub [u8; 16]);

impl SessionId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        hex::encode(self.0).fmt(f)
    }
}

impl SfdbEncode for SessionId {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.0.encode(buf);
    }
}

impl SfdbDecode for SessionId {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (bytes, rest) = <[u8; 16]>::decode_unfinished(buf)?;
        Ok((Self(bytes), rest))
    }
}

/// One wire frame. The client id's low bit distinguishes control from data
/// traffic when both are multiplexed on a single socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub control: bool,
    pub client_id: u32,
    pub request_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn control(kind: MessageKind, client_id: u32, request_id: u32, payload: Bytes) -> Self {
        Self {
            kind,
            control: true,
            client_id,
            request_id,
            payload,
        }
    }

    pub fn data(kind: MessageKind, client_id: u32, request_id: u32, payload: Bytes) -> Self {
        Self {
            kind,
            control: false,
            client_id,
            request_id,
            payload,
        }
    }

    pub fn error(client_id: u32, request_id: u32, msg: &str) -> Self {
        Self::control(
            MessageKind::Error,
            client_id,
            request_id,
            Bytes::copy_from_slice(msg.as_bytes()),
        )
    }
}

/// Framed codec for both connection halves.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = RemoteError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, RemoteError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        if src[..4] != START_MARKER {
            return Err(RemoteError::BadFrame("missing start marker".into()));
        }
        let version = u16::from_be_bytes([src[4], src[5]]);
        if version > PROTOCOL_VERSION {
            return Err(RemoteError::ProtocolVersion {
                found: version,
                ours: PROTOCOL_VERSION,
            });
        }
        let kind_raw = u16::from_be_bytes([src[6], src[7]]);
        let kind = MessageKind::from_u16(kind_raw)
            .ok_or_else(|| RemoteError::BadFrame(format!("unknown message kind {kind_raw}")))?;
        let client_word = u32::from_be_bytes([src[8], src[9], src[10], src[11]]);
        let request_id = u32::from_be_bytes([src[12], src[13], src[14], src[15]]);
        let payload_len = u32::from_be_bytes([src[16], src[17], src[18], src[19]]) as usize;
        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(RemoteError::BadFrame(format!(
                "payload of {payload_len} bytes exceeds the frame limit"
            )));
        }

        let total = HEADER_LEN + payload_len + TRAILER_LEN;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(payload_len).freeze();
        let trailer = src.split_to(TRAILER_LEN);
        if trailer[..] != END_MARKER {
            return Err(RemoteError::BadFrame("missing end marker".into()));
        }

        Ok(Some(Frame {
            kind,
            control: client_word & 1 == 1,
            client_id: client_word >> 1,
            request_id,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = RemoteError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), RemoteError> {
        if frame.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(RemoteError::BadFrame(format!(
                "payload of {} bytes exceeds the frame limit",
                frame.payload.len()
            )));
        }
        dst.reserve(HEADER_LEN + frame.payload.len() + TRAILER_LEN);
        dst.put_slice(&START_MARKER);
        dst.put_u16(protocol_version());
        dst.put_u16(frame.kind as u16);
        dst.put_u32(frame.client_id << 1 | frame.control as u32);
        dst.put_u32(frame.request_id);
        dst.put_u32(frame.payload.len() as u32);
        dst.put_slice(&frame.payload);
        dst.put_slice(&END_MARKER);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Handshake and request payloads
// ---------------------------------------------------------------------------

macro_rules! impl_payload {
    ($name:ident { $($field:ident : $ty:ty),+ $(,)? }) => {
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            $(pub $field: $ty),+
        }

        impl SfdbEncode for $name {
            fn encode(&self, buf: &mut dyn BufMut) {
                FieldEncoder::new(buf)
                    $(.encode_field(&self.$field))+
                    .finish();
            }
        }

        impl SfdbDecode for $name {
            fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
                let decoder = FieldDecoder::new(buf);
                $(let ($field, decoder) = decoder.decode_field::<$ty>(stringify!($field))?;)+
                Ok((Self { $($field),+ }, decoder.finish()))
            }
        }
    };
}

impl_payload!(ClientStartup {
    session: SessionId,
    control_endpoint: String,
    protocol_version: u16,
    prefer_single_connection: bool,
});

impl_payload!(ServerStartup {
    client_session: SessionId,
    server_session: SessionId,
    data_endpoint: String,
    single_connection: bool,
});

impl_payload!(DataStartup {
    client_session: SessionId,
    server_session: SessionId,
});

/// Registers a catalogue or store client for one database.
impl_payload!(RegisterClient {
    db_key: Key,
});

/// One archived field on the store stream.
impl_payload!(ArchiveBlob {
    sequence: u64,
    index_key: Key,
    data: Bytes,
});

/// One catalogue entry on the catalogue stream.
impl_payload!(CatalogueArchive {
    index_key: Key,
    datum_key: Key,
    location: FieldLocation,
});

impl_payload!(FlushRequest {
    expected: u64,
});

/// Store flush acknowledgement: the locations, in archive sequence order.
impl_payload!(FlushLocations {
    locations: Vec<(u64, FieldLocation)>,
});

impl_payload!(RetrieveRequest {
    index_key: Key,
    datum_key: Key,
});

impl_payload!(RetrieveResponse {
    location: Option<FieldLocation>,
});

impl_payload!(ReadRequest {
    location: FieldLocation,
});

impl_payload!(ListRequest {
    request: Request,
    dedup: bool,
});

impl_payload!(AxesRequest {
    index_key: Key,
    keyword: String,
});

impl_payload!(AxesResponse {
    values: Option<Vec<String>>,
});

impl_payload!(ExistsResponse {
    exists: bool,
    disabled: sfdb_common::ControlIdentifiers,
});

impl_payload!(WipeRequest {
    request: Request,
    doit: bool,
    unsafe_wipe_all: bool,
});

impl_payload!(PurgeRequest {
    request: Request,
    doit: bool,
});

impl_payload!(ControlRequest {
    request: Request,
    enable: bool,
    identifiers: u64,
});

pub fn encode_payload<T: SfdbEncode>(value: &T) -> Bytes {
    Bytes::from(value.encode_to_vec())
}

pub fn decode_payload<T: SfdbDecode>(payload: &[u8]) -> Result<T, RemoteError> {
    Ok(T::decode(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_codec_round_trip() {
        let mut codec = FrameCodec;
        let frame = Frame::control(
            MessageKind::Retrieve,
            7,
            42,
            Bytes::from_static(b"payload"),
        );
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).expect("encode");
        let decoded = codec.decode(&mut buf).expect("decode").expect("frame");
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut codec = FrameCodec;
        let frame = Frame::data(MessageKind::Blob, 1, 2, Bytes::from_static(b"0123456789"));
        let mut full = BytesMut::new();
        codec.encode(frame.clone(), &mut full).expect("encode");

        let mut partial = BytesMut::from(&full[..HEADER_LEN + 3]);
        assert!(codec.decode(&mut partial).expect("decode").is_none());
        partial.extend_from_slice(&full[HEADER_LEN + 3..]);
        assert_eq!(codec.decode(&mut partial).expect("decode"), Some(frame));
    }

    #[test]
    fn control_bit_travels_in_the_client_word() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame::data(MessageKind::Blob, 5, 1, Bytes::new()),
                &mut buf,
            )
            .expect("encode");
        let decoded = codec.decode(&mut buf).expect("decode").expect("frame");
        assert!(!decoded.control);
        assert_eq!(decoded.client_id, 5);
    }

    #[test]
    fn bad_marker_is_rejected() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::control(MessageKind::Exit, 0, 0, Bytes::new()), &mut buf)
            .expect("encode");
        buf[0] = b'X';
        assert!(matches!(
            codec.decode(&mut buf),
            Err(RemoteError::BadFrame(_))
        ));
    }

    #[test]
    fn newer_protocol_version_is_rejected() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::control(MessageKind::Exit, 0, 0, Bytes::new()), &mut buf)
            .expect("encode");
        buf[4] = 0xff;
        assert!(matches!(
            codec.decode(&mut buf),
            Err(RemoteError::ProtocolVersion { .. })
        ));
    }

    #[test]
    fn handshake_payloads_round_trip() {
        let startup = ClientStartup {
            session: SessionId::random(),
            control_endpoint: "localhost:7654".into(),
            protocol_version: PROTOCOL_VERSION,
            prefer_single_connection: false,
        };
        let decoded: ClientStartup =
            decode_payload(&encode_payload(&startup)).expect("decode");
        assert_eq!(decoded, startup);
    }

    #[test]
    fn session_ids_are_distinct() {
        assert_ne!(SessionId::random(), SessionId::random());
    }
}
