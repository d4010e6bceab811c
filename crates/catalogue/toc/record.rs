use crate::error::CatalogueError;
use crate::version::check_readable;
use bytes::BufMut;
use sfdb_codec::{
    structs::{Decoder, Encoder},
    CodecError, SfdbDecode, SfdbEncode,
};
use sfdb_common::{ControlIdentifiers, Key, SfdbUri};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;

pub const TOC_START_MARKER: [u8; 4] = *b"STOC";
pub const TOC_END_MARKER: [u8; 4] = *b"ETOC";

/// Records are zero-padded to this stride so a TOC file can be walked
/// without decoding payloads. Power of two, shared by every implementation.
pub const TOC_RECORD_ALIGN: usize = 1024;

/// Start marker + version + kind + payload length.
const HEADER_LEN: usize = 4 + 2 + 2 + 4;
/// CRC over the payload, placed directly after it.
const CRC_LEN: usize = 4;
/// Nothing in a TOC payload legitimately approaches this.
const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Per-keyword value sets observed by one index epoch.
pub type AxesSnapshot = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TocRecordKind {
    Init = 1,
    Index = 2,
    Clear = 3,
    SubToc = 4,
    SubTocClear = 5,
    ClearAll = 6,
    Control = 7,
}

impl TocRecordKind {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Init),
            2 => Some(Self::Index),
            3 => Some(Self::Clear),
            4 => Some(Self::SubToc),
            5 => Some(Self::SubTocClear),
            6 => Some(Self::ClearAll),
            7 => Some(Self::Control),
            _ => None,
        }
    }
}

/// Payload of one TOC record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TocPayload {
    /// First record of any TOC: identifies the database and the schema the
    /// data is written against.
    Init {
        db_key: Key,
        schema_digest: u32,
        writer_pid: u32,
    },
    /// Publishes one flushed index epoch.
    Index {
        index_key: Key,
        /// Path of the index file, relative to the DB directory.
        path: String,
        /// Offset of the epoch blob within the index file.
        offset: u64,
        axes: AxesSnapshot,
        timestamp: i64,
    },
    /// Masks the INDEX record referencing the same `(path, offset)`.
    Clear { path: String, offset: u64 },
    /// Mounts another database's TOC.
    SubToc { uri: SfdbUri },
    /// Unmounts a previously mounted TOC.
    SubTocClear { uri: SfdbUri },
    /// Masks every record strictly before this one.
    ClearAll,
    /// Updates the set of disabled operations.
    Control { disabled: ControlIdentifiers },
}

impl TocPayload {
    pub fn kind(&self) -> TocRecordKind {
        match self {
            Self::Init { .. } => TocRecordKind::Init,
            Self::Index { .. } => TocRecordKind::Index,
            Self::Clear { .. } => TocRecordKind::Clear,
            Self::SubToc { .. } => TocRecordKind::SubToc,
            Self::SubTocClear { .. } => TocRecordKind::SubTocClear,
            Self::ClearAll => TocRecordKind::ClearAll,
            Self::Control { .. } => TocRecordKind::Control,
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Init {
                db_key,
                schema_digest,
                writer_pid,
            } => {
                Encoder::new(&mut buf)
                    .encode_field(db_key)
                    .encode_field(schema_digest)
                    .encode_field(writer_pid)
                    .finish();
            }
            Self::Index {
                index_key,
                path,
                offset,
                axes,
                timestamp,
            } => {
                Encoder::new(&mut buf)
                    .encode_field(index_key)
                    .encode_field(path)
                    .encode_field(offset)
                    .encode_field(axes)
                    .encode_field(timestamp)
                    .finish();
            }
            Self::Clear { path, offset } => {
                Encoder::new(&mut buf)
                    .encode_field(path)
                    .encode_field(offset)
                    .finish();
            }
            Self::SubToc { uri } | Self::SubTocClear { uri } => {
                Encoder::new(&mut buf).encode_field(uri).finish();
            }
            Self::ClearAll => {}
            Self::Control { disabled } => {
                Encoder::new(&mut buf).encode_field(disabled).finish();
            }
        }
        buf
    }

    fn decode_body(kind: TocRecordKind, payload: &[u8]) -> Result<Self, CodecError> {
        match kind {
            TocRecordKind::Init => {
                let decoder = Decoder::new(payload);
                let (db_key, decoder) = decoder.decode_field::<Key>("db_key")?;
                let (schema_digest, decoder) = decoder.decode_field::<u32>("schema_digest")?;
                let (writer_pid, _) = decoder.decode_field::<u32>("writer_pid")?;
                Ok(Self::Init {
                    db_key,
                    schema_digest,
                    writer_pid,
                })
            }
            TocRecordKind::Index => {
                let decoder = Decoder::new(payload);
                let (index_key, decoder) = decoder.decode_field::<Key>("index_key")?;
                let (path, decoder) = decoder.decode_field::<String>("path")?;
                let (offset, decoder) = decoder.decode_field::<u64>("offset")?;
                let (axes, decoder) = decoder.decode_field::<AxesSnapshot>("axes")?;
                let (timestamp, _) = decoder.decode_field::<i64>("timestamp")?;
                Ok(Self::Index {
                    index_key,
                    path,
                    offset,
                    axes,
                    timestamp,
                })
            }
            TocRecordKind::Clear => {
                let decoder = Decoder::new(payload);
                let (path, decoder) = decoder.decode_field::<String>("path")?;
                let (offset, _) = decoder.decode_field::<u64>("offset")?;
                Ok(Self::Clear { path, offset })
            }
            TocRecordKind::SubToc => {
                let (uri, _) = Decoder::new(payload).decode_field::<SfdbUri>("uri")?;
                Ok(Self::SubToc { uri })
            }
            TocRecordKind::SubTocClear => {
                let (uri, _) = Decoder::new(payload).decode_field::<SfdbUri>("uri")?;
                Ok(Self::SubTocClear { uri })
            }
            TocRecordKind::ClearAll => Ok(Self::ClearAll),
            TocRecordKind::Control => {
                let (disabled, _) =
                    Decoder::new(payload).decode_field::<ControlIdentifiers>("disabled")?;
                Ok(Self::Control { disabled })
            }
        }
    }
}

/// One on-disk TOC record:
///
/// ```text
/// STOC | version:u16 | kind:u16 | payload_len:u32 | payload | crc32 | 0-pad | ETOC
/// ```
///
/// The whole record is padded to [`TOC_RECORD_ALIGN`] bytes (end marker in
/// the final four), so readers advance by a computable stride.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocRecord {
    pub version: u16,
    pub payload: TocPayload,
}

impl TocRecord {
    pub fn new(version: u16, payload: TocPayload) -> Self {
        Self { version, payload }
    }

    /// Total on-disk size of a record with the given payload size.
    pub fn padded_len(payload_len: usize) -> usize {
        (HEADER_LEN + payload_len + CRC_LEN + TOC_END_MARKER.len())
            .next_multiple_of(TOC_RECORD_ALIGN)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let payload = self.payload.encode_body();
        let total = Self::padded_len(payload.len());
        let mut buf = Vec::with_capacity(total);
        buf.put_slice(&TOC_START_MARKER);
        buf.put_u16(self.version);
        buf.put_u16(self.payload.kind() as u16);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);
        buf.put_u32(crc32fast::hash(&payload));
        buf.resize(total - TOC_END_MARKER.len(), 0);
        buf.put_slice(&TOC_END_MARKER);
        buf
    }

    /// Reads the next record off `reader`. Returns `Ok(None)` at a clean
    /// end of file; anything else that falls short is corruption.
    pub fn read_from(reader: &mut impl Read) -> Result<Option<Self>, CatalogueError> {
        let mut header = [0_u8; HEADER_LEN];
        match read_exact_or_eof(reader, &mut header)? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Full => {}
            ReadOutcome::Partial(read) => {
                return Err(CatalogueError::TocCorrupt(format!(
                    "truncated record header ({read} of {HEADER_LEN} bytes)"
                )))
            }
        }

        if header[..4] != TOC_START_MARKER {
            return Err(CatalogueError::TocCorrupt(
                "missing record start marker".into(),
            ));
        }
        let version = u16::from_be_bytes([header[4], header[5]]);
        check_readable(version)?;
        let kind_raw = u16::from_be_bytes([header[6], header[7]]);
        let kind = TocRecordKind::from_u16(kind_raw)
            .ok_or_else(|| CatalogueError::TocCorrupt(format!("unknown record kind {kind_raw}")))?;
        let payload_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        if payload_len > MAX_PAYLOAD {
            return Err(CatalogueError::TocCorrupt(format!(
                "implausible payload size {payload_len}"
            )));
        }

        let total = Self::padded_len(payload_len);
        let mut rest = vec![0_u8; total - HEADER_LEN];
        reader.read_exact(&mut rest).map_err(|_| {
            CatalogueError::TocCorrupt("record truncated before end marker".into())
        })?;

        let payload = &rest[..payload_len];
        let crc_bytes: [u8; 4] = rest[payload_len..payload_len + CRC_LEN]
            .try_into()
            .map_err(|_| CatalogueError::TocCorrupt("record CRC missing".into()))?;
        if u32::from_be_bytes(crc_bytes) != crc32fast::hash(payload) {
            return Err(CatalogueError::TocCorrupt("payload CRC mismatch".into()));
        }
        if rest[rest.len() - TOC_END_MARKER.len()..] != TOC_END_MARKER {
            return Err(CatalogueError::TocCorrupt(
                "missing record end marker".into(),
            ));
        }

        let payload = TocPayload::decode_body(kind, payload)?;
        Ok(Some(Self { version, payload }))
    }
}

enum ReadOutcome {
    Full,
    Partial(usize),
    Eof,
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 if filled == 0 => return Ok(ReadOutcome::Eof),
            0 => return Ok(ReadOutcome::Partial(filled)),
            n => filled += n,
        }
    }
    Ok(ReadOutcome::Full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::LATEST_VERSION;
    use std::io::Cursor;

    fn sample_records() -> Vec<TocRecord> {
        let db_key = Key::from_pairs([("class", "od"), ("stream", "oper"), ("date", "20260801")]);
        let mut axes = AxesSnapshot::new();
        axes.insert("step".into(), BTreeSet::from(["0".into(), "6".into()]));
        vec![
            TocRecord::new(
                LATEST_VERSION,
                TocPayload::Init {
                    db_key,
                    schema_digest: 0xCAFE,
                    writer_pid: 4242,
                },
            ),
            TocRecord::new(
                LATEST_VERSION,
                TocPayload::Index {
                    index_key: Key::from_pairs([("type", "fc"), ("levtype", "sfc")]),
                    path: "fc,sfc.0001.index".into(),
                    offset: 0,
                    axes,
                    timestamp: 1_754_000_000,
                },
            ),
            TocRecord::new(
                LATEST_VERSION,
                TocPayload::Clear {
                    path: "fc,sfc.0001.index".into(),
                    offset: 0,
                },
            ),
            TocRecord::new(
                LATEST_VERSION,
                TocPayload::SubToc {
                    uri: SfdbUri::parse("file:/data/fdb/other/toc").expect("uri"),
                },
            ),
            TocRecord::new(LATEST_VERSION, TocPayload::ClearAll),
            TocRecord::new(
                LATEST_VERSION,
                TocPayload::Control {
                    disabled: ControlIdentifiers::of([sfdb_common::ControlIdentifier::Wipe]),
                },
            ),
        ]
    }

    #[test]
    fn records_are_aligned_and_round_trip() {
        for record in sample_records() {
            let bytes = record.to_bytes();
            assert_eq!(bytes.len() % TOC_RECORD_ALIGN, 0);
            assert_eq!(&bytes[..4], &TOC_START_MARKER);
            assert_eq!(&bytes[bytes.len() - 4..], &TOC_END_MARKER);

            let mut cursor = Cursor::new(bytes);
            let read = TocRecord::read_from(&mut cursor)
                .expect("read")
                .expect("record");
            assert_eq!(read, record);
        }
    }

    #[test]
    fn a_stream_of_records_is_navigable() {
        let mut stream = Vec::new();
        for record in sample_records() {
            stream.extend_from_slice(&record.to_bytes());
        }
        let mut cursor = Cursor::new(stream);
        let mut count = 0;
        while let Some(_record) = TocRecord::read_from(&mut cursor).expect("read") {
            count += 1;
        }
        assert_eq!(count, sample_records().len());
    }

    #[test]
    fn corrupt_marker_is_detected() {
        let mut bytes = sample_records()[0].to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            TocRecord::read_from(&mut Cursor::new(bytes)),
            Err(CatalogueError::TocCorrupt(_))
        ));
    }

    #[test]
    fn flipped_payload_bit_fails_crc() {
        let mut bytes = sample_records()[1].to_bytes();
        bytes[HEADER_LEN + 3] ^= 0x40;
        assert!(matches!(
            TocRecord::read_from(&mut Cursor::new(bytes)),
            Err(CatalogueError::TocCorrupt(msg)) if msg.contains("CRC")
        ));
    }

    #[test]
    fn future_version_is_refused() {
        let mut bytes = sample_records()[0].to_bytes();
        bytes[4] = 0xff;
        assert!(matches!(
            TocRecord::read_from(&mut Cursor::new(bytes)),
            Err(CatalogueError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn truncated_record_is_corruption() {
        let bytes = sample_records()[0].to_bytes();
        let cut = &bytes[..bytes.len() / 2];
        assert!(matches!(
            TocRecord::read_from(&mut Cursor::new(cut.to_vec())),
            Err(CatalogueError::TocCorrupt(_))
        ));
    }
}
