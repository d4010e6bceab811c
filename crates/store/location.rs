use bytes::BufMut;
use sfdb_codec::{
    structs::{Decoder, Encoder},
    CodecError, SfdbDecode, SfdbEncode,
};
use sfdb_common::{Key, SfdbUri};
use std::fmt::Display;

// Back-end type tags. New back-ends take the next free value; decoders that
// do not recognise a tag keep the payload as `Opaque` so the location can
// still be re-forwarded.
const TAG_FILE: u8 = 1;
const TAG_DAOS_ARRAY: u8 = 2;
const TAG_FAM_OBJECT: u8 = 3;
const TAG_S3_OBJECT: u8 = 4;
const TAG_RADOS_OBJECT: u8 = 5;
const TAG_REMOTE: u8 = 6;

/// The span of bytes a location points at, common to every back-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpan {
    pub uri: SfdbUri,
    pub offset: u64,
    pub length: u64,
    pub remap_key: Option<Key>,
}

impl FieldSpan {
    pub fn new(uri: SfdbUri, offset: u64, length: u64) -> Self {
        Self {
            uri,
            offset,
            length,
            remap_key: None,
        }
    }

    pub fn with_remap(mut self, remap_key: Key) -> Self {
        self.remap_key = Some(remap_key);
        self
    }
}

impl SfdbEncode for FieldSpan {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.uri)
            .encode_field(&self.offset)
            .encode_field(&self.length)
            .encode_field(&self.remap_key)
            .finish();
    }
}

impl SfdbDecode for FieldSpan {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let decoder = Decoder::new(buf);
        let (uri, decoder) = decoder.decode_field::<SfdbUri>("uri")?;
        let (offset, decoder) = decoder.decode_field::<u64>("offset")?;
        let (length, decoder) = decoder.decode_field::<u64>("length")?;
        let (remap_key, decoder) = decoder.decode_field::<Option<Key>>("remap_key")?;
        Ok((
            Self {
                uri,
                offset,
                length,
                remap_key,
            },
            decoder.finish(),
        ))
    }
}

/// A polymorphic, streamable reference to a span of archived bytes.
///
/// The encoded form is `tag | u32 payload length | payload`, so a reader
/// that has never heard of a back-end can skip the payload, keep it as
/// [`FieldLocation::Opaque`], and still forward the location verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldLocation {
    File(FieldSpan),
    DaosArray(FieldSpan),
    FamObject(FieldSpan),
    S3Object(FieldSpan),
    RadosObject(FieldSpan),
    /// A location held by a remote server, wrapping the server's own view.
    Remote {
        endpoint: String,
        inner: Box<FieldLocation>,
    },
    /// A location whose back-end this build does not know. Carried so it can
    /// be re-encoded byte-for-byte.
    Opaque { tag: u8, payload: Vec<u8> },
}

impl FieldLocation {
    pub fn file(uri: SfdbUri, offset: u64, length: u64) -> Self {
        Self::File(FieldSpan::new(uri, offset, length))
    }

    pub fn remote(endpoint: impl Into<String>, inner: FieldLocation) -> Self {
        Self::Remote {
            endpoint: endpoint.into(),
            inner: Box::new(inner),
        }
    }

    fn span(&self) -> Option<&FieldSpan> {
        match self {
            Self::File(span)
            | Self::DaosArray(span)
            | Self::FamObject(span)
            | Self::S3Object(span)
            | Self::RadosObject(span) => Some(span),
            Self::Remote { inner, .. } => inner.span(),
            Self::Opaque { .. } => None,
        }
    }

    pub fn uri(&self) -> Option<&SfdbUri> {
        self.span().map(|s| &s.uri)
    }

    pub fn offset(&self) -> u64 {
        self.span().map(|s| s.offset).unwrap_or(0)
    }

    pub fn length(&self) -> u64 {
        self.span().map(|s| s.length).unwrap_or(0)
    }

    pub fn remap_key(&self) -> Option<&Key> {
        self.span().and_then(|s| s.remap_key.as_ref())
    }

    /// The same location annotated with a key correction, applied to the
    /// innermost span. Variants without a span are returned unchanged.
    pub fn with_remap(self, remap: Key) -> FieldLocation {
        match self {
            Self::File(span) => Self::File(span.with_remap(remap)),
            Self::DaosArray(span) => Self::DaosArray(span.with_remap(remap)),
            Self::FamObject(span) => Self::FamObject(span.with_remap(remap)),
            Self::S3Object(span) => Self::S3Object(span.with_remap(remap)),
            Self::RadosObject(span) => Self::RadosObject(span.with_remap(remap)),
            Self::Remote { endpoint, inner } => Self::Remote {
                endpoint,
                inner: Box::new(inner.with_remap(remap)),
            },
            opaque @ Self::Opaque { .. } => opaque,
        }
    }

    /// The real underlying location for proxy variants; `self` otherwise.
    pub fn stable_location(&self) -> &FieldLocation {
        match self {
            Self::Remote { inner, .. } => inner.stable_location(),
            other => other,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Self::File(_) => TAG_FILE,
            Self::DaosArray(_) => TAG_DAOS_ARRAY,
            Self::FamObject(_) => TAG_FAM_OBJECT,
            Self::S3Object(_) => TAG_S3_OBJECT,
            Self::RadosObject(_) => TAG_RADOS_OBJECT,
            Self::Remote { .. } => TAG_REMOTE,
            Self::Opaque { tag, .. } => *tag,
        }
    }
}

impl Display for FieldLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.span() {
            Some(span) => write!(
                f,
                "{}[{}+{}]",
                span.uri,
                span.offset,
                span.length
            ),
            None => match self {
                Self::Opaque { tag, payload } => {
                    write!(f, "opaque[tag={tag},{} bytes]", payload.len())
                }
                _ => write!(f, "unresolved"),
            },
        }
    }
}

impl SfdbEncode for FieldLocation {
    fn encode(&self, buf: &mut dyn BufMut) {
        buf.put_u8(self.tag());
        let payload = match self {
            Self::File(span)
            | Self::DaosArray(span)
            | Self::FamObject(span)
            | Self::S3Object(span)
            | Self::RadosObject(span) => span.encode_to_vec(),
            Self::Remote { endpoint, inner } => {
                let mut payload = Vec::new();
                Encoder::new(&mut payload)
                    .encode_field(endpoint)
                    .encode_field(inner.as_ref())
                    .finish();
                payload
            }
            Self::Opaque { payload, .. } => payload.clone(),
        };
        payload.as_slice().encode(buf);
    }
}

impl SfdbDecode for FieldLocation {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (tag, rest) = u8::decode_unfinished(buf)?;
        let (payload, rest) = sfdb_codec::decode::decode_bytes(rest)?;
        let location = match tag {
            TAG_FILE => Self::File(FieldSpan::decode(payload)?),
            TAG_DAOS_ARRAY => Self::DaosArray(FieldSpan::decode(payload)?),
            TAG_FAM_OBJECT => Self::FamObject(FieldSpan::decode(payload)?),
            TAG_S3_OBJECT => Self::S3Object(FieldSpan::decode(payload)?),
            TAG_RADOS_OBJECT => Self::RadosObject(FieldSpan::decode(payload)?),
            TAG_REMOTE => {
                let decoder = Decoder::new(payload);
                let (endpoint, decoder) = decoder.decode_field::<String>("endpoint")?;
                let (inner, decoder) = decoder.decode_field::<FieldLocation>("inner")?;
                if !decoder.is_done() {
                    return Err(CodecError::malformed_data().with_context("remote location"));
                }
                Self::Remote {
                    endpoint,
                    inner: Box::new(inner),
                }
            }
            unknown => Self::Opaque {
                tag: unknown,
                payload: payload.to_vec(),
            },
        };
        Ok((location, rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_span() -> FieldSpan {
        FieldSpan::new(
            SfdbUri::parse("file:/data/fdb/od,oper,20260801/fc,sfc.0001.data").expect("uri"),
            4096,
            1024,
        )
        .with_remap(Key::from_pairs([("date", "20260801")]))
    }

    #[test]
    fn every_variant_round_trips() {
        let span = sample_span();
        let variants = [
            FieldLocation::File(span.clone()),
            FieldLocation::DaosArray(span.clone()),
            FieldLocation::FamObject(span.clone()),
            FieldLocation::S3Object(span.clone()),
            FieldLocation::RadosObject(span.clone()),
            FieldLocation::remote("fdb.example:7654", FieldLocation::File(span)),
        ];
        for location in variants {
            let encoded = location.encode_to_vec();
            assert_eq!(
                FieldLocation::decode(&encoded).expect("decode"),
                location,
                "variant {location} must round-trip"
            );
        }
    }

    #[test]
    fn unknown_tags_survive_re_encoding() {
        let mut encoded = Vec::new();
        encoded.push(200_u8);
        [1_u8, 2, 3].as_slice().encode(&mut encoded);

        let decoded = FieldLocation::decode(&encoded).expect("decode");
        assert!(matches!(decoded, FieldLocation::Opaque { tag: 200, .. }));
        assert_eq!(decoded.encode_to_vec(), encoded);
    }

    #[test]
    fn stable_location_unwraps_remote_chains() {
        let inner = FieldLocation::File(sample_span());
        let wrapped = FieldLocation::remote(
            "outer:1",
            FieldLocation::remote("inner:2", inner.clone()),
        );
        assert_eq!(wrapped.stable_location(), &inner);
        assert_eq!(wrapped.length(), 1024);
    }
}
