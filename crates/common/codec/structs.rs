use super::{decode::SfdbDecode, encode::SfdbEncode, error::CodecError};
use bytes::BufMut;

/// # Struct decoding helper
///
/// Used to decode a struct from the stream format, field by field, in the
/// order they were encoded. Decode errors are annotated with the field name.
///
/// # Examples
///
/// ```
/// # use sfdb_codec::structs::Decoder;
/// # use sfdb_codec::decode::SfdbDecode;
/// # use sfdb_codec::error::CodecError;
/// #[derive(Debug, PartialEq, Eq)]
/// struct Simple {
///     pub a: u8,
///     pub b: u16,
/// }
///
/// impl SfdbDecode for Simple {
///     fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
///         let decoder = Decoder::new(buf);
///         // The fields are expected in the same order as given here
///         let (a, decoder) = decoder.decode_field("a")?;
///         let (b, decoder) = decoder.decode_field("b")?;
///         Ok((Simple { a, b }, decoder.finish()))
///     }
/// }
///
/// let bytes = [61, 0, 75];
/// let decoded = Simple::decode(&bytes).unwrap();
///
/// assert_eq!(decoded, Simple { a: 61, b: 75 });
/// ```
#[derive(Debug)]
pub struct Decoder<'a> {
    payload: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { payload: buf }
    }

    pub fn decode_field<T: SfdbDecode>(self, name: &str) -> Result<(T, Self), CodecError> {
        let (field, rest) = <T as SfdbDecode>::decode_unfinished(self.payload)
            .map_err(|err| field_decode_error::<T>(name, err))?;
        Ok((field, Self { payload: rest }))
    }

    /// Returns the bytes that have not been decoded yet.
    pub fn finish(self) -> &'a [u8] {
        self.payload
    }

    /// Returns true if the decoder has consumed the whole input.
    pub const fn is_done(&self) -> bool {
        self.payload.is_empty()
    }
}

fn field_decode_error<T>(field_name: &str, err: CodecError) -> CodecError {
    let typ = std::any::type_name::<T>();
    CodecError::Custom(format!(
        "Error decoding field '{field_name}' of type {typ}: {err}"
    ))
}

/// # Struct encoding helper
///
/// Counterpart to [`Decoder`]: fields encoded through it land in the buffer
/// in call order, which fixes the order the decoder must use.
pub struct Encoder<'a> {
    buf: &'a mut dyn BufMut,
}

impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut dyn BufMut) -> Self {
        Self { buf }
    }

    pub fn encode_field<T: SfdbEncode>(self, value: &T) -> Self {
        value.encode(self.buf);
        self
    }

    pub fn finish(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decode::SfdbDecode, encode::SfdbEncode};

    #[derive(Debug, PartialEq, Eq)]
    struct Record {
        kind: u16,
        name: String,
        payload: Vec<u8>,
    }

    impl SfdbEncode for Record {
        fn encode(&self, buf: &mut dyn BufMut) {
            Encoder::new(buf)
                .encode_field(&self.kind)
                .encode_field(&self.name)
                .encode_field(&self.payload)
                .finish();
        }
    }

    impl SfdbDecode for Record {
        fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
            let decoder = Decoder::new(buf);
            let (kind, decoder) = decoder.decode_field("kind")?;
            let (name, decoder) = decoder.decode_field("name")?;
            let (payload, decoder) = decoder.decode_field("payload")?;
            Ok((
                Record {
                    kind,
                    name,
                    payload,
                },
                decoder.finish(),
            ))
        }
    }

    #[test]
    fn struct_round_trip() {
        let record = Record {
            kind: 2,
            name: "toc.index".to_string(),
            payload: vec![0xde, 0xad, 0xbe, 0xef],
        };
        let encoded = record.encode_to_vec();
        assert_eq!(Record::decode(&encoded).unwrap(), record);
    }

    #[test]
    fn field_errors_name_the_field() {
        // kind ok, name truncated
        let err = Record::decode(&[0, 2, 0, 0, 0, 9]).unwrap_err();
        match err {
            CodecError::Custom(msg) => assert!(msg.contains("'name'")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
