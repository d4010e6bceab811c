use super::error::CodecError;
use std::collections::{BTreeMap, BTreeSet};

/// Max byte-string payload accepted when decoding.
/// Anything larger in our formats is either a bug or malicious.
const MAX_BYTES_LEN: usize = 1024 * 1024 * 1024;

/// Trait for decoding values from the SFDB stream format.
///
/// [`decode_unfinished`](SfdbDecode::decode_unfinished) decodes a value off
/// the front of a slice and returns it together with the remaining bytes;
/// [`decode`](SfdbDecode::decode) additionally requires the slice to be fully
/// consumed. Implementors only need `decode_unfinished`.
pub trait SfdbDecode: Sized {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CodecError>;

    fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let (decoded, remaining) = Self::decode_unfinished(buf)?;
        if !remaining.is_empty() {
            return Err(CodecError::TrailingBytes(remaining.len()));
        }

        Ok(decoded)
    }
}

fn split_at_checked(buf: &[u8], n: usize) -> Result<(&[u8], &[u8]), CodecError> {
    if buf.len() < n {
        return Err(CodecError::truncated());
    }
    Ok(buf.split_at(n))
}

/// Decodes a `u32`-length-prefixed byte string off the front of `buf`.
pub fn decode_bytes(buf: &[u8]) -> Result<(&[u8], &[u8]), CodecError> {
    let (len, rest) = u32::decode_unfinished(buf)?;
    let len = len as usize;
    if len > MAX_BYTES_LEN {
        return Err(CodecError::malformed_data());
    }
    split_at_checked(rest, len)
}

impl SfdbDecode for bool {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (byte, rest) = split_at_checked(buf, 1)?;
        match byte[0] {
            0x00 => Ok((false, rest)),
            0x01 => Ok((true, rest)),
            b => Err(CodecError::MalformedBoolean(b)),
        }
    }
}

macro_rules! impl_decode_integer {
    ($t:ty) => {
        impl SfdbDecode for $t {
            fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
                const WIDTH: usize = std::mem::size_of::<$t>();
                let (bytes, rest) = split_at_checked(buf, WIDTH)?;
                let array: [u8; WIDTH] = bytes.try_into().map_err(|_| CodecError::truncated())?;
                Ok((<$t>::from_be_bytes(array), rest))
            }
        }
    };
}

impl_decode_integer!(u8);
impl_decode_integer!(u16);
impl_decode_integer!(u32);
impl_decode_integer!(u64);
impl_decode_integer!(i64);

impl SfdbDecode for String {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (bytes, rest) = decode_bytes(buf)?;
        let s = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidString(None))?;
        Ok((s.to_owned(), rest))
    }
}

impl SfdbDecode for bytes::Bytes {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (bytes, rest) = decode_bytes(buf)?;
        Ok((bytes::Bytes::copy_from_slice(bytes), rest))
    }
}

impl<const N: usize> SfdbDecode for [u8; N] {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (bytes, rest) = split_at_checked(buf, N)?;
        let array: [u8; N] = bytes.try_into().map_err(|_| CodecError::truncated())?;
        Ok((array, rest))
    }
}

impl<T: SfdbDecode> SfdbDecode for Option<T> {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (tag, rest) = split_at_checked(buf, 1)?;
        match tag[0] {
            0x00 => Ok((None, rest)),
            0x01 => {
                let (value, rest) = T::decode_unfinished(rest)?;
                Ok((Some(value), rest))
            }
            b => Err(CodecError::MalformedOption(b)),
        }
    }
}

impl<T: SfdbDecode> SfdbDecode for Vec<T> {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (count, mut rest) = u32::decode_unfinished(buf)?;
        let mut items = Vec::with_capacity((count as usize).min(1024));
        for _ in 0..count {
            let (item, next) = T::decode_unfinished(rest)?;
            items.push(item);
            rest = next;
        }
        Ok((items, rest))
    }
}

impl SfdbDecode for BTreeSet<String> {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (items, rest) = Vec::<String>::decode_unfinished(buf)?;
        Ok((items.into_iter().collect(), rest))
    }
}

impl<V: SfdbDecode> SfdbDecode for BTreeMap<String, V> {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (count, mut rest) = u32::decode_unfinished(buf)?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let (name, next) = String::decode_unfinished(rest)?;
            let (value, next) = V::decode_unfinished(next)?;
            map.insert(name, value);
            rest = next;
        }
        Ok((map, rest))
    }
}

impl<A: SfdbDecode, B: SfdbDecode> SfdbDecode for (A, B) {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (a, rest) = A::decode_unfinished(buf)?;
        let (b, rest) = B::decode_unfinished(rest)?;
        Ok(((a, b), rest))
    }
}
