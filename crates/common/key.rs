use crate::request::Request;
use indexmap::IndexMap;
use sfdb_codec::{
    structs::{Decoder, Encoder},
    CodecError, SfdbDecode, SfdbEncode,
};
use std::fmt::Display;

/// An ordered sequence of `(keyword, value)` pairs with unique keywords.
///
/// Insertion order is significant: two keys are equal only if they carry the
/// same keywords in the same order with the same values. The canonical string
/// form `{v1,v2,…}` (values only, insertion order) names databases and index
/// files on disk, so order stability is load-bearing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Key {
    pairs: IndexMap<String, String>,
}

impl Key {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a key from `(name, value)` pairs, keeping first-seen order.
    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        let mut key = Self::new();
        for (name, value) in pairs {
            key.insert(name, value);
        }
        key
    }

    /// Sets `name` to `value`. An existing keyword keeps its position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.pairs.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs.get(name).map(String::as_str)
    }

    /// Removes a keyword, preserving the order of the remaining pairs.
    pub fn unset(&mut self, name: &str) {
        self.pairs.shift_remove(name);
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pairs.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Comma-joined values in insertion order, used as a file/object name
    /// component.
    pub fn values_to_string(&self) -> String {
        let values: Vec<&str> = self.pairs.values().map(String::as_str).collect();
        values.join(",")
    }

    /// True iff every keyword the request constrains is present here with an
    /// accepted value.
    pub fn matches(&self, request: &Request) -> bool {
        request.names().all(|name| match self.get(name) {
            Some(value) => request.accepts(name, value),
            None => false,
        })
    }

    /// True iff the request constrains at least the keywords of this key and
    /// accepts every value the key carries.
    pub fn partial_matches(&self, request: &Request) -> bool {
        self.iter()
            .all(|(name, value)| request.has(name) && request.accepts(name, value))
    }

    /// True iff the request accepts every value this key carries; keywords
    /// the request does not mention accept anything. Used to filter one
    /// level of a key hierarchy against a request spanning all levels.
    pub fn conforms_to(&self, request: &Request) -> bool {
        self.iter().all(|(name, value)| request.accepts(name, value))
    }

    /// This key with `other`'s pairs layered on top (overriding equal
    /// names, appending new ones).
    pub fn overlaid_with(&self, other: &Key) -> Key {
        let mut merged = self.clone();
        for (name, value) in other.iter() {
            merged.insert(name, value);
        }
        merged
    }

    /// A request selecting exactly this key.
    pub fn as_request(&self, verb: impl Into<String>) -> Request {
        let mut request = Request::new(verb);
        for (name, value) in self.iter() {
            request.set(name, [value]);
        }
        request
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        let mut sep = "";
        for (name, value) in self.iter() {
            write!(f, "{sep}{name}={value}")?;
            sep = ",";
        }
        write!(f, "}}")
    }
}

impl SfdbEncode for Key {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        let pairs: Vec<(String, String)> = self
            .pairs
            .iter()
            .map(|(n, v)| (n.clone(), v.clone()))
            .collect();
        Encoder::new(buf).encode_field(&pairs).finish();
    }
}

impl SfdbDecode for Key {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let decoder = Decoder::new(buf);
        let (pairs, decoder) = decoder.decode_field::<Vec<(String, String)>>("pairs")?;
        Ok((Key::from_pairs(pairs), decoder.finish()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Key {
        Key::from_pairs([("class", "od"), ("type", "fc"), ("step", "0")])
    }

    #[test]
    fn insertion_order_is_preserved() {
        let key = sample();
        assert_eq!(key.values_to_string(), "od,fc,0");
        assert_eq!(key.to_string(), "{class=od,type=fc,step=0}");
    }

    #[test]
    fn equality_requires_same_order() {
        let forward = Key::from_pairs([("a", "1"), ("b", "2")]);
        let reversed = Key::from_pairs([("b", "2"), ("a", "1")]);
        assert_ne!(forward, reversed);
    }

    #[test]
    fn unset_preserves_remaining_order() {
        let mut key = sample();
        key.unset("type");
        assert_eq!(key.values_to_string(), "od,0");
    }

    #[test]
    fn match_semantics() {
        let key = sample();

        let mut request = Request::new("retrieve");
        request.set("class", ["od", "rd"]);
        request.set("step", ["0"]);
        assert!(key.matches(&request));
        // The key carries `type`, which the request does not constrain.
        assert!(!key.partial_matches(&request));

        request.set("type", ["fc"]);
        assert!(key.partial_matches(&request));

        request.set("step", ["6"]);
        assert!(!key.matches(&request));
    }

    #[test]
    fn stream_round_trip() {
        let key = sample();
        assert_eq!(Key::decode(&key.encode_to_vec()).expect("decode"), key);
    }
}
