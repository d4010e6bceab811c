use indexmap::IndexMap;
use sfdb_codec::{
    structs::{Decoder, Encoder},
    CodecError, SfdbDecode, SfdbEncode,
};
use std::fmt::Display;

/// A user request: a verb plus, per keyword, the set of accepted values.
///
/// A keyword present with an empty value list acts as a wildcard: the name
/// must exist in a matching key but any value is accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    verb: String,
    params: IndexMap<String, Vec<String>>,
}

impl Request {
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            params: IndexMap::new(),
        }
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }

    pub fn set<V: Into<String>>(
        &mut self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) {
        self.params
            .insert(name.into(), values.into_iter().map(Into::into).collect());
    }

    pub fn unset(&mut self, name: &str) {
        self.params.shift_remove(name);
    }

    pub fn has(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn values(&self, name: &str) -> Option<&[String]> {
        self.params.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// True iff `value` is accepted for `name`. Unconstrained names accept
    /// everything; an empty value list is an explicit wildcard.
    pub fn accepts(&self, name: &str, value: &str) -> bool {
        match self.params.get(name) {
            Some(values) => values.is_empty() || values.iter().any(|v| v == value),
            None => true,
        }
    }

    /// Parses the textual form `name1=v1/v2,name2=v3,name3` (no verb).
    pub fn parse_params(verb: impl Into<String>, text: &str) -> Result<Self, String> {
        let mut request = Request::new(verb);
        let text = text.trim();
        if text.is_empty() {
            return Ok(request);
        }
        for part in text.split(',') {
            match part.split_once('=') {
                Some((name, values)) if !name.trim().is_empty() => {
                    request.set(name.trim(), values.split('/').map(str::trim));
                }
                None if !part.trim().is_empty() => {
                    request.set(part.trim(), Vec::<String>::new());
                }
                _ => return Err(format!("malformed request element '{part}'")),
            }
        }
        Ok(request)
    }
}

impl Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.verb)?;
        for (name, values) in &self.params {
            write!(f, ",{name}={}", values.join("/"))?;
        }
        Ok(())
    }
}

impl SfdbEncode for Request {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        let params: Vec<(String, Vec<String>)> = self
            .params
            .iter()
            .map(|(n, v)| (n.clone(), v.clone()))
            .collect();
        Encoder::new(buf)
            .encode_field(&self.verb)
            .encode_field(&params)
            .finish();
    }
}

impl SfdbDecode for Request {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let decoder = Decoder::new(buf);
        let (verb, decoder) = decoder.decode_field::<String>("verb")?;
        let (params, decoder) = decoder.decode_field::<Vec<(String, Vec<String>)>>("params")?;
        let mut request = Request::new(verb);
        for (name, values) in params {
            request.set(name, values);
        }
        Ok((request, decoder.finish()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_unconstrained_and_wildcard() {
        let mut request = Request::new("list");
        request.set("class", ["od"]);
        request.set("step", Vec::<String>::new());

        assert!(request.accepts("class", "od"));
        assert!(!request.accepts("class", "rd"));
        assert!(request.accepts("step", "anything"));
        assert!(request.accepts("unmentioned", "x"));
    }

    #[test]
    fn parse_round_trips_display() {
        let request =
            Request::parse_params("retrieve", "class=od,type=fc/an,step=0").expect("parse");
        assert_eq!(request.to_string(), "retrieve,class=od,type=fc/an,step=0");
        assert_eq!(
            request.values("type"),
            Some(&["fc".to_string(), "an".to_string()][..])
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Request::parse_params("list", "=bad").is_err());
    }

    #[test]
    fn stream_round_trip() {
        let mut request = Request::new("wipe");
        request.set("class", ["od"]);
        request.set("step", ["0", "6"]);
        assert_eq!(
            Request::decode(&request.encode_to_vec()).expect("decode"),
            request
        );
    }
}
