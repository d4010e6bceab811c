use sfdb_codec::{
    structs::{Decoder, Encoder},
    CodecError, SfdbDecode, SfdbEncode,
};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Schemes understood by this build. Unknown schemes still parse; routing
/// simply finds no local back-end for them.
pub const KNOWN_SCHEMES: &[&str] = &["sfdb", "sfdbremote", "file", "daos", "fam", "s3", "rados"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UriError {
    #[error("URI has no scheme separator: '{0}'")]
    MissingScheme(String),
    #[error("URI has an empty scheme: '{0}'")]
    EmptyScheme(String),
}

/// `scheme:path?query#fragment` with query and fragment preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SfdbUri {
    scheme: String,
    path: String,
    query: Option<String>,
    fragment: Option<String>,
}

impl SfdbUri {
    pub fn new(scheme: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            path: path.into(),
            query: None,
            fragment: None,
        }
    }

    pub fn file(path: impl AsRef<Path>) -> Self {
        Self::new("file", path.as_ref().to_string_lossy())
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_fragment(mut self, fragment: impl Into<String>) -> Self {
        self.fragment = Some(fragment.into());
        self
    }

    pub fn parse(text: &str) -> Result<Self, UriError> {
        let (scheme, rest) = text
            .split_once(':')
            .ok_or_else(|| UriError::MissingScheme(text.to_string()))?;
        if scheme.is_empty() {
            return Err(UriError::EmptyScheme(text.to_string()));
        }
        // Fragment binds last so a '?' inside the fragment stays there.
        let (rest, fragment) = match rest.split_once('#') {
            Some((r, f)) => (r, Some(f.to_string())),
            None => (rest, None),
        };
        let (path, query) = match rest.split_once('?') {
            Some((p, q)) => (p, Some(q.to_string())),
            None => (rest, None),
        };
        Ok(Self {
            scheme: scheme.to_string(),
            path: path.to_string(),
            query,
            fragment,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    /// Filesystem path for `file`/`sfdb` URIs.
    pub fn as_path(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }
}

impl Display for SfdbUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scheme, self.path)?;
        if let Some(query) = &self.query {
            write!(f, "?{query}")?;
        }
        if let Some(fragment) = &self.fragment {
            write!(f, "#{fragment}")?;
        }
        Ok(())
    }
}

impl SfdbEncode for SfdbUri {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.scheme)
            .encode_field(&self.path)
            .encode_field(&self.query)
            .encode_field(&self.fragment)
            .finish();
    }
}

impl SfdbDecode for SfdbUri {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let decoder = Decoder::new(buf);
        let (scheme, decoder) = decoder.decode_field::<String>("scheme")?;
        let (path, decoder) = decoder.decode_field::<String>("path")?;
        let (query, decoder) = decoder.decode_field::<Option<String>>("query")?;
        let (fragment, decoder) = decoder.decode_field::<Option<String>>("fragment")?;
        Ok((
            Self {
                scheme,
                path,
                query,
                fragment,
            },
            decoder.finish(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        for text in [
            "file:/data/fdb/od,fc,0",
            "s3:bucket/object?region=eu-west-1",
            "daos:pool/container#oid",
            "sfdbremote:host:7654?store=backup#x?y",
        ] {
            let uri = SfdbUri::parse(text).expect("parse");
            assert_eq!(uri.to_string(), text);
        }
    }

    #[test]
    fn query_and_fragment_are_split_correctly() {
        let uri = SfdbUri::parse("s3:bucket/obj?a=1#frag").expect("parse");
        assert_eq!(uri.scheme(), "s3");
        assert_eq!(uri.path(), "bucket/obj");
        assert_eq!(uri.query(), Some("a=1"));
        assert_eq!(uri.fragment(), Some("frag"));
    }

    #[test]
    fn missing_scheme_is_rejected() {
        assert!(SfdbUri::parse("/plain/path").is_err());
        assert!(SfdbUri::parse(":/no/scheme").is_err());
    }

    #[test]
    fn stream_round_trip() {
        let uri = SfdbUri::parse("rados:pool/ns/object?cluster=main").expect("parse");
        assert_eq!(SfdbUri::decode(&uri.encode_to_vec()).expect("decode"), uri);
    }
}
