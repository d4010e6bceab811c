use sfdb_codec::CodecError;
use thiserror::Error;

/// Library-surface error taxonomy. Display strings carry a stable `kind:`
/// prefix so callers and the CLI can classify without matching variants.
#[derive(Debug, Error)]
pub enum FdbError {
    #[error("usage: {0}")]
    Usage(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("corruption: {0}")]
    Corruption(String),
    #[error("transport: {msg} [endpoint={endpoint}]")]
    Transport { endpoint: String, msg: String },
    #[error("capacity: {0}")]
    Capacity(String),
    #[error("consistency: {0}")]
    Consistency(String),
    #[error("corruption: {0}")]
    Codec(#[from] CodecError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl FdbError {
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    pub fn transport(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            msg: msg.into(),
        }
    }

    pub fn consistency(msg: impl Into<String>) -> Self {
        Self::Consistency(msg.into())
    }

    pub fn capacity(msg: impl Into<String>) -> Self {
        Self::Capacity(msg.into())
    }

    /// True for errors a caller may treat as "ok, already done".
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

pub type FdbResult<T> = Result<T, FdbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_kind_prefix() {
        assert!(FdbError::usage("missing keyword 'class'")
            .to_string()
            .starts_with("usage: "));
        assert!(FdbError::transport("host:7654", "connection reset")
            .to_string()
            .contains("[endpoint=host:7654]"));
    }
}
