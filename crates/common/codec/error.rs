use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CodecError {
    #[error("Truncated stream{}", fmt_ctx(.0))]
    Truncated(Option<&'static str>),
    #[error("Malformed data{}", fmt_ctx(.0))]
    MalformedData(Option<&'static str>),
    #[error("Malformed boolean: expected 0x00 or 0x01, got 0x{0:02x}")]
    MalformedBoolean(u8),
    #[error("Malformed option tag: expected 0x00 or 0x01, got 0x{0:02x}")]
    MalformedOption(u8),
    #[error("Invalid UTF-8 string{}", fmt_ctx(.0))]
    InvalidString(Option<&'static str>),
    #[error("Unknown type tag 0x{0:02x}")]
    UnknownTag(u8),
    #[error("Trailing bytes after value: {0} left over")]
    TrailingBytes(usize),
    #[error("{0}")]
    Custom(String),
}

fn fmt_ctx(ctx: &Option<&'static str>) -> String {
    ctx.map(|c| format!(" decoding {c}")).unwrap_or_default()
}

impl CodecError {
    pub fn truncated() -> Self {
        Self::Truncated(None)
    }

    pub fn malformed_data() -> Self {
        Self::MalformedData(None)
    }

    pub fn with_context(self, ctx: &'static str) -> Self {
        match self {
            Self::Truncated(_) => Self::Truncated(Some(ctx)),
            Self::MalformedData(_) => Self::MalformedData(Some(ctx)),
            Self::InvalidString(_) => Self::InvalidString(Some(ctx)),
            other => other,
        }
    }
}
