use thiserror::Error;

/// Errors raised while encoding or decoding call metadata.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("truncated {context}: needed {needed} bytes, {remaining} remaining")]
    Truncated { context: &'static str, needed: usize, remaining: usize },

    #[error("mime type '{0}' must be 1..=128 ASCII characters")]
    InvalidMimeType(String),

    #[error("unknown well-known mime id {0:#04x}")]
    UnknownMimeId(u8),

    #[error("metadata entry of {0} bytes exceeds the 24-bit length limit")]
    EntryTooLarge(usize),

    #[error("{context} of {len} bytes exceeds the {limit}-byte limit")]
    FieldTooLong { context: &'static str, len: usize, limit: usize },

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("unsupported authentication type {0:#04x}")]
    UnsupportedAuthType(u8),

    #[error("call metadata carries no binary routing entry")]
    MissingRouting,

    #[error("malformed {context}: {message}")]
    Malformed { context: &'static str, message: String },
}
