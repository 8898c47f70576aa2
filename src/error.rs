use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compress::CompressionError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Fatal failures. Anything that can be recovered from without losing bytes is reported as a
/// [`Diagnostic`] on the decoded document instead.
#[derive(Debug, Error)]
pub enum Error {
    /// A read ran past the end of the buffer. There is no partial-record tolerance.
    #[error("unexpected end of buffer at offset {offset}: needed {needed} bytes, {remaining} remaining")]
    EndOfBuffer {
        offset: usize,
        needed: usize,
        remaining: usize,
    },
    /// The container header could not be understood. Fatal for the whole read.
    #[error("malformed header: {0}")]
    MalformedHeader(String),
    /// The body is compressed but no compression provider was configured.
    #[error("body is compressed but no compression provider is configured")]
    MissingCompressor,
    /// The compression provider failed, or produced a different length than declared.
    #[error("compression provider failed: {0}")]
    Compression(#[from] CompressionError),
    /// An ordinary chunk was not recognized, so its field boundaries can't be known.
    #[error("unknown chunk {chunk_id:#010x} (class {class_id:#010x}) at offset {offset}")]
    UnknownChunk {
        class_id: u32,
        chunk_id: u32,
        offset: usize,
    },
    /// An Id index used a reserved mode/sentinel combination.
    #[error("invalid id index {index:#010x} at offset {offset}")]
    InvalidId { index: u32, offset: usize },
    /// A length-prefixed string was not valid UTF-8.
    #[error("invalid UTF-8 string at offset {offset}")]
    InvalidString {
        offset: usize,
        #[source]
        source: std::str::Utf8Error,
    },
    /// A length or count field was negative or otherwise unusable.
    #[error("invalid length {length} at offset {offset}")]
    InvalidLength { offset: usize, length: i64 },
    /// A chunk codec rejected its payload.
    #[error("malformed data at offset {offset}: {message}")]
    Malformed { offset: usize, message: String },
    /// Nesting went past [`MAX_DEPTH`](crate::MAX_DEPTH).
    #[error("hit parsing limit: {0}")]
    ParseLimit(String),
    /// Context added at the innermost chunk boundary an error passed through.
    #[error("in chunk {chunk_id:#010x} (class {class_id:#010x}) at offset {offset}: {source}")]
    InChunk {
        class_id: u32,
        chunk_id: u32,
        offset: usize,
        #[source]
        source: Box<Error>,
    },
    /// The document body was never parsed, so writing it would emit truncated output.
    #[error("document body was not parsed and cannot be written")]
    BodyNotParsed,
    /// A chunk was found in a position its kind doesn't allow (e.g. a header chunk in a body).
    #[error("chunk {0:#010x} cannot be placed here")]
    InvalidChunkPlacement(u32),
    /// A node handle didn't resolve in the document's arena.
    #[error("node handle does not belong to this document")]
    DanglingNode,
    /// The caller requested cancellation.
    #[error("operation was cancelled")]
    Cancelled,
    /// A background job faulted or panicked.
    #[error("background job '{label}' failed: {message}")]
    Deferred { label: String, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn malformed(offset: usize, message: impl Into<String>) -> Self {
        Error::Malformed {
            offset,
            message: message.into(),
        }
    }

    /// Attach chunk context, unless an inner chunk boundary already did.
    pub(crate) fn in_chunk(self, chunk_id: u32, offset: usize) -> Self {
        match self {
            Error::InChunk { .. } | Error::Cancelled => self,
            source => Error::InChunk {
                class_id: crate::node::class_of(chunk_id),
                chunk_id,
                offset,
                source: Box::new(source),
            },
        }
    }

    /// The error with all chunk context stripped away.
    pub fn root_cause(&self) -> &Error {
        let mut err = self;
        while let Error::InChunk { source, .. } = err {
            err = source;
        }
        err
    }
}

/// Recoverable events noticed while decoding. These never abort a read; the affected bytes are
/// kept so the document still writes back out unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Diagnostic {
    /// A node used a class id the registry doesn't know. The node was kept opaque.
    UnknownClass { class_id: u32, offset: usize },
    /// A known skippable or header chunk failed to decode, or left bytes unread. Its raw bytes
    /// were kept instead.
    UndecodableChunk {
        chunk_id: u32,
        offset: usize,
        message: String,
    },
    /// A node reference resolved to a node of the wrong class and the most recently inserted
    /// auxiliary node was returned instead.
    ReferenceAmbiguity {
        index: i32,
        expected: u32,
        found: u32,
    },
    /// The root chunk stream hit a chunk that could not be skipped. Everything from that chunk on
    /// was kept as opaque trailing bytes.
    TruncatedBody {
        chunk_id: u32,
        offset: usize,
        rest_len: usize,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::UnknownClass { class_id, offset } => {
                write!(f, "unknown class {:#010x} at offset {}", class_id, offset)
            }
            Diagnostic::UndecodableChunk {
                chunk_id,
                offset,
                message,
            } => write!(
                f,
                "chunk {:#010x} at offset {} kept raw: {}",
                chunk_id, offset, message
            ),
            Diagnostic::ReferenceAmbiguity {
                index,
                expected,
                found,
            } => write!(
                f,
                "node reference {} expected class {:#010x} but found {:#010x}; used last auxiliary node",
                index, expected, found
            ),
            Diagnostic::TruncatedBody {
                chunk_id,
                offset,
                rest_len,
            } => write!(
                f,
                "body parse stopped at chunk {:#010x} (offset {}); {} bytes kept as rest",
                chunk_id, offset, rest_len
            ),
        }
    }
}
