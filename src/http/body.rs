//! Request body for POST/PUT operations.

use bytes::Bytes;
use futures::stream::LocalBoxStream;

use crate::base::error::FetchError;

/// Request body for HTTP methods that send data.
///
/// Buffered bodies are rewindable and may be reissued by the retry
/// engine; streamed bodies can be consumed exactly once and disable
/// retries for the request that carries them.
#[derive(Default)]
pub enum Body {
    /// No body (GET, HEAD, DELETE).
    #[default]
    Empty,
    /// Body with raw bytes.
    Bytes(Bytes),
    /// One-shot streaming body.
    Stream(LocalBoxStream<'static, Result<Bytes, FetchError>>),
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Bytes(Bytes::from(s))
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(v))
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Body::Bytes(Bytes::from(s.to_owned()))
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        Body::Bytes(b)
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Bytes(b) => f.debug_tuple("Body::Bytes").field(&b.len()).finish(),
            Body::Stream(_) => f.write_str("Body::Stream"),
        }
    }
}

impl Body {
    /// Check if the body is empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    /// Declared length, when known up front.
    pub fn len(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(b) => Some(b.len() as u64),
            Body::Stream(_) => None,
        }
    }

    /// Whether this body can be replayed for another attempt.
    pub fn is_rewindable(&self) -> bool {
        !matches!(self, Body::Stream(_))
    }

    /// Clone a rewindable body; streams return `None`.
    pub fn clone_rewound(&self) -> Option<Body> {
        match self {
            Body::Empty => Some(Body::Empty),
            Body::Bytes(b) => Some(Body::Bytes(b.clone())),
            Body::Stream(_) => None,
        }
    }

    /// Take the body out, leaving `Empty` behind.
    pub fn take(&mut self) -> Body {
        std::mem::take(self)
    }

    /// Produce the body for one network attempt.
    ///
    /// Rewindable bodies are cloned so later attempts can replay them;
    /// a stream is moved out and can back only this attempt.
    pub fn for_attempt(&mut self) -> Body {
        match self.clone_rewound() {
            Some(body) => body,
            None => self.take(),
        }
    }
}
