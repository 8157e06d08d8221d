use std::io;

use thiserror::Error;

/// Classified transport-level failure codes.
///
/// The string form follows the conventional socket error names so callers
/// can match on a stable code without depending on enum layout.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportCode {
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("address in use")]
    AddressInUse,
    #[error("operation timed out")]
    TimedOut,
    #[error("name not resolved")]
    NotFound,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("TLS failure")]
    Tls,
    #[error("proxy connection failed")]
    Proxy,
    #[error("i/o failure")]
    Io,
}

impl TransportCode {
    /// Stable string code for this failure class.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportCode::ConnectionReset => "ECONNRESET",
            TransportCode::ConnectionRefused => "ECONNREFUSED",
            TransportCode::AddressInUse => "EADDRINUSE",
            TransportCode::TimedOut => "ETIMEDOUT",
            TransportCode::NotFound => "ENOTFOUND",
            TransportCode::ConnectionAborted => "ECONNABORTED",
            TransportCode::BrokenPipe => "EPIPE",
            TransportCode::Tls => "ETLS",
            TransportCode::Proxy => "EPROXY",
            TransportCode::Io => "EIO",
        }
    }

    /// Whether a failure with this code is worth a retry attempt.
    ///
    /// Matches the classified retriable set: reset, refused, address in
    /// use, and timed out. DNS failures are deliberately not transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportCode::ConnectionReset
                | TransportCode::ConnectionRefused
                | TransportCode::AddressInUse
                | TransportCode::TimedOut
        )
    }

    /// Classify an [`io::Error`] by its kind.
    pub fn from_io_kind(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::ConnectionReset => TransportCode::ConnectionReset,
            io::ErrorKind::ConnectionRefused => TransportCode::ConnectionRefused,
            io::ErrorKind::AddrInUse => TransportCode::AddressInUse,
            io::ErrorKind::TimedOut => TransportCode::TimedOut,
            io::ErrorKind::ConnectionAborted => TransportCode::ConnectionAborted,
            io::ErrorKind::BrokenPipe => TransportCode::BrokenPipe,
            io::ErrorKind::NotFound => TransportCode::NotFound,
            _ => TransportCode::Io,
        }
    }
}

/// Error type for every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum FetchError {
    /// `only-if-cached` was requested and no matching entry exists.
    #[error("request to {url} failed: no cached response available (only-if-cached)")]
    NotCached { url: String },

    /// The response body did not hash to an accepted integrity value.
    #[error("integrity checksum failed for {url}: wanted {expected} but got {actual}")]
    BadChecksum {
        url: String,
        expected: String,
        actual: String,
    },

    /// The per-attempt deadline expired before response headers arrived.
    #[error("request to {url} timed out after {after_ms}ms")]
    RequestTimeout { url: String, after_ms: u64 },

    /// A classified transport failure (socket, DNS, TLS, proxy).
    #[error("{} during request to {url}: {message}", .code.as_str())]
    Transport {
        code: TransportCode,
        url: String,
        message: String,
    },

    /// The response body exceeded the caller's declared maximum size.
    #[error("response body for {url} exceeded the maximum allowed size of {limit} bytes")]
    BodyTooLarge { url: String, limit: u64 },

    /// The request URL could not be parsed or is unsupported.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Subresource-integrity metadata could not be parsed.
    #[error("invalid integrity metadata: {0}")]
    InvalidIntegrity(String),

    /// An HTTP-level protocol violation from the peer or a policy limit.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The cache store failed to read or write an entry.
    #[error("cache store error: {message}")]
    Store {
        message: String,
        #[source]
        source: Option<io::Error>,
    },
}

impl FetchError {
    /// Stable string code for this error, mirroring the transport naming.
    pub fn code(&self) -> &'static str {
        match self {
            FetchError::NotCached { .. } => "ENOTCACHED",
            FetchError::BadChecksum { .. } => "EBADCHECKSUM",
            FetchError::RequestTimeout { .. } => "request-timeout",
            FetchError::Transport { code, .. } => code.as_str(),
            FetchError::BodyTooLarge { .. } => "EMSGSIZE",
            FetchError::InvalidUrl(_) => "EINVALIDURL",
            FetchError::InvalidIntegrity(_) => "EINTEGRITY",
            FetchError::Protocol(_) => "EPROTO",
            FetchError::Store { .. } => "ESTORE",
        }
    }

    /// Whether the retry engine may reissue the request after this error.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport { code, .. } => code.is_transient(),
            FetchError::RequestTimeout { .. } => true,
            _ => false,
        }
    }

    /// Wrap an [`io::Error`] from the transport path.
    pub fn transport(url: &url::Url, err: io::Error) -> Self {
        FetchError::Transport {
            code: TransportCode::from_io_kind(err.kind()),
            url: url.to_string(),
            message: err.to_string(),
        }
    }

    /// Wrap an [`io::Error`] from the cache store path.
    pub fn store(message: impl Into<String>, err: io::Error) -> Self {
        FetchError::Store {
            message: message.into(),
            source: Some(err),
        }
    }

    /// A store failure with no underlying io error.
    pub fn store_corrupt(message: impl Into<String>) -> Self {
        FetchError::Store {
            message: message.into(),
            source: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_code_strings() {
        assert_eq!(TransportCode::ConnectionReset.as_str(), "ECONNRESET");
        assert_eq!(TransportCode::NotFound.as_str(), "ENOTFOUND");
        assert_eq!(TransportCode::TimedOut.as_str(), "ETIMEDOUT");
    }

    #[test]
    fn test_transient_classification() {
        assert!(TransportCode::ConnectionReset.is_transient());
        assert!(TransportCode::ConnectionRefused.is_transient());
        assert!(TransportCode::AddressInUse.is_transient());
        assert!(TransportCode::TimedOut.is_transient());
        // DNS failures are final.
        assert!(!TransportCode::NotFound.is_transient());
        assert!(!TransportCode::Tls.is_transient());
    }

    #[test]
    fn test_error_codes() {
        let err = FetchError::NotCached {
            url: "https://example.com/".into(),
        };
        assert_eq!(err.code(), "ENOTCACHED");

        let err = FetchError::RequestTimeout {
            url: "https://example.com/".into(),
            after_ms: 10,
        };
        assert_eq!(err.code(), "request-timeout");
        assert!(err.is_transient());
    }

    #[test]
    fn test_io_classification() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "nope");
        assert_eq!(
            TransportCode::from_io_kind(err.kind()),
            TransportCode::ConnectionRefused
        );
    }
}
