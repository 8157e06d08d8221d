//! HTTP response with a lazily streamed body.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::stream::LocalBoxStream;
use futures::{Stream, StreamExt};
use http::{HeaderMap, StatusCode};
use url::Url;

use crate::base::error::FetchError;

/// Streaming response body.
///
/// Nothing is pulled from the upstream (socket or cache file) until the
/// body is polled, so an unread body costs no I/O.
pub enum ResponseBody {
    /// No body (HEAD responses, 304s).
    Empty,
    /// Fully buffered body.
    Full(Bytes),
    /// Chunked body streamed from the transport or the cache.
    Stream(BoxStream<'static, Result<Bytes, FetchError>>),
}

impl ResponseBody {
    /// A body that yields the given bytes in one chunk.
    pub fn full(bytes: impl Into<Bytes>) -> Self {
        ResponseBody::Full(bytes.into())
    }

    /// Wrap a chunk stream.
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, FetchError>> + Send + 'static,
    {
        ResponseBody::Stream(stream.boxed())
    }

    /// Read the entire body into one buffer.
    pub async fn bytes(self) -> Result<Bytes, FetchError> {
        match self {
            ResponseBody::Empty => Ok(Bytes::new()),
            ResponseBody::Full(bytes) => Ok(bytes),
            ResponseBody::Stream(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }

    /// Read the body as UTF-8 text.
    pub async fn text(self) -> Result<String, FetchError> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| FetchError::Protocol("response body is not valid UTF-8".into()))
    }
}

impl Stream for ResponseBody {
    type Item = Result<Bytes, FetchError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this {
            ResponseBody::Empty => Poll::Ready(None),
            ResponseBody::Full(_) => {
                let bytes = match std::mem::replace(this, ResponseBody::Empty) {
                    ResponseBody::Full(bytes) => bytes,
                    _ => unreachable!(),
                };
                if bytes.is_empty() {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Ok(bytes)))
                }
            }
            ResponseBody::Stream(stream) => stream.as_mut().poll_next(cx),
        }
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("ResponseBody::Empty"),
            ResponseBody::Full(b) => f.debug_tuple("ResponseBody::Full").field(&b.len()).finish(),
            ResponseBody::Stream(_) => f.write_str("ResponseBody::Stream"),
        }
    }
}

/// HTTP response as seen by callers of this crate.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    url: Url,
    body: ResponseBody,
    size: Option<u64>,
}

impl Response {
    pub fn new(status: StatusCode, headers: HeaderMap, url: Url, body: ResponseBody) -> Self {
        Self {
            status,
            headers,
            url,
            body,
            size: None,
        }
    }

    /// Attach a declared body size (from `Content-Length` or the store).
    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.size = size;
        self
    }

    /// Get the status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get a reference to the headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a mutable reference to the headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The URL this response was produced for.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Declared body size, when known.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Swap the body out, leaving an empty one behind.
    pub fn replace_body(&mut self, body: ResponseBody) -> ResponseBody {
        std::mem::replace(&mut self.body, body)
    }

    /// Consume the response, returning its body.
    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    /// Split into headers-and-status and body halves.
    pub fn into_parts(self) -> (StatusCode, HeaderMap, Url, ResponseBody) {
        (self.status, self.headers, self.url, self.body)
    }

    /// Convenience method to consume the body as bytes.
    pub async fn bytes(self) -> Result<Bytes, FetchError> {
        self.body.bytes().await
    }

    /// Convenience method to consume the body as text.
    pub async fn text(self) -> Result<String, FetchError> {
        self.body.text().await
    }
}
