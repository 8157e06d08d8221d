//! Pluggable HTTP transport and the default hyper-based implementation.
//!
//! The default transport performs one HTTP/1.1 exchange per call:
//! connect (direct, absolute-form proxy, or CONNECT tunnel), TLS when the
//! target is https, then a hyper `client::conn` round trip. Connections
//! are pooled per agent. Redirects are followed mechanically up to the
//! caller's hop limit; redirect *policy* is not this crate's concern.

use std::error::Error as _;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use http::header::{AUTHORIZATION, CONNECTION, COOKIE, HOST, LOCATION, PROXY_AUTHORIZATION};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use url::Url;

use crate::agent::{Agent, PooledConn, ProxyConfig};
use crate::base::error::{FetchError, TransportCode};
use crate::client::Options;
use crate::http::body::Body;
use crate::http::request::Request;
use crate::http::response::{Response, ResponseBody};

/// Body type the transport hands to hyper.
pub type OutboundBody = UnsyncBoxBody<Bytes, FetchError>;

/// Default redirect hop limit.
pub const DEFAULT_FOLLOW: usize = 20;

const CONNECT_RESPONSE_LIMIT: usize = 8 * 1024;

/// How the transport treats redirect responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectMode {
    /// Follow up to the configured hop limit.
    #[default]
    Follow,
    /// Return redirect responses to the caller untouched.
    Manual,
    /// Treat any redirect as an error.
    Error,
}

/// Executes a single HTTP exchange (plus mechanical redirects).
#[async_trait(?Send)]
pub trait Transport: Send + Sync {
    async fn roundtrip(
        &self,
        req: Request,
        agent: Arc<Agent>,
        opts: &Options,
    ) -> Result<Response, FetchError>;
}

trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

type BoxedIo = Box<dyn Io>;

/// The default HTTP/1.1 transport.
#[derive(Debug, Default)]
pub struct HyperTransport;

impl HyperTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait(?Send)]
impl Transport for HyperTransport {
    async fn roundtrip(
        &self,
        req: Request,
        agent: Arc<Agent>,
        opts: &Options,
    ) -> Result<Response, FetchError> {
        let Request {
            mut method,
            mut url,
            mut headers,
            mut body,
        } = req;

        let redirect = opts.redirect.unwrap_or_default();
        let follow = opts.follow.unwrap_or(DEFAULT_FOLLOW);
        let mut hops = 0usize;

        loop {
            let hop_body = body.for_attempt();
            let res = single_exchange(&method, &url, &headers, hop_body, &agent, opts).await?;

            if !is_redirect(res.status()) {
                return Ok(res);
            }
            match redirect {
                RedirectMode::Manual => return Ok(res),
                RedirectMode::Error => {
                    return Err(FetchError::Protocol(format!(
                        "redirect to {:?} not allowed for {}",
                        res.headers().get(LOCATION),
                        url
                    )));
                }
                RedirectMode::Follow => {}
            }

            hops += 1;
            if hops > follow {
                return Err(FetchError::Protocol(format!(
                    "maximum redirect count of {} reached at {}",
                    follow, url
                )));
            }

            let Some(location) = res
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|loc| url.join(loc).ok())
            else {
                // No usable Location; hand the redirect back.
                return Ok(res);
            };

            let status = res.status();
            let rewrite_to_get = status == StatusCode::SEE_OTHER
                || ((status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND)
                    && method == Method::POST);
            if rewrite_to_get {
                method = Method::GET;
                body = Body::Empty;
                headers.remove(http::header::CONTENT_LENGTH);
                headers.remove(http::header::CONTENT_TYPE);
                headers.remove(http::header::CONTENT_ENCODING);
            } else if !body.is_rewindable() {
                return Err(FetchError::Protocol(format!(
                    "cannot follow redirect from {}: request body is not replayable",
                    url
                )));
            }

            // Credentials do not cross origins.
            if location.host_str() != url.host_str() || location.scheme() != url.scheme() {
                headers.remove(AUTHORIZATION);
                headers.remove(COOKIE);
            }

            tracing::debug!(from = %url, to = %location, status = %status, "following redirect");
            url = location;
        }
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

fn host_port(url: &Url) -> Result<(String, u16), FetchError> {
    let host = url
        .host_str()
        .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?;
    Ok((host.to_string(), port))
}

/// Connection-pool key for the socket this exchange needs. CONNECT
/// tunnels are per-target, so the key carries both endpoints.
fn conn_key(url: &Url, proxy: Option<&ProxyConfig>) -> Result<String, FetchError> {
    let (host, port) = host_port(url)?;
    match proxy {
        None => Ok(format!("{}:{}", host, port)),
        Some(p) => {
            let (proxy_host, proxy_port) = host_port(&p.url)?;
            if url.scheme() == "http" {
                // Absolute-form requests share the proxy connection.
                Ok(format!("{}:{}", proxy_host, proxy_port))
            } else {
                Ok(format!("{}:{}|{}:{}", proxy_host, proxy_port, host, port))
            }
        }
    }
}

async fn single_exchange(
    method: &Method,
    url: &Url,
    headers: &HeaderMap,
    body: Body,
    agent: &Arc<Agent>,
    opts: &Options,
) -> Result<Response, FetchError> {
    let proxy = agent.proxy_for(url).cloned();
    let absolute_form = proxy.is_some() && url.scheme() == "http";
    let dest = conn_key(url, proxy.as_ref())?;

    let mut conn = match agent.checkout(&dest) {
        Some(conn) => conn,
        None => {
            let permit = agent.acquire_slot(&dest).await?;
            let io = establish_io(url, proxy.as_ref(), agent).await?;
            let (sender, driver) = http1::handshake(TokioIo::new(io))
                .await
                .map_err(|e| map_hyper_err(url, e))?;
            tokio::spawn(async move {
                if let Err(err) = driver.await {
                    tracing::debug!(error = %err, "connection closed with error");
                }
            });
            PooledConn {
                sender,
                _permit: permit,
            }
        }
    };

    let hyper_req = build_hyper_request(method, url, headers, body, absolute_form, proxy.as_ref(), agent)?;

    conn.sender
        .ready()
        .await
        .map_err(|e| map_hyper_err(url, e))?;
    let hyper_res = conn
        .sender
        .send_request(hyper_req)
        .await
        .map_err(|e| map_hyper_err(url, e))?;

    // Hand the connection back right away; `ready()` gates reuse until
    // the in-flight response completes.
    agent.checkin(&dest, conn);

    let (parts, incoming) = hyper_res.into_parts();
    let size = parts
        .headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok());
    let body = incoming_body(incoming, url.to_string(), opts.size);
    Ok(Response::new(parts.status, parts.headers, url.clone(), body).with_size(size))
}

fn build_hyper_request(
    method: &Method,
    url: &Url,
    headers: &HeaderMap,
    body: Body,
    absolute_form: bool,
    proxy: Option<&ProxyConfig>,
    agent: &Arc<Agent>,
) -> Result<http::Request<OutboundBody>, FetchError> {
    let uri: Uri = if absolute_form {
        url.as_str()
            .parse()
            .map_err(|_| FetchError::InvalidUrl(url.to_string()))?
    } else {
        let mut target = url.path().to_string();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }
        target
            .parse()
            .map_err(|_| FetchError::InvalidUrl(url.to_string()))?
    };

    let mut req = http::Request::builder()
        .method(method.clone())
        .uri(uri)
        .body(outbound_body(body))
        .map_err(|e| FetchError::Protocol(e.to_string()))?;
    *req.headers_mut() = headers.clone();

    if !req.headers().contains_key(HOST) {
        let (host, _) = host_port(url)?;
        let value = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            req.headers_mut().insert(HOST, value);
        }
    }
    if !agent.keepalive() {
        req.headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
    }
    if absolute_form {
        if let Some(auth) = proxy.and_then(|p| p.auth_header()) {
            if let Ok(value) = HeaderValue::from_str(&auth) {
                req.headers_mut().insert(PROXY_AUTHORIZATION, value);
            }
        }
    }

    Ok(req)
}

fn outbound_body(body: Body) -> OutboundBody {
    match body {
        Body::Empty => Empty::<Bytes>::new().map_err(|e| match e {}).boxed_unsync(),
        Body::Bytes(bytes) => Full::new(bytes).map_err(|e| match e {}).boxed_unsync(),
        Body::Stream(stream) => StreamBody::new(stream.map_ok(Frame::data)).boxed_unsync(),
    }
}

/// Convert hyper's incoming body to the crate body stream, enforcing the
/// caller's declared maximum size when one is set.
fn incoming_body(incoming: Incoming, url: String, limit: Option<u64>) -> ResponseBody {
    let err_url = url.clone();
    let stream = TryStreamExt::map_err(BodyStream::new(incoming), move |e| FetchError::Transport {
        code: hyper_code(&e),
        url: err_url.clone(),
        message: e.to_string(),
    })
    .try_filter_map(|frame| futures::future::ready(Ok(frame.into_data().ok())));

    match limit {
        Some(max) => {
            let mut seen = 0u64;
            ResponseBody::stream(stream.map(move |res| match res {
                Ok(chunk) => {
                    seen += chunk.len() as u64;
                    if seen > max {
                        Err(FetchError::BodyTooLarge {
                            url: url.clone(),
                            limit: max,
                        })
                    } else {
                        Ok(chunk)
                    }
                }
                Err(err) => Err(err),
            }))
        }
        None => ResponseBody::stream(stream),
    }
}

fn hyper_code(err: &hyper::Error) -> TransportCode {
    let mut source: Option<&(dyn std::error::Error + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return TransportCode::from_io_kind(io_err.kind());
        }
        source = cause.source();
    }
    if err.is_incomplete_message() {
        TransportCode::ConnectionReset
    } else if err.is_timeout() {
        TransportCode::TimedOut
    } else {
        TransportCode::Io
    }
}

fn map_hyper_err(url: &Url, err: hyper::Error) -> FetchError {
    FetchError::Transport {
        code: hyper_code(&err),
        url: url.to_string(),
        message: err.to_string(),
    }
}

/// Open the socket an exchange will run over: TCP, optional proxy
/// tunnel, and TLS to the target when it is https.
async fn establish_io(
    url: &Url,
    proxy: Option<&ProxyConfig>,
    agent: &Arc<Agent>,
) -> Result<BoxedIo, FetchError> {
    let (host, port) = host_port(url)?;
    match proxy {
        None => {
            let tcp = tcp_connect(&host, port, url).await?;
            if url.scheme() == "https" {
                tls_connect(Box::new(tcp), &host, agent, url).await
            } else {
                Ok(Box::new(tcp))
            }
        }
        Some(proxy) => {
            let (proxy_host, proxy_port) = host_port(&proxy.url)?;
            let tcp = tcp_connect(&proxy_host, proxy_port, url).await?;
            let mut io: BoxedIo = if proxy.is_https() {
                tls_connect(Box::new(tcp), &proxy_host, agent, url).await?
            } else {
                Box::new(tcp)
            };
            if url.scheme() == "http" {
                // Absolute-form request, no tunnel needed.
                return Ok(io);
            }
            send_connect(&mut io, &host, port, proxy, url).await?;
            tls_connect(io, &host, agent, url).await
        }
    }
}

async fn tcp_connect(host: &str, port: u16, url: &Url) -> Result<TcpStream, FetchError> {
    let addrs: Vec<std::net::SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| FetchError::Transport {
            code: TransportCode::NotFound,
            url: url.to_string(),
            message: format!("failed to resolve {}: {}", host, e),
        })?
        .collect();
    if addrs.is_empty() {
        return Err(FetchError::Transport {
            code: TransportCode::NotFound,
            url: url.to_string(),
            message: format!("no addresses for {}", host),
        });
    }

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }
    let err = last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "connect failed"));
    Err(FetchError::transport(url, err))
}

async fn tls_connect(
    io: BoxedIo,
    host: &str,
    agent: &Arc<Agent>,
    url: &Url,
) -> Result<BoxedIo, FetchError> {
    let server_name = ServerName::try_from(host.to_string()).map_err(|_| FetchError::Transport {
        code: TransportCode::Tls,
        url: url.to_string(),
        message: format!("invalid TLS server name {}", host),
    })?;
    let connector = TlsConnector::from(agent.tls_config());
    let stream = connector
        .connect(server_name, io)
        .await
        .map_err(|e| FetchError::Transport {
            code: TransportCode::Tls,
            url: url.to_string(),
            message: e.to_string(),
        })?;
    Ok(Box::new(stream))
}

/// Issue an HTTP CONNECT over an established proxy connection.
async fn send_connect(
    io: &mut BoxedIo,
    host: &str,
    port: u16,
    proxy: &ProxyConfig,
    url: &Url,
) -> Result<(), FetchError> {
    let mut request = format!("CONNECT {0}:{1} HTTP/1.1\r\nHost: {0}:{1}\r\n", host, port);
    if let Some(auth) = proxy.auth_header() {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    request.push_str("\r\n");
    io.write_all(request.as_bytes())
        .await
        .map_err(|e| FetchError::transport(url, e))?;

    let mut response = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = io
            .read(&mut buf)
            .await
            .map_err(|e| FetchError::transport(url, e))?;
        if n == 0 {
            return Err(FetchError::Transport {
                code: TransportCode::Proxy,
                url: url.to_string(),
                message: "proxy closed the connection during CONNECT".into(),
            });
        }
        response.extend_from_slice(&buf[..n]);
        if response.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if response.len() > CONNECT_RESPONSE_LIMIT {
            return Err(FetchError::Transport {
                code: TransportCode::Proxy,
                url: url.to_string(),
                message: "proxy CONNECT response too large".into(),
            });
        }
    }

    let status_line = response
        .split(|&b| b == b'\r')
        .next()
        .map(|line| String::from_utf8_lossy(line).to_string())
        .unwrap_or_default();
    if status_line.split(' ').nth(1) == Some("200") {
        Ok(())
    } else {
        Err(FetchError::Transport {
            code: TransportCode::Proxy,
            url: url.to_string(),
            message: format!("proxy CONNECT failed: {}", status_line),
        })
    }
}
