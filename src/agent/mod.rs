//! Connection agents and the bounded agent pool.
//!
//! An agent owns everything a destination class needs: TLS
//! configuration, an optional proxy, a keepalive connection pool, and a
//! per-destination socket limit. Agents are memoized in an LRU keyed by
//! scheme class, proxy, and TLS material, so requests with the same
//! security posture share sockets and nothing else does.

pub mod proxy;

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use rustls::{ClientConfig, RootCertStore};
use sha2::{Digest, Sha256};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use url::Url;

use crate::base::error::{FetchError, TransportCode};
use crate::cache::key::hex_digest;

pub use proxy::{resolve_proxy, resolve_proxy_with, ProxyConfig};

/// How many distinct agents the pool keeps alive.
const AGENT_POOL_CAPACITY: usize = 50;

/// Default concurrent sockets per destination.
pub const DEFAULT_MAX_SOCKETS: usize = 15;

/// Caller-supplied TLS material forwarded to the agent.
#[derive(Debug, Clone, Default)]
pub struct TlsMaterial {
    /// Extra trust anchors, PEM.
    pub ca: Option<Vec<u8>>,
    /// Client certificate chain, PEM.
    pub cert: Option<Vec<u8>>,
    /// Client private key, PEM.
    pub key: Option<Vec<u8>>,
}

fn material_hash(material: &Option<Vec<u8>>) -> Option<String> {
    material
        .as_ref()
        .map(|bytes| hex_digest(&Sha256::digest(bytes)))
}

/// Memoization key for the agent pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentKey {
    is_https: bool,
    proxy: String,
    ca: Option<String>,
    cert: Option<String>,
    key: Option<String>,
}

impl AgentKey {
    pub fn new(is_https: bool, proxy: Option<&ProxyConfig>, tls: &TlsMaterial) -> Self {
        Self {
            is_https,
            proxy: proxy
                .map(|p| p.descriptor())
                .unwrap_or_else(|| "none".to_string()),
            ca: material_hash(&tls.ca),
            cert: material_hash(&tls.cert),
            key: material_hash(&tls.key),
        }
    }
}

/// Configuration an agent is built from.
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    pub proxy: Option<ProxyConfig>,
    pub tls: TlsMaterial,
    pub max_sockets: usize,
    /// False for one-shot agents: no connection reuse, and the transport
    /// sends `Connection: close`.
    pub keepalive: bool,
}

/// A pooled idle connection: the HTTP/1 send handle plus the socket slot
/// it occupies.
pub(crate) struct PooledConn {
    pub sender: hyper::client::conn::http1::SendRequest<crate::transport::OutboundBody>,
    pub _permit: OwnedSemaphorePermit,
}

/// Per-destination connection agent.
pub struct Agent {
    config: AgentConfig,
    tls_config: Arc<ClientConfig>,
    idle: Mutex<HashMap<String, VecDeque<PooledConn>>>,
    limits: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("proxy", &self.config.proxy.as_ref().map(|p| p.descriptor()))
            .field("max_sockets", &self.config.max_sockets)
            .field("keepalive", &self.config.keepalive)
            .finish()
    }
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, FetchError> {
        let tls_config = build_tls_config(&config.tls)?;
        Ok(Self {
            config,
            tls_config,
            idle: Mutex::new(HashMap::new()),
            limits: Mutex::new(HashMap::new()),
        })
    }

    /// A keepalive agent with default limits and no special TLS material.
    pub fn default_agent() -> Result<Self, FetchError> {
        Self::new(AgentConfig {
            max_sockets: DEFAULT_MAX_SOCKETS,
            keepalive: true,
            ..Default::default()
        })
    }

    pub fn keepalive(&self) -> bool {
        self.config.keepalive
    }

    pub fn tls_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.tls_config)
    }

    /// The proxy to use for a target, honoring the bypass hook.
    pub fn proxy_for(&self, target: &Url) -> Option<&ProxyConfig> {
        self.config
            .proxy
            .as_ref()
            .filter(|proxy| !proxy.bypasses(target))
    }

    /// Wait for a socket slot toward `dest` (`host:port`).
    pub(crate) async fn acquire_slot(
        &self,
        dest: &str,
    ) -> Result<OwnedSemaphorePermit, FetchError> {
        let semaphore = {
            let mut limits = self.limits.lock();
            Arc::clone(limits.entry(dest.to_string()).or_insert_with(|| {
                Arc::new(Semaphore::new(self.config.max_sockets.max(1)))
            }))
        };
        semaphore
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Transport {
                code: TransportCode::Io,
                url: dest.to_string(),
                message: "connection limiter closed".into(),
            })
    }

    /// Pop a live idle connection for `dest`, if any.
    pub(crate) fn checkout(&self, dest: &str) -> Option<PooledConn> {
        let mut idle = self.idle.lock();
        let queue = idle.get_mut(dest)?;
        while let Some(conn) = queue.pop_front() {
            if !conn.sender.is_closed() {
                return Some(conn);
            }
            // Dead connection; its permit frees with it.
        }
        None
    }

    /// Return a connection to the idle pool.
    pub(crate) fn checkin(&self, dest: &str, conn: PooledConn) {
        if !self.config.keepalive || conn.sender.is_closed() {
            return;
        }
        let mut idle = self.idle.lock();
        let queue = idle.entry(dest.to_string()).or_default();
        if queue.len() < self.config.max_sockets.max(1) {
            queue.push_back(conn);
        }
    }

}

fn build_tls_config(tls: &TlsMaterial) -> Result<Arc<ClientConfig>, FetchError> {
    let tls_err = |message: String| FetchError::Transport {
        code: TransportCode::Tls,
        url: String::new(),
        message,
    };

    let provider = rustls::crypto::ring::default_provider();
    let builder = ClientConfig::builder_with_provider(provider.into())
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_err(format!("unsupported TLS protocol versions: {}", e)))?;

    let mut roots = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let (_, ignored) = roots.add_parsable_certificates(certs);
            if ignored > 0 {
                tracing::warn!(ignored, "ignored invalid system trust anchors");
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to load system trust anchors");
        }
    }
    if let Some(ca) = &tls.ca {
        let mut reader = std::io::Cursor::new(ca.as_slice());
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| tls_err(format!("invalid CA certificate: {}", e)))?;
        roots.add_parsable_certificates(certs);
    }
    let builder = builder.with_root_certificates(roots);

    let config = match (&tls.cert, &tls.key) {
        (Some(cert), Some(key)) => {
            let mut cert_reader = std::io::Cursor::new(cert.as_slice());
            let certs = rustls_pemfile::certs(&mut cert_reader)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| tls_err(format!("invalid client certificate: {}", e)))?;
            let mut key_reader = std::io::Cursor::new(key.as_slice());
            let key = rustls_pemfile::private_key(&mut key_reader)
                .map_err(|e| tls_err(format!("invalid client key: {}", e)))?
                .ok_or_else(|| tls_err("no private key found in key material".into()))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| tls_err(format!("client auth rejected: {}", e)))?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

/// Bounded LRU of memoized agents.
pub struct AgentPool {
    inner: Mutex<LruCache<AgentKey, Arc<Agent>>>,
}

impl Default for AgentPool {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentPool {
    pub fn new() -> Self {
        let capacity = NonZeroUsize::new(AGENT_POOL_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Fetch the agent for `key`, building and caching it on first use.
    pub fn checkout(
        &self,
        key: AgentKey,
        build: impl FnOnce() -> Result<Agent, FetchError>,
    ) -> Result<Arc<Agent>, FetchError> {
        let mut inner = self.inner.lock();
        if let Some(agent) = inner.get(&key) {
            return Ok(Arc::clone(agent));
        }
        let agent = Arc::new(build()?);
        inner.put(key, Arc::clone(&agent));
        Ok(agent)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
