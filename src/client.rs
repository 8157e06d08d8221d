//! The fetch orchestrator.
//!
//! [`Fetcher`] drives the cache-mode state machine: consult the store,
//! apply freshness rules, revalidate with conditional requests, fall
//! back to the network with retries, and tee storable responses back
//! into the cache. [`Fetcher::defaults`] pre-binds a URL and option set
//! and composes recursively.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use http::header::WARNING;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::agent::{
    resolve_proxy, Agent, AgentConfig, AgentKey, AgentPool, TlsMaterial, DEFAULT_MAX_SOCKETS,
};
use crate::base::error::FetchError;
use crate::cache::integrity::{Integrity, IntegrityVerifier};
use crate::cache::policy::{
    append_warning, has_conditional_headers, strip_stale_warnings, CachePolicy,
};
use crate::cache::store::{millis_to_system_time, CacheStore, X_LOCAL_CACHE_TIME};
use crate::cache::tee::tee_body;
use crate::cache::{CacheMode, DiskCache};
use crate::http::body::Body;
use crate::http::request::Request;
use crate::http::response::{Response, ResponseBody};
use crate::http::retry::{self, RetryConfig, ATTEMPTS_HEADER};
use crate::transport::{HyperTransport, RedirectMode, Transport};

/// Where cached entries live: a directory served by the built-in disk
/// store, or a caller-supplied store implementation.
#[derive(Clone)]
pub enum CacheManager {
    Path(PathBuf),
    Handle(Arc<dyn CacheStore>),
}

impl CacheManager {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        CacheManager::Path(path.into())
    }

    fn store(&self) -> Arc<dyn CacheStore> {
        match self {
            CacheManager::Path(path) => Arc::new(DiskCache::new(path.clone())),
            CacheManager::Handle(store) => Arc::clone(store),
        }
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheManager::Path(path) => f.debug_tuple("CacheManager::Path").field(path).finish(),
            CacheManager::Handle(_) => f.write_str("CacheManager::Handle(..)"),
        }
    }
}

/// Agent selection for a request.
#[derive(Debug, Clone, Default)]
pub enum AgentOption {
    /// Use the fetcher's pool, keyed by scheme, proxy, and TLS material.
    #[default]
    Auto,
    /// One-shot connection, `Connection: close`, no reuse.
    Off,
    /// Use this agent and bypass the pool.
    Handle(Arc<Agent>),
}

/// Per-request (or per-fetcher, via [`Fetcher::defaults`]) options.
#[derive(Debug, Default)]
pub struct Options {
    pub method: Option<Method>,
    pub headers: HeaderMap,
    pub body: Option<Body>,
    pub cache_manager: Option<CacheManager>,
    pub cache: Option<CacheMode>,
    pub integrity: Option<Integrity>,
    pub retry: Option<RetryConfig>,
    pub timeout: Option<Duration>,
    pub proxy: Option<Url>,
    pub agent: Option<AgentOption>,
    pub ca: Option<Vec<u8>>,
    pub cert: Option<Vec<u8>>,
    pub key: Option<Vec<u8>>,
    pub max_sockets: Option<usize>,
    pub redirect: Option<RedirectMode>,
    pub follow: Option<usize>,
    pub compress: Option<bool>,
    pub size: Option<u64>,
}

impl Clone for Options {
    fn clone(&self) -> Self {
        Self {
            method: self.method.clone(),
            headers: self.headers.clone(),
            // Streamed bodies are one-shot and do not survive a clone.
            body: self.body.as_ref().and_then(|b| b.clone_rewound()),
            cache_manager: self.cache_manager.clone(),
            cache: self.cache,
            integrity: self.integrity.clone(),
            retry: self.retry.clone(),
            timeout: self.timeout,
            proxy: self.proxy.clone(),
            agent: self.agent.clone(),
            ca: self.ca.clone(),
            cert: self.cert.clone(),
            key: self.key.clone(),
            max_sockets: self.max_sockets,
            redirect: self.redirect,
            follow: self.follow,
            compress: self.compress,
            size: self.size,
        }
    }
}

impl Options {
    /// Merge these per-call options over a base set; per-call values win
    /// on collisions, headers merge name-wise.
    pub(crate) fn merged_over(mut self, base: &Options) -> Options {
        let mut headers = base.headers.clone();
        for name in self.headers.keys() {
            headers.remove(name);
        }
        for (name, value) in self.headers.iter() {
            headers.append(name.clone(), value.clone());
        }

        Options {
            method: self.method.take().or_else(|| base.method.clone()),
            headers,
            body: self
                .body
                .take()
                .or_else(|| base.body.as_ref().and_then(|b| b.clone_rewound())),
            cache_manager: self
                .cache_manager
                .take()
                .or_else(|| base.cache_manager.clone()),
            cache: self.cache.or(base.cache),
            integrity: self.integrity.take().or_else(|| base.integrity.clone()),
            retry: self.retry.take().or_else(|| base.retry.clone()),
            timeout: self.timeout.or(base.timeout),
            proxy: self.proxy.take().or_else(|| base.proxy.clone()),
            agent: self.agent.take().or_else(|| base.agent.clone()),
            ca: self.ca.take().or_else(|| base.ca.clone()),
            cert: self.cert.take().or_else(|| base.cert.clone()),
            key: self.key.take().or_else(|| base.key.clone()),
            max_sockets: self.max_sockets.or(base.max_sockets),
            redirect: self.redirect.or(base.redirect),
            follow: self.follow.or(base.follow),
            compress: self.compress.or(base.compress),
            size: self.size.or(base.size),
        }
    }
}

/// The cached-fetch client.
///
/// Owns the agent pool and the transport; wrappers created with
/// [`Fetcher::defaults`] share both.
pub struct Fetcher {
    base_url: Option<Url>,
    base_opts: Options,
    pool: Arc<AgentPool>,
    transport: Arc<dyn Transport>,
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher {
    pub fn new() -> Self {
        Self::with_transport(Arc::new(HyperTransport::new()))
    }

    /// Build a fetcher over a custom transport implementation.
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self {
            base_url: None,
            base_opts: Options::default(),
            pool: Arc::new(AgentPool::new()),
            transport,
        }
    }

    /// Pre-bind a base URL and option set. The returned fetcher shares
    /// this one's agent pool and transport, and exposes `defaults` again
    /// so wrappers compose.
    pub fn defaults(
        &self,
        base_url: Option<&str>,
        base_opts: Options,
    ) -> Result<Fetcher, FetchError> {
        let base_url = match base_url {
            Some(url) => Some(self.resolve_url(url)?),
            None => self.base_url.clone(),
        };
        Ok(Fetcher {
            base_url,
            base_opts: base_opts.merged_over(&self.base_opts),
            pool: Arc::clone(&self.pool),
            transport: Arc::clone(&self.transport),
        })
    }

    fn resolve_url(&self, url: &str) -> Result<Url, FetchError> {
        let parsed = match &self.base_url {
            Some(base) => base.join(url),
            None => Url::parse(url),
        };
        parsed.map_err(|_| FetchError::InvalidUrl(url.to_string()))
    }

    /// Fetch a URL, consulting and updating the cache per the requested
    /// cache mode.
    pub async fn fetch(&self, url: &str, opts: Options) -> Result<Response, FetchError> {
        let opts = opts.merged_over(&self.base_opts);
        let url = self.resolve_url(url)?;
        self.run(url, opts).await
    }

    async fn run(&self, url: Url, mut opts: Options) -> Result<Response, FetchError> {
        let method = opts.method.take().unwrap_or(Method::GET);
        let body = opts.body.take().unwrap_or_default();
        let mut req = Request::new(method, url)
            .with_headers(opts.headers.clone())
            .with_body(body);

        let Some(store) = opts.cache_manager.as_ref().map(|m| m.store()) else {
            let res = self.network_roundtrip(&mut req, &opts).await?;
            return finalize_integrity(&req, res, &opts);
        };

        // Mutating methods never read the cache; a successful response
        // invalidates the entry under the same key.
        if !req.is_safe_method() {
            let res = self.network_roundtrip(&mut req, &opts).await?;
            if res.status().is_success() || res.status().is_redirection() {
                match store.delete(&req).await {
                    Ok(true) => debug!(url = %req.url, "invalidated cache entry"),
                    Ok(false) => {}
                    Err(err) => warn!(error = %err, "cache invalidation failed"),
                }
            }
            return finalize_integrity(&req, res, &opts);
        }

        let mut mode = opts.cache.unwrap_or_default();
        if mode == CacheMode::Default && has_conditional_headers(&req.headers) {
            // The caller is doing its own validation.
            mode = CacheMode::NoStore;
        }

        match mode {
            CacheMode::NoStore => {
                let res = self.network_roundtrip(&mut req, &opts).await?;
                finalize_integrity(&req, res, &opts)
            }
            CacheMode::Reload => self.fetch_and_store(&mut req, &opts, &store).await,
            _ => match store.lookup(&req, &opts).await? {
                None => {
                    if mode == CacheMode::OnlyIfCached {
                        return Err(FetchError::NotCached {
                            url: req.url.to_string(),
                        });
                    }
                    debug!(url = %req.url, "cache miss");
                    self.fetch_and_store(&mut req, &opts, &store).await
                }
                Some(cached) => match mode {
                    CacheMode::OnlyIfCached | CacheMode::ForceCache => {
                        debug!(url = %req.url, "serving cache entry unconditionally");
                        Ok(finish_cache_hit(cached, &req))
                    }
                    CacheMode::NoCache => self.revalidate(&mut req, cached, &opts, &store).await,
                    _ => {
                        let policy = policy_for(&req, &cached);
                        if policy.is_fresh() {
                            debug!(url = %req.url, "serving fresh cache entry");
                            Ok(finish_cache_hit(cached, &req))
                        } else {
                            debug!(url = %req.url, "cache entry stale, revalidating");
                            self.revalidate(&mut req, cached, &opts, &store).await
                        }
                    }
                },
            },
        }
    }

    async fn fetch_and_store(
        &self,
        req: &mut Request,
        opts: &Options,
        store: &Arc<dyn CacheStore>,
    ) -> Result<Response, FetchError> {
        let res = self.network_roundtrip(req, opts).await?;
        if CachePolicy::storable(&req.method, res.status(), res.headers()) {
            return store.put(req, res, opts).await;
        }
        finalize_integrity(req, res, opts)
    }

    /// Revalidate a stale entry with a conditional request.
    async fn revalidate(
        &self,
        req: &mut Request,
        cached: Response,
        opts: &Options,
        store: &Arc<dyn CacheStore>,
    ) -> Result<Response, FetchError> {
        let policy = policy_for(req, &cached);

        let mut cond_headers = req.headers.clone();
        for (name, value) in policy.conditional_headers(&req.method).iter() {
            cond_headers.insert(name.clone(), value.clone());
        }
        let mut cond_req = Request::new(req.method.clone(), req.url.clone())
            .with_headers(cond_headers)
            .with_body(req.body.for_attempt());

        match self.network_roundtrip(&mut cond_req, opts).await {
            Ok(res) if res.status() == StatusCode::NOT_MODIFIED => {
                let attempts = res.headers().get(ATTEMPTS_HEADER).cloned();
                let mut fresh_headers = res.headers().clone();
                fresh_headers.remove(ATTEMPTS_HEADER);

                let modified = policy.revalidation_modified(&fresh_headers);
                let merged = policy.merge_not_modified(&fresh_headers);

                // Persist the refreshed metadata; serving proceeds even
                // if the write fails.
                let refresh = Response::new(
                    StatusCode::NOT_MODIFIED,
                    merged.clone(),
                    req.url.clone(),
                    ResponseBody::Empty,
                );
                if let Err(err) = store.put(req, refresh, opts).await {
                    warn!(error = %err, url = %req.url, "failed to refresh cache metadata");
                }

                let text = if modified {
                    "Revalidation failed even with 304 response. Using stale body with new headers."
                } else {
                    "Local cached response stale"
                };
                let size = cached.size();
                let mut headers = merged;
                append_warning(&mut headers, 110, req.url.host_str().unwrap_or(""), text);
                if let Some(attempts) = attempts {
                    headers.insert(ATTEMPTS_HEADER, attempts);
                }
                Ok(Response::new(
                    StatusCode::NOT_MODIFIED,
                    headers,
                    req.url.clone(),
                    cached.into_body(),
                )
                .with_size(size))
            }
            Ok(res) if res.status().is_server_error() && policy.allows_stale() => {
                debug!(status = %res.status(), url = %req.url, "revalidation failed, serving stale");
                Ok(serve_stale(
                    cached,
                    req,
                    &format!(
                        "Revalidation failed with status {}. Returning stale response",
                        res.status().as_u16()
                    ),
                ))
            }
            Ok(res) => {
                // A full response replaces the entry when storable;
                // terminal client errors pass through.
                if CachePolicy::storable(&req.method, res.status(), res.headers()) {
                    return store.put(req, res, opts).await;
                }
                finalize_integrity(req, res, opts)
            }
            Err(err) => {
                let transport_failure = matches!(
                    err,
                    FetchError::Transport { .. } | FetchError::RequestTimeout { .. }
                );
                if transport_failure && policy.allows_stale() {
                    debug!(code = err.code(), url = %req.url, "revalidation errored, serving stale");
                    return Ok(serve_stale(
                        cached,
                        req,
                        &format!(
                            "Revalidation failed with error {}. Returning stale response",
                            err.code()
                        ),
                    ));
                }
                Err(err)
            }
        }
    }

    /// One network fetch with the retry engine around it.
    async fn network_roundtrip(
        &self,
        req: &mut Request,
        opts: &Options,
    ) -> Result<Response, FetchError> {
        let agent = self.resolve_agent(&req.url, opts)?;
        let retry_cfg = opts.retry.clone().unwrap_or_default();
        let can_retry = retry::request_retryable(&req.method, &req.body);
        let max_attempts = if can_retry { retry_cfg.max_attempts() } else { 1 };

        let mut attempt = 0u32;
        let mut res = loop {
            attempt += 1;
            let attempt_req = Request::new(req.method.clone(), req.url.clone())
                .with_headers(req.headers.clone())
                .with_body(req.body.for_attempt());

            let outcome = match opts.timeout {
                Some(timeout) => {
                    let roundtrip = self
                        .transport
                        .roundtrip(attempt_req, Arc::clone(&agent), opts);
                    match tokio::time::timeout(timeout, roundtrip).await {
                        Ok(result) => result,
                        Err(_) => Err(FetchError::RequestTimeout {
                            url: req.url.to_string(),
                            after_ms: timeout.as_millis() as u64,
                        }),
                    }
                }
                None => {
                    self.transport
                        .roundtrip(attempt_req, Arc::clone(&agent), opts)
                        .await
                }
            };

            match outcome {
                Ok(res) => {
                    if retry::retriable_status(res.status()) && attempt < max_attempts {
                        let delay = retry::backoff_delay(attempt, &retry_cfg);
                        debug!(
                            status = %res.status(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "retrying after retriable status"
                        );
                        drop(res);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    break res;
                }
                Err(err) if err.is_transient() && can_retry && attempt < max_attempts => {
                    let delay = retry::backoff_delay(attempt, &retry_cfg);
                    debug!(
                        code = err.code(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        };

        if let Ok(value) = HeaderValue::from_str(&attempt.to_string()) {
            res.headers_mut().insert(ATTEMPTS_HEADER, value);
        }
        Ok(res)
    }

    fn resolve_agent(&self, url: &Url, opts: &Options) -> Result<Arc<Agent>, FetchError> {
        let tls = TlsMaterial {
            ca: opts.ca.clone(),
            cert: opts.cert.clone(),
            key: opts.key.clone(),
        };
        let max_sockets = opts.max_sockets.unwrap_or(DEFAULT_MAX_SOCKETS);

        match opts.agent.clone().unwrap_or_default() {
            AgentOption::Handle(agent) => Ok(agent),
            AgentOption::Off => {
                let proxy = resolve_proxy(opts.proxy.as_ref(), url.scheme());
                Agent::new(AgentConfig {
                    proxy,
                    tls,
                    max_sockets,
                    keepalive: false,
                })
                .map(Arc::new)
            }
            AgentOption::Auto => {
                let proxy = resolve_proxy(opts.proxy.as_ref(), url.scheme());
                let key = AgentKey::new(url.scheme() == "https", proxy.as_ref(), &tls);
                self.pool.checkout(key, move || {
                    Agent::new(AgentConfig {
                        proxy,
                        tls,
                        max_sockets,
                        keepalive: true,
                    })
                })
            }
        }
    }
}

/// One-shot fetch with a fresh [`Fetcher`].
pub async fn fetch(url: &str, opts: Options) -> Result<Response, FetchError> {
    Fetcher::new().fetch(url, opts).await
}

fn policy_for(req: &Request, cached: &Response) -> CachePolicy {
    let time_saved = cached
        .headers()
        .get(X_LOCAL_CACHE_TIME)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(millis_to_system_time)
        .unwrap_or_else(SystemTime::now);
    CachePolicy::new(&req.headers, cached.headers(), time_saved)
}

/// Prepare a served cache entry: strip 1xx warnings and flag heuristic
/// freshness.
fn finish_cache_hit(mut res: Response, req: &Request) -> Response {
    let heuristic = policy_for(req, &res).uses_heuristic_freshness();
    strip_stale_warnings(res.headers_mut());
    if heuristic && !res.headers().contains_key(WARNING) {
        append_warning(
            res.headers_mut(),
            113,
            req.url.host_str().unwrap_or(""),
            "Used heuristics to calculate cache freshness",
        );
    }
    res
}

fn serve_stale(mut cached: Response, req: &Request, text: &str) -> Response {
    strip_stale_warnings(cached.headers_mut());
    append_warning(
        cached.headers_mut(),
        111,
        req.url.host_str().unwrap_or(""),
        text,
    );
    cached
}

/// Attach integrity verification to a response that is not being teed
/// into a store.
fn finalize_integrity(
    req: &Request,
    mut res: Response,
    opts: &Options,
) -> Result<Response, FetchError> {
    if let Some(integrity) = &opts.integrity {
        let verifier = IntegrityVerifier::new(integrity.clone(), req.url.to_string());
        let body = res.replace_body(ResponseBody::Empty);
        res.replace_body(tee_body(body, None, Some(verifier)));
    }
    Ok(res)
}
