//! In-memory cache store.
//!
//! Useful for tests and for callers that pass a store handle instead of
//! a cache directory. Bodies above [`MAX_MEM_SIZE`] are not retained;
//! the tee still serves the caller, the entry is simply dropped.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, Method, StatusCode};
use std::sync::Arc;

use crate::base::error::FetchError;
use crate::cache::integrity::{sha256_digest_string, IntegrityVerifier};
use crate::cache::key::cache_key;
use crate::cache::store::{
    now_millis, strip_local_headers, urls_equivalent, vary_matches, CacheStore, X_LOCAL_CACHE_HASH,
    X_LOCAL_CACHE_KEY, X_LOCAL_CACHE_TIME,
};
use crate::cache::tee::{tee_body, EntrySink};
use crate::cache::MAX_MEM_SIZE;
use crate::client::Options;
use crate::http::request::Request;
use crate::http::response::{Response, ResponseBody};

#[derive(Debug, Clone)]
struct MemoryEntry {
    url: String,
    req_headers: HeaderMap,
    res_headers: HeaderMap,
    body: Bytes,
    integrity: String,
    time: u64,
}

/// Process-local cache store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Arc<DashMap<String, MemoryEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[async_trait(?Send)]
impl CacheStore for MemoryCache {
    async fn lookup(&self, req: &Request, opts: &Options) -> Result<Option<Response>, FetchError> {
        let key = cache_key(&req.method, &req.url);
        let Some(entry) = self.entries.get(&key).map(|e| e.value().clone()) else {
            return Ok(None);
        };

        if !urls_equivalent(&entry.url, &req.url) {
            return Ok(None);
        }
        if !vary_matches(&entry.res_headers, &entry.req_headers, &req.headers) {
            return Ok(None);
        }
        if let Some(integrity) = &opts.integrity {
            if !integrity.accepts_digest(&entry.integrity) {
                return Ok(None);
            }
        }

        let mut headers = entry.res_headers.clone();
        for (name, value) in [
            (X_LOCAL_CACHE_KEY, key.clone()),
            (X_LOCAL_CACHE_HASH, entry.integrity.clone()),
            (X_LOCAL_CACHE_TIME, entry.time.to_string()),
        ] {
            if let Ok(value) = http::HeaderValue::from_str(&value) {
                headers.insert(name, value);
            }
        }

        let size = entry.body.len() as u64;
        let body = if req.method == Method::HEAD {
            ResponseBody::Empty
        } else {
            ResponseBody::Full(entry.body.clone())
        };
        Ok(Some(
            Response::new(StatusCode::OK, headers, req.url.clone(), body).with_size(Some(size)),
        ))
    }

    async fn put(
        &self,
        req: &Request,
        mut res: Response,
        opts: &Options,
    ) -> Result<Response, FetchError> {
        let key = cache_key(&req.method, &req.url);

        if req.method == Method::HEAD || res.status() == StatusCode::NOT_MODIFIED {
            if let Some(mut entry) = self.entries.get_mut(&key) {
                let mut res_headers = res.headers().clone();
                strip_local_headers(&mut res_headers);
                entry.res_headers = res_headers;
                entry.req_headers = req.headers.clone();
                entry.time = now_millis();
                let body = if req.method == Method::HEAD {
                    ResponseBody::Empty
                } else {
                    ResponseBody::Full(entry.body.clone())
                };
                res.replace_body(body);
            }
            return Ok(res);
        }
        if res.status() != StatusCode::OK {
            return Ok(res);
        }

        let mut res_headers = res.headers().clone();
        strip_local_headers(&mut res_headers);
        let sink = MemoryEntrySink {
            entries: Arc::clone(&self.entries),
            key,
            url: req.url.to_string(),
            req_headers: req.headers.clone(),
            res_headers,
            buffer: Vec::new(),
            overflowed: false,
        };
        let verifier = opts
            .integrity
            .clone()
            .map(|i| IntegrityVerifier::new(i, req.url.to_string()));

        let body = res.replace_body(ResponseBody::Empty);
        res.replace_body(tee_body(body, Some(Box::new(sink)), verifier));
        Ok(res)
    }

    async fn delete(&self, req: &Request) -> Result<bool, FetchError> {
        let key = cache_key(&req.method, &req.url);
        Ok(self.entries.remove(&key).is_some())
    }
}

struct MemoryEntrySink {
    entries: Arc<DashMap<String, MemoryEntry>>,
    key: String,
    url: String,
    req_headers: HeaderMap,
    res_headers: HeaderMap,
    buffer: Vec<u8>,
    overflowed: bool,
}

#[async_trait(?Send)]
impl EntrySink for MemoryEntrySink {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), FetchError> {
        if self.overflowed {
            return Ok(());
        }
        if (self.buffer.len() + chunk.len()) as u64 > MAX_MEM_SIZE {
            self.buffer = Vec::new();
            self.overflowed = true;
            return Ok(());
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    async fn commit(self: Box<Self>, verified: Option<String>) -> Result<(), FetchError> {
        if self.overflowed {
            return Ok(());
        }
        let integrity = verified.unwrap_or_else(|| sha256_digest_string(&self.buffer));
        let entry = MemoryEntry {
            url: self.url,
            req_headers: self.req_headers,
            res_headers: self.res_headers,
            body: Bytes::from(self.buffer),
            integrity,
            time: now_millis(),
        };
        self.entries.insert(self.key, entry);
        Ok(())
    }
}
