//! Content-addressed disk store.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/index/<aa>/<bb>/<entry-id>.json   metadata document
//! <root>/content/sha256/<aa>/<bb>/<hex>    body blob, addressed by digest
//! <root>/tmp/tmp_<pid>_<n>                 in-flight writes
//! ```
//!
//! Blobs land via a hashing temp-file writer and a rename; the index
//! document is renamed into place after the blob, so concurrent readers
//! observe either the prior entry or the complete new one. Reads verify
//! the blob digest against the recorded one.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::warn;

use crate::base::error::FetchError;
use crate::cache::integrity::IntegrityVerifier;
use crate::cache::key::{cache_key, entry_id, hex_digest};
use crate::cache::store::{
    now_millis, strip_local_headers, urls_equivalent, vary_matches, CacheStore, X_LOCAL_CACHE,
    X_LOCAL_CACHE_HASH, X_LOCAL_CACHE_KEY, X_LOCAL_CACHE_TIME,
};
use crate::cache::tee::{tee_body, EntrySink};
use crate::cache::MAX_MEM_SIZE;
use crate::client::Options;
use crate::http::request::Request;
use crate::http::response::{Response, ResponseBody};

const READ_CHUNK: usize = 64 * 1024;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Persisted per-entry metadata document.
#[derive(Debug, Serialize, Deserialize)]
struct EntryMetadata {
    key: String,
    url: String,
    integrity: String,
    content: String,
    size: u64,
    time: u64,
    req_headers: Vec<(String, String)>,
    res_headers: Vec<(String, String)>,
}

fn headermap_to_vec(map: &HeaderMap) -> Vec<(String, String)> {
    let mut items = Vec::new();
    for (name, value) in map.iter() {
        if let Ok(value) = value.to_str() {
            items.push((name.as_str().to_string(), value.to_string()));
        }
    }
    items
}

fn vec_to_headermap(items: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in items {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(name.as_str()),
            http::HeaderValue::from_str(value),
        ) {
            map.append(name, value);
        }
    }
    map
}

/// Content-addressed store rooted at a cache directory.
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index_path(&self, id: &str) -> PathBuf {
        let (first, rest) = id.split_at(2);
        let (second, _) = rest.split_at(2);
        self.root
            .join("index")
            .join(first)
            .join(second)
            .join(format!("{}.json", id))
    }

    fn content_path(&self, hex: &str) -> PathBuf {
        let (first, rest) = hex.split_at(2);
        let (second, _) = rest.split_at(2);
        self.root
            .join("content")
            .join("sha256")
            .join(first)
            .join(second)
            .join(hex)
    }

    fn tmp_path(&self) -> PathBuf {
        let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.root
            .join("tmp")
            .join(format!("tmp_{}_{}", std::process::id(), n))
    }

    async fn read_metadata(&self, id: &str) -> Result<Option<EntryMetadata>, FetchError> {
        let path = self.index_path(id);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(FetchError::store("failed to read cache index entry", err)),
        };
        match serde_json::from_slice(&data) {
            Ok(meta) => Ok(Some(meta)),
            Err(err) => {
                // A corrupt document is a miss, not a hard failure.
                warn!(path = %path.display(), error = %err, "discarding unreadable cache metadata");
                let _ = fs::remove_file(&path).await;
                Ok(None)
            }
        }
    }

    /// Write a file atomically: temp file in `<root>/tmp`, then rename.
    async fn write_atomic(&self, final_path: &Path, data: &[u8]) -> Result<(), FetchError> {
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::store("failed to create cache directory", e))?;
        }
        let tmp = self.tmp_path();
        if let Some(parent) = tmp.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::store("failed to create cache tmp directory", e))?;
        }
        fs::write(&tmp, data)
            .await
            .map_err(|e| FetchError::store("failed to write cache file", e))?;
        fs::rename(&tmp, final_path)
            .await
            .map_err(|e| FetchError::store("failed to finalize cache file", e))?;
        Ok(())
    }

    async fn write_metadata(&self, id: &str, meta: &EntryMetadata) -> Result<(), FetchError> {
        let data = serde_json::to_vec(meta)
            .map_err(|e| FetchError::store_corrupt(format!("metadata encoding failed: {}", e)))?;
        self.write_atomic(&self.index_path(id), &data).await
    }

    /// Lazy body stream for a stored blob. Small blobs are read in one
    /// call; larger ones stream in chunks. Either way the digest is
    /// verified against the recorded content hash.
    fn stored_body(&self, content: String, size: u64, url: String) -> ResponseBody {
        enum State {
            Init,
            Stream { file: fs::File, hasher: Sha256 },
            Done,
        }
        struct Ctx {
            cache: DiskCache,
            content: String,
            size: u64,
            url: String,
            state: State,
        }

        let ctx = Ctx {
            cache: self.clone(),
            content,
            size,
            url,
            state: State::Init,
        };

        ResponseBody::stream(futures::stream::unfold(ctx, |mut ctx| async move {
            loop {
                match std::mem::replace(&mut ctx.state, State::Done) {
                    State::Done => return None,
                    State::Init => {
                        let path = ctx.cache.content_path(&ctx.content);
                        if ctx.size <= MAX_MEM_SIZE {
                            match fs::read(&path).await {
                                Ok(data) => {
                                    let actual = hex_digest(&Sha256::digest(&data));
                                    if actual == ctx.content {
                                        return Some((Ok(Bytes::from(data)), ctx));
                                    }
                                    let err = FetchError::BadChecksum {
                                        url: ctx.url.clone(),
                                        expected: ctx.content.clone(),
                                        actual,
                                    };
                                    return Some((Err(err), ctx));
                                }
                                Err(err) => {
                                    let err =
                                        FetchError::store("failed to read cached body", err);
                                    return Some((Err(err), ctx));
                                }
                            }
                        }
                        match fs::File::open(&path).await {
                            Ok(file) => {
                                ctx.state = State::Stream {
                                    file,
                                    hasher: Sha256::new(),
                                };
                                continue;
                            }
                            Err(err) => {
                                let err = FetchError::store("failed to open cached body", err);
                                return Some((Err(err), ctx));
                            }
                        }
                    }
                    State::Stream { mut file, mut hasher } => {
                        let mut buf = BytesMut::with_capacity(READ_CHUNK);
                        match file.read_buf(&mut buf).await {
                            Ok(0) => {
                                let actual = hex_digest(&hasher.finalize());
                                if actual == ctx.content {
                                    return None;
                                }
                                let err = FetchError::BadChecksum {
                                    url: ctx.url.clone(),
                                    expected: ctx.content.clone(),
                                    actual,
                                };
                                return Some((Err(err), ctx));
                            }
                            Ok(_) => {
                                hasher.update(&buf);
                                ctx.state = State::Stream { file, hasher };
                                return Some((Ok(buf.freeze()), ctx));
                            }
                            Err(err) => {
                                let err = FetchError::store("failed to read cached body", err);
                                return Some((Err(err), ctx));
                            }
                        }
                    }
                }
            }
        }))
    }

    fn decorate(&self, headers: &mut HeaderMap, key: &str, meta: &EntryMetadata) {
        let encode = |s: &str| utf8_percent_encode(s, NON_ALPHANUMERIC).to_string();
        let pairs = [
            (X_LOCAL_CACHE, encode(&self.root.to_string_lossy())),
            (X_LOCAL_CACHE_KEY, encode(key)),
            (X_LOCAL_CACHE_HASH, meta.integrity.clone()),
            (X_LOCAL_CACHE_TIME, meta.time.to_string()),
        ];
        for (name, value) in pairs {
            if let Ok(value) = http::HeaderValue::from_str(&value) {
                headers.insert(name, value);
            }
        }
    }

    /// Refresh an entry's metadata without touching its body (HEAD and
    /// 304 writes).
    async fn refresh_metadata(
        &self,
        req: &Request,
        mut res: Response,
    ) -> Result<Response, FetchError> {
        let key = cache_key(&req.method, &req.url);
        let id = entry_id(&key);
        let Some(prior) = self.read_metadata(&id).await? else {
            return Ok(res);
        };

        let mut res_headers = res.headers().clone();
        strip_local_headers(&mut res_headers);
        let meta = EntryMetadata {
            key: key.clone(),
            url: prior.url.clone(),
            integrity: prior.integrity.clone(),
            content: prior.content.clone(),
            size: prior.size,
            time: now_millis(),
            req_headers: headermap_to_vec(&req.headers),
            res_headers: headermap_to_vec(&res_headers),
        };
        self.write_metadata(&id, &meta).await?;

        let body = if req.method == Method::HEAD {
            ResponseBody::Empty
        } else {
            self.stored_body(prior.content, prior.size, prior.url)
        };
        res.replace_body(body);
        Ok(res.with_size(Some(meta.size)))
    }
}

#[async_trait(?Send)]
impl CacheStore for DiskCache {
    async fn lookup(&self, req: &Request, opts: &Options) -> Result<Option<Response>, FetchError> {
        let key = cache_key(&req.method, &req.url);
        let id = entry_id(&key);
        let Some(meta) = self.read_metadata(&id).await? else {
            return Ok(None);
        };

        if !urls_equivalent(&meta.url, &req.url) {
            return Ok(None);
        }
        let stored_req = vec_to_headermap(&meta.req_headers);
        let stored_res = vec_to_headermap(&meta.res_headers);
        if !vary_matches(&stored_res, &stored_req, &req.headers) {
            return Ok(None);
        }
        if let Some(integrity) = &opts.integrity {
            if !integrity.accepts_digest(&meta.integrity) {
                return Ok(None);
            }
        }

        let mut headers = stored_res;
        self.decorate(&mut headers, &key, &meta);

        let body = if req.method == Method::HEAD {
            ResponseBody::Empty
        } else {
            self.stored_body(meta.content.clone(), meta.size, meta.url.clone())
        };
        let res = Response::new(StatusCode::OK, headers, req.url.clone(), body)
            .with_size(Some(meta.size));
        Ok(Some(res))
    }

    async fn put(
        &self,
        req: &Request,
        mut res: Response,
        opts: &Options,
    ) -> Result<Response, FetchError> {
        if req.method == Method::HEAD || res.status() == StatusCode::NOT_MODIFIED {
            return self.refresh_metadata(req, res).await;
        }
        if res.status() != StatusCode::OK {
            return Ok(res);
        }

        let key = cache_key(&req.method, &req.url);
        let id = entry_id(&key);
        let mut res_headers = res.headers().clone();
        strip_local_headers(&mut res_headers);

        let declared = res.size().or_else(|| {
            res.headers()
                .get(http::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
        });

        let sink = DiskEntrySink {
            cache: self.clone(),
            id,
            meta_key: key,
            url: req.url.to_string(),
            req_headers: headermap_to_vec(&req.headers),
            res_headers: headermap_to_vec(&res_headers),
            declared,
            buffer: Some(Vec::new()),
            file: None,
            hasher: Sha256::new(),
            size: 0,
            committed: false,
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
        let path = self.index_path(&entry_id(&key));
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(FetchError::store("failed to delete cache index entry", err)),
        }
    }
}

/// Hashing sink for one entry write.
///
/// Buffers in memory up to [`MAX_MEM_SIZE`], then spills to a temp file.
/// `commit` renames the blob into its content-addressed home and writes
/// the index document; an uncommitted sink removes its temp file on
/// drop.
struct DiskEntrySink {
    cache: DiskCache,
    id: String,
    meta_key: String,
    url: String,
    req_headers: Vec<(String, String)>,
    res_headers: Vec<(String, String)>,
    declared: Option<u64>,
    buffer: Option<Vec<u8>>,
    file: Option<(fs::File, PathBuf)>,
    hasher: Sha256,
    size: u64,
    committed: bool,
}

impl DiskEntrySink {
    async fn spill(&mut self) -> Result<(), FetchError> {
        let tmp = self.cache.tmp_path();
        if let Some(parent) = tmp.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::store("failed to create cache tmp directory", e))?;
        }
        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| FetchError::store("failed to create cache temp file", e))?;
        if let Some(buffer) = self.buffer.take() {
            file.write_all(&buffer)
                .await
                .map_err(|e| FetchError::store("failed to write cache temp file", e))?;
        }
        self.file = Some((file, tmp));
        Ok(())
    }
}

#[async_trait(?Send)]
impl EntrySink for DiskEntrySink {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), FetchError> {
        self.hasher.update(chunk);
        self.size += chunk.len() as u64;

        if self.file.is_none() {
            let over_declared = self.declared.map(|d| d > MAX_MEM_SIZE).unwrap_or(false);
            let over_buffered = self.size > MAX_MEM_SIZE;
            if over_declared || over_buffered {
                self.spill().await?;
            }
        }

        match &mut self.file {
            Some((file, _)) => {
                file.write_all(chunk)
                    .await
                    .map_err(|e| FetchError::store("failed to write cache temp file", e))?;
                file.flush()
                    .await
                    .map_err(|e| FetchError::store("failed to flush cache temp file", e))?;
            }
            None => {
                self.buffer
                    .get_or_insert_with(Vec::new)
                    .extend_from_slice(chunk);
            }
        }
        Ok(())
    }

    async fn commit(mut self: Box<Self>, verified: Option<String>) -> Result<(), FetchError> {
        let digest = std::mem::take(&mut self.hasher).finalize();
        let content = hex_digest(&digest);
        let integrity =
            verified.unwrap_or_else(|| format!("sha256-{}", STANDARD.encode(digest)));

        let content_path = self.cache.content_path(&content);
        if let Some(parent) = content_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::store("failed to create cache directory", e))?;
        }

        match (self.file.take(), self.buffer.take()) {
            (Some((mut file, tmp)), _) => {
                file.flush()
                    .await
                    .map_err(|e| FetchError::store("failed to flush cache temp file", e))?;
                drop(file);
                fs::rename(&tmp, &content_path)
                    .await
                    .map_err(|e| FetchError::store("failed to finalize cache body", e))?;
            }
            (None, Some(buffer)) => {
                self.cache.write_atomic(&content_path, &buffer).await?;
            }
            (None, None) => {
                self.cache.write_atomic(&content_path, &[]).await?;
            }
        }

        let meta = EntryMetadata {
            key: self.meta_key.clone(),
            url: self.url.clone(),
            integrity,
            content,
            size: self.size,
            time: now_millis(),
            req_headers: std::mem::take(&mut self.req_headers),
            res_headers: std::mem::take(&mut self.res_headers),
        };
        self.cache.write_metadata(&self.id, &meta).await?;
        self.committed = true;
        tracing::debug!(key = %meta.key, size = meta.size, "stored cache entry");
        Ok(())
    }
}

impl Drop for DiskEntrySink {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Some((file, tmp)) = self.file.take() {
            drop(file);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = fs::remove_file(&tmp).await;
                });
            } else {
                let _ = std::fs::remove_file(&tmp);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::integrity::{sha256_digest_string, Integrity};
    use tempfile::TempDir;
    use url::Url;

    fn get_request(url: &str) -> Request {
        Request::new(Method::GET, Url::parse(url).unwrap())
    }

    fn ok_response(url: &str, headers: &[(&str, &str)], body: &'static [u8]) -> Response {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                http::header::HeaderName::try_from(*name).unwrap(),
                http::HeaderValue::from_str(value).unwrap(),
            );
        }
        Response::new(
            StatusCode::OK,
            map,
            Url::parse(url).unwrap(),
            ResponseBody::full(Bytes::from_static(body)),
        )
    }

    async fn put_and_drain(cache: &DiskCache, req: &Request, res: Response) -> Bytes {
        let teed = cache.put(req, res, &Options::default()).await.unwrap();
        teed.bytes().await.unwrap()
    }

    #[tokio::test]
    async fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path());
        let req = get_request("https://example.com/data");
        let res = ok_response(
            "https://example.com/data",
            &[("cache-control", "max-age=300")],
            b"hello, world!",
        );

        let body = put_and_drain(&cache, &req, res).await;
        assert_eq!(body, Bytes::from_static(b"hello, world!"));

        let hit = cache
            .lookup(&req, &Options::default())
            .await
            .unwrap()
            .expect("entry should match");
        assert_eq!(hit.status(), StatusCode::OK);
        assert!(hit.headers().contains_key(X_LOCAL_CACHE_HASH));
        assert!(hit.headers().contains_key(X_LOCAL_CACHE_TIME));
        assert_eq!(hit.bytes().await.unwrap(), Bytes::from_static(b"hello, world!"));
    }

    #[tokio::test]
    async fn test_miss_without_entry() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path());
        let req = get_request("https://example.com/absent");
        assert!(cache
            .lookup(&req, &Options::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_query_mismatch_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path());
        let req = get_request("https://example.com/p?a=1");
        let res = ok_response("https://example.com/p?a=1", &[], b"one");
        put_and_drain(&cache, &req, res).await;

        let other = get_request("https://example.com/p?a=2");
        assert!(cache
            .lookup(&other, &Options::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_vary_mismatch_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path());

        let mut req = get_request("https://example.com/v");
        req.headers
            .insert("accept-encoding", "gzip".parse().unwrap());
        let res = ok_response(
            "https://example.com/v",
            &[("vary", "accept-encoding")],
            b"gzipped",
        );
        put_and_drain(&cache, &req, res).await;

        assert!(cache
            .lookup(&req, &Options::default())
            .await
            .unwrap()
            .is_some());

        let mut other = get_request("https://example.com/v");
        other.headers.insert("accept-encoding", "br".parse().unwrap());
        assert!(cache
            .lookup(&other, &Options::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_head_served_from_get_with_empty_body() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path());
        let req = get_request("https://example.com/asset");
        let res = ok_response("https://example.com/asset", &[], b"payload");
        put_and_drain(&cache, &req, res).await;

        let head = Request::new(Method::HEAD, Url::parse("https://example.com/asset").unwrap());
        let hit = cache
            .lookup(&head, &Options::default())
            .await
            .unwrap()
            .expect("HEAD matches the GET entry");
        assert_eq!(hit.bytes().await.unwrap(), Bytes::new());
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path());
        let req = get_request("https://example.com/gone");
        let res = ok_response("https://example.com/gone", &[], b"x");
        put_and_drain(&cache, &req, res).await;

        assert!(cache.delete(&req).await.unwrap());
        assert!(!cache.delete(&req).await.unwrap());
        assert!(cache
            .lookup(&req, &Options::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_integrity_filter_on_lookup() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path());
        let req = get_request("https://example.com/sri");
        let res = ok_response("https://example.com/sri", &[], b"verified bytes");
        put_and_drain(&cache, &req, res).await;

        let mut matching = Options::default();
        matching.integrity = Some(Integrity::parse(&sha256_digest_string(b"verified bytes")).unwrap());
        assert!(cache.lookup(&req, &matching).await.unwrap().is_some());

        let mut wrong = Options::default();
        wrong.integrity = Some(Integrity::parse(&sha256_digest_string(b"other bytes")).unwrap());
        assert!(cache.lookup(&req, &wrong).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_blob_fails_checksum() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path());
        let req = get_request("https://example.com/bits");
        let res = ok_response("https://example.com/bits", &[], b"original");
        put_and_drain(&cache, &req, res).await;

        // Flip the stored blob behind the index's back.
        let id = entry_id(&cache_key(&Method::GET, &req.url));
        let meta = cache.read_metadata(&id).await.unwrap().unwrap();
        std::fs::write(cache.content_path(&meta.content), b"tampered").unwrap();

        let hit = cache
            .lookup(&req, &Options::default())
            .await
            .unwrap()
            .unwrap();
        let err = hit.bytes().await.unwrap_err();
        assert_eq!(err.code(), "EBADCHECKSUM");
    }

    #[tokio::test]
    async fn test_large_body_streams_through_temp_file() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path());
        let req = get_request("https://example.com/large");

        let big = vec![0x5au8; (MAX_MEM_SIZE + 1024) as usize];
        let res = Response::new(
            StatusCode::OK,
            HeaderMap::new(),
            req.url.clone(),
            ResponseBody::full(Bytes::from(big.clone())),
        );
        let body = put_and_drain(&cache, &req, res).await;
        assert_eq!(body.len(), big.len());

        let hit = cache
            .lookup(&req, &Options::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.bytes().await.unwrap().len(), big.len());
    }

    #[tokio::test]
    async fn test_not_modified_refreshes_metadata_only() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path());
        let req = get_request("https://example.com/reval");
        let res = ok_response(
            "https://example.com/reval",
            &[("cache-control", "max-age=0"), ("etag", "\"v1\"")],
            b"cached body",
        );
        put_and_drain(&cache, &req, res).await;

        let mut refreshed_headers = HeaderMap::new();
        refreshed_headers.insert("cache-control", "max-age=600".parse().unwrap());
        refreshed_headers.insert("etag", "\"v1\"".parse().unwrap());
        let refresh = Response::new(
            StatusCode::NOT_MODIFIED,
            refreshed_headers,
            req.url.clone(),
            ResponseBody::Empty,
        );
        let merged = cache.put(&req, refresh, &Options::default()).await.unwrap();
        // The prior body is re-attached for the caller.
        assert_eq!(merged.bytes().await.unwrap(), Bytes::from_static(b"cached body"));

        let hit = cache
            .lookup(&req, &Options::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            hit.headers().get("cache-control").unwrap(),
            "max-age=600"
        );
        assert_eq!(hit.bytes().await.unwrap(), Bytes::from_static(b"cached body"));
    }

    #[tokio::test]
    async fn test_unread_body_stores_nothing() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path());
        let req = get_request("https://example.com/lazy");
        let res = ok_response("https://example.com/lazy", &[], b"never read");

        let teed = cache.put(&req, res, &Options::default()).await.unwrap();
        drop(teed);

        assert!(cache
            .lookup(&req, &Options::default())
            .await
            .unwrap()
            .is_none());
    }
}
