//! Cache store contract and the details-match rules shared by all
//! store implementations.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use http::header::VARY;
use http::{HeaderMap, HeaderName};
use url::Url;

use crate::base::error::FetchError;
use crate::client::Options;
use crate::http::request::Request;
use crate::http::response::Response;

/// Cache root path (URL-encoded), set on responses served from the
/// default disk store.
pub const X_LOCAL_CACHE: &str = "x-local-cache";
/// Cache key (URL-encoded) the entry was stored under.
pub const X_LOCAL_CACHE_KEY: &str = "x-local-cache-key";
/// Stored integrity digest of the entry body.
pub const X_LOCAL_CACHE_HASH: &str = "x-local-cache-hash";
/// Entry write timestamp, epoch milliseconds.
pub const X_LOCAL_CACHE_TIME: &str = "x-local-cache-time";

/// Pluggable cache store: the `match`/`put`/`delete` capability set.
#[async_trait(?Send)]
pub trait CacheStore: Send + Sync {
    /// The `match` operation: find a stored response for this request,
    /// applying URL, `Vary`, and integrity matching. Freshness is the
    /// caller's concern, so stale entries are still returned.
    async fn lookup(&self, req: &Request, opts: &Options) -> Result<Option<Response>, FetchError>;

    /// Store a response, returning a response whose body tees into the
    /// store as the caller reads it. HEAD and 304 responses refresh an
    /// existing entry's metadata without touching its body.
    async fn put(
        &self,
        req: &Request,
        res: Response,
        opts: &Options,
    ) -> Result<Response, FetchError>;

    /// Drop the index entry for this request's key. Returns whether an
    /// entry existed.
    async fn delete(&self, req: &Request) -> Result<bool, FetchError>;
}

/// URL equivalence for the details match: scheme, host, port, path, and
/// query must all agree. The query lives here rather than in the key.
pub(crate) fn urls_equivalent(stored: &str, req: &Url) -> bool {
    let Ok(stored) = Url::parse(stored) else {
        return false;
    };
    stored.scheme() == req.scheme()
        && stored.host_str() == req.host_str()
        && stored.port_or_known_default() == req.port_or_known_default()
        && stored.path() == req.path()
        && stored.query() == req.query()
}

/// `Vary` matching: `*` never matches; otherwise every named request
/// header must carry the same value now as when the entry was stored.
/// Field names compare case-insensitively.
pub(crate) fn vary_matches(
    stored_res: &HeaderMap,
    stored_req: &HeaderMap,
    req_headers: &HeaderMap,
) -> bool {
    for value in stored_res.get_all(VARY) {
        let Ok(value) = value.to_str() else {
            return false;
        };
        for field in value.split(',') {
            let field = field.trim();
            if field == "*" {
                return false;
            }
            let Ok(name) = HeaderName::try_from(field) else {
                return false;
            };
            if stored_req.get(&name) != req_headers.get(&name) {
                return false;
            }
        }
    }
    true
}

/// Strip the synthetic `x-local-cache*` headers before persisting
/// response metadata; they are lookup-time decorations, not origin
/// headers.
pub(crate) fn strip_local_headers(headers: &mut HeaderMap) {
    for name in [
        X_LOCAL_CACHE,
        X_LOCAL_CACHE_KEY,
        X_LOCAL_CACHE_HASH,
        X_LOCAL_CACHE_TIME,
    ] {
        headers.remove(name);
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

pub(crate) fn millis_to_system_time(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}
