//! RFC 7234 freshness and revalidation rules.
//!
//! A [`CachePolicy`] is built from the prospective request headers, the
//! stored response headers, and the time the entry was written. It
//! answers the three cache questions: is a response storable, is a
//! stored response fresh without revalidation, and which conditional
//! headers revalidate it.

use std::time::{Duration, SystemTime};

use http::header::{
    AGE, CACHE_CONTROL, CONTENT_LENGTH, DATE, ETAG, EXPIRES, IF_MATCH, IF_MODIFIED_SINCE,
    IF_NONE_MATCH, IF_UNMODIFIED_SINCE, LAST_MODIFIED, PRAGMA, WARNING,
};
use http::{HeaderMap, HeaderValue, Method, StatusCode};

/// Heuristic freshness cap and the no-validator default, in seconds.
const HEURISTIC_FRESHNESS_CAP: u64 = 300;

/// Request headers that indicate the caller is doing its own validation.
const CONDITIONAL_HEADERS: [&str; 5] = [
    "if-modified-since",
    "if-none-match",
    "if-unmodified-since",
    "if-match",
    "if-range",
];

/// Parsed `Cache-Control` directives.
#[derive(Debug, Clone, Default)]
pub struct CacheControl {
    pub no_store: bool,
    pub no_cache: bool,
    pub must_revalidate: bool,
    pub immutable: bool,
    pub max_age: Option<u64>,
    pub s_maxage: Option<u64>,
}

/// Parse `Cache-Control`. Only the `=` form of valued directives is
/// recognized.
pub fn parse_cache_control(headers: &HeaderMap) -> CacheControl {
    let mut cc = CacheControl::default();

    for value in headers.get_all(CACHE_CONTROL) {
        let Ok(s) = value.to_str() else { continue };
        for directive in s.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            if directive == "no-store" {
                cc.no_store = true;
            } else if directive == "no-cache" {
                cc.no_cache = true;
            } else if directive == "must-revalidate" {
                cc.must_revalidate = true;
            } else if directive == "immutable" {
                cc.immutable = true;
            } else if let Some(secs) = directive.strip_prefix("max-age=") {
                if let Ok(secs) = secs.trim_matches('"').parse::<u64>() {
                    cc.max_age = Some(secs);
                }
            } else if let Some(secs) = directive.strip_prefix("s-maxage=") {
                if let Ok(secs) = secs.trim_matches('"').parse::<u64>() {
                    cc.s_maxage = Some(secs);
                }
            }
        }
    }

    cc
}

/// Freshness and revalidation decisions for one stored entry against one
/// prospective request.
#[derive(Debug)]
pub struct CachePolicy {
    req_cc: CacheControl,
    res_cc: CacheControl,
    req_headers: HeaderMap,
    res_headers: HeaderMap,
    time_saved: SystemTime,
}

impl CachePolicy {
    pub fn new(req_headers: &HeaderMap, res_headers: &HeaderMap, time_saved: SystemTime) -> Self {
        Self {
            req_cc: parse_cache_control(req_headers),
            res_cc: parse_cache_control(res_headers),
            req_headers: req_headers.clone(),
            res_headers: res_headers.clone(),
            time_saved,
        }
    }

    /// Whether a fresh network response may be written to the cache.
    pub fn storable(method: &Method, status: StatusCode, res_headers: &HeaderMap) -> bool {
        (*method == Method::GET || *method == Method::HEAD)
            && status == StatusCode::OK
            && !parse_cache_control(res_headers).no_store
    }

    /// The origin's `Date`, falling back to the entry write time.
    fn date(&self) -> SystemTime {
        self.res_headers
            .get(DATE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| httpdate::parse_http_date(s).ok())
            .unwrap_or(self.time_saved)
    }

    fn expires_lifetime(&self) -> Option<Duration> {
        let expires = self.res_headers.get(EXPIRES)?.to_str().ok()?;
        let expires = httpdate::parse_http_date(expires).ok()?;
        Some(
            expires
                .duration_since(self.date())
                .unwrap_or(Duration::ZERO),
        )
    }

    fn heuristic_lifetime(&self) -> Duration {
        let cap = Duration::from_secs(HEURISTIC_FRESHNESS_CAP);
        let last_modified = self
            .res_headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| httpdate::parse_http_date(s).ok());
        match last_modified {
            Some(lm) => {
                let since = self.date().duration_since(lm).unwrap_or(Duration::ZERO);
                (since / 10).min(cap)
            }
            None => cap,
        }
    }

    fn pragma_no_cache(&self) -> bool {
        self.req_headers
            .get_all(PRAGMA)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|s| s.split(',').any(|d| d.trim().eq_ignore_ascii_case("no-cache")))
    }

    /// Seconds the entry may be served without revalidation.
    pub fn freshness_lifetime(&self) -> Duration {
        if self.req_cc.no_cache || self.res_cc.no_cache || self.pragma_no_cache() {
            return Duration::ZERO;
        }
        if let Some(secs) = self.res_cc.s_maxage {
            return Duration::from_secs(secs);
        }
        if let Some(secs) = self.res_cc.max_age {
            return Duration::from_secs(secs);
        }
        if let Some(lifetime) = self.expires_lifetime() {
            return lifetime;
        }
        self.heuristic_lifetime()
    }

    /// Whether the freshness lifetime came from the heuristic path.
    pub fn uses_heuristic_freshness(&self) -> bool {
        !(self.req_cc.no_cache || self.res_cc.no_cache || self.pragma_no_cache())
            && self.res_cc.s_maxage.is_none()
            && self.res_cc.max_age.is_none()
            && self.expires_lifetime().is_none()
    }

    /// Current age of the entry at `now` (RFC 7234 §4.2.3, simplified to
    /// a private cache with zero request delay).
    pub fn current_age_at(&self, now: SystemTime) -> Duration {
        let apparent = self
            .time_saved
            .duration_since(self.date())
            .unwrap_or(Duration::ZERO);
        let age_header = self
            .res_headers
            .get(AGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::ZERO);
        let resident = now.duration_since(self.time_saved).unwrap_or(Duration::ZERO);
        apparent.max(age_header) + resident
    }

    /// Whether the entry may be served without contacting the origin.
    pub fn is_fresh_at(&self, now: SystemTime) -> bool {
        if self.res_cc.immutable {
            return true;
        }
        if self.res_cc.must_revalidate {
            return false;
        }
        self.current_age_at(now) < self.freshness_lifetime()
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(SystemTime::now())
    }

    /// Whether stale-on-error fallback is permitted for this entry.
    pub fn allows_stale(&self) -> bool {
        !self.res_cc.must_revalidate
    }

    /// Conditional headers derived from the stored validators.
    ///
    /// GET/HEAD use the non-match variants; other methods use
    /// `If-Match`/`If-Unmodified-Since`.
    pub fn conditional_headers(&self, method: &Method) -> HeaderMap {
        let safe = *method == Method::GET || *method == Method::HEAD;
        let mut headers = HeaderMap::new();
        if let Some(etag) = self.res_headers.get(ETAG) {
            let name = if safe { IF_NONE_MATCH } else { IF_MATCH };
            headers.insert(name, etag.clone());
        }
        if let Some(last_modified) = self.res_headers.get(LAST_MODIFIED) {
            let name = if safe {
                IF_MODIFIED_SINCE
            } else {
                IF_UNMODIFIED_SINCE
            };
            headers.insert(name, last_modified.clone());
        }
        headers
    }

    /// Whether a 304's validators disagree with the stored entry, meaning
    /// the representation changed even though the origin said not
    /// modified.
    pub fn revalidation_modified(&self, fresh: &HeaderMap) -> bool {
        match (self.res_headers.get(ETAG), fresh.get(ETAG)) {
            (Some(stored), Some(new)) => return stored != new,
            (None, Some(_)) => return true,
            _ => {}
        }
        match (
            self.res_headers.get(LAST_MODIFIED),
            fresh.get(LAST_MODIFIED),
        ) {
            (Some(stored), Some(new)) => stored != new,
            _ => false,
        }
    }

    /// Merge a 304's headers into the stored response headers
    /// (RFC 7234 §4.3.4): 1xx warnings are dropped, `Content-Length`
    /// keeps the stored value, everything else in the 304 replaces the
    /// stored field.
    pub fn merge_not_modified(&self, fresh: &HeaderMap) -> HeaderMap {
        let mut merged = self.res_headers.clone();
        strip_stale_warnings(&mut merged);

        for name in fresh.keys() {
            if *name == CONTENT_LENGTH {
                continue;
            }
            merged.remove(name);
            for value in fresh.get_all(name) {
                merged.append(name.clone(), value.clone());
            }
        }
        strip_stale_warnings(&mut merged);
        merged
    }
}

/// Whether the caller supplied its own validators, which disables
/// transparent caching for the request.
pub fn has_conditional_headers(headers: &HeaderMap) -> bool {
    CONDITIONAL_HEADERS.iter().any(|h| headers.contains_key(*h))
}

fn warn_code_is_1xx(value: &HeaderValue) -> bool {
    value
        .to_str()
        .ok()
        .and_then(|s| s.split_whitespace().next())
        .and_then(|code| code.parse::<u16>().ok())
        .map(|code| (100..200).contains(&code))
        .unwrap_or(false)
}

/// Remove `Warning` values with 1xx codes, keeping 2xx warnings
/// (RFC 7234 §4.3.4).
pub fn strip_stale_warnings(headers: &mut HeaderMap) {
    if !headers.contains_key(WARNING) {
        return;
    }
    let retained: Vec<HeaderValue> = headers
        .get_all(WARNING)
        .iter()
        .filter(|v| !warn_code_is_1xx(v))
        .cloned()
        .collect();
    headers.remove(WARNING);
    for value in retained {
        headers.append(WARNING, value);
    }
}

/// Append a `Warning` header in the `<code> <agent> "<text>"` form.
pub fn append_warning(headers: &mut HeaderMap, code: u16, host: &str, text: &str) {
    let host = if host.is_empty() { "localhost" } else { host };
    if let Ok(value) = HeaderValue::from_str(&format!("{} {} \"{}\"", code, host, text)) {
        headers.append(WARNING, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpdate::fmt_http_date;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                http::header::HeaderName::try_from(*name).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    fn policy(res: HeaderMap) -> CachePolicy {
        CachePolicy::new(&HeaderMap::new(), &res, SystemTime::now())
    }

    #[test]
    fn test_parse_cache_control() {
        let cc = parse_cache_control(&headers(&[(
            "cache-control",
            "max-age=3600, no-cache, immutable",
        )]));
        assert_eq!(cc.max_age, Some(3600));
        assert!(cc.no_cache);
        assert!(cc.immutable);
        assert!(!cc.no_store);
    }

    #[test]
    fn test_s_maxage_beats_max_age() {
        let p = policy(headers(&[("cache-control", "s-maxage=60, max-age=3600")]));
        assert_eq!(p.freshness_lifetime(), Duration::from_secs(60));
    }

    #[test]
    fn test_max_age_fresh() {
        let p = policy(headers(&[("cache-control", "max-age=300")]));
        assert!(p.is_fresh());
        assert!(!p.uses_heuristic_freshness());
    }

    #[test]
    fn test_max_age_zero_stale() {
        let p = policy(headers(&[("cache-control", "max-age=0")]));
        assert!(!p.is_fresh());
    }

    #[test]
    fn test_no_cache_means_zero_lifetime() {
        let p = policy(headers(&[
            ("cache-control", "no-cache, max-age=300"),
        ]));
        assert_eq!(p.freshness_lifetime(), Duration::ZERO);
        assert!(!p.uses_heuristic_freshness());
    }

    #[test]
    fn test_request_pragma_no_cache() {
        let req = headers(&[("pragma", "no-cache")]);
        let res = headers(&[("cache-control", "max-age=300")]);
        let p = CachePolicy::new(&req, &res, SystemTime::now());
        assert_eq!(p.freshness_lifetime(), Duration::ZERO);
    }

    #[test]
    fn test_expires_lifetime() {
        let now = SystemTime::now();
        let res = headers(&[
            ("date", &fmt_http_date(now)),
            ("expires", &fmt_http_date(now + Duration::from_secs(120))),
        ]);
        let p = CachePolicy::new(&HeaderMap::new(), &res, now);
        assert_eq!(p.freshness_lifetime(), Duration::from_secs(120));
        assert!(!p.uses_heuristic_freshness());
    }

    #[test]
    fn test_heuristic_from_last_modified() {
        let now = SystemTime::now();
        let res = headers(&[
            ("date", &fmt_http_date(now)),
            (
                "last-modified",
                &fmt_http_date(now - Duration::from_secs(1000)),
            ),
        ]);
        let p = CachePolicy::new(&HeaderMap::new(), &res, now);
        assert!(p.uses_heuristic_freshness());
        assert_eq!(p.freshness_lifetime(), Duration::from_secs(100));
    }

    #[test]
    fn test_heuristic_capped_at_five_minutes() {
        let now = SystemTime::now();
        let res = headers(&[
            ("date", &fmt_http_date(now)),
            (
                "last-modified",
                &fmt_http_date(now - Duration::from_secs(3_000_000)),
            ),
        ]);
        let p = CachePolicy::new(&HeaderMap::new(), &res, now);
        assert_eq!(p.freshness_lifetime(), Duration::from_secs(300));
    }

    #[test]
    fn test_heuristic_without_validators() {
        let p = policy(HeaderMap::new());
        assert!(p.uses_heuristic_freshness());
        assert_eq!(p.freshness_lifetime(), Duration::from_secs(300));
    }

    #[test]
    fn test_immutable_always_fresh() {
        let now = SystemTime::now();
        let res = headers(&[("cache-control", "immutable, max-age=0")]);
        let p = CachePolicy::new(&HeaderMap::new(), &res, now - Duration::from_secs(9999));
        assert!(p.is_fresh());
    }

    #[test]
    fn test_must_revalidate_always_stale() {
        let p = policy(headers(&[("cache-control", "must-revalidate, max-age=999")]));
        assert!(!p.is_fresh());
        assert!(!p.allows_stale());
    }

    #[test]
    fn test_age_header_counts() {
        let now = SystemTime::now();
        let res = headers(&[
            ("cache-control", "max-age=100"),
            ("age", "90"),
            ("date", &fmt_http_date(now)),
        ]);
        let p = CachePolicy::new(&HeaderMap::new(), &res, now);
        assert!(p.is_fresh_at(now + Duration::from_secs(5)));
        assert!(!p.is_fresh_at(now + Duration::from_secs(15)));
    }

    #[test]
    fn test_storable() {
        let ok = headers(&[("cache-control", "max-age=60")]);
        assert!(CachePolicy::storable(&Method::GET, StatusCode::OK, &ok));
        assert!(CachePolicy::storable(&Method::HEAD, StatusCode::OK, &ok));
        assert!(!CachePolicy::storable(&Method::POST, StatusCode::OK, &ok));
        assert!(!CachePolicy::storable(
            &Method::GET,
            StatusCode::NOT_FOUND,
            &ok
        ));
        let no_store = headers(&[("cache-control", "no-store")]);
        assert!(!CachePolicy::storable(
            &Method::GET,
            StatusCode::OK,
            &no_store
        ));
    }

    #[test]
    fn test_conditional_headers_safe_method() {
        let res = headers(&[
            ("etag", "\"abc\""),
            ("last-modified", "Tue, 01 Jan 2030 00:00:00 GMT"),
        ]);
        let p = policy(res);
        let cond = p.conditional_headers(&Method::GET);
        assert_eq!(cond.get(IF_NONE_MATCH).unwrap(), "\"abc\"");
        assert!(cond.contains_key(IF_MODIFIED_SINCE));
        assert!(!cond.contains_key(IF_MATCH));
    }

    #[test]
    fn test_conditional_headers_unsafe_method() {
        let p = policy(headers(&[("etag", "\"abc\"")]));
        let cond = p.conditional_headers(&Method::PUT);
        assert_eq!(cond.get(IF_MATCH).unwrap(), "\"abc\"");
        assert!(!cond.contains_key(IF_NONE_MATCH));
    }

    #[test]
    fn test_merge_not_modified() {
        let stored = headers(&[
            ("cache-control", "max-age=0"),
            ("etag", "\"abc\""),
            ("content-length", "13"),
            ("warning", "113 localhost \"heuristic\""),
        ]);
        let fresh = headers(&[("cache-control", "max-age=300"), ("content-length", "0")]);
        let p = policy(stored);
        let merged = p.merge_not_modified(&fresh);
        assert_eq!(merged.get(CACHE_CONTROL).unwrap(), "max-age=300");
        // Stored content-length wins; the 304 has no body.
        assert_eq!(merged.get(CONTENT_LENGTH).unwrap(), "13");
        assert_eq!(merged.get(ETAG).unwrap(), "\"abc\"");
        assert!(!merged.contains_key(WARNING));
    }

    #[test]
    fn test_revalidation_modified_on_etag_change() {
        let p = policy(headers(&[("etag", "\"a\"")]));
        assert!(p.revalidation_modified(&headers(&[("etag", "\"b\"")])));
        assert!(!p.revalidation_modified(&headers(&[("etag", "\"a\"")])));
        assert!(!p.revalidation_modified(&HeaderMap::new()));
    }

    #[test]
    fn test_strip_stale_warnings() {
        let mut h = headers(&[
            ("warning", "110 localhost \"stale\""),
            ("warning", "214 localhost \"transformed\""),
        ]);
        strip_stale_warnings(&mut h);
        let left: Vec<_> = h.get_all(WARNING).iter().collect();
        assert_eq!(left.len(), 1);
        assert!(left[0].to_str().unwrap().starts_with("214"));
    }

    #[test]
    fn test_has_conditional_headers() {
        assert!(has_conditional_headers(&headers(&[(
            "if-none-match",
            "\"x\""
        )])));
        assert!(has_conditional_headers(&headers(&[(
            "if-range",
            "\"x\""
        )])));
        assert!(!has_conditional_headers(&headers(&[("accept", "*/*")])));
    }

    #[test]
    fn test_append_warning_format() {
        let mut h = HeaderMap::new();
        append_warning(&mut h, 110, "example.com", "Local cached response stale");
        assert_eq!(
            h.get(WARNING).unwrap(),
            "110 example.com \"Local cached response stale\""
        );
    }
}
