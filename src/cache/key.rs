//! Cache key derivation.
//!
//! The key covers method, scheme, host:port, and path. Query strings are
//! deliberately excluded and compared at match time instead, so the key
//! and the match logic must stay in agreement. HEAD normalizes to GET so
//! a HEAD can be served from a prior GET's stored body.

use http::Method;
use sha2::{Digest, Sha256};
use url::Url;

/// Build the storage key for a request.
pub fn cache_key(method: &Method, url: &Url) -> String {
    let method = if *method == Method::HEAD {
        Method::GET
    } else {
        method.clone()
    };
    let host = url.host_str().unwrap_or("");
    let port = url.port_or_known_default().unwrap_or(0);
    format!(
        "{}|{}|{}:{}|{}",
        method.as_str().to_ascii_uppercase(),
        url.scheme(),
        host,
        port,
        url.path()
    )
}

/// Hash a key into the entry id used for on-disk paths.
pub fn entry_id(key: &str) -> String {
    hex_digest(&Sha256::digest(key.as_bytes()))
}

/// Lowercase hex encoding of a digest.
pub fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
