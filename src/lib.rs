//! # cachefetch
//!
//! An HTTP fetching library built around a standards-aligned cache.
//!
//! `cachefetch` puts an RFC 7234 private cache in front of a pluggable
//! HTTP transport: requests consult a persistent content-addressed store,
//! freshness and validation rules decide whether to serve, revalidate, or
//! refetch, and network fetches get automatic retries, connection-pool
//! reuse, proxy selection, and optional response-body integrity
//! verification.
//!
//! ## Features
//!
//! - **Cache modes**: `default`, `no-store`, `reload`, `no-cache`,
//!   `force-cache`, and `only-if-cached`
//! - **Revalidation**: conditional requests from stored validators, 304
//!   merging, and stale-on-error fallback
//! - **Content-addressed store**: bodies keyed by their SHA-256 digest,
//!   doubling as the subresource-integrity value
//! - **Retry**: exponential backoff over a classified error set that
//!   respects idempotence and body rewindability
//! - **Agents**: memoized per-destination connection pools keyed by
//!   scheme, proxy, and TLS material
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cachefetch::{CacheManager, Fetcher, Options};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), cachefetch::FetchError> {
//!     let fetcher = Fetcher::new();
//!     let mut opts = Options::default();
//!     opts.cache_manager = Some(CacheManager::path("./my-cache"));
//!
//!     let res = fetcher.fetch("https://example.com", opts).await?;
//!     println!("status: {}", res.status());
//!     println!("body: {}", res.text().await?);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Error taxonomy
//! - [`http`] - Request/response descriptors, bodies, and retry policy
//! - [`cache`] - Cache keys, RFC 7234 policy, stores, and integrity
//! - [`agent`] - Connection agents, the agent pool, and proxy selection
//! - [`transport`] - The transport contract and the default hyper client
//! - [`client`] - The orchestrator and the `defaults` wrapper

pub mod agent;
pub mod base;
pub mod cache;
pub mod client;
pub mod http;
pub mod transport;

pub use crate::base::error::{FetchError, TransportCode};
pub use crate::cache::{CacheMode, CacheStore, DiskCache, Integrity, MemoryCache};
pub use crate::client::{fetch, AgentOption, CacheManager, Fetcher, Options};
pub use crate::http::{Body, Request, Response, ResponseBody, RetryConfig};
pub use crate::transport::{HyperTransport, RedirectMode, Transport};
