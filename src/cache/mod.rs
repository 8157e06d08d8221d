//! HTTP caching: keys, RFC 7234 policy, stores, and the streaming tee.

pub mod disk;
pub mod integrity;
pub mod key;
pub mod memory;
pub mod policy;
pub mod store;
pub(crate) mod tee;

pub use disk::DiskCache;
pub use integrity::{Algorithm, Integrity, IntegrityVerifier};
pub use memory::MemoryCache;
pub use policy::CachePolicy;
pub use store::CacheStore;

/// Largest body the stores will hold in memory; anything bigger streams
/// through a temp file (disk) or is not retained (memory).
pub const MAX_MEM_SIZE: u64 = 5 * 1024 * 1024;

/// Cache-mode requested by the caller, interpreted by the orchestrator's
/// state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Normal RFC 7234 behavior: serve fresh, revalidate stale.
    #[default]
    Default,
    /// Bypass the cache entirely; neither read nor write.
    NoStore,
    /// Skip the lookup, fetch from the network, cache the result.
    Reload,
    /// Always revalidate a matching entry before serving it.
    NoCache,
    /// Serve a matching entry even if stale; fetch and cache on a miss.
    ForceCache,
    /// Serve a matching entry or fail with `ENOTCACHED`.
    OnlyIfCached,
}
