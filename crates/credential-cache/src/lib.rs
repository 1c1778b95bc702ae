//! Per-instance credential cache
//!
//! Holds the bearer token (or API key) of each tenant instance in memory so
//! the request path does not hit the credential store on every call. Writes
//! for one instance are serialized through a `KeyedLock`; reads never wait.
//! A `spawn_watcher` task sweeps expired and deactivated entries.

pub mod cache;
pub mod keyed_lock;
pub mod watcher;

pub use cache::{
    CacheError, CacheStatistics, CachedCredential, CredentialCache, CredentialData,
    CredentialStatus, MetadataUpdate,
};
pub use keyed_lock::{KeyedGuard, KeyedLock};
pub use watcher::{spawn_watcher, sweep_once};
