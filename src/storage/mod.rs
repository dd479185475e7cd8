//!
//! appgroup storage module
//! -----------------------
//! Durable key/value seam used by the selector store and the UserID registry.
//! Keys are `/`-separated paths (`selector/app/web`, `userid/<hash>`); values are
//! opaque bytes, in practice JSON documents written through `put_json`.
//!
//! The backend is only assumed to be strongly consistent per key. Nothing here
//! offers cross-key transactions; callers that need read-modify-write atomicity
//! hold their own locks around the calls.

use std::sync::Arc;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::AppResult;

pub mod kv;

pub use kv::{KvStore, PersistenceSettings};

/// Minimal storage interface consumed by the backend.
pub trait Storage: Send + Sync {
    /// Fetch the raw value stored under `key`, `None` when absent.
    fn get(&self, key: &str) -> AppResult<Option<Vec<u8>>>;

    /// Write `value` under `key`, replacing any previous value.
    fn put(&self, key: &str, value: Vec<u8>) -> AppResult<()>;

    /// Remove `key`. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> AppResult<()>;

    /// List the immediate children of `prefix` in sorted order.
    ///
    /// A child that has descendants of its own is reported once with a trailing
    /// `/`, mirroring a directory listing.
    fn list(&self, prefix: &str) -> AppResult<Vec<String>>;
}

/// Shared, type-erased storage handle.
pub type SharedStorage = Arc<dyn Storage>;

/// Decode the JSON document stored under `key`.
pub fn get_json<T: DeserializeOwned>(storage: &dyn Storage, key: &str) -> AppResult<Option<T>> {
    match storage.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode `value` as JSON and store it under `key`.
pub fn put_json<T: Serialize>(storage: &dyn Storage, key: &str, value: &T) -> AppResult<()> {
    let bytes = serde_json::to_vec(value)?;
    storage.put(key, bytes)
}
