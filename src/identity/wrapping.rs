use std::collections::HashMap;
use std::time::Duration;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::error::{AppError, AppResult};

use super::session::gen_id;

/// Handle returned in place of a wrapped response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapInfo {
    pub token: String,
    pub ttl: Duration,
    pub creation_time: DateTime<Utc>,
}

/// Response wrapping collaborator: stores a payload behind a single-use token.
pub trait ResponseWrapper: Send + Sync {
    fn wrap(&self, payload: Value, ttl: Duration) -> AppResult<WrapInfo>;
    /// Hand back the payload exactly once. Unknown, spent and expired tokens all fail.
    fn unwrap(&self, token: &str) -> AppResult<Value>;
    /// Drop expired slots, returning how many went.
    fn tidy(&self) -> usize { 0 }
}

struct Cubby {
    payload: Value,
    expires_at: DateTime<Utc>,
}

/// In-memory single-use wrapping store.
#[derive(Default)]
pub struct CubbyholeWrapper {
    slots: Mutex<HashMap<String, Cubby>>,
}

impl CubbyholeWrapper {
    pub fn new() -> Self { Self::default() }

    pub(crate) fn wrap_at(&self, payload: Value, ttl: Duration, now: DateTime<Utc>) -> AppResult<WrapInfo> {
        if ttl.is_zero() {
            return Err(AppError::validation("wrap_ttl", "wrap ttl must be positive"));
        }
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .ok_or_else(|| AppError::validation("wrap_ttl", "wrap ttl out of range"))?;
        let token = gen_id()?;
        self.slots.lock().insert(token.clone(), Cubby { payload, expires_at });
        debug!(target: "appgroup", ttl_secs = ttl.as_secs(), "response wrapped");
        Ok(WrapInfo { token, ttl, creation_time: now })
    }

    pub(crate) fn unwrap_at(&self, token: &str, now: DateTime<Utc>) -> AppResult<Value> {
        let mut slots = self.slots.lock();
        match slots.remove(token) {
            Some(c) if c.expires_at > now => Ok(c.payload),
            _ => Err(AppError::invalid_credential()),
        }
    }

    pub(crate) fn tidy_at(&self, now: DateTime<Utc>) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, c| c.expires_at > now);
        before - slots.len()
    }

    pub fn len(&self) -> usize { self.slots.lock().len() }
    pub fn is_empty(&self) -> bool { self.slots.lock().is_empty() }
}

impl ResponseWrapper for CubbyholeWrapper {
    fn wrap(&self, payload: Value, ttl: Duration) -> AppResult<WrapInfo> { self.wrap_at(payload, ttl, Utc::now()) }

    fn unwrap(&self, token: &str) -> AppResult<Value> { self.unwrap_at(token, Utc::now()) }

    fn tidy(&self) -> usize { self.tidy_at(Utc::now()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unwrap_is_single_use() {
        let w = CubbyholeWrapper::new();
        let info = w.wrap(json!({"user_id": "abc"}), Duration::from_secs(30)).unwrap();
        assert_eq!(info.ttl, Duration::from_secs(30));
        assert_eq!(w.unwrap(&info.token).unwrap()["user_id"], "abc");
        assert_eq!(w.unwrap(&info.token).unwrap_err().http_status(), 401);
    }

    #[test]
    fn expired_wraps_are_gone() {
        let w = CubbyholeWrapper::new();
        let now = Utc::now();
        let info = w.wrap_at(json!(1), Duration::from_secs(5), now).unwrap();
        assert!(w.unwrap_at(&info.token, now + chrono::Duration::seconds(6)).is_err());
        assert!(w.is_empty());
    }

    #[test]
    fn tidy_drops_expired_slots_without_unwrap() {
        let w = CubbyholeWrapper::new();
        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        for i in 0..1000 {
            w.wrap_at(json!(i), Duration::from_secs(1), hour_ago).unwrap();
        }
        let live = w.wrap(json!("keep"), Duration::from_secs(60)).unwrap();
        assert_eq!(w.len(), 1001);
        assert_eq!(w.tidy(), 1000);
        assert_eq!(w.len(), 1);
        assert_eq!(w.unwrap(&live.token).unwrap(), json!("keep"));
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let w = CubbyholeWrapper::new();
        assert!(w.wrap(json!(null), Duration::ZERO).is_err());
    }
}
