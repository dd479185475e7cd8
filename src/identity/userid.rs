use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::security::{generate_user_id, Salt};
use crate::storage::{get_json, put_json, SharedStorage, Storage};

use super::locks::KeyLocks;
use super::selector::{duration_secs, SelectorConfig, SelectorRef};

const USERID_PREFIX: &str = "userid/";

/// Usage record of one issued UserID, stored under the salted hash of the UserID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdEntry {
    pub selector: SelectorRef,
    /// Remaining logins; 0 means unlimited
    pub num_uses: u64,
    /// `None` never expires
    #[serde(default)]
    pub expiration_time: Option<DateTime<Utc>>,
    /// Wrap TTL of the issuing selector, captured at issuance
    #[serde(default, with = "duration_secs")]
    pub wrap_ttl: Duration,
    pub creation_time: DateTime<Utc>,
}

impl UserIdEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiration_time, Some(exp) if now >= exp)
    }
}

fn short(hash: &str) -> &str { &hash[..hash.len().min(8)] }

/// Issues, consumes and expires UserIDs.
///
/// Every read-modify-write on an entry runs under that entry's own lock, so racing
/// logins with the same UserID are serialized while unrelated UserIDs proceed in parallel.
pub struct UserIdRegistry {
    storage: SharedStorage,
    salt: Salt,
    locks: KeyLocks,
}

impl UserIdRegistry {
    pub fn new(storage: SharedStorage, salt: Salt) -> Self {
        Self { storage, salt, locks: KeyLocks::new() }
    }

    fn key(hash: &str) -> String { format!("{}{}", USERID_PREFIX, hash) }

    /// Register a UserID against `selector`, copying its use limit, TTL and wrap TTL from
    /// `cfg`. A missing or empty `desired` value gets a fresh random UserID.
    pub fn issue(&self, selector: SelectorRef, cfg: &SelectorConfig, desired: Option<&str>) -> AppResult<String> {
        self.issue_at(selector, cfg, desired, Utc::now())
    }

    pub(crate) fn issue_at(
        &self,
        selector: SelectorRef,
        cfg: &SelectorConfig,
        desired: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<String> {
        let user_id = match desired.filter(|d| !d.is_empty()) {
            Some(d) => d.to_string(),
            None => generate_user_id(),
        };
        let expiration_time = if cfg.userid_ttl.is_zero() {
            None
        } else {
            let ttl = chrono::Duration::from_std(cfg.userid_ttl)
                .map_err(|_| AppError::validation("userid_ttl", "userid_ttl out of range"))?;
            Some(now.checked_add_signed(ttl).ok_or_else(|| AppError::validation("userid_ttl", "userid_ttl out of range"))?)
        };
        let entry = UserIdEntry {
            selector,
            num_uses: cfg.num_uses,
            expiration_time,
            wrap_ttl: cfg.wrap_ttl,
            creation_time: now,
        };
        let hash = self.salt.salt_id(&user_id);
        let key = Self::key(&hash);
        self.locks.with_lock(&hash, || {
            if let Some(existing) = get_json::<UserIdEntry>(self.storage.as_ref(), &key)? {
                if !existing.is_expired_at(now) {
                    return Err(AppError::conflict("userid_exists", "user_id is already registered"));
                }
            }
            put_json(self.storage.as_ref(), &key, &entry)
        })?;
        debug!(target: "appgroup", selector = %entry.selector, hash = short(&hash), num_uses = entry.num_uses, "user_id issued");
        Ok(user_id)
    }

    /// Spend one use of `user_id` and return its (post-decrement) entry.
    ///
    /// Missing and expired UserIDs fail with `NotFound`; expired entries are removed on the
    /// way out. An entry whose last use is spent is deleted.
    pub fn consume(&self, user_id: &str) -> AppResult<UserIdEntry> {
        self.consume_at(user_id, Utc::now())
    }

    pub(crate) fn consume_at(&self, user_id: &str, now: DateTime<Utc>) -> AppResult<UserIdEntry> {
        let hash = self.salt.salt_id(user_id);
        let key = Self::key(&hash);
        self.locks.with_lock(&hash, || {
            let Some(mut entry) = get_json::<UserIdEntry>(self.storage.as_ref(), &key)? else {
                return Err(AppError::not_found("userid_not_found", "user_id not found"));
            };
            if entry.is_expired_at(now) {
                self.storage.delete(&key)?;
                debug!(target: "appgroup", hash = short(&hash), "expired user_id removed on lookup");
                return Err(AppError::not_found("userid_not_found", "user_id not found"));
            }
            if entry.num_uses > 0 {
                entry.num_uses -= 1;
                if entry.num_uses == 0 {
                    self.storage.delete(&key)?;
                    debug!(target: "appgroup", hash = short(&hash), "user_id exhausted");
                } else {
                    put_json(self.storage.as_ref(), &key, &entry)?;
                }
            }
            Ok(entry)
        })
    }

    /// Look at a live entry without spending a use.
    pub fn peek(&self, user_id: &str) -> AppResult<Option<UserIdEntry>> {
        let hash = self.salt.salt_id(user_id);
        let entry = get_json::<UserIdEntry>(self.storage.as_ref(), &Self::key(&hash))?;
        Ok(entry.filter(|e| !e.is_expired_at(Utc::now())))
    }

    /// Delete `user_id` outright.
    pub fn revoke(&self, user_id: &str) -> AppResult<()> {
        let hash = self.salt.salt_id(user_id);
        let key = Self::key(&hash);
        self.locks.with_lock(&hash, || self.storage.delete(&key))
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn tidy(&self) -> AppResult<usize> { self.tidy_at(Utc::now()) }

    pub(crate) fn tidy_at(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let mut removed = 0usize;
        for hash in self.storage.list(USERID_PREFIX)? {
            if hash.ends_with('/') { continue; }
            let key = Self::key(&hash);
            let gone = self.locks.with_lock(&hash, || -> AppResult<bool> {
                match get_json::<UserIdEntry>(self.storage.as_ref(), &key)? {
                    Some(e) if e.is_expired_at(now) => {
                        self.storage.delete(&key)?;
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            })?;
            if gone { removed += 1; }
        }
        if removed > 0 { info!(target: "appgroup", removed, "tidied expired user_ids"); }
        Ok(removed)
    }
}

#[cfg(test)]
#[path = "userid_tests.rs"]
mod userid_tests;
