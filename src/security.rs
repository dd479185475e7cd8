use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::storage::Storage;

/// Storage key holding the hex-encoded backend salt.
pub const SALT_KEY: &str = "salt";

const SALT_LEN: usize = 32;

/// Process-lifetime salt used to hash UserIDs before they touch storage.
#[derive(Clone)]
pub struct Salt {
    bytes: Vec<u8>,
}

impl std::fmt::Debug for Salt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Salt").finish_non_exhaustive()
    }
}

impl Salt {
    /// Load the salt from storage, generating and persisting a fresh one on first start.
    pub fn load_or_create(storage: &dyn Storage) -> AppResult<Self> {
        if let Some(raw) = storage.get(SALT_KEY)? {
            let text = String::from_utf8(raw).map_err(|e| AppError::storage("salt_corrupt", e.to_string()))?;
            let bytes = hex::decode(text.trim()).map_err(|e| AppError::storage("salt_corrupt", e.to_string()))?;
            return Ok(Self { bytes });
        }
        let mut bytes = vec![0u8; SALT_LEN];
        getrandom::getrandom(&mut bytes).map_err(|e| AppError::internal("salt_rng", e.to_string()))?;
        storage.put(SALT_KEY, hex::encode(&bytes).into_bytes())?;
        info!(target: "appgroup", "generated new backend salt");
        Ok(Self { bytes })
    }

    /// Build a salt from known bytes (tests and fixtures).
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self { Self { bytes: bytes.into() } }

    /// Hex SHA-256 of salt || id.
    pub fn salt_id(&self, id: &str) -> String {
        let mut h = Sha256::new();
        h.update(&self.bytes);
        h.update(id.as_bytes());
        hex::encode(h.finalize())
    }
}

/// Split a comma separated policy list into a sorted, deduplicated, lower-cased set.
///
/// `root` swallows every other policy; otherwise `default` is always present.
pub fn parse_policies(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = raw
        .split(',')
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect();
    if out.iter().any(|p| p == "root") {
        return vec!["root".to_string()];
    }
    out.push("default".to_string());
    out.sort();
    out.dedup();
    out
}

/// Split a comma separated list of selector names, lower-casing and deduplicating while
/// keeping first-seen order.
pub fn parse_names(raw: &str) -> AppResult<Vec<String>> {
    let mut out: Vec<String> = Vec::new();
    for n in raw.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let n = normalize_name(n)?;
        if !out.contains(&n) { out.push(n); }
    }
    Ok(out)
}

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\w(?:[\w.-]*\w)?$").unwrap());

/// Validate a selector name and return its canonical (lower-cased) form.
pub fn normalize_name(name: &str) -> AppResult<String> {
    if name.is_empty() {
        return Err(AppError::validation("missing_name", "missing selector name"));
    }
    if !NAME_RE.is_match(name) {
        return Err(AppError::validation("invalid_name", format!("invalid selector name '{}'", name)));
    }
    Ok(name.to_lowercase())
}

/// Fresh 128-bit random UserID rendered as a UUID.
pub fn generate_user_id() -> String { uuid::Uuid::new_v4().to_string() }

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::KvStore;

    #[test]
    fn salt_is_persisted_once() {
        let kv = KvStore::in_memory();
        let a = Salt::load_or_create(&kv).unwrap();
        let b = Salt::load_or_create(&kv).unwrap();
        assert_eq!(a.salt_id("user"), b.salt_id("user"));
        assert_eq!(kv.len(), 1);
    }

    #[test]
    fn salted_hash_depends_on_salt_and_input() {
        let a = Salt::from_bytes(b"one".to_vec());
        let b = Salt::from_bytes(b"two".to_vec());
        assert_ne!(a.salt_id("x"), b.salt_id("x"));
        assert_ne!(a.salt_id("x"), a.salt_id("y"));
        assert_eq!(a.salt_id("x").len(), 64);
        assert!(!a.salt_id("secret-id").contains("secret"));
    }

    #[test]
    fn policies_are_normalized() {
        assert_eq!(parse_policies("P2, p1,,p2"), vec!["default", "p1", "p2"]);
        assert_eq!(parse_policies(""), vec!["default"]);
        assert_eq!(parse_policies("dev,root"), vec!["root"]);
    }

    #[test]
    fn names_are_validated_and_lowercased() {
        assert_eq!(normalize_name("AppOne").unwrap(), "appone");
        assert_eq!(normalize_name("svc-1.prod").unwrap(), "svc-1.prod");
        assert!(normalize_name("").is_err());
        assert!(normalize_name("-lead").is_err());
        assert!(normalize_name("has/slash").is_err());
        assert_eq!(parse_names("Web, db,web").unwrap(), vec!["web", "db"]);
    }

    #[test]
    fn generated_ids_are_uuids() {
        let id = generate_user_id();
        assert!(uuid::Uuid::parse_str(&id).is_ok());
        assert_ne!(id, generate_user_id());
    }
}
