use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use crate::tprintln;

use crate::error::{AppError, AppResult};

pub type SessionToken = String;

/// What the login path asks the issuer for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MintRequest {
    pub policies: Vec<String>,
    /// `None` takes the issuer's default TTL
    pub ttl: Option<Duration>,
    /// `None` takes the issuer's system maximum
    pub max_ttl: Option<Duration>,
    pub metadata: BTreeMap<String, String>,
}

/// A minted session token and the constraints recorded with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: SessionToken,
    pub policies: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Renewal period used when a renew asks for no explicit increment
    pub period: Duration,
    /// Hard cap measured from `issued_at`
    pub max_ttl: Duration,
}

impl IssuedToken {
    /// Seconds left before `expires_at`, as seen at `now`.
    pub fn lease_duration(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn renewable(&self, now: DateTime<Utc>) -> bool { now < self.hard_limit() }

    fn hard_limit(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.max_ttl)
            .ok()
            .and_then(|d| self.issued_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Token issuing collaborator consumed by the login path.
pub trait TokenIssuer: Send + Sync {
    fn mint(&self, req: MintRequest) -> AppResult<IssuedToken>;
    /// Extend a live token, never past its recorded max TTL.
    fn renew(&self, token: &str, increment: Option<Duration>) -> AppResult<IssuedToken>;
    fn lookup(&self, token: &str) -> Option<IssuedToken>;
    fn revoke(&self, token: &str) -> bool;
    /// Drop expired tokens, returning how many went.
    fn tidy(&self) -> usize { 0 }
}

pub(crate) fn gen_id() -> AppResult<String> {
    let mut buf = [0u8; 32];
    getrandom::getrandom(&mut buf).map_err(|e| AppError::internal("token_rng", e.to_string()))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
}

fn add(t: DateTime<Utc>, d: Duration) -> AppResult<DateTime<Utc>> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| t.checked_add_signed(d))
        .ok_or_else(|| AppError::validation("ttl", "ttl out of range"))
}

/// In-memory token table.
pub struct SessionManager {
    pub default_ttl: Duration,
    pub max_ttl: Duration,
    sessions: RwLock<HashMap<SessionToken, IssuedToken>>,
}

impl Default for SessionManager {
    fn default() -> Self { Self::new(Duration::from_secs(60 * 60), Duration::from_secs(32 * 24 * 60 * 60)) }
}

impl SessionManager {
    pub fn new(default_ttl: Duration, max_ttl: Duration) -> Self {
        Self { default_ttl, max_ttl, sessions: RwLock::new(HashMap::new()) }
    }

    pub(crate) fn mint_at(&self, req: MintRequest, now: DateTime<Utc>) -> AppResult<IssuedToken> {
        let max_ttl = req.max_ttl.unwrap_or(self.max_ttl).min(self.max_ttl);
        let period = req.ttl.unwrap_or(self.default_ttl).min(max_ttl);
        let token = gen_id()?;
        let issued = IssuedToken {
            token: token.clone(),
            policies: req.policies,
            metadata: req.metadata,
            issued_at: now,
            expires_at: add(now, period)?,
            period,
            max_ttl,
        };
        self.sessions.write().insert(token, issued.clone());
        tprintln!("session.mint ttl_secs={} max_ttl_secs={}", period.as_secs(), max_ttl.as_secs());
        Ok(issued)
    }

    pub(crate) fn renew_at(&self, token: &str, increment: Option<Duration>, now: DateTime<Utc>) -> AppResult<IssuedToken> {
        let mut map = self.sessions.write();
        let Some(cur) = map.get(token).cloned() else {
            return Err(AppError::invalid_credential());
        };
        if cur.expires_at <= now || !cur.renewable(now) {
            map.remove(token);
            return Err(AppError::invalid_credential());
        }
        let wanted = add(now, increment.unwrap_or(cur.period))?;
        let updated = IssuedToken { expires_at: wanted.min(cur.hard_limit()), ..cur };
        map.insert(token.to_string(), updated.clone());
        Ok(updated)
    }

    pub(crate) fn lookup_at(&self, token: &str, now: DateTime<Utc>) -> Option<IssuedToken> {
        let live = {
            let map = self.sessions.read();
            match map.get(token) {
                Some(t) if t.expires_at > now => return Some(t.clone()),
                Some(_) => false,
                None => return None,
            }
        };
        if !live { self.sessions.write().remove(token); }
        None
    }

    pub(crate) fn tidy_at(&self, now: DateTime<Utc>) -> usize {
        let mut map = self.sessions.write();
        let before = map.len();
        map.retain(|_, t| t.expires_at > now);
        before - map.len()
    }

    pub fn len(&self) -> usize { self.sessions.read().len() }
    pub fn is_empty(&self) -> bool { self.sessions.read().is_empty() }
}

impl TokenIssuer for SessionManager {
    fn mint(&self, req: MintRequest) -> AppResult<IssuedToken> { self.mint_at(req, Utc::now()) }

    fn renew(&self, token: &str, increment: Option<Duration>) -> AppResult<IssuedToken> {
        self.renew_at(token, increment, Utc::now())
    }

    fn lookup(&self, token: &str) -> Option<IssuedToken> { self.lookup_at(token, Utc::now()) }

    fn revoke(&self, token: &str) -> bool { self.sessions.write().remove(token).is_some() }

    fn tidy(&self) -> usize { self.tidy_at(Utc::now()) }
}
