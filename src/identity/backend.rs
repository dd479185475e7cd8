//! Credential issuance and the login state machine.
//!
//! A login spends one use of the presented UserID before anything else happens. The spend is
//! the point of no return: a later failure (missing selector, mint error, wrap error) leaves
//! the use consumed, so two racing logins can never both ride on the last use.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::security::{parse_policies, Salt};
use crate::storage::SharedStorage;

use super::combiner::{combine, EffectiveConstraints};
use super::selector::{FieldUpdate, FieldValue, SelectorConfig, SelectorField, SelectorInput, SelectorKind, SelectorRef, GENERIC_NAME};
use super::selector_store::SelectorStore;
use super::session::{IssuedToken, MintRequest, TokenIssuer};
use super::userid::UserIdRegistry;
use super::wrapping::{ResponseWrapper, WrapInfo};

/// Result of a `creds` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredsResponse {
    Plain { user_id: String },
    Wrapped(WrapInfo),
}

/// Auth block handed back by login and renew.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAuth {
    pub client_token: String,
    pub policies: Vec<String>,
    pub lease_duration: Duration,
    pub renewable: bool,
    pub metadata: BTreeMap<String, String>,
}

impl LoginAuth {
    fn from_issued(t: &IssuedToken, now: DateTime<Utc>) -> Self {
        Self {
            client_token: t.token.clone(),
            policies: t.policies.clone(),
            lease_duration: t.lease_duration(now),
            renewable: t.renewable(now),
            metadata: t.metadata.clone(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "client_token": self.client_token,
            "policies": self.policies,
            "lease_duration": self.lease_duration.as_secs(),
            "renewable": self.renewable,
            "metadata": self.metadata,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginResponse {
    Auth(LoginAuth),
    Wrapped(WrapInfo),
}

pub struct Backend {
    pub selectors: SelectorStore,
    pub userids: UserIdRegistry,
    issuer: Arc<dyn TokenIssuer>,
    wrapper: Arc<dyn ResponseWrapper>,
}

impl Backend {
    /// Wire the backend onto `storage`, loading (or creating) the persisted salt.
    pub fn new(storage: SharedStorage, issuer: Arc<dyn TokenIssuer>, wrapper: Arc<dyn ResponseWrapper>) -> AppResult<Self> {
        let salt = Salt::load_or_create(storage.as_ref())?;
        Ok(Self::with_salt(storage, salt, issuer, wrapper))
    }

    pub fn with_salt(storage: SharedStorage, salt: Salt, issuer: Arc<dyn TokenIssuer>, wrapper: Arc<dyn ResponseWrapper>) -> Self {
        Self {
            selectors: SelectorStore::new(storage.clone()),
            userids: UserIdRegistry::new(storage, salt),
            issuer,
            wrapper,
        }
    }

    /// Stored config of a selector. The Generic selector always exists: until it is
    /// written it reads as a fresh record with create-time defaults.
    pub fn selector(&self, kind: SelectorKind, name: &str) -> AppResult<Option<SelectorConfig>> {
        let found = self.selectors.get(kind, name)?;
        if found.is_none() && kind == SelectorKind::Generic {
            let mut cfg = SelectorConfig::empty(GENERIC_NAME);
            cfg.policies = parse_policies("");
            return Ok(Some(cfg));
        }
        Ok(found)
    }

    /// Per-field read that honours the always-present Generic selector.
    pub fn read_field(&self, kind: SelectorKind, name: &str, field: SelectorField) -> AppResult<Option<FieldValue>> {
        field.check_applies(kind)?;
        Ok(self.selector(kind, name)?.map(|cfg| field.read(&cfg)))
    }

    pub fn update_field(&self, kind: SelectorKind, name: &str, field: SelectorField, value: FieldUpdate) -> AppResult<()> {
        self.materialize_generic(kind)?;
        self.selectors.update_field(kind, name, field, value)
    }

    pub fn reset_field(&self, kind: SelectorKind, name: &str, field: SelectorField) -> AppResult<()> {
        self.materialize_generic(kind)?;
        self.selectors.reset_field(kind, name, field)
    }

    // Field writes need a stored record; Generic gets one with create defaults on first touch.
    fn materialize_generic(&self, kind: SelectorKind) -> AppResult<()> {
        if kind == SelectorKind::Generic && self.selectors.get(kind, GENERIC_NAME)?.is_none() {
            self.selectors.upsert(kind, GENERIC_NAME, &SelectorInput::default())?;
        }
        Ok(())
    }

    fn require_selector(&self, kind: SelectorKind, name: &str) -> AppResult<SelectorConfig> {
        self.selector(kind, name)?
            .ok_or_else(|| AppError::not_found("selector_not_found", format!("{} {} does not exist", kind, name)))
    }

    /// Issue a server-generated UserID against the selector.
    pub fn creds(&self, kind: SelectorKind, name: &str) -> AppResult<CredsResponse> {
        let cfg = self.require_selector(kind, name)?;
        let selector = SelectorRef::new(kind, cfg.name.clone());
        let user_id = self.userids.issue(selector, &cfg, None)?;
        if cfg.wrap_ttl.is_zero() {
            return Ok(CredsResponse::Plain { user_id });
        }
        match self.wrapper.wrap(json!({ "user_id": user_id }), cfg.wrap_ttl) {
            Ok(info) => Ok(CredsResponse::Wrapped(info)),
            Err(e) => {
                warn!(target: "appgroup", kind = %kind, name = %cfg.name, error = %e, "wrapping creds failed; revoking user_id");
                self.userids.revoke(&user_id)?;
                Err(e)
            }
        }
    }

    /// Register a caller-chosen UserID against the selector. Nothing is returned: the
    /// caller already holds the value.
    pub fn creds_specific(&self, kind: SelectorKind, name: &str, user_id: &str) -> AppResult<()> {
        if user_id.trim().is_empty() {
            return Err(AppError::validation("missing_user_id", "missing user_id"));
        }
        let cfg = self.require_selector(kind, name)?;
        let selector = SelectorRef::new(kind, cfg.name.clone());
        self.userids.issue(selector, &cfg, Some(user_id))?;
        Ok(())
    }

    /// Exchange a UserID for a session token, or for a wrap handle around one.
    pub fn login(&self, user_id: &str) -> AppResult<LoginResponse> {
        if user_id.is_empty() {
            return Err(AppError::validation("missing_user_id", "missing user_id"));
        }
        let entry = match self.userids.consume(user_id) {
            Ok(e) => e,
            Err(e) if e.is_not_found() => return Err(AppError::invalid_credential()),
            Err(e) => return Err(e),
        };
        let chain = self.resolve_chain(&entry.selector)?;
        let eff = combine(&chain, entry.wrap_ttl);
        debug!(target: "appgroup", selector = %entry.selector, chain = chain.len(), policies = eff.policies.len(), "login constraints combined");

        let issued = self.issuer.mint(mint_request(&eff, &entry.selector))?;
        let auth = LoginAuth::from_issued(&issued, issued.issued_at);
        info!(target: "appgroup", selector = %entry.selector, lease_secs = auth.lease_duration.as_secs(), "login succeeded");
        if eff.wrap_ttl.is_zero() {
            return Ok(LoginResponse::Auth(auth));
        }
        match self.wrapper.wrap(auth.to_json(), eff.wrap_ttl) {
            Ok(info) => Ok(LoginResponse::Wrapped(info)),
            Err(e) => {
                self.issuer.revoke(&issued.token);
                Err(e)
            }
        }
    }

    /// Every config implicated by a login against `sel`. The issuing selector itself must
    /// still exist; members and bindings that have since been deleted are skipped.
    fn resolve_chain(&self, sel: &SelectorRef) -> AppResult<Vec<SelectorConfig>> {
        let Some(own) = self.selector(sel.kind, &sel.name)? else {
            warn!(target: "appgroup", selector = %sel, "login against deleted selector");
            return Err(AppError::invalid_credential());
        };
        let mut chain = Vec::new();
        match sel.kind {
            SelectorKind::App => chain.extend(self.selectors.groups_for_app(&own.name)?),
            SelectorKind::Group => self.push_existing(&mut chain, SelectorKind::App, &own.apps)?,
            SelectorKind::Generic => {
                self.push_existing(&mut chain, SelectorKind::App, &own.apps)?;
                self.push_existing(&mut chain, SelectorKind::Group, &own.groups)?;
            }
        }
        chain.insert(0, own);
        Ok(chain)
    }

    fn push_existing(&self, chain: &mut Vec<SelectorConfig>, kind: SelectorKind, names: &[String]) -> AppResult<()> {
        for name in names {
            match self.selectors.get(kind, name)? {
                Some(cfg) => chain.push(cfg),
                None => debug!(target: "appgroup", kind = %kind, name = %name, "skipping missing chain member"),
            }
        }
        Ok(())
    }

    /// Extend an issued token without touching any UserID.
    pub fn renew(&self, token: &str, increment: Option<Duration>) -> AppResult<LoginAuth> {
        if token.is_empty() {
            return Err(AppError::validation("missing_token", "missing token"));
        }
        let issued = self.issuer.renew(token, increment)?;
        Ok(LoginAuth::from_issued(&issued, Utc::now().max(issued.issued_at)))
    }

    pub fn unwrap(&self, token: &str) -> AppResult<Value> {
        if token.is_empty() {
            return Err(AppError::validation("missing_token", "missing token"));
        }
        self.wrapper.unwrap(token)
    }

    /// Drop expired UserIDs, tokens and wrap slots. Returns the total removed.
    pub fn tidy(&self) -> AppResult<usize> {
        let user_ids = self.userids.tidy()?;
        let tokens = self.issuer.tidy();
        let wraps = self.wrapper.tidy();
        if user_ids + tokens + wraps > 0 {
            debug!(target: "appgroup", user_ids, tokens, wraps, "tidied expired entries");
        }
        Ok(user_ids + tokens + wraps)
    }
}

fn mint_request(eff: &EffectiveConstraints, sel: &SelectorRef) -> MintRequest {
    let mut metadata = BTreeMap::new();
    metadata.insert("selector_kind".to_string(), sel.kind.to_string());
    metadata.insert("selector_name".to_string(), sel.name.clone());
    MintRequest {
        policies: eff.policies.clone(),
        ttl: eff.token_ttl,
        max_ttl: eff.token_max_ttl,
        metadata,
    }
}

#[cfg(test)]
#[path = "backend_tests.rs"]
mod backend_tests;
