use std::fmt;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Name under which the singleton Generic selector is stored.
pub const GENERIC_NAME: &str = "generic";

/// Largest TTL a selector may carry: 100 years, small enough that any stored TTL can be
/// added to the current instant.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    App,
    Group,
    Generic,
}

impl SelectorKind {
    pub const ALL: [SelectorKind; 3] = [SelectorKind::App, SelectorKind::Group, SelectorKind::Generic];

    pub fn as_str(&self) -> &'static str {
        match self {
            SelectorKind::App => "app",
            SelectorKind::Group => "group",
            SelectorKind::Generic => "generic",
        }
    }

    /// Storage prefix for configs of this kind.
    pub fn prefix(&self) -> String { format!("selector/{}/", self.as_str()) }
}

impl fmt::Display for SelectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Weak back-reference from a UserID to the selector it was issued against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectorRef {
    pub kind: SelectorKind,
    pub name: String,
}

impl SelectorRef {
    pub fn new(kind: SelectorKind, name: impl Into<String>) -> Self { Self { kind, name: name.into() } }
    pub fn app(name: impl Into<String>) -> Self { Self::new(SelectorKind::App, name) }
    pub fn group(name: impl Into<String>) -> Self { Self::new(SelectorKind::Group, name) }
    pub fn generic() -> Self { Self::new(SelectorKind::Generic, GENERIC_NAME) }
}

impl fmt::Display for SelectorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.kind, self.name) }
}

/// Stored configuration of an App, a Group or the Generic selector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorConfig {
    pub name: String,
    #[serde(default)]
    pub policies: Vec<String>,
    /// 0 means unlimited
    #[serde(default)]
    pub num_uses: u64,
    #[serde(default, with = "duration_secs")]
    pub userid_ttl: Duration,
    #[serde(default, with = "duration_secs")]
    pub token_ttl: Duration,
    #[serde(default, with = "duration_secs")]
    pub token_max_ttl: Duration,
    /// Non-zero turns on response wrapping for credentials issued against this selector
    #[serde(default, with = "duration_secs")]
    pub wrap_ttl: Duration,
    /// Group: member Apps. Generic: bound Apps. Always empty for an App.
    #[serde(default)]
    pub apps: Vec<String>,
    /// Generic: bound Groups. Empty otherwise.
    #[serde(default)]
    pub groups: Vec<String>,
}

impl SelectorConfig {
    /// Zero-valued record for a new selector.
    pub fn empty(name: impl Into<String>) -> Self { Self { name: name.into(), ..Default::default() } }

    pub fn validate(&self) -> AppResult<()> {
        let ttls = [
            (SelectorField::UserIdTtl, self.userid_ttl),
            (SelectorField::TokenTtl, self.token_ttl),
            (SelectorField::TokenMaxTtl, self.token_max_ttl),
            (SelectorField::WrapTtl, self.wrap_ttl),
        ];
        for (field, ttl) in ttls {
            if ttl > MAX_TTL {
                return Err(AppError::validation(
                    field.key(),
                    format!("{} cannot exceed {} seconds", field.key(), MAX_TTL.as_secs()),
                ));
            }
        }
        if !self.token_max_ttl.is_zero() && self.token_ttl > self.token_max_ttl {
            return Err(AppError::validation("token_ttl", "token_ttl should not be greater than token_max_ttl"));
        }
        Ok(())
    }
}

/// Request-side view of a selector: every field is optional so create-time defaults and
/// update-time merges can be told apart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorInput {
    #[serde(default)]
    pub policies: Option<String>,
    #[serde(default)]
    pub num_uses: Option<i64>,
    #[serde(default)]
    pub userid_ttl: Option<u64>,
    #[serde(default)]
    pub token_ttl: Option<u64>,
    #[serde(default)]
    pub token_max_ttl: Option<u64>,
    #[serde(default)]
    pub wrap_ttl: Option<u64>,
    #[serde(default)]
    pub apps: Option<String>,
    #[serde(default)]
    pub groups: Option<String>,
}

impl SelectorInput {
    /// Fold the supplied fields onto `cfg`. On create, absent fields take their defaults;
    /// on update, absent fields keep whatever `cfg` already holds.
    pub fn apply(&self, kind: SelectorKind, cfg: &mut SelectorConfig, create: bool) -> AppResult<()> {
        match &self.policies {
            Some(raw) => cfg.policies = crate::security::parse_policies(raw),
            None if create => cfg.policies = crate::security::parse_policies(""),
            None => {}
        }
        if let Some(n) = self.num_uses {
            cfg.num_uses = checked_num_uses(n)?;
        }
        if let Some(s) = self.userid_ttl { cfg.userid_ttl = Duration::from_secs(s); }
        if let Some(s) = self.token_ttl { cfg.token_ttl = Duration::from_secs(s); }
        if let Some(s) = self.token_max_ttl { cfg.token_max_ttl = Duration::from_secs(s); }
        if let Some(s) = self.wrap_ttl { cfg.wrap_ttl = Duration::from_secs(s); }
        if let Some(raw) = &self.apps {
            SelectorField::Apps.check_applies(kind)?;
            cfg.apps = crate::security::parse_names(raw)?;
        }
        if let Some(raw) = &self.groups {
            SelectorField::Groups.check_applies(kind)?;
            cfg.groups = crate::security::parse_names(raw)?;
        }
        cfg.validate()
    }

    /// Set one field from a per-field style value. Kind applicability and ranges are left
    /// to `apply`, except that seconds must not be negative.
    pub fn set(&mut self, field: SelectorField, value: FieldUpdate) -> AppResult<()> {
        let secs = |n: i64| checked_secs(&field, n).map(|d| Some(d.as_secs()));
        match (field, value) {
            (SelectorField::Policies, FieldUpdate::Text(raw)) => self.policies = Some(raw),
            (SelectorField::Apps, FieldUpdate::Text(raw)) => self.apps = Some(raw),
            (SelectorField::Groups, FieldUpdate::Text(raw)) => self.groups = Some(raw),
            (SelectorField::NumUses, FieldUpdate::Int(n)) => self.num_uses = Some(n),
            (SelectorField::UserIdTtl, FieldUpdate::Int(n)) => self.userid_ttl = secs(n)?,
            (SelectorField::TokenTtl, FieldUpdate::Int(n)) => self.token_ttl = secs(n)?,
            (SelectorField::TokenMaxTtl, FieldUpdate::Int(n)) => self.token_max_ttl = secs(n)?,
            (SelectorField::WrapTtl, FieldUpdate::Int(n)) => self.wrap_ttl = secs(n)?,
            (field, _) => {
                return Err(AppError::validation("invalid_value", format!("wrong value type for {}", field.key())));
            }
        }
        Ok(())
    }
}

fn checked_num_uses(n: i64) -> AppResult<u64> {
    u64::try_from(n).map_err(|_| AppError::validation("num_uses", "num_uses cannot be negative"))
}

/// Individually addressable selector fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectorField {
    Policies,
    NumUses,
    UserIdTtl,
    TokenTtl,
    TokenMaxTtl,
    WrapTtl,
    Apps,
    Groups,
}

impl SelectorField {
    pub const ALL: [SelectorField; 8] = [
        SelectorField::Policies,
        SelectorField::NumUses,
        SelectorField::UserIdTtl,
        SelectorField::TokenTtl,
        SelectorField::TokenMaxTtl,
        SelectorField::WrapTtl,
        SelectorField::Apps,
        SelectorField::Groups,
    ];

    /// Path segment form (`num-uses`).
    pub fn from_path(seg: &str) -> Option<Self> {
        match seg {
            "policies" => Some(SelectorField::Policies),
            "num-uses" => Some(SelectorField::NumUses),
            "userid-ttl" => Some(SelectorField::UserIdTtl),
            "token-ttl" => Some(SelectorField::TokenTtl),
            "token-max-ttl" => Some(SelectorField::TokenMaxTtl),
            "wrap-ttl" => Some(SelectorField::WrapTtl),
            "apps" => Some(SelectorField::Apps),
            "groups" => Some(SelectorField::Groups),
            _ => None,
        }
    }

    /// Body/response key form (`num_uses`).
    pub fn key(&self) -> &'static str {
        match self {
            SelectorField::Policies => "policies",
            SelectorField::NumUses => "num_uses",
            SelectorField::UserIdTtl => "userid_ttl",
            SelectorField::TokenTtl => "token_ttl",
            SelectorField::TokenMaxTtl => "token_max_ttl",
            SelectorField::WrapTtl => "wrap_ttl",
            SelectorField::Apps => "apps",
            SelectorField::Groups => "groups",
        }
    }

    pub fn check_applies(&self, kind: SelectorKind) -> AppResult<()> {
        let ok = match self {
            SelectorField::Apps => kind != SelectorKind::App,
            SelectorField::Groups => kind == SelectorKind::Generic,
            _ => true,
        };
        if ok { Ok(()) } else {
            Err(AppError::validation("field_not_applicable", format!("{} is not a field of {} selectors", self.key(), kind)))
        }
    }

    pub fn read(&self, cfg: &SelectorConfig) -> FieldValue {
        match self {
            SelectorField::Policies => FieldValue::Names(cfg.policies.clone()),
            SelectorField::NumUses => FieldValue::Count(cfg.num_uses),
            SelectorField::UserIdTtl => FieldValue::Ttl(cfg.userid_ttl),
            SelectorField::TokenTtl => FieldValue::Ttl(cfg.token_ttl),
            SelectorField::TokenMaxTtl => FieldValue::Ttl(cfg.token_max_ttl),
            SelectorField::WrapTtl => FieldValue::Ttl(cfg.wrap_ttl),
            SelectorField::Apps => FieldValue::Names(cfg.apps.clone()),
            SelectorField::Groups => FieldValue::Names(cfg.groups.clone()),
        }
    }

    /// Reset to the zero value, not to the create-time default.
    pub fn reset(&self, cfg: &mut SelectorConfig) {
        let zero = SelectorConfig::default();
        match self {
            SelectorField::Policies => cfg.policies = zero.policies,
            SelectorField::NumUses => cfg.num_uses = zero.num_uses,
            SelectorField::UserIdTtl => cfg.userid_ttl = zero.userid_ttl,
            SelectorField::TokenTtl => cfg.token_ttl = zero.token_ttl,
            SelectorField::TokenMaxTtl => cfg.token_max_ttl = zero.token_max_ttl,
            SelectorField::WrapTtl => cfg.wrap_ttl = zero.wrap_ttl,
            SelectorField::Apps => cfg.apps = zero.apps,
            SelectorField::Groups => cfg.groups = zero.groups,
        }
    }

    pub fn write(&self, cfg: &mut SelectorConfig, value: FieldUpdate) -> AppResult<()> {
        match (self, value) {
            (SelectorField::Policies, FieldUpdate::Text(raw)) => cfg.policies = crate::security::parse_policies(&raw),
            (SelectorField::Apps, FieldUpdate::Text(raw)) => cfg.apps = crate::security::parse_names(&raw)?,
            (SelectorField::Groups, FieldUpdate::Text(raw)) => cfg.groups = crate::security::parse_names(&raw)?,
            (SelectorField::NumUses, FieldUpdate::Int(n)) => cfg.num_uses = checked_num_uses(n)?,
            (SelectorField::UserIdTtl, FieldUpdate::Int(n)) => cfg.userid_ttl = checked_secs(self, n)?,
            (SelectorField::TokenTtl, FieldUpdate::Int(n)) => cfg.token_ttl = checked_secs(self, n)?,
            (SelectorField::TokenMaxTtl, FieldUpdate::Int(n)) => cfg.token_max_ttl = checked_secs(self, n)?,
            (SelectorField::WrapTtl, FieldUpdate::Int(n)) => cfg.wrap_ttl = checked_secs(self, n)?,
            (field, _) => {
                return Err(AppError::validation("invalid_value", format!("wrong value type for {}", field.key())));
            }
        }
        Ok(())
    }
}

fn checked_secs(field: &SelectorField, n: i64) -> AppResult<Duration> {
    u64::try_from(n)
        .map(Duration::from_secs)
        .map_err(|_| AppError::validation(field.key(), format!("{} cannot be negative", field.key())))
}

/// Value supplied to a per-field update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldUpdate {
    /// Comma separated list (policies, apps, groups)
    Text(String),
    /// Count or seconds
    Int(i64),
}

/// Value returned by a per-field read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Names(Vec<String>),
    Count(u64),
    Ttl(Duration),
}

pub(crate) mod duration_secs {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> { s.serialize_u64(d.as_secs()) }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_fills_defaults() {
        let mut cfg = SelectorConfig::empty("web");
        SelectorInput::default().apply(SelectorKind::App, &mut cfg, true).unwrap();
        assert_eq!(cfg.policies, vec!["default"]);
        assert_eq!(cfg.num_uses, 0);
        assert!(cfg.wrap_ttl.is_zero());
    }

    #[test]
    fn update_keeps_unset_fields() {
        let mut cfg = SelectorConfig::empty("web");
        let first = SelectorInput { policies: Some("p1".into()), num_uses: Some(3), token_ttl: Some(60), ..Default::default() };
        first.apply(SelectorKind::App, &mut cfg, true).unwrap();
        let second = SelectorInput { num_uses: Some(5), ..Default::default() };
        second.apply(SelectorKind::App, &mut cfg, false).unwrap();
        assert_eq!(cfg.policies, vec!["default", "p1"]);
        assert_eq!(cfg.num_uses, 5);
        assert_eq!(cfg.token_ttl, Duration::from_secs(60));
    }

    #[test]
    fn negative_num_uses_is_rejected() {
        let mut cfg = SelectorConfig::empty("web");
        let input = SelectorInput { num_uses: Some(-1), ..Default::default() };
        let err = input.apply(SelectorKind::App, &mut cfg, true).unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn ttl_above_max_is_rejected() {
        let mut cfg = SelectorConfig::empty("web");
        let input = SelectorInput { token_ttl: Some(600), token_max_ttl: Some(60), ..Default::default() };
        assert!(input.apply(SelectorKind::App, &mut cfg, true).is_err());
        // an unset max never constrains the ttl
        let mut cfg = SelectorConfig::empty("web");
        let input = SelectorInput { token_ttl: Some(600), ..Default::default() };
        assert!(input.apply(SelectorKind::App, &mut cfg, true).is_ok());
    }

    #[test]
    fn oversized_ttls_are_rejected() {
        for input in [
            SelectorInput { userid_ttl: Some(u64::MAX), ..Default::default() },
            SelectorInput { wrap_ttl: Some(MAX_TTL.as_secs() + 1), ..Default::default() },
            SelectorInput { token_max_ttl: Some(u64::MAX), ..Default::default() },
        ] {
            let mut cfg = SelectorConfig::empty("big");
            let err = input.apply(SelectorKind::App, &mut cfg, true).unwrap_err();
            assert_eq!(err.http_status(), 400);
        }
        let mut cfg = SelectorConfig::empty("big");
        SelectorField::UserIdTtl.write(&mut cfg, FieldUpdate::Int(i64::MAX)).unwrap();
        assert_eq!(cfg.validate().unwrap_err().code_str(), "userid_ttl");

        let mut cfg = SelectorConfig::empty("big");
        let at_cap = SelectorInput { userid_ttl: Some(MAX_TTL.as_secs()), ..Default::default() };
        assert!(at_cap.apply(SelectorKind::App, &mut cfg, true).is_ok());
        assert!(chrono::Utc::now().checked_add_signed(chrono::Duration::from_std(MAX_TTL).unwrap()).is_some());
    }

    #[test]
    fn membership_fields_are_kind_specific() {
        let mut cfg = SelectorConfig::empty("web");
        let apps = SelectorInput { apps: Some("a".into()), ..Default::default() };
        assert!(apps.apply(SelectorKind::App, &mut cfg, true).is_err());
        assert!(apps.apply(SelectorKind::Group, &mut cfg, true).is_ok());
        let groups = SelectorInput { groups: Some("g".into()), ..Default::default() };
        assert!(groups.apply(SelectorKind::Group, &mut cfg, true).is_err());
        assert!(groups.apply(SelectorKind::Generic, &mut cfg, true).is_ok());
    }

    #[test]
    fn reset_uses_zero_value() {
        let mut cfg = SelectorConfig::empty("web");
        SelectorInput { num_uses: Some(2), ..Default::default() }.apply(SelectorKind::App, &mut cfg, true).unwrap();
        SelectorField::Policies.reset(&mut cfg);
        assert!(cfg.policies.is_empty());
        assert_eq!(cfg.num_uses, 2);
    }

    #[test]
    fn field_write_checks_types() {
        let mut cfg = SelectorConfig::empty("web");
        assert!(SelectorField::NumUses.write(&mut cfg, FieldUpdate::Text("x".into())).is_err());
        assert!(SelectorField::TokenTtl.write(&mut cfg, FieldUpdate::Int(-5)).is_err());
        SelectorField::TokenTtl.write(&mut cfg, FieldUpdate::Int(30)).unwrap();
        assert_eq!(SelectorField::TokenTtl.read(&cfg), FieldValue::Ttl(Duration::from_secs(30)));
    }

    #[test]
    fn input_set_mirrors_field_write() {
        let mut input = SelectorInput::default();
        input.set(SelectorField::Policies, FieldUpdate::Text("a,b".into())).unwrap();
        input.set(SelectorField::NumUses, FieldUpdate::Int(3)).unwrap();
        input.set(SelectorField::WrapTtl, FieldUpdate::Int(30)).unwrap();
        assert_eq!(input.policies.as_deref(), Some("a,b"));
        assert_eq!(input.num_uses, Some(3));
        assert_eq!(input.wrap_ttl, Some(30));
        assert_eq!(input.set(SelectorField::TokenTtl, FieldUpdate::Int(-5)).unwrap_err().code_str(), "token_ttl");
        assert!(input.set(SelectorField::Apps, FieldUpdate::Int(1)).is_err());
        assert_eq!(input.token_ttl, None);
    }

    #[test]
    fn stored_durations_are_seconds() {
        let mut cfg = SelectorConfig::empty("web");
        cfg.token_ttl = Duration::from_secs(90);
        let v = serde_json::to_value(&cfg).unwrap();
        assert_eq!(v["token_ttl"], 90);
        let back: SelectorConfig = serde_json::from_value(v).unwrap();
        assert_eq!(back, cfg);
    }
}
