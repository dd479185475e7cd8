use parking_lot::RwLock;
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::security::normalize_name;
use crate::storage::{get_json, put_json, SharedStorage, Storage};

use super::selector::{FieldUpdate, FieldValue, SelectorConfig, SelectorField, SelectorInput, SelectorKind};

/// Whether an upsert created the selector or merged onto an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Durable selector configurations, one namespace per kind.
///
/// Each kind has its own reader/writer lock. Mutations hold the write lock across the
/// whole read-modify-write so concurrent per-field updates cannot lose each other.
pub struct SelectorStore {
    storage: SharedStorage,
    app_lock: RwLock<()>,
    group_lock: RwLock<()>,
    generic_lock: RwLock<()>,
}

impl SelectorStore {
    pub fn new(storage: SharedStorage) -> Self {
        Self { storage, app_lock: RwLock::new(()), group_lock: RwLock::new(()), generic_lock: RwLock::new(()) }
    }

    fn lock_for(&self, kind: SelectorKind) -> &RwLock<()> {
        match kind {
            SelectorKind::App => &self.app_lock,
            SelectorKind::Group => &self.group_lock,
            SelectorKind::Generic => &self.generic_lock,
        }
    }

    fn key(kind: SelectorKind, name: &str) -> String { format!("{}{}", kind.prefix(), name) }

    // Callers must hold the kind's lock.
    fn load(&self, kind: SelectorKind, name: &str) -> AppResult<Option<SelectorConfig>> {
        get_json(self.storage.as_ref(), &Self::key(kind, name))
    }

    fn store(&self, kind: SelectorKind, cfg: &SelectorConfig) -> AppResult<()> {
        put_json(self.storage.as_ref(), &Self::key(kind, &cfg.name), cfg)
    }

    /// Create the selector with defaults for absent fields, or merge the supplied fields
    /// onto the existing record.
    pub fn upsert(&self, kind: SelectorKind, name: &str, input: &SelectorInput) -> AppResult<UpsertOutcome> {
        let name = normalize_name(name)?;
        let _w = self.lock_for(kind).write();
        let existing = self.load(kind, &name)?;
        let (mut cfg, create) = match existing {
            Some(cfg) => (cfg, false),
            None => (SelectorConfig::empty(name.clone()), true),
        };
        input.apply(kind, &mut cfg, create)?;
        self.store(kind, &cfg)?;
        debug!(target: "appgroup", kind = %kind, name = %name, create, "selector written");
        Ok(if create { UpsertOutcome::Created } else { UpsertOutcome::Updated })
    }

    pub fn get(&self, kind: SelectorKind, name: &str) -> AppResult<Option<SelectorConfig>> {
        let name = normalize_name(name)?;
        let _r = self.lock_for(kind).read();
        self.load(kind, &name)
    }

    /// Remove the selector. Outstanding UserIDs issued against it are left alone.
    pub fn delete(&self, kind: SelectorKind, name: &str) -> AppResult<()> {
        let name = normalize_name(name)?;
        let _w = self.lock_for(kind).write();
        self.storage.delete(&Self::key(kind, &name))?;
        debug!(target: "appgroup", kind = %kind, name = %name, "selector deleted");
        Ok(())
    }

    pub fn list(&self, kind: SelectorKind) -> AppResult<Vec<String>> {
        let _r = self.lock_for(kind).read();
        let names = self.storage.list(&kind.prefix())?;
        Ok(names.into_iter().filter(|n| !n.ends_with('/')).collect())
    }

    pub fn read_field(&self, kind: SelectorKind, name: &str, field: SelectorField) -> AppResult<Option<FieldValue>> {
        field.check_applies(kind)?;
        Ok(self.get(kind, name)?.map(|cfg| field.read(&cfg)))
    }

    pub fn update_field(&self, kind: SelectorKind, name: &str, field: SelectorField, value: FieldUpdate) -> AppResult<()> {
        field.check_applies(kind)?;
        self.mutate(kind, name, |cfg| {
            field.write(cfg, value)?;
            cfg.validate()
        })
    }

    pub fn reset_field(&self, kind: SelectorKind, name: &str, field: SelectorField) -> AppResult<()> {
        field.check_applies(kind)?;
        self.mutate(kind, name, |cfg| {
            field.reset(cfg);
            Ok(())
        })
    }

    fn mutate<F>(&self, kind: SelectorKind, name: &str, f: F) -> AppResult<()>
    where
        F: FnOnce(&mut SelectorConfig) -> AppResult<()>,
    {
        let name = normalize_name(name)?;
        let _w = self.lock_for(kind).write();
        let Some(mut cfg) = self.load(kind, &name)? else {
            return Err(AppError::not_found("selector_not_found", format!("{} {} does not exist", kind, name)));
        };
        f(&mut cfg)?;
        self.store(kind, &cfg)
    }

    /// Every Group whose member list names `app`.
    pub fn groups_for_app(&self, app: &str) -> AppResult<Vec<SelectorConfig>> {
        let app = normalize_name(app)?;
        let _r = self.group_lock.read();
        let mut out = Vec::new();
        for name in self.storage.list(&SelectorKind::Group.prefix())? {
            if name.ends_with('/') { continue; }
            if let Some(cfg) = self.load(SelectorKind::Group, &name)? {
                if cfg.apps.iter().any(|a| a == &app) { out.push(cfg); }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use crate::storage::KvStore;

    fn store() -> SelectorStore { SelectorStore::new(Arc::new(KvStore::in_memory())) }

    #[test]
    fn upsert_creates_then_updates() {
        let s = store();
        let input = SelectorInput { policies: Some("p1,p2".into()), num_uses: Some(3), userid_ttl: Some(60), ..Default::default() };
        assert_eq!(s.upsert(SelectorKind::App, "svc1", &input).unwrap(), UpsertOutcome::Created);
        let again = SelectorInput { token_ttl: Some(30), ..Default::default() };
        assert_eq!(s.upsert(SelectorKind::App, "svc1", &again).unwrap(), UpsertOutcome::Updated);
        let cfg = s.get(SelectorKind::App, "svc1").unwrap().unwrap();
        assert_eq!(cfg.policies, vec!["default", "p1", "p2"]);
        assert_eq!(cfg.num_uses, 3);
        assert_eq!(cfg.userid_ttl, Duration::from_secs(60));
        assert_eq!(cfg.token_ttl, Duration::from_secs(30));
    }

    #[test]
    fn names_are_case_insensitive() {
        let s = store();
        s.upsert(SelectorKind::App, "AppOne", &SelectorInput::default()).unwrap();
        assert!(s.get(SelectorKind::App, "appone").unwrap().is_some());
        assert_eq!(s.list(SelectorKind::App).unwrap(), vec!["appone".to_string()]);
    }

    #[test]
    fn rejected_upsert_writes_nothing() {
        let s = store();
        let bad = SelectorInput { token_ttl: Some(100), token_max_ttl: Some(10), ..Default::default() };
        assert!(s.upsert(SelectorKind::App, "web", &bad).is_err());
        assert!(s.get(SelectorKind::App, "web").unwrap().is_none());

        s.upsert(SelectorKind::App, "web", &SelectorInput { token_max_ttl: Some(10), ..Default::default() }).unwrap();
        assert!(s.update_field(SelectorKind::App, "web", SelectorField::TokenTtl, FieldUpdate::Int(100)).is_err());
        assert!(s.get(SelectorKind::App, "web").unwrap().unwrap().token_ttl.is_zero());
    }

    #[test]
    fn oversized_ttl_writes_nothing() {
        let s = store();
        let big = SelectorInput { userid_ttl: Some(u64::MAX), ..Default::default() };
        assert_eq!(s.upsert(SelectorKind::App, "big", &big).unwrap_err().http_status(), 400);
        assert!(s.get(SelectorKind::App, "big").unwrap().is_none());

        s.upsert(SelectorKind::App, "big", &SelectorInput { wrap_ttl: Some(30), ..Default::default() }).unwrap();
        assert!(s.update_field(SelectorKind::App, "big", SelectorField::WrapTtl, FieldUpdate::Int(i64::MAX)).is_err());
        assert_eq!(s.get(SelectorKind::App, "big").unwrap().unwrap().wrap_ttl, Duration::from_secs(30));
    }

    #[test]
    fn kinds_are_separate_namespaces() {
        let s = store();
        s.upsert(SelectorKind::App, "web", &SelectorInput::default()).unwrap();
        assert!(s.get(SelectorKind::Group, "web").unwrap().is_none());
        assert!(s.list(SelectorKind::Group).unwrap().is_empty());
    }

    #[test]
    fn reset_field_only_touches_that_field() {
        let s = store();
        let input = SelectorInput { policies: Some("p1".into()), num_uses: Some(4), token_ttl: Some(20), ..Default::default() };
        s.upsert(SelectorKind::App, "web", &input).unwrap();
        s.reset_field(SelectorKind::App, "web", SelectorField::Policies).unwrap();
        let cfg = s.get(SelectorKind::App, "web").unwrap().unwrap();
        assert!(cfg.policies.is_empty());
        assert_eq!(cfg.num_uses, 4);
        assert_eq!(cfg.token_ttl, Duration::from_secs(20));
    }

    #[test]
    fn field_ops_on_missing_selector() {
        let s = store();
        assert!(s.read_field(SelectorKind::App, "nope", SelectorField::NumUses).unwrap().is_none());
        let err = s.update_field(SelectorKind::App, "nope", SelectorField::NumUses, FieldUpdate::Int(1)).unwrap_err();
        assert!(err.is_not_found());
        assert!(s.reset_field(SelectorKind::App, "nope", SelectorField::NumUses).unwrap_err().is_not_found());
    }

    #[test]
    fn delete_is_idempotent() {
        let s = store();
        s.upsert(SelectorKind::Group, "ops", &SelectorInput::default()).unwrap();
        s.delete(SelectorKind::Group, "ops").unwrap();
        s.delete(SelectorKind::Group, "ops").unwrap();
        assert!(s.get(SelectorKind::Group, "ops").unwrap().is_none());
    }

    #[test]
    fn groups_for_app_follows_membership() {
        let s = store();
        s.upsert(SelectorKind::Group, "g1", &SelectorInput { apps: Some("web,db".into()), ..Default::default() }).unwrap();
        s.upsert(SelectorKind::Group, "g2", &SelectorInput { apps: Some("WEB".into()), ..Default::default() }).unwrap();
        s.upsert(SelectorKind::Group, "g3", &SelectorInput { apps: Some("db".into()), ..Default::default() }).unwrap();
        let names: Vec<String> = s.groups_for_app("web").unwrap().into_iter().map(|g| g.name).collect();
        assert_eq!(names, vec!["g1".to_string(), "g2".to_string()]);
    }

    #[test]
    fn concurrent_field_updates_are_not_lost() {
        let s = Arc::new(store());
        s.upsert(SelectorKind::App, "web", &SelectorInput::default()).unwrap();
        std::thread::scope(|scope| {
            let a = s.clone();
            scope.spawn(move || {
                for i in 0..50 { a.update_field(SelectorKind::App, "web", SelectorField::NumUses, FieldUpdate::Int(i)).unwrap(); }
            });
            let b = s.clone();
            scope.spawn(move || {
                for i in 0..50 { b.update_field(SelectorKind::App, "web", SelectorField::UserIdTtl, FieldUpdate::Int(i)).unwrap(); }
            });
        });
        let cfg = s.get(SelectorKind::App, "web").unwrap().unwrap();
        assert_eq!(cfg.num_uses, 49);
        assert_eq!(cfg.userid_ttl, Duration::from_secs(49));
    }
}
