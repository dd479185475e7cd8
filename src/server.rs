//!
//! appgroup HTTP server
//! --------------------
//! Axum routes over the identity backend.
//!
//! Responsibilities:
//! - Selector administration for `/app`, `/group` and the singleton `/generic`,
//!   whole-record and per-field.
//! - Credential issuance (`creds`, `creds-specific`).
//! - Login, token renewal and unwrapping of wrapped responses.
//! - Background tidy of expired UserIDs, tokens and wrap slots, and a final snapshot on
//!   shutdown.
//!
//! Request bodies are read as raw bytes and decoded here, so malformed input always
//! surfaces as an `AppError` JSON body.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::{get, post}, Router, extract::{State, Path}, Json};
use axum::body::Bytes;
use axum::response::{IntoResponse, Response};
use axum::http::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn, error};

use crate::config::Settings;
use crate::error::{AppError, AppResult};
use crate::identity::{
    Backend, CredsResponse, CubbyholeWrapper, FieldUpdate, FieldValue, LoginAuth, LoginResponse, SelectorConfig,
    SelectorField, SelectorInput, SelectorKind, SessionManager, UpsertOutcome, WrapInfo, GENERIC_NAME,
};
use crate::storage::KvStore;

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<Backend>,
    pub store: KvStore,
}

impl AppState {
    /// Build the backend and its in-process collaborators on top of `store`.
    pub fn new(store: KvStore, settings: &Settings) -> AppResult<Self> {
        let sessions = Arc::new(SessionManager::new(settings.default_token_ttl(), settings.max_token_ttl()));
        let backend = Backend::new(Arc::new(store.clone()), sessions, Arc::new(CubbyholeWrapper::new()))?;
        Ok(Self { backend: Arc::new(backend), store })
    }
}

#[derive(Debug, Deserialize)]
struct UserIdPayload {
    #[serde(default)]
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct TokenPayload {
    #[serde(default)]
    token: String,
    /// Seconds
    #[serde(default)]
    increment: Option<u64>,
}

// ---- explicit response shapes ----

fn secs(d: Duration) -> Value { json!(d.as_secs()) }

/// Read view of a selector. Membership lists appear only on kinds that carry them.
pub fn selector_json(kind: SelectorKind, cfg: &SelectorConfig) -> Value {
    let mut m = Map::new();
    m.insert("policies".into(), json!(cfg.policies));
    m.insert("num_uses".into(), json!(cfg.num_uses));
    m.insert("userid_ttl".into(), secs(cfg.userid_ttl));
    m.insert("token_ttl".into(), secs(cfg.token_ttl));
    m.insert("token_max_ttl".into(), secs(cfg.token_max_ttl));
    m.insert("wrap_ttl".into(), secs(cfg.wrap_ttl));
    if kind != SelectorKind::App { m.insert("apps".into(), json!(cfg.apps)); }
    if kind == SelectorKind::Generic { m.insert("groups".into(), json!(cfg.groups)); }
    Value::Object(m)
}

fn field_json(field: SelectorField, value: &FieldValue) -> Value {
    let v = match value {
        FieldValue::Names(names) => json!(names),
        FieldValue::Count(n) => json!(n),
        FieldValue::Ttl(d) => secs(*d),
    };
    json!({ field.key(): v })
}

pub fn wrap_info_json(info: &WrapInfo) -> Value {
    json!({
        "wrap_info": {
            "token": info.token,
            "ttl": info.ttl.as_secs(),
            "creation_time": info.creation_time.to_rfc3339(),
        }
    })
}

pub fn auth_json(auth: &LoginAuth) -> Value { json!({ "auth": auth.to_json() }) }

fn ok_json(v: Value) -> Response { (StatusCode::OK, Json(v)).into_response() }

fn no_content() -> Response { StatusCode::NO_CONTENT.into_response() }

// ---- request decoding ----

/// Parse a request body. An empty body reads as `{}`.
fn json_body(bytes: &[u8]) -> AppResult<Value> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(json!({}));
    }
    serde_json::from_slice(bytes).map_err(|e| AppError::validation("invalid_body", format!("invalid JSON body: {}", e)))
}

fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> AppResult<T> {
    serde_json::from_value(json_body(bytes)?).map_err(|e| AppError::validation("invalid_body", e.to_string()))
}

/// Accepted shapes for one field value: list fields take a comma string or a string
/// array, counts and TTLs an integer or a numeric string.
fn coerce(field: SelectorField, raw: &Value) -> AppResult<FieldUpdate> {
    let text_field = matches!(field, SelectorField::Policies | SelectorField::Apps | SelectorField::Groups);
    let bad = || AppError::validation("invalid_value", format!("invalid value for {}", field.key()));
    match raw {
        Value::String(s) if text_field => Ok(FieldUpdate::Text(s.clone())),
        Value::Array(items) if text_field => {
            let parts: Option<Vec<&str>> = items.iter().map(|v| v.as_str()).collect();
            parts.map(|p| FieldUpdate::Text(p.join(","))).ok_or_else(bad)
        }
        Value::Number(n) if !text_field => n.as_i64().map(FieldUpdate::Int).ok_or_else(bad),
        Value::String(s) if !text_field => s.trim().parse::<i64>().map(FieldUpdate::Int).map_err(|_| bad()),
        _ => Err(bad()),
    }
}

/// Per-field bodies name the field (`{"num_uses": 3}`) or use a bare `value` key.
fn field_update(field: SelectorField, body: &Value) -> AppResult<FieldUpdate> {
    let raw = body
        .get(field.key())
        .or_else(|| body.get("value"))
        .ok_or_else(|| AppError::validation("missing_value", format!("missing {}", field.key())))?;
    coerce(field, raw)
}

/// Whole-record bodies accept the same value shapes as the per-field routes. Unknown keys
/// and nulls are ignored.
fn selector_input(body: &Value) -> AppResult<SelectorInput> {
    let Some(obj) = body.as_object() else {
        return Err(AppError::validation("invalid_body", "expected a JSON object"));
    };
    let mut input = SelectorInput::default();
    for field in SelectorField::ALL {
        match obj.get(field.key()) {
            None | Some(Value::Null) => {}
            Some(raw) => input.set(field, coerce(field, raw)?)?,
        }
    }
    Ok(input)
}

fn parse_field(seg: &str) -> AppResult<SelectorField> {
    SelectorField::from_path(seg).ok_or_else(|| AppError::not_found("unknown_path", format!("unsupported path segment {}", seg)))
}

// ---- handlers ----

pub fn list_selectors(state: &AppState, kind: SelectorKind) -> AppResult<Response> {
    let keys = state.backend.selectors.list(kind)?;
    Ok(ok_json(json!({ "keys": keys })))
}

pub fn write_selector(state: &AppState, kind: SelectorKind, name: &str, input: &SelectorInput) -> AppResult<Response> {
    let outcome = state.backend.selectors.upsert(kind, name, input)?;
    info!(target: "appgroup", kind = %kind, name = %name, ?outcome, "selector saved");
    Ok(match outcome {
        UpsertOutcome::Created => StatusCode::CREATED.into_response(),
        UpsertOutcome::Updated => no_content(),
    })
}

pub fn read_selector(state: &AppState, kind: SelectorKind, name: &str) -> AppResult<Response> {
    match state.backend.selector(kind, name)? {
        Some(cfg) => Ok(ok_json(json!({ "data": selector_json(kind, &cfg) }))),
        None => Err(AppError::not_found("selector_not_found", format!("{} {} does not exist", kind, name))),
    }
}

pub fn delete_selector(state: &AppState, kind: SelectorKind, name: &str) -> AppResult<Response> {
    state.backend.selectors.delete(kind, name)?;
    info!(target: "appgroup", kind = %kind, name = %name, "selector deleted");
    Ok(no_content())
}

/// `GET .../{field}`: `creds` issues a UserID, anything else reads a field.
pub fn get_sub(state: &AppState, kind: SelectorKind, name: &str, seg: &str) -> AppResult<Response> {
    if seg == "creds" {
        return match state.backend.creds(kind, name)? {
            CredsResponse::Plain { user_id } => Ok(ok_json(json!({ "data": { "user_id": user_id } }))),
            CredsResponse::Wrapped(info) => Ok(ok_json(wrap_info_json(&info))),
        };
    }
    let field = parse_field(seg)?;
    match state.backend.read_field(kind, name, field)? {
        Some(v) => Ok(ok_json(json!({ "data": field_json(field, &v) }))),
        None => Err(AppError::not_found("selector_not_found", format!("{} {} does not exist", kind, name))),
    }
}

/// `POST .../{field}`: `creds-specific` registers a caller UserID, anything else updates a field.
pub fn post_sub(state: &AppState, kind: SelectorKind, name: &str, seg: &str, body: &Value) -> AppResult<Response> {
    if seg == "creds-specific" {
        let user_id = body.get("user_id").and_then(|v| v.as_str()).unwrap_or("");
        state.backend.creds_specific(kind, name, user_id)?;
        return Ok(no_content());
    }
    let field = parse_field(seg)?;
    let value = field_update(field, body)?;
    state.backend.update_field(kind, name, field, value)?;
    Ok(no_content())
}

pub fn delete_sub(state: &AppState, kind: SelectorKind, name: &str, seg: &str) -> AppResult<Response> {
    let field = parse_field(seg)?;
    state.backend.reset_field(kind, name, field)?;
    Ok(no_content())
}

pub fn login(state: &AppState, user_id: &str) -> AppResult<Response> {
    match state.backend.login(user_id)? {
        LoginResponse::Auth(auth) => Ok(ok_json(auth_json(&auth))),
        LoginResponse::Wrapped(info) => Ok(ok_json(wrap_info_json(&info))),
    }
}

pub fn renew(state: &AppState, token: &str, increment: Option<u64>) -> AppResult<Response> {
    let auth = state.backend.renew(token, increment.map(Duration::from_secs))?;
    Ok(ok_json(auth_json(&auth)))
}

pub fn unwrap(state: &AppState, token: &str) -> AppResult<Response> {
    let payload = state.backend.unwrap(token)?;
    Ok(ok_json(json!({ "data": payload })))
}

fn post_selector(state: &AppState, kind: SelectorKind, name: &str, body: &[u8]) -> AppResult<Response> {
    let input = selector_input(&json_body(body)?)?;
    write_selector(state, kind, name, &input)
}

fn post_field(state: &AppState, kind: SelectorKind, name: &str, seg: &str, body: &[u8]) -> AppResult<Response> {
    post_sub(state, kind, name, seg, &json_body(body)?)
}

fn named_routes(kind: SelectorKind) -> Router<AppState> {
    let base = format!("/{}", kind);
    let named = format!("/{}/{{name}}", kind);
    let sub = format!("/{}/{{name}}/{{field}}", kind);
    Router::new()
        .route(&base, get(move |State(st): State<AppState>| async move { list_selectors(&st, kind) }))
        .route(
            &named,
            post(move |State(st): State<AppState>, Path(name): Path<String>, body: Bytes| async move {
                post_selector(&st, kind, &name, &body)
            })
            .get(move |State(st): State<AppState>, Path(name): Path<String>| async move { read_selector(&st, kind, &name) })
            .delete(move |State(st): State<AppState>, Path(name): Path<String>| async move { delete_selector(&st, kind, &name) }),
        )
        .route(
            &sub,
            post(move |State(st): State<AppState>, Path((name, field)): Path<(String, String)>, body: Bytes| async move {
                post_field(&st, kind, &name, &field, &body)
            })
            .get(move |State(st): State<AppState>, Path((name, field)): Path<(String, String)>| async move {
                get_sub(&st, kind, &name, &field)
            })
            .delete(move |State(st): State<AppState>, Path((name, field)): Path<(String, String)>| async move {
                delete_sub(&st, kind, &name, &field)
            }),
        )
}

fn generic_routes() -> Router<AppState> {
    let kind = SelectorKind::Generic;
    Router::new()
        .route(
            "/generic",
            post(move |State(st): State<AppState>, body: Bytes| async move { post_selector(&st, kind, GENERIC_NAME, &body) })
            .get(move |State(st): State<AppState>| async move { read_selector(&st, kind, GENERIC_NAME) })
            .delete(move |State(st): State<AppState>| async move { delete_selector(&st, kind, GENERIC_NAME) }),
        )
        .route(
            "/generic/{field}",
            post(move |State(st): State<AppState>, Path(field): Path<String>, body: Bytes| async move {
                post_field(&st, kind, GENERIC_NAME, &field, &body)
            })
            .get(move |State(st): State<AppState>, Path(field): Path<String>| async move { get_sub(&st, kind, GENERIC_NAME, &field) })
            .delete(move |State(st): State<AppState>, Path(field): Path<String>| async move { delete_sub(&st, kind, GENERIC_NAME, &field) }),
        )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "appgroup ok" }))
        .route("/login", post(|State(st): State<AppState>, body: Bytes| async move {
            decode_body::<UserIdPayload>(&body).and_then(|p| login(&st, &p.user_id))
        }))
        .route("/renew", post(|State(st): State<AppState>, body: Bytes| async move {
            decode_body::<TokenPayload>(&body).and_then(|p| renew(&st, &p.token, p.increment))
        }))
        .route("/unwrap", post(|State(st): State<AppState>, body: Bytes| async move {
            decode_body::<TokenPayload>(&body).and_then(|p| unwrap(&st, &p.token))
        }))
        .merge(named_routes(SelectorKind::App))
        .merge(named_routes(SelectorKind::Group))
        .merge(generic_routes())
        .with_state(state)
}

/// Periodically drop expired UserIDs, tokens and wrap slots.
fn spawn_tidy(state: &AppState, every: Duration) {
    let backend = state.backend.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(every).await;
            if let Err(e) = backend.tidy() {
                warn!(target: "appgroup", error = %e, "tidy failed");
            }
        }
    });
}

/// Open the store under `settings.data_dir` and serve until ctrl-c.
pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let store = if settings.persist {
        KvStore::open(&settings.data_dir, settings.persistence())?
    } else {
        KvStore::in_memory()
    };
    info!(
        target: "appgroup",
        "store ready: persist={}, data_dir='{}', keys={}",
        settings.persist, settings.data_dir.display(), store.len()
    );
    let state = AppState::new(store.clone(), &settings)?;
    match settings.tidy_interval() {
        Some(every) => spawn_tidy(&state, every),
        None => info!(target: "appgroup", "tidy disabled"),
    }

    let app = router(state);
    let addr: SocketAddr = format!("0.0.0.0:{}", settings.http_port).parse()?;
    info!(target: "appgroup", "Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(target: "appgroup", "ctrl-c handler failed: {}", e);
            }
        })
        .await?;

    if settings.persist {
        store.flush()?;
        info!(target: "appgroup", "final snapshot written");
    }
    Ok(())
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod server_tests;
