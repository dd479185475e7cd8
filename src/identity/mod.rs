//! Selector administration, UserID lifecycle and the login path.
//! Keep the public surface thin and split implementation across sub-modules.

mod backend;
mod combiner;
mod locks;
mod selector;
mod selector_store;
mod session;
mod userid;
mod wrapping;

pub use backend::{Backend, CredsResponse, LoginAuth, LoginResponse};
pub use combiner::{combine, EffectiveConstraints};
pub use locks::KeyLocks;
pub use selector::{FieldUpdate, FieldValue, SelectorConfig, SelectorField, SelectorInput, SelectorKind, SelectorRef, GENERIC_NAME, MAX_TTL};
pub use selector_store::{SelectorStore, UpsertOutcome};
pub use session::{IssuedToken, MintRequest, SessionManager, SessionToken, TokenIssuer};
pub use userid::{UserIdEntry, UserIdRegistry};
pub use wrapping::{CubbyholeWrapper, ResponseWrapper, WrapInfo};
