//! Context variables for row level security
//!
//! - `ContextStore`: get, set and clear namespaced session variables
//!   (`rls.user_id`, `rls.tenant_id`, ...) through bound parameters
//! - `ContextGuard`: scoped acquisition that restores prior values on every
//!   exit path, including early returns and panics
//! - Propagation: turning a trusted principal into context at the start of
//!   a unit of work, with pluggable extractors

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod guard;
pub mod propagation;
pub mod store;

pub use guard::ContextGuard;
pub use propagation::{
    ContextExtractor, ContextPropagator, EmailExtractor, ExtractorRegistry, Identity, Principal,
};
pub use store::{ContextKey, ContextStore, CURRENT_SETTING_SQL, SET_CONFIG_SQL};
