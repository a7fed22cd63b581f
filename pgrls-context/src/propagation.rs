//! Context propagation for a unit of work
//!
//! The request layer hands over a trusted [`Principal`]; the propagator
//! derives context entries from it, applies them before any protected query
//! runs and restores them exactly once on every exit path.
//!
//! Only server-trusted values become context. Request headers, query
//! parameters and bodies have no path in here.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use pgrls_common::{Error, Result, RlsConfig, Session};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::guard::ContextGuard;
use crate::store::{ContextKey, ContextStore};

/// Who the unit of work runs as
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Identity {
    #[default]
    Anonymous,
    Authenticated { user_id: String },
}

/// Server-side view of the caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub identity: Identity,
    /// Tenant resolved from the session, never from the request
    pub tenant_id: Option<String>,
    /// Trusted attributes of the identity (e.g. `email`)
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Principal {
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn authenticated(user_id: impl Into<String>) -> Self {
        Self {
            identity: Identity::Authenticated {
                user_id: user_id.into(),
            },
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        match &self.identity {
            Identity::Authenticated { user_id } => Some(user_id),
            Identity::Anonymous => None,
        }
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self.identity, Identity::Authenticated { .. })
    }
}

/// Derives extra context entries from a principal
pub trait ContextExtractor: Send + Sync {
    /// Identifier used in `context_extractors`
    fn id(&self) -> &str;

    fn extract(&self, principal: &Principal) -> Vec<(ContextKey, String)>;
}

/// Publishes the authenticated identity's e-mail as `email`
#[derive(Debug, Clone, Copy, Default)]
pub struct EmailExtractor;

impl ContextExtractor for EmailExtractor {
    fn id(&self) -> &str {
        "email"
    }

    fn extract(&self, principal: &Principal) -> Vec<(ContextKey, String)> {
        if !principal.is_authenticated() {
            return vec![];
        }
        principal
            .attributes
            .get("email")
            .filter(|email| !email.is_empty())
            .and_then(|email| Some((ContextKey::new("email").ok()?, email.clone())))
            .into_iter()
            .collect()
    }
}

/// Extractors available for configuration, by identifier
#[derive(Default)]
pub struct ExtractorRegistry {
    extractors: BTreeMap<String, Arc<dyn ContextExtractor>>,
}

impl fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractorRegistry")
            .field("extractors", &self.extractors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ExtractorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in extractors
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .extractors
            .insert("email".to_string(), Arc::new(EmailExtractor));
        registry
    }

    /// # Errors
    /// `Error::Configuration` when the identifier is taken.
    pub fn register(&mut self, extractor: Arc<dyn ContextExtractor>) -> Result<()> {
        let id = extractor.id().to_string();
        if self.extractors.contains_key(&id) {
            return Err(Error::Configuration(format!(
                "context extractor '{id}' is already registered"
            )));
        }
        self.extractors.insert(id, extractor);
        Ok(())
    }

    /// Resolve configured identifiers, in order
    ///
    /// # Errors
    /// `Error::Configuration` naming the first unknown identifier.
    pub fn resolve(&self, ids: &[String]) -> Result<Vec<Arc<dyn ContextExtractor>>> {
        ids.iter()
            .map(|id| {
                self.extractors.get(id).cloned().ok_or_else(|| {
                    Error::Configuration(format!("unknown context extractor '{id}'"))
                })
            })
            .collect()
    }
}

/// Applies a principal's context around a unit of work
pub struct ContextPropagator {
    store: ContextStore,
    extractors: Vec<Arc<dyn ContextExtractor>>,
}

impl ContextPropagator {
    #[must_use]
    pub fn new(store: ContextStore, extractors: Vec<Arc<dyn ContextExtractor>>) -> Self {
        Self { store, extractors }
    }

    /// Build from configuration, resolving `context_extractors`
    ///
    /// # Errors
    /// `Error::Configuration` for an unknown extractor, or the identifier
    /// error for an unsafe namespace.
    pub fn from_config(config: &RlsConfig, registry: &ExtractorRegistry) -> Result<Self> {
        let store = ContextStore::from_config(config)?;
        let extractors = registry.resolve(&config.context_extractors)?;
        Ok(Self::new(store, extractors))
    }

    #[must_use]
    pub fn store(&self) -> &ContextStore {
        &self.store
    }

    /// Entries a principal maps to
    ///
    /// Anonymous principals produce no `user_id` entry at all: an unset key
    /// reads as NULL and never matches an ownership policy.
    #[must_use]
    pub fn entries(&self, principal: &Principal) -> Vec<(ContextKey, String)> {
        let mut entries = Vec::new();
        if let Some(user_id) = principal.user_id() {
            entries.push((ContextKey::user_id(), user_id.to_string()));
        }
        if let Some(tenant_id) = &principal.tenant_id {
            entries.push((ContextKey::tenant_id(), tenant_id.clone()));
        }

        for extractor in &self.extractors {
            for (key, value) in extractor.extract(principal) {
                if key == ContextKey::user_id() || key == ContextKey::tenant_id() {
                    warn!(extractor = extractor.id(), key = %key, "Ignoring reserved context key");
                    continue;
                }
                entries.push((key, value));
            }
        }
        entries
    }

    /// Apply the principal's context; it is restored when the guard drops
    ///
    /// # Errors
    /// Whatever the session reports.
    pub fn enter<'s, S: Session>(
        &self,
        session: &'s mut S,
        principal: &Principal,
    ) -> std::result::Result<ContextGuard<'s, S>, S::Error> {
        let entries = self.entries(principal);
        debug!(
            authenticated = principal.is_authenticated(),
            keys = ?entries.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            "Entering context"
        );
        self.store.scope(session, entries)
    }

    /// Run `work` under the principal's context
    ///
    /// # Errors
    /// The first of: a failure applying context, the error `work` returned,
    /// a failure restoring context.
    pub fn run<S, T, E, F>(&self, session: &mut S, principal: &Principal, work: F) -> std::result::Result<T, E>
    where
        S: Session,
        E: From<S::Error>,
        F: FnOnce(&mut S) -> std::result::Result<T, E>,
    {
        let entries = self.entries(principal);
        self.store.with_context(session, entries, work)
    }
}
