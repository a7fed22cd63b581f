//! Context store
//!
//! All state lives in the database session; the store itself only knows the
//! namespace. Values always travel as bound parameters.
//!
//! Writes default to session scope. A transaction-local write under
//! autocommit is gone before the next statement runs, so `set_local` is only
//! useful inside an explicit, long-lived transaction.

use std::fmt;

use pgrls_common::{Ident, PolicyError, RlsConfig, Session, SqlValue};
use tracing::trace;

use crate::guard::ContextGuard;

/// `set_config(setting_name, new_value, is_local)`
pub const SET_CONFIG_SQL: &str = "SELECT set_config($1, $2, $3)";

/// `current_setting(setting_name, missing_ok)`
pub const CURRENT_SETTING_SQL: &str = "SELECT current_setting($1, true)";

/// Name of a context variable, without namespace
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextKey(Ident);

impl ContextKey {
    /// # Errors
    /// Returns the identifier error when `name` is not a safe identifier.
    pub fn new(name: &str) -> Result<Self, PolicyError> {
        Ident::new(name).map(Self)
    }

    #[must_use]
    pub fn user_id() -> Self {
        Self(Ident::from_static("user_id"))
    }

    #[must_use]
    pub fn tenant_id() -> Self {
        Self(Ident::from_static("tenant_id"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<Ident> for ContextKey {
    fn from(ident: Ident) -> Self {
        Self(ident)
    }
}

impl TryFrom<&str> for ContextKey {
    type Error = PolicyError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reads and writes context variables on a live session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextStore {
    namespace: Ident,
}

impl Default for ContextStore {
    fn default() -> Self {
        Self {
            namespace: Ident::from_static("rls"),
        }
    }
}

impl ContextStore {
    /// # Errors
    /// Returns the identifier error for an unsafe namespace.
    pub fn new(namespace: &str) -> Result<Self, PolicyError> {
        Ok(Self {
            namespace: Ident::new(namespace)?,
        })
    }

    /// # Errors
    /// Returns the identifier error for an unsafe `context_namespace`.
    pub fn from_config(config: &RlsConfig) -> pgrls_common::Result<Self> {
        Ok(Self::new(&config.context_namespace)?)
    }

    #[must_use]
    pub fn namespace(&self) -> &Ident {
        &self.namespace
    }

    /// Fully qualified setting name, e.g. `rls.user_id`
    #[must_use]
    pub fn setting_name(&self, key: &ContextKey) -> String {
        format!("{}.{}", self.namespace, key)
    }

    /// Set a variable for the rest of the session
    ///
    /// # Errors
    /// Whatever the session reports.
    pub fn set<S: Session>(&self, session: &mut S, key: &ContextKey, value: &str) -> Result<(), S::Error> {
        self.write(session, key, value, false)
    }

    /// Set a variable for the rest of the current transaction only
    ///
    /// # Errors
    /// Whatever the session reports.
    pub fn set_local<S: Session>(
        &self,
        session: &mut S,
        key: &ContextKey,
        value: &str,
    ) -> Result<(), S::Error> {
        self.write(session, key, value, true)
    }

    /// Current value, `None` when unset or empty
    ///
    /// # Errors
    /// Whatever the session reports.
    pub fn get<S: Session>(&self, session: &mut S, key: &ContextKey) -> Result<Option<String>, S::Error> {
        let value = session.query_scalar(CURRENT_SETTING_SQL, &[self.setting_name(key).into()])?;
        Ok(value.into_text().filter(|v| !v.is_empty()))
    }

    /// Reset a variable to the empty string, which policies read as NULL
    ///
    /// # Errors
    /// Whatever the session reports.
    pub fn clear<S: Session>(&self, session: &mut S, key: &ContextKey) -> Result<(), S::Error> {
        self.write(session, key, "", false)
    }

    /// Apply `entries` until the returned guard is dropped or closed
    ///
    /// Prior values are captured first and restored in reverse order on
    /// exit; keys that were unset are cleared. If applying fails midway the
    /// entries already applied are restored before the error is returned.
    ///
    /// # Errors
    /// Whatever the session reports.
    pub fn scope<'s, S, I>(&self, session: &'s mut S, entries: I) -> Result<ContextGuard<'s, S>, S::Error>
    where
        S: Session,
        I: IntoIterator<Item = (ContextKey, String)>,
    {
        let mut guard = ContextGuard::new(session, self.clone());
        for (key, value) in entries {
            let prior = self.get(&mut *guard, &key)?;
            guard.remember(key.clone(), prior);
            self.set(&mut *guard, &key, &value)?;
        }
        Ok(guard)
    }

    /// Run `work` with `entries` applied, restoring afterwards
    ///
    /// # Errors
    /// The first of: a failure applying context, the error `work` returned,
    /// a failure restoring context.
    pub fn with_context<S, I, T, E, F>(&self, session: &mut S, entries: I, work: F) -> Result<T, E>
    where
        S: Session,
        I: IntoIterator<Item = (ContextKey, String)>,
        E: From<S::Error>,
        F: FnOnce(&mut S) -> Result<T, E>,
    {
        let mut guard = self.scope(session, entries)?;
        let result = work(&mut *guard);
        let restored = guard.close();
        let value = result?;
        restored?;
        Ok(value)
    }

    fn write<S: Session>(
        &self,
        session: &mut S,
        key: &ContextKey,
        value: &str,
        is_local: bool,
    ) -> Result<(), S::Error> {
        trace!(key = %key, is_local, "Setting context");
        let params = [
            SqlValue::Text(self.setting_name(key)),
            SqlValue::Text(value.to_string()),
            SqlValue::Bool(is_local),
        ];
        session.query(SET_CONFIG_SQL, &params)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgrls_common::memory::{MemorySession, MemorySessionError};

    fn tenant(value: &str) -> (ContextKey, String) {
        (ContextKey::tenant_id(), value.to_string())
    }

    #[test]
    fn test_set_uses_bound_session_scope() {
        let store = ContextStore::default();
        let mut session = MemorySession::new();
        let hostile = "1'; DROP TABLE users; --";
        store.set(&mut session, &ContextKey::user_id(), hostile).unwrap();

        let calls = session.set_config_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].sql, SET_CONFIG_SQL);
        assert!(!calls[0].sql.contains(hostile));
        assert_eq!(
            calls[0].params,
            vec![
                SqlValue::Text("rls.user_id".into()),
                SqlValue::Text(hostile.into()),
                SqlValue::Bool(false),
            ]
        );
        assert_eq!(
            store.get(&mut session, &ContextKey::user_id()).unwrap().as_deref(),
            Some(hostile)
        );
    }

    #[test]
    fn test_set_local_vanishes_under_autocommit() {
        let store = ContextStore::default();
        let mut session = MemorySession::new();
        store.set_local(&mut session, &ContextKey::user_id(), "5").unwrap();
        assert_eq!(session.set_config_calls()[0].params[2], SqlValue::Bool(true));
        assert_eq!(store.get(&mut session, &ContextKey::user_id()).unwrap(), None);
    }

    #[test]
    fn test_get_and_clear() {
        let store = ContextStore::default();
        let mut session = MemorySession::new();
        let key = ContextKey::tenant_id();
        assert_eq!(store.get(&mut session, &key).unwrap(), None);

        store.set(&mut session, &key, "7").unwrap();
        assert_eq!(store.get(&mut session, &key).unwrap().as_deref(), Some("7"));

        store.clear(&mut session, &key).unwrap();
        assert_eq!(store.get(&mut session, &key).unwrap(), None);
        assert_eq!(session.setting("rls.tenant_id").as_deref(), Some(""));
    }

    #[test]
    fn test_custom_namespace() {
        let store = ContextStore::new("app").unwrap();
        assert_eq!(store.setting_name(&ContextKey::user_id()), "app.user_id");
        assert!(ContextStore::new("app.ctx").is_err());
    }

    #[test]
    fn test_nested_scopes_restore() {
        let store = ContextStore::default();
        let mut session = MemorySession::new();
        let key = ContextKey::tenant_id();

        {
            let mut outer = store.scope(&mut session, [tenant("1")]).unwrap();
            assert_eq!(store.get(&mut *outer, &key).unwrap().as_deref(), Some("1"));
            {
                let mut inner = store.scope(&mut *outer, [tenant("2")]).unwrap();
                assert_eq!(store.get(&mut *inner, &key).unwrap().as_deref(), Some("2"));
            }
            assert_eq!(store.get(&mut *outer, &key).unwrap().as_deref(), Some("1"));
        }
        assert_eq!(store.get(&mut session, &key).unwrap(), None);
    }

    #[test]
    fn test_with_context_restores_after_error() {
        let store = ContextStore::default();
        let mut session = MemorySession::new();

        let result: Result<(), MemorySessionError> =
            store.with_context(&mut session, [tenant("3")], |s| {
                assert_eq!(s.setting("rls.tenant_id").as_deref(), Some("3"));
                Err(MemorySessionError::Injected("boom".into()))
            });

        assert!(result.is_err());
        assert_eq!(store.get(&mut session, &ContextKey::tenant_id()).unwrap(), None);
    }

    #[test]
    fn test_with_context_returns_value() {
        let store = ContextStore::default();
        let mut session = MemorySession::new();
        let value: Result<String, MemorySessionError> =
            store.with_context(&mut session, [tenant("4")], |s| {
                Ok(ContextStore::default()
                    .get(s, &ContextKey::tenant_id())?
                    .unwrap_or_default())
            });
        assert_eq!(value.unwrap(), "4");
    }

    #[test]
    fn test_scope_failure_leaves_context_untouched() {
        let store = ContextStore::default();
        let mut session = MemorySession::new();
        store.set(&mut session, &ContextKey::tenant_id(), "1").unwrap();
        session.fail_on("current_setting");

        let result = store.scope(
            &mut session,
            [tenant("2"), (ContextKey::user_id(), "9".to_string())],
        );
        assert!(matches!(result, Err(MemorySessionError::Injected(_))));
        drop(result);

        assert_eq!(session.setting("rls.tenant_id").as_deref(), Some("1"));
        assert_eq!(session.setting("rls.user_id"), None);
    }
}
