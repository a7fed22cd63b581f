//! Scoped context acquisition

use std::ops::{Deref, DerefMut};

use pgrls_common::Session;
use tracing::error;

use crate::store::{ContextKey, ContextStore};

/// Holds a session with context applied and restores the prior values
/// when dropped
///
/// The session is reachable through `Deref`, so work inside the scope uses
/// the guard wherever it would use the session. Restoration runs on drop,
/// including during unwinding. Use [`ContextGuard::close`] to observe a
/// restore failure instead of having it logged.
pub struct ContextGuard<'s, S: Session> {
    session: &'s mut S,
    store: ContextStore,
    saved: Vec<(ContextKey, Option<String>)>,
}

impl<'s, S: Session> ContextGuard<'s, S> {
    pub(crate) fn new(session: &'s mut S, store: ContextStore) -> Self {
        Self {
            session,
            store,
            saved: Vec::new(),
        }
    }

    pub(crate) fn remember(&mut self, key: ContextKey, prior: Option<String>) {
        self.saved.push((key, prior));
    }

    /// Keys this guard will restore, in the order they were applied
    pub fn keys(&self) -> impl Iterator<Item = &ContextKey> {
        self.saved.iter().map(|(key, _)| key)
    }

    /// Restore now and report the first failure
    ///
    /// # Errors
    /// Whatever the session reports. Entries not yet restored are retried
    /// when the guard drops.
    pub fn close(mut self) -> Result<(), S::Error> {
        while let Some((key, prior)) = self.saved.last() {
            restore(&self.store, &mut *self.session, key, prior.as_deref())?;
            self.saved.pop();
        }
        Ok(())
    }
}

fn restore<S: Session>(
    store: &ContextStore,
    session: &mut S,
    key: &ContextKey,
    prior: Option<&str>,
) -> Result<(), S::Error> {
    match prior {
        Some(value) => store.set(session, key, value),
        None => store.clear(session, key),
    }
}

impl<S: Session> Deref for ContextGuard<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        &*self.session
    }
}

impl<S: Session> DerefMut for ContextGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut *self.session
    }
}

impl<S: Session> Drop for ContextGuard<'_, S> {
    fn drop(&mut self) {
        while let Some((key, prior)) = self.saved.pop() {
            if let Err(err) = restore(&self.store, &mut *self.session, &key, prior.as_deref()) {
                // No caller left to report to
                error!(key = %key, error = %err, "Failed to restore context");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgrls_common::memory::MemorySession;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn test_restores_after_panic() {
        let store = ContextStore::default();
        let mut session = MemorySession::new();

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store
                .scope(&mut session, [(ContextKey::user_id(), "42".to_string())])
                .unwrap();
            panic!("request handler failed");
        }));

        assert!(outcome.is_err());
        assert_eq!(store.get(&mut session, &ContextKey::user_id()).unwrap(), None);
    }

    #[test]
    fn test_close_restores_prior_values() {
        let store = ContextStore::default();
        let mut session = MemorySession::new();
        store.set(&mut session, &ContextKey::tenant_id(), "1").unwrap();

        let guard = store
            .scope(
                &mut session,
                [
                    (ContextKey::tenant_id(), "2".to_string()),
                    (ContextKey::user_id(), "5".to_string()),
                ],
            )
            .unwrap();
        let keys: Vec<_> = guard.keys().map(ContextKey::as_str).collect();
        assert_eq!(keys, vec!["tenant_id", "user_id"]);
        guard.close().unwrap();

        assert_eq!(session.setting("rls.tenant_id").as_deref(), Some("1"));
        assert_eq!(session.setting("rls.user_id").as_deref(), Some(""));
    }

    #[test]
    fn test_drop_logs_and_continues_on_failure() {
        let store = ContextStore::default();
        let mut session = MemorySession::new();

        {
            let mut guard = store
                .scope(
                    &mut session,
                    [
                        (ContextKey::tenant_id(), "2".to_string()),
                        (ContextKey::user_id(), "5".to_string()),
                    ],
                )
                .unwrap();
            guard.fail_on("set_config");
        }

        // Both restores were attempted despite the first failing
        let attempts = session
            .statements()
            .iter()
            .filter(|s| s.sql.contains("set_config"))
            .count();
        assert_eq!(attempts, 4);
    }
}
