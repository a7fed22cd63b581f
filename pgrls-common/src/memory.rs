//! In-memory session
//!
//! Emulates the parts of a PostgreSQL session pgrls relies on:
//! `set_config` / `current_setting` with session and transaction-local
//! scope (including autocommit, where a local setting dies with its own
//! statement), `BEGIN` / `COMMIT` / `ROLLBACK`, canned query results and
//! fault injection. Every statement is recorded with its bound parameters.

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tracing::trace;

use crate::session::Session;
use crate::types::{Row, SqlValue};

/// Errors raised by [`MemorySession`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemorySessionError {
    #[error("injected failure for statement: {0}")]
    Injected(String),

    #[error("malformed parameters for {0}")]
    BadParams(&'static str),

    #[error("no transaction in progress")]
    NoTransaction,

    #[error("transaction already in progress")]
    TransactionInProgress,
}

/// A statement as it reached the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

#[derive(Debug, Default)]
struct Transaction {
    session_writes: HashMap<String, String>,
    local: HashMap<String, String>,
}

/// In-process stand-in for one database session
#[derive(Debug, Default)]
pub struct MemorySession {
    settings: HashMap<String, String>,
    defined: HashSet<String>,
    transaction: Option<Transaction>,
    statements: Vec<Statement>,
    stubs: Vec<(String, Vec<Row>)>,
    failures: Vec<String>,
}

impl MemorySession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `rows` for any query whose text starts with `sql_prefix`
    pub fn stub_query(&mut self, sql_prefix: impl Into<String>, rows: Vec<Row>) {
        self.stubs.push((sql_prefix.into(), rows));
    }

    /// Fail every statement containing `fragment`
    pub fn fail_on(&mut self, fragment: impl Into<String>) {
        self.failures.push(fragment.into());
    }

    /// Everything executed or queried so far
    #[must_use]
    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// SQL text of statements other than context reads and writes
    #[must_use]
    pub fn ddl(&self) -> Vec<&str> {
        self.statements
            .iter()
            .map(|s| s.sql.as_str())
            .filter(|sql| !is_set_config(sql) && !is_current_setting(sql))
            .collect()
    }

    /// Statements that called `set_config`
    #[must_use]
    pub fn set_config_calls(&self) -> Vec<&Statement> {
        self.statements
            .iter()
            .filter(|s| is_set_config(&s.sql))
            .collect()
    }

    pub fn clear_log(&mut self) {
        self.statements.clear();
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Current value of a setting as `current_setting(key, true)` sees it
    #[must_use]
    pub fn setting(&self, key: &str) -> Option<String> {
        if let Some(txn) = &self.transaction {
            if let Some(v) = txn.local.get(key).or_else(|| txn.session_writes.get(key)) {
                return Some(v.clone());
            }
        }
        match self.settings.get(key) {
            Some(v) => Some(v.clone()),
            // A placeholder once defined reads back as empty, not NULL
            None if self.defined.contains(key) => Some(String::new()),
            None => None,
        }
    }

    fn record(&mut self, sql: &str, params: &[SqlValue]) -> Result<(), MemorySessionError> {
        self.statements.push(Statement {
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        if self.failures.iter().any(|f| sql.contains(f.as_str())) {
            return Err(MemorySessionError::Injected(sql.to_string()));
        }
        Ok(())
    }

    fn set_config(&mut self, params: &[SqlValue]) -> Result<(), MemorySessionError> {
        let (key, value, is_local) = match params {
            [SqlValue::Text(k), SqlValue::Text(v), SqlValue::Bool(l)] => (k, v, *l),
            _ => return Err(MemorySessionError::BadParams("set_config")),
        };
        self.defined.insert(key.clone());
        trace!(key = %key, is_local, "set_config");

        match (&mut self.transaction, is_local) {
            (Some(txn), true) => {
                txn.local.insert(key.clone(), value.clone());
            }
            (Some(txn), false) => {
                txn.local.remove(key);
                txn.session_writes.insert(key.clone(), value.clone());
            }
            // Autocommit: the statement is its own transaction and the
            // local value is gone before the next statement runs.
            (None, true) => {}
            (None, false) => {
                self.settings.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    fn control(&mut self, sql: &str) -> Result<bool, MemorySessionError> {
        let keyword = sql.trim().trim_end_matches(';').to_ascii_uppercase();
        match keyword.as_str() {
            "BEGIN" | "START TRANSACTION" => {
                if self.transaction.is_some() {
                    return Err(MemorySessionError::TransactionInProgress);
                }
                self.transaction = Some(Transaction::default());
            }
            "COMMIT" => {
                let txn = self
                    .transaction
                    .take()
                    .ok_or(MemorySessionError::NoTransaction)?;
                self.settings.extend(txn.session_writes);
            }
            "ROLLBACK" => {
                self.transaction
                    .take()
                    .ok_or(MemorySessionError::NoTransaction)?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

fn is_set_config(sql: &str) -> bool {
    sql.contains("set_config(")
}

fn is_current_setting(sql: &str) -> bool {
    sql.trim_start().starts_with("SELECT current_setting(")
}

impl Session for MemorySession {
    type Error = MemorySessionError;

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, Self::Error> {
        self.record(sql, params)?;
        if is_set_config(sql) {
            self.set_config(params)?;
            return Ok(1);
        }
        self.control(sql)?;
        Ok(0)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, Self::Error> {
        self.record(sql, params)?;
        if is_set_config(sql) {
            self.set_config(params)?;
            return Ok(vec![vec![params.get(1).cloned().unwrap_or(SqlValue::Null)]]);
        }
        if is_current_setting(sql) {
            let key = params
                .first()
                .and_then(SqlValue::as_str)
                .ok_or(MemorySessionError::BadParams("current_setting"))?;
            return Ok(vec![vec![self.setting(key).into()]]);
        }
        let trimmed = sql.trim_start();
        Ok(self
            .stubs
            .iter()
            .find(|(prefix, _)| trimmed.starts_with(prefix.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SET: &str = "SELECT set_config($1, $2, $3)";
    const GET: &str = "SELECT current_setting($1, true)";

    fn set(session: &mut MemorySession, key: &str, value: &str, local: bool) {
        session
            .execute(SET, &[key.into(), value.into(), local.into()])
            .unwrap();
    }

    fn get(session: &mut MemorySession, key: &str) -> SqlValue {
        session.query_scalar(GET, &[key.into()]).unwrap()
    }

    #[test]
    fn test_unset_key_reads_null() {
        let mut session = MemorySession::new();
        assert_eq!(get(&mut session, "rls.user_id"), SqlValue::Null);
    }

    #[test]
    fn test_session_scope_survives_autocommit() {
        let mut session = MemorySession::new();
        set(&mut session, "rls.user_id", "42", false);
        assert_eq!(get(&mut session, "rls.user_id"), SqlValue::Text("42".into()));
    }

    #[test]
    fn test_local_scope_vanishes_under_autocommit() {
        let mut session = MemorySession::new();
        set(&mut session, "rls.user_id", "42", true);
        assert_eq!(get(&mut session, "rls.user_id"), SqlValue::Text(String::new()));
    }

    #[test]
    fn test_local_scope_inside_transaction() {
        let mut session = MemorySession::new();
        session.execute("BEGIN", &[]).unwrap();
        set(&mut session, "rls.tenant_id", "7", true);
        assert_eq!(get(&mut session, "rls.tenant_id"), SqlValue::Text("7".into()));
        session.execute("COMMIT", &[]).unwrap();
        assert_eq!(get(&mut session, "rls.tenant_id"), SqlValue::Text(String::new()));
    }

    #[test]
    fn test_rollback_discards_session_writes() {
        let mut session = MemorySession::new();
        set(&mut session, "rls.tenant_id", "1", false);
        session.execute("BEGIN", &[]).unwrap();
        set(&mut session, "rls.tenant_id", "2", false);
        session.execute("ROLLBACK", &[]).unwrap();
        assert_eq!(get(&mut session, "rls.tenant_id"), SqlValue::Text("1".into()));
    }

    #[test]
    fn test_commit_without_begin() {
        let mut session = MemorySession::new();
        assert_eq!(
            session.execute("COMMIT", &[]),
            Err(MemorySessionError::NoTransaction)
        );
    }

    #[test]
    fn test_stub_and_failure_injection() {
        let mut session = MemorySession::new();
        session.stub_query("SELECT polname", vec![vec!["p".into()]]);
        assert_eq!(
            session.query("SELECT polname FROM pg_policy", &[]).unwrap(),
            vec![vec![SqlValue::Text("p".into())]]
        );

        session.fail_on("DROP POLICY");
        assert!(matches!(
            session.execute("DROP POLICY IF EXISTS \"p\" ON \"t\"", &[]),
            Err(MemorySessionError::Injected(_))
        ));
        assert_eq!(session.ddl().len(), 2);
    }
}
