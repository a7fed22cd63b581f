//! Policy catalog manager
//!
//! Issues row level security DDL through a [`Session`] and reconciles
//! compiled policies with what `pg_policy` holds for a table. Permissive and
//! restrictive composition is left to the engine: the manager only emits
//! correctly tagged policies.

use std::collections::{BTreeMap, BTreeSet};

use pgrls_common::{Ident, RlsConfig, Row, Session, SqlValue};
use pgrls_policy::{Command, CompiledPolicy};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ddl::{self, normalize_expr, TableAction};

/// Policies attached to a table, by relation name
pub const POLICIES_SQL: &str = "SELECT p.polname, p.polcmd::text, p.polpermissive, \
pg_get_expr(p.polqual, p.polrelid), pg_get_expr(p.polwithcheck, p.polrelid), \
array_to_string(ARRAY(SELECT CASE WHEN r = 0 THEN 'public' ELSE pg_get_userbyid(r)::text END \
FROM unnest(p.polroles) AS r ORDER BY 1), ',') \
FROM pg_policy p JOIN pg_class c ON c.oid = p.polrelid \
WHERE c.relname = $1 ORDER BY p.polname";

/// Row level security flags of a table, by relation name
pub const TABLE_STATUS_SQL: &str =
    "SELECT c.relrowsecurity, c.relforcerowsecurity FROM pg_class c WHERE c.relname = $1";

/// A policy as the catalog reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub name: String,
    pub command: Command,
    pub permissive: bool,
    pub using: Option<String>,
    pub check: Option<String>,
    pub roles: Vec<String>,
}

impl CatalogEntry {
    fn from_row(row: Row) -> Option<Self> {
        let mut columns = row.into_iter();
        let name = columns.next()?.into_text()?;
        let command = columns
            .next()?
            .into_text()?
            .chars()
            .next()
            .and_then(Command::from_catalog_char)?;
        let permissive = columns.next()?.as_bool()?;
        let using = columns.next().and_then(SqlValue::into_text);
        let check = columns.next().and_then(SqlValue::into_text);
        let roles = columns
            .next()
            .and_then(SqlValue::into_text)
            .map(|roles| {
                roles
                    .split(',')
                    .filter(|r| !r.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            name,
            command,
            permissive,
            using,
            check,
            roles,
        })
    }
}

/// Row level security flags of a table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableStatus {
    pub enabled: bool,
    pub forced: bool,
}

/// What a reconciliation changed on one table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub table: String,
    pub created: Vec<String>,
    pub altered: Vec<String>,
    /// Dropped and created again because command or permissiveness changed
    pub recreated: Vec<String>,
    pub dropped: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ReconcileReport {
    fn new(table: &Ident) -> Self {
        Self {
            table: table.to_string(),
            ..Self::default()
        }
    }

    /// Number of policies touched
    #[must_use]
    pub fn changes(&self) -> usize {
        self.created.len() + self.altered.len() + self.recreated.len() + self.dropped.len()
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.changes() == 0
    }
}

enum Drift {
    None,
    Expressions,
    Roles,
    Shape,
}

fn drift(live: &CatalogEntry, declared: &CompiledPolicy) -> Drift {
    if live.command != declared.command || live.permissive != declared.permissive {
        return Drift::Shape;
    }

    let mut declared_roles: Vec<&str> = declared.roles.iter().map(Ident::as_str).collect();
    declared_roles.sort_unstable();
    let mut live_roles: Vec<&str> = live.roles.iter().map(String::as_str).collect();
    live_roles.sort_unstable();
    if declared_roles != live_roles {
        return Drift::Roles;
    }

    let same = |live: &Option<String>, declared: &Option<String>| {
        live.as_deref().map(normalize_expr) == declared.as_deref().map(normalize_expr)
    };
    if same(&live.using, &declared.using) && same(&live.check, &declared.check) {
        Drift::None
    } else {
        Drift::Expressions
    }
}

/// Issues row level security DDL and reconciles declared policies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogManager {
    force_rls: bool,
    debug: bool,
}

impl Default for CatalogManager {
    fn default() -> Self {
        Self::new(&RlsConfig::default())
    }
}

impl CatalogManager {
    #[must_use]
    pub fn new(config: &RlsConfig) -> Self {
        Self {
            force_rls: config.force_rls,
            debug: config.debug,
        }
    }

    fn issue<S: Session>(&self, session: &mut S, sql: &str) -> Result<(), S::Error> {
        if self.debug {
            debug!(sql = %sql, "Issuing DDL");
        }
        session.execute(sql, &[])?;
        Ok(())
    }

    /// # Errors
    /// Whatever the session reports.
    pub fn enable<S: Session>(&self, session: &mut S, table: &Ident) -> Result<(), S::Error> {
        self.issue(session, &ddl::alter_table(table, TableAction::Enable))
    }

    /// Remove the table owner's exemption
    ///
    /// # Errors
    /// Whatever the session reports.
    pub fn force<S: Session>(&self, session: &mut S, table: &Ident) -> Result<(), S::Error> {
        self.issue(session, &ddl::alter_table(table, TableAction::Force))
    }

    /// # Errors
    /// Whatever the session reports.
    pub fn unforce<S: Session>(&self, session: &mut S, table: &Ident) -> Result<(), S::Error> {
        self.issue(session, &ddl::alter_table(table, TableAction::NoForce))
    }

    /// # Errors
    /// Whatever the session reports.
    pub fn disable<S: Session>(&self, session: &mut S, table: &Ident) -> Result<(), S::Error> {
        self.issue(session, &ddl::alter_table(table, TableAction::Disable))
    }

    /// # Errors
    /// Whatever the session reports, e.g. a policy that already exists.
    pub fn create_policy<S: Session>(&self, session: &mut S, policy: &CompiledPolicy) -> Result<(), S::Error> {
        self.issue(session, &ddl::create_policy(policy))
    }

    /// Replace the expressions of an existing policy
    ///
    /// # Errors
    /// Whatever the session reports.
    pub fn alter_policy<S: Session>(&self, session: &mut S, policy: &CompiledPolicy) -> Result<(), S::Error> {
        self.issue(session, &ddl::alter_policy(policy, false))
    }

    /// # Errors
    /// Whatever the session reports.
    pub fn drop_policy<S: Session>(&self, session: &mut S, table: &Ident, name: &Ident) -> Result<(), S::Error> {
        self.issue(session, &ddl::drop_policy(table, name))
    }

    /// Policies the catalog holds for `table`
    ///
    /// # Errors
    /// Whatever the session reports.
    pub fn policies<S: Session>(&self, session: &mut S, table: &Ident) -> Result<Vec<CatalogEntry>, S::Error> {
        let rows = session.query(POLICIES_SQL, &[table.as_str().into()])?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let entry = CatalogEntry::from_row(row);
                if entry.is_none() {
                    warn!(table = %table, "Skipping unreadable pg_policy row");
                }
                entry
            })
            .collect())
    }

    /// Row level security flags of `table`, `None` when no such relation
    ///
    /// # Errors
    /// Whatever the session reports.
    pub fn status<S: Session>(&self, session: &mut S, table: &Ident) -> Result<Option<TableStatus>, S::Error> {
        let rows = session.query(TABLE_STATUS_SQL, &[table.as_str().into()])?;
        Ok(rows.into_iter().next().map(|row| {
            let flag = |i: usize| row.get(i).and_then(SqlValue::as_bool).unwrap_or(false);
            TableStatus {
                enabled: flag(0),
                forced: flag(1),
            }
        }))
    }

    /// Bring one table's catalog in line with `declared`
    ///
    /// Policies in `declared` for other tables are ignored. Runs without its
    /// own transaction; see [`CatalogManager::reconcile`].
    ///
    /// # Errors
    /// Whatever the session reports. Statements already issued stay issued.
    pub fn reconcile_table<S: Session>(
        &self,
        session: &mut S,
        table: &Ident,
        declared: &[CompiledPolicy],
    ) -> Result<ReconcileReport, S::Error> {
        self.enable(session, table)?;
        if self.force_rls {
            self.force(session, table)?;
        }

        let mut live: BTreeMap<String, CatalogEntry> = self
            .policies(session, table)?
            .into_iter()
            .map(|entry| (entry.name.clone(), entry))
            .collect();
        let mut report = ReconcileReport::new(table);

        for policy in declared.iter().filter(|p| &p.table == table) {
            let name = policy.name.to_string();
            match live.remove(&name) {
                None => {
                    self.create_policy(session, policy)?;
                    report.created.push(name);
                }
                Some(entry) => match drift(&entry, policy) {
                    Drift::None => report.unchanged.push(name),
                    Drift::Expressions => {
                        self.alter_policy(session, policy)?;
                        report.altered.push(name);
                    }
                    Drift::Roles => {
                        self.issue(session, &ddl::alter_policy(policy, true))?;
                        report.altered.push(name);
                    }
                    Drift::Shape => {
                        self.drop_policy(session, table, &policy.name)?;
                        self.create_policy(session, policy)?;
                        report.recreated.push(name);
                    }
                },
            }
        }

        for name in live.into_keys() {
            // Catalog names may not pass identifier validation
            self.issue(
                session,
                &format!(
                    "DROP POLICY IF EXISTS {} ON {}",
                    pgrls_common::quote_ident(&name),
                    table.quoted()
                ),
            )?;
            report.dropped.push(name);
        }

        info!(
            table = %table,
            created = report.created.len(),
            altered = report.altered.len(),
            recreated = report.recreated.len(),
            dropped = report.dropped.len(),
            "Reconciled policies"
        );
        Ok(report)
    }

    /// Reconcile `tables` and every table `declared` touches inside one
    /// transaction
    ///
    /// A table listed in `tables` without declared policies still has its
    /// live policies dropped.
    ///
    /// # Errors
    /// Whatever the session reports; the transaction is rolled back.
    pub fn reconcile<S: Session>(
        &self,
        session: &mut S,
        tables: &[Ident],
        declared: &[CompiledPolicy],
    ) -> Result<Vec<ReconcileReport>, S::Error> {
        let tables: BTreeSet<&Ident> = tables
            .iter()
            .chain(declared.iter().map(|p| &p.table))
            .collect();

        session.execute("BEGIN", &[])?;
        let mut reports = Vec::with_capacity(tables.len());
        for table in tables {
            match self.reconcile_table(session, table, declared) {
                Ok(report) => reports.push(report),
                Err(err) => {
                    if let Err(rollback) = session.execute("ROLLBACK", &[]) {
                        warn!(error = %rollback, "Rollback after failed reconciliation failed");
                    }
                    return Err(err);
                }
            }
        }
        session.execute("COMMIT", &[])?;
        Ok(reports)
    }

    /// Drop the declared policies of `table` and switch row level security off
    ///
    /// # Errors
    /// Whatever the session reports.
    pub fn teardown<S: Session>(
        &self,
        session: &mut S,
        table: &Ident,
        declared: &[CompiledPolicy],
    ) -> Result<(), S::Error> {
        for policy in declared.iter().filter(|p| &p.table == table) {
            self.drop_policy(session, table, &policy.name)?;
        }
        if self.force_rls {
            self.unforce(session, table)?;
        }
        self.disable(session, table)?;
        info!(table = %table, "Row level security removed");
        Ok(())
    }
}
