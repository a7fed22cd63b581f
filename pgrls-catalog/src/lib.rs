//! Row level security catalog management for pgrls
//!
//! Emits `ALTER TABLE ... ROW LEVEL SECURITY` and policy DDL, reads
//! `pg_policy` back and reconciles the two.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod ddl;
pub mod manager;

pub use ddl::{normalize_expr, TableAction};
pub use manager::{
    CatalogEntry, CatalogManager, ReconcileReport, TableStatus, POLICIES_SQL, TABLE_STATUS_SQL,
};
