//! Database session seam
//!
//! A `Session` is one live connection used by one unit of work at a time.
//! Everything the context store and catalog manager do goes through it;
//! drivers and pools stay outside this workspace.

use crate::types::{Row, SqlValue};

/// A live database session
///
/// Placeholders are `$1..$n`. Errors are the driver's own and are returned
/// unchanged by every pgrls operation.
pub trait Session {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Execute a statement, returning the number of affected rows
    ///
    /// # Errors
    /// Whatever the underlying driver reports.
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, Self::Error>;

    /// Run a query and collect its rows
    ///
    /// # Errors
    /// Whatever the underlying driver reports.
    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, Self::Error>;

    /// First column of the first row, if any
    ///
    /// # Errors
    /// Whatever the underlying driver reports.
    fn query_scalar(&mut self, sql: &str, params: &[SqlValue]) -> Result<SqlValue, Self::Error> {
        let rows = self.query(sql, params)?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .unwrap_or(SqlValue::Null))
    }
}

impl<S: Session + ?Sized> Session for &mut S {
    type Error = S::Error;

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, Self::Error> {
        (**self).execute(sql, params)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, Self::Error> {
        (**self).query(sql, params)
    }
}
