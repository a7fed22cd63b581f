//! Offline policy evaluator
//!
//! Evaluates an entity's declared policies against JSON rows and a snapshot
//! of context variables, the way PostgreSQL would: SQL three-valued logic,
//! permissive policies OR'd together, restrictive policies AND'd on top,
//! and no applicable permissive policy meaning no access.
//!
//! Target roles are not modelled; every policy is treated as applying to
//! the current role. Raw expressions are parsed with sqlparser and only a
//! small subset is understood. Anything else is an error, never "allow".

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use pgrls_common::{Ident, RlsConfig};
use serde_json::Value;
use sqlparser::ast::{BinaryOperator, Expr, UnaryOperator, Value as SqlLiteral};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;
use thiserror::Error;
use uuid::Uuid;

use crate::policy::{Command, Policy};
use crate::predicate::{CastType, ContextRef, Literal, Lookup, Operand, Predicate};
use crate::registry::{EntityDefinition, PolicyRegistry};

/// Context variables by key (without namespace), as strings
pub type ContextSnapshot = BTreeMap<String, String>;

/// Errors raised while evaluating policies offline
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("Entity not registered: {0}")]
    UnknownEntity(String),

    #[error("Row of '{table}' has no column '{column}'")]
    UnknownColumn { table: String, column: String },

    #[error("Relation '{relation}' is not declared on table '{table}'")]
    UnknownRelation { table: String, relation: String },

    #[error("Context '{key}' cannot be cast to {cast}")]
    InvalidContext { key: String, cast: CastType },

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Unsupported expression: {0}")]
    Unsupported(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

type EvalResult<T> = std::result::Result<T, EvalError>;

/// Rows of related tables, used to resolve relation paths
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    tables: HashMap<String, Vec<Value>>,
}

impl Dataset {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_table(mut self, table: &str, rows: Vec<Value>) -> Self {
        self.tables.insert(table.to_string(), rows);
        self
    }

    #[must_use]
    pub fn rows(&self, table: &str) -> &[Value] {
        self.tables.get(table).map_or(&[], Vec::as_slice)
    }
}

#[derive(Debug, Clone, Copy)]
enum Clause {
    Using,
    Check,
}

#[derive(Debug, Clone, PartialEq)]
enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Uuid(Uuid),
    Text(String),
}

impl Scalar {
    fn from_json(value: &Value) -> EvalResult<Self> {
        match value {
            Value::Null => Ok(Self::Null),
            Value::Bool(b) => Ok(Self::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Self::Int(i)),
                None => Ok(Self::Float(n.as_f64().unwrap_or(f64::NAN))),
            },
            Value::String(s) => Ok(Self::Text(s.clone())),
            other => Err(EvalError::Unsupported(format!("composite value {other}"))),
        }
    }

    fn from_literal(literal: &Literal) -> Self {
        match literal {
            Literal::Null => Self::Null,
            Literal::Bool(b) => Self::Bool(*b),
            Literal::Int(i) => Self::Int(*i),
            Literal::Float(f) => Self::Float(*f),
            Literal::Uuid(u) => Self::Uuid(*u),
            Literal::Text(s) => Self::Text(s.clone()),
        }
    }

    fn truth(&self) -> EvalResult<Option<bool>> {
        match self {
            Self::Null => Ok(None),
            Self::Bool(b) => Ok(Some(*b)),
            other => Err(EvalError::TypeMismatch(format!(
                "{other:?} used as a condition"
            ))),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "on" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "off" | "0" => Some(false),
        _ => None,
    }
}

#[allow(clippy::cast_precision_loss)]
fn compare(left: &Scalar, right: &Scalar) -> EvalResult<Option<Ordering>> {
    let mismatch = || EvalError::TypeMismatch(format!("cannot compare {left:?} with {right:?}"));
    let ordering = match (left, right) {
        (Scalar::Null, _) | (_, Scalar::Null) => return Ok(None),
        (Scalar::Bool(a), Scalar::Bool(b)) => a.cmp(b),
        (Scalar::Int(a), Scalar::Int(b)) => a.cmp(b),
        (Scalar::Text(a), Scalar::Text(b)) => a.cmp(b),
        (Scalar::Uuid(a), Scalar::Uuid(b)) => a.cmp(b),
        (Scalar::Int(a), Scalar::Float(b)) => return Ok((*a as f64).partial_cmp(b)),
        (Scalar::Float(a), Scalar::Int(b)) => return Ok(a.partial_cmp(&(*b as f64))),
        (Scalar::Float(a), Scalar::Float(b)) => return Ok(a.partial_cmp(b)),
        // Untyped text coerces to the other side, like an unknown literal
        (Scalar::Text(t), other) => {
            return compare(&coerce(t, other).ok_or_else(mismatch)?, other);
        }
        (other, Scalar::Text(t)) => {
            return compare(other, &coerce(t, other).ok_or_else(mismatch)?);
        }
        _ => return Err(mismatch()),
    };
    Ok(Some(ordering))
}

fn coerce(text: &str, like: &Scalar) -> Option<Scalar> {
    match like {
        Scalar::Int(_) => text.trim().parse().ok().map(Scalar::Int),
        Scalar::Float(_) => text.trim().parse().ok().map(Scalar::Float),
        Scalar::Bool(_) => parse_bool(text).map(Scalar::Bool),
        Scalar::Uuid(_) => Uuid::parse_str(text.trim()).ok().map(Scalar::Uuid),
        Scalar::Null | Scalar::Text(_) => None,
    }
}

fn and3(values: impl IntoIterator<Item = Option<bool>>) -> Option<bool> {
    let mut result = Some(true);
    for value in values {
        match value {
            Some(false) => return Some(false),
            None => result = None,
            Some(true) => {}
        }
    }
    result
}

fn or3(values: impl IntoIterator<Item = Option<bool>>) -> Option<bool> {
    let mut result = Some(false);
    for value in values {
        match value {
            Some(true) => return Some(true),
            None => result = None,
            Some(false) => {}
        }
    }
    result
}

/// Evaluates declared policies without a database
pub struct PolicyEvaluator {
    registry: Arc<PolicyRegistry>,
    default_permissive: bool,
}

impl PolicyEvaluator {
    /// Create a new policy evaluator
    #[must_use]
    pub fn new(registry: Arc<PolicyRegistry>, config: &RlsConfig) -> Self {
        Self {
            registry,
            default_permissive: config.default_permissive,
        }
    }

    /// Whether `row` passes the USING side for `command`
    ///
    /// # Errors
    /// Unknown entities or columns, uncastable context values, type
    /// mismatches and unsupported raw expressions.
    pub fn can_read(
        &self,
        entity: &str,
        command: Command,
        row: &Value,
        context: &ContextSnapshot,
        data: &Dataset,
    ) -> EvalResult<bool> {
        let entity = self.entity(entity)?;
        self.decide(&entity, command, Clause::Using, row, context, data)
    }

    /// Whether `row` passes the WITH CHECK side for `command`
    ///
    /// # Errors
    /// See [`PolicyEvaluator::can_read`].
    pub fn can_write(
        &self,
        entity: &str,
        command: Command,
        row: &Value,
        context: &ContextSnapshot,
        data: &Dataset,
    ) -> EvalResult<bool> {
        let entity = self.entity(entity)?;
        self.decide(&entity, command, Clause::Check, row, context, data)
    }

    /// Rows a SELECT would return
    ///
    /// # Errors
    /// See [`PolicyEvaluator::can_read`].
    pub fn visible_rows<'a>(
        &self,
        entity: &str,
        rows: &'a [Value],
        context: &ContextSnapshot,
        data: &Dataset,
    ) -> EvalResult<Vec<&'a Value>> {
        let definition = self.entity(entity)?;
        let mut visible = Vec::new();
        for row in rows {
            if self.decide(&definition, Command::Select, Clause::Using, row, context, data)? {
                visible.push(row);
            }
        }
        Ok(visible)
    }

    /// Evaluate one predicate against a row of `entity`'s table
    ///
    /// `None` is SQL NULL.
    ///
    /// # Errors
    /// See [`PolicyEvaluator::can_read`].
    pub fn evaluate(
        &self,
        entity: &EntityDefinition,
        predicate: &Predicate,
        row: &Value,
        context: &ContextSnapshot,
        data: &Dataset,
    ) -> EvalResult<Option<bool>> {
        self.eval(Some(entity), entity.table(), predicate, row, context, data)
    }

    fn entity(&self, name: &str) -> EvalResult<Arc<EntityDefinition>> {
        self.registry
            .get(name)
            .ok_or_else(|| EvalError::UnknownEntity(name.to_string()))
    }

    fn decide(
        &self,
        entity: &EntityDefinition,
        command: Command,
        clause: Clause,
        row: &Value,
        context: &ContextSnapshot,
        data: &Dataset,
    ) -> EvalResult<bool> {
        let mut permissive = Vec::new();
        let mut restrictive = Vec::new();

        for policy in entity.policies() {
            if !policy.command().applies_to(command) {
                continue;
            }
            let Some(predicate) = clause_of(policy, clause) else {
                continue;
            };
            let passed = self.evaluate(entity, predicate, row, context, data)? == Some(true);
            if policy.is_permissive().unwrap_or(self.default_permissive) {
                permissive.push(passed);
            } else {
                restrictive.push(passed);
            }
        }

        Ok(permissive.iter().any(|p| *p) && restrictive.iter().all(|r| *r))
    }

    fn eval(
        &self,
        scope: Option<&EntityDefinition>,
        table: &Ident,
        predicate: &Predicate,
        row: &Value,
        context: &ContextSnapshot,
        data: &Dataset,
    ) -> EvalResult<Option<bool>> {
        match predicate {
            Predicate::FieldEquals { field, value } => {
                if let Some((hop, rest)) = field.split_first() {
                    let remainder = Predicate::FieldEquals {
                        field: rest,
                        value: value.clone(),
                    };
                    return self.related(scope, table, hop, &remainder, row, context, data);
                }
                let left = column(row, table, field.column())?;
                if let Operand::Value(Literal::Null) = value {
                    return Ok(Some(left == Scalar::Null));
                }
                let right = operand(value, table, row, context)?;
                Ok(compare(&left, &right)?.map(Ordering::is_eq))
            }
            Predicate::Compare {
                left,
                lookup,
                right,
            } => {
                if let Operand::Field(path) = left {
                    if let Some((hop, rest)) = path.split_first() {
                        let remainder = Predicate::Compare {
                            left: Operand::Field(rest),
                            lookup: *lookup,
                            right: right.clone(),
                        };
                        return self.related(scope, table, hop, &remainder, row, context, data);
                    }
                }
                lookup_eval(*lookup, left, right, table, row, context)
            }
            Predicate::Raw(sql) => raw_eval(sql, table, row),
            Predicate::Context(reference) => context_scalar(reference, context)?.truth(),
            Predicate::And(children) => {
                let mut values = Vec::with_capacity(children.len());
                for child in children {
                    values.push(self.eval(scope, table, child, row, context, data)?);
                }
                Ok(and3(values))
            }
            Predicate::Or(children) => {
                let mut values = Vec::with_capacity(children.len());
                for child in children {
                    values.push(self.eval(scope, table, child, row, context, data)?);
                }
                Ok(or3(values))
            }
            Predicate::Not(inner) => {
                Ok(self.eval(scope, table, inner, row, context, data)?.map(|b| !b))
            }
        }
    }

    /// `fk IN (SELECT pk FROM target WHERE remainder)`
    #[allow(clippy::too_many_arguments)]
    fn related(
        &self,
        scope: Option<&EntityDefinition>,
        table: &Ident,
        hop: &Ident,
        remainder: &Predicate,
        row: &Value,
        context: &ContextSnapshot,
        data: &Dataset,
    ) -> EvalResult<Option<bool>> {
        let relation = scope
            .and_then(|entity| entity.get_relation(hop))
            .ok_or_else(|| EvalError::UnknownRelation {
                table: table.to_string(),
                relation: hop.to_string(),
            })?;
        let fk = column(row, table, &relation.fk_column)?;
        let target = self.registry.by_table(&relation.target_table);

        let mut matches = Vec::new();
        for candidate in data.rows(relation.target_table.as_str()) {
            let selected = self.eval(
                target.as_deref(),
                &relation.target_table,
                remainder,
                candidate,
                context,
                data,
            )?;
            if selected == Some(true) {
                let pk = column(candidate, &relation.target_table, &relation.target_pk)?;
                matches.push(compare(&fk, &pk)?.map(Ordering::is_eq));
            }
        }
        Ok(or3(matches))
    }
}

fn clause_of(policy: &Policy, clause: Clause) -> Option<&Predicate> {
    match clause {
        Clause::Using if policy.command().has_using() => Some(policy.using()),
        Clause::Using => None,
        Clause::Check => policy.effective_check(),
    }
}

fn column(row: &Value, table: &Ident, name: &Ident) -> EvalResult<Scalar> {
    let value = row
        .get(name.as_str())
        .ok_or_else(|| EvalError::UnknownColumn {
            table: table.to_string(),
            column: name.to_string(),
        })?;
    Scalar::from_json(value)
}

fn context_scalar(reference: &ContextRef, context: &ContextSnapshot) -> EvalResult<Scalar> {
    let raw = match context.get(reference.key.as_str()) {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Ok(Scalar::Null),
    };
    let invalid = || EvalError::InvalidContext {
        key: reference.key.to_string(),
        cast: reference.cast,
    };
    match reference.cast {
        CastType::Integer | CastType::BigInt => {
            raw.trim().parse().map(Scalar::Int).map_err(|_| invalid())
        }
        CastType::Numeric => raw.trim().parse().map(Scalar::Float).map_err(|_| invalid()),
        CastType::Boolean => parse_bool(raw).map(Scalar::Bool).ok_or_else(invalid),
        CastType::Uuid => Uuid::parse_str(raw.trim())
            .map(Scalar::Uuid)
            .map_err(|_| invalid()),
        CastType::Text | CastType::Timestamptz => Ok(Scalar::Text(raw.clone())),
    }
}

fn operand(
    op: &Operand,
    table: &Ident,
    row: &Value,
    context: &ContextSnapshot,
) -> EvalResult<Scalar> {
    match op {
        Operand::Field(path) if path.is_local() => column(row, table, path.column()),
        Operand::Field(path) => Err(EvalError::Unsupported(format!(
            "relation path '{path}' on the right-hand side"
        ))),
        Operand::Context(reference) => context_scalar(reference, context),
        Operand::Value(literal) => Ok(Scalar::from_literal(literal)),
    }
}

fn lookup_eval(
    lookup: Lookup,
    left: &Operand,
    right: &Operand,
    table: &Ident,
    row: &Value,
    context: &ContextSnapshot,
) -> EvalResult<Option<bool>> {
    let lhs = operand(left, table, row, context)?;

    if lookup == Lookup::IsNull {
        return match right {
            Operand::Value(Literal::Bool(expected)) => Ok(Some(lhs.eq(&Scalar::Null) == *expected)),
            _ => Err(EvalError::Unsupported(
                "isnull requires a boolean literal".to_string(),
            )),
        };
    }

    if lookup.is_pattern() {
        let Operand::Value(Literal::Text(needle)) = right else {
            return Err(EvalError::Unsupported(format!(
                "{} requires a text literal",
                lookup.name()
            )));
        };
        return match lhs {
            Scalar::Null => Ok(None),
            Scalar::Text(haystack) => Ok(Some(match lookup {
                Lookup::StartsWith => haystack.starts_with(needle.as_str()),
                Lookup::EndsWith => haystack.ends_with(needle.as_str()),
                _ => haystack.contains(needle.as_str()),
            })),
            other => Err(EvalError::TypeMismatch(format!(
                "{} on non-text value {other:?}",
                lookup.name()
            ))),
        };
    }

    if let Operand::Value(Literal::Null) = right {
        match lookup {
            Lookup::Eq => return Ok(Some(lhs == Scalar::Null)),
            Lookup::Ne => return Ok(Some(lhs != Scalar::Null)),
            _ => {}
        }
    }

    let test: fn(Ordering) -> bool = match lookup {
        Lookup::Eq => Ordering::is_eq,
        Lookup::Ne => Ordering::is_ne,
        Lookup::Lt => Ordering::is_lt,
        Lookup::Lte => Ordering::is_le,
        Lookup::Gt => Ordering::is_gt,
        Lookup::Gte => Ordering::is_ge,
        Lookup::StartsWith | Lookup::EndsWith | Lookup::Contains | Lookup::IsNull => {
            return Err(EvalError::Unsupported(format!(
                "{} is not a comparison",
                lookup.name()
            )))
        }
    };
    let rhs = operand(right, table, row, context)?;
    Ok(compare(&lhs, &rhs)?.map(test))
}

fn raw_eval(sql: &str, table: &Ident, row: &Value) -> EvalResult<Option<bool>> {
    let dialect = PostgreSqlDialect {};
    let mut parser = Parser::new(&dialect)
        .try_with_sql(sql)
        .map_err(|e| EvalError::Parse(e.to_string()))?;
    let expr = parser
        .parse_expr()
        .map_err(|e| EvalError::Parse(e.to_string()))?;
    if parser.peek_token().token != Token::EOF {
        return Err(EvalError::Parse(format!("trailing input in '{sql}'")));
    }
    sql_scalar(&expr, table, row)?.truth()
}

fn sql_ident(ident: &sqlparser::ast::Ident) -> String {
    // Unquoted identifiers fold to lower case
    if ident.quote_style.is_some() {
        ident.value.clone()
    } else {
        ident.value.to_lowercase()
    }
}

fn sql_column(name: String, table: &Ident, row: &Value) -> EvalResult<Scalar> {
    let value = row.get(&name).ok_or_else(|| EvalError::UnknownColumn {
        table: table.to_string(),
        column: name.clone(),
    })?;
    Scalar::from_json(value)
}

fn sql_scalar(expr: &Expr, table: &Ident, row: &Value) -> EvalResult<Scalar> {
    let bool_or_null = |value: Option<bool>| value.map_or(Scalar::Null, Scalar::Bool);

    match expr {
        Expr::Identifier(ident) => sql_column(sql_ident(ident), table, row),
        Expr::CompoundIdentifier(parts) => match parts.last() {
            Some(ident) => sql_column(sql_ident(ident), table, row),
            None => Err(EvalError::Unsupported(expr.to_string())),
        },
        Expr::Nested(inner) => sql_scalar(inner, table, row),
        Expr::Value(literal) => match literal {
            SqlLiteral::Null => Ok(Scalar::Null),
            SqlLiteral::Boolean(b) => Ok(Scalar::Bool(*b)),
            SqlLiteral::SingleQuotedString(s) => Ok(Scalar::Text(s.clone())),
            SqlLiteral::Number(n, _) => n
                .parse()
                .map(Scalar::Int)
                .or_else(|_| n.parse().map(Scalar::Float))
                .map_err(|_| EvalError::Parse(format!("invalid number {n}"))),
            other => Err(EvalError::Unsupported(other.to_string())),
        },
        Expr::IsNull(inner) => Ok(Scalar::Bool(sql_scalar(inner, table, row)? == Scalar::Null)),
        Expr::IsNotNull(inner) => Ok(Scalar::Bool(sql_scalar(inner, table, row)? != Scalar::Null)),
        Expr::IsTrue(inner) => Ok(Scalar::Bool(
            sql_scalar(inner, table, row)?.truth()? == Some(true),
        )),
        Expr::IsFalse(inner) => Ok(Scalar::Bool(
            sql_scalar(inner, table, row)?.truth()? == Some(false),
        )),
        Expr::UnaryOp { op, expr: inner } => {
            let value = sql_scalar(inner, table, row)?;
            match (op, value) {
                (UnaryOperator::Not, value) => Ok(bool_or_null(value.truth()?.map(|b| !b))),
                (UnaryOperator::Minus, Scalar::Int(i)) => Ok(Scalar::Int(-i)),
                (UnaryOperator::Minus, Scalar::Float(f)) => Ok(Scalar::Float(-f)),
                _ => Err(EvalError::Unsupported(expr.to_string())),
            }
        }
        Expr::BinaryOp { left, op, right } => {
            let lhs = sql_scalar(left, table, row)?;
            let rhs = sql_scalar(right, table, row)?;
            let value = match op {
                BinaryOperator::And => and3([lhs.truth()?, rhs.truth()?]),
                BinaryOperator::Or => or3([lhs.truth()?, rhs.truth()?]),
                BinaryOperator::Eq => compare(&lhs, &rhs)?.map(Ordering::is_eq),
                BinaryOperator::NotEq => compare(&lhs, &rhs)?.map(Ordering::is_ne),
                BinaryOperator::Lt => compare(&lhs, &rhs)?.map(Ordering::is_lt),
                BinaryOperator::LtEq => compare(&lhs, &rhs)?.map(Ordering::is_le),
                BinaryOperator::Gt => compare(&lhs, &rhs)?.map(Ordering::is_gt),
                BinaryOperator::GtEq => compare(&lhs, &rhs)?.map(Ordering::is_ge),
                _ => return Err(EvalError::Unsupported(expr.to_string())),
            };
            Ok(bool_or_null(value))
        }
        Expr::InList {
            expr: inner,
            list,
            negated,
        } => {
            let needle = sql_scalar(inner, table, row)?;
            let mut matches = Vec::with_capacity(list.len());
            for item in list {
                let candidate = sql_scalar(item, table, row)?;
                matches.push(compare(&needle, &candidate)?.map(Ordering::is_eq));
            }
            let found = or3(matches);
            Ok(bool_or_null(if *negated { found.map(|b| !b) } else { found }))
        }
        _ => Err(EvalError::Unsupported(expr.to_string())),
    }
}
