//! Predicate model
//!
//! A closed tagged union describing which rows are visible or writable,
//! independent of SQL syntax. Identifiers are validated on construction;
//! values stay typed until the compiler renders them as escaped literals.

use std::fmt;
use std::ops::{BitAnd, BitOr, Not};
use std::str::FromStr;

use pgrls_common::{Ident, PolicyError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Context key holding the authenticated user's id
pub const USER_ID: &str = "user_id";
/// Context key holding the active tenant's id
pub const TENANT_ID: &str = "tenant_id";

/// A column, optionally reached through relation hops (`company.name`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
    relations: Vec<Ident>,
    column: Ident,
}

impl FieldPath {
    /// Parse a dotted path, validating every segment as an identifier
    ///
    /// # Errors
    /// `PolicyError::MissingField` for an empty path, otherwise the
    /// identifier error of the first bad segment.
    pub fn parse(path: &str) -> Result<Self, PolicyError> {
        if path.trim().is_empty() {
            return Err(PolicyError::MissingField("field"));
        }
        let mut segments = path
            .split('.')
            .map(Ident::new)
            .collect::<Result<Vec<_>, _>>()?;
        // split('.') always yields at least one segment
        let column = segments
            .pop()
            .ok_or(PolicyError::MissingField("field"))?;
        Ok(Self {
            relations: segments,
            column,
        })
    }

    #[must_use]
    pub fn column(&self) -> &Ident {
        &self.column
    }

    #[must_use]
    pub fn relations(&self) -> &[Ident] {
        &self.relations
    }

    /// True when the path names a column of the table itself
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.relations.is_empty()
    }

    /// First relation hop and the path remaining past it
    #[must_use]
    pub fn split_first(&self) -> Option<(&Ident, FieldPath)> {
        let (first, rest) = self.relations.split_first()?;
        Some((
            first,
            FieldPath {
                relations: rest.to_vec(),
                column: self.column.clone(),
            },
        ))
    }
}

impl From<Ident> for FieldPath {
    fn from(column: Ident) -> Self {
        Self {
            relations: vec![],
            column,
        }
    }
}

impl TryFrom<String> for FieldPath {
    type Error = PolicyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.to_string()
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for relation in &self.relations {
            write!(f, "{relation}.")?;
        }
        write!(f, "{}", self.column)
    }
}

/// Target type of a context variable cast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CastType {
    Integer,
    BigInt,
    Text,
    Uuid,
    Boolean,
    Numeric,
    Timestamptz,
}

impl CastType {
    #[must_use]
    pub fn sql_name(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::BigInt => "bigint",
            Self::Text => "text",
            Self::Uuid => "uuid",
            Self::Boolean => "boolean",
            Self::Numeric => "numeric",
            Self::Timestamptz => "timestamptz",
        }
    }
}

impl FromStr for CastType {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "integer" | "int" | "int4" => Ok(Self::Integer),
            "bigint" | "int8" => Ok(Self::BigInt),
            "text" | "varchar" => Ok(Self::Text),
            "uuid" => Ok(Self::Uuid),
            "boolean" | "bool" => Ok(Self::Boolean),
            "numeric" | "decimal" => Ok(Self::Numeric),
            "timestamptz" => Ok(Self::Timestamptz),
            _ => Err(PolicyError::InvalidCast(s.to_string())),
        }
    }
}

impl TryFrom<String> for CastType {
    type Error = PolicyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CastType> for String {
    fn from(cast: CastType) -> Self {
        cast.sql_name().to_string()
    }
}

impl fmt::Display for CastType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_name())
    }
}

/// Reference to a session context variable, read with a cast
///
/// An unset or empty variable reads as NULL, so it never matches an
/// equality and never raises a cast error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextRef {
    pub key: Ident,
    #[serde(default = "default_cast")]
    pub cast: CastType,
}

fn default_cast() -> CastType {
    CastType::Text
}

impl ContextRef {
    /// # Errors
    /// Returns the identifier error when `key` is not a safe identifier.
    pub fn new(key: &str, cast: CastType) -> Result<Self, PolicyError> {
        Ok(Self {
            key: Ident::new(key)?,
            cast,
        })
    }

    #[must_use]
    pub fn user_id() -> Self {
        Self {
            key: Ident::from_static(USER_ID),
            cast: CastType::Integer,
        }
    }

    #[must_use]
    pub fn tenant_id() -> Self {
        Self {
            key: Ident::from_static(TENANT_ID),
            cast: CastType::Integer,
        }
    }

    #[must_use]
    pub fn cast(mut self, cast: CastType) -> Self {
        self.cast = cast;
        self
    }
}

/// A typed constant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Uuid(Uuid),
    Text(String),
}

impl Literal {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// One side of a comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Field(FieldPath),
    Context(ContextRef),
    Value(Literal),
}

impl Operand {
    /// # Errors
    /// Returns the path error for an invalid field path.
    pub fn field(path: &str) -> Result<Self, PolicyError> {
        FieldPath::parse(path).map(Self::Field)
    }
}

impl From<Literal> for Operand {
    fn from(value: Literal) -> Self {
        Self::Value(value)
    }
}

impl From<ContextRef> for Operand {
    fn from(value: ContextRef) -> Self {
        Self::Context(value)
    }
}

impl From<FieldPath> for Operand {
    fn from(value: FieldPath) -> Self {
        Self::Field(value)
    }
}

impl From<&str> for Operand {
    fn from(value: &str) -> Self {
        Self::Value(Literal::Text(value.to_string()))
    }
}

impl From<String> for Operand {
    fn from(value: String) -> Self {
        Self::Value(Literal::Text(value))
    }
}

impl From<i64> for Operand {
    fn from(value: i64) -> Self {
        Self::Value(Literal::Int(value))
    }
}

impl From<bool> for Operand {
    fn from(value: bool) -> Self {
        Self::Value(Literal::Bool(value))
    }
}

impl From<Uuid> for Operand {
    fn from(value: Uuid) -> Self {
        Self::Value(Literal::Uuid(value))
    }
}

/// Comparison operator of a [`Predicate::Compare`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Lookup {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    StartsWith,
    EndsWith,
    Contains,
    IsNull,
}

impl Lookup {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::StartsWith => "startswith",
            Self::EndsWith => "endswith",
            Self::Contains => "contains",
            Self::IsNull => "isnull",
        }
    }

    /// LIKE-based lookups
    #[must_use]
    pub fn is_pattern(self) -> bool {
        matches!(self, Self::StartsWith | Self::EndsWith | Self::Contains)
    }
}

impl FromStr for Lookup {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eq" | "exact" => Ok(Self::Eq),
            "ne" => Ok(Self::Ne),
            "lt" => Ok(Self::Lt),
            "lte" => Ok(Self::Lte),
            "gt" => Ok(Self::Gt),
            "gte" => Ok(Self::Gte),
            "startswith" => Ok(Self::StartsWith),
            "endswith" => Ok(Self::EndsWith),
            "contains" => Ok(Self::Contains),
            "isnull" => Ok(Self::IsNull),
            _ => Err(PolicyError::InvalidLookup(s.to_string())),
        }
    }
}

impl TryFrom<String> for Lookup {
    type Error = PolicyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Lookup> for String {
    fn from(lookup: Lookup) -> Self {
        lookup.name().to_string()
    }
}

/// Security predicate
///
/// `Raw` holds trusted, developer-authored SQL and is emitted verbatim.
/// Everything else is assembled by the compiler from validated identifiers
/// and escaped literals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "PredicateRepr")]
pub enum Predicate {
    FieldEquals { field: FieldPath, value: Operand },
    Compare { left: Operand, lookup: Lookup, right: Operand },
    Raw(String),
    Context(ContextRef),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// `field = value`, where `field` may cross relations
    ///
    /// # Errors
    /// Returns the path error for an invalid field path.
    pub fn field_eq(field: &str, value: impl Into<Operand>) -> Result<Self, PolicyError> {
        Ok(Self::FieldEquals {
            field: FieldPath::parse(field)?,
            value: value.into(),
        })
    }

    /// `field <lookup> value`
    ///
    /// # Errors
    /// Returns the path error for an invalid field path.
    pub fn field(field: &str, lookup: Lookup, value: impl Into<Operand>) -> Result<Self, PolicyError> {
        Ok(Self::Compare {
            left: Operand::field(field)?,
            lookup,
            right: value.into(),
        })
    }

    #[must_use]
    pub fn compare(left: impl Into<Operand>, lookup: Lookup, right: impl Into<Operand>) -> Self {
        Self::Compare {
            left: left.into(),
            lookup,
            right: right.into(),
        }
    }

    /// Trusted SQL fragment, emitted as-is
    ///
    /// # Errors
    /// `PolicyError::MissingField` when `sql` is blank.
    pub fn raw(sql: impl Into<String>) -> Result<Self, PolicyError> {
        let sql = sql.into();
        if sql.trim().is_empty() {
            return Err(PolicyError::MissingField("expression"));
        }
        Ok(Self::Raw(sql))
    }

    #[must_use]
    pub fn context(context: ContextRef) -> Self {
        Self::Context(context)
    }

    /// # Errors
    /// `PolicyError::EmptyCombinator` when `children` is empty.
    pub fn and(children: impl IntoIterator<Item = Predicate>) -> Result<Self, PolicyError> {
        let children: Vec<_> = children.into_iter().collect();
        if children.is_empty() {
            return Err(PolicyError::EmptyCombinator("AND"));
        }
        Ok(Self::And(children))
    }

    /// # Errors
    /// `PolicyError::EmptyCombinator` when `children` is empty.
    pub fn or(children: impl IntoIterator<Item = Predicate>) -> Result<Self, PolicyError> {
        let children: Vec<_> = children.into_iter().collect();
        if children.is_empty() {
            return Err(PolicyError::EmptyCombinator("OR"));
        }
        Ok(Self::Or(children))
    }

    /// Check structural invariants of a tree built by hand
    ///
    /// # Errors
    /// The first violated invariant found depth-first.
    pub fn validate(&self) -> Result<(), PolicyError> {
        match self {
            Self::Raw(sql) if sql.trim().is_empty() => Err(PolicyError::MissingField("expression")),
            Self::And(children) if children.is_empty() => Err(PolicyError::EmptyCombinator("AND")),
            Self::Or(children) if children.is_empty() => Err(PolicyError::EmptyCombinator("OR")),
            Self::And(children) | Self::Or(children) => {
                children.iter().try_for_each(Predicate::validate)
            }
            Self::Not(inner) => inner.validate(),
            _ => Ok(()),
        }
    }

    /// Every context key the predicate reads
    #[must_use]
    pub fn context_keys(&self) -> Vec<&Ident> {
        let mut keys = Vec::new();
        self.collect_context_keys(&mut keys);
        keys.sort();
        keys.dedup();
        keys
    }

    fn collect_context_keys<'a>(&'a self, keys: &mut Vec<&'a Ident>) {
        fn operand<'a>(op: &'a Operand, keys: &mut Vec<&'a Ident>) {
            if let Operand::Context(ctx) = op {
                keys.push(&ctx.key);
            }
        }
        match self {
            Self::FieldEquals { value, .. } => operand(value, keys),
            Self::Compare { left, right, .. } => {
                operand(left, keys);
                operand(right, keys);
            }
            Self::Context(ctx) => keys.push(&ctx.key),
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.collect_context_keys(keys);
                }
            }
            Self::Not(inner) => inner.collect_context_keys(keys),
            Self::Raw(_) => {}
        }
    }
}

impl BitAnd for Predicate {
    type Output = Predicate;

    fn bitand(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            (Self::And(mut left), Self::And(right)) => {
                left.extend(right);
                Self::And(left)
            }
            (Self::And(mut left), right) => {
                left.push(right);
                Self::And(left)
            }
            (left, right) => Self::And(vec![left, right]),
        }
    }
}

impl BitOr for Predicate {
    type Output = Predicate;

    fn bitor(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            (Self::Or(mut left), Self::Or(right)) => {
                left.extend(right);
                Self::Or(left)
            }
            (Self::Or(mut left), right) => {
                left.push(right);
                Self::Or(left)
            }
            (left, right) => Self::Or(vec![left, right]),
        }
    }
}

impl Not for Predicate {
    type Output = Predicate;

    fn not(self) -> Self::Output {
        match self {
            Self::Not(inner) => *inner,
            other => Self::Not(Box::new(other)),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum PredicateRepr {
    FieldEquals { field: FieldPath, value: Operand },
    Compare { left: Operand, lookup: Lookup, right: Operand },
    Raw(String),
    Context(ContextRef),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl TryFrom<PredicateRepr> for Predicate {
    type Error = PolicyError;

    fn try_from(repr: PredicateRepr) -> Result<Self, Self::Error> {
        match repr {
            PredicateRepr::FieldEquals { field, value } => Ok(Self::FieldEquals { field, value }),
            PredicateRepr::Compare {
                left,
                lookup,
                right,
            } => Ok(Self::Compare {
                left,
                lookup,
                right,
            }),
            PredicateRepr::Raw(sql) => Self::raw(sql),
            PredicateRepr::Context(ctx) => Ok(Self::Context(ctx)),
            PredicateRepr::And(children) => Self::and(children),
            PredicateRepr::Or(children) => Self::or(children),
            PredicateRepr::Not(inner) => Ok(Self::Not(inner)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_field_path_parse() {
        let path = FieldPath::parse("company.owner.name").unwrap();
        assert_eq!(path.column().as_str(), "name");
        assert_eq!(path.relations().len(), 2);
        assert!(!path.is_local());

        let (first, rest) = path.split_first().unwrap();
        assert_eq!(first.as_str(), "company");
        assert_eq!(rest.to_string(), "owner.name");
    }

    #[rstest]
    #[case("")]
    #[case("company..name")]
    #[case("name; DROP TABLE x")]
    #[case("owner\"id")]
    fn test_field_path_rejects(#[case] path: &str) {
        assert!(FieldPath::parse(path).is_err());
    }

    #[rstest]
    #[case("integer", CastType::Integer)]
    #[case("INT", CastType::Integer)]
    #[case("bigint", CastType::BigInt)]
    #[case("uuid", CastType::Uuid)]
    #[case("Boolean", CastType::Boolean)]
    #[case("timestamptz", CastType::Timestamptz)]
    fn test_cast_type_parse(#[case] input: &str, #[case] expected: CastType) {
        assert_eq!(input.parse::<CastType>().unwrap(), expected);
    }

    #[test]
    fn test_cast_type_rejects_unknown() {
        assert!(matches!(
            "integer); DROP".parse::<CastType>(),
            Err(PolicyError::InvalidCast(_))
        ));
    }

    #[test]
    fn test_lookup_parse() {
        assert_eq!("exact".parse::<Lookup>().unwrap(), Lookup::Eq);
        assert_eq!("EndsWith".parse::<Lookup>().unwrap(), Lookup::EndsWith);
        assert!(Lookup::Contains.is_pattern());
        assert!("like".parse::<Lookup>().is_err());
    }

    #[test]
    fn test_empty_combinators_rejected() {
        assert_eq!(
            Predicate::and(vec![]).unwrap_err(),
            PolicyError::EmptyCombinator("AND")
        );
        assert_eq!(
            Predicate::or(vec![]).unwrap_err(),
            PolicyError::EmptyCombinator("OR")
        );
        assert!(Predicate::Or(vec![]).validate().is_err());
    }

    #[test]
    fn test_raw_requires_text() {
        assert_eq!(
            Predicate::raw("  ").unwrap_err(),
            PolicyError::MissingField("expression")
        );
    }

    #[test]
    fn test_operators_flatten() {
        let a = Predicate::raw("a").unwrap();
        let b = Predicate::raw("b").unwrap();
        let c = Predicate::raw("c").unwrap();

        match a.clone() | b.clone() | c.clone() {
            Predicate::Or(children) => assert_eq!(children.len(), 3),
            other => panic!("expected OR, got {other:?}"),
        }
        match a.clone() & b & c {
            Predicate::And(children) => assert_eq!(children.len(), 3),
            other => panic!("expected AND, got {other:?}"),
        }
        assert_eq!(!!a.clone(), a);
    }

    #[test]
    fn test_context_keys() {
        let predicate = Predicate::field_eq("owner_id", ContextRef::user_id()).unwrap()
            | Predicate::field_eq("tenant_id", ContextRef::tenant_id()).unwrap()
            | Predicate::field_eq("org_id", ContextRef::tenant_id()).unwrap();
        let keys: Vec<_> = predicate.context_keys().iter().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["tenant_id", "user_id"]);
    }

    #[test]
    fn test_deserialize_predicate() {
        let predicate: Predicate = serde_json::from_str(
            r#"{"or": [
                {"field_equals": {"field": "company.name", "value": {"value": "Acme"}}},
                {"compare": {
                    "left": {"context": {"key": "email"}},
                    "lookup": "endswith",
                    "right": {"value": "@platform.com"}
                }},
                {"raw": "is_public = true"}
            ]}"#,
        )
        .unwrap();

        match predicate {
            Predicate::Or(children) => {
                assert_eq!(
                    children[0],
                    Predicate::field_eq("company.name", "Acme").unwrap()
                );
                assert!(matches!(children[1], Predicate::Compare { lookup: Lookup::EndsWith, .. }));
            }
            other => panic!("expected OR, got {other:?}"),
        }
    }

    #[test]
    fn test_deserialize_rejects_empty_and_bad_fields() {
        assert!(serde_json::from_str::<Predicate>(r#"{"and": []}"#).is_err());
        assert!(serde_json::from_str::<Predicate>(
            r#"{"field_equals": {"field": "a b", "value": {"value": 1}}}"#
        )
        .is_err());
    }
}
