//! Identifier validation and SQL quoting
//!
//! Identifiers (tables, columns, policies, context keys) are interpolated
//! into SQL text, so they are restricted to a safe character set on top of
//! being double-quoted. Values are never interpolated raw: they go through
//! [`format_literal`] or, on the request path, bound parameters.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// PostgreSQL truncates identifiers longer than this (NAMEDATALEN - 1)
pub const MAX_IDENT_LEN: usize = 63;

static IDENT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid"));

/// A validated SQL identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ident(String);

impl Ident {
    /// Validate and wrap an identifier
    ///
    /// # Errors
    /// Returns `PolicyError::InvalidIdentifier` when the name contains
    /// anything outside `[A-Za-z0-9_]` or starts with a digit, and
    /// `PolicyError::IdentifierTooLong` past 63 bytes.
    pub fn new(name: impl Into<String>) -> Result<Self, PolicyError> {
        let name = name.into();
        if !IDENT_PATTERN.is_match(&name) {
            return Err(PolicyError::InvalidIdentifier(name));
        }
        if name.len() > MAX_IDENT_LEN {
            return Err(PolicyError::IdentifierTooLong(name));
        }
        Ok(Self(name))
    }

    /// Wrap a compile-time identifier known to be valid
    #[must_use]
    pub fn from_static(name: &'static str) -> Self {
        debug_assert!(IDENT_PATTERN.is_match(name), "invalid identifier {name}");
        Self(name.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted form for DDL
    #[must_use]
    pub fn quoted(&self) -> String {
        quote_ident(&self.0)
    }
}

impl TryFrom<String> for Ident {
    type Error = PolicyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Ident {
    type Error = PolicyError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Ident> for String {
    fn from(ident: Ident) -> Self {
        ident.0
    }
}

impl AsRef<str> for Ident {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wrap a name in double quotes, doubling embedded double quotes
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Render a string as a SQL literal, doubling embedded single quotes
///
/// Purely syntactic: the result always starts and ends with `'` and its
/// interior is `value` with every `'` doubled.
#[must_use]
pub fn format_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Escape LIKE wildcards so `value` matches literally inside a pattern
#[must_use]
pub fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("tenant_id")]
    #[case("_private")]
    #[case("Owner2")]
    fn test_valid_identifiers(#[case] name: &str) {
        assert_eq!(Ident::new(name).unwrap().as_str(), name);
    }

    #[rstest]
    #[case("")]
    #[case("2fast")]
    #[case("owner id")]
    #[case("tenant'; DELETE FROM users WHERE '1'='1")]
    #[case("name\"")]
    #[case("a;b")]
    #[case("company.name")]
    fn test_invalid_identifiers(#[case] name: &str) {
        assert!(matches!(
            Ident::new(name),
            Err(PolicyError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_identifier_length_limit() {
        assert!(Ident::new("a".repeat(63)).is_ok());
        assert!(matches!(
            Ident::new("a".repeat(64)),
            Err(PolicyError::IdentifierTooLong(_))
        ));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("test_table"), "\"test_table\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_format_literal_injection() {
        let hostile = "'; DROP TABLE users; --";
        assert_eq!(format_literal(hostile), "'''; DROP TABLE users; --'");
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        assert_eq!(escape_like("@platform.com"), "@platform.com");
    }

    #[test]
    fn test_ident_deserialize_validates() {
        let ok: Ident = serde_json::from_str("\"org_policy\"").unwrap();
        assert_eq!(ok.as_str(), "org_policy");
        assert!(serde_json::from_str::<Ident>("\"bad name\"").is_err());
    }

    proptest! {
        #[test]
        fn prop_format_literal_doubles_quotes(s in any::<String>()) {
            let lit = format_literal(&s);
            prop_assert!(lit.starts_with('\''));
            prop_assert!(lit.ends_with('\''));
            let inner = &lit[1..lit.len() - 1];
            prop_assert_eq!(inner, s.replace('\'', "''"));
            prop_assert_eq!(inner.replace("''", "'"), s);
        }

        #[test]
        fn prop_quote_ident_wraps(s in "[^\\x00]{0,40}") {
            let quoted = quote_ident(&s);
            prop_assert!(quoted.starts_with('"') && quoted.ends_with('"'));
            prop_assert_eq!(&quoted[1..quoted.len() - 1], s.replace('"', "\"\""));
        }
    }
}
