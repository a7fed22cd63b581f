//! Configuration for policy reconciliation and context propagation

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ident::Ident;

/// Main configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RlsConfig {
    /// Reconcile declared policies whenever migrations run
    pub auto_enable: bool,
    /// Role targeted by policies that do not name their own (default: "public")
    pub default_role: String,
    /// Whether policies are permissive unless declared otherwise
    pub default_permissive: bool,
    /// Identifiers of context extractors to activate, in order
    pub context_extractors: Vec<String>,
    /// Log emitted DDL at debug level
    pub debug: bool,
    /// Prefix of every session variable (default: "rls", giving `rls.user_id`)
    pub context_namespace: String,
    /// Force RLS on reconciled tables so owner roles are not exempt
    pub force_rls: bool,
}

impl Default for RlsConfig {
    fn default() -> Self {
        Self {
            auto_enable: true,
            default_role: "public".to_string(),
            default_permissive: true,
            context_extractors: vec![],
            debug: false,
            context_namespace: "rls".to_string(),
            force_rls: true,
        }
    }
}

impl RlsConfig {
    /// Parse and validate a TOML document
    ///
    /// # Errors
    /// Returns `Error::Configuration` on malformed TOML, unknown keys or
    /// invalid identifiers.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or does not validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Check identifiers that end up inside generated SQL
    ///
    /// # Errors
    /// Returns `Error::Configuration` naming the offending option.
    pub fn validate(&self) -> Result<()> {
        Ident::new(self.context_namespace.as_str()).map_err(|e| {
            Error::Configuration(format!("context_namespace: {e}"))
        })?;
        Ident::new(self.default_role.as_str())
            .map_err(|e| Error::Configuration(format!("default_role: {e}")))?;
        for id in &self.context_extractors {
            if id.trim().is_empty() {
                return Err(Error::Configuration(
                    "context_extractors: empty identifier".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RlsConfig::default();
        assert!(config.auto_enable);
        assert_eq!(config.default_role, "public");
        assert!(config.default_permissive);
        assert!(config.context_extractors.is_empty());
        assert!(!config.debug);
        assert_eq!(config.context_namespace, "rls");
        assert!(config.force_rls);
    }

    #[test]
    fn test_from_toml() {
        let config = RlsConfig::from_toml_str(
            r#"
            auto_enable = false
            default_permissive = false
            context_extractors = ["email"]
            debug = true
            "#,
        )
        .unwrap();

        assert!(!config.auto_enable);
        assert!(!config.default_permissive);
        assert_eq!(config.context_extractors, vec!["email".to_string()]);
        assert!(config.debug);
        assert_eq!(config.default_role, "public");
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let err = RlsConfig::from_toml_str("auto_enable_rls = true").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_rejects_unsafe_namespace() {
        let err = RlsConfig::from_toml_str("context_namespace = \"rls'; --\"").unwrap_err();
        assert!(err.to_string().contains("context_namespace"));
    }

    #[test]
    fn test_wrong_type_is_configuration_error() {
        let err = RlsConfig::from_toml_str("context_extractors = \"email\"").unwrap_err();
        assert_eq!(err.code(), "configuration_error");
    }
}
