//! Policy declaration files
//!
//! ```toml
//! [[entity]]
//! name = "Document"
//! table = "documents"
//!
//! [[entity.relation]]
//! name = "company"
//! fk_column = "company_id"
//! table = "companies"
//!
//! [[entity.policy]]
//! name = "owner_policy"
//! user = "owner_id"
//!
//! [[entity.policy]]
//! name = "acme_only"
//! permissive = false
//! using = { field_equals = { field = "company.name", value = { value = "Acme" } } }
//! ```
//!
//! A policy names exactly one of `tenant`, `user`, `expression` or `using`.

use std::path::Path;

use pgrls_common::{Error, Result};
use serde::Deserialize;
use tracing::info;

use crate::policy::{Command, Policy};
use crate::predicate::{CastType, Predicate};
use crate::registry::EntityDefinition;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeclarationFile {
    #[serde(default, rename = "entity")]
    entities: Vec<EntityDecl>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EntityDecl {
    name: String,
    table: String,
    #[serde(default, rename = "relation")]
    relations: Vec<RelationDecl>,
    #[serde(default, rename = "policy")]
    policies: Vec<PolicyDecl>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RelationDecl {
    name: String,
    fk_column: String,
    table: String,
    #[serde(default = "default_pk")]
    pk: String,
}

fn default_pk() -> String {
    "id".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyDecl {
    name: String,
    command: Option<String>,
    permissive: Option<bool>,
    #[serde(default)]
    roles: Vec<String>,
    tenant: Option<String>,
    user: Option<String>,
    expression: Option<String>,
    using: Option<Predicate>,
    check: Option<Predicate>,
    cast: Option<CastType>,
}

impl TryFrom<PolicyDecl> for Policy {
    type Error = Error;

    fn try_from(decl: PolicyDecl) -> Result<Self> {
        let PolicyDecl {
            name,
            command,
            permissive,
            roles,
            tenant,
            user,
            expression,
            using,
            check,
            cast,
        } = decl;

        let mut policy = match (tenant, user, expression, using) {
            (Some(column), None, None, None) => Policy::tenant(&name, &column)?,
            (None, Some(column), None, None) => Policy::user(&name, &column)?,
            (None, None, Some(expression), None) => Policy::custom(&name, &expression)?,
            (None, None, None, Some(predicate)) => Policy::new(&name, predicate)?,
            (None, None, None, None) => {
                return Err(Error::Configuration(format!(
                    "policy '{name}': one of tenant, user, expression or using is required"
                )))
            }
            _ => {
                return Err(Error::Configuration(format!(
                    "policy '{name}': tenant, user, expression and using are mutually exclusive"
                )))
            }
        };

        if let Some(command) = command {
            policy = policy.for_command(command.parse::<Command>()?);
        }
        if let Some(permissive) = permissive {
            policy = policy.permissive(permissive);
        }
        if !roles.is_empty() {
            policy = policy.for_roles(roles)?;
        }
        if let Some(check) = check {
            policy = policy.with_check(check)?;
        }
        if let Some(cast) = cast {
            policy = policy.context_type(cast);
        }
        Ok(policy)
    }
}

impl TryFrom<EntityDecl> for EntityDefinition {
    type Error = Error;

    fn try_from(decl: EntityDecl) -> Result<Self> {
        let mut definition = EntityDefinition::new(&decl.name, &decl.table)?;
        for relation in decl.relations {
            definition = definition.relation_with_pk(
                &relation.name,
                &relation.fk_column,
                &relation.table,
                &relation.pk,
            )?;
        }
        for policy in decl.policies {
            definition = definition.policy(Policy::try_from(policy)?)?;
        }
        Ok(definition)
    }
}

/// Parse entity definitions from a TOML document
///
/// # Errors
/// `Error::Configuration` for malformed documents (including a `policy`
/// key that is not an array of tables), `Error::Policy` for invalid policy
/// parameters.
pub fn parse_declarations(content: &str) -> Result<Vec<EntityDefinition>> {
    let file: DeclarationFile = toml::from_str(content)?;
    file.entities
        .into_iter()
        .map(EntityDefinition::try_from)
        .collect()
}

/// Load entity definitions from a TOML file
///
/// # Errors
/// I/O errors plus everything [`parse_declarations`] reports.
pub fn load_declarations(path: impl AsRef<Path>) -> Result<Vec<EntityDefinition>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let definitions = parse_declarations(&content)?;
    info!(
        path = %path.display(),
        entities = definitions.len(),
        "Loaded policy declarations"
    );
    Ok(definitions)
}
