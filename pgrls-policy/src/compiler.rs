//! Predicate to SQL compiler
//!
//! Produces the expression text placed inside `USING (...)` and
//! `WITH CHECK (...)`. Identifiers are double-quoted, values go through
//! [`format_literal`], context references read the session variable with
//! `current_setting(.., true)` so a missing variable compares as NULL.
//!
//! Policy expressions cannot join, so a field reached through relations is
//! rewritten into nested `IN (SELECT ...)` subqueries.

use std::sync::Arc;

use pgrls_common::{escape_like, format_literal, CompileError, Ident, Result, RlsConfig};
use serde::Serialize;
use tracing::debug;

use crate::policy::{Command, Policy};
use crate::predicate::{ContextRef, Literal, Lookup, Operand, Predicate};
use crate::registry::{EntityDefinition, PolicyRegistry};

type CompileResult<T> = std::result::Result<T, CompileError>;

/// A policy ready to be issued as DDL
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompiledPolicy {
    pub name: Ident,
    pub table: Ident,
    pub command: Command,
    pub permissive: bool,
    pub roles: Vec<Ident>,
    /// USING expression (for SELECT, UPDATE, DELETE)
    pub using: Option<String>,
    /// WITH CHECK expression (for INSERT, UPDATE)
    pub check: Option<String>,
}

/// Compiles registered policies into SQL expressions
pub struct PolicyCompiler {
    registry: Arc<PolicyRegistry>,
    namespace: Ident,
    default_role: Ident,
    default_permissive: bool,
}

impl PolicyCompiler {
    /// # Errors
    /// Returns the identifier error for an invalid namespace or role.
    pub fn new(registry: Arc<PolicyRegistry>, config: &RlsConfig) -> Result<Self> {
        Ok(Self {
            registry,
            namespace: Ident::new(config.context_namespace.as_str())?,
            default_role: Ident::new(config.default_role.as_str())?,
            default_permissive: config.default_permissive,
        })
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    /// Compile every policy of every registered entity
    ///
    /// # Errors
    /// The first compile error encountered.
    pub fn compile_all(&self) -> CompileResult<Vec<CompiledPolicy>> {
        let mut compiled = Vec::new();
        for entity in self.registry.entities() {
            compiled.extend(self.compile_entity(&entity)?);
        }
        Ok(compiled)
    }

    /// Compile an entity's policies in declaration order
    ///
    /// # Errors
    /// The first compile error encountered.
    pub fn compile_entity(
        &self,
        entity: &EntityDefinition,
    ) -> CompileResult<Vec<CompiledPolicy>> {
        let compiled = entity
            .policies()
            .iter()
            .map(|policy| self.compile_policy(entity, policy))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        debug!(
            entity = %entity.name(),
            table = %entity.table(),
            policies = compiled.len(),
            "Compiled entity policies"
        );
        Ok(compiled)
    }

    /// Compile one policy declared on `entity`
    ///
    /// INSERT policies only get WITH CHECK, SELECT and DELETE only USING;
    /// ALL and UPDATE get both, CHECK defaulting to USING.
    ///
    /// # Errors
    /// Unresolvable relation paths or unsupported operand shapes.
    pub fn compile_policy(
        &self,
        entity: &EntityDefinition,
        policy: &Policy,
    ) -> CompileResult<CompiledPolicy> {
        let command = policy.command();
        let using = if command.has_using() {
            Some(self.compile_predicate(entity, policy.using())?)
        } else {
            None
        };
        let check = policy
            .effective_check()
            .map(|check| self.compile_predicate(entity, check))
            .transpose()?;

        let roles = if policy.roles().is_empty() {
            vec![self.default_role.clone()]
        } else {
            policy.roles().to_vec()
        };

        Ok(CompiledPolicy {
            name: policy.name().clone(),
            table: entity.table().clone(),
            command,
            permissive: policy.is_permissive().unwrap_or(self.default_permissive),
            roles,
            using,
            check,
        })
    }

    /// Compile a predicate evaluated against `entity`'s table
    ///
    /// # Errors
    /// Unresolvable relation paths or unsupported operand shapes.
    pub fn compile_predicate(
        &self,
        entity: &EntityDefinition,
        predicate: &Predicate,
    ) -> CompileResult<String> {
        self.predicate_sql(Some(entity), entity.table(), predicate)
    }

    /// `NULLIF(current_setting('<ns>.<key>', true), '')::<cast>`
    #[must_use]
    pub fn context_sql(&self, context: &ContextRef) -> String {
        let setting = format!("{}.{}", self.namespace, context.key);
        format!(
            "NULLIF(current_setting({}, true), '')::{}",
            format_literal(&setting),
            context.cast.sql_name()
        )
    }

    fn predicate_sql(
        &self,
        scope: Option<&EntityDefinition>,
        table: &Ident,
        predicate: &Predicate,
    ) -> CompileResult<String> {
        match predicate {
            Predicate::FieldEquals { field, value } => {
                if let Some((hop, rest)) = field.split_first() {
                    let remainder = Predicate::FieldEquals {
                        field: rest,
                        value: value.clone(),
                    };
                    return self.subquery(scope, table, hop, &remainder);
                }
                let column = field.column().quoted();
                match value {
                    Operand::Value(Literal::Null) => Ok(format!("{column} IS NULL")),
                    other => Ok(format!("{column} = {}", self.operand_sql(other)?)),
                }
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
                        return self.subquery(scope, table, hop, &remainder);
                    }
                }
                self.compare_sql(left, *lookup, right)
            }
            Predicate::Raw(sql) => Ok(sql.clone()),
            Predicate::Context(context) => Ok(self.context_sql(context)),
            Predicate::And(children) => self.combine(scope, table, children, "AND"),
            Predicate::Or(children) => self.combine(scope, table, children, "OR"),
            Predicate::Not(inner) => Ok(format!(
                "NOT ({})",
                self.predicate_sql(scope, table, inner)?
            )),
        }
    }

    fn combine(
        &self,
        scope: Option<&EntityDefinition>,
        table: &Ident,
        children: &[Predicate],
        operator: &'static str,
    ) -> CompileResult<String> {
        match children {
            [] => Err(CompileError::EmptyCombinator(operator)),
            [only] => self.predicate_sql(scope, table, only),
            _ => {
                let parts = children
                    .iter()
                    .map(|child| {
                        self.predicate_sql(scope, table, child)
                            .map(|sql| format!("({sql})"))
                    })
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(parts.join(&format!(" {operator} ")))
            }
        }
    }

    fn subquery(
        &self,
        scope: Option<&EntityDefinition>,
        table: &Ident,
        hop: &Ident,
        remainder: &Predicate,
    ) -> CompileResult<String> {
        let relation = scope
            .and_then(|entity| entity.get_relation(hop))
            .ok_or_else(|| CompileError::UnknownRelation {
                table: table.to_string(),
                relation: hop.to_string(),
            })?;

        // Further hops resolve through the target table's own entity
        let target = self.registry.by_table(&relation.target_table);
        let inner = self.predicate_sql(target.as_deref(), &relation.target_table, remainder)?;

        Ok(format!(
            "{} IN (SELECT {} FROM {} WHERE {inner})",
            relation.fk_column.quoted(),
            relation.target_pk.quoted(),
            relation.target_table.quoted(),
        ))
    }

    fn operand_sql(&self, operand: &Operand) -> CompileResult<String> {
        match operand {
            Operand::Field(path) if path.is_local() => Ok(path.column().quoted()),
            Operand::Field(path) => Err(CompileError::RelationOperand(path.to_string())),
            Operand::Context(context) => Ok(self.context_sql(context)),
            Operand::Value(literal) => Ok(literal_sql(literal)),
        }
    }

    fn compare_sql(
        &self,
        left: &Operand,
        lookup: Lookup,
        right: &Operand,
    ) -> CompileResult<String> {
        let lhs = self.operand_sql(left)?;

        if lookup == Lookup::IsNull {
            return match right {
                Operand::Value(Literal::Bool(true)) => Ok(format!("{lhs} IS NULL")),
                Operand::Value(Literal::Bool(false)) => Ok(format!("{lhs} IS NOT NULL")),
                _ => Err(CompileError::NonLiteralPattern(lookup.name())),
            };
        }

        if lookup.is_pattern() {
            let Operand::Value(Literal::Text(text)) = right else {
                return Err(CompileError::NonLiteralPattern(lookup.name()));
            };
            let escaped = escape_like(text);
            let pattern = match lookup {
                Lookup::StartsWith => format!("{escaped}%"),
                Lookup::EndsWith => format!("%{escaped}"),
                _ => format!("%{escaped}%"),
            };
            return Ok(format!("{lhs} LIKE {}", format_literal(&pattern)));
        }

        if let Operand::Value(Literal::Null) = right {
            match lookup {
                Lookup::Eq => return Ok(format!("{lhs} IS NULL")),
                Lookup::Ne => return Ok(format!("{lhs} IS NOT NULL")),
                _ => {}
            }
        }

        let operator = match lookup {
            Lookup::Eq => "=",
            Lookup::Ne => "<>",
            Lookup::Lt => "<",
            Lookup::Lte => "<=",
            Lookup::Gt => ">",
            Lookup::Gte => ">=",
            Lookup::StartsWith | Lookup::EndsWith | Lookup::Contains | Lookup::IsNull => {
                return Err(CompileError::NonLiteralPattern(lookup.name()))
            }
        };
        Ok(format!("{lhs} {operator} {}", self.operand_sql(right)?))
    }
}

/// Render a literal as SQL text
#[must_use]
pub fn literal_sql(literal: &Literal) -> String {
    match literal {
        Literal::Null => "NULL".to_string(),
        Literal::Bool(true) => "TRUE".to_string(),
        Literal::Bool(false) => "FALSE".to_string(),
        Literal::Int(i) => i.to_string(),
        Literal::Float(f) if f.is_finite() => f.to_string(),
        Literal::Float(f) => {
            let special = if f.is_nan() {
                "NaN"
            } else if f.is_sign_positive() {
                "Infinity"
            } else {
                "-Infinity"
            };
            format!("{}::float8", format_literal(special))
        }
        Literal::Uuid(u) => format!("{}::uuid", format_literal(&u.to_string())),
        Literal::Text(s) => format_literal(s),
    }
}
