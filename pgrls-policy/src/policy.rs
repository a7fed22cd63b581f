//! Policy value objects

use std::fmt;
use std::str::FromStr;

use pgrls_common::{Ident, PolicyError};
use serde::{Deserialize, Serialize};

use crate::predicate::{CastType, ContextRef, FieldPath, Operand, Predicate};

/// RLS policy command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Command {
    #[default]
    All,
    Select,
    Insert,
    Update,
    Delete,
}

impl Command {
    /// Keyword as written in `CREATE POLICY ... FOR <cmd>`
    #[must_use]
    pub fn sql(self) -> &'static str {
        match self {
            Self::All => "ALL",
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    /// `pg_policy.polcmd` encoding
    #[must_use]
    pub fn catalog_char(self) -> char {
        match self {
            Self::All => '*',
            Self::Select => 'r',
            Self::Insert => 'a',
            Self::Update => 'w',
            Self::Delete => 'd',
        }
    }

    #[must_use]
    pub fn from_catalog_char(c: char) -> Option<Self> {
        match c {
            '*' => Some(Self::All),
            'r' => Some(Self::Select),
            'a' => Some(Self::Insert),
            'w' => Some(Self::Update),
            'd' => Some(Self::Delete),
            _ => None,
        }
    }

    /// Whether the policy carries a USING clause
    #[must_use]
    pub fn has_using(self) -> bool {
        !matches!(self, Self::Insert)
    }

    /// Whether the policy carries a WITH CHECK clause
    #[must_use]
    pub fn has_check(self) -> bool {
        matches!(self, Self::All | Self::Insert | Self::Update)
    }

    /// Check if this command applies to a given statement kind
    #[must_use]
    pub fn applies_to(self, statement: Command) -> bool {
        self == Self::All || self == statement
    }
}

impl FromStr for Command {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ALL" => Ok(Self::All),
            "SELECT" => Ok(Self::Select),
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            _ => Err(PolicyError::InvalidCommand(s.to_string())),
        }
    }
}

impl TryFrom<String> for Command {
    type Error = PolicyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Command> for String {
    fn from(command: Command) -> Self {
        command.sql().to_string()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql())
    }
}

/// A declared row level security policy
///
/// Immutable once registered. `permissive` and `roles` left unset fall back
/// to the configured defaults when the policy is compiled.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    name: Ident,
    command: Command,
    permissive: Option<bool>,
    roles: Vec<Ident>,
    using: Predicate,
    check: Option<Predicate>,
}

fn policy_name(name: &str) -> Result<Ident, PolicyError> {
    if name.trim().is_empty() {
        return Err(PolicyError::EmptyName);
    }
    Ident::new(name)
}

fn column(value: &str, field: &'static str) -> Result<FieldPath, PolicyError> {
    if value.trim().is_empty() {
        return Err(PolicyError::MissingField(field));
    }
    FieldPath::parse(value)
}

impl Policy {
    /// Create a policy for all commands
    ///
    /// # Errors
    /// `PolicyError::EmptyName` or an identifier error for a bad name, or
    /// the predicate's own structural error.
    pub fn new(name: &str, using: Predicate) -> Result<Self, PolicyError> {
        let name = policy_name(name)?;
        using.validate()?;
        Ok(Self {
            name,
            command: Command::All,
            permissive: None,
            roles: vec![],
            using,
            check: None,
        })
    }

    /// Rows whose `column` equals the integer `tenant_id` context
    ///
    /// # Errors
    /// `PolicyError::MissingField("tenant_field")` when `column` is blank.
    pub fn tenant(name: &str, column_name: &str) -> Result<Self, PolicyError> {
        let field = column(column_name, "tenant_field")?;
        Self::new(
            name,
            Predicate::FieldEquals {
                field,
                value: ContextRef::tenant_id().into(),
            },
        )
    }

    /// Rows whose `column` equals the integer `user_id` context
    ///
    /// # Errors
    /// `PolicyError::MissingField("user_field")` when `column` is blank.
    pub fn user(name: &str, column_name: &str) -> Result<Self, PolicyError> {
        let field = column(column_name, "user_field")?;
        Self::new(
            name,
            Predicate::FieldEquals {
                field,
                value: ContextRef::user_id().into(),
            },
        )
    }

    /// Policy over a trusted SQL expression
    ///
    /// # Errors
    /// `PolicyError::MissingField("expression")` when `expression` is blank.
    pub fn custom(name: &str, expression: &str) -> Result<Self, PolicyError> {
        Self::new(name, Predicate::raw(expression)?)
    }

    #[must_use]
    pub fn for_command(mut self, command: Command) -> Self {
        self.command = command;
        self
    }

    /// Make policy restrictive
    #[must_use]
    pub fn restrictive(mut self) -> Self {
        self.permissive = Some(false);
        self
    }

    #[must_use]
    pub fn permissive(mut self, permissive: bool) -> Self {
        self.permissive = Some(permissive);
        self
    }

    /// Set the WITH CHECK predicate
    ///
    /// # Errors
    /// The predicate's structural error.
    pub fn with_check(mut self, check: Predicate) -> Result<Self, PolicyError> {
        check.validate()?;
        self.check = Some(check);
        Ok(self)
    }

    /// Target roles instead of the configured default
    ///
    /// # Errors
    /// The identifier error of the first invalid role name.
    pub fn for_roles<I, S>(mut self, roles: I) -> Result<Self, PolicyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.roles = roles
            .into_iter()
            .map(|r| Ident::new(r.as_ref()))
            .collect::<Result<_, _>>()?;
        Ok(self)
    }

    /// Cast every context reference in the policy to `cast`
    ///
    /// Used with [`Policy::tenant`] and [`Policy::user`] when ids are not
    /// integers.
    #[must_use]
    pub fn context_type(mut self, cast: CastType) -> Self {
        recast(&mut self.using, cast);
        if let Some(check) = self.check.as_mut() {
            recast(check, cast);
        }
        self
    }

    #[must_use]
    pub fn name(&self) -> &Ident {
        &self.name
    }

    #[must_use]
    pub fn command(&self) -> Command {
        self.command
    }

    /// Explicit permissiveness, if declared
    #[must_use]
    pub fn is_permissive(&self) -> Option<bool> {
        self.permissive
    }

    #[must_use]
    pub fn roles(&self) -> &[Ident] {
        &self.roles
    }

    #[must_use]
    pub fn using(&self) -> &Predicate {
        &self.using
    }

    /// Declared WITH CHECK predicate, without defaulting
    #[must_use]
    pub fn check(&self) -> Option<&Predicate> {
        self.check.as_ref()
    }

    /// WITH CHECK predicate as enforced: the declared one, or USING for
    /// commands that write
    #[must_use]
    pub fn effective_check(&self) -> Option<&Predicate> {
        if !self.command.has_check() {
            return None;
        }
        Some(self.check.as_ref().unwrap_or(&self.using))
    }

    /// Context keys the enforced predicates read
    #[must_use]
    pub fn context_keys(&self) -> Vec<&Ident> {
        let mut keys = Vec::new();
        if self.command.has_using() {
            keys.extend(self.using.context_keys());
        }
        if let Some(check) = self.effective_check() {
            keys.extend(check.context_keys());
        }
        keys.sort();
        keys.dedup();
        keys
    }

    /// Check the policy can be expressed in PostgreSQL
    ///
    /// # Errors
    /// `PolicyError::MissingField("using")` when a SELECT or DELETE policy
    /// only declares a WITH CHECK predicate the engine would reject.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.check.is_some() && !self.command.has_check() {
            return Err(PolicyError::MissingField("using"));
        }
        Ok(())
    }
}

fn recast(predicate: &mut Predicate, cast: CastType) {
    fn operand(op: &mut Operand, cast: CastType) {
        if let Operand::Context(ctx) = op {
            ctx.cast = cast;
        }
    }
    match predicate {
        Predicate::FieldEquals { value, .. } => operand(value, cast),
        Predicate::Compare { left, right, .. } => {
            operand(left, cast);
            operand(right, cast);
        }
        Predicate::Context(ctx) => ctx.cast = cast,
        Predicate::And(children) | Predicate::Or(children) => {
            for child in children {
                recast(child, cast);
            }
        }
        Predicate::Not(inner) => recast(inner, cast),
        Predicate::Raw(_) => {}
    }
}
