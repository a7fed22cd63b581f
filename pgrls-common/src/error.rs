//! Error types for pgrls
//!
//! Database errors are deliberately absent: operations that touch a session
//! return that session's own error type unchanged.

use thiserror::Error;

/// Result type alias using pgrls's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for declaration, compilation and configuration
#[derive(Error, Debug)]
pub enum Error {
    // Declaration Errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    // Compilation Errors
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    // IO Errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Invalid policy parameters, raised before any SQL is built
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Policy name is required")]
    EmptyName,

    #[error("Invalid identifier '{0}': expected [A-Za-z_][A-Za-z0-9_]*")]
    InvalidIdentifier(String),

    #[error("Identifier '{0}' exceeds 63 bytes")]
    IdentifierTooLong(String),

    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("Invalid operation '{0}': expected SELECT, INSERT, UPDATE, DELETE or ALL")]
    InvalidCommand(String),

    #[error("Invalid lookup '{0}'")]
    InvalidLookup(String),

    #[error("Invalid cast type '{0}'")]
    InvalidCast(String),

    #[error("{0} requires at least one predicate")]
    EmptyCombinator(&'static str),

    #[error("Policy '{name}' is declared twice on table '{table}'")]
    DuplicatePolicy { name: String, table: String },
}

/// Predicate shapes that cannot be turned into a policy expression
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("Entity not registered: {0}")]
    UnknownEntity(String),

    #[error("Relation '{relation}' is not declared on table '{table}'")]
    UnknownRelation { table: String, relation: String },

    #[error("Lookup '{0}' requires a literal value on the right-hand side")]
    NonLiteralPattern(&'static str),

    #[error("Relation path '{0}' may only appear on the left-hand side")]
    RelationOperand(String),

    #[error("{0} without operands cannot be compiled")]
    EmptyCombinator(&'static str),
}

impl Error {
    /// Stable error code for logs and tooling
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::Policy(e) => e.code(),
            Self::Compile(_) => "compile_error",
            Self::Io(_) => "io_error",
        }
    }
}

impl PolicyError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyName => "empty_name",
            Self::InvalidIdentifier(_) | Self::IdentifierTooLong(_) => "invalid_identifier",
            Self::MissingField(_) => "missing_field",
            Self::InvalidCommand(_) => "invalid_command",
            Self::InvalidLookup(_) => "invalid_lookup",
            Self::InvalidCast(_) => "invalid_cast",
            Self::EmptyCombinator(_) => "empty_combinator",
            Self::DuplicatePolicy { .. } => "duplicate_policy",
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}
