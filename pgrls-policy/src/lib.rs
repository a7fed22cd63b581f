//! Declarative row level security policies
//!
//! - Predicate model: field comparisons, context references, raw SQL and
//!   AND / OR / NOT combinators
//! - Policy value objects and an entity registry
//! - Compilation of predicates into policy expressions, rewriting relation
//!   paths into `IN (SELECT ...)` subqueries
//! - Offline evaluation of declared policies against sample rows

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod compiler;
pub mod declaration;
pub mod evaluator;
pub mod policy;
pub mod predicate;
pub mod registry;

pub use compiler::{CompiledPolicy, PolicyCompiler};
pub use declaration::{load_declarations, parse_declarations};
pub use evaluator::{ContextSnapshot, Dataset, EvalError, PolicyEvaluator};
pub use policy::{Command, Policy};
pub use predicate::{CastType, ContextRef, FieldPath, Literal, Lookup, Operand, Predicate};
pub use registry::{EntityDefinition, PolicyRegistry, Relation};
