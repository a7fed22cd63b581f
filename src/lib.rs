//! PostgreSQL row level security from declarative policies
//!
//! `pgrls` compiles per-entity policies into `CREATE POLICY` DDL, keeps the
//! catalog in line with what is declared, and applies the session context
//! (`rls.user_id`, `rls.tenant_id`, ...) those policies read.
//!
//! # Crates
//!
//! - `pgrls-common`: errors, configuration, the `Session` seam
//! - `pgrls-policy`: predicates, policies, registry, compiler, evaluator
//! - `pgrls-context`: context store, scoped guards, propagation
//! - `pgrls-catalog`: DDL emission and catalog reconciliation

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub use pgrls_catalog as catalog;
pub use pgrls_common as common;
pub use pgrls_context as context;
pub use pgrls_policy as policy;

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use pgrls_catalog::{CatalogManager, ReconcileReport};
use pgrls_common::{Error, Ident, Result, RlsConfig, Session};
use pgrls_context::{ContextGuard, ContextPropagator, ExtractorRegistry, Principal};
use pgrls_policy::{
    load_declarations, CompiledPolicy, EntityDefinition, PolicyCompiler, PolicyEvaluator,
    PolicyRegistry,
};

/// Failure while applying declared policies to a database
#[derive(Error, Debug)]
pub enum MigrateError<E: std::error::Error + 'static> {
    /// Declarations did not compile; nothing was issued
    #[error(transparent)]
    Declaration(#[from] Error),

    /// The session rejected a statement
    #[error(transparent)]
    Database(E),
}

/// Configuration, registry and the services built on them
pub struct RowSecurity {
    config: RlsConfig,
    registry: Arc<PolicyRegistry>,
    compiler: PolicyCompiler,
    catalog: CatalogManager,
    propagator: ContextPropagator,
    evaluator: PolicyEvaluator,
}

impl RowSecurity {
    /// Build with the built-in context extractors
    ///
    /// # Errors
    /// Returns `Error::Configuration` for invalid configuration or unknown
    /// extractor identifiers.
    pub fn new(config: RlsConfig) -> Result<Self> {
        Self::with_extractors(config, &ExtractorRegistry::with_builtins())
    }

    /// Build resolving `context_extractors` against `extractors`
    ///
    /// # Errors
    /// Returns `Error::Configuration` for invalid configuration or unknown
    /// extractor identifiers.
    pub fn with_extractors(config: RlsConfig, extractors: &ExtractorRegistry) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(PolicyRegistry::new());
        let compiler = PolicyCompiler::new(Arc::clone(&registry), &config)?;
        let catalog = CatalogManager::new(&config);
        let propagator = ContextPropagator::from_config(&config, extractors)?;
        let evaluator = PolicyEvaluator::new(Arc::clone(&registry), &config);

        Ok(Self {
            config,
            registry,
            compiler,
            catalog,
            propagator,
            evaluator,
        })
    }

    #[must_use]
    pub fn config(&self) -> &RlsConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn compiler(&self) -> &PolicyCompiler {
        &self.compiler
    }

    #[must_use]
    pub fn catalog(&self) -> &CatalogManager {
        &self.catalog
    }

    #[must_use]
    pub fn propagator(&self) -> &ContextPropagator {
        &self.propagator
    }

    #[must_use]
    pub fn evaluator(&self) -> &PolicyEvaluator {
        &self.evaluator
    }

    /// # Errors
    /// Returns `Error::Configuration` for a duplicate entity or table.
    pub fn register(&self, entity: EntityDefinition) -> Result<Arc<EntityDefinition>> {
        self.registry.register(entity)
    }

    /// Register every entity declared in a TOML file
    ///
    /// # Errors
    /// Everything loading or registering reports.
    pub fn load_declarations(&self, path: impl AsRef<Path>) -> Result<usize> {
        let entities = load_declarations(path)?;
        let count = entities.len();
        self.registry.register_all(entities)?;
        Ok(count)
    }

    /// Compile every registered policy
    ///
    /// # Errors
    /// The first compile error.
    pub fn compile(&self) -> Result<Vec<CompiledPolicy>> {
        Ok(self.compiler.compile_all()?)
    }

    /// Reconcile the catalog with the registry
    ///
    /// A no-op returning no reports when `auto_enable` is off.
    ///
    /// # Errors
    /// `MigrateError::Declaration` before any statement is issued,
    /// `MigrateError::Database` once reconciliation has started.
    pub fn migrate<S: Session>(
        &self,
        session: &mut S,
    ) -> std::result::Result<Vec<ReconcileReport>, MigrateError<S::Error>> {
        if !self.config.auto_enable {
            info!("auto_enable is off, skipping policy reconciliation");
            return Ok(vec![]);
        }
        let compiled = self.compile()?;
        self.catalog
            .reconcile(session, &self.tables(), &compiled)
            .map_err(MigrateError::Database)
    }

    /// Tables of every registered entity, including those without policies
    #[must_use]
    pub fn tables(&self) -> Vec<Ident> {
        self.registry
            .entities()
            .iter()
            .map(|entity| entity.table().clone())
            .collect()
    }

    /// Drop every registered policy and switch row level security off
    ///
    /// # Errors
    /// See [`RowSecurity::migrate`].
    pub fn teardown<S: Session>(&self, session: &mut S) -> std::result::Result<(), MigrateError<S::Error>> {
        let compiled = self.compile()?;
        for entity in self.registry.entities() {
            self.catalog
                .teardown(session, entity.table(), &compiled)
                .map_err(MigrateError::Database)?;
        }
        Ok(())
    }

    /// Apply `principal`'s context until the guard drops
    ///
    /// # Errors
    /// Whatever the session reports.
    pub fn enter<'s, S: Session>(
        &self,
        session: &'s mut S,
        principal: &Principal,
    ) -> std::result::Result<ContextGuard<'s, S>, S::Error> {
        self.propagator.enter(session, principal)
    }

    /// Run `work` under `principal`'s context
    ///
    /// # Errors
    /// The first of: applying context, `work`, restoring context.
    pub fn run<S, T, E, F>(&self, session: &mut S, principal: &Principal, work: F) -> std::result::Result<T, E>
    where
        S: Session,
        E: From<S::Error>,
        F: FnOnce(&mut S) -> std::result::Result<T, E>,
    {
        self.propagator.run(session, principal, work)
    }
}
