//! Entity registry
//!
//! Maps entity names to their table, relations and ordered policy list.
//! Definitions are validated when registered and immutable afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use pgrls_common::{Error, Ident, PolicyError, Result};
use tracing::debug;

use crate::policy::Policy;

/// A foreign key hop usable in a field path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    /// Name used in paths (`company` in `company.name`)
    pub name: Ident,
    /// Local column holding the key
    pub fk_column: Ident,
    pub target_table: Ident,
    pub target_pk: Ident,
}

/// One entity: a table plus the policies declared on it
#[derive(Debug, Clone)]
pub struct EntityDefinition {
    name: String,
    table: Ident,
    relations: BTreeMap<Ident, Relation>,
    policies: Vec<Policy>,
}

impl EntityDefinition {
    /// # Errors
    /// `Error::Configuration` for a blank entity name, or the identifier
    /// error for a bad table name.
    pub fn new(name: &str, table: &str) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(Error::Configuration("entity name is required".to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            table: Ident::new(table)?,
            relations: BTreeMap::new(),
            policies: vec![],
        })
    }

    /// Declare a relation whose target key column is `id`
    ///
    /// # Errors
    /// See [`EntityDefinition::relation_with_pk`].
    pub fn relation(self, name: &str, fk_column: &str, target_table: &str) -> Result<Self> {
        self.relation_with_pk(name, fk_column, target_table, "id")
    }

    /// # Errors
    /// Identifier errors, or `Error::Configuration` when `name` is already
    /// declared on this entity.
    pub fn relation_with_pk(
        mut self,
        name: &str,
        fk_column: &str,
        target_table: &str,
        target_pk: &str,
    ) -> Result<Self> {
        let relation = Relation {
            name: Ident::new(name)?,
            fk_column: Ident::new(fk_column)?,
            target_table: Ident::new(target_table)?,
            target_pk: Ident::new(target_pk)?,
        };
        if self.relations.contains_key(&relation.name) {
            return Err(Error::Configuration(format!(
                "relation '{}' declared twice on entity '{}'",
                relation.name, self.name
            )));
        }
        self.relations.insert(relation.name.clone(), relation);
        Ok(self)
    }

    /// Append a policy
    ///
    /// # Errors
    /// `PolicyError::DuplicatePolicy` when the name is taken on this table,
    /// or the policy's own validation error.
    pub fn policy(mut self, policy: Policy) -> Result<Self> {
        policy.validate()?;
        if self.policies.iter().any(|p| p.name() == policy.name()) {
            return Err(PolicyError::DuplicatePolicy {
                name: policy.name().to_string(),
                table: self.table.to_string(),
            }
            .into());
        }
        self.policies.push(policy);
        Ok(self)
    }

    /// # Errors
    /// The first error [`EntityDefinition::policy`] reports.
    pub fn policies_from(self, policies: impl IntoIterator<Item = Policy>) -> Result<Self> {
        policies.into_iter().try_fold(self, EntityDefinition::policy)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn table(&self) -> &Ident {
        &self.table
    }

    #[must_use]
    pub fn get_relation(&self, name: &Ident) -> Option<&Relation> {
        self.relations.get(name)
    }

    pub fn relations(&self) -> impl Iterator<Item = &Relation> {
        self.relations.values()
    }

    #[must_use]
    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }
}

/// Registry of entity definitions
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    entities: RwLock<BTreeMap<String, Arc<EntityDefinition>>>,
}

impl PolicyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity
    ///
    /// # Errors
    /// `Error::Configuration` when the entity name or its table is already
    /// registered.
    pub fn register(&self, definition: EntityDefinition) -> Result<Arc<EntityDefinition>> {
        let mut entities = self.entities.write();

        if entities.contains_key(&definition.name) {
            return Err(Error::Configuration(format!(
                "entity '{}' is already registered",
                definition.name
            )));
        }
        if let Some(existing) = entities.values().find(|e| e.table == definition.table) {
            return Err(Error::Configuration(format!(
                "table '{}' is already bound to entity '{}'",
                definition.table, existing.name
            )));
        }

        debug!(
            entity = %definition.name,
            table = %definition.table,
            policies = definition.policies.len(),
            "Registered entity"
        );
        let definition = Arc::new(definition);
        entities.insert(definition.name.clone(), Arc::clone(&definition));
        Ok(definition)
    }

    /// Register several entities, stopping at the first error
    ///
    /// # Errors
    /// See [`PolicyRegistry::register`].
    pub fn register_all(&self, definitions: impl IntoIterator<Item = EntityDefinition>) -> Result<()> {
        for definition in definitions {
            self.register(definition)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<EntityDefinition>> {
        self.entities.read().get(name).cloned()
    }

    /// Look up the entity bound to a table
    #[must_use]
    pub fn by_table(&self, table: &Ident) -> Option<Arc<EntityDefinition>> {
        self.entities
            .read()
            .values()
            .find(|e| &e.table == table)
            .cloned()
    }

    /// All entities, ordered by name
    #[must_use]
    pub fn entities(&self) -> Vec<Arc<EntityDefinition>> {
        self.entities.read().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }
}
