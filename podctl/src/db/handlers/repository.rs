//! Base repository trait for entity-store operations.
//!
//! A repository is the data access layer for one entity table inside one
//! tenant's schema. Each repository borrows a `PgConnection`, so multiple
//! repositories can participate in a single transaction (pod + password
//! creation relies on this).

use crate::db::errors::Result;

/// Common operations every entity repository provides.
///
/// Updates are deliberately absent from the trait: each entity exposes its own
/// compare-and-swap update with entity-specific audit behavior.
#[async_trait::async_trait]
pub trait Repository {
    /// The domain entity type stored by this repository
    type Entity;

    /// The identifier type for lookups
    type Id: Send + Sync + ?Sized;

    /// Insert a new entity. Fails with `UniqueViolation` if the primary key
    /// already exists in the tenant scope.
    async fn create(&mut self, entity: &Self::Entity) -> Result<()>;

    /// Get an entity by ID
    async fn get(&mut self, id: &Self::Id) -> Result<Option<Self::Entity>>;

    /// List all entities in the tenant scope
    async fn list(&mut self) -> Result<Vec<Self::Entity>>;

    /// Delete an entity by ID, returning whether a row was removed
    async fn delete(&mut self, id: &Self::Id) -> Result<bool>;
}
