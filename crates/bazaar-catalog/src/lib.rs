pub mod executor;
pub mod integrity;
pub mod schema;
pub mod service;
pub mod slug;
pub mod views;

pub use integrity::{BulkDeleteOutcome, ReferenceIntegrityManager};
pub use schema::{DependentLink, EntitySchema, LinkKind};
pub use service::{Created, EntityService};
pub use slug::SlugAllocator;

use bazaar_core::{Result, StateError, SLUG_FIELD};
use bazaar_storage::Storage;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Entity services keyed by route name, all sharing one store.
pub struct Catalog {
    services: BTreeMap<String, Arc<EntityService>>,
    store: Arc<dyn Storage>,
}

impl Catalog {
    /// Registers `schemas` and declares the unique slug index of every
    /// slugged collection.
    pub async fn open(
        store: Arc<dyn Storage>,
        schemas: Vec<EntitySchema>,
        slugs: SlugAllocator,
    ) -> Result<Self> {
        let mut services = BTreeMap::new();
        for schema in schemas {
            if schema.slugged {
                store.create_unique_index(&schema.collection, SLUG_FIELD).await?;
            }
            let name = schema.name.clone();
            let svc = Arc::new(EntityService::new(schema, store.clone(), slugs));
            if services.insert(name.clone(), svc).is_some() {
                return Err(StateError::Invalid(format!("entity '{name}' registered twice")));
            }
        }
        tracing::info!(entities = services.len(), "catalog ready");
        Ok(Self { services, store })
    }

    pub async fn marketplace(store: Arc<dyn Storage>, slugs: SlugAllocator) -> Result<Self> {
        Self::open(store, schema::marketplace(), slugs).await
    }

    pub fn service(&self, name: &str) -> Result<Arc<EntityService>> {
        self.services
            .get(name)
            .cloned()
            .ok_or_else(|| StateError::NotFound(format!("unknown entity '{name}'")))
    }

    pub fn entities(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn store(&self) -> &Arc<dyn Storage> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bazaar_storage::InMemoryStore;

    #[tokio::test]
    async fn unknown_entities_are_not_found() {
        let catalog = Catalog::marketplace(Arc::new(InMemoryStore::new()), SlugAllocator::default())
            .await
            .unwrap();
        assert!(catalog.service("category").is_ok());
        let err = catalog.service("widgets").err().unwrap();
        assert_eq!(err.kind(), bazaar_core::ErrorKind::NotFound);
        assert_eq!(catalog.entities().count(), 10);
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let twice = vec![
            EntitySchema::new("brand", "brands"),
            EntitySchema::new("brand", "brands"),
        ];
        let res = Catalog::open(Arc::new(InMemoryStore::new()), twice, SlugAllocator::default()).await;
        assert!(matches!(res, Err(StateError::Invalid(_))));
    }
}
