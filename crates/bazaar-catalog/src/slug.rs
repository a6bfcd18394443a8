use bazaar_core::util::with_suffix;
use bazaar_core::{slugify, Filter, ObjectId, Predicate, Result, StateError, ID_FIELD, SLUG_FIELD};
use bazaar_storage::Storage;
use serde_json::Value as JsonValue;
use std::collections::HashSet;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 32;

/// Derives unique slugs by probing the collection: `base`, `base-1`,
/// `base-2`, ... up to a bounded number of candidates.
///
/// The availability check and the later insert are not atomic; the unique index on
/// `slug` remains the final arbiter.
#[derive(Debug, Clone, Copy)]
pub struct SlugAllocator {
    max_attempts: u32,
}

impl Default for SlugAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl SlugAllocator {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn allocate(&self, store: &dyn Storage, collection: &str, name: &str) -> Result<String> {
        self.allocate_for(store, collection, name, None, &HashSet::new())
            .await
    }

    /// `owner` is the entity being renamed, whose current slug does not count
    /// as taken. `reserved` holds slugs handed out earlier in the same batch.
    pub async fn allocate_for(
        &self,
        store: &dyn Storage,
        collection: &str,
        name: &str,
        owner: Option<&ObjectId>,
        reserved: &HashSet<String>,
    ) -> Result<String> {
        let base = base_slug(name)?;
        for candidate in self.candidates(&base) {
            if reserved.contains(&candidate) {
                continue;
            }
            let mut clash = Filter::eq(SLUG_FIELD, JsonValue::String(candidate.clone()));
            if let Some(id) = owner {
                clash = clash.with(ID_FIELD, Predicate::Ne(id.to_value()));
            }
            if store.count(collection, &clash).await? == 0 {
                return Ok(candidate);
            }
            tracing::debug!(collection, candidate = %candidate, "slug taken");
        }
        Err(self.exhausted(base))
    }

    /// Allocation for a batch that replaces a collection: stored rows are
    /// about to go, so only `reserved` counts as taken.
    pub fn allocate_fresh(&self, name: &str, reserved: &HashSet<String>) -> Result<String> {
        let base = base_slug(name)?;
        let found = self.candidates(&base).find(|c| !reserved.contains(c));
        found.ok_or_else(|| self.exhausted(base))
    }

    fn candidates<'a>(&self, base: &'a str) -> impl Iterator<Item = String> + 'a {
        (0..self.max_attempts).map(move |attempt| {
            if attempt == 0 {
                base.to_string()
            } else {
                with_suffix(base, attempt)
            }
        })
    }

    fn exhausted(&self, base: String) -> StateError {
        StateError::AllocationExhausted {
            base,
            attempts: self.max_attempts,
        }
    }
}

fn base_slug(name: &str) -> Result<String> {
    let base = slugify(name);
    if base.is_empty() {
        return Err(StateError::Invalid(format!(
            "'{name}' does not produce a usable slug"
        )));
    }
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bazaar_storage::InMemoryStore;
    use serde_json::json;

    async fn seed(store: &InMemoryStore, slugs: &[&str]) -> Vec<ObjectId> {
        let docs = slugs
            .iter()
            .map(|s| match json!({ "slug": s }) {
                JsonValue::Object(m) => m,
                _ => unreachable!(),
            })
            .collect();
        store.insert_many("categories", docs).await.unwrap()
    }

    #[tokio::test]
    async fn free_base_is_used_as_is() {
        let store = InMemoryStore::new();
        let slug = SlugAllocator::default()
            .allocate(&store, "categories", "Home & Garden")
            .await
            .unwrap();
        assert_eq!(slug, "home-garden");
    }

    #[tokio::test]
    async fn collisions_take_the_next_counter() {
        let store = InMemoryStore::new();
        seed(&store, &["books", "books-1"]).await;
        let slug = SlugAllocator::default()
            .allocate(&store, "categories", "Books")
            .await
            .unwrap();
        assert_eq!(slug, "books-2");
    }

    #[tokio::test]
    async fn reserved_and_owned_slugs() {
        let store = InMemoryStore::new();
        let ids = seed(&store, &["books"]).await;
        let alloc = SlugAllocator::default();
        let reserved: HashSet<String> = ["books-1".to_string()].into();
        let slug = alloc
            .allocate_for(&store, "categories", "Books", None, &reserved)
            .await
            .unwrap();
        assert_eq!(slug, "books-2");
        // renaming the owner back to its own slug keeps it
        let slug = alloc
            .allocate_for(&store, "categories", "books", Some(&ids[0]), &HashSet::new())
            .await
            .unwrap();
        assert_eq!(slug, "books");
    }

    #[tokio::test]
    async fn exhaustion_is_an_error() {
        let store = InMemoryStore::new();
        seed(&store, &["books", "books-1", "books-2"]).await;
        let err = SlugAllocator::new(3)
            .allocate(&store, "categories", "Books")
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::AllocationExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn empty_slug_is_invalid() {
        let store = InMemoryStore::new();
        let err = SlugAllocator::default()
            .allocate(&store, "categories", "***")
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::Invalid(_)));
    }

    #[test]
    fn fresh_allocation_ignores_the_store() {
        let alloc = SlugAllocator::new(2);
        let reserved: HashSet<String> = ["books".to_string()].into();
        assert_eq!(alloc.allocate_fresh("Books", &HashSet::new()).unwrap(), "books");
        assert_eq!(alloc.allocate_fresh("Books", &reserved).unwrap(), "books-1");
        let reserved: HashSet<String> = ["books".to_string(), "books-1".to_string()].into();
        let err = alloc.allocate_fresh("Books", &reserved).unwrap_err();
        assert!(matches!(err, StateError::AllocationExhausted { attempts: 2, .. }));
    }
}
