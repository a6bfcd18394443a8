use crate::schema::{DependentLink, EntitySchema, LinkKind};
use bazaar_core::{
    document_id, is_read_only, snapshot_of, Document, Filter, ObjectId, Predicate, Result,
    StateError, ID_FIELD, READ_ONLY_FIELD, STATUS_FIELD,
};
use bazaar_storage::{FindOptions, Storage, Update};
use futures::future::try_join_all;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Result of a bulk delete: how many rows went away and which requested
/// ids were skipped because they are read-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkDeleteOutcome {
    pub deleted: u64,
    pub protected: Vec<ObjectId>,
}

/// Keeps denormalised copies of a parent entity consistent across its
/// dependent collections.
///
/// Each dependent collection is updated atomically on its own. A failure
/// part way leaves earlier collections updated; every fixup is idempotent,
/// so repeating the operation converges.
#[derive(Clone)]
pub struct ReferenceIntegrityManager {
    store: Arc<dyn Storage>,
}

impl ReferenceIntegrityManager {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self { store }
    }

    /// Rewrites every embedded snapshot of `parent_id` from the parent's
    /// current state. Returns the number of dependent documents touched.
    pub async fn on_rename(
        &self,
        parent: &EntitySchema,
        parent_id: &ObjectId,
        current: &Document,
    ) -> Result<u64> {
        let jobs = parent.dependents.iter().filter_map(|link| {
            let LinkKind::Snapshot { fields } = &link.kind else {
                return None;
            };
            let snap = snapshot_of(current, fields);
            let update = fields
                .iter()
                .filter_map(|f| snap.get(f).map(|v| (f, v)))
                .fold(Update::default(), |u, (f, v)| {
                    u.and_set(format!("{}.{f}", link.path), v.clone())
                });
            if update.is_empty() {
                return None;
            }
            let filter = Filter::eq(link.id_path(), parent_id.to_value());
            Some(self.apply(link, filter, update))
        });
        let touched: u64 = try_join_all(jobs).await?.into_iter().sum();
        tracing::debug!(entity = %parent.name, id = %parent_id, touched, "snapshots refreshed");
        Ok(touched)
    }

    /// Copies a status change onto documents that embed any of `ids`.
    pub async fn on_status_change(
        &self,
        parent: &EntitySchema,
        ids: &[ObjectId],
        status: &JsonValue,
    ) -> Result<u64> {
        if !parent.propagate_status || ids.is_empty() {
            return Ok(0);
        }
        let jobs = parent
            .dependents
            .iter()
            .filter(|l| matches!(l.kind, LinkKind::Snapshot { .. }))
            .map(|link| {
                let filter = Filter::ids_in(link.id_path(), ids);
                self.apply(link, filter, Update::set(STATUS_FIELD, status.clone()))
            });
        let touched: u64 = try_join_all(jobs).await?.into_iter().sum();
        tracing::debug!(entity = %parent.name, parents = ids.len(), touched, "status propagated");
        Ok(touched)
    }

    /// Deletes one entity. With `cascade`, dependents are reassigned to the
    /// read-only fallback row (snapshot links) or lose the id (id arrays).
    pub async fn on_delete(
        &self,
        parent: &EntitySchema,
        parent_id: &ObjectId,
        cascade: bool,
    ) -> Result<()> {
        let Some(doc) = self.store.find_by_id(&parent.collection, parent_id).await? else {
            return Err(StateError::NotFound(format!("{} {parent_id}", parent.name)));
        };
        if is_read_only(&doc) {
            tracing::warn!(entity = %parent.name, id = %parent_id, "refusing to delete read only row");
            return Err(StateError::Protected(format!("{} {parent_id}", parent.name)));
        }
        // resolve before deleting so a missing fallback leaves the parent in place
        let fallback = if cascade { self.fallback_for(parent).await? } else { None };
        let deleted = self
            .store
            .delete_one(&parent.collection, &Filter::by_id(parent_id))
            .await?;
        if deleted == 0 {
            return Err(StateError::NotFound(format!("{} {parent_id}", parent.name)));
        }
        if cascade {
            self.reassign(parent, std::slice::from_ref(parent_id), fallback.as_ref())
                .await?;
        }
        tracing::info!(entity = %parent.name, id = %parent_id, cascade, "deleted");
        Ok(())
    }

    /// Bulk variant of [`on_delete`](Self::on_delete). Read-only rows among
    /// `ids` are skipped and reported, never deleted.
    pub async fn on_bulk_delete(
        &self,
        parent: &EntitySchema,
        ids: &[ObjectId],
        cascade: bool,
    ) -> Result<BulkDeleteOutcome> {
        let found = self
            .store
            .find(&parent.collection, &Filter::ids_in(ID_FIELD, ids), FindOptions::default())
            .await?;
        let (locked, open): (Vec<_>, Vec<_>) = found.iter().partition(|d| is_read_only(d));
        let protected: Vec<ObjectId> = locked.into_iter().filter_map(document_id).collect();
        let deletable: Vec<ObjectId> = open.into_iter().filter_map(document_id).collect();
        if !protected.is_empty() {
            tracing::warn!(entity = %parent.name, skipped = protected.len(), "bulk delete skipped read only rows");
        }
        if deletable.is_empty() {
            return Ok(BulkDeleteOutcome {
                deleted: 0,
                protected,
            });
        }

        let fallback = if cascade { self.fallback_for(parent).await? } else { None };
        let filter = Filter::ids_in(ID_FIELD, &deletable)
            .with(READ_ONLY_FIELD, Predicate::Ne(JsonValue::Bool(true)));
        let deleted = self.store.delete_many(&parent.collection, &filter).await?;
        if cascade {
            self.reassign(parent, &deletable, fallback.as_ref()).await?;
        }
        tracing::info!(entity = %parent.name, deleted, cascade, "bulk deleted");
        Ok(BulkDeleteOutcome { deleted, protected })
    }

    /// The seeded read-only row of the parent's collection, when any
    /// dependent embeds snapshots.
    async fn fallback_for(&self, parent: &EntitySchema) -> Result<Option<Document>> {
        if !parent.needs_fallback() {
            return Ok(None);
        }
        let filter = Filter::eq(READ_ONLY_FIELD, JsonValue::Bool(true));
        match self.store.find_one(&parent.collection, &filter).await? {
            Some(doc) => Ok(Some(doc)),
            None => {
                tracing::error!(entity = %parent.name, "no read only fallback row");
                Err(StateError::MissingFallback(parent.collection.clone()))
            }
        }
    }

    async fn reassign(
        &self,
        parent: &EntitySchema,
        ids: &[ObjectId],
        fallback: Option<&Document>,
    ) -> Result<u64> {
        let mut jobs = Vec::with_capacity(parent.dependents.len());
        for link in &parent.dependents {
            match &link.kind {
                LinkKind::Snapshot { fields } => {
                    let fallback = fallback
                        .ok_or_else(|| StateError::MissingFallback(parent.collection.clone()))?;
                    let snap = JsonValue::Object(snapshot_of(fallback, fields));
                    jobs.push(self.apply(
                        link,
                        Filter::ids_in(link.id_path(), ids),
                        Update::set(link.path.clone(), snap),
                    ));
                }
                LinkKind::IdArray => {
                    let values = ids.iter().map(ObjectId::to_value).collect();
                    jobs.push(self.apply(
                        link,
                        Filter::ids_in(link.id_path(), ids),
                        Update::pull(link.path.clone(), values),
                    ));
                }
            }
        }
        let touched: u64 = try_join_all(jobs).await?.into_iter().sum();
        tracing::debug!(entity = %parent.name, parents = ids.len(), touched, "dependents reassigned");
        Ok(touched)
    }

    async fn apply(&self, link: &DependentLink, filter: Filter, update: Update) -> Result<u64> {
        let res = self
            .store
            .update_many(&link.collection, &filter, &update)
            .await
            .inspect_err(|e| {
                tracing::error!(collection = %link.collection, path = %link.path, error = %e, "dependent fixup failed");
            })?;
        Ok(res.modified)
    }
}
