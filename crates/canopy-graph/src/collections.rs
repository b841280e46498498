//! Named, ordered collections of entities.
//!
//! A membership is three keys: the reverse `memberof` entry, the index
//! entry (member → sequence) and the ordering entry (sequence → member).
//! They are written in that order and removed in the opposite order, so an
//! interrupted write leaves at most a dangling reverse entry.

use serde::Serialize;
use serde_json::{Map, Value};

use canopy_core::{Context, Entity, EntityId, EntityRef};
use canopy_store::{BatchOp, Page, PageRequest};

use crate::error::{GraphError, Result};
use crate::keys::{segment, split_id};
use crate::manager::EntityManager;
use crate::paging::Pager;

/// A collection as seen from one of its members.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CollectionRef {
    pub parent: EntityRef,
    pub name: String,
}

impl EntityManager {
    /// Append `member` to `parent`'s `name` collection unless already present.
    pub async fn add_to_collection(
        &self,
        ctx: &Context,
        parent: &EntityId,
        name: &str,
        member: &EntityId,
    ) -> Result<()> {
        let name = segment("collection", name)?;
        let parent_entity = self.get(ctx, parent).await?;
        let member_entity = self.get(ctx, member).await?;
        let keys = self.keys(ctx);
        let store = self.store();

        store
            .put(
                &keys.member_of(member, parent, &name),
                parent_entity.entity_type.clone(),
                ctx.timeout,
            )
            .await?;

        let index_key = keys.collection_index(parent, &name, member);
        let mut seq = None;
        for _ in 0..2 {
            let fresh = self.next_sequence();
            if store
                .insert_if_absent(&index_key, fresh.clone(), ctx.timeout)
                .await?
            {
                seq = Some(fresh);
                break;
            }
            if let Some(existing) = store.get(&index_key, ctx.timeout).await? {
                seq = Some(existing);
                break;
            }
        }
        let Some(seq) = seq else {
            return Err(GraphError::ConcurrentModification {
                id: *parent,
                attempts: 2,
            });
        };

        // Re-put on every call so a crash between the index and ordering
        // writes is repaired by the retry.
        let order_key = keys.collection_order(parent, &name, &seq, member);
        store
            .put(&order_key, member_entity.entity_type.clone(), ctx.timeout)
            .await?;

        // A concurrent remove may have dropped the index after it was read.
        if store.get(&index_key, ctx.timeout).await?.as_deref() != Some(seq.as_str()) {
            store.delete(&order_key, ctx.timeout).await?;
            tracing::debug!(
                tenant_id = %ctx.tenant_id,
                parent = %parent,
                collection = %name,
                member = %member,
                "Membership removed concurrently, dropped ordering key"
            );
            return Ok(());
        }

        tracing::debug!(
            tenant_id = %ctx.tenant_id,
            parent = %parent,
            collection = %name,
            member = %member,
            "Added to collection"
        );
        Ok(())
    }

    /// Create an entity and append it to `parent`'s `name` collection.
    pub async fn create_in_collection(
        &self,
        ctx: &Context,
        parent: &EntityId,
        name: &str,
        entity_type: &str,
        properties: Map<String, Value>,
    ) -> Result<Entity> {
        let name = segment("collection", name)?;
        if !self.exists(ctx, parent).await? {
            return Err(GraphError::not_found("entity", parent));
        }
        let entity = self.create(ctx, entity_type, properties).await?;
        self.add_to_collection(ctx, parent, &name, &entity.id).await?;
        Ok(entity)
    }

    /// Remove `member` from the collection. Absent members are ignored.
    pub async fn remove_from_collection(
        &self,
        ctx: &Context,
        parent: &EntityId,
        name: &str,
        member: &EntityId,
    ) -> Result<()> {
        let name = segment("collection", name)?;
        self.drop_membership(ctx, parent, &name, member).await?;
        tracing::debug!(
            tenant_id = %ctx.tenant_id,
            parent = %parent,
            collection = %name,
            member = %member,
            "Removed from collection"
        );
        Ok(())
    }

    pub(crate) async fn drop_membership(
        &self,
        ctx: &Context,
        parent: &EntityId,
        name: &str,
        member: &EntityId,
    ) -> Result<()> {
        let keys = self.keys(ctx);
        let index_key = keys.collection_index(parent, name, member);
        let mut ops = Vec::with_capacity(3);
        if let Some(seq) = self.store().get(&index_key, ctx.timeout).await? {
            ops.push(BatchOp::delete(
                keys.collection_order(parent, name, &seq, member),
            ));
        }
        ops.push(BatchOp::delete(index_key));
        ops.push(BatchOp::delete(keys.member_of(member, parent, name)));
        self.apply(ctx, ops).await
    }

    pub async fn is_collection_member(
        &self,
        ctx: &Context,
        parent: &EntityId,
        name: &str,
        member: &EntityId,
    ) -> Result<bool> {
        let name = segment("collection", name)?;
        let key = self.keys(ctx).collection_index(parent, &name, member);
        Ok(self.store().get(&key, ctx.timeout).await?.is_some())
    }

    /// One page of the collection in insertion order.
    ///
    /// Members whose entity no longer exists are pruned and skipped, as are
    /// ordering keys whose index entry no longer holds their sequence.
    pub async fn list_collection(
        &self,
        ctx: &Context,
        parent: &EntityId,
        name: &str,
        page: &PageRequest,
    ) -> Result<Page<Entity>> {
        let name = segment("collection", name)?;
        let keys = self.keys(ctx);
        let mut pager = Pager::new(
            self,
            keys.collection_order_prefix(parent, &name),
            format!("{}|coll|{parent}|{name}", ctx.tenant_id),
            page,
        )?;

        let mut items = Vec::new();
        while pager.wants(items.len()) {
            for cell in pager.next_batch(self, ctx, items.len()).await? {
                let entry = cell
                    .key
                    .strip_prefix(pager.prefix())
                    .and_then(|tail| tail.rsplit_once('/'))
                    .and_then(|(seq, id)| Some((seq.to_string(), EntityId::parse(id)?)));
                let Some((seq, member)) = entry else {
                    tracing::warn!(key = %cell.key, "Skipping malformed collection key");
                    continue;
                };
                let index_key = keys.collection_index(parent, &name, &member);
                if self.store().get(&index_key, ctx.timeout).await?.as_deref() != Some(seq.as_str())
                {
                    self.store().delete(&cell.key, ctx.timeout).await?;
                    tracing::warn!(
                        tenant_id = %ctx.tenant_id,
                        parent = %parent,
                        collection = %name,
                        member = %member,
                        "Pruned stale collection ordering key"
                    );
                    continue;
                }
                match self.get_optional(ctx, &member).await? {
                    Some(entity) => items.push(entity),
                    None => {
                        self.drop_membership(ctx, parent, &name, &member).await?;
                        self.store().delete(&cell.key, ctx.timeout).await?;
                        tracing::warn!(
                            tenant_id = %ctx.tenant_id,
                            parent = %parent,
                            collection = %name,
                            member = %member,
                            "Pruned hanging collection member"
                        );
                    }
                }
            }
        }

        pager.finish(self, ctx, items).await
    }

    /// Every collection `member` belongs to.
    pub async fn collections_containing(
        &self,
        ctx: &Context,
        member: &EntityId,
    ) -> Result<Vec<CollectionRef>> {
        let prefix = self.keys(ctx).member_of_prefix(member);
        let cells = self.sweep(ctx, &prefix).await?;
        Ok(cells
            .into_iter()
            .filter_map(|cell| {
                let tail = cell.key.strip_prefix(&prefix)?;
                let (parent, name) = split_id(tail)?;
                Some(CollectionRef {
                    parent: EntityRef::new(parent, cell.value.clone()),
                    name: name.to_string(),
                })
            })
            .collect())
    }
}
