//! Entity deletion.
//!
//! The record goes first, so no reader sees a live entity once delete has
//! started. Every index that mentions the entity is removed after that.
//! Each step is an idempotent batch of deletes: if the process dies part way,
//! calling delete again finishes the sweep, and readers that meet a leftover
//! index entry prune it themselves.

use canopy_core::schema::TYPE_GROUP;
use canopy_core::{Context, Direction, Entity, EntityId};
use canopy_store::BatchOp;

use crate::entities::{alias_of, PROPERTY_GROUP};
use crate::error::{GraphError, Result};
use crate::keys::split_id;
use crate::manager::EntityManager;
use crate::roles::{group_grantee, role_grantee, user_grantee, ROLES_COLLECTION};

impl EntityManager {
    /// Delete an entity and everything that refers to it.
    ///
    /// Returns the deleted entity. When the record is already gone the
    /// remaining indexes are still swept, then `NotFound` is returned.
    /// Deleting a group also deletes the roles scoped to it.
    pub async fn delete(&self, ctx: &Context, id: &EntityId) -> Result<Entity> {
        let existing = self.get_optional(ctx, id).await?;
        if existing.is_some() {
            self.store()
                .delete(&self.keys(ctx).entity(id), ctx.timeout)
                .await?;
        }

        // The group's `roles` collection outlives its record until the purge
        // below, so a retried delete still finds the roles.
        let may_own_roles = *id != ctx.tenant_id.application_id()
            && existing
                .as_ref()
                .map_or(true, |e| e.entity_type == TYPE_GROUP);
        if may_own_roles {
            for role in self.scoped_roles(ctx, id).await? {
                let entity = self.get_optional(ctx, &role).await?;
                if let Some(entity) = &entity {
                    if entity.get_str(PROPERTY_GROUP) != Some(id.to_string().as_str()) {
                        continue;
                    }
                    self.store()
                        .delete(&self.keys(ctx).entity(&role), ctx.timeout)
                        .await?;
                }
                self.purge(ctx, &role, entity.as_ref()).await?;
            }
        }

        self.purge(ctx, id, existing.as_ref()).await?;

        match existing {
            Some(entity) => {
                tracing::info!(
                    tenant_id = %ctx.tenant_id,
                    entity_id = %id,
                    entity_type = %entity.entity_type,
                    "Entity deleted"
                );
                Ok(entity)
            }
            None => Err(GraphError::not_found("entity", id)),
        }
    }

    async fn scoped_roles(&self, ctx: &Context, group: &EntityId) -> Result<Vec<EntityId>> {
        let prefix = self
            .keys(ctx)
            .collection_order_prefix(group, ROLES_COLLECTION);
        Ok(self
            .sweep(ctx, &prefix)
            .await?
            .iter()
            .filter_map(|cell| {
                let (_, member) = cell.key.rsplit_once('/')?;
                EntityId::parse(member)
            })
            .collect())
    }

    /// Remove every index entry mentioning `id`. `entity` is the deleted
    /// record when known; without it the alias cannot be derived and is
    /// reclaimed by the next entity that claims it.
    pub(crate) async fn purge(
        &self,
        ctx: &Context,
        id: &EntityId,
        entity: Option<&Entity>,
    ) -> Result<()> {
        let keys = self.keys(ctx);

        if let Some(entity) = entity {
            let schema = self.schema(&entity.entity_type);
            if let Some(alias) = alias_of(entity, &schema) {
                let key = keys.alias(&entity.entity_type, &alias);
                let owner = self.store().get(&key, ctx.timeout).await?;
                if owner.as_deref() == Some(id.to_string().as_str()) {
                    self.store().delete(&key, ctx.timeout).await?;
                }
            }
        }

        // Collections this entity is a member of.
        let prefix = keys.member_of_prefix(id);
        for cell in self.sweep(ctx, &prefix).await? {
            let Some((parent, name)) = cell.key.strip_prefix(&prefix).and_then(split_id) else {
                continue;
            };
            self.drop_membership(ctx, &parent, name, id).await?;
        }

        // Collections this entity owns.
        let prefix = keys.collections_of(id);
        let mut ops = Vec::new();
        for cell in self.sweep(ctx, &prefix).await? {
            if let Some(tail) = cell.key.strip_prefix(&prefix) {
                if let Some((name, member)) = tail.split_once("/i/") {
                    if let Some(member) = EntityId::parse(member) {
                        ops.push(BatchOp::delete(keys.member_of(&member, id, name)));
                    }
                }
            }
            ops.push(BatchOp::delete(cell.key));
        }
        self.apply(ctx, ops).await?;

        // Connections in both directions.
        for direction in [Direction::Outgoing, Direction::Incoming] {
            let prefix = keys.connections_of(direction, id);
            for cell in self.sweep(ctx, &prefix).await? {
                let Some((verb, other)) = cell
                    .key
                    .strip_prefix(&prefix)
                    .and_then(|tail| tail.split_once('/'))
                else {
                    continue;
                };
                let Some(other) = EntityId::parse(other) else {
                    continue;
                };
                self.drop_connection(ctx, direction, id, verb, &other)
                    .await?;
            }
        }

        // Grants held by the entity as a user, group or role.
        let prefixes = [
            keys.grants_of(&user_grantee(id)),
            keys.grants_of(&group_grantee(id)),
            keys.grants_of(&role_grantee(id)),
            keys.sessions_of(id),
        ];

        // Role assignments held by the entity as a user.
        let prefix = keys.roles_of_user(id);
        let mut ops = Vec::new();
        for cell in self.sweep(ctx, &prefix).await? {
            if let Some(role) = cell.key.strip_prefix(&prefix).and_then(EntityId::parse) {
                ops.push(BatchOp::delete(keys.role_user(&role, id)));
            }
            ops.push(BatchOp::delete(cell.key));
        }
        self.apply(ctx, ops).await?;

        // Assignments of the entity as a role.
        let prefix = keys.users_of_role(id);
        let mut ops = Vec::new();
        for cell in self.sweep(ctx, &prefix).await? {
            if let Some(user) = cell.key.strip_prefix(&prefix).and_then(EntityId::parse) {
                ops.push(BatchOp::delete(keys.user_role(&user, id)));
                ops.push(BatchOp::delete(keys.session(&user, id)));
            }
            ops.push(BatchOp::delete(cell.key));
        }
        self.apply(ctx, ops).await?;

        for prefix in prefixes {
            let ops = self
                .sweep(ctx, &prefix)
                .await?
                .into_iter()
                .map(|cell| BatchOp::delete(cell.key))
                .collect();
            self.apply(ctx, ops).await?;
        }

        tracing::debug!(tenant_id = %ctx.tenant_id, entity_id = %id, "Entity indexes purged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::{Grantee, RoleKey};
    use canopy_core::schema::TYPE_USER;
    use canopy_core::{Principal, TenantId};
    use canopy_store::PageRequest;
    use serde_json::{json, Map};

    #[tokio::test]
    async fn delete_removes_memberships_and_connections() {
        let em = EntityManager::in_memory();
        let ctx = Context::system(TenantId::new());
        let folder = em.create(&ctx, "folder", Map::new()).await.unwrap();
        let note = em.create(&ctx, "note", Map::new()).await.unwrap();
        let other = em.create(&ctx, "note", Map::new()).await.unwrap();

        em.add_to_collection(&ctx, &folder.id, "notes", &note.id)
            .await
            .unwrap();
        em.connect(&ctx, &other.id, "cites", &note.id).await.unwrap();
        em.connect(&ctx, &note.id, "cites", &other.id).await.unwrap();

        let deleted = em.delete(&ctx, &note.id).await.unwrap();
        assert_eq!(deleted.id, note.id);

        let listed = em
            .list_collection(&ctx, &folder.id, "notes", &PageRequest::default())
            .await
            .unwrap();
        assert!(listed.items.is_empty());
        assert!(em
            .connection_verbs(&ctx, &other.id, Direction::Outgoing)
            .await
            .unwrap()
            .is_empty());
        assert!(em
            .connection_verbs(&ctx, &other.id, Direction::Incoming)
            .await
            .unwrap()
            .is_empty());
        assert!(em.get(&ctx, &note.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn deleting_twice_reports_not_found() {
        let em = EntityManager::in_memory();
        let ctx = Context::system(TenantId::new());
        let note = em.create(&ctx, "note", Map::new()).await.unwrap();
        em.delete(&ctx, &note.id).await.unwrap();
        assert!(em.delete(&ctx, &note.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_frees_alias_and_user_grants() {
        let em = EntityManager::in_memory();
        let ctx = Context::system(TenantId::new());
        let mut props = Map::new();
        props.insert("username".to_string(), json!("fred"));
        let fred = em.create(&ctx, TYPE_USER, props.clone()).await.unwrap();
        em.grant_user_permission(&ctx, &fred.id, "notes:*").await.unwrap();

        em.delete(&ctx, &fred.id).await.unwrap();

        let again = em.create(&ctx, TYPE_USER, props).await.unwrap();
        assert_ne!(again.id, fred.id);
        assert!(em
            .get_permissions(&ctx, &Grantee::User { id: fred.id })
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn deleting_role_revokes_it_from_users() {
        let em = EntityManager::in_memory();
        let ctx = Context::system(TenantId::new());
        em.create_role(&ctx, "admin", None, None).await.unwrap();
        em.grant_role_permission(&ctx, "admin", "*").await.unwrap();
        let mut props = Map::new();
        props.insert("username".to_string(), json!("fred"));
        let fred = em.create(&ctx, TYPE_USER, props).await.unwrap();
        let key = RoleKey::application("admin");
        em.add_user_to_role(&ctx, &fred.id, &key).await.unwrap();

        em.delete_role(&ctx, &key).await.unwrap();

        assert!(em.get_user_roles(&ctx, &fred.id).await.unwrap().is_empty());
        assert!(!em
            .is_authorized(&ctx, &Principal::User(fred.id), "notes:read")
            .await
            .unwrap());

        em.create_role(&ctx, "admin", None, None).await.unwrap();
        assert!(em.get_role_permissions(&ctx, "admin").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleting_group_deletes_its_roles() {
        let em = EntityManager::in_memory();
        let ctx = Context::system(TenantId::new());
        let mut props = Map::new();
        props.insert("path".to_string(), json!("ops"));
        let group = em.create(&ctx, TYPE_GROUP, props).await.unwrap();
        let role = em
            .create_group_role(&ctx, &group.id, "oncall", None)
            .await
            .unwrap();

        em.delete(&ctx, &group.id).await.unwrap();
        assert!(em.get(&ctx, &role.id).await.unwrap_err().is_not_found());
        assert!(em
            .get_role(&ctx, &RoleKey::group(group.id, "oncall"))
            .await
            .unwrap_err()
            .is_not_found());
    }
}
