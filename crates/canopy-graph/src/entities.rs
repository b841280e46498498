//! Entity create, read, update, and alias resolution.
//!
//! A new record is written before its alias is claimed, and deletion
//! removes the record before the alias. An alias that points at a missing
//! record therefore always belongs to a deleted entity and may be reclaimed.

use serde_json::{Map, Value};

use canopy_core::schema::TYPE_APPLICATION;
use canopy_core::{Context, Entity, EntityId, EntityRef, EntitySchema};
use canopy_store::client::{decode, encode};

use crate::error::{GraphError, Result};
use crate::manager::EntityManager;

/// Role property naming the owning group of a group-scoped role.
pub const PROPERTY_GROUP: &str = "group";

/// The alias an entity is registered under, if its type carries one.
///
/// Group-scoped roles are aliased as `{group}/{name}` so that two groups can
/// each own a role of the same name.
pub fn alias_of(entity: &Entity, schema: &EntitySchema) -> Option<String> {
    let alias = entity.alias_value(schema)?;
    if schema.facets.role {
        if let Some(group) = entity.get_str(PROPERTY_GROUP) {
            return Some(format!("{group}/{alias}"));
        }
    }
    Some(alias)
}

impl EntityManager {
    // ── Create ───────────────────────────────────────────────────

    /// Validate and store a new entity of `entity_type`.
    pub async fn create(
        &self,
        ctx: &Context,
        entity_type: &str,
        properties: Map<String, Value>,
    ) -> Result<Entity> {
        let schema = self.schema(entity_type);
        let entity = Entity::create(&schema, properties, self.now())?;
        self.insert(ctx, &schema, entity).await
    }

    pub(crate) async fn insert(
        &self,
        ctx: &Context,
        schema: &EntitySchema,
        entity: Entity,
    ) -> Result<Entity> {
        let keys = self.keys(ctx);
        let entity = entity.to_canonical(schema);
        let record_key = keys.entity(&entity.id);

        if !self
            .store()
            .insert_if_absent(&record_key, encode(&entity)?, ctx.timeout)
            .await?
        {
            return Err(GraphError::Duplicate {
                entity_type: entity.entity_type.clone(),
                alias: entity.id.to_string(),
            });
        }

        if let Some(alias) = alias_of(&entity, schema) {
            if let Err(e) = self
                .claim_alias(ctx, &entity.entity_type, &alias, &entity.id)
                .await
            {
                self.store().delete(&record_key, ctx.timeout).await?;
                return Err(e);
            }
        }

        tracing::info!(
            tenant_id = %ctx.tenant_id,
            entity_id = %entity.id,
            entity_type = %entity.entity_type,
            "Entity created"
        );
        Ok(entity)
    }

    async fn claim_alias(
        &self,
        ctx: &Context,
        entity_type: &str,
        alias: &str,
        id: &EntityId,
    ) -> Result<()> {
        let key = self.keys(ctx).alias(entity_type, alias);
        let duplicate = || GraphError::Duplicate {
            entity_type: entity_type.to_string(),
            alias: alias.to_string(),
        };

        if self
            .store()
            .insert_if_absent(&key, id.to_string(), ctx.timeout)
            .await?
        {
            return Ok(());
        }

        let Some(current) = self.store().get(&key, ctx.timeout).await? else {
            return match self
                .store()
                .insert_if_absent(&key, id.to_string(), ctx.timeout)
                .await?
            {
                true => Ok(()),
                false => Err(duplicate()),
            };
        };

        if let Some(owner) = EntityId::parse(&current) {
            if owner == *id {
                return Ok(());
            }
            if self.exists(ctx, &owner).await? {
                return Err(duplicate());
            }
        }

        if self
            .store()
            .put_if(&key, Some(&current), id.to_string(), ctx.timeout)
            .await?
        {
            tracing::warn!(
                tenant_id = %ctx.tenant_id,
                entity_type,
                alias,
                previous = %current,
                "Reclaimed alias from missing entity"
            );
            Ok(())
        } else {
            Err(duplicate())
        }
    }

    /// The tenant's root `application` entity, created on first use.
    pub async fn ensure_application(&self, ctx: &Context) -> Result<Entity> {
        let id = ctx.tenant_id.application_id();
        if let Some(app) = self.get_optional(ctx, &id).await? {
            return Ok(app);
        }

        let schema = self.schema(TYPE_APPLICATION);
        let mut app = Entity::create(&schema, Map::new(), self.now())?;
        app.id = id;
        match self.insert(ctx, &schema, app).await {
            Ok(app) => Ok(app),
            Err(GraphError::Duplicate { .. }) => self.get(ctx, &id).await,
            Err(e) => Err(e),
        }
    }

    // ── Read ─────────────────────────────────────────────────────

    pub async fn get(&self, ctx: &Context, id: &EntityId) -> Result<Entity> {
        self.get_optional(ctx, id)
            .await?
            .ok_or_else(|| GraphError::not_found("entity", id))
    }

    pub async fn get_optional(&self, ctx: &Context, id: &EntityId) -> Result<Option<Entity>> {
        let key = self.keys(ctx).entity(id);
        Ok(self.store().get_json(&key, ctx.timeout).await?)
    }

    pub async fn exists(&self, ctx: &Context, id: &EntityId) -> Result<bool> {
        let key = self.keys(ctx).entity(id);
        Ok(self.store().get(&key, ctx.timeout).await?.is_some())
    }

    /// Get an entity and check it is of `entity_type`.
    pub async fn get_typed(
        &self,
        ctx: &Context,
        entity_type: &str,
        id: &EntityId,
    ) -> Result<Entity> {
        match self.get_optional(ctx, id).await? {
            Some(entity) if entity.entity_type == entity_type => Ok(entity),
            _ => Err(GraphError::not_found(entity_type, id)),
        }
    }

    /// Resolve an alias to the entity it names.
    pub async fn get_alias(
        &self,
        ctx: &Context,
        entity_type: &str,
        alias: &str,
    ) -> Result<EntityRef> {
        let entity = self.get_by_alias(ctx, entity_type, alias).await?;
        Ok(entity.entity_ref())
    }

    /// Load the entity an alias names.
    ///
    /// An alias left behind by an interrupted delete reads as not found and
    /// is reclaimed by the next create that wants it.
    pub async fn get_by_alias(
        &self,
        ctx: &Context,
        entity_type: &str,
        alias: &str,
    ) -> Result<Entity> {
        let key = self.keys(ctx).alias(entity_type, alias);
        let not_found = || GraphError::not_found(entity_type, alias);

        let Some(raw) = self.store().get(&key, ctx.timeout).await? else {
            return Err(not_found());
        };
        let Some(id) = EntityId::parse(&raw) else {
            return Err(GraphError::Serialization(format!(
                "alias {entity_type}/{alias} holds '{raw}'"
            )));
        };

        match self.get_optional(ctx, &id).await? {
            Some(entity) => Ok(entity),
            None => {
                tracing::debug!(
                    tenant_id = %ctx.tenant_id,
                    entity_type,
                    alias,
                    "Alias points at a missing entity"
                );
                Err(not_found())
            }
        }
    }

    /// Resolve a path identifier: a UUID, else an alias of `entity_type`.
    pub async fn resolve(&self, ctx: &Context, entity_type: &str, key: &str) -> Result<Entity> {
        match EntityId::parse(key) {
            Some(id) => self.get_typed(ctx, entity_type, &id).await,
            None => self.get_by_alias(ctx, entity_type, key).await,
        }
    }

    // ── Update ───────────────────────────────────────────────────

    /// Merge `delta` into the stored entity.
    ///
    /// Reads the record, applies the delta, and writes back only if the
    /// record is still the one read. Conflicts retry up to the configured
    /// limit and then fail with [`GraphError::ConcurrentModification`].
    pub async fn update(
        &self,
        ctx: &Context,
        id: &EntityId,
        delta: &Map<String, Value>,
    ) -> Result<Entity> {
        let key = self.keys(ctx).entity(id);
        let attempts = self.config().entities.max_update_retries.max(1);

        for attempt in 1..=attempts {
            let Some(raw) = self.store().get(&key, ctx.timeout).await? else {
                return Err(GraphError::not_found("entity", id));
            };
            let mut entity: Entity = decode(&raw)?;
            let schema = self.schema(&entity.entity_type);
            let changed = entity.apply_delta(&schema, delta, self.now())?;
            let entity = entity.to_canonical(&schema);

            if self
                .store()
                .put_if(&key, Some(&raw), encode(&entity)?, ctx.timeout)
                .await?
            {
                tracing::debug!(
                    tenant_id = %ctx.tenant_id,
                    entity_id = %id,
                    attempt,
                    changed = ?changed,
                    "Entity updated"
                );
                return Ok(entity);
            }
            tracing::debug!(entity_id = %id, attempt, "Update conflict, retrying");
        }

        tracing::warn!(
            tenant_id = %ctx.tenant_id,
            entity_id = %id,
            attempts,
            "Update retries exhausted"
        );
        Err(GraphError::ConcurrentModification { id: *id, attempts })
    }
}
