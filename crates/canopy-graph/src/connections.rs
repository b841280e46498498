//! Typed, directed connections between entities.
//!
//! The outgoing key carries the connection record; the incoming key is a
//! reverse index. `connect` writes the reverse index first and `disconnect`
//! removes it last. An incoming key whose outgoing record is missing was
//! left by an interrupted write; incoming listings skip and prune it.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use canopy_core::{Connection, Context, Direction, Entity, EntityId, EntityRef};
use canopy_store::client::encode;
use canopy_store::{BatchOp, Page, PageRequest};

use crate::error::{GraphError, Result};
use crate::keys::segment;
use crate::manager::EntityManager;
use crate::paging::Pager;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConnectionRecord {
    subject_type: String,
    object_type: String,
    created: DateTime<Utc>,
}

impl EntityManager {
    /// Connect `subject` to `object` by `verb`. Re-connecting returns the
    /// existing connection unchanged.
    pub async fn connect(
        &self,
        ctx: &Context,
        subject: &EntityId,
        verb: &str,
        object: &EntityId,
    ) -> Result<Connection> {
        let verb = segment("verb", verb)?;
        let subject_entity = self.get(ctx, subject).await?;
        let object_entity = self.get(ctx, object).await?;

        if subject == object
            && !self
                .schema(&subject_entity.entity_type)
                .self_connections
                .allows(&verb)
        {
            return Err(GraphError::SelfConnection {
                entity_type: subject_entity.entity_type,
                verb,
                id: *subject,
            });
        }

        let keys = self.keys(ctx);
        let in_key = keys.connection(Direction::Incoming, object, &verb, subject);
        self.store()
            .put(&in_key, subject_entity.entity_type.clone(), ctx.timeout)
            .await?;

        let out_key = keys.connection(Direction::Outgoing, subject, &verb, object);
        let fresh = ConnectionRecord {
            subject_type: subject_entity.entity_type.clone(),
            object_type: object_entity.entity_type.clone(),
            created: self.now(),
        };
        let record = if self
            .store()
            .insert_if_absent(&out_key, encode(&fresh)?, ctx.timeout)
            .await?
        {
            // Restore the reverse index if a listing pruned it in between.
            self.store()
                .put(&in_key, subject_entity.entity_type.clone(), ctx.timeout)
                .await?;
            tracing::debug!(
                tenant_id = %ctx.tenant_id,
                subject = %subject,
                verb = %verb,
                object = %object,
                "Connected"
            );
            fresh
        } else {
            self.store()
                .get_json::<ConnectionRecord>(&out_key, ctx.timeout)
                .await?
                .unwrap_or(fresh)
        };

        Ok(Connection {
            subject: EntityRef::new(*subject, record.subject_type),
            verb,
            object: EntityRef::new(*object, record.object_type),
            created: record.created,
        })
    }

    /// Remove the connection if present.
    pub async fn disconnect(
        &self,
        ctx: &Context,
        subject: &EntityId,
        verb: &str,
        object: &EntityId,
    ) -> Result<()> {
        let verb = segment("verb", verb)?;
        self.drop_connection(ctx, Direction::Outgoing, subject, &verb, object)
            .await?;
        tracing::debug!(
            tenant_id = %ctx.tenant_id,
            subject = %subject,
            verb = %verb,
            object = %object,
            "Disconnected"
        );
        Ok(())
    }

    /// Delete both keys of the connection between `from` and `to`, where
    /// `from` sits on the `direction` side.
    pub(crate) async fn drop_connection(
        &self,
        ctx: &Context,
        direction: Direction,
        from: &EntityId,
        verb: &str,
        to: &EntityId,
    ) -> Result<()> {
        let keys = self.keys(ctx);
        let (out_key, in_key) = match direction {
            Direction::Outgoing => (
                keys.connection(Direction::Outgoing, from, verb, to),
                keys.connection(Direction::Incoming, to, verb, from),
            ),
            Direction::Incoming => (
                keys.connection(Direction::Outgoing, to, verb, from),
                keys.connection(Direction::Incoming, from, verb, to),
            ),
        };
        self.apply(ctx, vec![BatchOp::delete(out_key), BatchOp::delete(in_key)])
            .await
    }

    pub async fn get_connection(
        &self,
        ctx: &Context,
        subject: &EntityId,
        verb: &str,
        object: &EntityId,
    ) -> Result<Option<Connection>> {
        let verb = segment("verb", verb)?;
        let key = self
            .keys(ctx)
            .connection(Direction::Outgoing, subject, &verb, object);
        let record: Option<ConnectionRecord> = self.store().get_json(&key, ctx.timeout).await?;
        Ok(record.map(|record| Connection {
            subject: EntityRef::new(*subject, record.subject_type),
            verb,
            object: EntityRef::new(*object, record.object_type),
            created: record.created,
        }))
    }

    /// One page of the entities connected to `entity` by `verb`.
    ///
    /// `Outgoing` lists objects of `entity`; `Incoming` lists subjects that
    /// point at it. Entries are ordered by the other endpoint's id. Entries
    /// whose other endpoint no longer exists are pruned and skipped.
    pub async fn list_connections(
        &self,
        ctx: &Context,
        entity: &EntityId,
        verb: &str,
        direction: Direction,
        page: &PageRequest,
    ) -> Result<Page<Entity>> {
        let verb = segment("verb", verb)?;
        let keys = self.keys(ctx);
        let mut pager = Pager::new(
            self,
            keys.connections_by_verb(direction, entity, &verb),
            format!(
                "{}|conn|{}|{entity}|{verb}",
                ctx.tenant_id,
                direction.as_str()
            ),
            page,
        )?;

        let mut items = Vec::new();
        while pager.wants(items.len()) {
            for cell in pager.next_batch(self, ctx, items.len()).await? {
                let Some(other) = cell
                    .key
                    .strip_prefix(pager.prefix())
                    .and_then(EntityId::parse)
                else {
                    tracing::warn!(key = %cell.key, "Skipping malformed connection key");
                    continue;
                };
                match self.get_optional(ctx, &other).await? {
                    Some(found) => {
                        if matches!(direction, Direction::Incoming)
                            && !self
                                .incoming_is_backed(ctx, &other, &verb, entity, &cell.value)
                                .await?
                        {
                            continue;
                        }
                        items.push(found);
                    }
                    None => {
                        self.drop_connection(ctx, direction, entity, &verb, &other)
                            .await?;
                        tracing::warn!(
                            tenant_id = %ctx.tenant_id,
                            entity = %entity,
                            verb = %verb,
                            missing = %other,
                            "Pruned hanging connection"
                        );
                    }
                }
            }
        }

        pager.finish(self, ctx, items).await
    }

    /// Whether the incoming key `object <- verb - subject` has its outgoing
    /// record. Unbacked keys are deleted; the outgoing key is read again
    /// afterwards so a connect landing in between keeps its reverse index.
    async fn incoming_is_backed(
        &self,
        ctx: &Context,
        subject: &EntityId,
        verb: &str,
        object: &EntityId,
        subject_type: &str,
    ) -> Result<bool> {
        let keys = self.keys(ctx);
        let store = self.store();
        let out_key = keys.connection(Direction::Outgoing, subject, verb, object);
        if store.get(&out_key, ctx.timeout).await?.is_some() {
            return Ok(true);
        }

        let in_key = keys.connection(Direction::Incoming, object, verb, subject);
        store.delete(&in_key, ctx.timeout).await?;
        if store.get(&out_key, ctx.timeout).await?.is_some() {
            store
                .put(&in_key, subject_type.to_string(), ctx.timeout)
                .await?;
            return Ok(true);
        }

        tracing::warn!(
            tenant_id = %ctx.tenant_id,
            subject = %subject,
            verb = %verb,
            object = %object,
            "Pruned incoming connection without outgoing record"
        );
        Ok(false)
    }

    /// The distinct verbs `entity` uses in `direction`, sorted.
    pub async fn connection_verbs(
        &self,
        ctx: &Context,
        entity: &EntityId,
        direction: Direction,
    ) -> Result<Vec<String>> {
        let prefix = self.keys(ctx).connections_of(direction, entity);
        let verbs: BTreeSet<String> = self
            .sweep(ctx, &prefix)
            .await?
            .iter()
            .filter_map(|cell| {
                let tail = cell.key.strip_prefix(&prefix)?;
                let (verb, _) = tail.split_once('/')?;
                Some(verb.to_string())
            })
            .collect();
        Ok(verbs.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::schema::TYPE_USER;
    use canopy_core::TenantId;
    use serde_json::{json, Map, Value};

    fn props(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let em = EntityManager::in_memory();
        let ctx = Context::system(TenantId::new());
        let a = em.create(&ctx, "note", Map::new()).await.unwrap();
        let b = em.create(&ctx, "note", Map::new()).await.unwrap();

        let first = em.connect(&ctx, &a.id, "likes", &b.id).await.unwrap();
        let second = em.connect(&ctx, &a.id, "Likes", &b.id).await.unwrap();
        assert_eq!(first, second);

        let out = em
            .list_connections(&ctx, &a.id, "likes", Direction::Outgoing, &PageRequest::default())
            .await
            .unwrap();
        assert_eq!(out.items.len(), 1);
        assert_eq!(out.items[0].id, b.id);

        let incoming = em
            .list_connections(&ctx, &b.id, "likes", Direction::Incoming, &PageRequest::default())
            .await
            .unwrap();
        assert_eq!(incoming.items.len(), 1);
        assert_eq!(incoming.items[0].id, a.id);
    }

    #[tokio::test]
    async fn several_verbs_between_one_pair() {
        let em = EntityManager::in_memory();
        let ctx = Context::system(TenantId::new());
        let a = em.create(&ctx, "note", Map::new()).await.unwrap();
        let b = em.create(&ctx, "note", Map::new()).await.unwrap();
        em.connect(&ctx, &a.id, "likes", &b.id).await.unwrap();
        em.connect(&ctx, &a.id, "cites", &b.id).await.unwrap();

        assert_eq!(
            em.connection_verbs(&ctx, &a.id, Direction::Outgoing)
                .await
                .unwrap(),
            vec!["cites".to_string(), "likes".to_string()]
        );

        em.disconnect(&ctx, &a.id, "likes", &b.id).await.unwrap();
        em.disconnect(&ctx, &a.id, "likes", &b.id).await.unwrap();
        assert!(em
            .get_connection(&ctx, &a.id, "likes", &b.id)
            .await
            .unwrap()
            .is_none());
        assert!(em
            .get_connection(&ctx, &a.id, "cites", &b.id)
            .await
            .unwrap()
            .is_some());
        assert_eq!(
            em.connection_verbs(&ctx, &b.id, Direction::Incoming)
                .await
                .unwrap(),
            vec!["cites".to_string()]
        );
    }

    #[tokio::test]
    async fn self_connection_follows_type_policy() {
        let em = EntityManager::in_memory();
        let ctx = Context::system(TenantId::new());
        let user = em
            .create(&ctx, TYPE_USER, props(json!({"username": "narcissus"})))
            .await
            .unwrap();

        let err = em
            .connect(&ctx, &user.id, "following", &user.id)
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::SelfConnection { .. }));

        em.connect(&ctx, &user.id, "likes", &user.id).await.unwrap();

        let note = em.create(&ctx, "note", Map::new()).await.unwrap();
        em.connect(&ctx, &note.id, "following", &note.id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn connections_page_with_cursor() {
        let em = EntityManager::in_memory();
        let ctx = Context::system(TenantId::new());
        let hub = em.create(&ctx, "note", Map::new()).await.unwrap();
        for _ in 0..3 {
            let spoke = em.create(&ctx, "note", Map::new()).await.unwrap();
            em.connect(&ctx, &hub.id, "links", &spoke.id).await.unwrap();
        }

        let first = em
            .list_connections(&ctx, &hub.id, "links", Direction::Outgoing, &PageRequest::first(2))
            .await
            .unwrap();
        assert_eq!(first.items.len(), 2);
        let rest = em
            .list_connections(
                &ctx,
                &hub.id,
                "links",
                Direction::Outgoing,
                &PageRequest::after(2, first.cursor.unwrap()),
            )
            .await
            .unwrap();
        assert_eq!(rest.items.len(), 1);
        assert!(rest.cursor.is_none());
    }
}
