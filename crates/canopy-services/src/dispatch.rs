//! Request dispatch: resolve the path, authorize, execute.
//!
//! Path forms, with the resource type each is authorized against:
//!
//! | path                                 | target                          | resource     |
//! |--------------------------------------|---------------------------------|--------------|
//! | `[coll]`                             | root collection                 | `coll`       |
//! | `[coll, id\|alias]`                  | one entity                      | `coll`       |
//! | `[coll, id, sub]` (declared)         | nested collection               | `sub`        |
//! | `[coll, id, verb]`                   | outgoing connections            | `coll`       |
//! | `[coll, id, sub, id\|alias]`         | collection member               | `sub`        |
//! | `[coll, id, verb, id]`               | connection target               | `coll`       |
//! | `[coll, id, "connecting", verb]`     | incoming connections            | `coll`       |

use serde_json::{Map, Value};
use uuid::Uuid;

use canopy_core::inflection::{pluralize, singularize};
use canopy_core::permission::required_permission;
use canopy_core::schema::{TYPE_APPLICATION, TYPE_GROUP, TYPE_ROLE};
use canopy_core::{Context, Direction, Entity, EntityId};
use canopy_graph::roles::{PROPERTY_INACTIVITY, PROPERTY_TITLE};
use canopy_graph::{EntityManager, GraphError};

use crate::error::{Result, ServiceError};
use crate::request::{RequestState, ServiceAction, ServiceParameter, ServicePayload, ServiceRequest};
use crate::results::ServiceResults;

/// Path segment that switches a connection path to the incoming side.
pub const CONNECTING: &str = "connecting";

// ── Resolution ────────────────────────────────────────────────────

/// What a request path addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Root,
    Entity {
        key: ServiceParameter,
    },
    Collection {
        parent: ServiceParameter,
        name: String,
    },
    Connections {
        subject: ServiceParameter,
        verb: String,
    },
    Member {
        parent: ServiceParameter,
        name: String,
        member: ServiceParameter,
    },
    Connected {
        subject: ServiceParameter,
        verb: String,
        object: ServiceParameter,
    },
    Incoming {
        object: ServiceParameter,
        verb: String,
    },
}

/// A resolved path: the root collection, its member type, the resource
/// type permissions are checked against, and the addressed target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub collection: String,
    pub entity_type: String,
    pub resource_type: String,
    pub target: Target,
}

/// Per-element create behaviour for create actions.
enum Creation<'a> {
    Member {
        parent: EntityId,
        collection: &'a str,
        entity_type: String,
    },
    Role,
    GroupRole {
        group: EntityId,
    },
    Connected {
        subject: EntityId,
        verb: &'a str,
    },
}

// ── ServiceManager ────────────────────────────────────────────────

/// Runs service requests against the entity graph.
///
/// Clone is cheap (the entity manager shares its state).
#[derive(Clone)]
pub struct ServiceManager {
    entities: EntityManager,
}

impl ServiceManager {
    pub fn new(entities: EntityManager) -> Self {
        Self { entities }
    }

    pub fn entities(&self) -> &EntityManager {
        &self.entities
    }

    /// Dispatch one request as `ctx.principal`.
    ///
    /// Authorization failures end the request in `Denied` before any
    /// mutation. Batch creates isolate per-element failures in the result's
    /// outcomes; every other failure is returned as the error.
    pub async fn dispatch(&self, ctx: &Context, request: ServiceRequest) -> Result<ServiceResults> {
        let request_id = Uuid::new_v4();
        let action = request.action;
        let path = request.path_string();
        tracing::debug!(
            request_id = %request_id,
            tenant_id = %ctx.tenant_id,
            principal = %ctx.principal,
            method = action.method(),
            action = %action,
            path = %path,
            elements = request.payload.len(),
            "Request received"
        );

        let mut state = RequestState::Received;
        let result = self.run(ctx, request, &mut state).await;
        let end = match &result {
            Ok(_) => RequestState::Completed,
            Err(e) => e.terminal_state(),
        };
        state.advance(end)?;

        match &result {
            Ok(results) => tracing::info!(
                request_id = %request_id,
                tenant_id = %ctx.tenant_id,
                action = %action,
                path = %path,
                entities = results.entities.len(),
                failures = results.failures,
                cancelled = results.cancelled,
                "Request completed"
            ),
            Err(ServiceError::AuthorizationDenied { permission, .. }) => tracing::warn!(
                request_id = %request_id,
                tenant_id = %ctx.tenant_id,
                principal = %ctx.principal,
                action = %action,
                path = %path,
                permission = %permission,
                "Request denied"
            ),
            Err(e) => tracing::warn!(
                request_id = %request_id,
                tenant_id = %ctx.tenant_id,
                action = %action,
                path = %path,
                error = %e,
                "Request failed"
            ),
        }
        result
    }

    async fn run(
        &self,
        ctx: &Context,
        request: ServiceRequest,
        state: &mut RequestState,
    ) -> Result<ServiceResults> {
        let resource = self.resolve(&request.path)?;

        state.advance(RequestState::Authorizing)?;
        let mut required = vec![required_permission(
            &resource.resource_type,
            request.action.permission(),
        )];
        required.extend(created_type_permissions(&resource, &request));
        for permission in required {
            if !self
                .entities
                .is_authorized(ctx, &ctx.principal, &permission)
                .await?
            {
                return Err(ServiceError::AuthorizationDenied {
                    principal: ctx.principal.to_string(),
                    permission,
                });
            }
        }
        state.advance(RequestState::Authorized)?;

        if ctx.cancel.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }
        state.advance(RequestState::Executing)?;
        self.execute(ctx, &resource, request).await
    }

    /// Map a path onto a [`Resource`]. Pure apart from schema lookups.
    pub fn resolve(&self, path: &[ServiceParameter]) -> Result<Resource> {
        let unknown = || ServiceError::UnknownResource {
            path: path
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("/"),
        };

        let Some(ServiceParameter::Name(first)) = path.first() else {
            return Err(unknown());
        };
        if first.is_empty() {
            return Err(unknown());
        }
        let collection = pluralize(first);
        let entity_type = singularize(&collection);
        let schema = self.entities.schema(&entity_type);

        let name_at = |i: usize| -> Result<String> {
            match path.get(i) {
                Some(ServiceParameter::Name(name)) if !name.is_empty() => {
                    Ok(name.to_ascii_lowercase())
                }
                _ => Err(unknown()),
            }
        };

        let (resource_type, target) = match path.len() {
            1 => (collection.clone(), Target::Root),
            2 => (
                collection.clone(),
                Target::Entity {
                    key: path[1].clone(),
                },
            ),
            3 => {
                let sub = name_at(2)?;
                if schema.has_collection(&sub) {
                    (
                        sub.clone(),
                        Target::Collection {
                            parent: path[1].clone(),
                            name: sub,
                        },
                    )
                } else {
                    (
                        collection.clone(),
                        Target::Connections {
                            subject: path[1].clone(),
                            verb: sub,
                        },
                    )
                }
            }
            4 => {
                let sub = name_at(2)?;
                if sub == CONNECTING {
                    (
                        collection.clone(),
                        Target::Incoming {
                            object: path[1].clone(),
                            verb: name_at(3)?,
                        },
                    )
                } else if schema.has_collection(&sub) {
                    (
                        sub.clone(),
                        Target::Member {
                            parent: path[1].clone(),
                            name: sub,
                            member: path[3].clone(),
                        },
                    )
                } else {
                    (
                        collection.clone(),
                        Target::Connected {
                            subject: path[1].clone(),
                            verb: sub,
                            object: path[3].clone(),
                        },
                    )
                }
            }
            _ => return Err(unknown()),
        };

        Ok(Resource {
            collection,
            entity_type,
            resource_type,
            target,
        })
    }

    // ── Execution ────────────────────────────────────────────────

    async fn execute(
        &self,
        ctx: &Context,
        resource: &Resource,
        request: ServiceRequest,
    ) -> Result<ServiceResults> {
        use ServiceAction::*;

        let em = &self.entities;
        let page = request.page();
        let action = request.action;
        let path = request.path_string();
        let unsupported = || {
            ServiceError::bad_request(format!("{} is not supported on /{path}", action.method()))
        };

        match (&resource.target, action) {
            (Target::Root, Create) => {
                let creation = if resource.entity_type == TYPE_ROLE {
                    Creation::Role
                } else {
                    let app = em.ensure_application(ctx).await?;
                    Creation::Member {
                        parent: app.id,
                        collection: &resource.collection,
                        entity_type: resource.entity_type.clone(),
                    }
                };
                self.create_all(ctx, &creation, request.payload).await
            }
            (Target::Root, Read | List) => {
                let app = ctx.tenant_id.application_id();
                let listed = em
                    .list_collection(ctx, &app, &resource.collection, &page)
                    .await?;
                Ok(ServiceResults::listing(listed.items, listed.cursor))
            }

            (Target::Entity { key }, Read) => {
                let entity = self.lookup(ctx, &resource.entity_type, key).await?;
                Ok(ServiceResults::single(entity))
            }
            (Target::Entity { key }, Update) => {
                let delta = single_payload(request.payload)?;
                let entity = self.lookup(ctx, &resource.entity_type, key).await?;
                Ok(ServiceResults::single(em.update(ctx, &entity.id, &delta).await?))
            }
            (Target::Entity { key }, Delete) => {
                let entity = self.lookup(ctx, &resource.entity_type, key).await?;
                Ok(ServiceResults::single(em.delete(ctx, &entity.id).await?))
            }

            (Target::Collection { parent, name }, Create) => {
                let parent = self.lookup(ctx, &resource.entity_type, parent).await?;
                let creation = if parent.entity_type == TYPE_GROUP && singularize(name) == TYPE_ROLE {
                    Creation::GroupRole { group: parent.id }
                } else {
                    Creation::Member {
                        parent: parent.id,
                        collection: name,
                        entity_type: singularize(name),
                    }
                };
                self.create_all(ctx, &creation, request.payload).await
            }
            (Target::Collection { parent, name }, Read | List) => {
                let parent = self.lookup(ctx, &resource.entity_type, parent).await?;
                let listed = em.list_collection(ctx, &parent.id, name, &page).await?;
                Ok(ServiceResults::listing(listed.items, listed.cursor))
            }

            (Target::Connections { subject, verb }, Create) => {
                let subject = self.lookup(ctx, &resource.entity_type, subject).await?;
                let creation = Creation::Connected {
                    subject: subject.id,
                    verb,
                };
                self.create_all(ctx, &creation, request.payload).await
            }
            (Target::Connections { subject, verb }, Read | List) => {
                let subject = self.lookup(ctx, &resource.entity_type, subject).await?;
                let listed = em
                    .list_connections(ctx, &subject.id, verb, Direction::Outgoing, &page)
                    .await?;
                Ok(ServiceResults::listing(listed.items, listed.cursor))
            }

            (Target::Member { parent, name, member }, _) => {
                let parent = self.lookup(ctx, &resource.entity_type, parent).await?;
                let member = self.lookup_member(ctx, name, member).await?;
                match action {
                    Create => {
                        em.add_to_collection(ctx, &parent.id, name, &member.id)
                            .await?;
                        Ok(ServiceResults::single(member))
                    }
                    Delete => {
                        em.remove_from_collection(ctx, &parent.id, name, &member.id)
                            .await?;
                        Ok(ServiceResults::single(member))
                    }
                    Read | Update => {
                        if !em
                            .is_collection_member(ctx, &parent.id, name, &member.id)
                            .await?
                        {
                            return Err(GraphError::not_found(
                                format!("{name} member"),
                                member.id,
                            )
                            .into());
                        }
                        if action == Read {
                            return Ok(ServiceResults::single(member));
                        }
                        let delta = single_payload(request.payload)?;
                        Ok(ServiceResults::single(em.update(ctx, &member.id, &delta).await?))
                    }
                    List => Err(unsupported()),
                }
            }

            (Target::Connected { subject, verb, object }, Create | Read | Delete) => {
                let subject = self.lookup(ctx, &resource.entity_type, subject).await?;
                let Some(object_id) = object.id() else {
                    return Err(ServiceError::bad_request(
                        "connection targets are addressed by id",
                    ));
                };
                let object = em.get(ctx, object_id).await?;
                match action {
                    Create => {
                        em.connect(ctx, &subject.id, verb, &object.id).await?;
                    }
                    Delete => {
                        em.disconnect(ctx, &subject.id, verb, &object.id).await?;
                    }
                    _ => {
                        if em
                            .get_connection(ctx, &subject.id, verb, &object.id)
                            .await?
                            .is_none()
                        {
                            return Err(GraphError::not_found(
                                "connection",
                                format!("{}/{verb}/{}", subject.id, object.id),
                            )
                            .into());
                        }
                    }
                }
                Ok(ServiceResults::single(object))
            }

            (Target::Incoming { object, verb }, Read | List) => {
                let object = self.lookup(ctx, &resource.entity_type, object).await?;
                let listed = em
                    .list_connections(ctx, &object.id, verb, Direction::Incoming, &page)
                    .await?;
                Ok(ServiceResults::listing(listed.items, listed.cursor))
            }

            _ => Err(unsupported()),
        }
    }

    /// Run `creation` once per payload element.
    ///
    /// A single payload fails the request on error. A batch records each
    /// element's outcome and checks for cancellation between elements.
    async fn create_all(
        &self,
        ctx: &Context,
        creation: &Creation<'_>,
        payload: ServicePayload,
    ) -> Result<ServiceResults> {
        let mut results = ServiceResults::default();
        match payload {
            ServicePayload::None => Err(ServiceError::bad_request("create requires a payload")),
            ServicePayload::Single(properties) => {
                let entity = self.create_one(ctx, creation, properties).await?;
                results.record_success(0, entity);
                Ok(results)
            }
            ServicePayload::Batch(elements) => {
                let total = elements.len();
                for (index, properties) in elements.into_iter().enumerate() {
                    if index > 0 && ctx.cancel.is_cancelled() {
                        results.cancelled = true;
                        tracing::info!(
                            tenant_id = %ctx.tenant_id,
                            completed = index,
                            total,
                            "Batch cancelled"
                        );
                        break;
                    }
                    match self.create_one(ctx, creation, properties).await {
                        Ok(entity) => results.record_success(index, entity),
                        Err(e) => {
                            tracing::debug!(index, error = %e, "Batch element failed");
                            results.record_failure(index, e);
                        }
                    }
                }
                Ok(results)
            }
        }
    }

    async fn create_one(
        &self,
        ctx: &Context,
        creation: &Creation<'_>,
        properties: Map<String, Value>,
    ) -> Result<Entity> {
        let em = &self.entities;
        let entity = match creation {
            Creation::Member {
                parent,
                collection,
                entity_type,
            } => {
                em.create_in_collection(ctx, parent, collection, entity_type, properties)
                    .await?
            }
            Creation::Role => {
                let (name, title, inactivity) = role_fields(&properties)?;
                em.create_role(ctx, name, title, inactivity).await?
            }
            Creation::GroupRole { group } => {
                let (name, _, inactivity) = role_fields(&properties)?;
                em.create_group_role(ctx, group, name, inactivity).await?
            }
            Creation::Connected { subject, verb } => {
                let Some(entity_type) = properties.get("type").and_then(Value::as_str) else {
                    return Err(ServiceError::bad_request(
                        "connected entities need a \"type\" property",
                    ));
                };
                let entity_type = entity_type.trim().to_lowercase();
                if entity_type == TYPE_ROLE || entity_type == TYPE_APPLICATION {
                    return Err(ServiceError::bad_request(format!(
                        "{entity_type} entities cannot be created through a connection"
                    )));
                }
                let object = em.create(ctx, &entity_type, properties).await?;
                if let Err(e) = em.connect(ctx, subject, verb, &object.id).await {
                    if let Err(undo) = em.delete(ctx, &object.id).await {
                        tracing::warn!(
                            entity_id = %object.id,
                            error = %undo,
                            "Could not delete entity after failed connect"
                        );
                    }
                    return Err(e.into());
                }
                object
            }
        };
        Ok(entity)
    }

    async fn lookup(
        &self,
        ctx: &Context,
        entity_type: &str,
        key: &ServiceParameter,
    ) -> Result<Entity> {
        let entity = match key {
            ServiceParameter::Id(id) => self.entities.get_typed(ctx, entity_type, id).await?,
            ServiceParameter::Name(alias) => {
                self.entities.get_by_alias(ctx, entity_type, alias).await?
            }
        };
        Ok(entity)
    }

    /// Members are addressed by id, or by alias of the collection's type.
    async fn lookup_member(
        &self,
        ctx: &Context,
        collection: &str,
        key: &ServiceParameter,
    ) -> Result<Entity> {
        let entity = match key {
            ServiceParameter::Id(id) => self.entities.get(ctx, id).await?,
            ServiceParameter::Name(alias) => {
                self.entities
                    .get_by_alias(ctx, &singularize(collection), alias)
                    .await?
            }
        };
        Ok(entity)
    }
}

/// Creating through a connection path also creates entities of the
/// payload's `type`s, each needing `{types}:create`.
fn created_type_permissions(resource: &Resource, request: &ServiceRequest) -> Vec<String> {
    if request.action != ServiceAction::Create
        || !matches!(resource.target, Target::Connections { .. })
    {
        return Vec::new();
    }
    let elements: Vec<&Map<String, Value>> = match &request.payload {
        ServicePayload::None => Vec::new(),
        ServicePayload::Single(map) => vec![map],
        ServicePayload::Batch(maps) => maps.iter().collect(),
    };
    let mut permissions: Vec<String> = elements
        .into_iter()
        .filter_map(|map| map.get("type").and_then(Value::as_str))
        .map(|entity_type| {
            let resource = pluralize(&entity_type.trim().to_lowercase());
            required_permission(&resource, ServiceAction::Create.permission())
        })
        .collect();
    permissions.sort();
    permissions.dedup();
    permissions
}

fn single_payload(payload: ServicePayload) -> Result<Map<String, Value>> {
    match payload {
        ServicePayload::Single(map) => Ok(map),
        ServicePayload::None => Err(ServiceError::bad_request("update requires a payload")),
        ServicePayload::Batch(_) => Err(ServiceError::bad_request(
            "update takes a single property map",
        )),
    }
}

fn role_fields(properties: &Map<String, Value>) -> Result<(&str, Option<&str>, Option<u64>)> {
    let name = properties
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::bad_request("roles need a \"name\""))?;
    let title = properties.get(PROPERTY_TITLE).and_then(Value::as_str);
    let inactivity = match properties.get(PROPERTY_INACTIVITY) {
        None | Some(Value::Null) => None,
        Some(value) => Some(value.as_u64().ok_or_else(|| {
            ServiceError::bad_request("role inactivity must be a whole number of seconds")
        })?),
    };
    Ok((name, title, inactivity))
}
