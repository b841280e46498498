//! Storage key layout for one tenant.
//!
//! ```text
//! t/{tenant}/entity/{id}                              entity record (JSON)
//! t/{tenant}/alias/{type}/{alias}                     entity id
//! t/{tenant}/coll/{parent}/{name}/m/{seq}/{member}    member type (ordering)
//! t/{tenant}/coll/{parent}/{name}/i/{member}          ordering key suffix
//! t/{tenant}/memberof/{member}/{parent}/{name}        parent type
//! t/{tenant}/conn/out/{subject}/{verb}/{object}       connection record (JSON)
//! t/{tenant}/conn/in/{object}/{verb}/{subject}        subject type
//! t/{tenant}/perm/{grantee}/{permission}              ""
//! t/{tenant}/userrole/{user}/{role}                   ""
//! t/{tenant}/roleuser/{role}/{user}                   ""
//! t/{tenant}/session/{user}/{role}                    last activity (JSON timestamp)
//! ```
//!
//! `{grantee}` is `user/{id}`, `group/{id}` or `role/{id}`; `{role}` is the
//! role entity's id. Every name placed before another segment is checked to
//! contain no `/`.

use canopy_core::{Direction, EntityId, TenantId};

use crate::error::{GraphError, Result};

#[derive(Debug, Clone)]
pub struct Keys {
    root: String,
}

impl Keys {
    pub fn new(tenant_id: &TenantId) -> Self {
        Self {
            root: format!("t/{tenant_id}/"),
        }
    }

    // ── Entities and aliases ─────────────────────────────────────

    pub fn entity(&self, id: &EntityId) -> String {
        format!("{}entity/{id}", self.root)
    }

    pub fn alias(&self, entity_type: &str, alias: &str) -> String {
        format!(
            "{}alias/{entity_type}/{}",
            self.root,
            alias.to_lowercase()
        )
    }

    // ── Collections ──────────────────────────────────────────────

    /// Every collection owned by `parent`.
    pub fn collections_of(&self, parent: &EntityId) -> String {
        format!("{}coll/{parent}/", self.root)
    }

    pub fn collection_order_prefix(&self, parent: &EntityId, name: &str) -> String {
        format!("{}coll/{parent}/{name}/m/", self.root)
    }

    pub fn collection_order(
        &self,
        parent: &EntityId,
        name: &str,
        seq: &str,
        member: &EntityId,
    ) -> String {
        format!("{}{seq}/{member}", self.collection_order_prefix(parent, name))
    }

    pub fn collection_index(&self, parent: &EntityId, name: &str, member: &EntityId) -> String {
        format!("{}coll/{parent}/{name}/i/{member}", self.root)
    }

    pub fn member_of_prefix(&self, member: &EntityId) -> String {
        format!("{}memberof/{member}/", self.root)
    }

    pub fn member_of(&self, member: &EntityId, parent: &EntityId, name: &str) -> String {
        format!("{}{parent}/{name}", self.member_of_prefix(member))
    }

    // ── Connections ──────────────────────────────────────────────

    /// Every connection key of `entity` in `direction`.
    pub fn connections_of(&self, direction: Direction, entity: &EntityId) -> String {
        format!("{}conn/{}/{entity}/", self.root, direction.as_str())
    }

    pub fn connections_by_verb(
        &self,
        direction: Direction,
        entity: &EntityId,
        verb: &str,
    ) -> String {
        format!("{}{verb}/", self.connections_of(direction, entity))
    }

    pub fn connection(
        &self,
        direction: Direction,
        from: &EntityId,
        verb: &str,
        to: &EntityId,
    ) -> String {
        format!("{}{to}", self.connections_by_verb(direction, from, verb))
    }

    // ── Permissions and roles ────────────────────────────────────

    pub fn grants_of(&self, grantee: &str) -> String {
        format!("{}perm/{grantee}/", self.root)
    }

    pub fn grant(&self, grantee: &str, permission: &str) -> String {
        format!("{}{permission}", self.grants_of(grantee))
    }

    pub fn roles_of_user(&self, user: &EntityId) -> String {
        format!("{}userrole/{user}/", self.root)
    }

    pub fn user_role(&self, user: &EntityId, role: &EntityId) -> String {
        format!("{}{role}", self.roles_of_user(user))
    }

    pub fn users_of_role(&self, role: &EntityId) -> String {
        format!("{}roleuser/{role}/", self.root)
    }

    pub fn role_user(&self, role: &EntityId, user: &EntityId) -> String {
        format!("{}{user}", self.users_of_role(role))
    }

    pub fn sessions_of(&self, user: &EntityId) -> String {
        format!("{}session/{user}/", self.root)
    }

    pub fn session(&self, user: &EntityId, role: &EntityId) -> String {
        format!("{}{role}", self.sessions_of(user))
    }
}

/// Lower-case and check a collection name or verb used as a key segment.
pub fn segment(what: &'static str, raw: &str) -> Result<String> {
    let normalized = raw.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(GraphError::InvalidName {
            what,
            value: raw.to_string(),
            reason: "must not be empty",
        });
    }
    if normalized.contains('/') {
        return Err(GraphError::InvalidName {
            what,
            value: raw.to_string(),
            reason: "must not contain '/'",
        });
    }
    Ok(normalized)
}

/// Split the tail of a key (after its prefix) into an id and the rest.
pub fn split_id(tail: &str) -> Option<(EntityId, &str)> {
    let (id, rest) = match tail.split_once('/') {
        Some((id, rest)) => (id, rest),
        None => (tail, ""),
    };
    EntityId::parse(id).map(|id| (id, rest))
}
