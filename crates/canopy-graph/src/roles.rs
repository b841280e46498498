//! Roles, permission grants, role assignment, and authorization.
//!
//! Grants are stored per grantee. A user's effective permissions are the
//! union of
//! - grants made to the user directly,
//! - grants of every group whose `users` collection holds the user,
//! - grants of every role assigned to the user whose session is still live,
//!   where a group-scoped role only counts while the user is in that group.
//!
//! A role with a non-zero `inactivity` expires for a user once that long has
//! passed since the user's last recorded activity in it. An expired role
//! grants nothing until [`EntityManager::activate_role`] or
//! [`EntityManager::touch_role`] records fresh activity. Every successful
//! authorization refreshes the sessions of the user's live roles.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use canopy_core::permission::{any_implies, normalize, PermissionPattern};
use canopy_core::schema::{TYPE_GROUP, TYPE_ROLE, TYPE_USER};
use canopy_core::{Context, Entity, EntityId, Principal};
use canopy_store::client::encode;
use canopy_store::BatchOp;

use crate::entities::PROPERTY_GROUP;
use crate::error::{GraphError, Result};
use crate::keys::segment;
use crate::manager::EntityManager;

pub const PROPERTY_TITLE: &str = "title";
pub const PROPERTY_INACTIVITY: &str = "inactivity";

/// Collection of the application (or a group) holding its roles.
pub const ROLES_COLLECTION: &str = "roles";
/// Collection of a group holding its members.
pub const USERS_COLLECTION: &str = "users";

// ── Role keys ─────────────────────────────────────────────────────

/// Identifies a role: application-wide by name, or scoped to a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum RoleKey {
    Application { name: String },
    Group { group: EntityId, name: String },
}

impl RoleKey {
    pub fn application(name: &str) -> Self {
        Self::Application {
            name: name.trim().to_lowercase(),
        }
    }

    pub fn group(group: EntityId, name: &str) -> Self {
        Self::Group {
            group,
            name: name.trim().to_lowercase(),
        }
    }

    /// The key of a stored role entity.
    pub fn of(role: &Entity) -> Option<Self> {
        let name = role.name.as_deref()?;
        match role.get_str(PROPERTY_GROUP).and_then(EntityId::parse) {
            Some(group) => Some(Self::group(group, name)),
            None => Some(Self::application(name)),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Application { name } | Self::Group { name, .. } => name,
        }
    }

    /// The alias the role entity is registered under.
    pub fn alias(&self) -> String {
        match self {
            Self::Application { name } => name.clone(),
            Self::Group { group, name } => format!("{group}/{name}"),
        }
    }
}

impl fmt::Display for RoleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.alias())
    }
}

/// Anything that can hold permission grants.
///
/// Role grants are stored under the role entity's id, so a role created
/// again under a deleted role's name starts without grants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Grantee {
    User { id: EntityId },
    Group { id: EntityId },
    Role { role: RoleKey },
}

pub(crate) fn user_grantee(id: &EntityId) -> String {
    format!("user/{id}")
}

pub(crate) fn group_grantee(id: &EntityId) -> String {
    format!("group/{id}")
}

pub(crate) fn role_grantee(id: &EntityId) -> String {
    format!("role/{id}")
}

impl fmt::Display for Grantee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User { id } => write!(f, "user {id}"),
            Self::Group { id } => write!(f, "group {id}"),
            Self::Role { role } => write!(f, "role {role}"),
        }
    }
}

fn inactivity_of(role: &Entity) -> u64 {
    role.properties
        .get(PROPERTY_INACTIVITY)
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

impl EntityManager {
    // ── Roles ────────────────────────────────────────────────────

    /// Create an application-wide role. `inactivity` defaults to the
    /// configured value; `0` never expires.
    pub async fn create_role(
        &self,
        ctx: &Context,
        name: &str,
        title: Option<&str>,
        inactivity: Option<u64>,
    ) -> Result<Entity> {
        let name = segment("role", name)?;
        let inactivity = inactivity.unwrap_or(self.config().auth.default_inactivity_secs);
        let props = role_properties(&name, title.unwrap_or(&name), inactivity, None);

        let app = self.ensure_application(ctx).await?;
        let role = self.create(ctx, TYPE_ROLE, props).await?;
        self.add_to_collection(ctx, &app.id, ROLES_COLLECTION, &role.id)
            .await?;

        tracing::info!(
            tenant_id = %ctx.tenant_id,
            role = %name,
            inactivity,
            "Role created"
        );
        Ok(role)
    }

    /// Create a role scoped to `group`.
    pub async fn create_group_role(
        &self,
        ctx: &Context,
        group: &EntityId,
        name: &str,
        inactivity: Option<u64>,
    ) -> Result<Entity> {
        let name = segment("role", name)?;
        self.get_typed(ctx, TYPE_GROUP, group).await?;
        let inactivity = inactivity.unwrap_or(self.config().auth.default_inactivity_secs);
        let props = role_properties(&name, &name, inactivity, Some(group));

        let role = self.create(ctx, TYPE_ROLE, props).await?;
        self.add_to_collection(ctx, group, ROLES_COLLECTION, &role.id)
            .await?;

        tracing::info!(
            tenant_id = %ctx.tenant_id,
            group = %group,
            role = %name,
            inactivity,
            "Group role created"
        );
        Ok(role)
    }

    pub async fn get_role(&self, ctx: &Context, role: &RoleKey) -> Result<Entity> {
        self.get_by_alias(ctx, TYPE_ROLE, &role.alias()).await
    }

    /// Delete a role with its grants, assignments and sessions.
    pub async fn delete_role(&self, ctx: &Context, role: &RoleKey) -> Result<Entity> {
        let entity = self.get_role(ctx, role).await?;
        self.delete(ctx, &entity.id).await
    }

    /// Titles of the named application roles. Unknown names are skipped.
    pub async fn get_roles_with_titles(
        &self,
        ctx: &Context,
        names: &[&str],
    ) -> Result<BTreeMap<String, String>> {
        let mut titles = BTreeMap::new();
        for name in names {
            let key = RoleKey::application(name);
            match self.get_role(ctx, &key).await {
                Ok(role) => {
                    let title = role
                        .get_str(PROPERTY_TITLE)
                        .unwrap_or(key.name())
                        .to_string();
                    titles.insert(key.name().to_string(), title);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(titles)
    }

    // ── Grants ───────────────────────────────────────────────────

    /// Grant `permission` to `grantee`. Granting twice is a no-op.
    pub async fn grant_permission(
        &self,
        ctx: &Context,
        grantee: &Grantee,
        permission: &str,
    ) -> Result<()> {
        let pattern = PermissionPattern::parse(permission)?;
        let holder = self.grantee_storage(ctx, grantee).await?;
        let key = self.keys(ctx).grant(&holder, pattern.as_str());
        self.store().put(&key, String::new(), ctx.timeout).await?;
        tracing::info!(
            tenant_id = %ctx.tenant_id,
            grantee = %grantee,
            permission = %pattern,
            "Permission granted"
        );
        Ok(())
    }

    /// Remove exactly this grant. Revoking an absent grant is a no-op.
    pub async fn revoke_permission(
        &self,
        ctx: &Context,
        grantee: &Grantee,
        permission: &str,
    ) -> Result<()> {
        let holder = match self.grantee_storage(ctx, grantee).await {
            Ok(holder) => holder,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let key = self.keys(ctx).grant(&holder, &normalize(permission));
        self.store().delete(&key, ctx.timeout).await?;
        tracing::info!(
            tenant_id = %ctx.tenant_id,
            grantee = %grantee,
            permission = %normalize(permission),
            "Permission revoked"
        );
        Ok(())
    }

    pub async fn get_permissions(
        &self,
        ctx: &Context,
        grantee: &Grantee,
    ) -> Result<BTreeSet<String>> {
        let holder = match grantee {
            Grantee::Role { role } => match self.get_role(ctx, role).await {
                Ok(entity) => role_grantee(&entity.id),
                Err(e) if e.is_not_found() => return Ok(BTreeSet::new()),
                Err(e) => return Err(e),
            },
            Grantee::User { id } => user_grantee(id),
            Grantee::Group { id } => group_grantee(id),
        };
        self.grants_held(ctx, &holder).await
    }

    async fn grants_held(&self, ctx: &Context, holder: &str) -> Result<BTreeSet<String>> {
        let prefix = self.keys(ctx).grants_of(holder);
        Ok(self
            .sweep(ctx, &prefix)
            .await?
            .into_iter()
            .filter_map(|cell| cell.key.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    pub async fn grant_role_permission(
        &self,
        ctx: &Context,
        role: &str,
        permission: &str,
    ) -> Result<()> {
        let grantee = Grantee::Role {
            role: RoleKey::application(role),
        };
        self.grant_permission(ctx, &grantee, permission).await
    }

    pub async fn grant_user_permission(
        &self,
        ctx: &Context,
        user: &EntityId,
        permission: &str,
    ) -> Result<()> {
        self.grant_permission(ctx, &Grantee::User { id: *user }, permission)
            .await
    }

    pub async fn grant_group_role_permission(
        &self,
        ctx: &Context,
        group: &EntityId,
        role: &str,
        permission: &str,
    ) -> Result<()> {
        let grantee = Grantee::Role {
            role: RoleKey::group(*group, role),
        };
        self.grant_permission(ctx, &grantee, permission).await
    }

    pub async fn get_role_permissions(&self, ctx: &Context, role: &str) -> Result<BTreeSet<String>> {
        let grantee = Grantee::Role {
            role: RoleKey::application(role),
        };
        self.get_permissions(ctx, &grantee).await
    }

    /// Key segment of an existing grantee.
    async fn grantee_storage(&self, ctx: &Context, grantee: &Grantee) -> Result<String> {
        match grantee {
            Grantee::User { id } => {
                self.get_typed(ctx, TYPE_USER, id).await?;
                Ok(user_grantee(id))
            }
            Grantee::Group { id } => {
                self.get_typed(ctx, TYPE_GROUP, id).await?;
                Ok(group_grantee(id))
            }
            Grantee::Role { role } => Ok(role_grantee(&self.get_role(ctx, role).await?.id)),
        }
    }

    // ── Assignment ───────────────────────────────────────────────

    /// Assign `role` to `user` and start a fresh session in it.
    pub async fn add_user_to_role(
        &self,
        ctx: &Context,
        user: &EntityId,
        role: &RoleKey,
    ) -> Result<()> {
        self.get_typed(ctx, TYPE_USER, user).await?;
        let rid = self.get_role(ctx, role).await?.id;

        let keys = self.keys(ctx);
        let now = self.now();
        self.store()
            .put(&keys.role_user(&rid, user), String::new(), ctx.timeout)
            .await?;
        self.apply(
            ctx,
            vec![
                BatchOp::put(keys.user_role(user, &rid), String::new()),
                BatchOp::put(keys.session(user, &rid), encode(&now)?),
            ],
        )
        .await?;

        tracing::debug!(
            tenant_id = %ctx.tenant_id,
            user = %user,
            role = %role,
            "User added to role"
        );
        Ok(())
    }

    pub async fn add_user_to_group_role(
        &self,
        ctx: &Context,
        user: &EntityId,
        group: &EntityId,
        role: &str,
    ) -> Result<()> {
        self.add_user_to_role(ctx, user, &RoleKey::group(*group, role))
            .await
    }

    pub async fn remove_user_from_role(
        &self,
        ctx: &Context,
        user: &EntityId,
        role: &RoleKey,
    ) -> Result<()> {
        let rid = match self.get_role(ctx, role).await {
            Ok(entity) => entity.id,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        self.drop_assignment(ctx, user, &rid).await?;
        tracing::debug!(
            tenant_id = %ctx.tenant_id,
            user = %user,
            role = %role,
            "User removed from role"
        );
        Ok(())
    }

    /// Forward keys go first, mirroring [`Self::add_user_to_role`].
    async fn drop_assignment(&self, ctx: &Context, user: &EntityId, role: &EntityId) -> Result<()> {
        let keys = self.keys(ctx);
        self.apply(
            ctx,
            vec![
                BatchOp::delete(keys.user_role(user, role)),
                BatchOp::delete(keys.session(user, role)),
            ],
        )
        .await?;
        self.store()
            .delete(&keys.role_user(role, user), ctx.timeout)
            .await?;
        Ok(())
    }

    /// Roles assigned to `user`. Assignments to deleted roles are pruned.
    pub async fn get_user_roles(&self, ctx: &Context, user: &EntityId) -> Result<Vec<Entity>> {
        let prefix = self.keys(ctx).roles_of_user(user);
        let mut roles = Vec::new();
        for cell in self.sweep(ctx, &prefix).await? {
            let Some(rid) = cell.key.strip_prefix(&prefix).and_then(EntityId::parse) else {
                continue;
            };
            match self.get_optional(ctx, &rid).await? {
                Some(role) if role.entity_type == TYPE_ROLE => roles.push(role),
                _ => {
                    self.drop_assignment(ctx, user, &rid).await?;
                    tracing::warn!(
                        tenant_id = %ctx.tenant_id,
                        user = %user,
                        role_id = %rid,
                        "Pruned assignment to missing role"
                    );
                }
            }
        }
        Ok(roles)
    }

    // ── Sessions ─────────────────────────────────────────────────

    /// Record activity by `user` in `role` at `at`.
    pub async fn touch_role(
        &self,
        ctx: &Context,
        user: &EntityId,
        role: &RoleKey,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let keys = self.keys(ctx);
        let rid = self.get_role(ctx, role).await?.id;
        if self
            .store()
            .get(&keys.user_role(user, &rid), ctx.timeout)
            .await?
            .is_none()
        {
            return Err(GraphError::not_found("role assignment", format!("{user}:{role}")));
        }
        self.store()
            .put(&keys.session(user, &rid), encode(&at)?, ctx.timeout)
            .await?;
        Ok(())
    }

    /// Re-activate an expired role for `user`.
    pub async fn activate_role(&self, ctx: &Context, user: &EntityId, role: &RoleKey) -> Result<()> {
        self.touch_role(ctx, user, role, self.now()).await?;
        tracing::debug!(
            tenant_id = %ctx.tenant_id,
            user = %user,
            role = %role,
            "Role activated"
        );
        Ok(())
    }

    async fn role_is_live(
        &self,
        ctx: &Context,
        user: &EntityId,
        role: &Entity,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let inactivity = inactivity_of(role);
        if inactivity == 0 {
            return Ok(true);
        }
        let session_key = self.keys(ctx).session(user, &role.id);
        let last: Option<DateTime<Utc>> = self.store().get_json(&session_key, ctx.timeout).await?;
        let limit = i64::try_from(inactivity).unwrap_or(i64::MAX);
        Ok(match last {
            Some(last) => at.signed_duration_since(last).num_seconds() <= limit,
            None => true,
        })
    }

    // ── Authorization ────────────────────────────────────────────

    pub async fn is_authorized(
        &self,
        ctx: &Context,
        principal: &Principal,
        required: &str,
    ) -> Result<bool> {
        self.is_authorized_at(ctx, principal, required, self.now())
            .await
    }

    /// Whether `principal` holds a grant implying `required` at time `at`.
    pub async fn is_authorized_at(
        &self,
        ctx: &Context,
        principal: &Principal,
        required: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let user = match principal {
            Principal::System => return Ok(true),
            Principal::User(id) => *id,
        };

        let direct = self.grants_held(ctx, &user_grantee(&user)).await?;
        let mut authorized = any_implies(&direct, required);

        let groups: HashSet<EntityId> = self
            .collections_containing(ctx, &user)
            .await?
            .into_iter()
            .filter(|c| c.name == USERS_COLLECTION && c.parent.entity_type == TYPE_GROUP)
            .map(|c| c.parent.id)
            .collect();
        for group in &groups {
            if authorized {
                break;
            }
            let grants = self.grants_held(ctx, &group_grantee(group)).await?;
            authorized = any_implies(&grants, required);
        }

        let mut live = Vec::new();
        for role in self.get_user_roles(ctx, &user).await? {
            let Some(key) = RoleKey::of(&role) else {
                continue;
            };
            if let RoleKey::Group { group, .. } = &key {
                if !groups.contains(group) {
                    continue;
                }
            }
            if !self.role_is_live(ctx, &user, &role, at).await? {
                tracing::debug!(user = %user, role = %key, "Role expired for inactivity");
                continue;
            }
            if !authorized {
                let grants = self.grants_held(ctx, &role_grantee(&role.id)).await?;
                authorized = any_implies(&grants, required);
            }
            live.push(role.id);
        }

        if authorized {
            let keys = self.keys(ctx);
            let stamp = encode(&at)?;
            let ops = live
                .iter()
                .map(|rid| BatchOp::put(keys.session(&user, rid), stamp.clone()))
                .collect();
            self.apply(ctx, ops).await?;
        }

        tracing::debug!(
            tenant_id = %ctx.tenant_id,
            user = %user,
            permission = %required,
            authorized,
            "Authorization checked"
        );
        Ok(authorized)
    }
}

fn role_properties(
    name: &str,
    title: &str,
    inactivity: u64,
    group: Option<&EntityId>,
) -> Map<String, Value> {
    let mut props = Map::new();
    props.insert("name".to_string(), json!(name));
    props.insert(PROPERTY_TITLE.to_string(), json!(title));
    props.insert(PROPERTY_INACTIVITY.to_string(), json!(inactivity));
    if let Some(group) = group {
        props.insert(PROPERTY_GROUP.to_string(), json!(group.to_string()));
    }
    props
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::TenantId;
    use chrono::Duration;

    async fn user(em: &EntityManager, ctx: &Context, username: &str) -> Entity {
        let mut props = Map::new();
        props.insert("username".to_string(), json!(username));
        em.create(ctx, TYPE_USER, props).await.unwrap()
    }

    #[test]
    fn role_keys_normalize_names() {
        let group = EntityId::new();
        assert_eq!(RoleKey::application(" Admin ").name(), "admin");
        assert_eq!(RoleKey::group(group, "Mod").alias(), format!("{group}/mod"));
        assert_eq!(RoleKey::application("admin").to_string(), "admin");
    }

    #[tokio::test]
    async fn duplicate_role_name_is_rejected() {
        let em = EntityManager::in_memory();
        let ctx = Context::system(TenantId::new());
        em.create_role(&ctx, "admin", Some("Administrator"), Some(1800))
            .await
            .unwrap();
        let err = em.create_role(&ctx, "Admin", None, None).await.unwrap_err();
        assert!(matches!(err, GraphError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn titles_by_name() {
        let em = EntityManager::in_memory();
        let ctx = Context::system(TenantId::new());
        em.create_role(&ctx, "admin", Some("Administrator"), None)
            .await
            .unwrap();
        em.create_role(&ctx, "guest", None, None).await.unwrap();

        let titles = em
            .get_roles_with_titles(&ctx, &["admin", "guest", "nobody"])
            .await
            .unwrap();
        assert_eq!(titles.len(), 2);
        assert_eq!(titles["admin"], "Administrator");
        assert_eq!(titles["guest"], "guest");
    }

    #[tokio::test]
    async fn grants_are_additive_and_revoked_one_at_a_time() {
        let em = EntityManager::in_memory();
        let ctx = Context::system(TenantId::new());
        em.create_role(&ctx, "editor", None, None).await.unwrap();

        em.grant_role_permission(&ctx, "editor", "notes:create").await.unwrap();
        em.grant_role_permission(&ctx, "editor", "notes:create").await.unwrap();
        em.grant_role_permission(&ctx, "editor", "notes:update").await.unwrap();
        assert_eq!(em.get_role_permissions(&ctx, "editor").await.unwrap().len(), 2);

        let role = Grantee::Role {
            role: RoleKey::application("editor"),
        };
        em.revoke_permission(&ctx, &role, "NOTES:create").await.unwrap();
        em.revoke_permission(&ctx, &role, "notes:delete").await.unwrap();
        let left = em.get_permissions(&ctx, &role).await.unwrap();
        assert_eq!(left.into_iter().collect::<Vec<_>>(), vec!["notes:update"]);
    }

    #[tokio::test]
    async fn grants_need_an_existing_grantee_and_valid_pattern() {
        let em = EntityManager::in_memory();
        let ctx = Context::system(TenantId::new());
        assert!(em
            .grant_role_permission(&ctx, "ghost", "a:b")
            .await
            .unwrap_err()
            .is_not_found());

        let u = user(&em, &ctx, "fred").await;
        assert!(matches!(
            em.grant_user_permission(&ctx, &u.id, "a::b").await,
            Err(GraphError::Permission(_))
        ));
    }

    #[tokio::test]
    async fn role_grant_authorizes_assigned_user() {
        let em = EntityManager::in_memory();
        let ctx = Context::system(TenantId::new());
        em.create_role(&ctx, "maker", None, Some(0)).await.unwrap();
        let u = user(&em, &ctx, "fred").await;
        let principal = Principal::User(u.id);

        em.grant_role_permission(&ctx, "maker", "widgets:create:*")
            .await
            .unwrap();
        assert!(!em.is_authorized(&ctx, &principal, "widgets:create").await.unwrap());

        em.add_user_to_role(&ctx, &u.id, &RoleKey::application("maker"))
            .await
            .unwrap();
        assert!(em.is_authorized(&ctx, &principal, "widgets:create").await.unwrap());

        em.revoke_permission(
            &ctx,
            &Grantee::Role {
                role: RoleKey::application("maker"),
            },
            "widgets:create:*",
        )
        .await
        .unwrap();
        assert!(!em.is_authorized(&ctx, &principal, "widgets:create").await.unwrap());
    }

    #[tokio::test]
    async fn idle_role_expires_until_activated() {
        let em = EntityManager::in_memory();
        let ctx = Context::system(TenantId::new());
        em.create_role(&ctx, "admin", Some("Administrator"), Some(1800))
            .await
            .unwrap();
        em.grant_role_permission(&ctx, "admin", "*").await.unwrap();
        let u = user(&em, &ctx, "fred").await;
        let key = RoleKey::application("admin");
        em.add_user_to_role(&ctx, &u.id, &key).await.unwrap();

        let principal = Principal::User(u.id);
        let now = Utc::now();
        em.touch_role(&ctx, &u.id, &key, now - Duration::seconds(3600))
            .await
            .unwrap();
        assert!(!em
            .is_authorized_at(&ctx, &principal, "notes:read", now)
            .await
            .unwrap());
        // Still expired: a denied check does not refresh the session.
        assert!(!em
            .is_authorized_at(&ctx, &principal, "notes:read", now)
            .await
            .unwrap());

        em.activate_role(&ctx, &u.id, &key).await.unwrap();
        assert!(em.is_authorized(&ctx, &principal, "notes:read").await.unwrap());
    }

    #[tokio::test]
    async fn authorization_refreshes_live_sessions() {
        let em = EntityManager::in_memory();
        let ctx = Context::system(TenantId::new());
        em.create_role(&ctx, "admin", None, Some(60)).await.unwrap();
        em.grant_role_permission(&ctx, "admin", "*").await.unwrap();
        let u = user(&em, &ctx, "fred").await;
        let key = RoleKey::application("admin");
        em.add_user_to_role(&ctx, &u.id, &key).await.unwrap();

        let principal = Principal::User(u.id);
        let start = Utc::now();
        em.touch_role(&ctx, &u.id, &key, start).await.unwrap();
        for minute in 1..=3 {
            let at = start + Duration::seconds(50 * minute);
            assert!(em
                .is_authorized_at(&ctx, &principal, "notes:read", at)
                .await
                .unwrap());
        }
    }

    #[tokio::test]
    async fn group_and_group_role_grants_need_membership() {
        let em = EntityManager::in_memory();
        let ctx = Context::system(TenantId::new());
        let mut props = Map::new();
        props.insert("path".to_string(), json!("staff"));
        let group = em.create(&ctx, TYPE_GROUP, props).await.unwrap();
        let u = user(&em, &ctx, "fred").await;
        let principal = Principal::User(u.id);

        em.create_group_role(&ctx, &group.id, "moderator", None)
            .await
            .unwrap();
        em.grant_group_role_permission(&ctx, &group.id, "moderator", "posts:delete")
            .await
            .unwrap();
        em.add_user_to_group_role(&ctx, &u.id, &group.id, "moderator")
            .await
            .unwrap();
        em.grant_permission(&ctx, &Grantee::Group { id: group.id }, "posts:read")
            .await
            .unwrap();

        assert!(!em.is_authorized(&ctx, &principal, "posts:delete").await.unwrap());
        assert!(!em.is_authorized(&ctx, &principal, "posts:read").await.unwrap());

        em.add_to_collection(&ctx, &group.id, USERS_COLLECTION, &u.id)
            .await
            .unwrap();
        assert!(em.is_authorized(&ctx, &principal, "posts:delete").await.unwrap());
        assert!(em.is_authorized(&ctx, &principal, "posts:read").await.unwrap());
        assert!(!em.is_authorized(&ctx, &principal, "posts:update").await.unwrap());
    }

    #[tokio::test]
    async fn group_roles_do_not_collide_with_application_roles() {
        let em = EntityManager::in_memory();
        let ctx = Context::system(TenantId::new());
        let mut props = Map::new();
        props.insert("path".to_string(), json!("a"));
        let group = em.create(&ctx, TYPE_GROUP, props).await.unwrap();

        em.create_role(&ctx, "admin", None, None).await.unwrap();
        em.create_group_role(&ctx, &group.id, "admin", None)
            .await
            .unwrap();
        let scoped = em
            .get_role(&ctx, &RoleKey::group(group.id, "admin"))
            .await
            .unwrap();
        assert_eq!(RoleKey::of(&scoped), Some(RoleKey::group(group.id, "admin")));
    }

    #[tokio::test]
    async fn user_roles_listed_and_removed() {
        let em = EntityManager::in_memory();
        let ctx = Context::system(TenantId::new());
        em.create_role(&ctx, "a", None, None).await.unwrap();
        em.create_role(&ctx, "b", None, None).await.unwrap();
        let u = user(&em, &ctx, "fred").await;
        em.add_user_to_role(&ctx, &u.id, &RoleKey::application("a"))
            .await
            .unwrap();
        em.add_user_to_role(&ctx, &u.id, &RoleKey::application("b"))
            .await
            .unwrap();
        assert_eq!(em.get_user_roles(&ctx, &u.id).await.unwrap().len(), 2);

        em.remove_user_from_role(&ctx, &u.id, &RoleKey::application("a"))
            .await
            .unwrap();
        let left = em.get_user_roles(&ctx, &u.id).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn system_principal_bypasses_checks() {
        let em = EntityManager::in_memory();
        let ctx = Context::system(TenantId::new());
        assert!(em
            .is_authorized(&ctx, &Principal::System, "anything:at:all")
            .await
            .unwrap());
    }
}
