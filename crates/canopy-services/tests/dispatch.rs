//! End-to-end dispatch tests over the in-memory backend.
//!
//! Run with: cargo test --package canopy-services --test dispatch

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use canopy_core::config::CanopyConfig;
use canopy_core::schema::TYPE_USER;
use canopy_core::{CancelSignal, Context, Principal, SchemaRegistry, TenantId};
use canopy_graph::{EntityManager, GraphError, RoleKey};
use canopy_services::script::run_file;
use canopy_services::{
    Outcome, RequestState, ServiceAction, ServiceError, ServiceManager, ServicePayload,
    ServiceRequest,
};
use canopy_store::{BatchOp, Cell, MemoryStorage, Storage, StoreClient, StoreError};

fn props(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

fn setup() -> (ServiceManager, Context) {
    let services = ServiceManager::new(EntityManager::in_memory());
    (services, Context::system(TenantId::new()))
}

async fn user(services: &ServiceManager, ctx: &Context, username: &str) -> Principal {
    let entity = services
        .entities()
        .create(ctx, TYPE_USER, props(json!({ "username": username })))
        .await
        .unwrap();
    Principal::User(entity.id)
}

fn create(path: &[&str], payload: ServicePayload) -> ServiceRequest {
    ServiceRequest::new(ServiceAction::Create, path.iter().copied()).with_payload(payload)
}

#[tokio::test]
async fn test_admin_role_creates_note() {
    let (services, ctx) = setup();
    let em = services.entities();
    em.create_role(&ctx, "admin", Some("Administrator"), Some(1800))
        .await
        .unwrap();
    em.grant_role_permission(&ctx, "admin", "*:*:*").await.unwrap();
    let u = user(&services, &ctx, "u").await;
    let Principal::User(uid) = u else { unreachable!() };
    em.add_user_to_role(&ctx, &uid, &RoleKey::application("admin"))
        .await
        .unwrap();

    let results = services
        .dispatch(
            &ctx.as_principal(u),
            create(&["note"], ServicePayload::Single(props(json!({"text": "hi"})))),
        )
        .await
        .unwrap();

    assert_eq!(results.entities.len(), 1);
    let note = &results.entities[0];
    assert_eq!(note.entity_type, "note");
    assert_eq!(note.properties["text"], "hi");

    let wire = results.to_wire("https://api.example", &ctx.tenant_id);
    let first = &wire["entities"][0];
    for field in ["id", "created", "modified", "uri"] {
        assert!(!first[field].is_null(), "{field} missing");
    }
    assert_eq!(first["type"], "note");
    assert_eq!(first["text"], "hi");
}

#[tokio::test]
async fn test_batch_isolates_failures() {
    let (services, ctx) = setup();
    let payload = ServicePayload::Batch(vec![
        props(json!({"username": "one"})),
        props(json!({"email": "two@example.com"})),
        props(json!({"username": "three"})),
    ]);

    let results = services
        .dispatch(&ctx, create(&["users"], payload))
        .await
        .unwrap();

    assert_eq!(results.entities.len(), 2);
    assert_eq!(results.failures, 1);
    assert_eq!(results.outcomes.len(), 3);
    assert!(results.outcomes[0].is_success());
    assert!(matches!(&results.outcomes[1], Outcome::Failed { index: 1, error } if error.contains("username")));
    assert!(results.outcomes[2].is_success());
    assert!(!results.cancelled);

    let listed = services
        .dispatch(&ctx, ServiceRequest::new(ServiceAction::List, ["users"]))
        .await
        .unwrap();
    assert_eq!(listed.entities.len(), 2);
    assert_eq!(listed.data.unwrap()["count"], 2);
}

#[tokio::test]
async fn test_single_create_failure_is_an_error() {
    let (services, ctx) = setup();
    let err = services
        .dispatch(
            &ctx,
            create(&["users"], ServicePayload::Single(props(json!({"email": "x"})))),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Graph(GraphError::Validation(_))));
    assert_eq!(err.terminal_state(), RequestState::Failed);
}

#[tokio::test]
async fn test_denied_request_mutates_nothing() {
    let (services, ctx) = setup();
    let note = services
        .dispatch(
            &ctx,
            create(&["notes"], ServicePayload::Single(props(json!({"text": "keep"})))),
        )
        .await
        .unwrap()
        .entities
        .remove(0);
    let nobody = ctx.as_principal(user(&services, &ctx, "nobody").await);

    let err = services
        .dispatch(
            &nobody,
            create(&["notes"], ServicePayload::Single(props(json!({"text": "secret"})))),
        )
        .await
        .unwrap_err();
    match &err {
        ServiceError::AuthorizationDenied { permission, .. } => {
            assert_eq!(permission, "notes:create")
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(err.terminal_state(), RequestState::Denied);

    let id = note.id.to_string();
    let err = services
        .dispatch(
            &nobody,
            ServiceRequest::new(ServiceAction::Delete, ["notes", id.as_str()]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::AuthorizationDenied { .. }));

    let listed = services
        .dispatch(&ctx, ServiceRequest::new(ServiceAction::List, ["notes"]))
        .await
        .unwrap();
    assert_eq!(listed.entities.len(), 1);
    assert_eq!(listed.entities[0].id, note.id);
}

#[tokio::test]
async fn test_permissions_follow_action_and_resource() {
    let (services, ctx) = setup();
    let reader = user(&services, &ctx, "reader").await;
    let Principal::User(rid) = reader else { unreachable!() };
    services
        .entities()
        .grant_user_permission(&ctx, &rid, "notes:read,list")
        .await
        .unwrap();
    let as_reader = ctx.as_principal(reader);

    services
        .dispatch(
            &ctx,
            create(&["notes"], ServicePayload::Single(props(json!({"text": "a"})))),
        )
        .await
        .unwrap();

    let listed = services
        .dispatch(&as_reader, ServiceRequest::new(ServiceAction::List, ["notes"]))
        .await
        .unwrap();
    assert_eq!(listed.entities.len(), 1);

    let id = listed.entities[0].id.to_string();
    let update = ServiceRequest::new(ServiceAction::Update, ["notes", id.as_str()])
        .with_payload(ServicePayload::Single(props(json!({"text": "b"}))));
    assert!(matches!(
        services.dispatch(&as_reader, update).await,
        Err(ServiceError::AuthorizationDenied { .. })
    ));

    let denied = services
        .dispatch(&as_reader, ServiceRequest::new(ServiceAction::List, ["widgets"]))
        .await;
    assert!(matches!(denied, Err(ServiceError::AuthorizationDenied { .. })));
}

#[tokio::test]
async fn test_entity_read_update_delete() {
    let (services, ctx) = setup();
    services
        .dispatch(
            &ctx,
            create(&["users"], ServicePayload::Single(props(json!({"username": "fred"})))),
        )
        .await
        .unwrap();

    let read = services
        .dispatch(&ctx, ServiceRequest::new(ServiceAction::Read, ["users", "fred"]))
        .await
        .unwrap();
    let fred = read.entities[0].clone();
    assert_eq!(fred.properties["username"], "fred");

    let updated = services
        .dispatch(
            &ctx,
            ServiceRequest::new(ServiceAction::Update, ["users", "fred"])
                .with_payload(ServicePayload::Single(props(json!({"age": 42})))),
        )
        .await
        .unwrap();
    assert_eq!(updated.entities[0].properties["age"], 42);
    assert_eq!(updated.entities[0].properties["username"], "fred");

    let err = services
        .dispatch(
            &ctx,
            ServiceRequest::new(ServiceAction::Update, ["users", "fred"])
                .with_payload(ServicePayload::Single(props(json!({"created": 0})))),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Graph(GraphError::Validation(_))));

    services
        .dispatch(&ctx, ServiceRequest::new(ServiceAction::Delete, ["users", "fred"]))
        .await
        .unwrap();
    let err = services
        .dispatch(&ctx, ServiceRequest::new(ServiceAction::Read, ["users", "fred"]))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Graph(ref e) if e.is_not_found()));
}

#[tokio::test]
async fn test_group_membership_and_connections_by_path() {
    let (services, ctx) = setup();
    services
        .dispatch(
            &ctx,
            create(&["users"], ServicePayload::Single(props(json!({"username": "fred"})))),
        )
        .await
        .unwrap();
    services
        .dispatch(
            &ctx,
            create(&["groups"], ServicePayload::Single(props(json!({"path": "ops"})))),
        )
        .await
        .unwrap();

    // Declared sub-collection: add an existing member by alias.
    services
        .dispatch(&ctx, create(&["groups", "ops", "users", "fred"], ServicePayload::None))
        .await
        .unwrap();
    let members = services
        .dispatch(&ctx, ServiceRequest::new(ServiceAction::List, ["groups", "ops", "users"]))
        .await
        .unwrap();
    assert_eq!(members.entities.len(), 1);
    assert_eq!(members.entities[0].properties["username"], "fred");

    // Undeclared sub-segment: a verb. Create-and-connect, then read both sides.
    let liked = services
        .dispatch(
            &ctx,
            create(
                &["users", "fred", "likes"],
                ServicePayload::Single(props(json!({"type": "restaurant", "cuisine": "thai"}))),
            ),
        )
        .await
        .unwrap();
    let restaurant = liked.entities[0].clone();
    assert_eq!(restaurant.entity_type, "restaurant");

    let outgoing = services
        .dispatch(&ctx, ServiceRequest::new(ServiceAction::List, ["users", "fred", "likes"]))
        .await
        .unwrap();
    assert_eq!(outgoing.entities[0].id, restaurant.id);

    let rid = restaurant.id.to_string();
    let incoming = services
        .dispatch(
            &ctx,
            ServiceRequest::new(
                ServiceAction::List,
                ["restaurants", rid.as_str(), "connecting", "likes"],
            ),
        )
        .await
        .unwrap();
    assert_eq!(incoming.entities.len(), 1);
    assert_eq!(incoming.entities[0].properties["username"], "fred");

    services
        .dispatch(
            &ctx,
            ServiceRequest::new(ServiceAction::Delete, ["users", "fred", "likes", rid.as_str()]),
        )
        .await
        .unwrap();
    let err = services
        .dispatch(
            &ctx,
            ServiceRequest::new(ServiceAction::Read, ["users", "fred", "likes", rid.as_str()]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Graph(ref e) if e.is_not_found()));
}

#[tokio::test]
async fn test_connected_create_needs_create_on_the_new_type() {
    let (services, ctx) = setup();
    let fan = user(&services, &ctx, "fan").await;
    let Principal::User(fan_id) = fan else { unreachable!() };
    let em = services.entities();
    em.grant_user_permission(&ctx, &fan_id, "users:create,list")
        .await
        .unwrap();
    let as_fan = ctx.as_principal(fan);
    let fid = fan_id.to_string();
    let likes = ["users", fid.as_str(), "likes"];
    let connect = |entity_type: &str| {
        create(
            &likes,
            ServicePayload::Single(props(json!({"type": entity_type, "name": "x"}))),
        )
    };

    let err = services
        .dispatch(&as_fan, connect("restaurant"))
        .await
        .unwrap_err();
    match &err {
        ServiceError::AuthorizationDenied { permission, .. } => {
            assert_eq!(permission, "restaurants:create")
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(err.terminal_state(), RequestState::Denied);
    let outgoing = services
        .dispatch(&as_fan, ServiceRequest::new(ServiceAction::List, likes))
        .await
        .unwrap();
    assert!(outgoing.entities.is_empty());

    em.grant_user_permission(&ctx, &fan_id, "restaurants:create")
        .await
        .unwrap();
    let created = services
        .dispatch(&as_fan, connect("restaurant"))
        .await
        .unwrap();
    assert_eq!(created.entities[0].entity_type, "restaurant");

    // Roles only come into being through the roles collection.
    em.grant_user_permission(&ctx, &fan_id, "roles:create")
        .await
        .unwrap();
    let err = services.dispatch(&as_fan, connect("role")).await.unwrap_err();
    assert!(matches!(err, ServiceError::BadRequest(_)));
    assert!(em
        .get_role(&ctx, &RoleKey::application("x"))
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_listing_pages_with_cursor() {
    let (services, ctx) = setup();
    let payload = ServicePayload::Batch(
        (0..3).map(|i| props(json!({ "n": i }))).collect(),
    );
    services
        .dispatch(&ctx, create(&["notes"], payload))
        .await
        .unwrap();

    let first = services
        .dispatch(
            &ctx,
            ServiceRequest::new(ServiceAction::List, ["notes"]).with_page(Some(2), None),
        )
        .await
        .unwrap();
    assert_eq!(first.entities.len(), 2);
    assert_eq!(first.entities[0].properties["n"], 0);
    let cursor = first.cursor.clone().unwrap();
    assert_eq!(first.data.as_ref().unwrap()["cursor"], cursor.as_str());

    let rest = services
        .dispatch(
            &ctx,
            ServiceRequest::new(ServiceAction::List, ["notes"]).with_page(Some(2), Some(cursor)),
        )
        .await
        .unwrap();
    assert_eq!(rest.entities.len(), 1);
    assert_eq!(rest.entities[0].properties["n"], 2);
    assert!(rest.cursor.is_none());
}

#[tokio::test]
async fn test_roles_created_through_root_collection() {
    let (services, ctx) = setup();
    services
        .dispatch(
            &ctx,
            create(
                &["roles"],
                ServicePayload::Single(props(
                    json!({"name": "admin", "title": "Administrator", "inactivity": 1800}),
                )),
            ),
        )
        .await
        .unwrap();
    let titles = services
        .entities()
        .get_roles_with_titles(&ctx, &["admin"])
        .await
        .unwrap();
    assert_eq!(titles["admin"], "Administrator");
}

#[tokio::test]
async fn test_unsupported_actions_are_bad_requests() {
    let (services, ctx) = setup();
    let err = services
        .dispatch(&ctx, ServiceRequest::new(ServiceAction::Delete, ["notes"]))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::BadRequest(_)));

    let err = services
        .dispatch(&ctx, create(&["notes"], ServicePayload::None))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::BadRequest(_)));
}

// ── Cancellation ──────────────────────────────────────────────────

/// Memory storage that fires a cancel signal on the first entity write
/// after being armed.
struct CancellingStorage {
    inner: MemoryStorage,
    signal: CancelSignal,
    armed: AtomicBool,
}

impl CancellingStorage {
    fn observe(&self, key: &str) {
        if key.contains("/entity/") && self.armed.swap(false, Ordering::SeqCst) {
            self.signal.cancel();
        }
    }
}

#[async_trait]
impl Storage for CancellingStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.observe(key);
        self.inner.put(key, value).await
    }

    async fn put_if(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
    ) -> Result<bool, StoreError> {
        self.observe(key);
        self.inner.put_if(key, expected, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }

    async fn scan(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Cell>, StoreError> {
        self.inner.scan(prefix, after, limit).await
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        self.inner.batch(ops).await
    }
}

#[tokio::test]
async fn test_cancellation_stops_batch_between_elements() {
    let signal = CancelSignal::new();
    let storage = Arc::new(CancellingStorage {
        inner: MemoryStorage::new(),
        signal: signal.clone(),
        armed: AtomicBool::new(false),
    });
    let services = ServiceManager::new(EntityManager::new(
        StoreClient::new(storage.clone()),
        SchemaRegistry::with_builtins(),
        CanopyConfig::default(),
    ));
    let ctx = Context::system(TenantId::new()).with_cancel(signal);

    // Make sure the application entity exists before arming.
    services
        .dispatch(
            &ctx,
            create(&["notes"], ServicePayload::Single(props(json!({"n": -1})))),
        )
        .await
        .unwrap();
    storage.armed.store(true, Ordering::SeqCst);

    let payload = ServicePayload::Batch((0..3).map(|i| props(json!({ "n": i }))).collect());
    let results = services
        .dispatch(&ctx, create(&["notes"], payload))
        .await
        .unwrap();

    assert!(results.cancelled);
    assert_eq!(results.entities.len(), 1);
    assert_eq!(results.outcomes.len(), 1);
    assert_eq!(results.entities[0].properties["n"], 0);

    // Already cancelled: nothing executes.
    let err = services
        .dispatch(
            &ctx,
            create(&["notes"], ServicePayload::Single(props(json!({"n": 9})))),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Cancelled));
}

// ── Connect failures ──────────────────────────────────────────────

/// Memory storage whose outgoing connection writes always fail.
#[derive(Default)]
struct RefusingConnections {
    inner: MemoryStorage,
}

#[async_trait]
impl Storage for RefusingConnections {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.inner.put(key, value).await
    }

    async fn put_if(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
    ) -> Result<bool, StoreError> {
        if key.contains("/conn/out/") {
            return Err(StoreError::Backend(format!("refused {key}")));
        }
        self.inner.put_if(key, expected, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }

    async fn scan(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Cell>, StoreError> {
        self.inner.scan(prefix, after, limit).await
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        self.inner.batch(ops).await
    }
}

#[tokio::test]
async fn test_failed_connect_deletes_the_created_entity() {
    let storage = Arc::new(RefusingConnections::default());
    let services = ServiceManager::new(EntityManager::new(
        StoreClient::new(storage.clone()),
        SchemaRegistry::with_builtins(),
        CanopyConfig::default(),
    ));
    let ctx = Context::system(TenantId::new());
    let fan = user(&services, &ctx, "fan").await;
    let Principal::User(fan_id) = fan else { unreachable!() };
    let fid = fan_id.to_string();

    let err = services
        .dispatch(
            &ctx,
            create(
                &["users", fid.as_str(), "likes"],
                ServicePayload::Single(props(json!({"type": "restaurant"}))),
            ),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Graph(GraphError::Store(_))));

    let records = storage
        .scan(&format!("t/{}/entity/", ctx.tenant_id), None, 100)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].key.ends_with(&fid));
    let incoming = storage
        .scan(&format!("t/{}/conn/in/", ctx.tenant_id), None, 100)
        .await
        .unwrap();
    assert!(incoming.is_empty());
}

// ── Scripts ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_script_reports_each_line() {
    let (services, ctx) = setup();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "# bootstrap").unwrap();
    writeln!(
        file,
        r#"{{"action":"create","path":["users"],"payload":{{"username":"fred"}}}}"#
    )
    .unwrap();
    writeln!(file).unwrap();
    writeln!(
        file,
        r#"{{"as_user":"fred","action":"create","path":["notes"],"payload":{{"text":"hi"}}}}"#
    )
    .unwrap();
    writeln!(file, "not json").unwrap();
    writeln!(file, r#"{{"action":"list","path":["users"]}}"#).unwrap();
    file.flush().unwrap();

    let reports = run_file(&services, &ctx, "https://api.example", file.path())
        .await
        .unwrap();

    assert_eq!(reports.len(), 4);
    assert_eq!(reports[0].line, 2);
    assert_eq!(reports[0].state, RequestState::Completed);
    assert_eq!(reports[1].line, 4);
    assert_eq!(reports[1].state, RequestState::Denied);
    assert_eq!(reports[2].state, RequestState::Failed);
    assert!(reports[2].error.as_deref().unwrap().starts_with("invalid request"));
    assert_eq!(reports[3].state, RequestState::Completed);
    let listed = reports[3].results.as_ref().unwrap();
    assert_eq!(listed["data"]["count"], 1);
    assert_eq!(listed["entities"][0]["username"], "fred");
}
