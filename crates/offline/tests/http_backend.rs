use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use guardian_core::{EntityKind, IdentityKey, codec};
use guardian_offline::transport::DeleteOutcome;
use guardian_offline::{
    EngineOptions, HttpTransport, LocalCache, RemoteTransport, SyncEngine, SyncTrigger,
    TransportError,
};
use serde_json::{Value, json};

const TOKEN: &str = "test-token";

#[derive(Clone, Default)]
struct Backend {
    users: Arc<Mutex<BTreeMap<String, Value>>>,
    children: Arc<Mutex<BTreeMap<String, Value>>>,
}

async fn health(headers: HeaderMap) -> StatusCode {
    let expected = format!("Bearer {TOKEN}");
    match headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        Some(value) if value == expected => StatusCode::OK,
        _ => StatusCode::UNAUTHORIZED,
    }
}

async fn sync_users(State(backend): State<Backend>, Json(body): Json<Value>) -> Json<Value> {
    let mut users = backend.users.lock().unwrap();
    let mut inserted = 0;
    for user in body["users"].as_array().cloned().unwrap_or_default() {
        let Some(id) = user["nationalId"].as_str().map(str::to_string) else {
            continue;
        };
        if !users.contains_key(&id) {
            users.insert(id, user);
            inserted += 1;
        }
    }
    Json(json!({ "success": true, "inserted": inserted }))
}

async fn sync_children(State(backend): State<Backend>, Json(body): Json<Value>) -> Json<Value> {
    let mut children = backend.children.lock().unwrap();
    let mut upserted = Vec::new();
    let mut failed = Vec::new();
    for child in body["children"].as_array().cloned().unwrap_or_default() {
        let Some(id) = child["child_id"].as_str().map(str::to_string) else {
            continue;
        };
        if child["name"] == json!("REJECT") {
            failed.push(json!({ "key": id, "error": "validation failed" }));
            continue;
        }
        let merged = match children.get(&id) {
            Some(existing) => codec::merge(EntityKind::Child, &child, existing),
            None => child,
        };
        children.insert(id.clone(), merged);
        upserted.push(id);
    }
    Json(json!({ "success": failed.is_empty(), "upserted": upserted, "failed": failed }))
}

async fn all_users(State(backend): State<Backend>) -> Json<Vec<Value>> {
    Json(backend.users.lock().unwrap().values().cloned().collect())
}

async fn children(State(backend): State<Backend>) -> Json<Vec<Value>> {
    Json(backend.children.lock().unwrap().values().cloned().collect())
}

async fn child_by_id(
    State(backend): State<Backend>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    backend
        .children
        .lock()
        .unwrap()
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn add_record(
    State(backend): State<Backend>,
    Path(id): Path<String>,
    Json(record): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let mut children = backend.children.lock().unwrap();
    let child = children.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;
    codec::append_history(child, &record);
    Ok(Json(json!({ "history": codec::history_slice(child) })))
}

async fn delete_child(State(backend): State<Backend>, Path(id): Path<String>) -> StatusCode {
    match backend.children.lock().unwrap().remove(&id) {
        Some(_) => StatusCode::OK,
        None => StatusCode::NOT_FOUND,
    }
}

struct TestServer {
    base_url: String,
    backend: Backend,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let backend = Backend::default();
        let app = Router::new()
            .route("/health", get(health))
            .route("/sync-users", post(sync_users))
            .route("/sync-children", post(sync_children))
            .route("/all-users", get(all_users))
            .route("/children", get(children))
            .route("/child-by-unique-id/:id", get(child_by_id))
            .route("/add-record/:id", put(add_record))
            .route("/child/:id", delete(delete_child))
            .with_state(backend.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            backend,
            handle,
        }
    }

    fn transport(&self) -> HttpTransport {
        HttpTransport::new(&self.base_url, Some(TOKEN.to_string()), Duration::from_secs(5)).unwrap()
    }

    fn child(&self, id: &str) -> Option<Value> {
        self.backend.children.lock().unwrap().get(id).cloned()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn key(raw: &str) -> IdentityKey {
    IdentityKey::parse(raw).unwrap()
}

#[tokio::test]
async fn probe_sends_bearer_token() {
    let server = TestServer::spawn().await;
    server.transport().probe().await.unwrap();

    let anonymous = HttpTransport::new(&server.base_url, None, Duration::from_secs(5)).unwrap();
    let err = anonymous.probe().await.unwrap_err();
    assert!(matches!(err, TransportError::Api { status: 401, .. }));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn child_round_trip_over_http() {
    let server = TestServer::spawn().await;
    let transport = server.transport();

    let response = transport
        .sync_children(&[json!({ "child_id": "K 1", "name": "Asha" })])
        .await
        .unwrap();
    assert!(response.accepted(&key("K 1")).is_ok());

    let fetched = transport.fetch_child(&key("K 1")).await.unwrap().unwrap();
    assert_eq!(fetched["name"], json!("Asha"));
    assert!(transport.fetch_child(&key("K404")).await.unwrap().is_none());

    let history = transport
        .add_record(&key("K 1"), &json!({ "id": "R1", "height": 88.0 }))
        .await
        .unwrap();
    assert_eq!(history.len(), 1);

    let err = transport
        .add_record(&key("K404"), &json!({ "id": "R2" }))
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::ParentNotFound(key("K404")));

    assert_eq!(transport.fetch_children().await.unwrap().len(), 1);
    assert_eq!(transport.delete_child(&key("K 1")).await.unwrap(), DeleteOutcome::Deleted);
    assert_eq!(
        transport.delete_child(&key("K 1")).await.unwrap(),
        DeleteOutcome::AlreadyAbsent
    );
}

#[tokio::test]
async fn rejected_child_is_reported_per_key() {
    let server = TestServer::spawn().await;
    let response = server
        .transport()
        .sync_children(&[
            json!({ "child_id": "K1", "name": "Asha" }),
            json!({ "child_id": "K2", "name": "REJECT" }),
        ])
        .await
        .unwrap();

    assert!(response.accepted(&key("K1")).is_ok());
    assert_eq!(
        response.accepted(&key("K2")),
        Err(TransportError::Rejected("validation failed".into()))
    );
}

#[tokio::test]
async fn unreachable_backend_is_a_transient_error() {
    // Bind then drop to get a port with nothing listening.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport =
        HttpTransport::new(&format!("http://{addr}"), None, Duration::from_secs(2)).unwrap();
    let err = transport.fetch_children().await.unwrap_err();
    assert!(err.is_transient(), "{err:?}");
}

#[tokio::test]
async fn engine_syncs_against_http_backend() {
    let server = TestServer::spawn().await;
    let remote: Arc<dyn RemoteTransport> = Arc::new(server.transport());
    let cache = LocalCache::in_memory().await.unwrap();
    let engine = SyncEngine::new(cache, remote, EngineOptions::default());

    engine
        .stage_user(json!({ "nationalId": "NID-1", "fullName": "Meera" }))
        .await
        .unwrap();
    engine.stage_child(json!({ "child_id": "K1", "name": "Asha" })).await.unwrap();
    engine
        .stage_history_record(&key("K1"), json!({ "id": "R1", "height": 90.0 }))
        .await
        .unwrap();

    let SyncTrigger::Ran(report) = engine.request_sync().await else {
        panic!("expected a pass to run");
    };
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(engine.pending_writes().await.unwrap(), 0);

    let child = server.child("K1").unwrap();
    assert_eq!(child["name"], json!("Asha"));
    assert_eq!(codec::history_slice(&child).len(), 1);
    assert!(server.backend.users.lock().unwrap().contains_key("NID-1"));

    // Confirmed by the backend, so it has left the outbox.
    let outboxed = engine
        .cache()
        .get(EntityKind::HistoryRecord, &key("R1"))
        .await
        .unwrap();
    assert!(outboxed.is_none());
    let local = engine.get(EntityKind::Child, &key("K1")).await.unwrap().unwrap();
    assert_eq!(codec::history_slice(&local).len(), 1);
}
