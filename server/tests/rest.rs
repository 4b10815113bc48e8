use std::sync::Arc;

use agentmux_server::config::Config;
use agentmux_server::core::Registry;

/// Binds the real router to an ephemeral port and hands back its address,
/// mirroring the teacher's `start_test_http_server` pattern: a genuine
/// listener, not a mocked `tower::Service` call.
async fn spawn_test_server() -> (std::net::SocketAddr, Arc<Registry>, tempfile::TempDir) {
    spawn_test_server_with_auth(None).await
}

async fn spawn_test_server_with_auth(auth_token: Option<String>) -> (std::net::SocketAddr, Arc<Registry>, tempfile::TempDir) {
    let root = tempfile::tempdir().expect("tempdir");
    let config = Arc::new(Config {
        port: 0,
        root_dir: root.path().to_path_buf(),
        auth_token,
        https: None,
        dev: true,
    });
    let store = Arc::new(agentmux_server::core::store::SessionStore::new(root.path().join("sessions.json")));
    let registry = Registry::new((*config).clone(), store);
    let restart_manager = agentmux_server::core::restart::RestartManager::new(registry.clone());

    let router = agentmux_server::build_router(config, registry.clone(), restart_manager);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (addr, registry, root)
}

#[tokio::test]
async fn healthz_is_reachable_without_auth() {
    let (addr, _registry, _root) = spawn_test_server().await;
    let resp = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn create_list_get_delete_session_round_trip() {
    let (addr, _registry, root) = spawn_test_server().await;
    let client = reqwest::Client::new();

    let created: serde_json::Value = client
        .post(format!("http://{addr}/api/sessions"))
        .json(&serde_json::json!({ "name": "demo" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["name"], "demo");
    assert_eq!(created["active"], false);
    assert_eq!(created["working_dir"].as_str(), Some(root.path().to_string_lossy().as_ref()));

    let list: Vec<serde_json::Value> = client.get(format!("http://{addr}/api/sessions")).send().await.unwrap().json().await.unwrap();
    assert_eq!(list.len(), 1);

    let got: serde_json::Value = client
        .get(format!("http://{addr}/api/sessions/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(got["id"], created["id"]);

    let resp = client.delete(format!("http://{addr}/api/sessions/{id}")).send().await.unwrap();
    assert_eq!(resp.status(), 204);

    let resp = client.get(format!("http://{addr}/api/sessions/{id}")).send().await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn create_session_rejects_escaping_working_dir() {
    let (addr, _registry, _root) = spawn_test_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/api/sessions"))
        .json(&serde_json::json!({ "working_dir": "../../etc" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn set_priority_and_resize_validate_bounds() {
    let (addr, _registry, _root) = spawn_test_server().await;
    let client = reqwest::Client::new();

    let created: serde_json::Value = client
        .post(format!("http://{addr}/api/sessions"))
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    let resp = client
        .post(format!("http://{addr}/api/sessions/{id}/priority"))
        .json(&serde_json::json!({ "priority": "background" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let got: serde_json::Value = client
        .get(format!("http://{addr}/api/sessions/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(got["priority"], "background");

    let resp = client
        .post(format!("http://{addr}/api/sessions/{id}/resize"))
        .json(&serde_json::json!({ "cols": 0, "rows": 24 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("http://{addr}/api/sessions/{id}/resize"))
        .json(&serde_json::json!({ "cols": 9999, "rows": 24 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn unknown_session_operations_return_404() {
    let (addr, _registry, _root) = spawn_test_server().await;
    let client = reqwest::Client::new();
    let bogus = uuid::Uuid::new_v4();

    let resp = client.get(format!("http://{addr}/api/sessions/{bogus}")).send().await.unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client.delete(format!("http://{addr}/api/sessions/{bogus}")).send().await.unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .post(format!("http://{addr}/api/sessions/{bogus}/input"))
        .json(&serde_json::json!({ "data": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn unauthenticated_status_routes_are_reachable_without_a_token() {
    let (addr, _registry, _root) = spawn_test_server_with_auth(Some("s3cret".to_string())).await;

    let resp = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();
    assert_eq!(resp.status(), 200);

    let resp = reqwest::get(format!("http://{addr}/api/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let resp = reqwest::get(format!("http://{addr}/auth-status")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["authRequired"], true);
}

#[tokio::test]
async fn protected_routes_reject_missing_or_wrong_token_and_accept_the_right_one() {
    let (addr, _registry, _root) = spawn_test_server_with_auth(Some("s3cret".to_string())).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("http://{addr}/api/sessions")).send().await.unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .get(format!("http://{addr}/api/sessions"))
        .header("Authorization", "Bearer wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .get(format!("http://{addr}/api/sessions"))
        .header("Authorization", "Bearer s3cret")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client.get(format!("http://{addr}/api/sessions?token=s3cret")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn set_working_dir_is_validated_through_the_path_guard() {
    let (addr, _registry, _root) = spawn_test_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/api/set-working-dir"))
        .json(&serde_json::json!({ "path": "../../etc" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn list_tools_reports_every_known_tool() {
    let (addr, _registry, _root) = spawn_test_server().await;
    let tools: Vec<serde_json::Value> = reqwest::get(format!("http://{addr}/api/tools")).await.unwrap().json().await.unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t["tool"].as_str().unwrap()).collect();
    assert!(names.contains(&"claude"));
    assert!(names.contains(&"codex"));
    assert!(names.contains(&"copilot"));
    assert!(names.contains(&"gemini"));
    assert!(names.contains(&"terminal"));
}
