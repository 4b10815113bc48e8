use std::sync::Arc;

use agentmux_server::config::Config;
use agentmux_server::core::Registry;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

async fn spawn_test_server(auth_token: Option<String>) -> (std::net::SocketAddr, tempfile::TempDir) {
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

    let router = agentmux_server::build_router(config, registry, restart_manager);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (addr, root)
}

async fn next_json(ws: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin)) -> serde_json::Value {
    loop {
        match ws.next().await.expect("stream ended").unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

#[tokio::test]
async fn connect_without_token_is_rejected_when_auth_required() {
    let (addr, _root) = spawn_test_server(Some("s3cret".to_string())).await;
    let err = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(resp) => assert_eq!(resp.status(), 401),
        other => panic!("expected an HTTP rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn connect_with_correct_token_is_accepted_and_greeted() {
    let (addr, _root) = spawn_test_server(Some("s3cret".to_string())).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token=s3cret")).await.unwrap();

    let hello = next_json(&mut ws).await;
    assert_eq!(hello["type"], "connected");
    assert!(hello["connection_id"].as_u64().is_some());
}

#[tokio::test]
async fn create_join_and_ping_round_trip_over_the_control_channel() {
    let (addr, _root) = spawn_test_server(None).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let _hello = next_json(&mut ws).await;

    ws.send(Message::Text(serde_json::json!({"type": "create_session", "name": "demo"}).to_string().into()))
        .await
        .unwrap();
    let created = next_json(&mut ws).await;
    assert_eq!(created["type"], "session_created");
    let session_id = created["session_id"].as_str().unwrap().to_string();

    ws.send(Message::Text(serde_json::json!({"type": "join_session", "sessionId": session_id}).to_string().into()))
        .await
        .unwrap();
    let joined = next_json(&mut ws).await;
    assert_eq!(joined["type"], "session_joined");
    assert_eq!(joined["session_id"], session_id);
    assert_eq!(joined["backlog_chunks"], 0);

    ws.send(Message::Text(serde_json::json!({"type": "ping"}).to_string().into())).await.unwrap();
    let pong = next_json(&mut ws).await;
    assert_eq!(pong["type"], "pong");
}

#[tokio::test]
async fn starting_the_terminal_tool_echoes_input_back_as_binary_output() {
    let (addr, _root) = spawn_test_server(None).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let _hello = next_json(&mut ws).await;

    ws.send(Message::Text(serde_json::json!({"type": "create_session", "name": "terminal-test"}).to_string().into()))
        .await
        .unwrap();
    let created = next_json(&mut ws).await;
    let session_id = created["session_id"].as_str().unwrap().to_string();

    ws.send(Message::Text(serde_json::json!({"type": "join_session", "sessionId": session_id}).to_string().into()))
        .await
        .unwrap();
    let _joined = next_json(&mut ws).await;

    ws.send(Message::Text(serde_json::json!({"type": "start_terminal"}).to_string().into())).await.unwrap();
    let started = next_json(&mut ws).await;
    assert_eq!(started["type"], "tool_started");

    ws.send(Message::Text(serde_json::json!({"type": "input", "data": "echo MARKER_ABC\r"}).to_string().into()))
        .await
        .unwrap();

    let found = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            match ws.next().await.expect("stream ended").unwrap() {
                Message::Binary(bytes) => {
                    if String::from_utf8_lossy(&bytes).contains("MARKER_ABC") {
                        return;
                    }
                }
                Message::Text(_) | Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    })
    .await;
    assert!(found.is_ok(), "did not see MARKER_ABC in a binary frame within 5s");
}

#[tokio::test]
async fn malformed_control_message_yields_an_error_reply_not_a_dropped_connection() {
    let (addr, _root) = spawn_test_server(None).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let _hello = next_json(&mut ws).await;

    ws.send(Message::Text(serde_json::json!({"type": "resize", "cols": 0, "rows": 24}).to_string().into()))
        .await
        .unwrap();
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "error");

    // the socket is still alive after the error
    ws.send(Message::Text(serde_json::json!({"type": "ping"}).to_string().into())).await.unwrap();
    let pong = next_json(&mut ws).await;
    assert_eq!(pong["type"], "pong");
}
