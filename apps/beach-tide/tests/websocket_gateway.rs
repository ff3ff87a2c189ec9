use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use beach_tide::signaling::{
    PluginHandle, SFU_PLUGIN, Session, SessionConfig, SessionState, SignalLink,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use test_timeout::tokio_timeout_test;

#[derive(Clone, Default)]
struct Recorded {
    protocols: Arc<Mutex<Vec<String>>>,
    requests: Arc<Mutex<Vec<Value>>>,
}

async fn upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(recorded): State<Recorded>,
) -> Response {
    if let Some(value) = headers
        .get("sec-websocket-protocol")
        .and_then(|value| value.to_str().ok())
    {
        recorded.protocols.lock().push(value.to_string());
    }
    ws.protocols(["janus-protocol"])
        .on_upgrade(move |socket| serve(socket, recorded))
}

async fn serve(mut socket: WebSocket, recorded: Recorded) {
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(request) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        recorded.requests.lock().push(request.clone());
        let transaction = request["transaction"].clone();
        let replies = match request["janus"].as_str().unwrap_or_default() {
            "create" => vec![json!({
                "janus": "success",
                "transaction": transaction,
                "data": {"id": 77}
            })],
            "attach" => vec![json!({
                "janus": "success",
                "session_id": 77,
                "transaction": transaction,
                "data": {"id": 88}
            })],
            "message" => vec![
                json!({"janus": "ack", "session_id": 77, "transaction": transaction}),
                json!({
                    "janus": "event",
                    "session_id": 77,
                    "sender": 88,
                    "transaction": transaction,
                    "plugindata": {
                        "plugin": SFU_PLUGIN,
                        "data": {"success": true, "response": {"users": {}}}
                    }
                }),
            ],
            _ => vec![json!({"janus": "success", "session_id": 77, "transaction": transaction})],
        };
        for reply in replies {
            if socket.send(Message::Text(reply.to_string())).await.is_err() {
                return;
            }
        }
    }
}

#[tokio_timeout_test]
async fn session_runs_over_a_real_websocket() {
    let recorded = Recorded::default();
    let app = Router::new()
        .route("/janus", get(upgrade))
        .with_state(recorded.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let link = SignalLink::connect(&format!("http://{addr}/janus"))
        .await
        .unwrap();
    let session = Session::start(link, SessionConfig::default());
    assert_eq!(session.create().await.unwrap(), 77);

    let handle = PluginHandle::new(&session);
    assert_eq!(handle.attach(SFU_PLUGIN).await.unwrap(), 88);
    let reply = handle
        .send_message(json!({"kind": "block", "whom": "3"}))
        .await
        .unwrap();
    assert_eq!(reply.data["success"], true);

    handle.detach().await;
    session.destroy().await;
    assert_eq!(session.state(), SessionState::Destroyed);

    assert_eq!(*recorded.protocols.lock(), vec!["janus-protocol".to_string()]);
    let kinds: Vec<_> = recorded
        .requests
        .lock()
        .iter()
        .map(|request| request["janus"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(kinds, ["create", "attach", "message", "detach", "destroy"]);
    let message = recorded
        .requests
        .lock()
        .iter()
        .find(|request| request["janus"] == "message")
        .cloned()
        .unwrap();
    assert_eq!(message["session_id"], 77);
    assert_eq!(message["handle_id"], 88);
    assert_eq!(message["body"]["whom"], "3");
}
