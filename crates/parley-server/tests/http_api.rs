use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use futures::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use parley_ai::ScriptedAdapter;
use parley_ai::scripted::reply_steps;
use parley_core::testkit::create_test_store;
use parley_server::config::Provider;
use parley_server::{AppState, ParleyConfig, build_router};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

fn scripted_config() -> ParleyConfig {
    let mut config = ParleyConfig::default();
    config.generation.provider = Provider::Scripted;
    config
}

fn test_app(adapter: ScriptedAdapter) -> (Router, AppState, tempfile::TempDir) {
    let (store, dir) = create_test_store();
    let state = AppState::new(scripted_config(), store, Arc::new(adapter), "scripted");
    (build_router(state.clone()), state, dir)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_reports_model_and_count() {
    let (app, _state, _dir) = test_app(ScriptedAdapter::new());

    let (status, body) = send(&app, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["service"], json!("parley"));
    assert_eq!(body["model"], json!("scripted"));
    assert_eq!(body["memory_count"], json!(0));

    let (status, body) = send(&app, get("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["health"], json!("/healthz"));
}

#[tokio::test]
async fn test_write_then_read_back_ranked() {
    let (app, _state, _dir) = test_app(ScriptedAdapter::new());

    for (text, salience) in [("bought bread", 0), ("returned lost ring", 2), ("saved the mill", 3)]
    {
        let (status, body) = send(
            &app,
            post_json(
                "/v1/memory/write",
                json!({
                    "npc_id": "elenor",
                    "player_id": "p1",
                    "text": text,
                    "salience": salience,
                    "keys": ["village"]
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["ok"], json!(true));
        assert!(body["id"].as_str().unwrap().starts_with("mem-"));
    }

    let (status, body) = send(&app, get("/v1/memory/top?npc_id=elenor&player_id=p1&k=2")).await;
    assert_eq!(status, StatusCode::OK);
    let texts: Vec<&str> = body["memories"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["text"].as_str().unwrap())
        .collect();
    assert_eq!(texts, vec!["saved the mill", "returned lost ring"]);
    assert_eq!(body["memories"][0]["npc_id"], json!("elenor"));
    assert_eq!(body["memories"][0]["private"], json!(true));

    let (_, body) = send(
        &app,
        get("/v1/memory/top?npc_id=elenor&player_id=p1&min_salience=3"),
    )
    .await;
    assert_eq!(body["memories"].as_array().unwrap().len(), 1);

    let (status, body) = send(&app, get("/v1/memory/all/elenor?player_id=p1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], json!(3));
    assert_eq!(body["memories"][0]["text"], json!("saved the mill"));

    let (_, body) = send(&app, get("/v1/memory/all/elenor?player_id=p2")).await;
    assert_eq!(body["count"], json!(0));

    let (_, body) = send(&app, get("/healthz")).await;
    assert_eq!(body["memory_count"], json!(3));
}

#[tokio::test]
async fn test_invalid_write_is_unprocessable() {
    let (app, state, _dir) = test_app(ScriptedAdapter::new());

    let (status, body) = send(
        &app,
        post_json(
            "/v1/memory/write",
            json!({
                "npc_id": "elenor",
                "player_id": "p1",
                "text": "x".repeat(161),
                "salience": 4
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let fields: Vec<&str> = body["error"]["violations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["field"].as_str().unwrap())
        .collect();
    assert_eq!(fields, vec!["text", "salience"]);
    assert_eq!(state.memory.count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_out_of_range_timestamp_is_rejected() {
    let (app, state, _dir) = test_app(ScriptedAdapter::new());
    let write = |ts: Value| {
        post_json(
            "/v1/memory/write",
            json!({"npc_id": "elenor", "player_id": "p1", "text": "waved", "salience": 1, "ts": ts}),
        )
    };

    let (status, body) = send(&app, write(json!(i64::MAX))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["violations"][0]["field"], json!("timestamp"));

    let (status, _) = send(&app, write(json!(-1))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = send(&app, write(json!(1_700_000_000_000_i64))).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = send(&app, write(Value::Null)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(state.memory.count(Some("elenor")).await.unwrap(), 2);
}

#[tokio::test]
async fn test_list_limit_is_bounded() {
    let (app, _state, _dir) = test_app(ScriptedAdapter::new());
    let (status, _) = send(&app, get("/v1/memory/all/elenor?limit=0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("ws://{addr}/v1/chat.stream")
}

async fn run_socket(url: &str, opening: Message) -> Vec<Value> {
    let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    socket.send(opening).await.unwrap();

    let mut frames = Vec::new();
    while let Some(message) = socket.next().await {
        match message {
            Ok(Message::Text(text)) => frames.push(serde_json::from_str(text.as_str()).unwrap()),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    frames
}

#[tokio::test]
async fn test_chat_stream_turn_end_to_end() {
    let payload = json!({
        "utterance": "Back again? Good.",
        "emotion": "happy",
        "style_tags": ["casual"],
        "behavior_directive": "open_shop",
        "memory_writes": [{"salience": 2, "text": "Player came back to the forge"}],
        "public_events": []
    });
    let (app, state, _dir) = test_app(ScriptedAdapter::from_scripts(vec![reply_steps(
        payload,
    )]));
    let url = serve(app).await;

    let request = json!({
        "npc_id": "brom",
        "player_id": "p1",
        "player_text": "Hello again",
        "persona": {"name": "Brom"},
        "context": {"scene": "forge"}
    });
    let frames = run_socket(&url, Message::Text(request.to_string().into())).await;

    let (last, tokens) = frames.split_last().unwrap();
    let text: String = tokens
        .iter()
        .map(|f| {
            assert_eq!(f["type"], json!("token"));
            f["text"].as_str().unwrap()
        })
        .collect();
    assert_eq!(text, "Back again? Good.");

    assert_eq!(last["type"], json!("final"));
    let result: Value = serde_json::from_str(last["json"].as_str().unwrap()).unwrap();
    assert_eq!(result["behavior_directive"], json!("open_shop"));
    assert_eq!(last["memory_write_failures"], json!([]));

    let stored = state
        .memory
        .list_for_subject("brom", Some("p1"), 10)
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].text, "Player came back to the forge");
}

#[tokio::test]
async fn test_chat_stream_rejects_malformed_requests() {
    let (app, _state, _dir) = test_app(ScriptedAdapter::new());
    let url = serve(app).await;

    let frames = run_socket(&url, Message::Text("{not json".to_string().into())).await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], json!("error"));
    assert_eq!(frames[0]["kind"], json!("malformed_request"));

    let frames = run_socket(
        &url,
        Message::Text(json!({"player_text": "hi"}).to_string().into()),
    )
    .await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["kind"], json!("malformed_request"));
    let message = frames[0]["message"].as_str().unwrap();
    assert!(message.contains("npc_id"));
    assert!(message.contains("player_id"));
}
