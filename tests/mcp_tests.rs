// ABOUTME: End-to-end tests for the MCP tool façade through the axum router
// ABOUTME: Uses the in-memory platform as the chat backend and a memory watermark store

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use parley::config::Config;
use parley::mcp::McpState;
use parley::platform::MemoryPlatform;
use parley::server::build_router;
use parley_core::{MemoryWatermarkStore, WaiterRegistry};

const TOKEN: &str = "bot-token";
const BOT: u64 = 900;
const HUMAN: u64 = 42;
const CHANNEL: u64 = 10;

struct TestApp {
    router: Router,
    platform: MemoryPlatform,
    waiters: WaiterRegistry,
}

fn test_app() -> TestApp {
    test_app_with(Config::default())
}

fn test_app_with(config: Config) -> TestApp {
    let platform = MemoryPlatform::new();
    platform.register_bot(TOKEN, BOT);
    platform.add_channel(CHANNEL, &[BOT, HUMAN]);
    platform.add_channel(11, &[HUMAN]);

    let state = McpState::new(
        &config,
        Arc::new(platform.clone()),
        Arc::new(MemoryWatermarkStore::new()),
    );
    let waiters = state.waiters.clone();
    TestApp {
        router: build_router(state, None),
        platform,
        waiters,
    }
}

async fn rpc(router: &Router, token: Option<&str>, body: Value) -> Value {
    let mut request = Request::post("/mcp").header("content-type", "application/json");
    if let Some(token) = token {
        request = request.header("x-bot-token", token);
    }
    let response = router
        .clone()
        .oneshot(request.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

async fn call_tool(router: &Router, token: Option<&str>, name: &str, arguments: Value) -> Value {
    rpc(
        router,
        token,
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": { "name": name, "arguments": arguments }
        }),
    )
    .await
}

/// Parse the JSON text payload of a tool result.
fn tool_payload(response: &Value) -> Value {
    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    serde_json::from_str(text).unwrap()
}

fn is_error(response: &Value) -> bool {
    response["result"]["isError"].as_bool().unwrap_or(false)
}

#[tokio::test]
async fn test_initialize_and_tools_list() {
    let app = test_app();

    let init = rpc(
        &app.router,
        None,
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
    )
    .await;
    assert_eq!(init["result"]["serverInfo"]["name"], "parley");

    let list = rpc(
        &app.router,
        None,
        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
    )
    .await;
    let tools = list["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 5);
    assert!(tools.iter().any(|t| t["name"] == "get_unread_messages"));
}

#[tokio::test]
async fn test_unknown_method_is_jsonrpc_error() {
    let app = test_app();
    let response = rpc(
        &app.router,
        None,
        json!({"jsonrpc": "2.0", "id": 3, "method": "resources/list"}),
    )
    .await;
    assert_eq!(response["error"]["code"], -32601);
}

#[tokio::test]
async fn test_check_connection_reports_bot_and_closes_session() {
    let app = test_app();

    let response = call_tool(&app.router, Some(TOKEN), "check_connection", json!({})).await;
    assert!(!is_error(&response));
    let payload = tool_payload(&response);
    assert_eq!(payload["status"], "ok");
    assert_eq!(payload["platform"], "memory");
    assert_eq!(payload["bot_user_id"], BOT.to_string());
    assert_eq!(app.platform.open_connections(), 0);
}

#[tokio::test]
async fn test_missing_credential_is_invalid_arguments() {
    let app = test_app();

    let response = call_tool(&app.router, None, "check_connection", json!({})).await;
    assert!(is_error(&response));
    let payload = tool_payload(&response);
    assert_eq!(payload["status"], "error");
    assert_eq!(payload["error_kind"], "invalid_arguments");
}

#[tokio::test]
async fn test_rejected_token_is_session_establishment_error() {
    let app = test_app();

    let response = call_tool(&app.router, Some("wrong"), "check_connection", json!({})).await;
    assert!(is_error(&response));
    assert_eq!(tool_payload(&response)["error_kind"], "session_establishment");
    assert_eq!(app.platform.open_connections(), 0);
}

#[tokio::test]
async fn test_send_message_posts_as_calling_bot() {
    let app = test_app();

    let response = call_tool(
        &app.router,
        Some(TOKEN),
        "send_message",
        json!({"channel_id": CHANNEL.to_string(), "content": "on it"}),
    )
    .await;
    assert!(!is_error(&response));
    let payload = tool_payload(&response);

    let stored = app.platform.messages(CHANNEL);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].author_id, BOT);
    assert_eq!(payload["message_id"], stored[0].id.to_string());
    assert_eq!(app.platform.open_connections(), 0);

    // No access to channel 11
    let denied = call_tool(
        &app.router,
        Some(TOKEN),
        "send_message",
        json!({"channel_id": "11", "content": "hello?"}),
    )
    .await;
    assert!(is_error(&denied));
    assert_eq!(tool_payload(&denied)["error_kind"], "provider");
    assert_eq!(app.platform.open_connections(), 0);
}

#[tokio::test]
async fn test_unread_then_advance_then_empty() {
    let app = test_app();
    for text in ["one", "two", "three"] {
        app.platform.post(CHANNEL, HUMAN, text);
    }
    let channel = CHANNEL.to_string();

    let first = tool_payload(
        &call_tool(
            &app.router,
            Some(TOKEN),
            "get_unread_messages",
            json!({"channel_id": channel}),
        )
        .await,
    );
    assert_eq!(first["origin"], "fallback");
    assert!(first["note"].as_str().is_some());
    assert_eq!(first["count"], 3);
    let contents: Vec<&str> = first["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["content"].as_str().unwrap())
        .collect();
    assert_eq!(contents, vec!["one", "two", "three"]);
    let cursor = first["next_cursor"].as_str().unwrap().to_string();

    let again = tool_payload(
        &call_tool(
            &app.router,
            Some(TOKEN),
            "get_unread_messages",
            json!({"channel_id": channel}),
        )
        .await,
    );
    assert_eq!(again["redelivered"], true);
    assert_eq!(again["messages"], first["messages"]);

    let advanced = tool_payload(
        &call_tool(
            &app.router,
            Some(TOKEN),
            "advance_watermark",
            json!({"channel_id": channel, "message_id": cursor}),
        )
        .await,
    );
    assert_eq!(advanced["status"], "advanced");

    let empty = tool_payload(
        &call_tool(
            &app.router,
            Some(TOKEN),
            "get_unread_messages",
            json!({"channel_id": channel}),
        )
        .await,
    );
    assert_eq!(empty["origin"], "watermark");
    assert_eq!(empty["count"], 0);
    assert_eq!(empty["next_cursor"], cursor.as_str());

    let stale = tool_payload(
        &call_tool(
            &app.router,
            Some(TOKEN),
            "advance_watermark",
            json!({"channel_id": channel, "message_id": "1"}),
        )
        .await,
    );
    assert_eq!(stale["status"], "ignored");
    assert_eq!(stale["last_seen_id"], cursor.as_str());
    assert_eq!(app.platform.open_connections(), 0);
}

#[tokio::test]
async fn test_unread_filter_and_bad_arguments() {
    let app = test_app();
    app.platform.post(CHANNEL, 7, "noise");
    let wanted = app.platform.post(CHANNEL, HUMAN, "ping");

    let filtered = tool_payload(
        &call_tool(
            &app.router,
            Some(TOKEN),
            "get_unread_messages",
            json!({"channel_id": CHANNEL, "sender_id": HUMAN.to_string()}),
        )
        .await,
    );
    assert_eq!(filtered["count"], 1);
    assert_eq!(filtered["messages"][0]["id"], wanted.id.to_string());

    let missing_channel =
        call_tool(&app.router, Some(TOKEN), "get_unread_messages", json!({})).await;
    assert!(is_error(&missing_channel));
    assert_eq!(tool_payload(&missing_channel)["error_kind"], "invalid_arguments");

    let bad_regex = call_tool(
        &app.router,
        Some(TOKEN),
        "wait_for_message",
        json!({"content_regex": "(unclosed"}),
    )
    .await;
    assert_eq!(tool_payload(&bad_regex)["error_kind"], "invalid_arguments");
}

#[tokio::test]
async fn test_wait_for_message_resolves_on_matching_post() {
    let app = test_app();
    let router = app.router.clone();
    let waiting = tokio::spawn(async move {
        call_tool(
            &router,
            Some(TOKEN),
            "wait_for_message",
            json!({"channel_id": CHANNEL.to_string(), "content_contains": "go", "timeout": 30}),
        )
        .await
    });

    for _ in 0..200 {
        if app.waiters.pending_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(app.waiters.pending_count(), 1);

    app.platform.post(CHANNEL, HUMAN, "not yet");
    let go = app.platform.post(CHANNEL, HUMAN, "go go go");

    let payload = tool_payload(&waiting.await.unwrap());
    assert_eq!(payload["status"], "matched");
    assert_eq!(payload["message"]["id"], go.id.to_string());
    assert_eq!(payload["message"]["author_id"], HUMAN.to_string());
}

#[tokio::test]
async fn test_wait_for_message_times_out_as_status() {
    let app = test_app();

    let response = call_tool(
        &app.router,
        Some(TOKEN),
        "wait_for_message",
        json!({"timeout": 0.05}),
    )
    .await;
    assert!(!is_error(&response));
    assert_eq!(tool_payload(&response)["status"], "timed_out");
}

#[tokio::test]
async fn test_wait_timeout_above_server_maximum_is_rejected() {
    let mut config = Config::default();
    config.waiter.max_timeout_secs = 60;
    let app = test_app_with(config);

    let response = call_tool(
        &app.router,
        Some(TOKEN),
        "wait_for_message",
        json!({"timeout": 7200}),
    )
    .await;
    assert!(is_error(&response));
    assert_eq!(tool_payload(&response)["error_kind"], "invalid_arguments");
    assert_eq!(app.waiters.pending_count(), 0);
    assert_eq!(app.platform.open_connections(), 0);
}

#[tokio::test]
async fn test_health_reports_sessions_and_waits() {
    let app = test_app();

    let response = app
        .router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["platform"], "memory");
    assert_eq!(json["wait_mode"], "stateful");
    assert_eq!(json["pending_waits"], 0);
}

#[tokio::test]
async fn test_metrics_route_absent_without_recorder() {
    let app = test_app();

    let response = app
        .router
        .clone()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
