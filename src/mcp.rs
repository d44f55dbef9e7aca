// ABOUTME: MCP (Model Context Protocol) tool façade over the parley core
// ABOUTME: Exposes waiting, unread reconciliation, watermark, and send tools via an HTTP JSON-RPC endpoint

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use parley_core::config::WaiterConfig;
use parley_core::metrics;
use parley_core::{
    AdvanceOutcome, BacklogError, BacklogReconciler, BatchOrigin, Credential, FilterError,
    IncomingMessage, MessageFilter, ProviderError, RelayError, Scope, SessionEstablishmentError,
    SessionManager, WaitOutcome, WaiterRegistry,
};

/// Header carrying the bot token for a single call.
pub const BOT_TOKEN_HEADER: &str = "x-bot-token";

/// MCP server state shared with handlers
#[derive(Clone)]
pub struct McpState {
    pub sessions: SessionManager,
    pub waiters: WaiterRegistry,
    pub backlog: Arc<BacklogReconciler>,
    pub waiter_config: WaiterConfig,
    pub default_page_size: usize,
    /// Cancelled on process shutdown; interrupts indefinite waits
    pub shutdown: CancellationToken,
}

/// JSON-RPC request structure
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC response structure
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Tool definition for MCP
#[derive(Debug, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

// =============================================================================
// Tool errors
// =============================================================================

/// Failure of a tool call, rendered as an `isError` result with an `error_kind`.
#[derive(Debug, Error)]
enum ToolError {
    #[error("{0}")]
    InvalidArguments(String),

    #[error(transparent)]
    Session(#[from] SessionEstablishmentError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("watermark store error: {0}")]
    Store(anyhow::Error),

    #[error("{0}")]
    Operation(anyhow::Error),
}

impl ToolError {
    fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArguments(_) => "invalid_arguments",
            Self::Session(_) => "session_establishment",
            Self::Provider(_) | Self::Operation(_) => "provider",
            Self::Store(_) => "store",
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArguments(message.into())
    }
}

impl From<BacklogError> for ToolError {
    fn from(err: BacklogError) -> Self {
        match err {
            BacklogError::Provider(e) => Self::Provider(e),
            BacklogError::Store(e) => Self::Store(e),
        }
    }
}

impl From<FilterError> for ToolError {
    fn from(err: FilterError) -> Self {
        Self::InvalidArguments(err.to_string())
    }
}

impl From<RelayError> for ToolError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Session(e) => Self::Session(e),
            RelayError::Provider(e) => Self::Provider(e),
            RelayError::Operation(e) => match e.downcast::<BacklogError>() {
                Ok(backlog) => backlog.into(),
                Err(e) => match e.downcast::<ProviderError>() {
                    Ok(provider) => Self::Provider(provider),
                    Err(e) => Self::Operation(e),
                },
            },
        }
    }
}

type ToolResult = Result<Value, ToolError>;

// =============================================================================
// Credentials and arguments
// =============================================================================

/// Read the per-call credential from `X-Bot-Token` or `Authorization: Bot <token>`.
pub fn credential_from_headers(headers: &HeaderMap) -> Option<Credential> {
    if let Some(token) = headers
        .get(BOT_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return Some(Credential::new(token));
    }

    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("Bot "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(Credential::new)
}

fn require_credential(credential: Option<&Credential>) -> Result<&Credential, ToolError> {
    credential.ok_or_else(|| {
        ToolError::invalid("Missing credential: send the bot token in the X-Bot-Token header")
    })
}

/// Ids may arrive as decimal strings (preferred, lossless) or JSON numbers.
fn id_arg(args: &Value, name: &str) -> Result<Option<u64>, ToolError> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ToolError::invalid(format!("{} must be a numeric id, got: {}", name, s))),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| ToolError::invalid(format!("{} must be a positive integer", name))),
        Some(other) => Err(ToolError::invalid(format!(
            "{} must be a string id, got: {}",
            name, other
        ))),
    }
}

fn required_id(args: &Value, name: &str) -> Result<u64, ToolError> {
    id_arg(args, name)?
        .ok_or_else(|| ToolError::invalid(format!("Missing required parameter: {}", name)))
}

fn bool_arg(args: &Value, name: &str) -> bool {
    args.get(name).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn str_arg<'a>(args: &'a Value, name: &str) -> Option<&'a str> {
    args.get(name)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

/// Build a filter from the shared filter arguments.
fn filter_from_args(args: &Value, include_channel: bool) -> Result<MessageFilter, ToolError> {
    let mut filter = MessageFilter::any();
    if include_channel {
        if let Some(channel_id) = id_arg(args, "channel_id")? {
            filter = filter.channel(channel_id);
        }
    }
    if bool_arg(args, "dm_only") {
        filter = filter.dm_only();
    }
    if bool_arg(args, "mention_only") {
        filter = filter.mention_only();
    }
    if let Some(sender_id) = id_arg(args, "sender_id")? {
        filter = filter.sender(sender_id);
    }
    if let Some(needle) = str_arg(args, "content_contains") {
        filter = filter.content_contains(needle);
    }
    if let Some(pattern) = str_arg(args, "content_regex") {
        filter = filter.content_regex(pattern)?;
    }
    Ok(filter)
}

fn message_json(message: &IncomingMessage) -> Value {
    json!({
        "id": message.id.to_string(),
        "channel_id": message.channel_id.to_string(),
        "author_id": message.author_id.to_string(),
        "content": message.content,
        "timestamp": message.timestamp.to_rfc3339(),
        "is_dm": message.is_dm,
        "mentions": message.mentions.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
    })
}

// =============================================================================
// Tool list
// =============================================================================

fn filter_properties() -> serde_json::Map<String, Value> {
    let properties = json!({
        "dm_only": {
            "type": "boolean",
            "description": "Only match direct messages (optional)"
        },
        "mention_only": {
            "type": "boolean",
            "description": "Only match messages mentioning the bot (optional)"
        },
        "sender_id": {
            "type": "string",
            "description": "Only match messages from this user ID (optional)"
        },
        "content_contains": {
            "type": "string",
            "description": "Only match messages containing this text (optional)"
        },
        "content_regex": {
            "type": "string",
            "description": "Regex searched in message content (optional)"
        }
    });
    match properties {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}

/// Get list of available tools
fn get_tools() -> Vec<ToolDefinition> {
    let mut wait_properties = filter_properties();
    wait_properties.insert(
        "channel_id".to_string(),
        json!({"type": "string", "description": "Channel ID to filter (optional)"}),
    );
    wait_properties.insert(
        "timeout".to_string(),
        json!({"type": "number", "description": "Timeout in seconds (optional; 0 or omitted waits until a match or shutdown; must not exceed the server maximum)"}),
    );

    let mut unread_properties = filter_properties();
    unread_properties.insert(
        "channel_id".to_string(),
        json!({"type": "string", "description": "Channel ID"}),
    );
    unread_properties.insert(
        "since_message_id".to_string(),
        json!({"type": "string", "description": "Only return messages after this ID; overrides the stored watermark (optional)"}),
    );
    unread_properties.insert(
        "limit".to_string(),
        json!({"type": "number", "description": "Page size (max 100)", "minimum": 1, "maximum": 100}),
    );

    vec![
        ToolDefinition {
            name: "wait_for_message".to_string(),
            description: "Block until the next incoming message matching the filters arrives. Returns status matched, timed_out, cancelled, or connection_lost.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": wait_properties,
                "required": []
            }),
        },
        ToolDefinition {
            name: "get_unread_messages".to_string(),
            description: "Get messages not yet acknowledged in a channel, oldest first. Process the whole batch, then call advance_watermark with next_cursor; until then the same batch is re-delivered. Without a watermark only the most recent messages are considered (best effort).".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": unread_properties,
                "required": ["channel_id"]
            }),
        },
        ToolDefinition {
            name: "advance_watermark".to_string(),
            description: "Acknowledge processed messages by moving the channel watermark forward. Stale values are ignored. Advancing past messages you did not act on loses them.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "channel_id": {"type": "string", "description": "Channel ID"},
                    "message_id": {"type": "string", "description": "Highest processed message ID (usually next_cursor)"}
                },
                "required": ["channel_id", "message_id"]
            }),
        },
        ToolDefinition {
            name: "send_message".to_string(),
            description: "Send a message to a channel as the calling bot.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "channel_id": {"type": "string", "description": "Channel ID"},
                    "content": {"type": "string", "description": "Message text"}
                },
                "required": ["channel_id", "content"]
            }),
        },
        ToolDefinition {
            name: "check_connection".to_string(),
            description: "Verify the bot token by opening and closing a connection. Reports the bot's user ID.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        },
    ]
}

// =============================================================================
// JSON-RPC dispatch
// =============================================================================

/// Handle MCP JSON-RPC requests
pub async fn mcp_handler(
    State(state): State<Arc<McpState>>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    tracing::debug!(method = %request.method, "MCP request received");

    let credential = credential_from_headers(&headers);
    let response = match request.method.as_str() {
        "initialize" => handle_initialize(&request),
        "notifications/initialized" => handle_initialized_notification(&request),
        "tools/list" => handle_tools_list(&request),
        "tools/call" => handle_tools_call(&state, credential.as_ref(), &request).await,
        _ => JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: request.id,
            result: None,
            error: Some(JsonRpcError {
                code: -32601,
                message: format!("Method not found: {}", request.method),
                data: None,
            }),
        },
    };

    (StatusCode::OK, Json(response))
}

fn handle_initialize(request: &JsonRpcRequest) -> JsonRpcResponse {
    tracing::info!("MCP initialize request received");
    JsonRpcResponse {
        jsonrpc: "2.0".to_string(),
        id: request.id.clone(),
        result: Some(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {
                "tools": {}
            },
            "serverInfo": {
                "name": "parley",
                "version": env!("CARGO_PKG_VERSION")
            }
        })),
        error: None,
    }
}

fn handle_initialized_notification(request: &JsonRpcRequest) -> JsonRpcResponse {
    tracing::debug!("MCP initialized notification received");
    JsonRpcResponse {
        jsonrpc: "2.0".to_string(),
        id: request.id.clone(),
        result: Some(json!({})),
        error: None,
    }
}

fn handle_tools_list(request: &JsonRpcRequest) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0".to_string(),
        id: request.id.clone(),
        result: Some(json!({
            "tools": get_tools()
        })),
        error: None,
    }
}

async fn handle_tools_call(
    state: &McpState,
    credential: Option<&Credential>,
    request: &JsonRpcRequest,
) -> JsonRpcResponse {
    let params = &request.params;
    let tool_name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

    match credential {
        Some(credential) => {
            tracing::info!(tool = %tool_name, identity = %credential.identity(), "MCP tool call")
        }
        None => tracing::info!(tool = %tool_name, "MCP tool call without credential"),
    }

    let result = match tool_name {
        "wait_for_message" => handle_wait_for_message(state, credential, &arguments).await,
        "get_unread_messages" => handle_get_unread_messages(state, credential, &arguments).await,
        "advance_watermark" => handle_advance_watermark(state, credential, &arguments),
        "send_message" => handle_send_message(state, credential, &arguments).await,
        "check_connection" => handle_check_connection(state, credential).await,
        _ => Err(ToolError::invalid(format!("Unknown tool: {}", tool_name))),
    };

    let (body, is_error) = match result {
        Ok(value) => {
            metrics::record_tool_call(tool_name, "ok");
            (value, false)
        }
        Err(error) => {
            metrics::record_tool_call(tool_name, error.kind());
            tracing::warn!(tool = %tool_name, error_kind = error.kind(), error = %error, "MCP tool call failed");
            (
                json!({
                    "status": "error",
                    "error_kind": error.kind(),
                    "message": error.to_string(),
                }),
                true,
            )
        }
    };

    let text = serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string());
    let mut result = json!({
        "content": [{
            "type": "text",
            "text": text
        }]
    });
    if is_error {
        result["isError"] = json!(true);
    }

    JsonRpcResponse {
        jsonrpc: "2.0".to_string(),
        id: request.id.clone(),
        result: Some(result),
        error: None,
    }
}

// =============================================================================
// Tools
// =============================================================================

async fn handle_wait_for_message(
    state: &McpState,
    credential: Option<&Credential>,
    args: &Value,
) -> ToolResult {
    let credential = require_credential(credential)?;
    let filter = filter_from_args(args, true)?;
    let requested = match args.get("timeout") {
        None | Some(Value::Null) => None,
        Some(value) => Some(
            value
                .as_f64()
                .ok_or_else(|| ToolError::invalid("timeout must be a number of seconds"))?,
        ),
    };
    let timeout = state
        .waiter_config
        .effective_timeout(requested)
        .map_err(|e| ToolError::invalid(e.to_string()))?;

    let lease = state
        .sessions
        .acquire(credential, state.waiter_config.wait_mode)
        .await?;
    let outcome = state
        .waiters
        .wait(lease.session(), filter, timeout, &state.shutdown)
        .await;
    lease.release().await;

    Ok(match outcome {
        WaitOutcome::Matched { message } => json!({
            "status": "matched",
            "message": message_json(&message),
        }),
        WaitOutcome::TimedOut => json!({
            "status": "timed_out",
            "timeout_secs": timeout.map(|t| t.as_secs_f64()),
        }),
        WaitOutcome::Cancelled => json!({ "status": "cancelled" }),
        WaitOutcome::ConnectionLost => json!({ "status": "connection_lost" }),
    })
}

async fn handle_get_unread_messages(
    state: &McpState,
    credential: Option<&Credential>,
    args: &Value,
) -> ToolResult {
    let credential = require_credential(credential)?;
    let channel_id = required_id(args, "channel_id")?;
    let since = id_arg(args, "since_message_id")?;
    let page_size = match args.get("limit").and_then(|v| v.as_u64()) {
        Some(limit) => limit as usize,
        None => state.default_page_size,
    };
    let filter = filter_from_args(args, false)?;

    let scope = Scope::for_credential(credential, channel_id);
    let backlog = Arc::clone(&state.backlog);
    let batch = state
        .sessions
        .with_ephemeral_session(credential, |session| async move {
            let batch = backlog.fetch_unread(&session, &scope, since, page_size).await?;
            Ok::<_, anyhow::Error>(batch.filtered(&filter, session.bot_user_id()))
        })
        .await?;

    let mut body = json!({
        "status": "ok",
        "scope": batch.scope_key,
        "origin": batch.origin.as_str(),
        "count": batch.messages.len(),
        "messages": batch.messages.iter().map(message_json).collect::<Vec<_>>(),
        "next_cursor": batch.next_cursor.map(|id| id.to_string()),
        "redelivered": batch.redelivered,
        "page_full": batch.page_full,
    });
    if batch.origin == BatchOrigin::Fallback {
        body["note"] = json!(format!(
            "No watermark for this channel yet: only the {} most recent messages were considered; anything older is not delivered.",
            state.backlog.fallback_window()
        ));
    }
    Ok(body)
}

fn handle_advance_watermark(
    state: &McpState,
    credential: Option<&Credential>,
    args: &Value,
) -> ToolResult {
    let credential = require_credential(credential)?;
    let channel_id = required_id(args, "channel_id")?;
    let message_id = required_id(args, "message_id")?;

    let scope = Scope::for_credential(credential, channel_id);
    Ok(match state.backlog.advance(&scope, message_id)? {
        AdvanceOutcome::Advanced { previous } => json!({
            "status": "advanced",
            "last_seen_id": message_id.to_string(),
            "previous": previous.map(|id| id.to_string()),
        }),
        AdvanceOutcome::Ignored { current } => json!({
            "status": "ignored",
            "last_seen_id": current.to_string(),
            "requested": message_id.to_string(),
        }),
    })
}

async fn handle_send_message(
    state: &McpState,
    credential: Option<&Credential>,
    args: &Value,
) -> ToolResult {
    let credential = require_credential(credential)?;
    let channel_id = required_id(args, "channel_id")?;
    let content = args
        .get("content")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolError::invalid("Missing required parameter: content"))?
        .to_string();

    let message_id = state
        .sessions
        .with_ephemeral_session(credential, |session| async move {
            Ok::<_, anyhow::Error>(session.send(channel_id, &content).await?)
        })
        .await?;

    Ok(json!({
        "status": "ok",
        "message_id": message_id.to_string(),
        "channel_id": channel_id.to_string(),
    }))
}

async fn handle_check_connection(state: &McpState, credential: Option<&Credential>) -> ToolResult {
    let credential = require_credential(credential)?;
    let bot_user_id = state
        .sessions
        .with_ephemeral_session(credential, |session| async move {
            Ok::<_, anyhow::Error>(session.bot_user_id())
        })
        .await?;

    Ok(json!({
        "status": "ok",
        "platform": state.sessions.platform_id(),
        "identity": credential.identity().to_string(),
        "bot_user_id": bot_user_id.to_string(),
    }))
}
