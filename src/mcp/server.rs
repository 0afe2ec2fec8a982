use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

use super::protocol::{error_codes, methods, JsonRpcId, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION};
use crate::session::SharedSession;
use crate::tools::{call_tool_shared, tool_definitions, ToolResponse};

pub const SERVER_NAME: &str = "feeder-mcp";

/// MCP server speaking newline-delimited JSON-RPC.
#[derive(Clone)]
pub struct McpServer {
    session: SharedSession,
}

impl McpServer {
    pub fn new(session: SharedSession) -> Self {
        Self { session }
    }

    /// Serve stdin/stdout until EOF, a `shutdown` request, or `shutdown_signal`.
    pub async fn run_stdio(&self, shutdown_signal: impl std::future::Future<Output = ()>) -> anyhow::Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();
        tokio::pin!(shutdown_signal);
        info!("MCP server listening on stdio");

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = &mut shutdown_signal => break,
            };
            let Some(line) = line else {
                info!("stdin closed");
                break;
            };
            let (response, stop) = self.handle_line(&line).await;
            if let Some(response) = response {
                write_message(&mut stdout, &response).await?;
            }
            if stop {
                break;
            }
        }
        info!("MCP server stopped");
        Ok(())
    }

    /// Handle one input line. Returns the reply (none for blank lines and
    /// notifications) and whether the client asked to shut down.
    pub async fn handle_line(&self, line: &str) -> (Option<JsonRpcResponse>, bool) {
        let line = line.trim();
        if line.is_empty() {
            return (None, false);
        }
        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "unparseable request");
                return (
                    Some(JsonRpcResponse::error(None, error_codes::PARSE_ERROR, format!("Parse error: {e}"))),
                    false,
                );
            }
        };
        let stop = request.method == methods::SHUTDOWN;
        (self.handle_request(request).await, stop)
    }

    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        debug!(method = %request.method, id = ?request.id, "request received");
        if request.is_notification() {
            if request.method != methods::INITIALIZED {
                debug!(method = %request.method, "ignoring notification");
            }
            return None;
        }
        let id = request.id;
        if request.jsonrpc != "2.0" {
            return Some(JsonRpcResponse::error(
                id,
                error_codes::INVALID_REQUEST,
                "jsonrpc must be \"2.0\"",
            ));
        }

        let response = match request.method.as_str() {
            methods::INITIALIZE => initialize(id),
            methods::PING => JsonRpcResponse::success(id, json!({})),
            methods::SHUTDOWN => {
                info!("shutdown requested");
                JsonRpcResponse::success(id, Value::Null)
            }
            methods::TOOLS_LIST => JsonRpcResponse::success(id, json!({ "tools": tool_definitions() })),
            methods::TOOLS_CALL => self.tools_call(id, request.params).await,
            other => JsonRpcResponse::error(id, error_codes::METHOD_NOT_FOUND, format!("Method not found: {other}")),
        };
        Some(response)
    }

    async fn tools_call(&self, id: Option<JsonRpcId>, params: Option<Value>) -> JsonRpcResponse {
        let Some(params) = params else {
            return JsonRpcResponse::error(id, error_codes::INVALID_PARAMS, "Missing params for tools/call");
        };
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return JsonRpcResponse::error(
                id,
                error_codes::INVALID_PARAMS,
                "Missing 'name' parameter in tools/call",
            );
        };
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

        let response = call_tool_shared(self.session.clone(), name.to_string(), arguments).await;
        tool_result(id, &response)
    }
}

fn initialize(id: Option<JsonRpcId>) -> JsonRpcResponse {
    info!("client initializing");
    JsonRpcResponse::success(
        id,
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": false }
            },
            "serverInfo": {
                "name": SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            }
        }),
    )
}

/// Wrap the envelope as MCP text content. Tool failures are reported in-band
/// with `isError`, not as JSON-RPC errors.
fn tool_result(id: Option<JsonRpcId>, response: &ToolResponse) -> JsonRpcResponse {
    let text = serde_json::to_string(&response.to_value()).unwrap_or_else(|_| "{}".to_string());
    JsonRpcResponse::success(
        id,
        json!({
            "content": [{ "type": "text", "text": text }],
            "isError": !response.success
        }),
    )
}

async fn write_message<W: AsyncWrite + Unpin>(out: &mut W, response: &JsonRpcResponse) -> std::io::Result<()> {
    let mut body = match serde_json::to_vec(response) {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "failed to serialize response");
            return Ok(());
        }
    };
    body.push(b'\n');
    out.write_all(&body).await?;
    out.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;

    fn server() -> McpServer {
        McpServer::new(Session::default().shared())
    }

    async fn call(server: &McpServer, line: &str) -> Value {
        let (response, _) = server.handle_line(line).await;
        serde_json::to_value(response.expect("expected a response")).unwrap()
    }

    fn envelope(reply: &Value) -> Value {
        let text = reply["result"]["content"][0]["text"].as_str().unwrap();
        serde_json::from_str(text).unwrap()
    }

    #[tokio::test]
    async fn test_initialize() {
        let reply = call(&server(), r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#).await;
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["result"]["serverInfo"]["name"], SERVER_NAME);
        assert_eq!(reply["result"]["protocolVersion"], PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_tools_list() {
        let reply = call(&server(), r#"{"jsonrpc":"2.0","id":"l","method":"tools/list"}"#).await;
        let tools = reply["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 7);
        assert!(tools.iter().all(|t| t["inputSchema"].is_object()));
    }

    #[tokio::test]
    async fn test_tools_call_success_and_failure() {
        let server = server();
        let reply = call(
            &server,
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"load_feeder","arguments":{"feeder_id":"IEEE13"}}}"#,
        )
        .await;
        assert_eq!(reply["result"]["isError"], false);
        let env = envelope(&reply);
        assert_eq!(env["success"], true);
        assert_eq!(env["data"]["num_buses"], 16);

        let reply = call(
            &server,
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"load_feeder","arguments":{"feeder_id":"IEEE999"}}}"#,
        )
        .await;
        assert_eq!(reply["result"]["isError"], true);
        let env = envelope(&reply);
        assert_eq!(env["success"], false);
        assert!(env["errors"][0].as_str().unwrap().contains("IEEE999"));
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let server = server();
        let reply = call(&server, "{not json").await;
        assert_eq!(reply["error"]["code"], error_codes::PARSE_ERROR);

        let reply = call(&server, r#"{"jsonrpc":"2.0","id":4,"method":"resources/list"}"#).await;
        assert_eq!(reply["error"]["code"], error_codes::METHOD_NOT_FOUND);

        let reply = call(&server, r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{}}"#).await;
        assert_eq!(reply["error"]["code"], error_codes::INVALID_PARAMS);

        let reply = call(&server, r#"{"jsonrpc":"1.0","id":6,"method":"ping"}"#).await;
        assert_eq!(reply["error"]["code"], error_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_null_id_gets_a_reply() {
        let reply = call(&server(), r#"{"jsonrpc":"2.0","id":null,"method":"ping"}"#).await;
        assert_eq!(reply["id"], Value::Null);
        assert_eq!(reply["result"], json!({}));
    }

    #[tokio::test]
    async fn test_notifications_and_shutdown() {
        let server = server();
        let (reply, stop) = server
            .handle_line(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await;
        assert!(reply.is_none());
        assert!(!stop);
        assert_eq!(server.handle_line("   ").await.0.is_none(), true);

        let (reply, stop) = server.handle_line(r#"{"jsonrpc":"2.0","id":9,"method":"shutdown"}"#).await;
        assert!(reply.is_some());
        assert!(stop);
    }
}
