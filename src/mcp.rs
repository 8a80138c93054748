//! MCP tool-server client.
//!
//! Spawns the tool server as a subprocess speaking newline-delimited
//! JSON-RPC over stdio and fronts it with a request/response façade that
//! owns the child I/O. The core only ever sees
//! `call_tool(name, args) -> value | error` with a timeout.

use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::error::{AgentError, Result};
use crate::log_debug;

const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_tool_timeout")]
    pub timeout_seconds: u64,
}

fn default_tool_timeout() -> u64 {
    300
}

struct McpInner {
    _child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
    initialized: bool,
}

/// Synchronous request/response façade over the tool-server subprocess. The
/// inner mutex serializes requests; within one task, tool calls are serial
/// anyway.
pub struct McpToolClient {
    inner: Mutex<McpInner>,
    timeout: Duration,
}

impl McpToolClient {
    pub async fn spawn(config: &McpConfig) -> Result<Self> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Tool(format!("failed to spawn tool server: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Tool("tool server has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Tool("tool server has no stdout".to_string()))?;

        Ok(Self {
            inner: Mutex::new(McpInner {
                _child: child,
                stdin,
                stdout: BufReader::new(stdout),
                next_id: 1,
                initialized: false,
            }),
            timeout: Duration::from_secs(config.timeout_seconds),
        })
    }

    /// Invoke a named tool. The caller injects repository identity into
    /// `args` beforehand.
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<Value> {
        let mut inner = self.inner.lock().await;
        if !inner.initialized {
            Self::initialize(&mut inner).await?;
        }

        let params = json!({ "name": name, "arguments": args });
        let call = Self::request(&mut inner, "tools/call", params);
        let result = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| AgentError::Tool(format!("tool '{name}' timed out")))??;
        Ok(result)
    }

    async fn initialize(inner: &mut McpInner) -> Result<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": "forgebot", "version": env!("CARGO_PKG_VERSION") },
        });
        Self::request(inner, "initialize", params).await?;
        Self::notify(inner, "notifications/initialized").await?;
        inner.initialized = true;
        log_debug!("MCP tool server initialized");
        Ok(())
    }

    async fn notify(inner: &mut McpInner, method: &str) -> Result<()> {
        let message = json!({ "jsonrpc": "2.0", "method": method });
        Self::write_message(inner, &message).await
    }

    async fn request(inner: &mut McpInner, method: &str, params: Value) -> Result<Value> {
        let id = inner.next_id;
        inner.next_id += 1;
        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        Self::write_message(inner, &message).await?;

        // Read until the response with our id; server-initiated
        // notifications are skipped.
        loop {
            let mut line = String::new();
            let read = inner
                .stdout
                .read_line(&mut line)
                .await
                .map_err(|e| AgentError::Tool(format!("tool server read failed: {e}")))?;
            if read == 0 {
                return Err(AgentError::Tool("tool server closed its stdout".to_string()));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let reply: Value = match serde_json::from_str(trimmed) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if reply.get("id").and_then(Value::as_u64) != Some(id) {
                continue;
            }
            if let Some(error) = reply.get("error") {
                return Err(AgentError::Tool(error.to_string()));
            }
            return Ok(reply.get("result").cloned().unwrap_or(Value::Null));
        }
    }

    async fn write_message(inner: &mut McpInner, message: &Value) -> Result<()> {
        let mut line = message.to_string();
        line.push('\n');
        inner
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AgentError::Tool(format!("tool server write failed: {e}")))?;
        inner
            .stdin
            .flush()
            .await
            .map_err(|e| AgentError::Tool(format!("tool server flush failed: {e}")))?;
        Ok(())
    }
}
