//! Tool transport: MCP servers reached over stdio or HTTP, multiplexed behind
//! qualified `server__tool` names.
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::error::{ResearchError, Result};
use crate::llm::ToolSpec;

pub const TOOL_NAME_SEPARATOR: &str = "__";
const PROTOCOL_VERSION: &str = "2024-11-05";

/// What the tool-calling agent sees of external tools.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>>;

    async fn call_tool(&self, qualified_name: &str, args: Map<String, Value>) -> Result<Value>;
}

/// Transport with no servers: advertises nothing, rejects every call.
pub struct DisabledToolTransport;

#[async_trait]
impl ToolTransport for DisabledToolTransport {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        Ok(Vec::new())
    }

    async fn call_tool(&self, qualified_name: &str, _args: Map<String, Value>) -> Result<Value> {
        let (server, _) = parse_qualified_tool_name(qualified_name)?;
        Err(ResearchError::UnknownServer(server.to_string()))
    }
}

pub fn qualify_tool_name(server: &str, tool: &str) -> String {
    format!("{server}{TOOL_NAME_SEPARATOR}{tool}")
}

/// Splits `server__tool` at the first separator.
pub fn parse_qualified_tool_name(name: &str) -> Result<(&str, &str)> {
    match name.split_once(TOOL_NAME_SEPARATOR) {
        Some((server, tool)) if !server.is_empty() && !tool.is_empty() => Ok((server, tool)),
        _ => Err(ResearchError::InvalidToolName(name.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// One connected tool server, addressed by unqualified tool names.
#[async_trait]
pub trait ToolServer: Send + Sync {
    fn name(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<ToolSpec>>;

    async fn call_tool(&self, tool: &str, args: Map<String, Value>) -> Result<Value>;
}

/// Runs `work` under `limit`; an elapsed deadline becomes `ToolTimeout` for `label`.
pub async fn within_deadline<T>(
    label: &str,
    limit: Duration,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, work)
        .await
        .map_err(|_| ResearchError::ToolTimeout {
            tool: label.to_string(),
            secs: limit.as_secs(),
        })?
}

pub struct ToolRouter {
    servers: BTreeMap<String, Arc<dyn ToolServer>>,
    call_timeout: Duration,
}

impl ToolRouter {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            servers: BTreeMap::new(),
            call_timeout,
        }
    }

    pub fn register(&mut self, server: Arc<dyn ToolServer>) {
        self.servers.insert(server.name().to_string(), server);
    }

    pub fn server_names(&self) -> Vec<&str> {
        self.servers.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[async_trait]
impl ToolTransport for ToolRouter {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        let mut specs = Vec::new();
        for (name, server) in &self.servers {
            match within_deadline(name, self.call_timeout, server.list_tools()).await {
                Ok(tools) => specs.extend(tools.into_iter().map(|tool| ToolSpec {
                    name: qualify_tool_name(name, &tool.name),
                    ..tool
                })),
                Err(err) => {
                    tracing::warn!(server = %name, error = %err, "failed to list tools; skipping server");
                }
            }
        }
        Ok(specs)
    }

    async fn call_tool(&self, qualified_name: &str, args: Map<String, Value>) -> Result<Value> {
        let (server_name, tool) = parse_qualified_tool_name(qualified_name)?;
        let server = self
            .servers
            .get(server_name)
            .ok_or_else(|| ResearchError::UnknownServer(server_name.to_string()))?;

        tracing::debug!(server = server_name, tool, "calling tool");
        within_deadline(qualified_name, self.call_timeout, server.call_tool(tool, args)).await
    }
}

// ---------------------------------------------------------------------------
// Config file
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpServerType {
    #[default]
    Stdio,
    Sse,
    Http,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpServerConfig {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, rename = "type")]
    pub server_type: McpServerType,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct McpConfigFile {
    #[serde(default, rename = "mcpServers")]
    pub servers: BTreeMap<String, McpServerConfig>,
}

pub fn load_mcp_config(path: &Path) -> anyhow::Result<McpConfigFile> {
    if !path.exists() {
        return Ok(McpConfigFile::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read MCP config file at '{}'", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("invalid MCP config in '{}'", path.display()))
}

/// Connects every configured server; unreachable servers and servers that do
/// not finish the handshake within `call_timeout` are skipped.
pub async fn connect_servers(config: &McpConfigFile, call_timeout: Duration) -> ToolRouter {
    let mut router = ToolRouter::new(call_timeout);
    for (name, server) in &config.servers {
        if name.contains(TOOL_NAME_SEPARATOR) {
            tracing::warn!(server = %name, "server names must not contain '__'; skipping");
            continue;
        }
        let handshake = async {
            match server.server_type {
                McpServerType::Stdio => StdioMcpServer::spawn(name, server)
                    .await
                    .map(|s| Arc::new(s) as Arc<dyn ToolServer>),
                McpServerType::Sse | McpServerType::Http => HttpMcpServer::connect(name, server)
                    .await
                    .map(|s| Arc::new(s) as Arc<dyn ToolServer>),
            }
        };
        let connected = within_deadline(name, call_timeout, handshake).await;
        match connected {
            Ok(server) => {
                tracing::info!(server = %name, "MCP server connected");
                router.register(server);
            }
            Err(err) => {
                tracing::warn!(server = %name, error = %err, "MCP server unavailable; continuing without its tools");
            }
        }
    }
    router
}

/// Builds the session's tool transport from the MCP config file. No servers
/// configured means tools are disabled.
pub async fn build_tool_transport(
    config_path: &str,
    call_timeout: Duration,
) -> anyhow::Result<Arc<dyn ToolTransport>> {
    let config = load_mcp_config(Path::new(config_path))?;
    if config.servers.is_empty() {
        return Ok(Arc::new(DisabledToolTransport));
    }
    let router = connect_servers(&config, call_timeout).await;
    if router.is_empty() {
        return Ok(Arc::new(DisabledToolTransport));
    }
    Ok(Arc::new(router))
}

pub fn run_mcp_list(config_path: &str) -> anyhow::Result<()> {
    let config = load_mcp_config(Path::new(config_path))?;
    if config.servers.is_empty() {
        println!("No MCP servers configured in '{config_path}'.");
        return Ok(());
    }
    println!("MCP servers in '{config_path}':");
    for (name, server) in &config.servers {
        let target = match server.server_type {
            McpServerType::Stdio => format!("{} {}", server.command, server.args.join(" ")),
            McpServerType::Sse | McpServerType::Http => server.url.clone(),
        };
        println!("- {name} [{:?}] {}", server.server_type, target.trim());
    }
    Ok(())
}

pub async fn run_mcp_tools(config_path: &str, call_timeout: Duration) -> anyhow::Result<()> {
    let transport = build_tool_transport(config_path, call_timeout).await?;
    let tools = transport.list_tools().await?;
    if tools.is_empty() {
        println!("No MCP tools available.");
        return Ok(());
    }
    println!("MCP tools ({}):", tools.len());
    for tool in tools {
        println!("- {}: {}", tool.name, tool.description);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// JSON-RPC helpers
// ---------------------------------------------------------------------------

fn rpc_request(id: u64, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

fn rpc_notification(method: &str) -> Value {
    json!({"jsonrpc": "2.0", "method": method})
}

fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {"name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION")},
    })
}

/// Pulls `result` out of a JSON-RPC response, mapping `error` to a tool error.
fn rpc_result(server: &str, method: &str, response: Value) -> Result<Value> {
    if let Some(error) = response.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(ResearchError::ToolCall {
            tool: format!("{server}:{method}"),
            message: message.to_string(),
        });
    }
    Ok(response.get("result").cloned().unwrap_or(Value::Null))
}

#[derive(Deserialize)]
struct ListedTool {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, rename = "inputSchema")]
    input_schema: Option<Value>,
}

#[derive(Deserialize)]
struct ListToolsResult {
    #[serde(default)]
    tools: Vec<ListedTool>,
}

fn parse_tool_list(server: &str, result: Value) -> Result<Vec<ToolSpec>> {
    let listed: ListToolsResult =
        serde_json::from_value(result).map_err(|e| ResearchError::ToolCall {
            tool: format!("{server}:tools/list"),
            message: format!("malformed tool list: {e}"),
        })?;
    Ok(listed
        .tools
        .into_iter()
        .map(|tool| ToolSpec {
            name: tool.name,
            description: tool.description,
            parameters: tool
                .input_schema
                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
        })
        .collect())
}

fn call_params(tool: &str, args: Map<String, Value>) -> Value {
    json!({"name": tool, "arguments": Value::Object(args)})
}

// ---------------------------------------------------------------------------
// stdio
// ---------------------------------------------------------------------------

struct StdioChannel {
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

impl StdioChannel {
    async fn send(&mut self, server: &str, message: &Value) -> Result<()> {
        let mut line = message.to_string();
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ResearchError::ToolCall {
                tool: server.to_string(),
                message: format!("failed to write to server: {e}"),
            })?;
        self.stdin.flush().await.map_err(|e| ResearchError::ToolCall {
            tool: server.to_string(),
            message: format!("failed to flush server stdin: {e}"),
        })
    }

    async fn request(&mut self, server: &str, method: &str, params: Value) -> Result<Value> {
        self.next_id += 1;
        let id = self.next_id;
        self.send(server, &rpc_request(id, method, params)).await?;

        loop {
            let line = self
                .stdout
                .next_line()
                .await
                .map_err(|e| ResearchError::ToolCall {
                    tool: server.to_string(),
                    message: format!("failed to read from server: {e}"),
                })?
                .ok_or_else(|| ResearchError::ToolCall {
                    tool: server.to_string(),
                    message: "server closed its output".to_string(),
                })?;
            let Ok(message) = serde_json::from_str::<Value>(&line) else {
                tracing::debug!(server, line = %line, "ignoring non-JSON server output");
                continue;
            };
            if message.get("id").and_then(Value::as_u64) == Some(id) {
                return rpc_result(server, method, message);
            }
        }
    }
}

/// MCP server spawned as a child process speaking newline-delimited JSON-RPC.
pub struct StdioMcpServer {
    name: String,
    channel: Mutex<StdioChannel>,
    _child: Child,
}

impl StdioMcpServer {
    pub async fn spawn(name: &str, config: &McpServerConfig) -> Result<Self> {
        if config.command.trim().is_empty() {
            return Err(ResearchError::Config(format!(
                "MCP server '{name}' has no command"
            )));
        }
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ResearchError::ToolCall {
                tool: name.to_string(),
                message: format!("failed to spawn '{}': {e}", config.command),
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(ResearchError::ToolCall {
                tool: name.to_string(),
                message: "child process has no stdio pipes".to_string(),
            });
        };

        let mut channel = StdioChannel {
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 0,
        };
        channel.request(name, "initialize", initialize_params()).await?;
        channel
            .send(name, &rpc_notification("notifications/initialized"))
            .await?;

        Ok(Self {
            name: name.to_string(),
            channel: Mutex::new(channel),
            _child: child,
        })
    }
}

#[async_trait]
impl ToolServer for StdioMcpServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        let result = self
            .channel
            .lock()
            .await
            .request(&self.name, "tools/list", json!({}))
            .await?;
        parse_tool_list(&self.name, result)
    }

    async fn call_tool(&self, tool: &str, args: Map<String, Value>) -> Result<Value> {
        self.channel
            .lock()
            .await
            .request(&self.name, "tools/call", call_params(tool, args))
            .await
    }
}

// ---------------------------------------------------------------------------
// HTTP / SSE
// ---------------------------------------------------------------------------

/// Extracts the JSON-RPC message with `id` from a JSON or SSE response body.
pub fn decode_http_body(body: &str, id: u64) -> Option<Value> {
    let trimmed = body.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return (value.get("id").and_then(Value::as_u64) == Some(id)).then_some(value);
    }
    trimmed
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str::<Value>(data.trim()).ok())
        .find(|message| message.get("id").and_then(Value::as_u64) == Some(id))
}

/// MCP server reached by POSTing JSON-RPC to a single endpoint.
pub struct HttpMcpServer {
    name: String,
    url: String,
    headers: HashMap<String, String>,
    http_client: reqwest::Client,
    session_id: Mutex<Option<String>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl HttpMcpServer {
    pub async fn connect(name: &str, config: &McpServerConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(ResearchError::Config(format!("MCP server '{name}' has no url")));
        }
        let server = Self {
            name: name.to_string(),
            url: config.url.clone(),
            headers: config.headers.clone(),
            http_client: reqwest::Client::new(),
            session_id: Mutex::new(None),
            next_id: std::sync::atomic::AtomicU64::new(0),
        };
        server.request("initialize", initialize_params()).await?;
        server.post(&rpc_notification("notifications/initialized")).await?;
        Ok(server)
    }

    fn transport_error(&self, message: String) -> ResearchError {
        ResearchError::ToolCall {
            tool: self.name.clone(),
            message,
        }
    }

    async fn post(&self, message: &Value) -> Result<String> {
        let mut request = self
            .http_client
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .json(message);
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(session) = self.session_id.lock().await.as_deref() {
            request = request.header("Mcp-Session-Id", session);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(format!("request failed: {e}")))?;
        if let Some(session) = response
            .headers()
            .get("Mcp-Session-Id")
            .and_then(|value| value.to_str().ok())
        {
            *self.session_id.lock().await = Some(session.to_string());
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(self.transport_error(format!("server returned {status}: {body}")));
        }
        Ok(body)
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        let body = self.post(&rpc_request(id, method, params)).await?;
        let message = decode_http_body(&body, id)
            .ok_or_else(|| self.transport_error(format!("no response to '{method}'")))?;
        rpc_result(&self.name, method, message)
    }
}

#[async_trait]
impl ToolServer for HttpMcpServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        let result = self.request("tools/list", json!({})).await?;
        parse_tool_list(&self.name, result)
    }

    async fn call_tool(&self, tool: &str, args: Map<String, Value>) -> Result<Value> {
        self.request("tools/call", call_params(tool, args)).await
    }
}
