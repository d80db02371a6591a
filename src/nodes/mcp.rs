/// `mcp` node: call one tool on an MCP server
///
/// The session is opened per execution and closed on every path, including
/// errors and timeouts. With several servers configured the first one that
/// answers successfully wins.
use crate::capabilities::mcp::{substitute_url_variables, McpServerConfig, McpSession};
use crate::capabilities::Capabilities;
use crate::runtime::executor::{ExecResult, NodeExecutor, NodeOutput};
use crate::runtime::state::RunState;
use crate::workflow::types::Node;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

pub struct McpExecutor;

fn servers(node: &Node) -> Result<Vec<McpServerConfig>> {
    let raw = node
        .config
        .get("server")
        .or_else(|| node.config.get("mcpServer"))
        .map(|s| Value::Array(vec![s.clone()]))
        .or_else(|| node.config.get("mcpServers").cloned())
        .ok_or_else(|| anyhow::anyhow!("No MCP server configured"))?;

    let servers: Vec<McpServerConfig> =
        serde_json::from_value(raw).map_err(|e| anyhow::anyhow!("Invalid MCP server config: {}", e))?;
    if servers.is_empty() {
        return Err(anyhow::anyhow!("No MCP server configured"));
    }
    Ok(servers)
}

/// First text content, parsed as JSON when it looks like an object or array
fn tool_output(result: &Value) -> Value {
    let Some(content) = result.get("content").and_then(Value::as_array) else {
        return result.clone();
    };
    let text = content
        .iter()
        .find(|c| c["type"] == "text")
        .and_then(|c| c["text"].as_str());

    match text {
        Some(text) => {
            let trimmed = text.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
            } else {
                Value::String(text.to_string())
            }
        }
        None => Value::Array(content.clone()),
    }
}

fn nested(data: &Value, path: &str) -> Value {
    let mut current = data;
    for part in path.split('.') {
        let (name, index) = match part.split_once('[') {
            Some((name, rest)) => (name, rest.trim_end_matches(']').parse::<usize>().ok()),
            None => (part, None),
        };
        current = &current[name];
        if let Some(i) = index {
            current = &current[i];
        }
        if current.is_null() {
            break;
        }
    }
    current.clone()
}

/// Apply `outputField` (`full`, `text`, `json`, `results`, `custom`, or a key)
fn extract_field(data: Value, field: &str, custom_path: Option<&str>) -> Value {
    let or_data = |v: &Value, data: &Value| if v.is_null() { data.clone() } else { v.clone() };
    match field {
        "full" => data,
        "custom" => match custom_path {
            Some(path) => nested(&data, path),
            None => data,
        },
        "text" => match &data {
            Value::String(_) => data,
            other => Value::String(other.to_string()),
        },
        "json" => {
            let picked = if !data["json"].is_null() { &data["json"] } else { &data["data"] };
            or_data(picked, &data)
        }
        key => or_data(&data[key], &data),
    }
}

impl McpExecutor {
    async fn call(
        session: &mut Box<dyn McpSession>,
        tool: &str,
        arguments: Value,
    ) -> Result<Value> {
        let tools = session.list_tools().await?;
        if !tools.iter().any(|t| t.name == tool) {
            let available: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
            return Err(anyhow::anyhow!(
                "Tool '{}' is not offered by the server (available: {})",
                tool,
                available.join(", ")
            ));
        }
        session.call_tool(tool, arguments).await
    }

    async fn run_on(
        server: &McpServerConfig,
        tool: &str,
        arguments: Value,
        timeout: Duration,
        caps: &Capabilities,
    ) -> Result<Value> {
        let mut server = server.clone();
        server.url = substitute_url_variables(&server.url, &caps.secrets)
            .map_err(|e| anyhow::anyhow!("{} ({})", e, server.name))?;

        let mut session = tokio::time::timeout(timeout, caps.mcp.connect(&server))
            .await
            .map_err(|_| anyhow::anyhow!("Connecting to MCP server '{}' timed out", server.name))??;

        let outcome = tokio::time::timeout(timeout, Self::call(&mut session, tool, arguments))
            .await
            .map_err(|_| anyhow::anyhow!("MCP tool '{}' timed out after {:?}", tool, timeout))
            .and_then(|r| r);

        if let Err(e) = session.close().await {
            tracing::warn!("⚠️ Failed to close MCP session on '{}': {}", server.name, e);
        }
        outcome
    }
}

#[async_trait]
impl NodeExecutor for McpExecutor {
    async fn execute(&self, node: &Node, _state: &RunState, caps: &Capabilities) -> ExecResult {
        let servers = match servers(node) {
            Ok(servers) => servers,
            Err(e) => return ExecResult::failed(e.to_string()),
        };
        let Some(tool) = node.config_str("tool").or_else(|| node.config_str("mcpTool")) else {
            return ExecResult::failed("No tool selected for MCP execution");
        };
        let arguments = node
            .config
            .get("arguments")
            .or_else(|| node.config.get("mcpParams"))
            .cloned()
            .unwrap_or_else(|| json!({}));
        let timeout = node
            .config
            .get("timeoutSeconds")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(caps.mcp_timeout);

        let mut errors = Vec::new();
        for server in &servers {
            tracing::info!("🔨 Executing MCP tool {} on {}", tool, server.name);
            match Self::run_on(server, tool, arguments.clone(), timeout, caps).await {
                Ok(result) if result["isError"] == true => {
                    let message = tool_output(&result);
                    errors.push(format!("{}: tool reported an error: {}", server.name, message));
                }
                Ok(result) => {
                    tracing::info!("✅ MCP tool execution completed: {}", tool);
                    let mut output = tool_output(&result);
                    if let Some(field) = node.config_str("outputField") {
                        output = extract_field(output, field, node.config_str("customOutputPath"));
                    }
                    return ExecResult::Completed(NodeOutput::new(output).with_details(json!({
                        "server": server.name,
                        "tool": tool,
                        "raw": result,
                    })));
                }
                Err(e) => {
                    tracing::error!("❌ MCP execution failed for {}: {:#}", server.name, e);
                    errors.push(format!("{}: {:#}", server.name, e));
                }
            }
        }

        ExecResult::failed(errors.join("; "))
    }
}
