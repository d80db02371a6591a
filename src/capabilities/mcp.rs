/// MCP tool-call capability
///
/// A connector opens one session per node execution over the streamable HTTP
/// transport. Sessions are `rmcp` client services; closing one cancels the
/// service and ends the transport.
use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use rmcp::model::CallToolRequestParams;
use rmcp::service::RunningService;
use rmcp::transport::streamable_http_client::{
    StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
};
use rmcp::{RoleClient, ServiceExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;

static URL_VARIABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Z0-9_]+)\}").expect("url variable pattern is valid"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerConfig {
    #[serde(default)]
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

/// An open session with one MCP server
#[async_trait]
pub trait McpSession: Send {
    async fn list_tools(&mut self) -> Result<Vec<McpTool>>;

    /// Raw `tools/call` result (`{content: [...], isError}`)
    async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Value>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait McpConnector: Send + Sync {
    async fn connect(&self, server: &McpServerConfig) -> Result<Box<dyn McpSession>>;
}

/// Replace `{VAR}` placeholders from the process environment, then `secrets`
///
/// Fails listing every variable that could not be found.
pub fn substitute_url_variables(url: &str, secrets: &HashMap<String, String>) -> Result<String> {
    let mut missing = Vec::new();
    let resolved = URL_VARIABLE.replace_all(url, |caps: &regex::Captures| {
        let name = &caps[1];
        match std::env::var(name).ok().filter(|v| !v.is_empty()).or_else(|| secrets.get(name).cloned()) {
            Some(value) => value,
            None => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });

    if missing.is_empty() {
        Ok(resolved.into_owned())
    } else {
        Err(anyhow::anyhow!(
            "Missing configuration: {}. Add these variables to the secrets or environment.",
            missing.join(", ")
        ))
    }
}

/// Bearer token for the server: `accessToken`, else an `Authorization` header
///
/// The streamable HTTP transport only carries the authorization header, so any
/// other configured header is rejected instead of being dropped.
fn bearer_token(server: &McpServerConfig) -> Result<Option<String>> {
    let mut token = server.access_token.clone();
    for (name, value) in &server.headers {
        if !name.eq_ignore_ascii_case("authorization") {
            return Err(anyhow::anyhow!(
                "MCP server '{}': header '{}' is not supported, only Authorization",
                server.name,
                name
            ));
        }
        if token.is_none() {
            let value = value.trim();
            token = Some(value.strip_prefix("Bearer ").unwrap_or(value).trim().to_string());
        }
    }
    Ok(token.filter(|t| !t.is_empty()))
}

/// Connector for MCP servers exposed over streamable HTTP
#[derive(Debug, Clone, Default)]
pub struct RmcpConnector;

#[async_trait]
impl McpConnector for RmcpConnector {
    async fn connect(&self, server: &McpServerConfig) -> Result<Box<dyn McpSession>> {
        let mut config = StreamableHttpClientTransportConfig::with_uri(server.url.as_str());
        if let Some(token) = bearer_token(server)? {
            config = config.auth_header(token);
        }
        let transport = StreamableHttpClientTransport::from_config(config);

        tracing::info!("🔌 Connecting to MCP server: {} ({})", server.name, server.url);
        let service = ()
            .serve(transport)
            .await
            .map_err(|e| anyhow::anyhow!("MCP init for '{}' failed: {}", server.name, e))?;

        Ok(Box::new(RmcpSession {
            name: server.name.clone(),
            service: Some(service),
        }))
    }
}

struct RmcpSession {
    name: String,
    service: Option<RunningService<RoleClient, ()>>,
}

impl RmcpSession {
    fn service(&self) -> Result<&RunningService<RoleClient, ()>> {
        self.service
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("MCP session on '{}' is closed", self.name))
    }
}

#[async_trait]
impl McpSession for RmcpSession {
    async fn list_tools(&mut self) -> Result<Vec<McpTool>> {
        let tools = self
            .service()?
            .list_all_tools()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to list tools from '{}': {}", self.name, e))?;
        tracing::debug!("🧰 {} offers {} tool(s)", self.name, tools.len());

        tools
            .iter()
            .map(|tool| -> Result<McpTool> { Ok(serde_json::from_value(serde_json::to_value(tool)?)?) })
            .collect()
    }

    async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Value> {
        let arguments = match arguments {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => return Err(anyhow::anyhow!("MCP tool arguments must be an object, got {}", other)),
        };
        let result = self
            .service()?
            .call_tool(CallToolRequestParams {
                name: name.to_string().into(),
                arguments,
                meta: None,
                task: None,
            })
            .await
            .map_err(|e| anyhow::anyhow!("Tool call '{}.{}' failed: {}", self.name, name, e))?;
        Ok(serde_json::to_value(result)?)
    }

    async fn close(&mut self) -> Result<()> {
        let Some(service) = self.service.take() else {
            return Ok(());
        };
        service
            .cancel()
            .await
            .map_err(|e| anyhow::anyhow!("MCP session close failed: {}", e))?;
        tracing::debug!("🔌 Closed MCP session on {}", self.name);
        Ok(())
    }
}
