/// `http` node: one outbound request
///
/// A non-2xx response still completes the node (`success: false`); only
/// transport failures and timeouts fail it.
use crate::capabilities::Capabilities;
use crate::runtime::executor::{ExecResult, NodeExecutor, NodeOutput};
use crate::runtime::state::RunState;
use crate::workflow::types::Node;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::{collections::HashMap, time::Duration};

pub struct HttpExecutor;

impl HttpExecutor {
    async fn send(node: &Node, caps: &Capabilities) -> Result<NodeOutput> {
        let url = node
            .config_str("url")
            .ok_or_else(|| anyhow::anyhow!("http node missing 'url'"))?;
        let method = node.config_str("method").unwrap_or("GET").to_uppercase();
        let timeout = node
            .config
            .get("timeoutSeconds")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(caps.http_timeout);

        tracing::debug!("🌍 HTTP Request: {} {}", method, url);

        let mut request = match method.as_str() {
            "GET" => caps.http.get(url),
            "POST" => caps.http.post(url),
            "PUT" => caps.http.put(url),
            "DELETE" => caps.http.delete(url),
            "PATCH" => caps.http.patch(url),
            "HEAD" => caps.http.head(url),
            _ => return Err(anyhow::anyhow!("Unsupported HTTP method: {}", method)),
        }
        .timeout(timeout);

        if let Some(headers) = node.config.get("headers").and_then(Value::as_object) {
            for (key, value) in headers {
                match value {
                    Value::String(s) => request = request.header(key, s),
                    Value::Null => {}
                    other => request = request.header(key, other.to_string()),
                }
            }
        }

        match node.config.get("body") {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => {
                request = request.header("Content-Type", "text/plain").body(text.clone());
            }
            Some(body) => request = request.json(body),
        }

        let response = request
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("HTTP request failed: {}", e))?;

        let status = response.status();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();

        let text = response
            .text()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read response body: {}", e))?;
        let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        tracing::info!("✅ HTTP request completed: {} {} (status: {})", method, url, status);

        Ok(NodeOutput::new(json!({
            "status": status.as_u16(),
            "headers": headers,
            "data": data,
            "success": status.is_success(),
        })))
    }
}

#[async_trait]
impl NodeExecutor for HttpExecutor {
    async fn execute(&self, node: &Node, _state: &RunState, caps: &Capabilities) -> ExecResult {
        Self::send(node, caps).await.into()
    }
}
