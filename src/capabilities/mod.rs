/// External capabilities handed to node executors
///
/// Executors receive this bundle and nothing else: no engine handle, no
/// checkpoint store. Every member is cheap to clone and safe to share between
/// concurrent runs.

// LLM completions for agent and guardrails nodes
pub mod llm;

// MCP tool calls
pub mod mcp;

// Semantic search over knowledge namespaces
pub mod retrieval;

use crate::config::Config;
use anyhow::Result;
use llm::{LlmClient, OpenAiCompatibleClient};
use mcp::{McpConnector, RmcpConnector};
use retrieval::{HttpVectorSearch, VectorSearch};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

#[derive(Clone)]
pub struct Capabilities {
    /// Shared client for http nodes; each request sets its own timeout
    pub http: reqwest::Client,
    pub http_timeout: Duration,
    pub llm: Option<Arc<dyn LlmClient>>,
    pub retrieval: Option<Arc<dyn VectorSearch>>,
    pub mcp: Arc<dyn McpConnector>,
    pub mcp_timeout: Duration,
    /// Values available to `{VAR}` substitution in MCP server URLs
    pub secrets: Arc<HashMap<String, String>>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            http: reqwest::Client::new(),
            http_timeout: Duration::from_secs(30),
            llm: None,
            retrieval: None,
            mcp: Arc::new(RmcpConnector),
            mcp_timeout: Duration::from_secs(30),
            secrets: Arc::new(HashMap::new()),
        }
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("http_timeout", &self.http_timeout)
            .field("llm", &self.llm.is_some())
            .field("retrieval", &self.retrieval.is_some())
            .field("mcp_timeout", &self.mcp_timeout)
            .field("secrets", &self.secrets.len())
            .finish()
    }
}

impl Capabilities {
    /// Build the production bundle; capabilities without configuration are left out
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut capabilities = Self {
            http_timeout: Duration::from_secs(config.engine.http_timeout_secs),
            mcp_timeout: Duration::from_secs(config.mcp.timeout_secs),
            secrets: Arc::new(config.secrets.clone()),
            ..Self::default()
        };

        match &config.llm.api_key {
            Some(api_key) => {
                let client = OpenAiCompatibleClient::new(
                    &config.llm.base_url,
                    api_key,
                    &config.llm.default_model,
                    Duration::from_secs(config.llm.timeout_secs),
                )?;
                capabilities.llm = Some(Arc::new(client));
                tracing::info!("🤖 LLM capability enabled ({})", config.llm.base_url);
            }
            None => tracing::warn!("⚠️ No LLM API key configured; agent nodes will fail and LLM guardrails are skipped"),
        }

        if let Some(endpoint) = &config.retrieval.endpoint {
            capabilities.retrieval = Some(Arc::new(HttpVectorSearch::new(
                endpoint,
                Duration::from_secs(config.engine.http_timeout_secs),
            )?));
            tracing::info!("📚 Retrieval capability enabled ({})", endpoint);
        }

        Ok(capabilities)
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_retrieval(mut self, retrieval: Arc<dyn VectorSearch>) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    pub fn with_mcp(mut self, mcp: Arc<dyn McpConnector>) -> Self {
        self.mcp = mcp;
        self
    }

    pub fn with_secrets(mut self, secrets: HashMap<String, String>) -> Self {
        self.secrets = Arc::new(secrets);
        self
    }
}
