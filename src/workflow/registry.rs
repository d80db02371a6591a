/// Hot-reload workflow registry using ArcSwap
///
/// Provides lock-free, atomic updates to the in-memory set of compiled
/// workflows. Each update swaps the whole map, so runs that already hold a
/// `CompiledWorkflow` keep executing against the version they started with.
use crate::workflow::{graph::WorkflowGraph, storage::WorkflowStorage, types::{NodeType, Workflow}};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

/// Lock-free workflow registry
#[derive(Debug)]
pub struct WorkflowRegistry {
    /// Key: workflow_id, Value: compiled workflow
    workflows: ArcSwap<HashMap<String, CompiledWorkflow>>,
    /// Persistent storage the registry is seeded from
    storage: WorkflowStorage,
}

/// Workflow validated and indexed for execution
///
/// Cloning is cheap: definition and graph are shared.
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    pub workflow: Arc<Workflow>,
    pub graph: Arc<WorkflowGraph>,
    /// Webhook triggers declared on the start node
    pub webhook_triggers: Vec<WebhookTrigger>,
}

/// `ANY /webhook/{webhook_id}` entry point that starts a new run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookTrigger {
    pub webhook_id: String,
    /// Shared secret expected as Bearer token or `?token=`
    pub secret: Option<String>,
}

impl CompiledWorkflow {
    /// Validate a definition and extract its execution metadata
    pub fn compile(workflow: Workflow) -> Result<Self> {
        let graph = WorkflowGraph::build(&workflow)?;

        let mut webhook_triggers = Vec::new();
        for node in workflow.nodes.iter().filter(|n| n.node_type == NodeType::Start) {
            if node.config_str("trigger") != Some("webhook") {
                continue;
            }
            let webhook_id = node
                .config_str("webhookId")
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "Start node '{}' of workflow '{}' declares a webhook trigger without webhookId",
                        node.id,
                        workflow.id
                    )
                })?
                .to_string();
            webhook_triggers.push(WebhookTrigger {
                webhook_id,
                secret: node.config_str("secret").map(str::to_string),
            });
        }

        Ok(Self {
            workflow: Arc::new(workflow),
            graph: Arc::new(graph),
            webhook_triggers,
        })
    }
}

impl WorkflowRegistry {
    pub fn new(storage: WorkflowStorage) -> Self {
        Self {
            workflows: ArcSwap::new(Arc::new(HashMap::new())),
            storage,
        }
    }

    /// Populate the registry from storage at startup
    ///
    /// A workflow that fails validation is logged and left out rather than
    /// blocking every other workflow from loading.
    pub async fn init_from_storage(&self) -> Result<()> {
        let stored_workflows = self.storage.load_all_workflows().await?;
        let mut compiled_workflows = HashMap::new();

        for (id, workflow) in stored_workflows {
            match CompiledWorkflow::compile(workflow) {
                Ok(compiled) => {
                    compiled_workflows.insert(id, compiled);
                }
                Err(e) => tracing::error!("❌ Workflow {} failed validation, not loaded: {}", id, e),
            }
        }

        self.workflows.store(Arc::new(compiled_workflows));

        tracing::info!(
            "📊 Initialized workflow registry with {} workflows",
            self.workflows.load().len()
        );
        Ok(())
    }

    /// Compile and publish a workflow without touching storage
    pub fn insert(&self, workflow: Workflow) -> Result<CompiledWorkflow> {
        let compiled = CompiledWorkflow::compile(workflow)?;
        let id = compiled.workflow.id.clone();

        let inserted = compiled.clone();
        self.workflows.rcu(move |current| {
            let mut next = (**current).clone();
            next.insert(id.clone(), inserted.clone());
            next
        });

        Ok(compiled)
    }

    /// Get a workflow by ID (lock-free read)
    pub fn get_workflow(&self, workflow_id: &str) -> Option<CompiledWorkflow> {
        self.workflows.load().get(workflow_id).cloned()
    }

    /// Workflow whose start node listens on `webhook_id`
    pub fn find_webhook_trigger(&self, webhook_id: &str) -> Option<(CompiledWorkflow, WebhookTrigger)> {
        self.workflows.load().values().find_map(|compiled| {
            compiled
                .webhook_triggers
                .iter()
                .find(|t| t.webhook_id == webhook_id)
                .map(|t| (compiled.clone(), t.clone()))
        })
    }

    /// Map of webhook_id -> workflow_id for every registered trigger
    pub fn get_webhook_routes(&self) -> HashMap<String, String> {
        let workflows = self.workflows.load();
        let mut routes = HashMap::new();

        for (workflow_id, compiled) in workflows.iter() {
            for trigger in &compiled.webhook_triggers {
                routes.insert(trigger.webhook_id.clone(), workflow_id.clone());
            }
        }

        routes
    }

    pub fn remove_workflow(&self, workflow_id: &str) -> bool {
        let mut removed = false;
        self.workflows.rcu(|current| {
            let mut next = (**current).clone();
            removed = next.remove(workflow_id).is_some();
            next
        });

        if removed {
            tracing::info!("🗑️ Removed workflow from registry: {}", workflow_id);
        }
        removed
    }
}
