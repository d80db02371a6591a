/// Compiled graph model
///
/// Validates a workflow definition once, at load time, and keeps the lookups
/// the engine needs on every step: node by id, outgoing edges in declaration
/// order, and which nodes sit on a loop cycle (and may therefore run more
/// than once per run).
use crate::error::{EngineError, EngineResult};
use crate::workflow::types::{Edge, Node, NodeType, Workflow};
use petgraph::algo::{is_cyclic_directed, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// Validated, index-backed view of a workflow
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    nodes: HashMap<String, Node>,
    /// Outgoing edges per node, in the order they were declared
    outgoing: HashMap<String, Vec<Edge>>,
    start_id: String,
    loop_members: HashSet<String>,
}

impl WorkflowGraph {
    /// Build and validate the graph
    ///
    /// Rejects duplicate ids, anything other than exactly one `start` node with
    /// zero incoming edges, dangling edges, illegal handles, and cycles that do
    /// not pass through a `while` node's `continue` edge.
    pub fn build(workflow: &Workflow) -> EngineResult<Self> {
        let invalid = |msg: String| EngineError::InvalidGraph(format!("{}: {}", workflow.id, msg));

        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut acyclic_view: DiGraph<String, ()> = DiGraph::new();
        let mut index: HashMap<String, NodeIndex> = HashMap::new();
        let mut nodes = HashMap::new();

        for node in &workflow.nodes {
            if nodes.contains_key(&node.id) {
                return Err(invalid(format!("duplicate node id '{}'", node.id)));
            }
            let idx = graph.add_node(node.id.clone());
            acyclic_view.add_node(node.id.clone());
            index.insert(node.id.clone(), idx);
            nodes.insert(node.id.clone(), node.clone());
        }

        let starts: Vec<&Node> = workflow
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Start)
            .collect();
        let start_id = match starts.as_slice() {
            [only] => only.id.clone(),
            [] => return Err(invalid("workflow has no start node".into())),
            _ => return Err(invalid(format!("workflow has {} start nodes", starts.len()))),
        };

        let mut outgoing: HashMap<String, Vec<Edge>> = HashMap::new();
        for edge in &workflow.edges {
            let (Some(&from), Some(&to)) = (index.get(&edge.source), index.get(&edge.target))
            else {
                return Err(invalid(format!(
                    "edge '{}' -> '{}' references an unknown node",
                    edge.source, edge.target
                )));
            };
            if edge.target == start_id {
                return Err(invalid("start node must not have incoming edges".into()));
            }

            let source = &nodes[&edge.source];
            check_handle(source, edge.source_handle.as_deref()).map_err(invalid)?;

            graph.add_edge(from, to, ());
            let is_loop_back =
                source.node_type == NodeType::While && edge.source_handle.as_deref() == Some("continue");
            if !is_loop_back {
                acyclic_view.add_edge(from, to, ());
            }
            outgoing.entry(edge.source.clone()).or_default().push(edge.clone());
        }

        if is_cyclic_directed(&acyclic_view) {
            return Err(invalid(
                "cycles are only allowed through a while node's continue edge".into(),
            ));
        }

        let mut loop_members = HashSet::new();
        for component in tarjan_scc(&graph) {
            let cyclic = component.len() > 1
                || component
                    .first()
                    .is_some_and(|&n| graph.find_edge(n, n).is_some());
            if cyclic {
                loop_members.extend(component.into_iter().map(|n| graph[n].clone()));
            }
        }

        tracing::debug!(
            "🏗️ Compiled graph '{}' with {} nodes, {} edges, {} loop members",
            workflow.id,
            nodes.len(),
            workflow.edges.len(),
            loop_members.len()
        );

        Ok(Self {
            nodes,
            outgoing,
            start_id,
            loop_members,
        })
    }

    pub fn start_id(&self) -> &str {
        &self.start_id
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// All outgoing edges of a node, declaration order
    pub fn outgoing(&self, id: &str) -> &[Edge] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Outgoing edges leaving through a specific handle
    pub fn outgoing_for_handle<'a>(&'a self, id: &str, handle: &'a str) -> impl Iterator<Item = &'a Edge> {
        self.outgoing(id)
            .iter()
            .filter(move |e| e.source_handle.as_deref() == Some(handle))
    }

    pub fn has_handle(&self, id: &str, handle: &str) -> bool {
        self.outgoing_for_handle(id, handle).next().is_some()
    }

    /// Whether the node lies on a cycle and may legitimately run again
    pub fn is_loop_member(&self, id: &str) -> bool {
        self.loop_members.contains(id)
    }
}

fn check_handle(source: &Node, handle: Option<&str>) -> Result<(), String> {
    let Some(handle) = handle else {
        return match source.node_type {
            NodeType::IfElse | NodeType::While | NodeType::Router | NodeType::UserApproval => Err(
                format!("edges leaving '{}' ({}) need a source handle", source.id, source.node_type),
            ),
            _ => Ok(()),
        };
    };

    match source.node_type.fixed_handles() {
        // Default nodes expose one unconditional output; its label is cosmetic.
        Some([]) => Ok(()),
        Some(allowed) if allowed.contains(&handle) => Ok(()),
        Some(allowed) => Err(format!(
            "handle '{}' is not valid on '{}' (expected one of {:?})",
            handle, source.id, allowed
        )),
        None => {
            let declared = source
                .config
                .get("routes")
                .and_then(|r| r.as_array())
                .map(|routes| {
                    routes
                        .iter()
                        .any(|r| r.get("id").and_then(|id| id.as_str()) == Some(handle))
                })
                .unwrap_or(false);
            if declared {
                Ok(())
            } else {
                Err(format!("router '{}' has no route '{}'", source.id, handle))
            }
        }
    }
}
