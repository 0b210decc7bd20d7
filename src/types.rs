use std::{collections::HashSet, fmt};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Canvas coordinates of a node.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// One node of the host canvas.
///
/// Fields the host attaches beyond the structural ones are kept in `extra` so
/// that a snapshot read from the host can be written back unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type", default)]
    pub node_type: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub data: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            position: Position::default(),
            data: Value::Object(Map::new()),
            extra: Map::new(),
        }
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Position::new(x, y);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Directed connection between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
            extra: Map::new(),
        }
    }

    pub fn with_handles(
        mut self,
        source_handle: impl Into<String>,
        target_handle: impl Into<String>,
    ) -> Self {
        self.source_handle = Some(source_handle.into());
        self.target_handle = Some(target_handle.into());
        self
    }
}

/// Structural state of the host canvas.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphSnapshot {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl GraphSnapshot {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    /// Edges whose source or target is not a node of this snapshot.
    ///
    /// Diagnostic only: the host decides what to do with such edges on import.
    pub fn dangling_edges(&self) -> Vec<&Edge> {
        let ids: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        self.edges
            .iter()
            .filter(|e| !ids.contains(e.source.as_str()) || !ids.contains(e.target.as_str()))
            .collect()
    }
}

/// Best-effort descriptive metadata of the open workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMeta {
    #[serde(default)]
    pub workflow_name: String,
    #[serde(default)]
    pub workflow_description: String,
}

impl WorkflowMeta {
    pub fn is_empty(&self) -> bool {
        self.workflow_name.trim().is_empty() && self.workflow_description.trim().is_empty()
    }
}

/// Which agent the backend should run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    /// Question answering about the workflow; no graph is expected back.
    #[default]
    Chat,
    /// Workflow construction; the run must end with a `graph` event.
    Builder,
}

impl AgentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentMode::Chat => "chat",
            AgentMode::Builder => "builder",
        }
    }

    pub fn requires_graph(&self) -> bool {
        matches!(self, AgentMode::Builder)
    }
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Request body for `POST /agent/chat/completions`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatRequest {
    pub mode: AgentMode,
    pub user_prompt: String,
    pub session_id: String,
    /// Required by the backend; [`AgentClient::open`](crate::AgentClient::open)
    /// refuses a request without one.
    pub model_config_id: Option<i64>,
    pub workflow_graph: GraphSnapshot,
    pub workflow_meta: Option<WorkflowMeta>,
}

impl ChatRequest {
    pub fn new(
        mode: AgentMode,
        user_prompt: impl Into<String>,
        session_id: impl Into<String>,
        workflow_graph: GraphSnapshot,
    ) -> Self {
        Self {
            mode,
            user_prompt: user_prompt.into(),
            session_id: session_id.into(),
            model_config_id: None,
            workflow_graph,
            workflow_meta: None,
        }
    }

    pub fn with_model_config_id(mut self, id: i64) -> Self {
        self.model_config_id = Some(id);
        self
    }

    pub fn with_meta(mut self, meta: Option<WorkflowMeta>) -> Self {
        self.workflow_meta = meta;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.user_prompt.trim().is_empty() {
            return Err("user_prompt is required".to_string());
        }
        if self.session_id.trim().is_empty() {
            return Err("session_id is required".to_string());
        }
        if self.model_config_id.is_none() {
            return Err("model_config_id is required: pick a model configuration".to_string());
        }
        Ok(())
    }
}
