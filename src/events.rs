//! Typed event grammar of the agent stream.
//!
//! Every `data:` line of the stream carries one JSON object with a `type`
//! discriminator. [`decode_frame`] turns one such payload into an
//! [`AgentEvent`], or a [`DecodeError`] the consumer is expected to skip.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::GraphSnapshot;

/// Literal payload the backend may send as a terminator.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Execution phase announced by `phase.started` / `phase.completed`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Phase {
    AnalyzeQuestion,
    ExecuteTools,
    ReviewAnswer,
    GenerateFinalAnswer,
    /// Phase name this client does not know yet.
    Other(String),
}

impl Phase {
    pub fn as_str(&self) -> &str {
        match self {
            Phase::AnalyzeQuestion => "analyze_question",
            Phase::ExecuteTools => "execute_tools",
            Phase::ReviewAnswer => "review_answer",
            Phase::GenerateFinalAnswer => "generate_final_answer",
            Phase::Other(name) => name.as_str(),
        }
    }
}

impl From<String> for Phase {
    fn from(value: String) -> Self {
        match value.as_str() {
            "analyze_question" => Phase::AnalyzeQuestion,
            "execute_tools" => Phase::ExecuteTools,
            "review_answer" => Phase::ReviewAnswer,
            "generate_final_answer" => Phase::GenerateFinalAnswer,
            _ => Phase::Other(value),
        }
    }
}

impl From<&str> for Phase {
    fn from(value: &str) -> Self {
        Phase::from(value.to_string())
    }
}

impl From<Phase> for String {
    fn from(value: Phase) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_answer_len: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseInfo {
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    #[serde(alias = "toolName")]
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, alias = "elapsedMs", skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextChunk {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
}

/// One decoded frame of the agent stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    #[serde(rename = "run.started")]
    RunStarted(RunInfo),
    #[serde(rename = "run.completed")]
    RunCompleted(RunInfo),
    #[serde(rename = "phase.started")]
    PhaseStarted(PhaseInfo),
    #[serde(rename = "phase.completed")]
    PhaseCompleted(PhaseInfo),
    #[serde(rename = "tool.selected")]
    ToolSelected(ToolInfo),
    #[serde(rename = "tool.started")]
    ToolStarted(ToolInfo),
    #[serde(rename = "tool.completed")]
    ToolCompleted(ToolInfo),
    #[serde(rename = "tool.failed")]
    ToolFailed(ToolInfo),
    #[serde(rename = "review.started")]
    ReviewStarted(Notice),
    #[serde(rename = "answer.delta")]
    AnswerDelta(TextChunk),
    #[serde(rename = "answer.done")]
    AnswerDone(TextChunk),
    #[serde(rename = "answer.reset")]
    AnswerReset(TextChunk),
    #[serde(rename = "thinking.delta")]
    ThinkingDelta(TextChunk),
    #[serde(rename = "thinking.summary")]
    ThinkingSummary(TextChunk),
    #[serde(rename = "graph")]
    Graph(GraphSnapshot),
    #[serde(rename = "error")]
    Error(ErrorInfo),
}

const KNOWN_TYPES: &[&str] = &[
    "run.started",
    "run.completed",
    "phase.started",
    "phase.completed",
    "tool.selected",
    "tool.started",
    "tool.completed",
    "tool.failed",
    "review.started",
    "answer.delta",
    "answer.done",
    "answer.reset",
    "thinking.delta",
    "thinking.summary",
    "graph",
    "error",
];

impl AgentEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            AgentEvent::RunStarted(_) => "run.started",
            AgentEvent::RunCompleted(_) => "run.completed",
            AgentEvent::PhaseStarted(_) => "phase.started",
            AgentEvent::PhaseCompleted(_) => "phase.completed",
            AgentEvent::ToolSelected(_) => "tool.selected",
            AgentEvent::ToolStarted(_) => "tool.started",
            AgentEvent::ToolCompleted(_) => "tool.completed",
            AgentEvent::ToolFailed(_) => "tool.failed",
            AgentEvent::ReviewStarted(_) => "review.started",
            AgentEvent::AnswerDelta(_) => "answer.delta",
            AgentEvent::AnswerDone(_) => "answer.done",
            AgentEvent::AnswerReset(_) => "answer.reset",
            AgentEvent::ThinkingDelta(_) => "thinking.delta",
            AgentEvent::ThinkingSummary(_) => "thinking.summary",
            AgentEvent::Graph(_) => "graph",
            AgentEvent::Error(_) => "error",
        }
    }

    /// Progress events that belong on the execution timeline rather than in
    /// the rendered answer.
    pub fn is_timeline(&self) -> bool {
        matches!(
            self,
            AgentEvent::RunStarted(_)
                | AgentEvent::RunCompleted(_)
                | AgentEvent::PhaseStarted(_)
                | AgentEvent::PhaseCompleted(_)
                | AgentEvent::ToolSelected(_)
                | AgentEvent::ToolStarted(_)
                | AgentEvent::ToolCompleted(_)
                | AgentEvent::ToolFailed(_)
                | AgentEvent::ReviewStarted(_)
        )
    }
}

/// Why a single frame was not turned into an event.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("frame has no type discriminator")]
    MissingType,
    #[error("unknown event type {0:?}")]
    UnknownType(String),
    #[error("malformed {event_type} event: {source}")]
    InvalidFields {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode the payload of one `data:` line.
///
/// Returns `Ok(None)` for the `[DONE]` terminator and for empty payloads.
pub fn decode_frame(data: &str) -> Result<Option<AgentEvent>, DecodeError> {
    let data = data.trim();
    if data.is_empty() || data == DONE_SENTINEL {
        return Ok(None);
    }
    let mut value: Value = serde_json::from_str(data).map_err(DecodeError::InvalidJson)?;
    let event_type = value
        .get("type")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(DecodeError::MissingType)?;
    if !KNOWN_TYPES.contains(&event_type.as_str()) {
        return Err(DecodeError::UnknownType(event_type));
    }

    // Builder runs nest the snapshot under `data`.
    if event_type == "graph" {
        if let Some(inner) = value.get("data").filter(|d| d.is_object()).cloned() {
            let mut hoisted = inner;
            if let Some(obj) = hoisted.as_object_mut() {
                obj.insert("type".to_string(), Value::String(event_type.clone()));
            }
            value = hoisted;
        }
    }

    serde_json::from_value(value)
        .map(Some)
        .map_err(|source| DecodeError::InvalidFields { event_type, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_tool_events_with_backend_field_names() {
        let evt = decode_frame(
            r#"{"type":"tool.completed","tool_name":"search","status":"completed","elapsed_ms":12}"#,
        )
        .unwrap()
        .unwrap();
        match evt {
            AgentEvent::ToolCompleted(info) => {
                assert_eq!(info.tool_name, "search");
                assert_eq!(info.elapsed_ms, Some(12));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn accepts_camel_case_tool_name() {
        let evt = decode_frame(r#"{"type":"tool.started","toolName":"search"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(evt.event_type(), "tool.started");
    }

    #[test]
    fn phases_round_trip_including_unknown_names() {
        let evt = decode_frame(r#"{"type":"phase.started","phase":"execute_tools"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            evt,
            AgentEvent::PhaseStarted(PhaseInfo {
                phase: Phase::ExecuteTools,
                message: None
            })
        );
        let other = decode_frame(r#"{"type":"phase.completed","phase":"plan"}"#)
            .unwrap()
            .unwrap();
        match other {
            AgentEvent::PhaseCompleted(info) => assert_eq!(info.phase.as_str(), "plan"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn graph_accepts_flat_and_nested_payloads() {
        let flat = decode_frame(r#"{"type":"graph","nodes":[{"id":"a","type":"start"}],"edges":[]}"#)
            .unwrap()
            .unwrap();
        let nested = decode_frame(
            r#"{"type":"graph","data":{"nodes":[{"id":"a","type":"start"}],"edges":[]}}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(flat, nested);
        match flat {
            AgentEvent::Graph(graph) => assert_eq!(graph.nodes[0].id, "a"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn answer_done_without_content_defaults_to_empty() {
        let evt = decode_frame(r#"{"type":"answer.done"}"#).unwrap().unwrap();
        assert_eq!(evt, AgentEvent::AnswerDone(TextChunk::default()));
    }

    #[test]
    fn done_sentinel_and_blank_payloads_are_no_ops() {
        assert!(decode_frame("[DONE]").unwrap().is_none());
        assert!(decode_frame("  ").unwrap().is_none());
    }

    #[test]
    fn bad_frames_are_classified() {
        assert!(matches!(decode_frame("{oops"), Err(DecodeError::InvalidJson(_))));
        assert!(matches!(decode_frame(r#"{"content":"x"}"#), Err(DecodeError::MissingType)));
        assert!(matches!(
            decode_frame(r#"{"type":"chunk","content":"x"}"#),
            Err(DecodeError::UnknownType(t)) if t == "chunk"
        ));
        assert!(matches!(
            decode_frame(r#"{"type":"error"}"#),
            Err(DecodeError::InvalidFields { .. })
        ));
    }

    #[test]
    fn timeline_membership() {
        let tool = decode_frame(r#"{"type":"tool.failed","tool_name":"x"}"#)
            .unwrap()
            .unwrap();
        assert!(tool.is_timeline());
        let delta = decode_frame(r#"{"type":"answer.delta","content":"x"}"#)
            .unwrap()
            .unwrap();
        assert!(!delta.is_timeline());
    }
}
