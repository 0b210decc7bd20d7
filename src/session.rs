//! One chat session: user prompts in, paced answers and canvas updates out.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::{
    bridge::GraphPort,
    client::{AgentClient, CancelHandle, RunOutcome},
    errors::Result,
    events::AgentEvent,
    layout::{LayoutDirection, LayoutEngine},
    typewriter::{TextSink, TypewriterConfig, TypewriterScheduler},
    types::{AgentMode, ChatRequest, GraphSnapshot},
};

const THINKING_SUFFIX: &str = "#thinking";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: MessageRole,
    /// Rendered text, as emitted by the typewriter so far.
    pub content: String,
    pub thinking: String,
    /// Progress events in arrival order.
    pub timeline: Vec<AgentEvent>,
    pub status: MessageStatus,
    pub error: Option<String>,
    /// Problems that did not fail the message (e.g. the canvas could not be
    /// read, so an empty graph was sent).
    pub notices: Vec<String>,
}

impl ChatMessage {
    fn new(role: MessageRole, content: impl Into<String>, status: MessageStatus) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            thinking: String::new(),
            timeline: Vec::new(),
            status,
            error: None,
            notices: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub mode: AgentMode,
    pub model_config_id: Option<i64>,
    pub layout_direction: LayoutDirection,
    pub typewriter: TypewriterConfig,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            mode: AgentMode::Chat,
            model_config_id: None,
            layout_direction: LayoutDirection::LeftToRight,
            typewriter: TypewriterConfig::default(),
        }
    }
}

struct ActiveRun {
    message_id: String,
    cancel: CancelHandle,
}

type MessageLog = Arc<Mutex<Vec<ChatMessage>>>;

/// Wires prompts through the agent stream into the message list and, for
/// builder runs, back onto the canvas.
///
/// Failures end up on the assistant message; nothing here fails the session.
pub struct SessionOrchestrator {
    session_id: String,
    settings: SessionSettings,
    client: AgentClient,
    graph: Arc<dyn GraphPort>,
    layout: Arc<dyn LayoutEngine>,
    typewriter: TypewriterScheduler,
    messages: MessageLog,
    active: Mutex<Option<ActiveRun>>,
}

impl SessionOrchestrator {
    pub fn new(
        client: AgentClient,
        graph: Arc<dyn GraphPort>,
        layout: Arc<dyn LayoutEngine>,
        settings: SessionSettings,
    ) -> Self {
        let messages: MessageLog = Arc::new(Mutex::new(Vec::new()));
        let typewriter = TypewriterScheduler::new(settings.typewriter.clone(), render_sink(&messages));
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            settings,
            client,
            graph,
            layout,
            typewriter,
            messages,
            active: Mutex::new(None),
        }
    }

    /// Continue an existing backend session.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.lock().expect("message log poisoned").clone()
    }

    /// Pace output while visible; emit everything immediately while hidden.
    pub fn set_visible(&self, visible: bool) {
        self.typewriter.set_immediate(!visible);
    }

    /// Stop the current run: buffered text is dropped and remaining frames
    /// are ignored.
    pub fn cancel(&self) {
        let active = self.active.lock().expect("active run poisoned");
        if let Some(run) = active.as_ref() {
            run.cancel.cancel();
            self.typewriter.clear(&run.message_id);
            self.typewriter.clear(&thinking_id(&run.message_id));
            tracing::debug!(message_id = %run.message_id, "run cancelled");
        }
    }

    /// Send `prompt` and return the assistant message in its final state.
    pub async fn submit(&self, prompt: &str) -> ChatMessage {
        let assistant = ChatMessage::new(MessageRole::Assistant, "", MessageStatus::Streaming);
        let id = assistant.id.clone();
        {
            let mut log = self.messages.lock().expect("message log poisoned");
            log.push(ChatMessage::new(MessageRole::User, prompt, MessageStatus::Completed));
            log.push(assistant);
        }
        let cancel = CancelHandle::default();
        *self.active.lock().expect("active run poisoned") = Some(ActiveRun {
            message_id: id.clone(),
            cancel: cancel.clone(),
        });

        let result = self.run(&id, prompt, &cancel).await;
        self.typewriter.drain(&id).await;
        self.typewriter.drain(&thinking_id(&id)).await;

        let (status, error) = match result {
            _ if cancel.is_cancelled() => (MessageStatus::Cancelled, None),
            Ok(()) => (MessageStatus::Completed, None),
            Err(err) => {
                tracing::warn!(message_id = %id, error = %err, "agent run failed");
                (MessageStatus::Failed, Some(err.to_string()))
            }
        };
        self.update(&id, |m| {
            m.status = status;
            m.error = error;
        });
        self.active.lock().expect("active run poisoned").take();
        self.message(&id)
    }

    async fn run(&self, id: &str, prompt: &str, cancel: &CancelHandle) -> Result<()> {
        let snapshot = match self.graph.export_graph().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(error = %err, "canvas export failed; sending an empty graph");
                self.update(id, |m| m.notices.push(format!("canvas could not be read: {err}")));
                GraphSnapshot::default()
            }
        };
        let meta = self.graph.export_meta().await.unwrap_or_else(|err| {
            tracing::debug!(error = %err, "workflow metadata unavailable");
            None
        });

        let mut request =
            ChatRequest::new(self.settings.mode, prompt, self.session_id.clone(), snapshot)
                .with_meta(meta);
        if let Some(model) = self.settings.model_config_id {
            request = request.with_model_config_id(model);
        }
        if cancel.is_cancelled() {
            tracing::debug!(message_id = %id, "cancelled before the request was sent");
            return Ok(());
        }

        let mut run = self
            .client
            .open(request)
            .await?
            .with_cancel_handle(cancel.clone());
        while let Some(event) = run.next_event().await? {
            self.apply(id, event).await;
        }
        let outcome = run.finish().await?;
        if outcome.cancelled {
            return Ok(());
        }
        self.apply_graph(id, outcome).await
    }

    async fn apply(&self, id: &str, event: AgentEvent) {
        match event {
            AgentEvent::AnswerDelta(chunk) => self.typewriter.enqueue(id, &chunk.content),
            AgentEvent::ThinkingDelta(chunk) => {
                self.typewriter.enqueue(&thinking_id(id), &chunk.content)
            }
            AgentEvent::ThinkingSummary(chunk) => {
                self.typewriter.clear(&thinking_id(id));
                self.update(id, |m| m.thinking = chunk.content);
            }
            AgentEvent::AnswerReset(chunk) => {
                tracing::debug!(message_id = %id, reason = ?chunk.message, "answer reset");
                self.typewriter.clear(id);
                self.update(id, |m| m.content.clear());
            }
            AgentEvent::AnswerDone(chunk) => {
                self.typewriter.drain(id).await;
                if !chunk.content.is_empty() {
                    self.update(id, |m| m.content = chunk.content);
                }
            }
            AgentEvent::Error(info) => {
                tracing::debug!(message_id = %id, message = %info.message, "agent reported error");
            }
            event if event.is_timeline() => self.update(id, |m| m.timeline.push(event)),
            _ => {}
        }
    }

    /// Lay out and import the produced graph. A failed import is reported;
    /// what was already rendered stays.
    async fn apply_graph(&self, id: &str, outcome: RunOutcome) -> Result<()> {
        let Some(graph) = outcome.graph else {
            return Ok(());
        };
        let nodes = self
            .layout
            .layout(graph.nodes, &graph.edges, self.settings.layout_direction);
        let graph = GraphSnapshot::new(nodes, graph.edges);
        tracing::debug!(
            message_id = %id,
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            "importing agent graph"
        );
        self.graph.import_graph(&graph).await?;
        Ok(())
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut ChatMessage)) {
        update_message(&self.messages, id, f);
    }

    fn message(&self, id: &str) -> ChatMessage {
        let log = self.messages.lock().expect("message log poisoned");
        log.iter()
            .find(|m| m.id == id)
            .cloned()
            .unwrap_or_else(|| ChatMessage::new(MessageRole::Assistant, "", MessageStatus::Failed))
    }
}

fn thinking_id(id: &str) -> String {
    format!("{id}{THINKING_SUFFIX}")
}

fn update_message(log: &MessageLog, id: &str, f: impl FnOnce(&mut ChatMessage)) {
    let mut log = log.lock().expect("message log poisoned");
    if let Some(message) = log.iter_mut().find(|m| m.id == id) {
        f(message);
    }
}

/// Typewriter output goes straight into the message it belongs to.
fn render_sink(log: &MessageLog) -> TextSink {
    let log = log.clone();
    Arc::new(move |id: &str, text: &str| match id.strip_suffix(THINKING_SUFFIX) {
        Some(base) => update_message(&log, base, |m| m.thinking.push_str(text)),
        None => update_message(&log, id, |m| m.content.push_str(text)),
    })
}
