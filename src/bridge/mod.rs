//! Cross-context bridge between the extension and the host page.
//!
//! The extension side ([`GraphAdapter`]) and the injected page side
//! ([`PageAgent`]) only share a one-way broadcast channel of JSON messages.
//! Requests and replies are paired by a correlation tag; everything else on
//! the channel is ignored.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};

use crate::http::RetryConfig;

mod adapter;
pub mod host;
mod loader;
mod messenger;
mod page;
mod strategies;

pub use adapter::{GraphAdapter, GraphPort};
pub use loader::{HttpResourceProbe, InjectionLoader, ResourceProbe, ScriptInjector};
pub use messenger::CorrelatedMessenger;
pub use page::{PageAgent, PageAgentInjector};
pub use strategies::{
    Attempt, ChainFailure, ClipboardCaptureViaMenu, DirectStoreWalk, HostIntrospectionStrategy,
    PageScope, StrategyChain, SyntheticPasteInjection,
};

/// `source` marker on messages sent by the extension side.
pub const EXTENSION_SOURCE: &str = "canvas-copilot";
/// `source` marker on messages sent by the injected page agent.
pub const PAGE_SOURCE: &str = "canvas-copilot-page";
/// Reply `code` meaning no strategy could reach the host state.
pub const CODE_UNAVAILABLE: &str = "unavailable";

const CHANNEL_CAPACITY: usize = 64;

/// Logical operation carried by a bridge message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BridgeKind {
    #[serde(rename = "EXPORT_GRAPH")]
    ExportGraph,
    #[serde(rename = "IMPORT_GRAPH")]
    ImportGraph,
    #[serde(rename = "EXPORT_META")]
    ExportMeta,
}

impl BridgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeKind::ExportGraph => "EXPORT_GRAPH",
            BridgeKind::ImportGraph => "IMPORT_GRAPH",
            BridgeKind::ExportMeta => "EXPORT_META",
        }
    }

    /// Message type of the reply to this request.
    pub fn result_type(&self) -> &'static str {
        match self {
            BridgeKind::ExportGraph => "EXPORT_GRAPH_RESULT",
            BridgeKind::ImportGraph => "IMPORT_GRAPH_RESULT",
            BridgeKind::ExportMeta => "EXPORT_META_RESULT",
        }
    }

    pub fn from_request_type(value: &str) -> Option<Self> {
        match value {
            "EXPORT_GRAPH" => Some(BridgeKind::ExportGraph),
            "IMPORT_GRAPH" => Some(BridgeKind::ImportGraph),
            "EXPORT_META" => Some(BridgeKind::ExportMeta),
            _ => None,
        }
    }
}

impl fmt::Display for BridgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Request sent from the extension to the page.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationEnvelope {
    pub kind: BridgeKind,
    pub correlation_tag: String,
    pub payload: Value,
}

impl CorrelationEnvelope {
    pub fn new(kind: BridgeKind, payload: Value) -> Self {
        Self {
            kind,
            correlation_tag: format!("{}-{}", kind.as_str().to_ascii_lowercase(), uuid::Uuid::new_v4()),
            payload,
        }
    }

    pub fn to_wire(&self) -> Value {
        serde_json::json!({
            "source": EXTENSION_SOURCE,
            "type": self.kind.as_str(),
            "requestId": self.correlation_tag,
            "payload": self.payload,
        })
    }

    /// Parse a request; anything else on the channel yields `None`.
    pub fn from_wire(message: &Value) -> Option<Self> {
        if message.get("source")?.as_str()? != EXTENSION_SOURCE {
            return None;
        }
        let kind = BridgeKind::from_request_type(message.get("type")?.as_str()?)?;
        let correlation_tag = message.get("requestId")?.as_str()?.to_string();
        Some(Self {
            kind,
            correlation_tag,
            payload: message.get("payload").cloned().unwrap_or(Value::Null),
        })
    }
}

/// Reply sent from the page to the extension.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeReply {
    pub kind: BridgeKind,
    pub correlation_tag: String,
    pub success: bool,
    pub payload: Option<Value>,
    pub message: Option<String>,
    pub code: Option<String>,
}

impl BridgeReply {
    pub fn ok(request: &CorrelationEnvelope, payload: Value) -> Self {
        Self {
            kind: request.kind,
            correlation_tag: request.correlation_tag.clone(),
            success: true,
            payload: Some(payload),
            message: None,
            code: None,
        }
    }

    pub fn failed(request: &CorrelationEnvelope, message: impl Into<String>) -> Self {
        Self {
            kind: request.kind,
            correlation_tag: request.correlation_tag.clone(),
            success: false,
            payload: None,
            message: Some(message.into()),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn to_wire(&self) -> Value {
        let mut msg = serde_json::json!({
            "source": PAGE_SOURCE,
            "type": self.kind.result_type(),
            "requestId": self.correlation_tag,
            "success": self.success,
        });
        if let Some(obj) = msg.as_object_mut() {
            if let Some(payload) = &self.payload {
                obj.insert("payload".into(), payload.clone());
            }
            if let Some(message) = &self.message {
                obj.insert("message".into(), Value::String(message.clone()));
            }
            if let Some(code) = &self.code {
                obj.insert("code".into(), Value::String(code.clone()));
            }
        }
        msg
    }

    /// Parse a reply to a request of `kind`; anything else yields `None`.
    pub fn from_wire(kind: BridgeKind, message: &Value) -> Option<Self> {
        if message.get("source")?.as_str()? != PAGE_SOURCE {
            return None;
        }
        if message.get("type")?.as_str()? != kind.result_type() {
            return None;
        }
        Some(Self {
            kind,
            correlation_tag: message.get("requestId")?.as_str()?.to_string(),
            success: message.get("success")?.as_bool()?,
            payload: message.get("payload").cloned(),
            message: message
                .get("message")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            code: message
                .get("code")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
        })
    }
}

/// Timeouts and tuning for the bridge.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// URL of the page-world script; probed before every load attempt.
    pub resource_url: String,
    /// Bound on one injection attempt.
    pub load_timeout: Duration,
    /// Retry policy across injection attempts.
    pub load_retry: RetryConfig,
    pub export_timeout: Duration,
    pub import_timeout: Duration,
    pub meta_timeout: Duration,
    /// How long the menu capture waits for the host to write to the clipboard.
    pub capture_timeout: Duration,
    /// Depth cap of the component-instance walk.
    pub walk_depth_limit: usize,
    /// Case-insensitive labels that identify the host's export menu entry.
    pub export_menu_labels: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            resource_url: "chrome-extension://canvas-copilot/page-agent.js".to_string(),
            load_timeout: Duration::from_secs(5),
            load_retry: RetryConfig::default(),
            export_timeout: Duration::from_millis(3000),
            import_timeout: Duration::from_millis(3000),
            meta_timeout: Duration::from_millis(2000),
            capture_timeout: Duration::from_millis(1500),
            walk_depth_limit: 12,
            export_menu_labels: vec![
                "export".to_string(),
                "copy workflow".to_string(),
                "导出".to_string(),
            ],
        }
    }
}

impl BridgeConfig {
    pub fn timeout_for(&self, kind: BridgeKind) -> Duration {
        match kind {
            BridgeKind::ExportGraph => self.export_timeout,
            BridgeKind::ImportGraph => self.import_timeout,
            BridgeKind::ExportMeta => self.meta_timeout,
        }
    }
}

/// Shared mutable state of one bridge: the broadcast channel, the
/// "page script ready" flag and the clipboard patch bookkeeping.
pub struct BridgeContext {
    channel: broadcast::Sender<Value>,
    ready: AtomicBool,
    capture_lock: Mutex<()>,
    active_patches: AtomicUsize,
}

impl BridgeContext {
    pub fn new() -> Arc<Self> {
        let (channel, _) = broadcast::channel(CHANNEL_CAPACITY);
        Arc::new(Self {
            channel,
            ready: AtomicBool::new(false),
            capture_lock: Mutex::new(()),
            active_patches: AtomicUsize::new(0),
        })
    }

    /// Post a message on the channel. Messages nobody listens to are dropped.
    pub fn post(&self, message: Value) {
        let _ = self.channel.send(message);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.channel.subscribe()
    }

    /// Number of live listeners on the channel.
    pub fn listener_count(&self) -> usize {
        self.channel.receiver_count()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Forget the page script, e.g. after the host replaced its document.
    pub fn reset_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    /// Number of clipboard hooks currently replaced by a capture session.
    pub fn active_patches(&self) -> usize {
        self.active_patches.load(Ordering::SeqCst)
    }

    pub(crate) fn capture_lock(&self) -> &Mutex<()> {
        &self.capture_lock
    }

    pub(crate) fn patch_installed(&self) {
        self.active_patches.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn patch_restored(&self) {
        self.active_patches.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for BridgeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeContext")
            .field("ready", &self.is_ready())
            .field("listeners", &self.listener_count())
            .field("active_patches", &self.active_patches())
            .finish()
    }
}
