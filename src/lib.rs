//! Copilot side panel plumbing for a workflow canvas.
//!
//! Three pieces work together:
//!
//! - [`bridge`] reads and writes the host canvas graph from an isolated
//!   context through a correlated message channel, with a chain of fallback
//!   strategies on the page side.
//! - [`AgentClient`] streams the agent's typed SSE events.
//! - [`SessionOrchestrator`] drives one chat session: it paces streamed text
//!   through the [`TypewriterScheduler`] and, for builder runs, lays out and
//!   imports the produced graph.
// Error carries a full BackendError; boxing it would only move the cost.
#![allow(clippy::result_large_err)]

use std::{future::Future, pin::Pin};

/// Default backend base URL.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/api";

/// Default value of the client identification header.
pub(crate) const DEFAULT_CLIENT_HEADER: &str =
    concat!("canvas-copilot-rust/", env!("CARGO_PKG_VERSION"));

/// Header identifying this client to the backend.
pub(crate) const CLIENT_HEADER: &str = "X-Canvas-Copilot-Client";

/// Default connection timeout (5 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Default timeout for the agent request to start streaming (60 seconds).
pub const DEFAULT_REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// HTTP header name for request ID tracing.
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Agent endpoint, relative to the base URL.
pub const CHAT_COMPLETIONS_PATH: &str = "/agent/chat/completions";

/// Boxed future used at trait seams that must stay object safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub mod bridge;
mod client;
mod credentials;
mod errors;
pub mod events;
mod http;
pub mod layout;
mod session;
mod sse;
mod telemetry;
pub mod testing;
mod typewriter;
mod types;

pub use client::{
    AgentClient, AgentRun, CancelHandle, Client, Config, RunOutcome, ENV_BASE_URL, ENV_TIMEOUT_MS,
};
pub use credentials::TokenStore;
pub use errors::{
    BackendError, BridgeError, Error, HostError, Result, TransportError, TransportErrorKind,
};
pub use events::{AgentEvent, DecodeError, Phase};
pub use http::{HeaderEntry, HeaderList, RetryConfig};
pub use layout::{LayeredLayout, LayoutDirection, LayoutEngine};
pub use session::{ChatMessage, MessageRole, MessageStatus, SessionOrchestrator, SessionSettings};
pub use telemetry::{HttpRequestMetrics, MetricsCallbacks, RequestContext, StreamFirstEventMetrics};
pub use typewriter::{TextSink, TypewriterConfig, TypewriterScheduler};
pub use types::{AgentMode, ChatRequest, Edge, GraphSnapshot, Node, Position, WorkflowMeta};
