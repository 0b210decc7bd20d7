use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{errors::Error, types::AgentMode};

/// User-provided callbacks for emitting metrics without taking on a metrics backend.
#[derive(Clone, Default)]
pub struct MetricsCallbacks {
    pub http_request: Option<Arc<dyn Fn(HttpRequestMetrics) + Send + Sync>>,
    pub stream_first_event: Option<Arc<dyn Fn(StreamFirstEventMetrics) + Send + Sync>>,
}

impl fmt::Debug for MetricsCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsCallbacks")
            .field(
                "http_request",
                &self.http_request.as_ref().map(|_| "callback"),
            )
            .field(
                "stream_first_event",
                &self.stream_first_event.as_ref().map(|_| "callback"),
            )
            .finish()
    }
}

/// Common request metadata shared by all telemetry events.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub mode: Option<AgentMode>,
    pub session_id: Option<String>,
    pub request_id: Option<String>,
}

impl RequestContext {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>, mode: AgentMode) -> Self {
        let id = session_id.into();
        if !id.trim().is_empty() {
            self.session_id = Some(id);
        }
        self.mode = Some(mode);
        self
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        if let Some(id) = request_id {
            if !id.trim().is_empty() {
                self.request_id = Some(id);
            }
        }
        self
    }
}

/// HTTP request latency and outcome (time to response headers).
#[derive(Clone, Debug)]
pub struct HttpRequestMetrics {
    pub latency: Duration,
    pub status: Option<u16>,
    pub error: Option<String>,
    pub context: RequestContext,
}

/// Time from request start to the first `data:` frame of the stream.
#[derive(Clone, Debug)]
pub struct StreamFirstEventMetrics {
    pub latency: Duration,
    pub error: Option<String>,
    pub context: RequestContext,
}

/// Internal helper that owns the registered callbacks (if any).
#[derive(Clone, Default)]
pub(crate) struct Telemetry {
    callbacks: MetricsCallbacks,
}

impl Telemetry {
    pub fn new(callbacks: Option<MetricsCallbacks>) -> Self {
        Self {
            callbacks: callbacks.unwrap_or_default(),
        }
    }

    pub fn record_http(&self, metrics: HttpRequestMetrics) {
        tracing::debug!(
            method = %metrics.context.method,
            path = %metrics.context.path,
            status = ?metrics.status,
            latency_ms = metrics.latency.as_millis() as u64,
            error = ?metrics.error,
            "agent http request"
        );
        if let Some(cb) = &self.callbacks.http_request {
            cb(metrics);
        }
    }

    pub fn stream_state(&self, context: RequestContext, start: Instant) -> StreamTelemetry {
        StreamTelemetry::new(self.clone(), context, start)
    }
}

/// Per-stream tracing/metrics state shared with the body reader.
#[derive(Clone)]
pub(crate) struct StreamTelemetry {
    inner: Arc<StreamTelemetryInner>,
}

struct StreamTelemetryInner {
    telemetry: Telemetry,
    context: RequestContext,
    start: Instant,
    first_frame_recorded: AtomicBool,
    closed: AtomicBool,
}

impl StreamTelemetry {
    pub fn new(telemetry: Telemetry, context: RequestContext, start: Instant) -> Self {
        Self {
            inner: Arc::new(StreamTelemetryInner {
                telemetry,
                context,
                start,
                first_frame_recorded: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn on_frame(&self, data: &str) {
        tracing::trace!(
            session_id = ?self.inner.context.session_id,
            bytes = data.len(),
            "stream frame"
        );
        self.record_first(None);
    }

    pub fn on_error(&self, error: &Error) {
        tracing::warn!(
            session_id = ?self.inner.context.session_id,
            error = %error,
            "agent stream failed"
        );
        self.record_first(Some(error.to_string()));
    }

    pub fn on_closed(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(
            session_id = ?self.inner.context.session_id,
            elapsed_ms = self.inner.start.elapsed().as_millis() as u64,
            "agent stream closed"
        );
    }

    fn record_first(&self, error: Option<String>) {
        if self.inner.first_frame_recorded.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(cb) = &self.inner.telemetry.callbacks.stream_first_event {
            cb(StreamFirstEventMetrics {
                latency: self.inner.start.elapsed(),
                error,
                context: self.inner.context.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn first_event_is_recorded_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let telemetry = Telemetry::new(Some(MetricsCallbacks {
            stream_first_event: Some(Arc::new(move |m: StreamFirstEventMetrics| {
                sink.lock().unwrap().push(m.error);
            })),
            ..Default::default()
        }));
        let stream = telemetry.stream_state(
            RequestContext::new("POST", "/agent/chat/completions").with_session("s1", AgentMode::Chat),
            Instant::now(),
        );
        stream.on_frame("{}");
        stream.on_frame("{}");
        stream.on_closed();
        stream.on_closed();
        assert_eq!(seen.lock().unwrap().as_slice(), &[None]);
    }

    #[test]
    fn context_ignores_blank_ids() {
        let ctx = RequestContext::new("POST", "/x")
            .with_session("  ", AgentMode::Builder)
            .with_request_id(Some(String::new()));
        assert!(ctx.session_id.is_none());
        assert!(ctx.request_id.is_none());
        assert_eq!(ctx.mode, Some(AgentMode::Builder));
    }
}
