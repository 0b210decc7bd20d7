use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures_util::StreamExt;
use reqwest::{
    header::{HeaderName, HeaderValue, ACCEPT, AUTHORIZATION},
    Method,
};

use crate::{
    credentials::TokenStore,
    errors::{BackendError, Error, Result, TransportError},
    events::{decode_frame, AgentEvent},
    http::{is_json_response, parse_backend_error, request_id_from_headers, HeaderList},
    sse::{self, DataStream},
    telemetry::{HttpRequestMetrics, RequestContext, Telemetry},
    types::{AgentMode, ChatRequest, GraphSnapshot},
    CHAT_COMPLETIONS_PATH, CLIENT_HEADER, DEFAULT_BASE_URL, DEFAULT_CLIENT_HEADER,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
};

/// Environment variable overriding [`Config::base_url`].
pub const ENV_BASE_URL: &str = "CANVAS_COPILOT_BASE_URL";
/// Environment variable overriding [`Config::timeout`], in milliseconds.
pub const ENV_TIMEOUT_MS: &str = "CANVAS_COPILOT_TIMEOUT_MS";

#[derive(Clone, Debug, Default)]
pub struct Config {
    pub base_url: Option<String>,
    pub client_header: Option<String>,
    pub http_client: Option<reqwest::Client>,
    /// Override the connect timeout (defaults to 5s).
    pub connect_timeout: Option<Duration>,
    /// Bound on waiting for response headers (defaults to 60s). The stream
    /// body itself is not bounded.
    pub timeout: Option<Duration>,
    /// Default extra headers applied to all requests.
    pub default_headers: Option<HeaderList>,
    /// Optional metrics callbacks (HTTP latency, time to first event).
    pub metrics: Option<crate::telemetry::MetricsCallbacks>,
}

impl Config {
    /// Defaults overridden by `CANVAS_COPILOT_BASE_URL` and
    /// `CANVAS_COPILOT_TIMEOUT_MS` when set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Config::default();
        if let Some(url) = lookup(ENV_BASE_URL).filter(|s| !s.trim().is_empty()) {
            cfg.base_url = Some(url.trim().to_string());
        }
        if let Some(raw) = lookup(ENV_TIMEOUT_MS).filter(|s| !s.trim().is_empty()) {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                Error::Config(format!("{ENV_TIMEOUT_MS} must be a number of milliseconds, got {raw:?}"))
            })?;
            cfg.timeout = Some(Duration::from_millis(ms));
        }
        Ok(cfg)
    }
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    base_url: String,
    client_header: Option<String>,
    http: reqwest::Client,
    request_timeout: Duration,
    default_headers: Option<HeaderList>,
    telemetry: Telemetry,
    tokens: TokenStore,
}

impl Client {
    pub fn new(cfg: Config, tokens: TokenStore) -> Result<Self> {
        let base = cfg
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        reqwest::Url::parse(&base)
            .map_err(|err| Error::Config(format!("invalid base url: {err}")))?;

        let connect_timeout = cfg.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let request_timeout = cfg.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let http = match cfg.http_client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .connect_timeout(connect_timeout)
                .build()
                .map_err(|err| TransportError::connect("failed to build http client", err))?,
        };

        let client_header = cfg
            .client_header
            .filter(|s| !s.trim().is_empty())
            .or_else(|| Some(DEFAULT_CLIENT_HEADER.to_string()));

        Ok(Self {
            inner: Arc::new(ClientInner {
                base_url: base,
                client_header,
                http,
                request_timeout,
                default_headers: cfg.default_headers,
                telemetry: Telemetry::new(cfg.metrics),
                tokens,
            }),
        })
    }

    pub fn agent(&self) -> AgentClient {
        AgentClient {
            inner: self.inner.clone(),
        }
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.inner.tokens
    }
}

fn apply_header_list(
    mut builder: reqwest::RequestBuilder,
    headers: &HeaderList,
) -> Result<reqwest::RequestBuilder> {
    for entry in headers.iter() {
        if !entry.is_valid() {
            continue;
        }
        let name = HeaderName::from_bytes(entry.key.trim().as_bytes())
            .map_err(|err| Error::Config(format!("invalid header name: {err}")))?;
        let val = HeaderValue::from_str(entry.value.trim())
            .map_err(|err| Error::Config(format!("invalid header value: {err}")))?;
        builder = builder.header(name, val);
    }
    Ok(builder)
}

/// Client for the streaming agent endpoint.
#[derive(Clone)]
pub struct AgentClient {
    inner: Arc<ClientInner>,
}

impl AgentClient {
    /// Start a run and return once the response is known to be an event
    /// stream. Non-2xx responses and JSON bodies fail here with the
    /// backend's message; their bodies are never read as a stream.
    pub async fn open(&self, req: ChatRequest) -> Result<AgentRun> {
        req.validate().map_err(Error::Config)?;
        let token = self
            .inner
            .tokens
            .get_token()
            .ok_or_else(|| Error::Config("not signed in: no access token".into()))?;

        let builder = self
            .inner
            .request(Method::POST, CHAT_COMPLETIONS_PATH)?
            .json(&req);
        let builder = self.inner.with_headers(builder, &token)?;
        let ctx = RequestContext::new(Method::POST.as_str(), CHAT_COMPLETIONS_PATH)
            .with_session(req.session_id.as_str(), req.mode);

        let start = Instant::now();
        let resp = match tokio::time::timeout(self.inner.request_timeout, builder.send()).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => {
                self.inner.record(start, None, Some(err.to_string()), ctx);
                return Err(TransportError::from_reqwest(err).into());
            }
            Err(_) => {
                let err = TransportError::timeout(format!(
                    "no response within {}ms",
                    self.inner.request_timeout.as_millis()
                ));
                self.inner.record(start, None, Some(err.to_string()), ctx);
                return Err(err.into());
            }
        };

        let status = resp.status();
        let request_id = request_id_from_headers(resp.headers());
        let ctx = ctx.with_request_id(request_id.clone());
        if !status.is_success() || is_json_response(resp.headers()) {
            let headers = resp.headers().clone();
            let body = resp.text().await.unwrap_or_default();
            let err = parse_backend_error(status, &headers, body);
            self.inner
                .record(start, Some(status.as_u16()), Some(err.message.clone()), ctx);
            tracing::warn!(
                status = status.as_u16(),
                code = ?err.code,
                request_id = ?err.request_id,
                "agent request rejected"
            );
            return Err(err.into());
        }
        self.inner
            .record(start, Some(status.as_u16()), None, ctx.clone());

        let telemetry = self.inner.telemetry.stream_state(ctx, start);
        Ok(AgentRun::new(
            req.mode,
            request_id,
            sse::data_stream(resp, Some(telemetry)),
        ))
    }

    /// Run to completion, handing every forwarded event to `on_event`.
    pub async fn send<F>(&self, req: ChatRequest, mut on_event: F) -> Result<RunOutcome>
    where
        F: FnMut(&AgentEvent),
    {
        let mut run = self.open(req).await?;
        while let Some(event) = run.next_event().await? {
            on_event(&event);
        }
        run.finish().await
    }
}

impl ClientInner {
    fn request(&self, method: Method, path: &str) -> Result<reqwest::RequestBuilder> {
        let url = reqwest::Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|err| Error::Config(format!("invalid path: {err}")))?;
        Ok(self.http.request(method, url))
    }

    fn with_headers(
        &self,
        mut builder: reqwest::RequestBuilder,
        token: &str,
    ) -> Result<reqwest::RequestBuilder> {
        builder = builder.header(ACCEPT, "text/event-stream");
        // The backend expects the stored token as-is, scheme included if any.
        builder = builder.header(AUTHORIZATION, token);
        if let Some(client_header) = self.client_header.as_deref() {
            builder = builder.header(CLIENT_HEADER, client_header);
        }
        if let Some(defaults) = &self.default_headers {
            builder = apply_header_list(builder, defaults)?;
        }
        Ok(builder)
    }

    fn record(
        &self,
        start: Instant,
        status: Option<u16>,
        error: Option<String>,
        context: RequestContext,
    ) {
        self.telemetry.record_http(HttpRequestMetrics {
            latency: start.elapsed(),
            status,
            error,
            context,
        });
    }
}

/// Cancels an [`AgentRun`] from another task.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a finished run produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutcome {
    pub graph: Option<GraphSnapshot>,
    /// Answer text as assembled from `answer.*` events.
    pub answer: String,
    /// Frames that did not decode and were skipped.
    pub skipped_frames: usize,
    pub cancelled: bool,
}

/// An open agent stream.
///
/// `graph` events are absorbed into the outcome rather than forwarded. After
/// an `error` event or a cancel the remaining frames are still read, so the
/// connection ends normally, but nothing more is forwarded.
pub struct AgentRun {
    mode: AgentMode,
    request_id: Option<String>,
    frames: DataStream,
    graph: Option<GraphSnapshot>,
    answer: String,
    error: Option<String>,
    skipped: usize,
    cancel: CancelHandle,
}

impl AgentRun {
    fn new(mode: AgentMode, request_id: Option<String>, frames: DataStream) -> Self {
        Self {
            mode,
            request_id,
            frames,
            graph: None,
            answer: String::new(),
            error: None,
            skipped: 0,
            cancel: CancelHandle::default(),
        }
    }

    /// Replay a recorded `text/event-stream` body.
    pub fn from_sse_text(mode: AgentMode, body: impl Into<String>) -> Self {
        Self::new(mode, None, sse::data_stream_from_text(body))
    }

    pub fn mode(&self) -> AgentMode {
        self.mode
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn graph(&self) -> Option<&GraphSnapshot> {
        self.graph.as_ref()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Share an existing handle, e.g. one created before the run was opened.
    pub fn with_cancel_handle(mut self, handle: CancelHandle) -> Self {
        self.cancel = handle;
        self
    }

    /// Next forwardable event, or `None` once the stream has closed.
    pub async fn next_event(&mut self) -> Result<Option<AgentEvent>> {
        while let Some(frame) = self.frames.next().await {
            let data = frame?;
            if self.cancel.is_cancelled() || self.error.is_some() {
                continue;
            }
            let event = match decode_frame(&data) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(err) => {
                    self.skipped += 1;
                    tracing::warn!(error = %err, "skipping undecodable stream frame");
                    continue;
                }
            };
            match &event {
                AgentEvent::Graph(graph) => {
                    self.graph = Some(graph.clone());
                    continue;
                }
                AgentEvent::Error(info) => self.error = Some(info.message.clone()),
                AgentEvent::AnswerDelta(chunk) => self.answer.push_str(&chunk.content),
                AgentEvent::AnswerReset(_) => self.answer.clear(),
                AgentEvent::AnswerDone(chunk) if !chunk.content.is_empty() => {
                    self.answer = chunk.content.clone();
                }
                _ => {}
            }
            return Ok(Some(event));
        }
        Ok(None)
    }

    /// Read the stream to its end and settle the run.
    pub async fn finish(mut self) -> Result<RunOutcome> {
        while self.next_event().await?.is_some() {}
        let cancelled = self.cancel.is_cancelled();
        if let Some(message) = self.error {
            return Err(BackendError::new(200, message).into());
        }
        if !cancelled && self.mode.requires_graph() && self.graph.is_none() {
            return Err(Error::MissingGraph);
        }
        Ok(RunOutcome {
            graph: self.graph,
            answer: self.answer,
            skipped_frames: self.skipped,
            cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Phase;

    fn body(frames: &[&str]) -> String {
        frames.iter().map(|f| format!("data: {f}\n\n")).collect()
    }

    #[tokio::test]
    async fn bad_frames_are_skipped_not_fatal() {
        let text = body(&[
            r#"{"type":"phase.started","phase":"execute_tools"}"#,
            "{not json",
            r#"{"type":"chunk","content":"legacy"}"#,
            r#"{"type":"answer.delta","content":"ok"}"#,
            "[DONE]",
        ]);
        let mut run = AgentRun::from_sse_text(AgentMode::Chat, text);
        let first = run.next_event().await.unwrap().unwrap();
        assert!(matches!(first, AgentEvent::PhaseStarted(ref p) if p.phase == Phase::ExecuteTools));
        let second = run.next_event().await.unwrap().unwrap();
        assert_eq!(second.event_type(), "answer.delta");
        assert!(run.next_event().await.unwrap().is_none());
        let outcome = run.finish().await.unwrap();
        assert_eq!(outcome.answer, "ok");
        assert_eq!(outcome.skipped_frames, 2);
    }

    #[tokio::test]
    async fn graph_is_absorbed_into_the_outcome() {
        let text = body(&[
            r#"{"type":"graph","data":{"nodes":[{"id":"a","type":"start","position":{"x":0,"y":0},"data":{}}],"edges":[]}}"#,
            r#"{"type":"run.completed"}"#,
        ]);
        let mut run = AgentRun::from_sse_text(AgentMode::Builder, text);
        let event = run.next_event().await.unwrap().unwrap();
        assert_eq!(event.event_type(), "run.completed");
        let outcome = run.finish().await.unwrap();
        assert_eq!(outcome.graph.unwrap().nodes[0].id, "a");
    }

    #[tokio::test]
    async fn builder_run_without_graph_is_missing_graph() {
        let text = body(&[r#"{"type":"answer.done","content":"done"}"#]);
        let err = AgentRun::from_sse_text(AgentMode::Builder, text)
            .finish()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingGraph));
    }

    #[tokio::test]
    async fn error_event_stops_forwarding_and_fails_the_run() {
        let text = body(&[
            r#"{"type":"error","message":"model overloaded"}"#,
            r#"{"type":"answer.delta","content":"ignored"}"#,
        ]);
        let mut run = AgentRun::from_sse_text(AgentMode::Chat, text);
        assert_eq!(run.next_event().await.unwrap().unwrap().event_type(), "error");
        assert!(run.next_event().await.unwrap().is_none());
        let err = run.finish().await.unwrap_err();
        assert_eq!(err.to_string(), "model overloaded");
    }

    #[tokio::test]
    async fn reset_and_done_rewrite_the_answer() {
        let text = body(&[
            r#"{"type":"answer.delta","content":"draft"}"#,
            r#"{"type":"answer.reset","message":"retrying"}"#,
            r#"{"type":"answer.delta","content":"Fin"}"#,
            r#"{"type":"answer.done","content":"Final"}"#,
        ]);
        let outcome = AgentRun::from_sse_text(AgentMode::Chat, text)
            .finish()
            .await
            .unwrap();
        assert_eq!(outcome.answer, "Final");
    }

    #[tokio::test]
    async fn cancelled_run_drains_silently() {
        let text = body(&[
            r#"{"type":"answer.delta","content":"a"}"#,
            r#"{"type":"answer.delta","content":"b"}"#,
        ]);
        let mut run = AgentRun::from_sse_text(AgentMode::Builder, text);
        run.next_event().await.unwrap();
        run.cancel_handle().cancel();
        assert!(run.next_event().await.unwrap().is_none());
        let outcome = run.finish().await.unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.answer, "a");
    }

    #[test]
    fn config_reads_overrides() {
        let cfg = Config::from_lookup(|key| match key {
            ENV_BASE_URL => Some("http://localhost:8000/".into()),
            ENV_TIMEOUT_MS => Some("1500".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.base_url.as_deref(), Some("http://localhost:8000/"));
        assert_eq!(cfg.timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn config_rejects_bad_timeout() {
        let err = Config::from_lookup(|key| (key == ENV_TIMEOUT_MS).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains(ENV_TIMEOUT_MS)));
    }

    #[tokio::test]
    async fn missing_token_fails_before_any_io() {
        let client = Client::new(
            Config {
                base_url: Some("http://127.0.0.1:9".into()),
                ..Default::default()
            },
            TokenStore::new(),
        )
        .unwrap();
        let req = ChatRequest::new(AgentMode::Chat, "hi", "s1", GraphSnapshot::default())
            .with_model_config_id(1);
        let err = client.agent().open(req).await.err().unwrap();
        assert!(matches!(err, Error::Config(msg) if msg.contains("access token")));
    }
}
