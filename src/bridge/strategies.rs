//! Techniques for reading and writing the host graph without a public API.
//!
//! No single technique works on every host version, so the page agent runs
//! them as an ordered [`StrategyChain`]. Each strategy says distinctly whether
//! it does not apply to the current page ([`Attempt::NotApplicable`]) or
//! applied and failed (`Err`).

use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::Value;
use tokio::sync::oneshot;

use super::{
    host::{ClipboardSurface, ClipboardWriter, HostObject, HostPage},
    BridgeConfig, BridgeContext,
};
use crate::{
    errors::HostError,
    types::{GraphSnapshot, WorkflowMeta},
    BoxFuture,
};

/// Outcome of a strategy that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt<T> {
    Applied(T),
    /// The strategy cannot work on this page; the reason is for logs.
    NotApplicable(String),
}

/// What a strategy gets to work with.
pub struct PageScope {
    pub host: Arc<dyn HostPage>,
    pub ctx: Arc<BridgeContext>,
}

type StrategyResult<'a, T> = BoxFuture<'a, Result<Attempt<T>, HostError>>;

/// One way of reaching the host's graph state.
pub trait HostIntrospectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn read_graph<'a>(&'a self, _scope: &'a PageScope) -> StrategyResult<'a, GraphSnapshot> {
        Box::pin(async { Ok(Attempt::NotApplicable("cannot read graphs".into())) })
    }

    fn write_graph<'a>(
        &'a self,
        _scope: &'a PageScope,
        _graph: &'a GraphSnapshot,
    ) -> StrategyResult<'a, ()> {
        Box::pin(async { Ok(Attempt::NotApplicable("read-only".into())) })
    }

    fn read_meta<'a>(&'a self, _scope: &'a PageScope) -> StrategyResult<'a, WorkflowMeta> {
        Box::pin(async { Ok(Attempt::NotApplicable("cannot read metadata".into())) })
    }
}

/// Walks the framework's instance graph from the canvas root looking for a
/// store whose `getState()` holds `nodes` and `edges`. Read-only.
#[derive(Debug, Clone)]
pub struct DirectStoreWalk {
    depth_limit: usize,
}

impl DirectStoreWalk {
    pub fn new(depth_limit: usize) -> Self {
        Self { depth_limit }
    }

    fn root_instance(&self, scope: &PageScope) -> Result<Arc<dyn HostObject>, String> {
        let root = scope
            .host
            .canvas_root()
            .ok_or_else(|| "no canvas root on the page".to_string())?;
        root.instance_handle()
            .ok_or_else(|| "canvas root carries no framework instance".to_string())
    }

    /// Breadth-first search bounded by a visited set and the depth cap.
    fn find_state<T>(
        &self,
        root: Arc<dyn HostObject>,
        mut matcher: impl FnMut(&Value) -> Option<T>,
    ) -> Option<T> {
        let mut visited: HashSet<usize> = HashSet::new();
        let mut queue: VecDeque<(Arc<dyn HostObject>, usize)> = VecDeque::new();
        queue.push_back((root, 0));
        while let Some((obj, depth)) = queue.pop_front() {
            if !visited.insert(identity(&obj)) {
                continue;
            }
            if let Some(found) = obj.store_state().as_ref().and_then(&mut matcher) {
                return Some(found);
            }
            if depth >= self.depth_limit {
                continue;
            }
            for next in obj.links() {
                if !visited.contains(&identity(&next)) {
                    queue.push_back((next, depth + 1));
                }
            }
        }
        None
    }
}

impl Default for DirectStoreWalk {
    fn default() -> Self {
        Self::new(12)
    }
}

fn identity(obj: &Arc<dyn HostObject>) -> usize {
    Arc::as_ptr(obj) as *const () as usize
}

fn graph_state(state: &Value) -> Option<Value> {
    let nodes = state.get("nodes").filter(|v| v.is_array())?;
    let edges = state.get("edges").filter(|v| v.is_array())?;
    Some(serde_json::json!({"nodes": nodes, "edges": edges}))
}

fn meta_state(state: &Value) -> Option<WorkflowMeta> {
    let text = |obj: &Value, keys: &[&str]| {
        keys.iter()
            .find_map(|k| obj.get(*k).and_then(|v| v.as_str()))
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };
    [Some(state), state.get("workflow"), state.get("appDetail")]
        .into_iter()
        .flatten()
        .map(|obj| WorkflowMeta {
            workflow_name: text(obj, &["workflowName", "name"]),
            workflow_description: text(obj, &["workflowDescription", "description", "intro"]),
        })
        .find(|meta| !meta.is_empty())
}

impl HostIntrospectionStrategy for DirectStoreWalk {
    fn name(&self) -> &'static str {
        "direct-store-walk"
    }

    fn read_graph<'a>(&'a self, scope: &'a PageScope) -> StrategyResult<'a, GraphSnapshot> {
        Box::pin(async move {
            let root = match self.root_instance(scope) {
                Ok(root) => root,
                Err(reason) => return Ok(Attempt::NotApplicable(reason)),
            };
            let Some(state) = self.find_state(root, graph_state) else {
                return Ok(Attempt::NotApplicable(format!(
                    "no graph store within {} levels",
                    self.depth_limit
                )));
            };
            let graph: GraphSnapshot = serde_json::from_value(state)
                .map_err(|err| HostError::new(format!("graph store has unexpected shape: {err}")))?;
            Ok(Attempt::Applied(graph))
        })
    }

    fn read_meta<'a>(&'a self, scope: &'a PageScope) -> StrategyResult<'a, WorkflowMeta> {
        Box::pin(async move {
            let root = match self.root_instance(scope) {
                Ok(root) => root,
                Err(reason) => return Ok(Attempt::NotApplicable(reason)),
            };
            Ok(match self.find_state(root, meta_state) {
                Some(meta) => Attempt::Applied(meta),
                None => Attempt::NotApplicable("no workflow metadata in reachable state".into()),
            })
        })
    }
}

/// Writes by dispatching a synthetic paste of the serialized graph at the
/// canvas root and letting the host's own paste handler import it.
///
/// Fire-and-hope: success means the event was dispatched, nothing more.
#[derive(Debug, Clone, Default)]
pub struct SyntheticPasteInjection;

impl HostIntrospectionStrategy for SyntheticPasteInjection {
    fn name(&self) -> &'static str {
        "synthetic-paste"
    }

    fn write_graph<'a>(
        &'a self,
        scope: &'a PageScope,
        graph: &'a GraphSnapshot,
    ) -> StrategyResult<'a, ()> {
        Box::pin(async move {
            let Some(root) = scope.host.canvas_root() else {
                return Ok(Attempt::NotApplicable("no canvas root to paste into".into()));
            };
            let text = serde_json::to_string(graph)
                .map_err(|err| HostError::new(format!("graph did not serialize: {err}")))?;
            root.dispatch_paste(&text)?;
            Ok(Attempt::Applied(()))
        })
    }
}

/// Reads by clicking the host's own export menu entry while the clipboard
/// hooks are replaced, capturing the text the host meant to copy.
#[derive(Debug, Clone)]
pub struct ClipboardCaptureViaMenu {
    labels: Vec<String>,
    timeout: Duration,
}

impl ClipboardCaptureViaMenu {
    pub fn new(labels: Vec<String>, timeout: Duration) -> Self {
        Self {
            labels: labels.into_iter().map(|l| l.to_lowercase()).collect(),
            timeout,
        }
    }
}

impl HostIntrospectionStrategy for ClipboardCaptureViaMenu {
    fn name(&self) -> &'static str {
        "clipboard-capture-via-menu"
    }

    fn read_graph<'a>(&'a self, scope: &'a PageScope) -> StrategyResult<'a, GraphSnapshot> {
        Box::pin(async move {
            let control = scope.host.menu_controls().into_iter().find(|c| {
                let label = c.label().to_lowercase();
                self.labels.iter().any(|l| label.contains(l.as_str()))
            });
            let Some(control) = control else {
                return Ok(Attempt::NotApplicable("no export menu entry".into()));
            };
            let Some(click) = control.click_handler() else {
                return Ok(Attempt::NotApplicable("export menu entry has no click handler".into()));
            };

            let _session = scope.ctx.capture_lock().lock().await;
            let (tx, rx) = oneshot::channel();
            let patch = ClipboardPatch::install(scope.ctx.clone(), scope.host.clipboard(), tx);

            click()?;
            let graph = match tokio::time::timeout(self.timeout, rx).await {
                Ok(Ok(graph)) => graph,
                Ok(Err(_)) => return Err(HostError::new("clipboard capture dropped")),
                Err(_) => {
                    return Err(HostError::new(format!(
                        "host did not copy a graph export within {}ms",
                        self.timeout.as_millis()
                    )))
                }
            };
            drop(patch);

            Ok(Attempt::Applied(graph))
        })
    }
}

fn parse_captured(text: &str) -> Result<GraphSnapshot, HostError> {
    let value: Value = serde_json::from_str(text.trim())
        .map_err(|err| HostError::new(format!("captured export is not JSON: {err}")))?;
    let state = graph_state(&value)
        .or_else(|| value.get("data").and_then(graph_state))
        .ok_or_else(|| HostError::new("captured export has no nodes/edges"))?;
    serde_json::from_value(state)
        .map_err(|err| HostError::new(format!("captured export has unexpected shape: {err}")))
}

/// Replaced clipboard hooks; the originals come back when this is dropped,
/// whichever way the capture ends.
struct ClipboardPatch {
    ctx: Arc<BridgeContext>,
    surface: Arc<dyn ClipboardSurface>,
    original_write: ClipboardWriter,
    original_copy: ClipboardWriter,
}

impl ClipboardPatch {
    fn install(
        ctx: Arc<BridgeContext>,
        surface: Arc<dyn ClipboardSurface>,
        sender: oneshot::Sender<GraphSnapshot>,
    ) -> Self {
        let original_write = surface.write_text_hook();
        let original_copy = surface.copy_command_hook();
        let slot = Arc::new(Mutex::new(Some(sender)));

        // Only the first write that parses as a graph export is captured.
        // Everything else goes to the real clipboard as usual.
        let capturing = |original: ClipboardWriter| -> ClipboardWriter {
            let slot = slot.clone();
            Arc::new(move |text: &str| {
                let graph = match parse_captured(text) {
                    Ok(graph) => graph,
                    Err(err) => {
                        tracing::trace!(reason = %err.message, "passing clipboard write through");
                        return original(text);
                    }
                };
                let sender = slot.lock().ok().and_then(|mut s| s.take());
                match sender {
                    Some(tx) => {
                        let _ = tx.send(graph);
                        Ok(())
                    }
                    None => original(text),
                }
            })
        };
        surface.set_write_text_hook(capturing(original_write.clone()));
        surface.set_copy_command_hook(capturing(original_copy.clone()));
        ctx.patch_installed();

        Self {
            ctx,
            surface,
            original_write,
            original_copy,
        }
    }
}

impl Drop for ClipboardPatch {
    fn drop(&mut self) {
        self.surface.set_write_text_hook(self.original_write.clone());
        self.surface.set_copy_command_hook(self.original_copy.clone());
        self.ctx.patch_restored();
    }
}

/// Why a chain produced nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainFailure {
    /// No strategy applied to this page; one reason per strategy.
    Unavailable(Vec<String>),
    /// At least one strategy applied but failed; the last failure is kept.
    Failed { strategy: &'static str, message: String },
}

impl ChainFailure {
    pub fn message(&self) -> String {
        match self {
            ChainFailure::Unavailable(reasons) => reasons.join("; "),
            ChainFailure::Failed { strategy, message } => format!("{strategy}: {message}"),
        }
    }
}

#[derive(Default)]
struct Outcomes {
    skipped: Vec<String>,
    failure: Option<(&'static str, String)>,
}

impl Outcomes {
    fn record<T>(
        &mut self,
        operation: &str,
        strategy: &'static str,
        result: Result<Attempt<T>, HostError>,
    ) -> Option<T> {
        match result {
            Ok(Attempt::Applied(value)) => {
                tracing::debug!(operation, strategy, "host introspection succeeded");
                Some(value)
            }
            Ok(Attempt::NotApplicable(reason)) => {
                tracing::debug!(operation, strategy, %reason, "strategy not applicable");
                self.skipped.push(format!("{strategy}: {reason}"));
                None
            }
            Err(err) => {
                tracing::warn!(operation, strategy, error = %err, "strategy failed");
                self.failure = Some((strategy, err.message));
                None
            }
        }
    }

    fn into_failure(self) -> ChainFailure {
        match self.failure {
            Some((strategy, message)) => ChainFailure::Failed { strategy, message },
            None => ChainFailure::Unavailable(self.skipped),
        }
    }
}

/// Strategies tried in order until one succeeds.
#[derive(Clone)]
pub struct StrategyChain {
    strategies: Vec<Arc<dyn HostIntrospectionStrategy>>,
}

impl StrategyChain {
    pub fn new(strategies: Vec<Arc<dyn HostIntrospectionStrategy>>) -> Self {
        Self { strategies }
    }

    /// Store walk, then menu capture for reads; synthetic paste for writes.
    pub fn standard(config: &BridgeConfig) -> Self {
        Self::new(vec![
            Arc::new(DirectStoreWalk::new(config.walk_depth_limit)),
            Arc::new(ClipboardCaptureViaMenu::new(
                config.export_menu_labels.clone(),
                config.capture_timeout,
            )),
            Arc::new(SyntheticPasteInjection),
        ])
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub async fn export_graph(&self, scope: &PageScope) -> Result<GraphSnapshot, ChainFailure> {
        let mut outcomes = Outcomes::default();
        for strategy in &self.strategies {
            let result = strategy.read_graph(scope).await;
            if let Some(graph) = outcomes.record("export", strategy.name(), result) {
                return Ok(graph);
            }
        }
        Err(outcomes.into_failure())
    }

    pub async fn import_graph(
        &self,
        scope: &PageScope,
        graph: &GraphSnapshot,
    ) -> Result<(), ChainFailure> {
        let mut outcomes = Outcomes::default();
        for strategy in &self.strategies {
            let result = strategy.write_graph(scope, graph).await;
            if outcomes.record("import", strategy.name(), result).is_some() {
                return Ok(());
            }
        }
        Err(outcomes.into_failure())
    }

    pub async fn export_meta(&self, scope: &PageScope) -> Result<WorkflowMeta, ChainFailure> {
        let mut outcomes = Outcomes::default();
        for strategy in &self.strategies {
            let result = strategy.read_meta(scope).await;
            if let Some(meta) = outcomes.record("meta", strategy.name(), result) {
                return Ok(meta);
            }
        }
        Err(outcomes.into_failure())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeHost, FakeObject};
    use crate::types::{Edge, Node};
    use serde_json::json;

    fn sample_graph() -> GraphSnapshot {
        GraphSnapshot::new(
            vec![
                Node::new("start", "workflowStart").with_position(0.0, 0.0),
                Node::new("llm", "chatNode").with_position(250.0, 0.0),
            ],
            vec![Edge::new("start", "llm").with_handles("start-source-right", "llm-target-left")],
        )
    }

    fn scope(host: Arc<FakeHost>) -> PageScope {
        PageScope {
            host,
            ctx: BridgeContext::new(),
        }
    }

    #[tokio::test]
    async fn store_walk_finds_state_behind_cycles() {
        let store = FakeObject::with_state(serde_json::to_value(sample_graph()).unwrap());
        let root = FakeObject::chain(5, store);
        // Back-edge to the root makes the instance graph cyclic.
        root.link(root.clone());
        let host = Arc::new(FakeHost::with_canvas(root));
        let graph = DirectStoreWalk::default()
            .read_graph(&scope(host))
            .await
            .unwrap();
        assert_eq!(graph, Attempt::Applied(sample_graph()));
    }

    #[tokio::test]
    async fn store_walk_respects_depth_cap() {
        let store = FakeObject::with_state(serde_json::to_value(sample_graph()).unwrap());
        let host = Arc::new(FakeHost::with_canvas(FakeObject::chain(20, store)));
        let result = DirectStoreWalk::new(12).read_graph(&scope(host)).await.unwrap();
        assert!(matches!(result, Attempt::NotApplicable(_)));
    }

    #[tokio::test]
    async fn store_walk_reads_meta() {
        let store = FakeObject::with_state(json!({
            "appDetail": {"name": "Support bot", "intro": "Answers tickets"}
        }));
        let host = Arc::new(FakeHost::with_canvas(FakeObject::chain(2, store)));
        let meta = DirectStoreWalk::default().read_meta(&scope(host)).await.unwrap();
        assert_eq!(
            meta,
            Attempt::Applied(WorkflowMeta {
                workflow_name: "Support bot".into(),
                workflow_description: "Answers tickets".into(),
            })
        );
    }

    #[tokio::test]
    async fn paste_dispatches_serialized_graph() {
        let host = Arc::new(FakeHost::with_canvas(FakeObject::new()));
        let result = SyntheticPasteInjection
            .write_graph(&scope(host.clone()), &sample_graph())
            .await
            .unwrap();
        assert_eq!(result, Attempt::Applied(()));
        let pasted = host.pasted();
        assert_eq!(pasted.len(), 1);
        let parsed: GraphSnapshot = serde_json::from_str(&pasted[0]).unwrap();
        assert_eq!(parsed, sample_graph());
    }

    #[tokio::test]
    async fn menu_capture_restores_hooks_on_success() {
        let host = Arc::new(FakeHost::empty());
        let text = serde_json::to_string(&sample_graph()).unwrap();
        host.add_export_menu("Export workflow", text);
        let scope = scope(host.clone());
        let strategy = ClipboardCaptureViaMenu::new(vec!["export".into()], Duration::from_millis(200));

        let result = strategy.read_graph(&scope).await.unwrap();
        assert_eq!(result, Attempt::Applied(sample_graph()));
        assert_eq!(scope.ctx.active_patches(), 0);
        // The captured text never reached the system clipboard...
        assert!(host.clipboard_writes().is_empty());
        // ...and later writes do.
        (host.clipboard().write_text_hook())("user copy").unwrap();
        assert_eq!(host.clipboard_writes(), vec!["user copy".to_string()]);
    }

    #[tokio::test]
    async fn menu_capture_lets_unrelated_writes_through() {
        let host = Arc::new(FakeHost::empty());
        host.add_copying_menu(
            "Export workflow",
            vec![
                "hello".to_string(),
                json!({"nodes": "not a list"}).to_string(),
                serde_json::to_string(&sample_graph()).unwrap(),
            ],
        );
        let scope = scope(host.clone());
        let strategy = ClipboardCaptureViaMenu::new(vec!["export".into()], Duration::from_millis(200));

        let result = strategy.read_graph(&scope).await.unwrap();
        assert_eq!(result, Attempt::Applied(sample_graph()));
        assert_eq!(
            host.clipboard_writes(),
            vec!["hello".to_string(), json!({"nodes": "not a list"}).to_string()]
        );
        assert_eq!(scope.ctx.active_patches(), 0);
    }

    #[tokio::test]
    async fn menu_capture_restores_hooks_on_timeout() {
        let host = Arc::new(FakeHost::empty());
        host.add_silent_menu("Export");
        let scope = scope(host.clone());
        let strategy = ClipboardCaptureViaMenu::new(vec!["export".into()], Duration::from_millis(20));

        let err = strategy.read_graph(&scope).await.unwrap_err();
        assert!(err.message.contains("did not copy"));
        assert_eq!(scope.ctx.active_patches(), 0);
        (host.clipboard().copy_command_hook())("selection").unwrap();
        assert_eq!(host.clipboard_writes(), vec!["selection".to_string()]);
    }

    #[tokio::test]
    async fn menu_capture_restores_hooks_when_click_throws() {
        let host = Arc::new(FakeHost::empty());
        host.add_failing_menu("Export");
        let scope = scope(host.clone());
        let strategy = ClipboardCaptureViaMenu::new(vec!["export".into()], Duration::from_millis(200));
        assert!(strategy.read_graph(&scope).await.is_err());
        assert_eq!(scope.ctx.active_patches(), 0);
    }

    #[tokio::test]
    async fn chain_falls_through_to_menu_capture() {
        // Canvas without a reachable store: the walk does not apply.
        let host = Arc::new(FakeHost::with_canvas(FakeObject::new()));
        host.add_export_menu("Export", serde_json::to_string(&sample_graph()).unwrap());
        let chain = StrategyChain::standard(&BridgeConfig::default());
        let graph = chain.export_graph(&scope(host)).await.unwrap();
        assert_eq!(graph, sample_graph());
    }

    #[tokio::test]
    async fn chain_reports_unavailable_without_canvas() {
        let chain = StrategyChain::standard(&BridgeConfig::default());
        let host = Arc::new(FakeHost::empty());
        let err = chain
            .import_graph(&scope(host), &sample_graph())
            .await
            .unwrap_err();
        match err {
            ChainFailure::Unavailable(reasons) => assert_eq!(reasons.len(), 3),
            other => panic!("expected unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn chain_reports_last_failure() {
        let host = Arc::new(FakeHost::with_canvas(FakeObject::new()));
        host.fail_pastes("paste handler threw");
        let chain = StrategyChain::standard(&BridgeConfig::default());
        let err = chain
            .import_graph(&scope(host), &sample_graph())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ChainFailure::Failed {
                strategy: "synthetic-paste",
                message: "paste handler threw".into()
            }
        );
    }
}
