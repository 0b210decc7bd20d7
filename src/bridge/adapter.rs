use std::sync::Arc;

use serde_json::Value;

use super::{
    host::HostPage, BridgeConfig, BridgeContext, BridgeKind, CorrelatedMessenger, InjectionLoader,
    PageAgentInjector,
};
use crate::{
    errors::{BridgeError, Error, Result},
    types::{GraphSnapshot, WorkflowMeta},
    BoxFuture,
};

/// What the rest of the extension needs from the host canvas.
pub trait GraphPort: Send + Sync {
    fn export_graph(&self) -> BoxFuture<'_, Result<GraphSnapshot>>;

    /// `Ok(true)` means the import attempt completed, not that the host
    /// applied it; verify through the UI.
    fn import_graph<'a>(&'a self, graph: &'a GraphSnapshot) -> BoxFuture<'a, Result<bool>>;

    /// Best-effort; `None` when the host exposes no metadata.
    fn export_meta(&self) -> BoxFuture<'_, Result<Option<WorkflowMeta>>>;
}

/// Extension-side entry point to the host graph.
///
/// Every call makes sure the page script is loaded, then performs one
/// correlated exchange with it bounded by the per-operation timeout.
#[derive(Clone)]
pub struct GraphAdapter {
    ctx: Arc<BridgeContext>,
    loader: InjectionLoader,
    messenger: CorrelatedMessenger,
    config: BridgeConfig,
}

impl GraphAdapter {
    pub fn new(ctx: Arc<BridgeContext>, loader: InjectionLoader, config: BridgeConfig) -> Self {
        Self {
            messenger: CorrelatedMessenger::new(ctx.clone()),
            ctx,
            loader,
            config,
        }
    }

    /// Adapter whose page script is a [`PageAgent`](super::PageAgent) running
    /// in this process against `host`.
    pub fn in_process(host: Arc<dyn HostPage>, config: BridgeConfig) -> Self {
        let ctx = BridgeContext::new();
        let injector = Arc::new(PageAgentInjector::new(host, &config));
        let loader = InjectionLoader::new(ctx.clone(), injector, config.clone());
        Self::new(ctx, loader, config)
    }

    pub fn context(&self) -> &Arc<BridgeContext> {
        &self.ctx
    }

    async fn call(&self, kind: BridgeKind, payload: Value) -> Result<Value> {
        self.loader.ensure_loaded().await?;
        self.messenger
            .request(kind, payload, self.config.timeout_for(kind))
            .await
            .map_err(classify)
    }

    pub async fn export_graph(&self) -> Result<GraphSnapshot> {
        let payload = self.call(BridgeKind::ExportGraph, Value::Null).await?;
        Ok(serde_json::from_value(payload)?)
    }

    pub async fn import_graph(&self, graph: &GraphSnapshot) -> Result<bool> {
        let dangling = graph.dangling_edges();
        if !dangling.is_empty() {
            tracing::warn!(count = dangling.len(), "importing graph with dangling edges");
        }
        self.call(BridgeKind::ImportGraph, serde_json::to_value(graph)?)
            .await?;
        Ok(true)
    }

    pub async fn export_meta(&self) -> Result<Option<WorkflowMeta>> {
        let payload = self.call(BridgeKind::ExportMeta, Value::Null).await?;
        if payload.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(payload)?))
    }
}

fn classify(err: BridgeError) -> Error {
    match err {
        BridgeError::Timeout { kind, after }
            if matches!(kind, BridgeKind::ExportGraph | BridgeKind::ExportMeta) =>
        {
            Error::ExportTimeout { kind, after }
        }
        BridgeError::Unavailable { message, .. } => Error::HostIntrospectionUnavailable(message),
        other => Error::Bridge(other),
    }
}

impl GraphPort for GraphAdapter {
    fn export_graph(&self) -> BoxFuture<'_, Result<GraphSnapshot>> {
        Box::pin(GraphAdapter::export_graph(self))
    }

    fn import_graph<'a>(&'a self, graph: &'a GraphSnapshot) -> BoxFuture<'a, Result<bool>> {
        Box::pin(GraphAdapter::import_graph(self, graph))
    }

    fn export_meta(&self) -> BoxFuture<'_, Result<Option<WorkflowMeta>>> {
        Box::pin(GraphAdapter::export_meta(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ScriptInjector;
    use crate::testing::{FakeHost, FakeObject};
    use crate::types::{Edge, Node};
    use std::time::Duration;

    /// Reports success without starting anything on the page side.
    struct DeadInjector;

    impl ScriptInjector for DeadInjector {
        fn inject<'a>(
            &'a self,
            _ctx: &'a Arc<BridgeContext>,
            _resource_url: &'a str,
        ) -> BoxFuture<'a, std::result::Result<(), BridgeError>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn graph() -> GraphSnapshot {
        GraphSnapshot::new(
            vec![Node::new("a", "workflowStart"), Node::new("b", "chatNode")],
            vec![Edge::new("a", "b")],
        )
    }

    #[tokio::test]
    async fn export_then_import_dispatches_the_same_payload() {
        let store = FakeObject::with_state(serde_json::to_value(graph()).unwrap());
        let host = Arc::new(FakeHost::with_canvas(FakeObject::chain(4, store)));
        let adapter = GraphAdapter::in_process(host.clone(), BridgeConfig::default());

        let exported = adapter.export_graph().await.unwrap();
        assert!(adapter.import_graph(&exported).await.unwrap());

        let pasted: GraphSnapshot = serde_json::from_str(&host.pasted()[0]).unwrap();
        assert_eq!(pasted, exported);
    }

    #[tokio::test]
    async fn import_without_canvas_is_unavailable() {
        let adapter = GraphAdapter::in_process(Arc::new(FakeHost::empty()), BridgeConfig::default());
        let err = adapter.import_graph(&graph()).await.unwrap_err();
        assert!(matches!(err, Error::HostIntrospectionUnavailable(_)), "{err:?}");
    }

    #[tokio::test]
    async fn silent_page_yields_export_timeout() {
        let ctx = BridgeContext::new();
        let config = BridgeConfig {
            export_timeout: Duration::from_millis(30),
            ..Default::default()
        };
        let loader = InjectionLoader::new(ctx.clone(), Arc::new(DeadInjector), config.clone());
        let adapter = GraphAdapter::new(ctx, loader, config);
        let err = adapter.export_graph().await.unwrap_err();
        assert!(
            matches!(err, Error::ExportTimeout { kind: BridgeKind::ExportGraph, .. }),
            "{err:?}"
        );
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn meta_is_none_without_canvas() {
        let adapter = GraphAdapter::in_process(Arc::new(FakeHost::empty()), BridgeConfig::default());
        assert_eq!(adapter.export_meta().await.unwrap(), None);
    }
}
