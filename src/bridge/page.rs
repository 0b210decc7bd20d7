use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};

use super::{
    host::HostPage, loader::ScriptInjector, BridgeConfig, BridgeContext, BridgeKind, BridgeReply,
    ChainFailure, CorrelationEnvelope, PageScope, StrategyChain, CODE_UNAVAILABLE,
};
use crate::{errors::BridgeError, types::GraphSnapshot, BoxFuture};

/// The script that lives in the host page's own world.
///
/// Listens on the bridge channel for request envelopes, runs the strategy
/// chain for each and broadcasts exactly one reply. Anything on the channel
/// that is not a request (its own replies included) is ignored.
pub struct PageAgent {
    scope: PageScope,
    chain: StrategyChain,
}

impl PageAgent {
    pub fn new(ctx: Arc<BridgeContext>, host: Arc<dyn HostPage>, chain: StrategyChain) -> Self {
        Self {
            scope: PageScope { host, ctx },
            chain,
        }
    }

    /// Start listening. The subscription is taken before this returns, so a
    /// request posted right afterwards is not missed.
    pub fn spawn(self) -> JoinHandle<()> {
        let mut rx = self.scope.ctx.subscribe();
        let agent = Arc::new(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        let Some(request) = CorrelationEnvelope::from_wire(&message) else {
                            continue;
                        };
                        // Requests of different kinds do not wait on each other.
                        let agent = agent.clone();
                        tokio::spawn(async move {
                            let reply = agent.handle(&request).await;
                            agent.scope.ctx.post(reply.to_wire());
                        });
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "page agent lagged behind the bridge channel");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Run the chain for one request and build its reply.
    pub async fn handle(&self, request: &CorrelationEnvelope) -> BridgeReply {
        tracing::debug!(kind = %request.kind, tag = %request.correlation_tag, "page agent request");
        match request.kind {
            BridgeKind::ExportGraph => match self.chain.export_graph(&self.scope).await {
                Ok(graph) => match serde_json::to_value(&graph) {
                    Ok(payload) => BridgeReply::ok(request, payload),
                    Err(err) => BridgeReply::failed(request, err.to_string()),
                },
                Err(failure) => failed_reply(request, failure),
            },
            BridgeKind::ImportGraph => {
                let graph: GraphSnapshot = match serde_json::from_value(request.payload.clone()) {
                    Ok(graph) => graph,
                    Err(err) => {
                        return BridgeReply::failed(request, format!("invalid graph payload: {err}"))
                    }
                };
                match self.chain.import_graph(&self.scope, &graph).await {
                    Ok(()) => BridgeReply::ok(request, Value::Bool(true)),
                    Err(failure) => failed_reply(request, failure),
                }
            }
            BridgeKind::ExportMeta => match self.chain.export_meta(&self.scope).await {
                Ok(meta) => match serde_json::to_value(&meta) {
                    Ok(payload) => BridgeReply::ok(request, payload),
                    Err(err) => BridgeReply::failed(request, err.to_string()),
                },
                // Metadata is best-effort.
                Err(ChainFailure::Unavailable(_)) => BridgeReply::ok(request, Value::Null),
                Err(failure) => failed_reply(request, failure),
            },
        }
    }
}

fn failed_reply(request: &CorrelationEnvelope, failure: ChainFailure) -> BridgeReply {
    let reply = BridgeReply::failed(request, failure.message());
    match failure {
        ChainFailure::Unavailable(_) => reply.with_code(CODE_UNAVAILABLE),
        ChainFailure::Failed { .. } => reply,
    }
}

/// [`ScriptInjector`] that runs a [`PageAgent`] in-process.
///
/// Each injection replaces the previous agent, so one agent is live at a time
/// even when the loader re-injects after the host replaced its document.
pub struct PageAgentInjector {
    host: Arc<dyn HostPage>,
    chain: StrategyChain,
    current: Mutex<Option<JoinHandle<()>>>,
}

impl PageAgentInjector {
    pub fn new(host: Arc<dyn HostPage>, config: &BridgeConfig) -> Self {
        Self::with_chain(host, StrategyChain::standard(config))
    }

    pub fn with_chain(host: Arc<dyn HostPage>, chain: StrategyChain) -> Self {
        Self {
            host,
            chain,
            current: Mutex::new(None),
        }
    }
}

impl ScriptInjector for PageAgentInjector {
    fn inject<'a>(
        &'a self,
        ctx: &'a Arc<BridgeContext>,
        _resource_url: &'a str,
    ) -> BoxFuture<'a, Result<(), BridgeError>> {
        Box::pin(async move {
            let agent = PageAgent::new(ctx.clone(), self.host.clone(), self.chain.clone());
            let handle = agent.spawn();
            let mut current = self
                .current
                .lock()
                .map_err(|_| BridgeError::Injection("injector state poisoned".into()))?;
            if let Some(previous) = current.replace(handle) {
                previous.abort();
            }
            tracing::debug!(strategies = ?self.chain.names(), "page agent injected");
            Ok(())
        })
    }
}

impl Drop for PageAgentInjector {
    fn drop(&mut self) {
        if let Ok(mut current) = self.current.lock() {
            if let Some(handle) = current.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeHost, FakeObject};
    use crate::types::Node;
    use serde_json::json;

    fn graph() -> GraphSnapshot {
        GraphSnapshot::new(vec![Node::new("a", "workflowStart")], vec![])
    }

    #[tokio::test]
    async fn export_without_canvas_is_unavailable() {
        let agent = PageAgent::new(
            BridgeContext::new(),
            Arc::new(FakeHost::empty()),
            StrategyChain::standard(&BridgeConfig::default()),
        );
        let req = CorrelationEnvelope::new(BridgeKind::ExportGraph, Value::Null);
        let reply = agent.handle(&req).await;
        assert!(!reply.success);
        assert_eq!(reply.code.as_deref(), Some(CODE_UNAVAILABLE));
        assert_eq!(reply.correlation_tag, req.correlation_tag);
    }

    #[tokio::test]
    async fn meta_without_canvas_is_null_success() {
        let agent = PageAgent::new(
            BridgeContext::new(),
            Arc::new(FakeHost::empty()),
            StrategyChain::standard(&BridgeConfig::default()),
        );
        let req = CorrelationEnvelope::new(BridgeKind::ExportMeta, Value::Null);
        let reply = agent.handle(&req).await;
        assert!(reply.success);
        assert_eq!(reply.payload, Some(Value::Null));
    }

    #[tokio::test]
    async fn malformed_import_payload_is_rejected() {
        let agent = PageAgent::new(
            BridgeContext::new(),
            Arc::new(FakeHost::with_canvas(FakeObject::new())),
            StrategyChain::standard(&BridgeConfig::default()),
        );
        let req = CorrelationEnvelope::new(BridgeKind::ImportGraph, json!({"nodes": "nope"}));
        let reply = agent.handle(&req).await;
        assert!(!reply.success);
        assert!(reply.code.is_none());
        assert!(reply.message.unwrap().starts_with("invalid graph payload"));
    }

    #[tokio::test]
    async fn spawned_agent_answers_over_the_channel() {
        let ctx = BridgeContext::new();
        let store = FakeObject::with_state(serde_json::to_value(graph()).unwrap());
        let host = Arc::new(FakeHost::with_canvas(FakeObject::chain(3, store)));
        let handle = PageAgent::new(
            ctx.clone(),
            host,
            StrategyChain::standard(&BridgeConfig::default()),
        )
        .spawn();

        let mut rx = ctx.subscribe();
        let req = CorrelationEnvelope::new(BridgeKind::ExportGraph, Value::Null);
        ctx.post(req.to_wire());
        let reply = loop {
            let msg = rx.recv().await.unwrap();
            if let Some(reply) = BridgeReply::from_wire(BridgeKind::ExportGraph, &msg) {
                break reply;
            }
        };
        assert!(reply.success);
        let exported: GraphSnapshot = serde_json::from_value(reply.payload.unwrap()).unwrap();
        assert_eq!(exported, graph());
        handle.abort();
    }

    #[tokio::test]
    async fn reinjection_replaces_the_previous_agent() {
        let ctx = BridgeContext::new();
        let injector = PageAgentInjector::new(Arc::new(FakeHost::empty()), &BridgeConfig::default());
        injector.inject(&ctx, "page-agent.js").await.unwrap();
        let first = ctx.listener_count();
        injector.inject(&ctx, "page-agent.js").await.unwrap();
        // Aborted tasks drop their receiver once the runtime gets to them.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(ctx.listener_count(), first);
    }
}
