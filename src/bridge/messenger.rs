use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::{future::Shared, FutureExt};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

use super::{BridgeContext, BridgeKind, BridgeReply, CorrelationEnvelope, CODE_UNAVAILABLE};
use crate::{errors::BridgeError, BoxFuture};

type SharedReply = Shared<BoxFuture<'static, Result<Value, BridgeError>>>;

struct InFlight {
    tag: String,
    reply: SharedReply,
}

/// Request/response transport over the bridge's broadcast channel.
///
/// At most one exchange per [`BridgeKind`] is in flight; a second request of
/// the same kind while one is pending joins the pending one and receives its
/// result. Each exchange runs on its own task, so it settles and frees its
/// kind even when every caller has stopped waiting.
#[derive(Clone)]
pub struct CorrelatedMessenger {
    ctx: Arc<BridgeContext>,
    in_flight: Arc<Mutex<HashMap<BridgeKind, InFlight>>>,
}

impl CorrelatedMessenger {
    pub fn new(ctx: Arc<BridgeContext>) -> Self {
        Self {
            ctx,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Send `payload` as a `kind` request and wait for the matching reply.
    pub async fn request(
        &self,
        kind: BridgeKind,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        let shared = {
            let mut in_flight = self.in_flight.lock().expect("in-flight map poisoned");
            if let Some(existing) = in_flight.get(&kind) {
                tracing::debug!(%kind, tag = %existing.tag, "joining in-flight bridge request");
                existing.reply.clone()
            } else {
                let envelope = CorrelationEnvelope::new(kind, payload);
                let tag = envelope.correlation_tag.clone();
                let task = tokio::spawn(self.exchange(envelope, timeout));
                let reply = async move {
                    task.await
                        .unwrap_or_else(|err| Err(BridgeError::TaskAborted(err.to_string())))
                }
                .boxed()
                .shared();
                in_flight.insert(
                    kind,
                    InFlight {
                        tag,
                        reply: reply.clone(),
                    },
                );
                reply
            }
        };
        shared.await
    }

    /// True while a request of `kind` is waiting for its reply.
    pub fn is_pending(&self, kind: BridgeKind) -> bool {
        self.in_flight
            .lock()
            .map(|m| m.contains_key(&kind))
            .unwrap_or(false)
    }

    fn exchange(
        &self,
        envelope: CorrelationEnvelope,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<Value, BridgeError>> + Send + 'static {
        // Subscribe before posting so the reply cannot race past the listener.
        let mut listener = self.ctx.subscribe();
        let ctx = self.ctx.clone();
        let in_flight = self.in_flight.clone();
        let kind = envelope.kind;
        let tag = envelope.correlation_tag.clone();

        async move {
            tracing::debug!(%kind, %tag, "bridge request");
            ctx.post(envelope.to_wire());

            let wait = async {
                loop {
                    match listener.recv().await {
                        Ok(message) => {
                            let Some(reply) = BridgeReply::from_wire(kind, &message) else {
                                continue;
                            };
                            if reply.correlation_tag != tag {
                                continue;
                            }
                            return settle(reply);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(%kind, skipped, "bridge listener lagged");
                        }
                        Err(RecvError::Closed) => return Err(BridgeError::ChannelClosed),
                    }
                }
            };

            let result = match tokio::time::timeout(timeout, wait).await {
                Ok(result) => result,
                Err(_) => Err(BridgeError::Timeout {
                    kind,
                    after: timeout,
                }),
            };
            drop(listener);

            if let Ok(mut map) = in_flight.lock() {
                if map.get(&kind).is_some_and(|f| f.tag == tag) {
                    map.remove(&kind);
                }
            }
            if let Err(err) = &result {
                tracing::debug!(%kind, %tag, error = %err, "bridge request failed");
            }
            result
        }
    }
}

fn settle(reply: BridgeReply) -> Result<Value, BridgeError> {
    if reply.success {
        return Ok(reply.payload.unwrap_or(Value::Null));
    }
    let message = reply
        .message
        .unwrap_or_else(|| "page reported failure".to_string());
    if reply.code.as_deref() == Some(CODE_UNAVAILABLE) {
        Err(BridgeError::Unavailable {
            kind: reply.kind,
            message,
        })
    } else {
        Err(BridgeError::RemoteRejected {
            kind: reply.kind,
            message,
        })
    }
}
