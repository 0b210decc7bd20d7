use std::{future::Future, sync::Arc, sync::Mutex};

use futures_util::{future::Shared, FutureExt};

use super::{BridgeConfig, BridgeContext};
use crate::{errors::BridgeError, BoxFuture};

/// Checks that the page script is still shipped before injecting it.
pub trait ResourceProbe: Send + Sync {
    fn probe<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<(), BridgeError>>;
}

/// Places the page script in the host's own world.
///
/// Resolves once the script has loaded and started listening.
pub trait ScriptInjector: Send + Sync {
    fn inject<'a>(
        &'a self,
        ctx: &'a Arc<BridgeContext>,
        resource_url: &'a str,
    ) -> BoxFuture<'a, Result<(), BridgeError>>;
}

/// `HEAD` probe of the page script URL.
#[derive(Clone, Debug)]
pub struct HttpResourceProbe {
    http: reqwest::Client,
}

impl HttpResourceProbe {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl Default for HttpResourceProbe {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl ResourceProbe for HttpResourceProbe {
    fn probe<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<(), BridgeError>> {
        Box::pin(async move {
            let resp = self.http.head(url).send().await.map_err(|err| {
                BridgeError::Injection(format!("page script unreachable at {url}: {err}"))
            })?;
            let status = resp.status();
            if !status.is_success() {
                return Err(BridgeError::Injection(format!(
                    "page script missing at {url} ({}); the extension bundle is stale, reload it",
                    status.as_u16()
                )));
            }
            Ok(())
        })
    }
}

type SharedLoad = Shared<BoxFuture<'static, Result<(), BridgeError>>>;

/// Makes sure the page script is present exactly once.
///
/// Concurrent callers share one load, which runs on its own task. The ready
/// flag is only set after a successful injection, and the shared slot is
/// emptied when a load settles, whether or not anyone is still waiting, so a
/// failed or abandoned load never blocks later attempts.
#[derive(Clone)]
pub struct InjectionLoader {
    ctx: Arc<BridgeContext>,
    injector: Arc<dyn ScriptInjector>,
    probe: Option<Arc<dyn ResourceProbe>>,
    config: BridgeConfig,
    loading: Arc<Mutex<Option<SharedLoad>>>,
}

impl InjectionLoader {
    pub fn new(
        ctx: Arc<BridgeContext>,
        injector: Arc<dyn ScriptInjector>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            ctx,
            injector,
            probe: None,
            config,
            loading: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub async fn ensure_loaded(&self) -> Result<(), BridgeError> {
        if self.ctx.is_ready() {
            return Ok(());
        }
        let shared = {
            let mut slot = self.loading.lock().expect("loader slot poisoned");
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let task = tokio::spawn(self.load());
                    let load = async move {
                        task.await
                            .unwrap_or_else(|err| Err(BridgeError::TaskAborted(err.to_string())))
                    }
                    .boxed()
                    .shared();
                    *slot = Some(load.clone());
                    load
                }
            }
        };
        shared.await
    }

    fn load(&self) -> impl Future<Output = Result<(), BridgeError>> + Send + 'static {
        let ctx = self.ctx.clone();
        let injector = self.injector.clone();
        let probe = self.probe.clone();
        let config = self.config.clone();
        let slot = self.loading.clone();

        async move {
            let result = load_script(&ctx, injector.as_ref(), probe.as_deref(), &config).await;
            if let Ok(mut slot) = slot.lock() {
                *slot = None;
            }
            result
        }
    }
}

async fn load_script(
    ctx: &Arc<BridgeContext>,
    injector: &dyn ScriptInjector,
    probe: Option<&dyn ResourceProbe>,
    config: &BridgeConfig,
) -> Result<(), BridgeError> {
    // A stale bundle will not get better by retrying.
    if let Some(probe) = probe {
        probe.probe(&config.resource_url).await?;
    }
    let max_attempts = config.load_retry.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let outcome =
            tokio::time::timeout(config.load_timeout, injector.inject(ctx, &config.resource_url))
                .await;
        let err = match outcome {
            Ok(Ok(())) => {
                ctx.mark_ready();
                tracing::debug!(attempt, "page script ready");
                return Ok(());
            }
            Ok(Err(err)) => err,
            Err(_) => BridgeError::Injection(format!(
                "page script did not load within {}ms",
                config.load_timeout.as_millis()
            )),
        };
        if attempt >= max_attempts {
            return Err(err);
        }
        tracing::warn!(attempt, error = %err, "page script load failed, retrying");
        tokio::time::sleep(config.load_retry.backoff_delay(attempt)).await;
        attempt += 1;
    }
}
