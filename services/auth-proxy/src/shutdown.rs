//! Named cleanup callbacks run once the server stops accepting connections.

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

type HookFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Every hook that failed during one run, keyed by hook name.
#[derive(Debug, Error)]
#[error("{} pre-shutdown hook(s) failed: {}", .failures.len(), describe(.failures))]
pub struct ShutdownHookError {
    pub failures: Vec<(String, anyhow::Error)>,
}

fn describe(failures: &[(String, anyhow::Error)]) -> String {
    failures
        .iter()
        .map(|(name, err)| format!("{}: {:#}", name, err))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Registry of pre-shutdown hooks.
///
/// Constructed once by the process owner and shared by reference with any
/// component that needs to register cleanup. Registration and execution
/// are serialised by a single lock.
#[derive(Default, Clone)]
pub struct ShutdownHooks {
    hooks: Arc<Mutex<BTreeMap<String, HookFn>>>,
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook, replacing any hook already registered under `name`.
    pub async fn add_pre_shutdown_hook<F, Fut>(&self, name: impl Into<String>, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let hook: HookFn = Arc::new(move || Box::pin(hook()));
        let mut hooks = self.hooks.lock().await;
        if hooks.insert(name.clone(), hook).is_some() {
            debug!(hook = %name, "replaced pre-shutdown hook");
        }
    }

    /// Run every registered hook once, collecting all failures. A hook
    /// that panics is recorded as failed and the rest still run.
    pub async fn run_pre_shutdown_hooks(&self) -> Result<(), ShutdownHookError> {
        let hooks = self.hooks.lock().await;
        let mut failures = Vec::new();

        for (name, hook) in hooks.iter() {
            debug!(hook = %name, "running pre-shutdown hook");
            let outcome = AssertUnwindSafe(async { hook().await })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(anyhow::anyhow!("hook panicked: {}", panic_message(panic.as_ref())))
                });
            if let Err(err) = outcome {
                warn!(hook = %name, error = %err, "pre-shutdown hook failed");
                failures.push((name.clone(), err));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ShutdownHookError { failures })
        }
    }

    pub async fn len(&self) -> usize {
        self.hooks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.hooks.lock().await.is_empty()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
