// ABOUTME: Executor factory dispatching on the declared sandbox provider
// ABOUTME: Session registry isolating remote-provider pools per conversation session

use crate::backend::BackendError;
use crate::config::{ToolConfig, PROVIDER_LOCAL, PROVIDER_REMOTE};
use crate::executor::{ExecutionResult, ExecutorError, SandboxExecutor};
use crate::local::LocalBackend;
use crate::remote::RemoteVmBackend;
use crate::settings::SandboxSettings;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum FactoryError {
    #[error("Unknown sandbox provider: {0}")]
    UnknownProvider(String),

    #[error("Invalid sandbox configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

pub type Result<T> = std::result::Result<T, FactoryError>;

/// Routes tool executions to the executor for their declared provider.
///
/// Each executor is constructed lazily, at most once per factory instance.
/// An unknown provider tag is a fatal configuration error, never silently
/// executed.
pub struct ExecutorFactory {
    settings: SandboxSettings,
    local: OnceCell<Arc<SandboxExecutor>>,
    remote: OnceCell<Arc<SandboxExecutor>>,
}

impl ExecutorFactory {
    pub fn new(settings: SandboxSettings) -> Self {
        Self {
            settings,
            local: OnceCell::new(),
            remote: OnceCell::new(),
        }
    }

    /// Execute a function tool through the executor its config selects.
    pub async fn execute_function_tool(
        &self,
        tool_id: &str,
        args: &Value,
        config: &ToolConfig,
    ) -> Result<ExecutionResult> {
        let executor = self.executor_for(config).await?;
        Ok(executor.execute(tool_id, args, config).await?)
    }

    async fn executor_for(&self, config: &ToolConfig) -> Result<Arc<SandboxExecutor>> {
        match config.sandbox.provider.as_str() {
            PROVIDER_LOCAL => {
                let executor = self
                    .local
                    .get_or_init(|| async {
                        let backend = match &self.settings.local_root {
                            Some(root) => LocalBackend::with_base_dir(root.clone()),
                            None => LocalBackend::new(),
                        };
                        debug!("constructed local sandbox executor");
                        let executor = Arc::new(SandboxExecutor::new(
                            Arc::new(backend),
                            self.settings.pool.clone(),
                        ));
                        executor.start().await;
                        executor
                    })
                    .await;
                Ok(executor.clone())
            }
            PROVIDER_REMOTE => {
                let executor = self
                    .remote
                    .get_or_try_init(|| async {
                        let endpoint = config
                            .sandbox
                            .api_endpoint
                            .clone()
                            .or_else(|| self.settings.remote_api_endpoint.clone())
                            .unwrap_or_default();
                        let api_key = config
                            .sandbox
                            .api_key
                            .clone()
                            .or_else(|| self.settings.remote_api_key.clone())
                            .unwrap_or_default();
                        let backend = RemoteVmBackend::new(endpoint, api_key)
                            .map_err(|e: BackendError| FactoryError::Config(e.to_string()))?;
                        debug!("constructed remote sandbox executor");
                        let executor = Arc::new(SandboxExecutor::new(
                            Arc::new(backend),
                            self.settings.pool.clone(),
                        ));
                        executor.start().await;
                        Ok::<_, FactoryError>(executor)
                    })
                    .await?;
                Ok(executor.clone())
            }
            other => Err(FactoryError::UnknownProvider(other.to_string())),
        }
    }

    /// Drain every pool this factory has built.
    pub async fn shutdown(&self) {
        if let Some(executor) = self.local.get() {
            executor.shutdown().await;
        }
        if let Some(executor) = self.remote.get() {
            executor.shutdown().await;
        }
    }
}

/// Process-wide map from session id to a dedicated factory, so pooled remote
/// resources are never shared across sessions.
///
/// Constructed once at process start and passed to request handlers; torn
/// down through `shutdown_all` at process exit.
pub struct SessionRegistry {
    settings: SandboxSettings,
    factories: Mutex<HashMap<String, Arc<ExecutorFactory>>>,
}

impl SessionRegistry {
    pub fn new(settings: SandboxSettings) -> Self {
        Self {
            settings,
            factories: Mutex::new(HashMap::new()),
        }
    }

    /// The factory dedicated to `session_id`, created on first use.
    pub async fn get_for_session(&self, session_id: &str) -> Arc<ExecutorFactory> {
        let mut factories = self.factories.lock().await;
        factories
            .entry(session_id.to_string())
            .or_insert_with(|| {
                debug!("creating executor factory for session {}", session_id);
                Arc::new(ExecutorFactory::new(self.settings.clone()))
            })
            .clone()
    }

    /// Tear down and remove the session's factory; a later `get_for_session`
    /// with the same id yields a fresh instance.
    pub async fn cleanup_session(&self, session_id: &str) {
        let removed = {
            let mut factories = self.factories.lock().await;
            factories.remove(session_id)
        };
        if let Some(factory) = removed {
            info!("cleaning up executor factory for session {}", session_id);
            factory.shutdown().await;
        }
    }

    /// Drain every session's factory; used at process shutdown.
    pub async fn shutdown_all(&self) {
        let factories: Vec<Arc<ExecutorFactory>> = {
            let mut guard = self.factories.lock().await;
            guard.drain().map(|(_, factory)| factory).collect()
        };
        for factory in factories {
            factory.shutdown().await;
        }
    }
}
