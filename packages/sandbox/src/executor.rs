// ABOUTME: Pooled executor orchestrating one function-tool invocation
// ABOUTME: Acquires a sandbox, materializes the wrapped script under a unique run path, runs it

use crate::backend::{BackendError, SandboxBackend};
use crate::codec::{self, WireResult};
use crate::config::ToolConfig;
use crate::fingerprint::dependency_fingerprint;
use crate::pool::{PoolError, SandboxPool};
use crate::settings::PoolSettings;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Outcome of one tool invocation. Execution failures (non-zero exit,
/// unparseable result, timeout) are captured here, not returned as errors.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub logs: Vec<String>,
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    fn failure(error: impl Into<String>, logs: Vec<String>, elapsed: Duration) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            logs,
            execution_time_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Executes function tools against pooled sandboxes. One orchestration for
/// both strategies; the backend decides where the sandbox actually lives.
pub struct SandboxExecutor {
    backend: Arc<dyn SandboxBackend>,
    pool: Arc<SandboxPool>,
}

impl SandboxExecutor {
    pub fn new(backend: Arc<dyn SandboxBackend>, settings: PoolSettings) -> Self {
        let pool = Arc::new(SandboxPool::new(backend.clone(), settings));
        Self { backend, pool }
    }

    pub fn pool(&self) -> &Arc<SandboxPool> {
        &self.pool
    }

    /// Start the pool's background expiry sweep.
    pub async fn start(&self) {
        self.pool.start_sweeper().await;
    }

    /// Drain the pool; used at process/session shutdown.
    pub async fn shutdown(&self) {
        self.pool.drain_all().await;
    }

    /// Execute one tool invocation.
    pub async fn execute(
        &self,
        tool_id: &str,
        args: &Value,
        config: &ToolConfig,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let runtime = config.sandbox.runtime;

        let fingerprint = dependency_fingerprint(&config.dependencies);
        let sandbox = self
            .pool
            .acquire(&fingerprint, &config.dependencies, &config.sandbox)
            .await?;

        // Unique, never-shared working area inside the (possibly shared)
        // pooled sandbox.
        let run_dir = format!("runs/{}", invocation_run_id());
        let script_path = format!("{}/index.{}", run_dir, runtime.extension());
        debug!(
            "executing tool {} in sandbox {} at {}",
            tool_id, sandbox.handle.id, script_path
        );

        let script = codec::wrap(&config.execute_code, args, runtime);
        self.backend
            .write_file(&sandbox.handle, &script_path, &script)
            .await?;

        // Environment variables referenced by the user's code are surfaced
        // as placeholders; a secrets injector collaborator fills them in.
        let env: HashMap<String, String> = codec::scan_env_references(&config.execute_code)
            .into_iter()
            .map(|name| (name, String::new()))
            .collect();

        let argv = runtime.run_argv(&script_path);
        let exec_outcome = tokio::time::timeout(
            Duration::from_millis(config.sandbox.timeout_ms),
            self.backend.exec(&sandbox.handle, &argv, ".", &env),
        )
        .await;

        // The invocation-scoped directory is removed in every outcome.
        if let Err(e) = self.backend.remove_path(&sandbox.handle, &run_dir).await {
            warn!("failed to remove invocation run {}: {}", run_dir, e);
        }

        let elapsed = started.elapsed();
        let output = match exec_outcome {
            Err(_) => {
                return Ok(ExecutionResult::failure(
                    format!(
                        "execution timed out after {}ms",
                        config.sandbox.timeout_ms
                    ),
                    Vec::new(),
                    elapsed,
                ));
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(output)) => output,
        };

        let mut logs: Vec<String> = output.stdout.lines().map(str::to_string).collect();
        logs.extend(output.stderr.lines().map(|l| format!("stderr: {}", l)));

        if output.exit_code != 0 {
            let stderr = output.stderr.trim();
            let error = if !stderr.is_empty() {
                stderr.to_string()
            } else {
                match logs.last() {
                    Some(last) => last.clone(),
                    None => format!("process exited with code {}", output.exit_code),
                }
            };
            return Ok(ExecutionResult::failure(error, logs, elapsed));
        }

        let value = codec::parse_result(&output.stdout);
        let result = match serde_json::from_value::<WireResult>(value.clone()) {
            Ok(wire) if !wire.success => ExecutionResult::failure(
                wire.error
                    .unwrap_or_else(|| "tool execution failed".to_string()),
                logs,
                elapsed,
            ),
            Ok(wire) => ExecutionResult {
                success: true,
                result: Some(wire.result.unwrap_or(Value::Null)),
                error: None,
                logs,
                execution_time_ms: elapsed.as_millis() as u64,
            },
            // Output that is not the wrapper envelope is taken as the raw result.
            Err(_) => ExecutionResult {
                success: true,
                result: Some(value),
                error: None,
                logs,
                execution_time_ms: elapsed.as_millis() as u64,
            },
        };
        Ok(result)
    }
}

/// Unique invocation-run identifier: millisecond timestamp plus a random
/// suffix so concurrent invocations against one sandbox never collide.
fn invocation_run_id() -> String {
    format!(
        "{}-{:08x}",
        chrono::Utc::now().timestamp_millis(),
        rand::random::<u32>()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ExecOutput, Result as BackendResult, SandboxHandle};
    use crate::config::{Runtime, SandboxConfig};
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Scripted backend: records writes/removes, replays a canned exec output.
    struct ScriptedBackend {
        creations: AtomicUsize,
        writes: StdMutex<Vec<String>>,
        removes: StdMutex<Vec<String>>,
        exec_output: StdMutex<ExecOutput>,
        exec_env: StdMutex<HashMap<String, String>>,
    }

    impl ScriptedBackend {
        fn new(exec_output: ExecOutput) -> Arc<Self> {
            Arc::new(Self {
                creations: AtomicUsize::new(0),
                writes: StdMutex::new(Vec::new()),
                removes: StdMutex::new(Vec::new()),
                exec_output: StdMutex::new(exec_output),
                exec_env: StdMutex::new(HashMap::new()),
            })
        }

        fn ok(result_line: &str) -> Arc<Self> {
            Self::new(ExecOutput {
                exit_code: 0,
                stdout: format!("{}\n", result_line),
                stderr: String::new(),
            })
        }
    }

    #[async_trait]
    impl SandboxBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn create_sandbox(
            &self,
            _dependencies: &HashMap<String, String>,
            _config: &SandboxConfig,
        ) -> BackendResult<SandboxHandle> {
            let n = self.creations.fetch_add(1, Ordering::SeqCst);
            Ok(SandboxHandle {
                id: format!("scripted_{}", n),
                provider: "scripted".to_string(),
                root: PathBuf::from("/scripted"),
            })
        }

        async fn write_file(
            &self,
            _handle: &SandboxHandle,
            rel_path: &str,
            _contents: &str,
        ) -> BackendResult<()> {
            self.writes.lock().unwrap().push(rel_path.to_string());
            Ok(())
        }

        async fn exec(
            &self,
            _handle: &SandboxHandle,
            _argv: &[String],
            _cwd: &str,
            env: &HashMap<String, String>,
        ) -> BackendResult<ExecOutput> {
            *self.exec_env.lock().unwrap() = env.clone();
            Ok(self.exec_output.lock().unwrap().clone())
        }

        async fn remove_path(
            &self,
            _handle: &SandboxHandle,
            rel_path: &str,
        ) -> BackendResult<()> {
            self.removes.lock().unwrap().push(rel_path.to_string());
            Ok(())
        }

        async fn teardown(&self, _handle: &SandboxHandle) -> BackendResult<()> {
            Ok(())
        }
    }

    fn tool_config(code: &str) -> ToolConfig {
        ToolConfig {
            name: "demo".to_string(),
            description: "demo tool".to_string(),
            input_schema: json!({"type": "object"}),
            execute_code: code.to_string(),
            dependencies: HashMap::new(),
            sandbox: SandboxConfig::local(Runtime::Node),
        }
    }

    #[tokio::test]
    async fn test_execute_success_decodes_envelope() {
        let backend = ScriptedBackend::ok(r#"{"success":true,"result":{"sum":5}}"#);
        let executor = SandboxExecutor::new(backend.clone(), PoolSettings::default());

        let result = executor
            .execute(
                "tool-1",
                &json!({"a": 2, "b": 3}),
                &tool_config("async function execute(args) { return {sum: args.a + args.b}; }"),
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.result, Some(json!({"sum": 5})));
        assert!(result.error.is_none());

        // Script landed under a runs/<id>/index.js path and the run
        // directory was cleaned up afterwards.
        let writes = backend.writes.lock().unwrap().clone();
        assert_eq!(writes.len(), 1);
        assert!(writes[0].starts_with("runs/"));
        assert!(writes[0].ends_with("/index.js"));
        let removes = backend.removes.lock().unwrap().clone();
        assert_eq!(removes.len(), 1);
        assert!(writes[0].starts_with(&removes[0]));
    }

    #[tokio::test]
    async fn test_execute_reports_wrapped_failure() {
        let backend = ScriptedBackend::new(ExecOutput {
            exit_code: 1,
            stdout: r#"{"success":false,"error":"boom"}"#.to_string() + "\n",
            stderr: "Error: boom\n".to_string(),
        });
        let executor = SandboxExecutor::new(backend, PoolSettings::default());

        let result = executor
            .execute(
                "tool-1",
                &json!({}),
                &tool_config("async function execute() { throw new Error('boom'); }"),
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Error: boom"));
        assert!(result.logs.iter().any(|l| l.starts_with("stderr:")));
    }

    #[tokio::test]
    async fn test_execute_treats_non_envelope_output_as_raw_result() {
        let backend = ScriptedBackend::ok("plain text output");
        let executor = SandboxExecutor::new(backend, PoolSettings::default());

        let result = executor
            .execute("tool-1", &json!({}), &tool_config("function execute() {}"))
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.result.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_executions_share_sandbox_with_distinct_run_paths() {
        let backend = ScriptedBackend::ok(r#"{"success":true,"result":1}"#);
        let executor = Arc::new(SandboxExecutor::new(backend.clone(), PoolSettings::default()));
        let config = tool_config("async function execute() { return 1; }");

        let (a, b) = tokio::join!(
            {
                let executor = executor.clone();
                let config = config.clone();
                async move { executor.execute("tool-1", &json!({}), &config).await }
            },
            {
                let executor = executor.clone();
                let config = config.clone();
                async move { executor.execute("tool-1", &json!({}), &config).await }
            }
        );
        assert!(a.unwrap().success);
        assert!(b.unwrap().success);

        // Same dependency fingerprint: exactly one sandbox creation, two
        // distinct invocation-run files.
        assert_eq!(backend.creations.load(Ordering::SeqCst), 1);
        let writes = backend.writes.lock().unwrap().clone();
        assert_eq!(writes.len(), 2);
        assert_ne!(writes[0], writes[1]);
        for path in &writes {
            assert!(path.starts_with("runs/"));
            assert!(path.ends_with("/index.js"));
        }
    }

    #[tokio::test]
    async fn test_env_references_surface_as_placeholders() {
        let backend = ScriptedBackend::ok(r#"{"success":true,"result":null}"#);
        let executor = SandboxExecutor::new(backend.clone(), PoolSettings::default());

        executor
            .execute(
                "tool-1",
                &json!({}),
                &tool_config(
                    "async function execute() { return process.env.API_KEY; }",
                ),
            )
            .await
            .unwrap();

        let env = backend.exec_env.lock().unwrap().clone();
        assert_eq!(env.get("API_KEY"), Some(&String::new()));
    }

    #[tokio::test]
    async fn test_run_ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            assert!(seen.insert(invocation_run_id()));
        }
    }
}
