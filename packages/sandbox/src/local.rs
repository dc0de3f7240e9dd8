// ABOUTME: Local process backend running tool code in scratch directories
// ABOUTME: Installs dependencies via the runtime's package tool and spawns the runtime binary

use crate::backend::{BackendError, ExecOutput, Result, SandboxBackend, SandboxHandle};
use crate::config::SandboxConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::PROVIDER_LOCAL;

/// Native strategy: a sandbox is a scratch directory on the host, commands
/// run as child processes scoped to it.
pub struct LocalBackend {
    base_dir: PathBuf,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("agentry-sandboxes"),
        }
    }

    /// Use an explicit base directory for sandbox roots.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn resolve(&self, handle: &SandboxHandle, rel_path: &str) -> Result<PathBuf> {
        // Reject traversal out of the sandbox root.
        let rel = Path::new(rel_path);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(BackendError::Config(format!(
                "invalid sandbox-relative path: {}",
                rel_path
            )));
        }
        Ok(handle.root.join(rel))
    }

    async fn run_install(
        &self,
        root: &Path,
        dependencies: &HashMap<String, String>,
        config: &SandboxConfig,
    ) -> Result<()> {
        let runtime = config.runtime;
        let manifest = runtime.render_manifest(dependencies);
        tokio::fs::write(root.join(runtime.manifest_name()), manifest).await?;

        let argv = runtime.install_argv();
        debug!("installing dependencies in {}: {:?}", root.display(), argv);

        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(root)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BackendError::Install(format!("failed to spawn {}: {}", argv[0], e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::Install(format!(
                "{} exited with {:?}: {}",
                argv[0],
                output.status.code(),
                stderr.trim()
            )));
        }
        Ok(())
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxBackend for LocalBackend {
    fn name(&self) -> &str {
        PROVIDER_LOCAL
    }

    async fn create_sandbox(
        &self,
        dependencies: &HashMap<String, String>,
        config: &SandboxConfig,
    ) -> Result<SandboxHandle> {
        let id = format!("sbx_{}", uuid::Uuid::new_v4().simple());
        let root = self.base_dir.join(&id);
        tokio::fs::create_dir_all(&root).await?;

        if !dependencies.is_empty() {
            if let Err(e) = self.run_install(&root, dependencies, config).await {
                // Discard the partial environment before surfacing the error.
                if let Err(cleanup) = tokio::fs::remove_dir_all(&root).await {
                    warn!(
                        "failed to clean up partial sandbox {}: {}",
                        root.display(),
                        cleanup
                    );
                }
                return Err(e);
            }
        }

        info!(
            "created local sandbox {} ({} dependencies)",
            id,
            dependencies.len()
        );
        Ok(SandboxHandle {
            id,
            provider: PROVIDER_LOCAL.to_string(),
            root,
        })
    }

    async fn write_file(
        &self,
        handle: &SandboxHandle,
        rel_path: &str,
        contents: &str,
    ) -> Result<()> {
        let path = self.resolve(handle, rel_path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, contents).await?;
        Ok(())
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        argv: &[String],
        cwd: &str,
        env: &HashMap<String, String>,
    ) -> Result<ExecOutput> {
        if argv.is_empty() {
            return Err(BackendError::Config("empty command".to_string()));
        }
        let workdir = self.resolve(handle, cwd)?;

        debug!("exec in sandbox {}: {:?}", handle.id, argv);
        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(&workdir)
            .envs(env)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BackendError::Provision(format!("failed to spawn {}: {}", argv[0], e)))?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn remove_path(&self, handle: &SandboxHandle, rel_path: &str) -> Result<()> {
        let path = self.resolve(handle, rel_path)?;
        let removed = if path.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match removed {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn teardown(&self, handle: &SandboxHandle) -> Result<()> {
        debug!("tearing down local sandbox {}", handle.id);
        match tokio::fs::remove_dir_all(&handle.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Runtime;

    fn local_config() -> SandboxConfig {
        SandboxConfig::local(Runtime::Node)
    }

    #[tokio::test]
    async fn test_create_sandbox_without_dependencies_skips_install() {
        let base = tempfile::tempdir().unwrap();
        let backend = LocalBackend::with_base_dir(base.path());

        let handle = backend
            .create_sandbox(&HashMap::new(), &local_config())
            .await
            .unwrap();

        assert!(handle.root.exists());
        // No manifest written when the dependency set is empty.
        assert!(!handle.root.join("package.json").exists());

        backend.teardown(&handle).await.unwrap();
        assert!(!handle.root.exists());
    }

    #[tokio::test]
    async fn test_write_and_remove_run_files() {
        let base = tempfile::tempdir().unwrap();
        let backend = LocalBackend::with_base_dir(base.path());
        let handle = backend
            .create_sandbox(&HashMap::new(), &local_config())
            .await
            .unwrap();

        backend
            .write_file(&handle, "runs/abc/index.js", "console.log(1);")
            .await
            .unwrap();
        assert!(handle.root.join("runs/abc/index.js").exists());

        backend.remove_path(&handle, "runs/abc").await.unwrap();
        assert!(!handle.root.join("runs/abc").exists());

        // Removing an already-gone path is not an error.
        backend.remove_path(&handle, "runs/abc").await.unwrap();

        backend.teardown(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let base = tempfile::tempdir().unwrap();
        let backend = LocalBackend::with_base_dir(base.path());
        let handle = backend
            .create_sandbox(&HashMap::new(), &local_config())
            .await
            .unwrap();

        let err = backend
            .write_file(&handle, "../outside.txt", "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Config(_)));

        backend.teardown(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let base = tempfile::tempdir().unwrap();
        let backend = LocalBackend::with_base_dir(base.path());
        let handle = backend
            .create_sandbox(&HashMap::new(), &local_config())
            .await
            .unwrap();

        backend.teardown(&handle).await.unwrap();
        backend.teardown(&handle).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires a node binary on PATH
    async fn test_exec_runs_node() {
        let base = tempfile::tempdir().unwrap();
        let backend = LocalBackend::with_base_dir(base.path());
        let handle = backend
            .create_sandbox(&HashMap::new(), &local_config())
            .await
            .unwrap();

        backend
            .write_file(&handle, "runs/r1/index.js", "console.log(40 + 2);")
            .await
            .unwrap();

        let output = backend
            .exec(
                &handle,
                &["node".to_string(), "runs/r1/index.js".to_string()],
                ".",
                &HashMap::new(),
            )
            .await
            .unwrap();

        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout.trim(), "42");

        backend.teardown(&handle).await.unwrap();
    }
}
