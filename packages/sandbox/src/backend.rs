// ABOUTME: Backend trait and wire types for sandbox execution strategies
// ABOUTME: Defines the contract shared by the local process and remote micro-VM backends

use crate::config::SandboxConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Sandbox provisioning failed: {0}")]
    Provision(String),

    #[error("Dependency install failed: {0}")]
    Install(String),

    #[error("Sandbox not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Provider API error ({status}): {message}")]
    Api { status: u16, message: String },
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Handle to a live execution environment.
///
/// `root` is the environment's working root: a host filesystem path for the
/// local backend, the in-VM workspace path for the remote backend. All
/// invocation-run paths are relative to it.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    pub id: String,
    pub provider: String,
    pub root: PathBuf,
}

/// Captured output of one command execution inside a sandbox.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Execution environment backend.
///
/// The pool and executor are written against this trait; the local process
/// and remote micro-VM strategies are interchangeable behind it.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Provider tag used in logs and handles.
    fn name(&self) -> &str;

    /// Provision a new environment and synchronously install the declared
    /// dependencies into it. An empty dependency map skips the install step
    /// entirely. Failure tears down any partially created environment before
    /// returning.
    async fn create_sandbox(
        &self,
        dependencies: &HashMap<String, String>,
        config: &SandboxConfig,
    ) -> Result<SandboxHandle>;

    /// Materialize a file at `rel_path` (relative to the sandbox root),
    /// creating parent directories as needed.
    async fn write_file(&self, handle: &SandboxHandle, rel_path: &str, contents: &str)
        -> Result<()>;

    /// Run a command inside the sandbox, scoped to `cwd` (relative to the
    /// sandbox root), and capture its output.
    async fn exec(
        &self,
        handle: &SandboxHandle,
        argv: &[String],
        cwd: &str,
        env: &HashMap<String, String>,
    ) -> Result<ExecOutput>;

    /// Remove a file or directory at `rel_path`. Missing paths are not an
    /// error.
    async fn remove_path(&self, handle: &SandboxHandle, rel_path: &str) -> Result<()>;

    /// Destroy the environment and release its resources.
    async fn teardown(&self, handle: &SandboxHandle) -> Result<()>;
}
