// ABOUTME: Remote micro-VM backend speaking a REST provisioning API
// ABOUTME: Creates VMs with dependencies installed server-side, proxies file writes and exec calls

use crate::backend::{BackendError, ExecOutput, Result, SandboxBackend, SandboxHandle};
use crate::config::{SandboxConfig, PROVIDER_REMOTE};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Workspace path inside every micro-VM; invocation runs live under it.
const VM_WORKSPACE: &str = "/workspace";

#[derive(Debug, Serialize)]
struct CreateVmRequest<'a> {
    runtime: &'a str,
    vcpus: u32,
    timeout_ms: u64,
    dependencies: &'a HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct CreateVmResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct WriteFileRequest<'a> {
    path: &'a str,
    contents: &'a str,
}

#[derive(Debug, Serialize)]
struct ExecRequest<'a> {
    argv: &'a [String],
    cwd: &'a str,
    env: &'a HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ExecResponse {
    exit_code: i32,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

#[derive(Debug, Serialize)]
struct RemovePathRequest<'a> {
    path: &'a str,
}

/// Remote strategy: execution environments are micro-VMs managed through a
/// provider REST API.
pub struct RemoteVmBackend {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl RemoteVmBackend {
    pub fn new(endpoint: String, api_key: String) -> Result<Self> {
        if endpoint.is_empty() {
            return Err(BackendError::Config(
                "remote provider endpoint is required".to_string(),
            ));
        }
        if api_key.is_empty() {
            return Err(BackendError::Config(
                "remote provider API key is required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| BackendError::Http(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.api_key)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn check(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(message));
        }
        Err(BackendError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<Response> {
        let response = self
            .client
            .post(self.url(path))
            .header("Authorization", self.auth_header())
            .json(body)
            .send()
            .await
            .map_err(|e| BackendError::Http(e.to_string()))?;
        self.check(response).await
    }
}

#[async_trait]
impl SandboxBackend for RemoteVmBackend {
    fn name(&self) -> &str {
        PROVIDER_REMOTE
    }

    async fn create_sandbox(
        &self,
        dependencies: &HashMap<String, String>,
        config: &SandboxConfig,
    ) -> Result<SandboxHandle> {
        // The provider installs dependencies during provisioning; a non-2xx
        // response means the VM was discarded server-side.
        let request = CreateVmRequest {
            runtime: config.runtime.as_str(),
            vcpus: config.vcpus,
            timeout_ms: config.timeout_ms,
            dependencies,
        };
        let response = self.post_json("/v1/sandboxes", &request).await?;
        let created: CreateVmResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Http(format!("invalid create response: {}", e)))?;

        info!("created remote sandbox {}", created.id);
        Ok(SandboxHandle {
            id: created.id,
            provider: PROVIDER_REMOTE.to_string(),
            root: PathBuf::from(VM_WORKSPACE),
        })
    }

    async fn write_file(
        &self,
        handle: &SandboxHandle,
        rel_path: &str,
        contents: &str,
    ) -> Result<()> {
        debug!("writing {} into remote sandbox {}", rel_path, handle.id);
        self.post_json(
            &format!("/v1/sandboxes/{}/files", handle.id),
            &WriteFileRequest {
                path: rel_path,
                contents,
            },
        )
        .await?;
        Ok(())
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        argv: &[String],
        cwd: &str,
        env: &HashMap<String, String>,
    ) -> Result<ExecOutput> {
        debug!("exec in remote sandbox {}: {:?}", handle.id, argv);
        let response = self
            .post_json(
                &format!("/v1/sandboxes/{}/exec", handle.id),
                &ExecRequest { argv, cwd, env },
            )
            .await?;
        let result: ExecResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Http(format!("invalid exec response: {}", e)))?;
        Ok(ExecOutput {
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
        })
    }

    async fn remove_path(&self, handle: &SandboxHandle, rel_path: &str) -> Result<()> {
        match self
            .post_json(
                &format!("/v1/sandboxes/{}/files/delete", handle.id),
                &RemovePathRequest { path: rel_path },
            )
            .await
        {
            Ok(_) => Ok(()),
            // A missing path is already gone; callers treat cleanup as best-effort.
            Err(BackendError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn teardown(&self, handle: &SandboxHandle) -> Result<()> {
        debug!("tearing down remote sandbox {}", handle.id);
        let response = self
            .client
            .delete(self.url(&format!("/v1/sandboxes/{}", handle.id)))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| BackendError::Http(e.to_string()))?;
        match self.check(response).await {
            Ok(_) => Ok(()),
            Err(BackendError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
