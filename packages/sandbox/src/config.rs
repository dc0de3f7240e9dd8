// ABOUTME: Tool and sandbox configuration contracts consumed from the route layer
// ABOUTME: Defines the runtime tag, provider tag and per-tool execution settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Provider tag for the native, in-process strategy.
pub const PROVIDER_LOCAL: &str = "local";
/// Provider tag for the remote micro-VM strategy.
pub const PROVIDER_REMOTE: &str = "remote";

/// Language runtime a tool's code executes under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Runtime {
    Node,
    Python,
}

impl Runtime {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Node => "node",
            Self::Python => "python",
        }
    }

    /// Source file extension for the invocation-run entry point.
    pub fn extension(&self) -> &str {
        match self {
            Self::Node => "js",
            Self::Python => "py",
        }
    }

    /// Binary invoked to run a script.
    pub fn binary(&self) -> &str {
        match self {
            Self::Node => "node",
            Self::Python => "python3",
        }
    }

    /// Dependency manifest file name written into a fresh sandbox.
    pub fn manifest_name(&self) -> &str {
        match self {
            Self::Node => "package.json",
            Self::Python => "requirements.txt",
        }
    }

    /// Command that installs the dependency manifest inside a sandbox.
    pub fn install_argv(&self) -> Vec<String> {
        match self {
            Self::Node => vec![
                "npm".to_string(),
                "install".to_string(),
                "--no-audit".to_string(),
                "--no-fund".to_string(),
            ],
            Self::Python => vec![
                "python3".to_string(),
                "-m".to_string(),
                "pip".to_string(),
                "install".to_string(),
                "-r".to_string(),
                "requirements.txt".to_string(),
            ],
        }
    }

    /// Command that runs a script at `script_path` (relative to the sandbox root).
    pub fn run_argv(&self, script_path: &str) -> Vec<String> {
        vec![self.binary().to_string(), script_path.to_string()]
    }

    /// Render the declared dependency map as a manifest body.
    pub fn render_manifest(&self, dependencies: &HashMap<String, String>) -> String {
        match self {
            Self::Node => {
                let deps: serde_json::Map<String, serde_json::Value> = {
                    let mut pairs: Vec<_> = dependencies.iter().collect();
                    pairs.sort_by(|a, b| a.0.cmp(b.0));
                    pairs
                        .into_iter()
                        .map(|(name, range)| {
                            (name.clone(), serde_json::Value::String(range.clone()))
                        })
                        .collect()
                };
                let manifest = serde_json::json!({
                    "name": "agentry-sandbox",
                    "private": true,
                    "dependencies": deps,
                });
                // json! never produces unserializable values
                serde_json::to_string_pretty(&manifest).unwrap_or_default()
            }
            Self::Python => {
                let mut pairs: Vec<_> = dependencies.iter().collect();
                pairs.sort_by(|a, b| a.0.cmp(b.0));
                let mut body = String::new();
                for (name, range) in pairs {
                    if range.is_empty() {
                        body.push_str(name);
                    } else {
                        body.push_str(&format!("{}{}", name, range));
                    }
                    body.push('\n');
                }
                body
            }
        }
    }
}

/// Sandbox placement and limits for one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Provider tag; `"local"` or `"remote"`. Anything else is rejected by the factory.
    pub provider: String,
    pub runtime: Runtime,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_vcpus")]
    pub vcpus: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_vcpus() -> u32 {
    1
}

impl SandboxConfig {
    pub fn local(runtime: Runtime) -> Self {
        Self {
            provider: PROVIDER_LOCAL.to_string(),
            runtime,
            timeout_ms: default_timeout_ms(),
            vcpus: default_vcpus(),
            api_endpoint: None,
            api_key: None,
        }
    }
}

/// A function tool as declared by its owning agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    /// Source text of the tool's `execute` function.
    pub execute_code: String,
    /// package name -> version range
    #[serde(default)]
    pub dependencies: HashMap<String, String>,
    pub sandbox: SandboxConfig,
}
