// ABOUTME: Context configuration and resolution result types
// ABOUTME: Variable definitions with triggers, fetch recipes and default values

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// When a context variable definition is eligible to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Fetched once when a conversation session starts.
    Initialization,
    /// Fetched on every tool/agent invocation turn.
    Invocation,
}

impl Trigger {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Initialization => "initialization",
            Self::Invocation => "invocation",
        }
    }
}

/// Fetch recipe for one context variable.
///
/// `url` and header values are templates; `{{headers.name}}` references an
/// inbound request header, `{{vars.key}}` references another variable
/// resolved in the same pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// References (e.g. `headers.authorization`) that must resolve to a
    /// non-empty value for the fetch to be attempted; a missing one skips
    /// the definition instead of erroring.
    #[serde(default)]
    pub required_to_fetch: Vec<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// One named context variable owned by a context configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextVariableDef {
    pub id: String,
    pub name: String,
    pub trigger: Trigger,
    pub fetch: FetchConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

impl ContextVariableDef {
    /// Whether any part of the fetch recipe references an inbound header.
    pub fn references_headers(&self) -> bool {
        let in_template = |t: &str| t.contains("{{headers.") || t.contains("{{ headers.");
        in_template(&self.fetch.url)
            || self.fetch.headers.values().any(|v| in_template(v))
            || self
                .fetch
                .required_to_fetch
                .iter()
                .any(|r| r.starts_with("headers."))
    }
}

/// A context configuration: the full set of variable definitions for one
/// agent, immutable during a resolution pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers_schema: Option<Value>,
    #[serde(default)]
    pub context_variables: HashMap<String, ContextVariableDef>,
}

/// A definition skipped because a precondition was not met.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedDefinition {
    pub id: String,
    pub reason: String,
}

/// A definition whose fetch was attempted and failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErroredDefinition {
    pub id: String,
    pub cause: String,
}

/// Outcome of one resolution pass.
///
/// A definition id appears in at most one of `fetched`, `skipped`,
/// `errored`; ids whose trigger did not match the pass appear in none.
/// `cache_hits`/`cache_misses` record cache consultation for the
/// definitions that reached the fetch stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolutionResult {
    pub fetched: Vec<String>,
    pub cache_hits: Vec<String>,
    pub cache_misses: Vec<String>,
    pub skipped: Vec<SkippedDefinition>,
    pub errored: Vec<ErroredDefinition>,
    /// Resolved values keyed by variable key.
    pub values: HashMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_trigger_serde_tags() {
        assert_eq!(
            serde_json::to_string(&Trigger::Initialization).unwrap(),
            "\"initialization\""
        );
        let t: Trigger = serde_json::from_str("\"invocation\"").unwrap();
        assert_eq!(t, Trigger::Invocation);
    }

    #[test]
    fn test_fetch_config_defaults() {
        let fetch: FetchConfig =
            serde_json::from_value(json!({"url": "https://api.example/users"})).unwrap();
        assert_eq!(fetch.method, "GET");
        assert!(fetch.headers.is_empty());
        assert!(fetch.required_to_fetch.is_empty());
    }

    #[test]
    fn test_references_headers() {
        let def: ContextVariableDef = serde_json::from_value(json!({
            "id": "v1",
            "name": "Account",
            "trigger": "initialization",
            "fetch": {
                "url": "https://api.example/me",
                "headers": {"Authorization": "{{headers.authorization}}"}
            }
        }))
        .unwrap();
        assert!(def.references_headers());

        let plain: ContextVariableDef = serde_json::from_value(json!({
            "id": "v2",
            "name": "Status",
            "trigger": "invocation",
            "fetch": {"url": "https://api.example/status"}
        }))
        .unwrap();
        assert!(!plain.references_headers());
    }
}
