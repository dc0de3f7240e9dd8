// ABOUTME: Context fetch engine resolving variable definitions once per pass
// ABOUTME: Honors trigger matching, skip-vs-error semantics and cache read-before-fetch

use crate::cache::ContextCache;
use crate::storage::CacheEntry;
use crate::types::{
    ContextConfig, ContextVariableDef, ErroredDefinition, ResolutionResult, SkippedDefinition,
    Trigger,
};
use chrono::Utc;
use futures::future::join_all;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

lazy_static! {
    static ref TEMPLATE_REF_RE: Regex =
        Regex::new(r"\{\{\s*(headers|vars)\.([A-Za-z0-9_\-]+)\s*\}\}").expect("static regex");
}

/// Failure of one definition's fetch attempt. Recorded per definition, never
/// aborts the rest of the pass.
#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed response body: {0}")]
    MalformedBody(String),
}

/// Inputs for one resolution pass.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub conversation_id: String,
    /// The pass's trigger event; only definitions with a matching trigger
    /// are considered.
    pub trigger: Trigger,
    /// Inbound request headers referenced by `{{headers.*}}` templates.
    pub headers: HashMap<String, String>,
}

enum Outcome {
    Skipped(String),
    CacheHit(Value),
    Fetched(Value),
    Errored(String),
}

/// Resolves a context configuration's variables, consulting the cache before
/// issuing network fetches and writing new values back.
pub struct ContextResolver {
    client: Client,
    cache: Arc<ContextCache>,
}

impl ContextResolver {
    pub fn new(cache: Arc<ContextCache>) -> Self {
        Self::with_client(Client::new(), cache)
    }

    /// Use a caller-tuned HTTP client (timeouts, proxies).
    pub fn with_client(client: Client, cache: Arc<ContextCache>) -> Self {
        Self { client, cache }
    }

    /// Resolve every definition whose trigger matches the pass, each exactly
    /// once. Definitions referencing `{{vars.*}}` wait for their
    /// prerequisites within the same pass; independent fetches in a wave run
    /// concurrently. One definition's failure never aborts the others.
    pub async fn resolve(
        &self,
        config: &ContextConfig,
        options: &ResolveOptions,
    ) -> ResolutionResult {
        let mut result = ResolutionResult::default();

        let candidates: Vec<(String, ContextVariableDef)> = config
            .context_variables
            .iter()
            .filter(|(_, def)| def.trigger == options.trigger)
            .map(|(key, def)| (key.clone(), def.clone()))
            .collect();
        let candidate_keys: HashSet<String> =
            candidates.iter().map(|(key, _)| key.clone()).collect();

        let mut settled: HashSet<String> = HashSet::new();
        let mut pending = candidates;

        while !pending.is_empty() {
            // A definition is ready once every variable it references is
            // resolved, settled without a value, or not produced this pass.
            let (ready, waiting): (Vec<_>, Vec<_>) = pending.into_iter().partition(|(_, def)| {
                var_refs(def).iter().all(|name| {
                    result.values.contains_key(name)
                        || settled.contains(name)
                        || !candidate_keys.contains(name)
                })
            });

            if ready.is_empty() {
                // Only circular references remain.
                for (key, def) in waiting {
                    debug!("skipping {} (circular variable reference)", def.id);
                    result.skipped.push(SkippedDefinition {
                        id: def.id.clone(),
                        reason: "circular variable reference".to_string(),
                    });
                    if let Some(default) = def.default_value.clone() {
                        result.values.insert(key.clone(), default);
                    }
                    settled.insert(key);
                }
                break;
            }

            let snapshot = result.values.clone();
            let outcomes = join_all(ready.iter().map(|(key, def)| {
                let snapshot = &snapshot;
                async move {
                    self.resolve_definition(
                        &options.conversation_id,
                        &config.id,
                        key,
                        def,
                        &options.headers,
                        snapshot,
                    )
                    .await
                }
            }))
            .await;

            for ((key, def), outcome) in ready.into_iter().zip(outcomes) {
                settled.insert(key.clone());
                match outcome {
                    Outcome::Skipped(reason) => {
                        debug!("skipped context variable {}: {}", def.id, reason);
                        result.skipped.push(SkippedDefinition {
                            id: def.id.clone(),
                            reason,
                        });
                        // A skipped definition with a default still
                        // contributes that default to the resolved map.
                        if let Some(default) = def.default_value.clone() {
                            result.values.insert(key, default);
                        }
                    }
                    Outcome::CacheHit(value) => {
                        result.cache_hits.push(def.id.clone());
                        result.values.insert(key, value);
                    }
                    Outcome::Fetched(value) => {
                        result.cache_misses.push(def.id.clone());
                        result.fetched.push(def.id.clone());
                        result.values.insert(key, value);
                    }
                    Outcome::Errored(cause) => {
                        warn!("context variable {} errored: {}", def.id, cause);
                        result.cache_misses.push(def.id.clone());
                        result.errored.push(ErroredDefinition { id: def.id, cause });
                    }
                }
            }

            pending = waiting;
        }

        self.cache.mark_resolved(&options.conversation_id).await;
        result
    }

    async fn resolve_definition(
        &self,
        conversation_id: &str,
        config_id: &str,
        key: &str,
        def: &ContextVariableDef,
        headers: &HashMap<String, String>,
        values: &HashMap<String, Value>,
    ) -> Outcome {
        // Explicit prerequisites: a missing or empty one skips, never errors.
        for reference in &def.fetch.required_to_fetch {
            let Some((kind, name)) = reference.split_once('.') else {
                return Outcome::Skipped(format!("malformed required reference: {}", reference));
            };
            if resolve_ref(kind, name, headers, values).is_none() {
                return Outcome::Skipped(format!(
                    "required value {} is missing or empty",
                    reference
                ));
            }
        }

        let url = match render_template(&def.fetch.url, headers, values) {
            Ok(url) => url,
            Err(missing) => {
                return Outcome::Skipped(format!(
                    "template reference {} is missing or empty",
                    missing
                ))
            }
        };

        let mut rendered_headers = Vec::new();
        for (name, template) in &def.fetch.headers {
            match render_template(template, headers, values) {
                Ok(value) => rendered_headers.push((name.clone(), value)),
                Err(missing) => {
                    return Outcome::Skipped(format!(
                        "template reference {} is missing or empty",
                        missing
                    ))
                }
            }
        }
        rendered_headers.sort();

        let hash = request_hash(&def.fetch.method, &url, &rendered_headers);
        if let Some(entry) = self.cache.get(conversation_id, config_id, key, &hash).await {
            debug!("context variable {} served from cache", def.id);
            return Outcome::CacheHit(entry.value);
        }

        match self.fetch(def, &url, &rendered_headers).await {
            Ok(value) => {
                self.cache
                    .set(CacheEntry {
                        conversation_id: conversation_id.to_string(),
                        config_id: config_id.to_string(),
                        variable_key: key.to_string(),
                        value: value.clone(),
                        request_hash: hash,
                        fetched_at: Utc::now(),
                    })
                    .await;
                Outcome::Fetched(value)
            }
            Err(e) => Outcome::Errored(e.to_string()),
        }
    }

    async fn fetch(
        &self,
        def: &ContextVariableDef,
        url: &str,
        headers: &[(String, String)],
    ) -> std::result::Result<Value, ResolverError> {
        let method = reqwest::Method::from_bytes(def.fetch.method.as_bytes())
            .map_err(|_| ResolverError::Network(format!("invalid method {}", def.fetch.method)))?;

        let mut request = self.client.request(method, url);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ResolverError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ResolverError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| ResolverError::Network(e.to_string()))?;
        let value: Value = serde_json::from_str(&body)
            .map_err(|e| ResolverError::MalformedBody(e.to_string()))?;

        if let Some(expected) = def
            .response_schema
            .as_ref()
            .and_then(|schema| schema.get("type"))
            .and_then(|t| t.as_str())
        {
            let matches = match expected {
                "object" => value.is_object(),
                "array" => value.is_array(),
                "string" => value.is_string(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                _ => true,
            };
            if !matches {
                return Err(ResolverError::MalformedBody(format!(
                    "expected {} response, got {}",
                    expected,
                    json_type_name(&value)
                )));
            }
        }

        Ok(value)
    }
}

/// Check inbound headers against the configuration's header schema.
/// Returns one message per violation; an empty vector means valid.
pub fn validate_headers(config: &ContextConfig, headers: &HashMap<String, String>) -> Vec<String> {
    let mut violations = Vec::new();
    let Some(schema) = &config.headers_schema else {
        return violations;
    };
    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for name in required.iter().filter_map(|n| n.as_str()) {
            match headers.get(name) {
                Some(value) if !value.is_empty() => {}
                Some(_) => violations.push(format!("header {} must not be empty", name)),
                None => violations.push(format!("missing required header {}", name)),
            }
        }
    }
    violations
}

fn resolve_ref(
    kind: &str,
    name: &str,
    headers: &HashMap<String, String>,
    values: &HashMap<String, Value>,
) -> Option<String> {
    let resolved = match kind {
        "headers" => headers.get(name).cloned(),
        "vars" => values.get(name).map(value_to_string),
        _ => None,
    };
    resolved.filter(|v| !v.is_empty())
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_template(
    template: &str,
    headers: &HashMap<String, String>,
    values: &HashMap<String, Value>,
) -> std::result::Result<String, String> {
    let mut missing: Option<String> = None;
    let rendered = TEMPLATE_REF_RE
        .replace_all(template, |caps: &regex::Captures| {
            match resolve_ref(&caps[1], &caps[2], headers, values) {
                Some(value) => value,
                None => {
                    missing.get_or_insert(format!("{}.{}", &caps[1], &caps[2]));
                    String::new()
                }
            }
        })
        .into_owned();
    match missing {
        Some(reference) => Err(reference),
        None => Ok(rendered),
    }
}

/// Variable keys a definition references via `{{vars.*}}` templates or
/// `vars.*` prerequisites.
fn var_refs(def: &ContextVariableDef) -> HashSet<String> {
    let mut refs = HashSet::new();
    let mut scan = |template: &str| {
        for caps in TEMPLATE_REF_RE.captures_iter(template) {
            if &caps[1] == "vars" {
                refs.insert(caps[2].to_string());
            }
        }
    };
    scan(&def.fetch.url);
    for template in def.fetch.headers.values() {
        scan(template);
    }
    for reference in &def.fetch.required_to_fetch {
        if let Some(("vars", name)) = reference.split_once('.') {
            refs.insert(name.to_string());
        }
    }
    refs
}

/// Fingerprint of the inputs driving a fetch; a cached value is valid only
/// while its request hash is unchanged.
fn request_hash(method: &str, url: &str, headers: &[(String, String)]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\n");
    hasher.update(url.as_bytes());
    hasher.update(b"\n");
    for (name, value) in headers {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
