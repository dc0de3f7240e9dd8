// ABOUTME: Execution wrapper and result codec for out-of-process tool runs
// ABOUTME: Wraps user code into a self-contained script and parses its stdout result line

use crate::config::Runtime;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

lazy_static! {
    static ref NODE_ENV_RE: Regex =
        Regex::new(r"process\.env\.([A-Za-z_][A-Za-z0-9_]*)").expect("static regex");
    static ref PYTHON_ENV_INDEX_RE: Regex =
        Regex::new(r#"os\.environ\[["']([A-Za-z_][A-Za-z0-9_]*)["']\]"#).expect("static regex");
    static ref PYTHON_ENV_GET_RE: Regex =
        Regex::new(r#"os\.environ\.get\(["']([A-Za-z_][A-Za-z0-9_]*)["']"#).expect("static regex");
}

/// The single JSON line a wrapped script prints to stdout.
#[derive(Debug, Deserialize)]
pub struct WireResult {
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Wrap a tool's `execute` function into a self-contained script.
///
/// The script invokes the function with the serialized `args`, prints exactly
/// one JSON line `{"success":true,"result":...}` or
/// `{"success":false,"error":"..."}` to stdout, and exits non-zero on
/// failure. The stdout line plus the exit code are the sole channel back to
/// the parent process.
pub fn wrap(user_code: &str, args: &Value, runtime: Runtime) -> String {
    match runtime {
        Runtime::Node => wrap_node(user_code, args),
        Runtime::Python => wrap_python(user_code, args),
    }
}

fn wrap_node(user_code: &str, args: &Value) -> String {
    // JSON is a valid JS expression, so args embed directly as a literal.
    let args_literal = args.to_string();
    format!(
        r#"{user_code}

const __args = {args_literal};

(async () => {{
  try {{
    const __result = await execute(__args);
    process.stdout.write(JSON.stringify({{ success: true, result: __result === undefined ? null : __result }}) + "\n");
  }} catch (__err) {{
    const __message = __err && __err.message ? __err.message : String(__err);
    process.stdout.write(JSON.stringify({{ success: false, error: __message }}) + "\n");
    process.exit(1);
  }}
}})();
"#
    )
}

fn wrap_python(user_code: &str, args: &Value) -> String {
    // Double-encoding yields a quoted, escaped literal that is valid Python.
    let args_literal =
        serde_json::to_string(&args.to_string()).unwrap_or_else(|_| "\"null\"".to_string());
    format!(
        r#"import json as __json
import sys as __sys

{user_code}

__args = __json.loads({args_literal})

try:
    __result = execute(__args)
    __sys.stdout.write(__json.dumps({{"success": True, "result": __result}}) + "\n")
except Exception as __err:
    __sys.stdout.write(__json.dumps({{"success": False, "error": str(__err)}}) + "\n")
    __sys.exit(1)
"#
    )
}

/// Parse the result line from a wrapped script's captured stdout.
///
/// Takes the last non-blank line and JSON-decodes it. On decode failure the
/// raw output is returned as a string value and a warning is logged; this
/// never errors.
pub fn parse_result(stdout: &str) -> Value {
    let last_line = stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("");

    match serde_json::from_str(last_line) {
        Ok(value) => value,
        Err(e) => {
            warn!(
                "failed to decode execution result line ({}), returning raw output",
                e
            );
            Value::String(stdout.to_string())
        }
    }
}

/// Scan user source text for environment variable references.
///
/// Matches `process.env.X`, `os.environ["X"]` and `os.environ.get("X")`.
/// Returned names are deduplicated and sorted. The executor surfaces these as
/// empty-string placeholders; actual secret sourcing belongs to an injector
/// collaborator.
pub fn scan_env_references(user_code: &str) -> Vec<String> {
    let mut names: Vec<String> = NODE_ENV_RE
        .captures_iter(user_code)
        .chain(PYTHON_ENV_INDEX_RE.captures_iter(user_code))
        .chain(PYTHON_ENV_GET_RE.captures_iter(user_code))
        .map(|caps| caps[1].to_string())
        .collect();
    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_wrap_node_embeds_args_and_envelope() {
        let script = wrap(
            "async function execute(args) { return args.x + 1; }",
            &json!({"x": 41}),
            Runtime::Node,
        );
        assert!(script.contains(r#"const __args = {"x":41};"#));
        assert!(script.contains("success: true"));
        assert!(script.contains("process.exit(1)"));
    }

    #[test]
    fn test_wrap_python_embeds_args() {
        let script = wrap(
            "def execute(args):\n    return args[\"x\"]",
            &json!({"x": "a \"quoted\" string"}),
            Runtime::Python,
        );
        assert!(script.contains("__json.loads("));
        assert!(script.contains("__sys.exit(1)"));
    }

    #[test]
    fn test_parse_result_takes_last_non_blank_line() {
        let stdout = "installing...\nprogress 50%\n{\"success\":true,\"result\":7}\n\n";
        let value = parse_result(stdout);
        assert_eq!(value["success"], json!(true));
        assert_eq!(value["result"], json!(7));
    }

    #[test]
    fn test_parse_result_falls_back_to_raw_output() {
        let stdout = "not json at all";
        let value = parse_result(stdout);
        assert_eq!(value, Value::String("not json at all".to_string()));
    }

    #[test]
    fn test_parse_result_empty_output() {
        let value = parse_result("");
        assert_eq!(value, Value::String(String::new()));
    }

    // Round-trip of the result envelope: wrapping a value, printing the line
    // the script would print, and parsing it back yields the same value.
    #[test]
    fn test_result_envelope_round_trip() {
        let values = vec![
            json!(null),
            json!(42),
            json!("hello\nworld"),
            json!([1, 2, {"nested": true}]),
            json!({"a": {"b": ["c", 1.5, false]}}),
        ];
        for v in values {
            let line = serde_json::to_string(&json!({"success": true, "result": v})).unwrap();
            let stdout = format!("some earlier log line\n{}\n", line);
            let parsed = parse_result(&stdout);
            assert_eq!(parsed["result"], v);
        }
    }

    #[test]
    fn test_scan_env_references_node_and_python() {
        let code = r#"
const key = process.env.API_KEY;
const other = process.env.API_KEY;
token = os.environ["GH_TOKEN"]
region = os.environ.get("AWS_REGION", "us-east-1")
"#;
        let names = scan_env_references(code);
        assert_eq!(names, vec!["API_KEY", "AWS_REGION", "GH_TOKEN"]);
    }

    #[test]
    fn test_scan_env_references_none() {
        assert!(scan_env_references("function execute() { return 1; }").is_empty());
    }
}
