//! Generic detection dispatch
//!
//! Pattern grammar per detection type:
//!
//! - `flag`: `{"flag": name, "expected": value}`; violated when the session
//!   flag (absent = null) differs from `expected`
//! - `name`: a string or array of strings matched against the operation
//!   name; a trailing `*` matches by prefix
//! - `args`: any of `max_items {key, max}`, `forbidden_paths [..]`,
//!   `require_flags [{command, flags}]`, `require_background [{command}]`;
//!   violated when any present check fails
//! - `regex`: a pattern string, or `{pattern, target, case_insensitive}`
//!   with `target` one of `arguments` (default), `response`, `all`
//! - `api_call`: `{endpoint, method, required_headers}` against the `url`
//!   (or `endpoint`), `method` and `headers` arguments

use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};

use super::evaluator::EvaluationError;
use super::session::SessionState;
use crate::input::ActionRequest;
use crate::parser::{shell, wrapper};
use crate::rules::DetectionType;

static NULL: Value = Value::Null;

/// Compiled detection regexes, shared across evaluations
#[derive(Debug, Default)]
pub struct RegexCache {
    compiled: DashMap<(String, bool), Regex>,
}

impl RegexCache {
    pub fn get(&self, pattern: &str, case_insensitive: bool) -> Result<Regex, EvaluationError> {
        let key = (pattern.to_string(), case_insensitive);
        if let Some(regex) = self.compiled.get(&key) {
            return Ok(regex.clone());
        }

        let regex = RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|e| EvaluationError::InvalidRegex {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;
        self.compiled.insert(key, regex.clone());
        Ok(regex)
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

pub fn detect(
    detection_type: DetectionType,
    pattern: &Value,
    request: &ActionRequest,
    session: &SessionState,
    regexes: &RegexCache,
    wrappers: &[String],
) -> Result<bool, EvaluationError> {
    match detection_type {
        DetectionType::Flag => flag(pattern, session),
        DetectionType::Name => name(pattern, &request.operation_name),
        DetectionType::Args => args(pattern, request, wrappers),
        DetectionType::Regex => regex(pattern, request, regexes),
        DetectionType::ApiCall => api_call(pattern, &request.arguments),
    }
}

fn flag(pattern: &Value, session: &SessionState) -> Result<bool, EvaluationError> {
    let name = pattern
        .get("flag")
        .and_then(Value::as_str)
        .ok_or_else(|| EvaluationError::malformed("flag pattern needs a `flag` name"))?;
    let expected = pattern
        .get("expected")
        .ok_or_else(|| EvaluationError::malformed("flag pattern needs an `expected` value"))?;

    let actual = session.flag(name).unwrap_or(&NULL);
    Ok(actual != expected)
}

fn name_matches(entry: &str, operation: &str) -> bool {
    match entry.strip_suffix('*') {
        Some(prefix) => operation.starts_with(prefix),
        None => entry == operation,
    }
}

fn name(pattern: &Value, operation: &str) -> Result<bool, EvaluationError> {
    match pattern {
        Value::String(entry) => Ok(name_matches(entry, operation)),
        Value::Array(entries) => {
            let mut hit = false;
            for entry in entries {
                let entry = entry
                    .as_str()
                    .ok_or_else(|| EvaluationError::malformed("name entries must be strings"))?;
                hit |= name_matches(entry, operation);
            }
            Ok(hit)
        }
        _ => Err(EvaluationError::malformed(
            "name pattern must be a string or an array of strings",
        )),
    }
}

fn args(pattern: &Value, request: &ActionRequest, wrappers: &[String]) -> Result<bool, EvaluationError> {
    let checks = pattern
        .as_object()
        .ok_or_else(|| EvaluationError::malformed("args pattern must be an object"))?;

    let mut recognized = false;
    let mut violated = false;

    if let Some(spec) = checks.get("max_items") {
        recognized = true;
        violated |= max_items(spec, &request.arguments)?;
    }
    if let Some(spec) = checks.get("forbidden_paths") {
        recognized = true;
        violated |= forbidden_paths(spec, &request.arguments)?;
    }
    if let Some(spec) = checks.get("require_flags") {
        recognized = true;
        violated |= require_flags(spec, request, wrappers)?;
    }
    if let Some(spec) = checks.get("require_background") {
        recognized = true;
        violated |= require_background(spec, request, wrappers)?;
    }

    if !recognized {
        return Err(EvaluationError::malformed("args pattern has no known checks"));
    }
    Ok(violated)
}

fn max_items(spec: &Value, arguments: &Map<String, Value>) -> Result<bool, EvaluationError> {
    let key = spec
        .get("key")
        .and_then(Value::as_str)
        .ok_or_else(|| EvaluationError::malformed("max_items needs a `key`"))?;
    let max = spec
        .get("max")
        .and_then(Value::as_u64)
        .ok_or_else(|| EvaluationError::malformed("max_items needs a numeric `max`"))?;

    let count = match arguments.get(key) {
        None | Some(Value::Null) => 0,
        Some(Value::Array(items)) => items.len() as u64,
        Some(Value::Object(fields)) => fields.len() as u64,
        Some(_) => 1,
    };
    Ok(count > max)
}

fn string_list<'a>(spec: &'a Value, what: &str) -> Result<Vec<&'a str>, EvaluationError> {
    let items = spec
        .as_array()
        .ok_or_else(|| EvaluationError::malformed(format!("{} must be an array", what)))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .ok_or_else(|| EvaluationError::malformed(format!("{} entries must be strings", what)))
        })
        .collect()
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|item| collect_strings(item, out)),
        Value::Object(fields) => fields.values().for_each(|item| collect_strings(item, out)),
        _ => {}
    }
}

fn forbidden_paths(spec: &Value, arguments: &Map<String, Value>) -> Result<bool, EvaluationError> {
    let fragments = string_list(spec, "forbidden_paths")?;

    let mut haystack = Vec::new();
    for value in arguments.values() {
        collect_strings(value, &mut haystack);
    }

    Ok(fragments
        .iter()
        .filter(|fragment| !fragment.is_empty())
        .any(|fragment| {
            let fragment = fragment.replace('\\', "/");
            haystack
                .iter()
                .any(|text| text.replace('\\', "/").contains(fragment.as_str()))
        }))
}

/// One simple command of a shell line, unwrapped
struct CommandPart {
    argv: Vec<String>,
    backgrounded: bool,
}

fn command_parts(command: &str, wrappers: &[String]) -> Vec<CommandPart> {
    let mut parts = Vec::new();
    for part in shell::split_compound_command(command) {
        let backgrounded = shell::is_backgrounded(&part) || followed_by_ampersand(command, &part);
        for stage in shell::split_pipeline(&part) {
            let Some(mut tokens) = shell::tokenize(&stage) else {
                continue;
            };
            while tokens.last().is_some_and(|t| t == "&") {
                tokens.pop();
            }
            if let Some(argv) = wrapper::unwrap_argv(&tokens, wrappers) {
                parts.push(CommandPart { argv, backgrounded });
            }
        }
    }
    parts
}

/// `a & b` loses its `&` when split; look it up in the original line
fn followed_by_ampersand(command: &str, part: &str) -> bool {
    command.find(part).is_some_and(|idx| {
        let rest = command[idx + part.len()..].trim_start();
        rest.starts_with('&') && !rest.starts_with("&&")
    })
}

fn shape_of(spec: &Value, what: &str) -> Result<Vec<String>, EvaluationError> {
    let command = spec
        .get("command")
        .and_then(Value::as_str)
        .ok_or_else(|| EvaluationError::malformed(format!("{} entries need a `command`", what)))?;
    Ok(command.split_whitespace().map(str::to_string).collect())
}

fn has_flag(argv: &[String], flag: &str) -> bool {
    argv.iter()
        .any(|arg| arg == flag || arg.strip_prefix(flag).is_some_and(|rest| rest.starts_with('=')))
}

fn require_flags(spec: &Value, request: &ActionRequest, wrappers: &[String]) -> Result<bool, EvaluationError> {
    let entries = spec
        .as_array()
        .ok_or_else(|| EvaluationError::malformed("require_flags must be an array"))?;
    let parts = request
        .command()
        .map(|command| command_parts(command, wrappers))
        .unwrap_or_default();

    let mut violated = false;
    for entry in entries {
        let shape = shape_of(entry, "require_flags")?;
        let flags = string_list(entry.get("flags").unwrap_or(&NULL), "require_flags.flags")?;
        violated |= parts
            .iter()
            .filter(|part| shell::argv_matches_shape(&part.argv, &shape))
            .any(|part| flags.iter().any(|flag| !has_flag(&part.argv, flag)));
    }
    Ok(violated)
}

fn require_background(spec: &Value, request: &ActionRequest, wrappers: &[String]) -> Result<bool, EvaluationError> {
    let entries = spec
        .as_array()
        .ok_or_else(|| EvaluationError::malformed("require_background must be an array"))?;
    let parts = request
        .command()
        .map(|command| command_parts(command, wrappers))
        .unwrap_or_default();
    let tool_background = request
        .arguments
        .get("run_in_background")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut violated = false;
    for entry in entries {
        let shape = shape_of(entry, "require_background")?;
        violated |= parts
            .iter()
            .filter(|part| shell::argv_matches_shape(&part.argv, &shape))
            .any(|part| !part.backgrounded && !tool_background);
    }
    Ok(violated)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Sorted `key=value` lines
pub fn project_arguments(arguments: &Map<String, Value>) -> String {
    let mut lines: Vec<String> = arguments
        .iter()
        .map(|(key, value)| format!("{}={}", key, value_text(value)))
        .collect();
    lines.sort();
    lines.join("\n")
}

pub fn project_response(snapshot: Option<&Value>) -> String {
    match snapshot {
        None => String::new(),
        Some(Value::Object(fields)) => project_arguments(fields),
        Some(other) => value_text(other),
    }
}

fn regex(pattern: &Value, request: &ActionRequest, regexes: &RegexCache) -> Result<bool, EvaluationError> {
    let (source, target, case_insensitive) = match pattern {
        Value::String(source) => (source.as_str(), "arguments", false),
        Value::Object(spec) => {
            let source = spec
                .get("pattern")
                .and_then(Value::as_str)
                .ok_or_else(|| EvaluationError::malformed("regex pattern needs a `pattern`"))?;
            let target = spec.get("target").and_then(Value::as_str).unwrap_or("arguments");
            let case_insensitive = spec
                .get("case_insensitive")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            (source, target, case_insensitive)
        }
        _ => return Err(EvaluationError::malformed("regex pattern must be a string or an object")),
    };

    let regex = regexes.get(source, case_insensitive)?;
    let text = match target {
        "arguments" => project_arguments(&request.arguments),
        "response" => project_response(request.result_snapshot.as_ref()),
        "all" => format!(
            "operation={}\n{}\n{}",
            request.operation_name,
            project_arguments(&request.arguments),
            project_response(request.result_snapshot.as_ref())
        ),
        other => {
            return Err(EvaluationError::malformed(format!("unknown regex target `{}`", other)));
        }
    };

    Ok(regex.is_match(&text))
}

fn optional_str<'a>(spec: &'a Map<String, Value>, key: &str) -> Result<Option<&'a str>, EvaluationError> {
    match spec.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(EvaluationError::malformed(format!("api_call `{}` must be a string", key))),
    }
}

fn api_call(pattern: &Value, arguments: &Map<String, Value>) -> Result<bool, EvaluationError> {
    let spec = pattern
        .as_object()
        .ok_or_else(|| EvaluationError::malformed("api_call pattern must be an object"))?;
    let endpoint = optional_str(spec, "endpoint")?;
    let method = optional_str(spec, "method")?;
    let required_headers = match spec.get("required_headers") {
        None | Some(Value::Null) => Vec::new(),
        Some(list) => string_list(list, "required_headers")?,
    };

    if endpoint.is_none() && method.is_none() && required_headers.is_empty() {
        return Err(EvaluationError::malformed(
            "api_call pattern needs endpoint, method or required_headers",
        ));
    }

    let Some(url) = arguments
        .get("url")
        .or_else(|| arguments.get("endpoint"))
        .and_then(Value::as_str)
    else {
        return Ok(false);
    };

    if endpoint.is_some_and(|endpoint| !url.contains(endpoint)) {
        return Ok(false);
    }
    if let Some(method) = method {
        let actual = arguments.get("method").and_then(Value::as_str).unwrap_or("GET");
        if !actual.eq_ignore_ascii_case(method) {
            return Ok(false);
        }
    }

    if required_headers.is_empty() {
        return Ok(true);
    }
    let headers = arguments.get("headers").and_then(Value::as_object);
    let present = |name: &str| headers.is_some_and(|h| h.keys().any(|k| k.eq_ignore_ascii_case(name)));
    Ok(required_headers.iter().any(|name| !present(name)))
}
