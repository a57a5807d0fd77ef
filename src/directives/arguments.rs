//! Tool-invocation body grammars.
//!
//! Two body shapes are accepted inside `<tool_use>`:
//!
//! ```text
//! <tool_use> name: get_time parameters: {"timezone": "UTC"} </tool_use>
//!
//! <tool_use>
//! name: convert
//! server: time
//! parameters:
//!   from: "UTC"
//!   to: "Asia/Tokyo"
//! </tool_use>
//! ```
//!
//! Inline parameter text is tried against an ordered list of grammars
//! (JSON, YAML flow, `key: "value"` pairs). The first that yields an object
//! wins; if none does, the region is malformed.

use serde_json::{Map, Value};

use crate::types::{Error, Result};

const INLINE_SEPARATOR: &str = " parameters: ";

/// Parsed tool-invocation body.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallBody {
    pub name: String,
    pub server: Option<String>,
    pub arguments: Map<String, Value>,
}

type Grammar = fn(&str) -> Option<Map<String, Value>>;

const PARAMETER_GRAMMARS: &[(&str, Grammar)] = &[
    ("json", parse_json_object),
    ("yaml", parse_yaml_mapping),
    ("pairs", parse_key_value_pairs),
];

/// Parse the trimmed inner text of a `<tool_use>` region.
pub fn parse_tool_body(body: &str) -> Result<ToolCallBody> {
    let body = body.trim();
    if body.is_empty() {
        return Err(Error::parse("empty tool_use body"));
    }

    if !body.contains('\n') {
        if let Some((head, params)) = body.split_once(INLINE_SEPARATOR) {
            return parse_inline(head, params);
        }
    }
    parse_block(body)
}

fn parse_inline(head: &str, params: &str) -> Result<ToolCallBody> {
    let name = head.trim();
    let name = name.strip_prefix("name:").unwrap_or(name).trim();
    if name.is_empty() {
        return Err(Error::parse("tool_use has no name"));
    }
    let arguments = parse_parameters(params)?;
    Ok(ToolCallBody {
        name: name.to_string(),
        server: None,
        arguments,
    })
}

/// Parse inline parameter text. Empty text means no arguments.
pub fn parse_parameters(params: &str) -> Result<Map<String, Value>> {
    let params = params.trim();
    if params.is_empty() {
        return Ok(Map::new());
    }
    PARAMETER_GRAMMARS
        .iter()
        .find_map(|(_, grammar)| grammar(params))
        .ok_or_else(|| Error::parse(format!("unrecognized parameter syntax: {}", params)))
}

fn parse_block(body: &str) -> Result<ToolCallBody> {
    let document = parse_json_object(body)
        .or_else(|| parse_yaml_mapping(body))
        .ok_or_else(|| Error::parse("tool_use body is not a mapping"))?;

    let name = document
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::parse("tool_use has no name"))?
        .to_string();
    let server = document
        .get("server")
        .and_then(Value::as_str)
        .map(str::to_string);

    let arguments = match document.get("parameters").or_else(|| document.get("arguments")) {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(text)) => parse_parameters(text)?,
        Some(other) => {
            return Err(Error::parse(format!(
                "tool_use parameters must be a mapping, got {}",
                other
            )))
        }
    };

    Ok(ToolCallBody {
        name,
        server,
        arguments,
    })
}

fn parse_json_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

fn parse_yaml_mapping(text: &str) -> Option<Map<String, Value>> {
    match serde_yaml::from_str::<Value>(text).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// `key1: "value one" key2: value2` with POSIX shell quoting. An
/// unterminated quote or trailing escape rejects the text.
fn parse_key_value_pairs(text: &str) -> Option<Map<String, Value>> {
    if text.starts_with('{') || !text.contains(':') {
        return None;
    }
    let tokens = shlex::split(text)?;
    let mut map = Map::new();
    let mut i = 0;
    while i < tokens.len() {
        match tokens[i].strip_suffix(':') {
            Some(key) if !key.is_empty() && i + 1 < tokens.len() => {
                map.insert(key.to_string(), Value::String(tokens[i + 1].clone()));
                i += 2;
            }
            _ => i += 1,
        }
    }
    (!map.is_empty()).then_some(map)
}
