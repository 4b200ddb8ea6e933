// Tool declaration translation and JSON-schema sanitization. The upstream's
// function-calling surface rejects a handful of standard JSON Schema
// keywords; this sanitizer strips them regardless of which ingress shape the
// tools travelled in on, recursing through `properties`/`items` to reach
// OpenAI's `tools[].function.parameters` shape.

use crate::models::openai::ToolSpec;
use crate::models::upstream::{FunctionDeclaration, ToolDeclaration};
use serde_json::Value;
use tracing::debug;

/// Translate OpenAI-shaped tool specs into the single upstream
/// `ToolDeclaration` envelope. Returns an empty vec for no tools — the
/// upstream's protobuf rejects a present-but-empty `function_declarations`.
pub fn translate_tools(tools: &[ToolSpec]) -> Vec<ToolDeclaration> {
    if tools.is_empty() {
        return vec![];
    }

    vec![ToolDeclaration {
        function_declarations: tools.iter().map(translate_tool).collect(),
    }]
}

fn translate_tool(tool: &ToolSpec) -> FunctionDeclaration {
    let schema = tool.function.parameters.clone().unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}}));
    let sanitized = sanitize_schema(schema);
    FunctionDeclaration {
        name: tool.function.name.clone(),
        description: tool.function.description.clone(),
        parameters_json_schema: sanitized,
    }
}

const FORBIDDEN_KEYS: &[&str] = &[
    "$schema",
    "$id",
    "$ref",
    "definitions",
    "$defs",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "minimum",
    "maximum",
    "minLength",
    "maxLength",
    "minItems",
    "maxItems",
    "propertyNames",
    "patternProperties",
    "additionalItems",
    "default",
    "pattern",
    "contentMediaType",
    "contentEncoding",
];

/// Strip the upstream's forbidden JSON Schema keywords, normalize `format`
/// to the two values the upstream accepts, and simplify `additionalProperties`.
pub fn sanitize_schema(schema: Value) -> Value {
    let schema = remove_forbidden_keys(schema, false);
    let schema = sanitize_format_field(schema);
    sanitize_additional_properties(schema)
}

/// Forbidden keys are schema-level keywords; property names that happen to
/// collide with one (e.g. a field literally named "default") are left alone.
fn remove_forbidden_keys(value: Value, inside_properties: bool) -> Value {
    match value {
        Value::Object(mut map) => {
            if !inside_properties {
                map.retain(|k, _| !FORBIDDEN_KEYS.contains(&k.as_str()));
            }
            for (key, v) in map.iter_mut() {
                let entering_properties = key == "properties" || key == "items";
                *v = remove_forbidden_keys(v.clone(), entering_properties);
            }
            Value::Object(map)
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(|v| remove_forbidden_keys(v, inside_properties)).collect()),
        other => other,
    }
}

fn sanitize_format_field(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            if let Some(format_str) = map.get("format").and_then(|v| v.as_str()) {
                if format_str != "enum" && format_str != "date-time" {
                    debug!(format = format_str, "removing unsupported schema format");
                    map.remove("format");
                }
            }
            for (_, v) in map.iter_mut() {
                *v = sanitize_format_field(v.clone());
            }
            Value::Object(map)
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(sanitize_format_field).collect()),
        other => other,
    }
}

fn sanitize_additional_properties(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            if let Some(obj) = map.get("additionalProperties").and_then(|v| v.as_object()) {
                if obj.is_empty() {
                    map.insert("additionalProperties".to_string(), Value::Bool(false));
                } else if !(obj.len() == 1 && obj.contains_key("type")) {
                    map.insert("additionalProperties".to_string(), Value::Bool(true));
                }
            }
            for (_, v) in map.iter_mut() {
                *v = sanitize_additional_properties(v.clone());
            }
            Value::Object(map)
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(sanitize_additional_properties).collect()),
        other => other,
    }
}
