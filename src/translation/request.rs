// Request translation: OpenAI Chat Completions -> upstream CloudCode
// `generateContent` shape. Generalized from a single-provider message
// walker (role mapping, system-instruction extraction, tool-call/result
// round-tripping) to the OpenAI message shape this ingress actually accepts.

use std::collections::HashMap;

use serde_json::Value;

use crate::config::DefaultsConfig;
use crate::error::{ProxyError, Result};
use crate::models::openai::{ChatCompletionRequest, StopSequences};
use crate::models::upstream::{
    Content, FunctionCall, FunctionResponse, GenerateContentRequest, GenerationConfig, Part,
    SystemInstruction,
};

use super::tools::translate_tools;

/// Splits the `<id>::<signature>` encoding the streaming transformer uses to
/// carry a `thoughtSignature` through the OpenAI `tool_calls[].id` field, so
/// it can be restored when the assistant turn is echoed back on a later
/// request in the same conversation.
fn split_signature(id: &str) -> (String, Option<String>) {
    match id.split_once("::") {
        Some((base, sig)) => (base.to_string(), Some(sig.to_string())),
        None => (id.to_string(), None),
    }
}

pub fn translate_request(req: &ChatCompletionRequest, defaults: &DefaultsConfig) -> Result<GenerateContentRequest> {
    if req.messages.is_empty() {
        return Err(ProxyError::Validation("messages must not be empty".to_string()));
    }

    let mut system_parts: Vec<Part> = Vec::new();
    let mut contents: Vec<Content> = Vec::new();
    let mut call_id_to_name: HashMap<String, String> = HashMap::new();

    for msg in &req.messages {
        match msg.role.as_str() {
            "system" => {
                let text = msg.text();
                if !text.is_empty() {
                    system_parts.push(Part::text(text));
                }
            }
            "user" => {
                contents.push(Content { role: "user".to_string(), parts: vec![Part::text(msg.text())] });
            }
            "assistant" => {
                let mut parts = Vec::new();
                let text = msg.text();
                if !text.is_empty() {
                    parts.push(Part::text(text));
                }
                if let Some(tool_calls) = &msg.tool_calls {
                    for call in tool_calls {
                        call_id_to_name.insert(call.id.clone(), call.function.name.clone());
                        let (base_id, thought_signature) = split_signature(&call.id);
                        let args: Value = serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| serde_json::json!({}));
                        parts.push(Part::FunctionCall {
                            function_call: FunctionCall { id: Some(base_id), name: call.function.name.clone(), args },
                            thought_signature,
                        });
                    }
                }
                if parts.is_empty() {
                    parts.push(Part::text(String::new()));
                }
                contents.push(Content { role: "model".to_string(), parts });
            }
            "tool" => {
                let tool_call_id = msg
                    .tool_call_id
                    .clone()
                    .ok_or_else(|| ProxyError::Validation("tool message missing tool_call_id".to_string()))?;
                let (base_id, _) = split_signature(&tool_call_id);
                let name = msg
                    .name
                    .clone()
                    .or_else(|| call_id_to_name.get(&tool_call_id).cloned())
                    .unwrap_or_else(|| base_id.clone());
                let text = msg.text();
                let response = serde_json::from_str(&text).unwrap_or_else(|_| serde_json::json!({"result": text}));
                contents.push(Content {
                    role: "user".to_string(),
                    parts: vec![Part::FunctionResponse {
                        function_response: FunctionResponse { id: Some(base_id), name, response },
                    }],
                });
            }
            other => return Err(ProxyError::Validation(format!("unsupported message role: {other}"))),
        }
    }

    let system_instruction = if system_parts.is_empty() { None } else { Some(SystemInstruction { parts: system_parts }) };

    let stop_sequences = req.stop.as_ref().map(|s| match s {
        StopSequences::One(s) => vec![s.clone()],
        StopSequences::Many(v) => v.clone(),
    });

    let generation_config = GenerationConfig {
        max_output_tokens: Some(req.max_tokens.unwrap_or(defaults.max_tokens)),
        temperature: Some(req.temperature.unwrap_or(defaults.temperature)),
        top_p: Some(req.top_p.unwrap_or(defaults.top_p)),
        top_k: Some(defaults.top_k),
        stop_sequences,
        candidate_count: None,
    };

    let tools = req.tools.as_ref().map(|t| translate_tools(t)).filter(|v| !v.is_empty());

    Ok(GenerateContentRequest {
        contents,
        system_instruction,
        generation_config: Some(generation_config),
        tools,
        tool_config: None,
        cached_content: None,
    })
}
