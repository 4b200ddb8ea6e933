// Response translation: upstream stream events -> OpenAI-shaped egress.
// Non-streaming responses fold a `CollectedResponse` into one
// `chat.completion`; streaming responses are assembled chunk-by-chunk by
// `StreamChunkEncoder`, keeping a stable `id`/`created` pair across the
// whole SSE sequence.

use crate::models::openai::{
    ChatCompletionChoice, ChatCompletionChunk, ChatCompletionResponse, ChunkChoice, ChunkDelta,
    ModelInfo, ModelListResponse, ResponseMessage, ToolCall, ToolCallFunction, Usage,
};
use crate::models::upstream::ModelsResponse;
use crate::streaming::{CollectedResponse, StreamEvent};

fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn to_tool_call(record: &crate::streaming::ToolCallRecord, index: Option<u32>) -> ToolCall {
    ToolCall {
        index,
        id: record.id.clone(),
        kind: "function".to_string(),
        function: ToolCallFunction { name: record.name.clone(), arguments: record.arguments.clone() },
    }
}

/// Build the single `chat.completion` response from a fully collected
/// stream. Non-streaming responses omit the per-call `index` field.
pub fn build_completion_response(model: &str, collected: CollectedResponse) -> ChatCompletionResponse {
    let finish_reason = if collected.tool_calls.is_empty() { "stop" } else { "tool_calls" };
    let tool_calls = if collected.tool_calls.is_empty() {
        None
    } else {
        Some(collected.tool_calls.iter().map(|r| to_tool_call(r, None)).collect())
    };

    ChatCompletionResponse {
        id: completion_id(),
        object: "chat.completion",
        created: now_secs(),
        model: model.to_string(),
        choices: vec![ChatCompletionChoice {
            index: 0,
            message: ResponseMessage {
                role: "assistant",
                content: if collected.full_content.is_empty() { None } else { Some(collected.full_content) },
                reasoning_content: collected.reasoning_content,
                tool_calls,
            },
            finish_reason,
        }],
        usage: Usage::default(),
    }
}

pub fn build_model_list(models: ModelsResponse) -> ModelListResponse {
    let created = now_secs();
    let mut ids: Vec<String> = models.models.into_keys().collect();
    ids.sort();
    ModelListResponse {
        object: "list",
        data: ids
            .into_iter()
            .map(|id| ModelInfo { id, object: "model", created, owned_by: "google" })
            .collect(),
    }
}

/// Assembles the `chat.completion.chunk` sequence for one request, keeping a
/// stable `id`/`created`/`model` across every chunk and assigning sequential
/// `tool_calls[].index` values the way the OpenAI streaming shape requires.
pub struct StreamChunkEncoder {
    id: String,
    created: i64,
    model: String,
    next_tool_call_index: u32,
    any_tool_calls: bool,
    thinking_output: crate::config::ThinkingOutputMode,
}

impl StreamChunkEncoder {
    pub fn new(model: &str, thinking_output: crate::config::ThinkingOutputMode) -> Self {
        Self {
            id: completion_id(),
            created: now_secs(),
            model: model.to_string(),
            next_tool_call_index: 0,
            any_tool_calls: false,
            thinking_output,
        }
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<&'static str>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice { index: 0, delta, finish_reason }],
        }
    }

    pub fn role_chunk(&self) -> ChatCompletionChunk {
        self.chunk(ChunkDelta { role: Some("assistant"), ..Default::default() }, None)
    }

    /// Translate one structured stream event into its delta chunk. A tool
    /// calls event may carry several calls; each gets its own incrementing
    /// `index` even though they arrive inside a single stream event. Returns
    /// `None` when `thinking.output = "filter"` drops a thinking segment
    /// entirely, so no empty chunk reaches the client.
    pub fn event_chunk(&mut self, event: StreamEvent) -> Option<ChatCompletionChunk> {
        use crate::config::ThinkingOutputMode;
        match event {
            StreamEvent::Text(text) => Some(self.chunk(ChunkDelta { content: Some(text), ..Default::default() }, None)),
            StreamEvent::Thinking(text) => match self.thinking_output {
                ThinkingOutputMode::ReasoningContent => {
                    Some(self.chunk(ChunkDelta { reasoning_content: Some(text), ..Default::default() }, None))
                }
                ThinkingOutputMode::Raw => Some(self.chunk(ChunkDelta { content: Some(text), ..Default::default() }, None)),
                ThinkingOutputMode::Filter => None,
            },
            StreamEvent::ToolCalls(records) => {
                self.any_tool_calls = true;
                let calls = records
                    .iter()
                    .map(|r| {
                        let idx = self.next_tool_call_index;
                        self.next_tool_call_index += 1;
                        to_tool_call(r, Some(idx))
                    })
                    .collect();
                Some(self.chunk(ChunkDelta { tool_calls: Some(calls), ..Default::default() }, None))
            }
        }
    }

    pub fn finish_chunk(&self) -> ChatCompletionChunk {
        let finish_reason = if self.any_tool_calls { "tool_calls" } else { "stop" };
        self.chunk(ChunkDelta::default(), Some(finish_reason))
    }
}

pub fn chunk_to_sse(chunk: &ChatCompletionChunk) -> String {
    format!("data: {}\n\n", serde_json::to_string(chunk).unwrap_or_default())
}

pub const DONE_SSE: &str = "data: [DONE]\n\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::ToolCallRecord;

    #[test]
    fn non_stream_response_uses_stop_when_no_tool_calls() {
        let collected = CollectedResponse { full_content: "Hello".to_string(), reasoning_content: None, tool_calls: vec![] };
        let resp = build_completion_response("gemini-2.5-pro", collected);
        assert_eq!(resp.choices[0].finish_reason, "stop");
        assert_eq!(resp.choices[0].message.content, Some("Hello".to_string()));
        assert!(resp.choices[0].message.tool_calls.is_none());
    }

    #[test]
    fn non_stream_response_omits_tool_call_index() {
        let collected = CollectedResponse {
            full_content: String::new(),
            reasoning_content: None,
            tool_calls: vec![ToolCallRecord { id: "call_1".to_string(), name: "lookup".to_string(), arguments: "{}".to_string() }],
        };
        let resp = build_completion_response("gemini-2.5-pro", collected);
        assert_eq!(resp.choices[0].finish_reason, "tool_calls");
        let calls = resp.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].index, None);
    }

    #[test]
    fn stream_chunk_encoder_assigns_sequential_tool_call_indices() {
        let mut encoder = StreamChunkEncoder::new("gemini-2.5-pro", crate::config::ThinkingOutputMode::ReasoningContent);
        let chunk = encoder
            .event_chunk(StreamEvent::ToolCalls(vec![
                ToolCallRecord { id: "call_1".to_string(), name: "a".to_string(), arguments: "{}".to_string() },
                ToolCallRecord { id: "call_2".to_string(), name: "b".to_string(), arguments: "{}".to_string() },
            ]))
            .unwrap();
        let calls = chunk.choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].index, Some(0));
        assert_eq!(calls[1].index, Some(1));

        let finish = encoder.finish_chunk();
        assert_eq!(finish.choices[0].finish_reason, Some("tool_calls"));
    }

    #[test]
    fn stream_chunk_encoder_keeps_stable_id_across_chunks() {
        let mut encoder = StreamChunkEncoder::new("gemini-2.5-pro", crate::config::ThinkingOutputMode::ReasoningContent);
        let a = encoder.role_chunk();
        let b = encoder.event_chunk(StreamEvent::Text("hi".to_string())).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.created, b.created);
    }

    #[test]
    fn filter_mode_drops_thinking_chunks() {
        let mut encoder = StreamChunkEncoder::new("gemini-2.5-pro", crate::config::ThinkingOutputMode::Filter);
        assert!(encoder.event_chunk(StreamEvent::Thinking("secret".to_string())).is_none());
    }

    #[test]
    fn raw_mode_folds_thinking_into_content() {
        let mut encoder = StreamChunkEncoder::new("gemini-2.5-pro", crate::config::ThinkingOutputMode::Raw);
        let chunk = encoder.event_chunk(StreamEvent::Thinking("reasoning".to_string())).unwrap();
        assert_eq!(chunk.choices[0].delta.content, Some("reasoning".to_string()));
        assert!(chunk.choices[0].delta.reasoning_content.is_none());
    }
}
