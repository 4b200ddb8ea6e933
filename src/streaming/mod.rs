// SSE transformer: consumes the upstream byte stream, emits structured
// events, and tolerates two independent fragmentations — a UTF-8 chunk
// splitting an SSE line mid-way, and a `<think>`/`</think>` marker spanning
// two payloads. Combines a tag-splitter state machine with raw SSE
// line-buffer accumulation, re-targeted at OpenAI-shaped output.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tracing::warn;

use crate::error::{ProxyError, Result};
use crate::models::upstream::{GenerateContentResponse, Part};

/// One structured item produced while consuming the upstream stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Text(String),
    Thinking(String),
    ToolCalls(Vec<ToolCallRecord>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    Thinking,
}

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

/// Two-mode (`normal`/`thinking`) state machine over a growing text buffer.
/// Holds back the trailing `len(tag) - 1` characters in whichever mode is
/// active, so a tag split across two chunks is never misread as plain text.
struct TagSplitter {
    mode: Mode,
    buffer: String,
}

impl TagSplitter {
    fn new() -> Self {
        Self { mode: Mode::Normal, buffer: String::new() }
    }

    /// Append `text`, run the state machine, and return every segment that
    /// can be safely emitted now (holding back a fragment-sized tail).
    fn push(&mut self, text: &str) -> Vec<StreamEvent> {
        self.buffer.push_str(text);
        let mut out = Vec::new();

        loop {
            match self.mode {
                Mode::Normal => {
                    if let Some(idx) = self.buffer.find(OPEN_TAG) {
                        let content = self.buffer[..idx].to_string();
                        if !content.is_empty() {
                            out.push(StreamEvent::Text(content));
                        }
                        self.buffer = self.buffer[idx + OPEN_TAG.len()..].to_string();
                        self.mode = Mode::Thinking;
                    } else {
                        if let Some(flushed) = self.hold_back(OPEN_TAG.len() - 1) {
                            out.push(StreamEvent::Text(flushed));
                        }
                        break;
                    }
                }
                Mode::Thinking => {
                    if let Some(idx) = self.buffer.find(CLOSE_TAG) {
                        let content = self.buffer[..idx].to_string();
                        if !content.is_empty() {
                            out.push(StreamEvent::Thinking(content));
                        }
                        self.buffer = self.buffer[idx + CLOSE_TAG.len()..].to_string();
                        self.mode = Mode::Normal;
                    } else {
                        if let Some(flushed) = self.hold_back(CLOSE_TAG.len() - 1) {
                            out.push(StreamEvent::Thinking(flushed));
                        }
                        break;
                    }
                }
            }
        }

        out
    }

    /// Flush everything but the trailing `keep` characters of the buffer,
    /// returning `None` if there's nothing past that tail to flush yet.
    fn hold_back(&mut self, keep: usize) -> Option<String> {
        let total_chars = self.buffer.chars().count();
        if total_chars <= keep {
            return None;
        }
        let split_at = total_chars - keep;
        let byte_idx = self.buffer.char_indices().nth(split_at).map(|(i, _)| i).unwrap_or(self.buffer.len());
        let flushed = self.buffer[..byte_idx].to_string();
        self.buffer = self.buffer[byte_idx..].to_string();
        if flushed.is_empty() { None } else { Some(flushed) }
    }

    /// Flush the entire buffer, regardless of tag-fragmentation risk, as
    /// whichever type matches the current mode. Used both when a `thought`
    /// part interrupts in-flight plain text and at stream end.
    fn flush_all(&mut self) -> Option<StreamEvent> {
        if self.buffer.is_empty() {
            return None;
        }
        let buffered = std::mem::take(&mut self.buffer);
        Some(match self.mode {
            Mode::Normal => StreamEvent::Text(buffered),
            Mode::Thinking => StreamEvent::Thinking(buffered),
        })
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Consume an upstream SSE byte stream, driving `on_event` for every
/// structured item produced. Tolerant of a chunk boundary landing mid-line;
/// intolerant of malformed transport (surfaced as `ProxyError::StreamError`).
pub async fn transform_stream<S>(
    byte_stream: S,
    mut on_event: impl FnMut(StreamEvent) + Send,
) -> Result<()>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send,
{
    let mut line_buffer: Vec<u8> = Vec::new();
    let mut splitter = TagSplitter::new();
    let mut pending_tool_calls: Vec<ToolCallRecord> = Vec::new();
    let mut seq: u64 = 0;

    futures::pin_mut!(byte_stream);
    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(|e| ProxyError::StreamError(format!("transport error mid-stream: {e}")))?;
        line_buffer.extend_from_slice(&chunk);

        while let Some(pos) = line_buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = line_buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches(['\r', '\n']);
            process_line(line, &mut splitter, &mut pending_tool_calls, &mut seq, &mut on_event)?;
        }
    }

    if !line_buffer.is_empty() {
        let line = String::from_utf8_lossy(&line_buffer).into_owned();
        process_line(&line, &mut splitter, &mut pending_tool_calls, &mut seq, &mut on_event)?;
    }

    if let Some(event) = splitter.flush_all() {
        on_event(event);
    }

    Ok(())
}

fn process_line(
    line: &str,
    splitter: &mut TagSplitter,
    pending_tool_calls: &mut Vec<ToolCallRecord>,
    seq: &mut u64,
    on_event: &mut impl FnMut(StreamEvent),
) -> Result<()> {
    let Some(data) = line.strip_prefix("data: ") else { return Ok(()) };
    if data.trim().is_empty() {
        return Ok(());
    }

    let parsed: GenerateContentResponse = match serde_json::from_str(data) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "skipping unparsable SSE data line");
            return Ok(());
        }
    };

    let Some(wrapper) = parsed.response else { return Ok(()) };

    for candidate in &wrapper.candidates {
        for part in &candidate.content.parts {
            match part {
                Part::Text { text, thought, thought_signature: _ } => {
                    if *thought == Some(true) {
                        if let Some(flushed) = splitter.flush_all() {
                            on_event(flushed);
                        }
                        on_event(StreamEvent::Thinking(text.clone()));
                    } else {
                        for event in splitter.push(text) {
                            on_event(event);
                        }
                    }
                }
                Part::FunctionCall { function_call, thought_signature } => {
                    *seq += 1;
                    let base_id = function_call
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("call_{}_{}", now_millis(), seq));
                    let id = match thought_signature {
                        Some(sig) => format!("{base_id}::{sig}"),
                        None => base_id,
                    };
                    let arguments = serde_json::to_string(&function_call.args).unwrap_or_else(|_| "{}".to_string());
                    pending_tool_calls.push(ToolCallRecord { id, name: function_call.name.clone(), arguments });
                }
                Part::FunctionResponse { .. } => {}
            }
        }

        if candidate.finish_reason.is_some() && !pending_tool_calls.is_empty() {
            on_event(StreamEvent::ToolCalls(std::mem::take(pending_tool_calls)));
        }
    }

    Ok(())
}

/// Honors `thinking.output` while folding a stream of events into the
/// non-streaming `{full_content, reasoning_content, tool_calls}` shape.
pub struct NonStreamCollector {
    output_mode: crate::config::ThinkingOutputMode,
    full_content: String,
    reasoning_content: String,
    tool_calls: Vec<ToolCallRecord>,
}

impl NonStreamCollector {
    pub fn new(output_mode: crate::config::ThinkingOutputMode) -> Self {
        Self {
            output_mode,
            full_content: String::new(),
            reasoning_content: String::new(),
            tool_calls: Vec::new(),
        }
    }

    pub fn push(&mut self, event: StreamEvent) {
        use crate::config::ThinkingOutputMode;
        match event {
            StreamEvent::Text(text) => self.full_content.push_str(&text),
            StreamEvent::Thinking(text) => match self.output_mode {
                ThinkingOutputMode::ReasoningContent => self.reasoning_content.push_str(&text),
                ThinkingOutputMode::Raw => self.full_content.push_str(&text),
                ThinkingOutputMode::Filter => {}
            },
            StreamEvent::ToolCalls(mut calls) => self.tool_calls.append(&mut calls),
        }
    }

    pub fn finish(self) -> CollectedResponse {
        CollectedResponse {
            full_content: self.full_content,
            reasoning_content: if self.reasoning_content.is_empty() { None } else { Some(self.reasoning_content) },
            tool_calls: self.tool_calls,
        }
    }
}

pub struct CollectedResponse {
    pub full_content: String,
    pub reasoning_content: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_splitter_simple_roundtrip() {
        let mut s = TagSplitter::new();
        let mut events = s.push("hello <think>reasoning</think> world");
        if let Some(e) = s.flush_all() {
            events.push(e);
        }
        assert_eq!(
            events,
            vec![
                StreamEvent::Text("hello ".to_string()),
                StreamEvent::Thinking("reasoning".to_string()),
                StreamEvent::Text(" world".to_string()),
            ]
        );
    }

    #[test]
    fn tag_splitter_open_tag_split_across_chunks() {
        let mut s = TagSplitter::new();
        let mut events = s.push("A<thi");
        events.extend(s.push("nk>B</think>C"));
        if let Some(e) = s.flush_all() {
            events.push(e);
        }
        assert_eq!(
            events,
            vec![
                StreamEvent::Text("A".to_string()),
                StreamEvent::Thinking("B".to_string()),
                StreamEvent::Text("C".to_string()),
            ]
        );
    }

    #[test]
    fn tag_splitter_close_tag_split_across_chunks() {
        let mut s = TagSplitter::new();
        let mut events = s.push("<think>reason</thi");
        events.extend(s.push("nk>done"));
        if let Some(e) = s.flush_all() {
            events.push(e);
        }
        assert_eq!(
            events,
            vec![StreamEvent::Thinking("reason".to_string()), StreamEvent::Text("done".to_string())]
        );
    }

    #[test]
    fn tag_splitter_holds_back_partial_tag_prefix() {
        let mut s = TagSplitter::new();
        // "<thi" alone could be the start of "<think>"; nothing should flush yet.
        let events = s.push("hello<thi");
        assert_eq!(events, vec![StreamEvent::Text("hel".to_string())]);
    }

    #[test]
    fn tag_splitter_never_drops_or_duplicates_balanced_tags() {
        // Property-style check across a handful of chunk splits of the same
        // balanced input: concatenation must equal the input with tags removed.
        let input = "before<think>middle thought</think>after<think>more</think>tail";
        let plain: String = input.replace("<think>", "").replace("</think>", "");

        for split_points in [vec![], vec![6], vec![6, 20], vec![3, 10, 15, 40]] {
            let mut s = TagSplitter::new();
            let mut rebuilt = String::new();
            let mut last = 0;
            for &p in &split_points {
                for event in s.push(&input[last..p]) {
                    match event {
                        StreamEvent::Text(t) | StreamEvent::Thinking(t) => rebuilt.push_str(&t),
                        _ => unreachable!(),
                    }
                }
                last = p;
            }
            for event in s.push(&input[last..]) {
                match event {
                    StreamEvent::Text(t) | StreamEvent::Thinking(t) => rebuilt.push_str(&t),
                    _ => unreachable!(),
                }
            }
            if let Some(event) = s.flush_all() {
                match event {
                    StreamEvent::Text(t) | StreamEvent::Thinking(t) => rebuilt.push_str(&t),
                    _ => unreachable!(),
                }
            }
            assert_eq!(rebuilt, plain, "mismatch for split points {:?}", split_points);
        }
    }

    #[tokio::test]
    async fn transform_stream_emits_text_and_finish() {
        let body = "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hello\"}]},\"finishReason\":\"STOP\"}]}}\n\n";
        let stream = futures::stream::once(async move { Ok(Bytes::from(body)) });

        let mut events = Vec::new();
        transform_stream(stream, |e| events.push(e)).await.unwrap();

        assert_eq!(events, vec![StreamEvent::Text("Hello".to_string())]);
    }

    #[tokio::test]
    async fn transform_stream_collects_tool_call_and_emits_once_on_finish() {
        let body = "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"functionCall\":{\"name\":\"lookup\",\"args\":{\"q\":\"x\"}}}]},\"finishReason\":\"STOP\"}]}}\n\n";
        let stream = futures::stream::once(async move { Ok(Bytes::from(body)) });

        let mut events = Vec::new();
        transform_stream(stream, |e| events.push(e)).await.unwrap();

        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::ToolCalls(calls) => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].name, "lookup");
                assert_eq!(calls[0].arguments, "{\"q\":\"x\"}");
            }
            other => panic!("expected tool calls, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transform_stream_tolerates_line_split_across_chunks() {
        let full = "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hi\"}]},\"finishReason\":\"STOP\"}]}}\n\n";
        let (first, second) = full.split_at(20);
        let chunks = vec![Ok(Bytes::from(first)), Ok(Bytes::from(second))];
        let stream = futures::stream::iter(chunks);

        let mut events = Vec::new();
        transform_stream(stream, |e| events.push(e)).await.unwrap();

        assert_eq!(events, vec![StreamEvent::Text("Hi".to_string())]);
    }

    #[test]
    fn non_stream_collector_routes_thinking_per_output_mode() {
        use crate::config::ThinkingOutputMode;

        let mut c = NonStreamCollector::new(ThinkingOutputMode::ReasoningContent);
        c.push(StreamEvent::Text("A".to_string()));
        c.push(StreamEvent::Thinking("B".to_string()));
        c.push(StreamEvent::Text("C".to_string()));
        let result = c.finish();
        assert_eq!(result.full_content, "AC");
        assert_eq!(result.reasoning_content, Some("B".to_string()));

        let mut raw = NonStreamCollector::new(ThinkingOutputMode::Raw);
        raw.push(StreamEvent::Text("A".to_string()));
        raw.push(StreamEvent::Thinking("B".to_string()));
        let result = raw.finish();
        assert_eq!(result.full_content, "AB");
        assert_eq!(result.reasoning_content, None);

        let mut filtered = NonStreamCollector::new(ThinkingOutputMode::Filter);
        filtered.push(StreamEvent::Text("A".to_string()));
        filtered.push(StreamEvent::Thinking("B".to_string()));
        let result = filtered.finish();
        assert_eq!(result.full_content, "A");
        assert_eq!(result.reasoning_content, None);
    }
}
