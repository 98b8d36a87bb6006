//! `text/event-stream` 解碼器。
//!
//! 事件之間以 `\r\n\r\n` 分隔；每個事件可有一行 `event: <name>`，以及一或多行
//! `data: <片段>`，片段以換行串接成完整內容。

use serde_json::Value;

use crate::agent::error::Result;

const EVENT_SEPARATOR: &[u8] = b"\r\n\r\n";
const EVENT_PREFIX: &str = "event: ";
const DATA_PREFIX: &str = "data: ";

/// 未指定事件名稱時的預設事件。
pub const DEFAULT_EVENT: &str = "message";

/// 解碼後的一個伺服器事件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSentEvent {
    pub event: Option<String>,
    pub data: String,
}

impl ServerSentEvent {
    /// 事件名稱，未指定時為 `message`。
    pub fn name(&self) -> &str {
        self.event.as_deref().unwrap_or(DEFAULT_EVENT)
    }

    /// 具名事件的內容視為 JSON；預設事件的內容保留為字串。
    pub fn payload(&self) -> Result<SsePayload> {
        let data = match &self.event {
            Some(_) => serde_json::from_str(&self.data)?,
            None => Value::String(self.data.clone()),
        };
        Ok(SsePayload {
            event: self.name().to_string(),
            data,
        })
    }

    /// 解析單一事件區塊。
    pub fn parse(block: &str) -> Self {
        let mut lines = block.split("\r\n").peekable();
        let event = lines
            .peek()
            .and_then(|first| first.strip_prefix(EVENT_PREFIX))
            .map(str::to_string);
        let data = lines
            .filter_map(|line| line.strip_prefix(DATA_PREFIX))
            .collect::<Vec<_>>()
            .join("\n");
        Self { event, data }
    }
}

/// 事件名稱與已解析的內容。
#[derive(Debug, Clone, PartialEq)]
pub struct SsePayload {
    pub event: String,
    pub data: Value,
}

/// 累積任意切割的位元組區塊並產生完整事件。
///
/// 區塊邊界不必與事件邊界對齊；不完整的尾端會保留到下一個區塊或 [`finish`](Self::finish)。
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入一個區塊，回傳其中所有已完整的事件。
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ServerSentEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = find_separator(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..pos + EVENT_SEPARATOR.len()).collect();
            if let Some(event) = decode_block(&block[..pos]) {
                events.push(event);
            }
        }
        events
    }

    /// 串流結束時盡力解析沒有結尾分隔符號的最後一個事件。
    pub fn finish(&mut self) -> Option<ServerSentEvent> {
        let rest = std::mem::take(&mut self.buffer);
        let trimmed = rest
            .strip_suffix(b"\r\n")
            .unwrap_or(&rest);
        decode_block(trimmed)
    }

    /// 一次解碼完整的位元組內容。
    pub fn decode_all(bytes: &[u8]) -> Vec<ServerSentEvent> {
        let mut decoder = Self::new();
        let mut events = decoder.push(bytes);
        events.extend(decoder.finish());
        events
    }
}

fn find_separator(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(EVENT_SEPARATOR.len())
        .position(|window| window == EVENT_SEPARATOR)
}

/// 空白區塊不構成事件。
fn decode_block(block: &[u8]) -> Option<ServerSentEvent> {
    if block.iter().all(|b| b.is_ascii_whitespace()) {
        return None;
    }
    Some(ServerSentEvent::parse(&String::from_utf8_lossy(block)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn decodes_named_and_default_events() {
        let events = EventStreamDecoder::decode_all(
            b"event: metadata\r\ndata: {\"a\":1}\r\n\r\nevent: message\r\ndata: hi\r\n\r\n",
        );
        let payloads: Vec<_> = events.iter().map(|e| e.payload().unwrap()).collect();
        assert_eq!(
            payloads,
            vec![
                SsePayload {
                    event: "metadata".into(),
                    data: json!({"a": 1})
                },
                SsePayload {
                    event: "message".into(),
                    data: json!("hi")
                },
            ]
        );
    }

    #[test]
    fn joins_multiple_data_lines_with_newline() {
        let events = EventStreamDecoder::decode_all(b"data: line one\r\ndata: line two\r\n\r\n");
        assert_eq!(
            events,
            vec![ServerSentEvent {
                event: None,
                data: "line one\nline two".into()
            }]
        );
        assert_eq!(events[0].name(), "message");
    }

    #[test]
    fn tolerates_event_without_data() {
        let events = EventStreamDecoder::decode_all(b"event: ping\r\n\r\n");
        assert_eq!(
            events,
            vec![ServerSentEvent {
                event: Some("ping".into()),
                data: String::new()
            }]
        );
    }

    #[test]
    fn parses_trailing_event_without_separator() {
        let events = EventStreamDecoder::decode_all(b"data: a\r\n\r\ndata: b");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].data, "b");
    }

    #[test]
    fn reassembles_events_across_chunk_boundaries() {
        let raw = "event: status\r\ndata: {\"action\":\"x\"}\r\n\r\ndata: héllo\r\n\r\n".as_bytes();
        let mut decoder = EventStreamDecoder::new();
        let mut events = Vec::new();
        // 一次一個位元組，包含切開 UTF-8 字元與分隔符號的情況。
        for byte in raw {
            events.extend(decoder.push(std::slice::from_ref(byte)));
        }
        events.extend(decoder.finish());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name(), "status");
        assert_eq!(events[1].data, "héllo");
    }

    #[test]
    fn skips_empty_segments() {
        let events = EventStreamDecoder::decode_all(b"\r\n\r\ndata: x\r\n\r\n\r\n\r\n");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn named_event_with_invalid_json_fails_payload() {
        let event = ServerSentEvent::parse("event: metadata\r\ndata: {oops");
        assert!(event.payload().is_err());
    }
}
