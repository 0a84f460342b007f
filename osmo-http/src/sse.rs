//! Minimal server-sent-events parser for the client side.
//!
//! Feeds on raw response chunks and yields complete events. Handles events
//! split across chunk boundaries, `\r\n` line endings, multi-line `data:`
//! fields, and `:` comment lines (which some servers use as keepalives).

/// One parsed SSE event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    /// The `event:` field; `"message"` when absent.
    pub event: String,
    /// All `data:` lines joined with `\n`.
    pub data: String,
}

/// Incremental parser; push chunks, collect events.
#[derive(Default)]
pub struct SseParser {
    line_buf: Vec<u8>,
    event_name: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk, returning every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        for &byte in chunk {
            if byte != b'\n' {
                self.line_buf.push(byte);
                continue;
            }
            let mut line = std::mem::take(&mut self.line_buf);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.is_empty() {
                if let Some(event) = self.finish_event() {
                    events.push(event);
                }
                continue;
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if line.starts_with(':') {
                continue; // comment / keepalive
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line.as_str(), ""),
            };
            match field {
                "event" => self.event_name = Some(value.to_string()),
                "data" => self.data_lines.push(value.to_string()),
                _ => {} // id / retry / unknown fields ignored
            }
        }
        events
    }

    fn finish_event(&mut self) -> Option<SseEvent> {
        let name = self.event_name.take();
        let data_lines = std::mem::take(&mut self.data_lines);
        if data_lines.is_empty() {
            return None; // dispatch with no data is a no-op per the SSE spec
        }
        Some(SseEvent {
            event: name.unwrap_or_else(|| "message".to_string()),
            data: data_lines.join("\n"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_event() {
        let mut p = SseParser::new();
        let events = p.push(b"data: {\"x\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "{\"x\":1}");
    }

    #[test]
    fn split_across_chunks() {
        let mut p = SseParser::new();
        assert!(p.push(b"data: hel").is_empty());
        assert!(p.push(b"lo\n").is_empty());
        let events = p.push(b"\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn crlf_and_comments() {
        let mut p = SseParser::new();
        let events = p.push(b": keepalive\r\ndata: a\r\n\r\ndata: b\r\n\r\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "a");
        assert_eq!(events[1].data, "b");
    }

    #[test]
    fn named_event_and_multiline_data() {
        let mut p = SseParser::new();
        let events = p.push(b"event: sync\ndata: one\ndata: two\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "sync");
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn empty_dispatch_is_ignored() {
        let mut p = SseParser::new();
        assert!(p.push(b"\n\n\n").is_empty());
    }
}
