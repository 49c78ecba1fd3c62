//! Incremental parser for a `text/event-stream` body.
//!
//! Chunks may split lines, and lines may split UTF-8 sequences, so bytes are
//! buffered until a full line is available.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

#[derive(Debug, Default)]
pub struct SseParser {
    pending: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseParser {
    /// Feeds a chunk and returns every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.pending.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(end) = self.pending.iter().position(|byte| *byte == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                frames.extend(self.dispatch());
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                "id" => self.id = Some(value.to_string()),
                _ => {}
            }
        }

        frames
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let id = self.id.take();
        if self.data.is_empty() {
            return None;
        }
        Some(SseFrame {
            event: event.unwrap_or_else(|| "message".to_string()),
            data: std::mem::take(&mut self.data).join("\n"),
            id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_frames_split_across_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.push(b"event: mess").is_empty());
        assert!(parser.push(b"age\ndata: {\"a\":1}\n").is_empty());

        let frames = parser.push(b"id: 4\n\nevent: presence\ndata: x\n\n");
        assert_eq!(
            frames,
            vec![
                SseFrame {
                    event: "message".into(),
                    data: "{\"a\":1}".into(),
                    id: Some("4".into()),
                },
                SseFrame {
                    event: "presence".into(),
                    data: "x".into(),
                    id: None,
                },
            ]
        );
    }

    #[test]
    fn keep_alive_comments_produce_nothing() {
        let mut parser = SseParser::default();
        assert!(parser.push(b":keep-alive\n\n").is_empty());
    }

    #[test]
    fn multi_line_data_and_crlf() {
        let mut parser = SseParser::default();
        let frames = parser.push(b"data: one\r\ndata: two\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "one\ntwo");
        assert_eq!(frames[0].event, "message");
    }

    #[test]
    fn utf8_split_between_chunks_survives() {
        let bytes = "data: héllo\n\n".as_bytes();
        let split = bytes.iter().position(|b| *b == 0xC3).unwrap() + 1;

        let mut parser = SseParser::default();
        assert!(parser.push(&bytes[..split]).is_empty());
        let frames = parser.push(&bytes[split..]);
        assert_eq!(frames[0].data, "héllo");
    }
}
