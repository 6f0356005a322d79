// file: src/sse.rs
// description: incremental decoder for text/event-stream bodies
// reference: https://html.spec.whatwg.org/multipage/server-sent-events.html#parsing-an-event-stream

/// One dispatched server-sent message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Message name; `message` when the server sent no `event:` field.
    pub event: String,
    pub data: String,
    pub id: Option<String>,
    pub retry_ms: Option<u64>,
}

/// Feeds raw body chunks in, gets complete frames out. Chunks may split
/// lines (and UTF-8 sequences) anywhere.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    // A chunk ended on '\r'; a leading '\n' in the next chunk belongs to it.
    skip_lf: bool,
    event: Option<String>,
    data: Vec<String>,
    last_event_id: Option<String>,
    retry_ms: Option<u64>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last `id:` value seen on the stream, kept across frames.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        // An empty chunk must not consume a pending `\r\n` half.
        if chunk.is_empty() {
            return Vec::new();
        }

        let mut frames = Vec::new();
        let mut start = 0;
        let mut i = 0;

        if self.skip_lf && chunk.first() == Some(&b'\n') {
            start = 1;
            i = 1;
        }
        self.skip_lf = false;

        while i < chunk.len() {
            match chunk[i] {
                b'\n' | b'\r' => {
                    self.pending.extend_from_slice(&chunk[start..i]);
                    let line = std::mem::take(&mut self.pending);
                    if let Some(frame) = self.process_line(&line) {
                        frames.push(frame);
                    }

                    if chunk[i] == b'\r' {
                        match chunk.get(i + 1) {
                            Some(&b'\n') => i += 1,
                            None => self.skip_lf = true,
                            Some(_) => {}
                        }
                    }
                    start = i + 1;
                }
                _ => {}
            }
            i += 1;
        }

        self.pending.extend_from_slice(&chunk[start..]);
        frames
    }

    fn process_line(&mut self, raw: &[u8]) -> Option<SseFrame> {
        if raw.is_empty() {
            return self.dispatch();
        }

        let line = String::from_utf8_lossy(raw);
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.find(':') {
            Some(idx) => {
                let value = &line[idx + 1..];
                (&line[..idx], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (&*line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => {
                if !value.contains('\0') {
                    self.last_event_id = Some(value.to_string());
                }
            }
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry_ms = Some(ms);
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }

        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame {
            event: event
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "message".to_string()),
            data,
            id: self.last_event_id.clone(),
            retry_ms: self.retry_ms,
        })
    }
}
