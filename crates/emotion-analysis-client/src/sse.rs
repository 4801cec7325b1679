/// One dispatched server-sent event: optional event name plus joined data lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    /// A default (`message`) event carrying `data`.
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    /// A named event carrying `data`.
    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    /// Event name with the protocol default applied.
    pub fn event_name(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Line-oriented decoder that accepts arbitrary byte chunks.
///
/// Lines end in `\n`, `\r\n` or a lone `\r`; a blank line dispatches the
/// fields gathered since the previous one. Only `event` and `data` are kept.
#[derive(Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    after_cr: bool,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feeds `chunk` and returns every frame it completed.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        for &byte in chunk {
            let after_cr = std::mem::replace(&mut self.after_cr, byte == b'\r');
            match byte {
                b'\n' if after_cr => {}
                b'\n' | b'\r' => frames.extend(self.end_line()),
                _ => self.line.push(byte),
            }
        }
        frames
    }

    /// Ends the input. Returns the frame that was still being assembled when
    /// the peer closed without a trailing blank line, if it carries anything.
    pub fn finish(&mut self) -> Option<SseFrame> {
        self.after_cr = false;
        if !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            self.field(&line);
        }
        self.dispatch()
    }

    fn end_line(&mut self) -> Option<SseFrame> {
        if self.line.is_empty() {
            return self.dispatch();
        }
        let line = std::mem::take(&mut self.line);
        self.field(&line);
        None
    }

    fn field(&mut self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        // `: keep-alive` and friends
        if line.starts_with(':') {
            return;
        }
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_ref(), ""),
        };
        match name {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if event.is_none() && self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame { event, data })
    }
}
