//! Incremental Server-Sent Events decoder.
//!
//! Bytes arrive in arbitrary chunks; the decoder keeps partial lines between
//! calls and yields a frame for every blank-line terminated event block.

use crate::errors::StreamError;

/// Longest line the decoder buffers before failing the stream.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// One decoded event block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// Value of the `event:` field, if any.
    pub event: Option<String>,
    /// All `data:` lines joined with `\n`.
    pub data: String,
    /// Value of the `id:` field, if any.
    pub id: Option<String>,
}

impl SseFrame {
    /// Creates a named frame.
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
            id: None,
        }
    }

    /// Creates an unnamed frame (dispatched as `message`).
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
            id: None,
        }
    }

    /// Attaches a server event id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Event name, defaulting to `message` for unnamed frames.
    pub fn event_name(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

#[derive(Default)]
struct PendingFrame {
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl PendingFrame {
    fn take(&mut self) -> Option<SseFrame> {
        let pending = std::mem::take(self);
        if pending.event.is_none() && pending.data.is_empty() {
            return None;
        }
        Some(SseFrame {
            event: pending.event,
            data: pending.data.join("\n"),
            id: pending.id,
        })
    }
}

/// Chunk-boundary safe SSE decoder.
///
/// Lines may end in `\n`, `\r\n` or a bare `\r`.
pub struct SseDecoder {
    line: Vec<u8>,
    pending: PendingFrame,
    skip_lf: bool,
    max_line: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl SseDecoder {
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            line: Vec::new(),
            pending: PendingFrame::default(),
            skip_lf: false,
            max_line,
        }
    }

    /// Feeds one chunk and returns every frame completed by it.
    ///
    /// Fails once an unterminated line grows past the line limit; the
    /// decoder should not be used after that.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>, StreamError> {
        let mut frames = Vec::new();
        for &byte in chunk {
            if self.skip_lf {
                self.skip_lf = false;
                if byte == b'\n' {
                    continue;
                }
            }
            match byte {
                b'\n' => self.end_line(&mut frames),
                b'\r' => {
                    self.end_line(&mut frames);
                    self.skip_lf = true;
                }
                _ => {
                    if self.line.len() >= self.max_line {
                        return Err(StreamError::transport(format!(
                            "event stream line exceeds {} bytes",
                            self.max_line
                        )));
                    }
                    self.line.push(byte);
                }
            }
        }
        Ok(frames)
    }

    fn end_line(&mut self, frames: &mut Vec<SseFrame>) {
        let line = std::mem::take(&mut self.line);
        if line.is_empty() {
            if let Some(frame) = self.pending.take() {
                frames.push(frame);
            }
            return;
        }
        let line = String::from_utf8_lossy(&line);
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_ref(), ""),
        };
        match field {
            "event" => self.pending.event = Some(value.to_string()),
            "data" => self.pending.data.push(value.to_string()),
            "id" if !value.contains('\0') => self.pending.id = Some(value.to_string()),
            _ => {}
        }
    }
}
