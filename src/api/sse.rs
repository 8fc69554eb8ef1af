//! Incremental decoder for `text/event-stream` bodies.
//!
//! Chunks may split lines (and UTF-8 sequences) anywhere, so bytes are buffered
//! until a full line is available. An empty line dispatches the pending event.

use futures::stream::{self, BoxStream, Stream, StreamExt};

use super::ApiError;

/// Upper bound on a single buffered line or event payload (1MB).
const MAX_EVENT_SIZE: usize = 1024 * 1024;

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
    event: Option<String>,
    id: Option<String>,
}

impl SseDecoder {
    /// Feed a chunk of bytes and return every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, ApiError> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(event) = self.process_line(line)? {
                events.push(event);
            }
        }

        if self.buffer.len() > MAX_EVENT_SIZE {
            return Err(ApiError::ResponseTooLarge);
        }
        Ok(events)
    }

    fn process_line(&mut self, line: &str) -> Result<Option<SseEvent>, ApiError> {
        if line.is_empty() {
            return Ok(self.dispatch());
        }
        if line.starts_with(':') {
            // Keepalive comment
            return Ok(None);
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => {
                let pending: usize = self.data.iter().map(String::len).sum();
                if pending.saturating_add(value.len()) > MAX_EVENT_SIZE {
                    return Err(ApiError::ResponseTooLarge);
                }
                self.data.push(value.to_string());
            }
            "event" => self.event = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            // `retry` is a browser reconnection hint; reconnect timing is ours to decide.
            "retry" => {}
            other => tracing::trace!(field = %other, "Ignoring unknown SSE field"),
        }
        Ok(None)
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event,
            id: self.id.clone(),
            data,
        })
    }
}

/// Turn a byte stream into a stream of decoded events.
///
/// Decoding stops after the first error.
pub fn decode<S, B, E>(bytes: S) -> BoxStream<'static, Result<SseEvent, ApiError>>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + 'static,
    E: Into<ApiError> + 'static,
{
    let mut decoder = SseDecoder::default();
    let mut failed = false;

    bytes
        .map(move |chunk| {
            if failed {
                return Vec::new();
            }
            let decoded = match chunk {
                Ok(chunk) => decoder.feed(chunk.as_ref()),
                Err(e) => Err(e.into()),
            };
            match decoded {
                Ok(events) => events.into_iter().map(Ok).collect(),
                Err(e) => {
                    failed = true;
                    vec![Err(e)]
                }
            }
        })
        .flat_map(stream::iter)
        .boxed()
}
