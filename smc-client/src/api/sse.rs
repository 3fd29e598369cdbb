//! Server-Sent Events decoding
//!
//! Turns the chunked body of a `text/event-stream` response into discrete
//! frames. Chunk boundaries may fall anywhere, including inside a UTF-8
//! sequence or between `\r` and `\n`.

use futures::stream::{BoxStream, StreamExt};

use crate::error::{ClientError, ClientResult};

/// One dispatched SSE event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Event name (`message` when the server sent none)
    pub event: String,
    /// Data lines joined with `\n`
    pub data: String,
    pub id: Option<String>,
}

/// Stream of decoded frames from one push channel
pub type SseStream = BoxStream<'static, ClientResult<SseFrame>>;

/// Incremental line-oriented SSE decoder
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    last_id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every frame completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing event the server did not terminate with a blank line
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            let line = String::from_utf8_lossy(&rest).into_owned();
            let line = line.trim_end_matches('\r').to_string();
            if let Some(frame) = self.process_line(&line) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            // comment / heartbeat
            return None;
        }

        let (field, value) = match line.find(':') {
            Some(i) => {
                let value = &line[i + 1..];
                (&line[..i], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.last_id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if self.event.is_none() && self.data.is_empty() {
            return None;
        }
        let frame = SseFrame {
            event: self
                .event
                .take()
                .unwrap_or_else(|| "message".to_string()),
            data: self.data.join("\n"),
            id: self.last_id.clone(),
        };
        self.data.clear();
        Some(frame)
    }
}

/// Decode a streaming HTTP response body into SSE frames
pub fn frame_stream(response: reqwest::Response) -> SseStream {
    let stream = async_stream::try_stream! {
        let mut decoder = SseDecoder::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| ClientError::Transport(e.to_string()))?;
            for frame in decoder.push(&chunk) {
                yield frame;
            }
        }
        if let Some(frame) = decoder.finish() {
            yield frame;
        }
    };
    stream.boxed()
}
