//! Line-oriented `text/event-stream` reader.
//!
//! The agent endpoint sends one JSON payload per `data:` line. This module only
//! turns body bytes into those payload strings; decoding them is left to
//! [`crate::events::decode_frame`].

use std::{collections::VecDeque, pin::Pin};

use futures_core::Stream;
use futures_util::{stream, StreamExt};
use reqwest::Response;

use crate::{
    errors::{Error, Result, TransportError},
    telemetry::StreamTelemetry,
};

/// Raw payloads of a stream, one per `data:` line.
pub(crate) type DataStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Incremental splitter that keeps partial lines (and partial UTF-8
/// sequences) across chunk boundaries.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append a chunk and return the payload of every complete `data:` line.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(idx) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=idx).collect();
            if let Some(data) = parse_line(&line[..line.len() - 1]) {
                out.push(data);
            }
        }
        out
    }

    /// Flush a trailing line that was not newline-terminated.
    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        if rest.is_empty() {
            return None;
        }
        parse_line(&rest)
    }
}

fn parse_line(raw: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches('\r');
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    // `event:`, `id:` and `retry:` fields carry nothing this grammar uses.
    let rest = line.strip_prefix("data:")?;
    let rest = rest.strip_prefix(' ').unwrap_or(rest);
    Some(rest.to_string())
}

/// Stream the `data:` payloads of an HTTP response body.
pub(crate) fn data_stream(response: Response, telemetry: Option<StreamTelemetry>) -> DataStream {
    let body = Box::pin(response.bytes_stream());
    Box::pin(build_stream(body, telemetry))
}

/// Stream the `data:` payloads of an in-memory SSE body (tests and replays).
pub(crate) fn data_stream_from_text(text: impl Into<String>) -> DataStream {
    let bytes: Vec<u8> = text.into().into_bytes();
    let body = stream::iter(vec![Ok::<_, reqwest::Error>(bytes)]);
    Box::pin(build_stream(body, None))
}

fn build_stream<S, B>(
    body: S,
    telemetry: Option<StreamTelemetry>,
) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = std::result::Result<B, reqwest::Error>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = (
        body,
        LineBuffer::default(),
        VecDeque::<String>::new(),
        telemetry,
        false,
    );

    stream::unfold(state, |state| async move {
        let (mut body, mut lines, mut pending, telemetry, mut ended) = state;
        loop {
            if let Some(data) = pending.pop_front() {
                if let Some(t) = telemetry.as_ref() {
                    t.on_frame(&data);
                }
                return Some((Ok(data), (body, lines, pending, telemetry, ended)));
            }
            if ended {
                if let Some(t) = telemetry.as_ref() {
                    t.on_closed();
                }
                return None;
            }
            match body.next().await {
                Some(Ok(chunk)) => {
                    pending.extend(lines.push(chunk.as_ref()));
                }
                Some(Err(err)) => {
                    let error = Error::Transport(TransportError::from_reqwest(err));
                    if let Some(t) = telemetry.as_ref() {
                        t.on_error(&error);
                    }
                    ended = true;
                    return Some((Err(error), (body, lines, pending, telemetry, ended)));
                }
                None => {
                    pending.extend(lines.finish());
                    ended = true;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_data_lines_and_ignores_other_fields() {
        let mut buf = LineBuffer::default();
        let out = buf.push(b"event: message\ndata: {\"a\":1}\n\n: keepalive\nid: 7\ndata:{\"b\":2}\r\n");
        assert_eq!(out, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
        assert!(buf.finish().is_none());
    }

    #[test]
    fn keeps_partial_lines_across_chunks() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"data: {\"content\":\"he").is_empty());
        let out = buf.push(b"llo\"}\n");
        assert_eq!(out, vec!["{\"content\":\"hello\"}".to_string()]);
    }

    #[test]
    fn multibyte_characters_survive_chunk_splits() {
        let line = "data: {\"content\":\"结果\"}\n".as_bytes();
        // Split inside the first CJK character.
        let cut = line.iter().position(|b| *b > 0x7f).unwrap() + 1;
        let mut buf = LineBuffer::default();
        assert!(buf.push(&line[..cut]).is_empty());
        let out = buf.push(&line[cut..]);
        assert_eq!(out, vec!["{\"content\":\"结果\"}".to_string()]);
    }

    #[test]
    fn flushes_unterminated_last_line() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"data: [DONE]").is_empty());
        assert_eq!(buf.finish().as_deref(), Some("[DONE]"));
    }

    #[tokio::test]
    async fn in_memory_stream_yields_payloads_in_order() {
        let mut stream = data_stream_from_text("data: one\n\ndata: two\n\ndata: three");
        let mut seen = Vec::new();
        while let Some(item) = stream.next().await {
            seen.push(item.unwrap());
        }
        assert_eq!(seen, vec!["one", "two", "three"]);
    }
}
