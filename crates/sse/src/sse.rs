use std::fmt::{self, Display};

use crate::{Chunks, ChunksError};

/// Errors from reading an event stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The underlying body failed.
    ChunksError(ChunksError),
    /// The stream is not valid UTF-8 or contains an unknown field.
    InvalidPayload,
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ChunksError(err) => Display::fmt(err, f),
            Error::InvalidPayload => write!(f, "invalid event stream payload"),
        }
    }
}

impl std::error::Error for Error {}

/// One dispatched event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field, if the server set one.
    pub event: Option<String>,
    /// All `data:` lines joined by line feeds.
    pub data: String,
    /// The `id:` field, if any.
    pub id: Option<String>,
}

/// A type for reading server-sent events from a chunk stream.
pub struct Sse {
    buf: Vec<u8>,
    chunks: Chunks,
}

impl Sse {
    /// Creates a reader over `chunks`.
    #[inline]
    pub fn new(chunks: Chunks) -> Self {
        Self {
            buf: Vec::new(),
            chunks,
        }
    }

    /// Returns the next event, or `None` once the stream has ended.
    ///
    /// Bytes left in the buffer without a terminating blank line when the
    /// stream ends are discarded.
    pub async fn next_event(&mut self) -> Result<Option<SseEvent>, Error> {
        loop {
            // Parse what we already have before reading more, an event may
            // have arrived together with the previous one.
            if let Some(event) = self.try_parse_event()? {
                return Ok(Some(event));
            }

            let Some(bytes) =
                self.chunks.next_chunk().await.map_err(Error::ChunksError)?
            else {
                return Ok(None);
            };
            self.buf.extend_from_slice(&bytes);
        }
    }

    fn try_parse_event(&mut self) -> Result<Option<SseEvent>, Error> {
        loop {
            // For `end-of-line`, we handle line feed and cr lf.
            //
            // event         = *( comment / field ) end-of-line
            // comment       = colon *any-char end-of-line
            // field         = 1*name-char [ colon [ space ] *any-char ] end-of-line
            let Some((block_end, sep_len)) = find_blank_line(&self.buf) else {
                return Ok(None);
            };
            let block = self.buf.drain(..block_end + sep_len).collect::<Vec<_>>();
            let Ok(block) = str::from_utf8(&block[..block_end]) else {
                return Err(Error::InvalidPayload);
            };

            let mut event = SseEvent::default();
            let mut has_field = false;
            let mut data_lines: Vec<&str> = vec![];
            for line in block.lines() {
                if line.starts_with(':') {
                    continue;
                }
                let (name, value) = match line.split_once(':') {
                    Some((name, value)) => {
                        (name, value.strip_prefix(' ').unwrap_or(value))
                    }
                    None => (line, ""),
                };
                match name {
                    "data" => data_lines.push(value),
                    "event" => event.event = Some(value.to_owned()),
                    "id" => event.id = Some(value.to_owned()),
                    "retry" => {}
                    _ => return Err(Error::InvalidPayload),
                }
                has_field = true;
            }

            if !has_field {
                // Comments only, usually a keep-alive.
                continue;
            }
            event.data = data_lines.join("\n");
            return Ok(Some(event));
        }
    }
}

fn find_blank_line(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|idx| (idx, 2));
    let crlf = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|idx| (idx, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn sse_from(chunks: &[&'static [u8]]) -> Sse {
        Sse::new(Chunks::from_vec_deque(
            chunks.iter().map(|c| Bytes::from_static(c)).collect(),
        ))
    }

    fn data(s: &str) -> SseEvent {
        SseEvent {
            data: s.to_owned(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_normal_events() {
        let mut sse = sse_from(&[b"data: hello\n\n", b"data: bye\n\n"]);
        assert_eq!(sse.next_event().await.unwrap().unwrap(), data("hello"));
        assert_eq!(sse.next_event().await.unwrap().unwrap(), data("bye"));
        assert_eq!(sse.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_quirk_streaming() {
        let mut sse = sse_from(&[b"data:", b" hello\n", b"\n"]);
        assert_eq!(sse.next_event().await.unwrap().unwrap(), data("hello"));
        assert_eq!(sse.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_events_in_one_chunk() {
        let mut sse = sse_from(&[b"data: a\n\ndata: b\n\n"]);
        assert_eq!(sse.next_event().await.unwrap().unwrap(), data("a"));
        assert_eq!(sse.next_event().await.unwrap().unwrap(), data("b"));
        assert_eq!(sse.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_named_events_and_comments() {
        let mut sse = sse_from(&[
            b": keep-alive\n\n",
            b"event: endpoint\r\ndata: /messages?session_id=1\r\n\r\n",
            b"event: message\nid: 7\ndata: {\"a\":\ndata: 1}\n\n",
        ]);
        let event = sse.next_event().await.unwrap().unwrap();
        assert_eq!(event.event.as_deref(), Some("endpoint"));
        assert_eq!(event.data, "/messages?session_id=1");

        let event = sse.next_event().await.unwrap().unwrap();
        assert_eq!(event.event.as_deref(), Some("message"));
        assert_eq!(event.id.as_deref(), Some("7"));
        assert_eq!(event.data, "{\"a\":\n1}");
    }

    #[tokio::test]
    async fn test_split_utf8() {
        let text = "data: 你好\n\n".as_bytes();
        let (head, tail) = text.split_at(8);
        let head: &'static [u8] = Box::leak(head.to_vec().into_boxed_slice());
        let tail: &'static [u8] = Box::leak(tail.to_vec().into_boxed_slice());
        let mut sse = sse_from(&[head, tail]);
        assert_eq!(sse.next_event().await.unwrap().unwrap(), data("你好"));
    }

    #[tokio::test]
    async fn test_invalid_data() {
        let mut sse = sse_from(&[b"xxxxxx\n\n"]);
        assert_eq!(sse.next_event().await.unwrap_err(), Error::InvalidPayload);

        let mut sse = sse_from(&[b"xxxxxx\n"]);
        assert_eq!(sse.next_event().await.unwrap(), None);

        let mut sse = sse_from(&[b"data: hello\n", b"data: bye\n"]);
        assert_eq!(sse.next_event().await.unwrap(), None);
    }
}
