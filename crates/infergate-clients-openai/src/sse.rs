use bytes::{Buf, BytesMut};
use futures::{Stream, StreamExt, stream};
use infergate_core::{CoreError, LineStream};

/// Splits a byte stream into text lines. Bytes are buffered until a
/// newline arrives, so multi-byte characters split across reads survive.
#[derive(Debug, Default)]
pub struct SseLineDecoder {
    buf: BytesMut,
}

impl SseLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete line without its `\n` (and `\r`), if one is buffered.
    pub fn next_line(&mut self) -> Option<String> {
        let end = self.buf.iter().position(|byte| *byte == b'\n')?;
        let line = self.buf.split_to(end);
        self.buf.advance(1);
        Some(decode(&line))
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = self.buf.split();
        Some(decode(&rest))
    }
}

fn decode(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.strip_suffix('\r').unwrap_or(&text).to_string()
}

struct LineState<S> {
    bytes: S,
    decoder: SseLineDecoder,
    done: bool,
}

/// Adapts a response byte stream into a [`LineStream`]. A transport error
/// is yielded once and ends the stream.
pub fn line_stream<S, E>(bytes: S) -> LineStream
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display,
{
    let state = LineState { bytes, decoder: SseLineDecoder::new(), done: false };
    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(line) = st.decoder.next_line() {
                return Some((Ok(line), st));
            }
            if st.done {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => st.decoder.push(&chunk),
                Some(Err(err)) => {
                    st.done = true;
                    st.decoder = SseLineDecoder::new();
                    let error = CoreError::upstream(None, format!("stream read failed: {err}"));
                    return Some((Err(error), st));
                }
                None => {
                    st.done = true;
                    let rest = st.decoder.finish()?;
                    return Some((Ok(rest), st));
                }
            }
        }
    })
    .boxed()
}
