//! Wire framing shared by the streaming adapters.
//!
//! Every vendor is reduced to a stream of frames (an SSE event or one NDJSON
//! line). A per-vendor decode function turns each frame into a [`Frame`]
//! verdict, and [`decode_frames`] turns the verdicts into the normalized
//! [`EventStream`].

use std::collections::VecDeque;

use bytes::Bytes;
use eventsource_stream::{Event, Eventsource};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::Response;
use tracing::warn;

use crate::error::Error;
use crate::Result;

use super::{EventStream, StreamEvent, Vendor};

/// Raw frames before vendor decoding. Errors are transport failures.
pub(crate) type FrameStream<F> = BoxStream<'static, std::result::Result<F, String>>;

/// Outcome of decoding one frame.
#[derive(Debug)]
pub(crate) enum Frame {
    /// Normalized events carried by the frame (possibly none).
    Events(Vec<StreamEvent>),
    /// Malformed or irrelevant frame; decoding continues.
    Skip,
    /// Vendor signalled the end of the response, after these events.
    End(Vec<StreamEvent>),
    /// Vendor reported an error inside the stream.
    Fail(String),
}

/// Reject non-2xx responses with the vendor's error body.
pub(crate) async fn check_status(vendor: Vendor, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::transport(
        vendor,
        format!("HTTP {}: {}", status.as_u16(), body.trim()),
    ))
}

/// Map a reqwest failure (connection refused, DNS, TLS...) to a transport error.
///
/// The URL is stripped so credentials in an endpoint never reach the user.
pub(crate) fn send_error(vendor: Vendor, err: reqwest::Error) -> Error {
    Error::transport(vendor, format!("request failed: {}", err.without_url()))
}

/// Split a byte stream into server-sent events.
pub(crate) fn sse_frames<S, E>(bytes: S) -> FrameStream<Event>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    bytes
        .eventsource()
        .map(|item| item.map_err(|e| format!("SSE stream error: {}", e)))
        .boxed()
}

struct LineState {
    inner: BoxStream<'static, std::result::Result<Bytes, String>>,
    buf: Vec<u8>,
    done: bool,
}

/// Split a byte stream into newline-delimited records.
///
/// Chunk boundaries are arbitrary; a record may span several writes and a
/// trailing record without a newline is still emitted at end of stream.
/// Blank lines are dropped.
pub(crate) fn ndjson_frames<S, E>(bytes: S) -> FrameStream<String>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = LineState {
        inner: bytes.map(|item| item.map_err(|e| e.to_string())).boxed(),
        buf: Vec::new(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(pos) = st.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = st.buf.drain(..=pos).collect();
                let text = decode_line(&line[..line.len() - 1]);
                if text.is_empty() {
                    continue;
                }
                return Some((Ok(text), st));
            }
            if st.done {
                if st.buf.is_empty() {
                    return None;
                }
                let rest = std::mem::take(&mut st.buf);
                let text = decode_line(&rest);
                if text.is_empty() {
                    return None;
                }
                return Some((Ok(text), st));
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => st.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    st.done = true;
                    st.buf.clear();
                    return Some((Err(format!("stream read error: {}", e)), st));
                }
                None => st.done = true,
            }
        }
    })
    .boxed()
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim().to_string()
}

struct DecodeState<F, D> {
    frames: FrameStream<F>,
    queue: VecDeque<StreamEvent>,
    finished: bool,
    decode: D,
}

/// Drive `decode` over `frames`, yielding normalized events in order.
///
/// Skipped frames are dropped silently (the decoder logs them). A transport
/// error or a [`Frame::Fail`] terminates the stream with `Error::Transport`.
pub(crate) fn decode_frames<F, D>(vendor: Vendor, frames: FrameStream<F>, decode: D) -> EventStream
where
    F: Send + 'static,
    D: FnMut(F) -> Frame + Send + 'static,
{
    let state = DecodeState {
        frames,
        queue: VecDeque::new(),
        finished: false,
        decode,
    };

    stream::unfold(state, move |mut st| async move {
        loop {
            if let Some(event) = st.queue.pop_front() {
                return Some((Ok(event), st));
            }
            if st.finished {
                return None;
            }
            match st.frames.next().await {
                None => {
                    st.finished = true;
                }
                Some(Err(message)) => {
                    st.finished = true;
                    return Some((Err(Error::transport(vendor, message)), st));
                }
                Some(Ok(frame)) => match (st.decode)(frame) {
                    Frame::Events(events) => st.queue.extend(events),
                    Frame::Skip => {}
                    Frame::End(events) => {
                        st.queue.extend(events);
                        st.finished = true;
                    }
                    Frame::Fail(message) => {
                        warn!("{} reported a stream error: {}", vendor, message);
                        st.finished = true;
                        st.queue.clear();
                        return Some((Err(Error::transport(vendor, message)), st));
                    }
                },
            }
        }
    })
    .boxed()
}
