//! Incremental decoder for the `text/event-stream` body of a streaming chat
//! completion.
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hel"}}]}
//! data: {"choices":[{"delta":{"content":"lo"},"finish_reason":null}]}
//! data: [DONE]
//! ```
//!
//! [`SseDecoder`] is a plain state machine fed with whatever byte fragments
//! the transport delivers; [`drive_stream`] reads a body through it and
//! returns a single [`StreamOutcome`].

use futures::{ Stream, StreamExt };
use log::{ debug, warn };
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::LlmError;

pub const EVENT_MARKER: &str = "data: ";
pub const DONE_SENTINEL: &str = "[DONE]";

/// Classification of one `data: ` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Content(String),
    FinishReason(String),
    Malformed(String),
    DoneSentinel,
}

/// How a decoder session ended. Cancellation is not a failure.
#[derive(Debug)]
pub enum StreamOutcome {
    Completed,
    Failed(LlmError),
    Cancelled,
}

impl StreamOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, StreamOutcome::Completed)
    }
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Classifies a complete line. Lines without the event marker (blank lines,
/// `event:` or `:` comments) produce nothing.
pub fn classify_line(line: &str) -> Vec<Frame> {
    let Some(payload) = line.strip_prefix(EVENT_MARKER) else {
        return Vec::new();
    };
    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        return vec![Frame::DoneSentinel];
    }

    let chunk: StreamChunk = match serde_json::from_str(payload) {
        Ok(chunk) => chunk,
        Err(_) => {
            return vec![Frame::Malformed(payload.to_string())];
        }
    };

    let mut frames = Vec::new();
    if let Some(choice) = chunk.choices.into_iter().next() {
        // An empty content field still counts as a delta.
        if let Some(text) = choice.delta.and_then(|d| d.content) {
            frames.push(Frame::Content(text));
        }
        if let Some(reason) = choice.finish_reason {
            frames.push(Frame::FinishReason(reason));
        }
    }
    frames
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    pending_bytes: Vec<u8>,
    line_buf: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one transport fragment and returns the frames of every line it
    /// completed.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.decode_utf8(bytes);

        let mut frames = Vec::new();
        while let Some(newline_pos) = self.line_buf.find('\n') {
            let line: String = self.line_buf.drain(..=newline_pos).collect();
            let line = line.trim_end_matches('\n').trim_end_matches('\r');
            frames.extend(classify_line(line));
        }
        frames
    }

    /// Flushes whatever is left once the body is exhausted. A final line
    /// without a trailing newline is still classified.
    pub fn finish(&mut self) -> Vec<Frame> {
        if !self.pending_bytes.is_empty() {
            let tail = std::mem::take(&mut self.pending_bytes);
            self.line_buf.push_str(&String::from_utf8_lossy(&tail));
        }
        let rest = std::mem::take(&mut self.line_buf);
        let mut frames = Vec::new();
        for line in rest.split('\n') {
            frames.extend(classify_line(line.trim_end_matches('\r')));
        }
        frames
    }

    // Invalid sequences become U+FFFD; an incomplete trailing sequence waits
    // for the next fragment.
    fn decode_utf8(&mut self, bytes: &[u8]) {
        self.pending_bytes.extend_from_slice(bytes);

        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending_bytes[start..]) {
                Ok(text) => {
                    self.line_buf.push_str(text);
                    start = self.pending_bytes.len();
                    break;
                }
                Err(e) => {
                    let valid_end = start + e.valid_up_to();
                    self.line_buf.push_str(&String::from_utf8_lossy(&self.pending_bytes[start..valid_end]));
                    match e.error_len() {
                        Some(len) => {
                            self.line_buf.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + len;
                        }
                        None => {
                            start = valid_end;
                            break;
                        }
                    }
                }
            }
        }
        self.pending_bytes.drain(..start);
    }
}

/// Reads `body` to its terminal signal, forwarding content deltas to
/// `chunks` in arrival order.
///
/// Returns exactly one outcome. Once `cancel` fires, the outcome is
/// `Cancelled` even if the read subsequently fails. A dropped receiver is
/// treated as a cancellation.
pub async fn drive_stream<S, B, E>(
    body: S,
    cancel: &CancellationToken,
    chunks: &mpsc::Sender<String>
) -> StreamOutcome
    where S: Stream<Item = Result<B, E>>, B: AsRef<[u8]>, E: Into<LlmError>
{
    let mut body = std::pin::pin!(body);
    let mut decoder = SseDecoder::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return StreamOutcome::Cancelled;
            }
            next = body.next() => next,
        };

        match next {
            Some(Ok(bytes)) => {
                let frames = decoder.feed(bytes.as_ref());
                if let Some(outcome) = dispatch(frames, cancel, chunks).await {
                    return outcome;
                }
            }
            Some(Err(e)) => {
                if cancel.is_cancelled() {
                    return StreamOutcome::Cancelled;
                }
                let err: LlmError = e.into();
                warn!("Stream read failed: {}", err);
                return StreamOutcome::Failed(err);
            }
            None => {
                let frames = decoder.finish();
                return dispatch(frames, cancel, chunks).await.unwrap_or(StreamOutcome::Completed);
            }
        }
    }
}

async fn dispatch(
    frames: Vec<Frame>,
    cancel: &CancellationToken,
    chunks: &mpsc::Sender<String>
) -> Option<StreamOutcome> {
    for frame in frames {
        match frame {
            Frame::Content(text) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Some(StreamOutcome::Cancelled);
                    }
                    sent = chunks.send(text) => {
                        if sent.is_err() {
                            debug!("Chunk receiver dropped, ending stream session");
                            return Some(StreamOutcome::Cancelled);
                        }
                    }
                }
            }
            Frame::FinishReason(reason) => {
                debug!("Stream finished with reason: {}", reason);
                return Some(StreamOutcome::Completed);
            }
            Frame::DoneSentinel => {
                return Some(StreamOutcome::Completed);
            }
            Frame::Malformed(payload) => {
                debug!("Discarding malformed stream line: {}", payload);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::wrappers::ReceiverStream;

    const SCENARIO: &str = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
        "\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n",
        "\n",
        "data: [DONE]\n",
        "\n"
    );

    fn decode_in_fragments(body: &[u8], size: usize) -> Vec<Frame> {
        let mut decoder = SseDecoder::new();
        let mut frames = Vec::new();
        for fragment in body.chunks(size) {
            frames.extend(decoder.feed(fragment));
        }
        frames.extend(decoder.finish());
        frames
    }

    fn delta_line(text: &str) -> String {
        format!("data: {}\n\n", serde_json::json!({ "choices": [{ "delta": { "content": text } }] }))
    }

    async fn run(
        parts: Vec<Result<Vec<u8>, std::io::Error>>,
        cancel: &CancellationToken
    ) -> (Vec<String>, StreamOutcome) {
        let (tx, mut rx) = mpsc::channel(64);
        let outcome = drive_stream(futures::stream::iter(parts), cancel, &tx).await;
        drop(tx);
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        (chunks, outcome)
    }

    #[test]
    fn scenario_lines_decode_to_two_chunks_and_done() {
        let frames = decode_in_fragments(SCENARIO.as_bytes(), SCENARIO.len());
        assert_eq!(
            frames,
            vec![Frame::Content("Hel".into()), Frame::Content("lo".into()), Frame::DoneSentinel]
        );
    }

    #[test]
    fn fragmentation_never_changes_the_frames() {
        let mut body = String::new();
        for piece in ["héllo", " wörld ", "🦀", " ok", "\u{4e2d}\u{6587}"] {
            body.push_str(&delta_line(piece));
        }
        body.push_str("data: [DONE]\n");
        let bytes = body.as_bytes();

        let whole = decode_in_fragments(bytes, bytes.len());
        assert_eq!(whole.len(), 6);
        for size in 1..bytes.len() {
            assert_eq!(decode_in_fragments(bytes, size), whole, "fragment size {}", size);
        }
    }

    #[test]
    fn split_inside_multibyte_char_is_reassembled() {
        let line = delta_line("🦀");
        let bytes = line.as_bytes();
        let crab_at = line.find('🦀').unwrap();

        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(&bytes[..crab_at + 2]).is_empty());
        assert_eq!(decoder.feed(&bytes[crab_at + 2..]), vec![Frame::Content("🦀".into())]);
    }

    #[test]
    fn invalid_utf8_is_replaced_not_fatal() {
        let mut bytes = b"data: {\"choices\":[{\"delta\":{\"content\":\"a".to_vec();
        bytes.push(0xff);
        bytes.extend_from_slice(b"b\"}}]}\n");
        let frames = decode_in_fragments(&bytes, bytes.len());
        assert_eq!(frames, vec![Frame::Content("a\u{fffd}b".into())]);
    }

    #[test]
    fn unmarked_and_blank_lines_are_ignored() {
        let body = ": keep-alive\nevent: message\n\nid: 7\ndata:{\"no\":\"space\"}\n";
        assert!(decode_in_fragments(body.as_bytes(), 3).is_empty());
    }

    #[test]
    fn crlf_line_endings_are_accepted() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\r\n\r\ndata: [DONE]\r\n";
        assert_eq!(
            decode_in_fragments(body.as_bytes(), 5),
            vec![Frame::Content("x".into()), Frame::DoneSentinel]
        );
    }

    #[test]
    fn malformed_payload_is_tagged() {
        assert_eq!(classify_line("data: {not json"), vec![Frame::Malformed("{not json".into())]);
    }

    #[test]
    fn content_and_finish_reason_in_one_payload() {
        let line = r#"data: {"choices":[{"delta":{"content":"end"},"finish_reason":"stop"}]}"#;
        assert_eq!(
            classify_line(line),
            vec![Frame::Content("end".into()), Frame::FinishReason("stop".into())]
        );
    }

    #[test]
    fn role_only_delta_and_null_finish_produce_nothing() {
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"},"finish_reason":null}]}"#;
        assert!(classify_line(line).is_empty());
        assert!(classify_line(r#"data: {"choices":[]}"#).is_empty());
    }

    #[test]
    fn present_but_empty_content_is_still_a_chunk() {
        let line = r#"data: {"choices":[{"delta":{"role":"assistant","content":""}}]}"#;
        assert_eq!(classify_line(line), vec![Frame::Content(String::new())]);
        let line = r#"data: {"choices":[{"delta":{"content":null}}]}"#;
        assert!(classify_line(line).is_empty());
    }

    #[test]
    fn unterminated_final_line_is_flushed() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: [DONE]").is_empty());
        assert_eq!(decoder.finish(), vec![Frame::DoneSentinel]);
    }

    #[tokio::test]
    async fn drive_stops_at_sentinel() {
        let cancel = CancellationToken::new();
        let mut body = SCENARIO.as_bytes().to_vec();
        body.extend_from_slice(delta_line("ignored").as_bytes());
        let (chunks, outcome) = run(vec![Ok(body)], &cancel).await;
        assert_eq!(chunks, vec!["Hel", "lo"]);
        assert!(outcome.is_completed());
    }

    #[tokio::test]
    async fn drive_stops_at_finish_reason_without_sentinel() {
        let cancel = CancellationToken::new();
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"},\"finish_reason\":null}]}\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"length\"}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"never\"}}]}\n"
        );
        let parts = vec![Ok(body.as_bytes().to_vec()), Err(std::io::Error::other("unreachable"))];
        let (chunks, outcome) = run(parts, &cancel).await;
        assert_eq!(chunks, vec!["a"]);
        assert!(outcome.is_completed());
    }

    #[tokio::test]
    async fn drive_completes_on_exhaustion() {
        let cancel = CancellationToken::new();
        let parts = vec![Ok(delta_line("only").into_bytes())];
        let (chunks, outcome) = run(parts, &cancel).await;
        assert_eq!(chunks, vec!["only"]);
        assert!(outcome.is_completed());
    }

    #[tokio::test]
    async fn drive_skips_malformed_lines() {
        let cancel = CancellationToken::new();
        let body = format!("data: {{oops\n{}data: [DONE]\n", delta_line("fine"));
        let (chunks, outcome) = run(vec![Ok(body.into_bytes())], &cancel).await;
        assert_eq!(chunks, vec!["fine"]);
        assert!(outcome.is_completed());
    }

    #[tokio::test]
    async fn read_error_fails_the_session() {
        let cancel = CancellationToken::new();
        let parts = vec![
            Ok(delta_line("part").into_bytes()),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
        ];
        let (chunks, outcome) = run(parts, &cancel).await;
        assert_eq!(chunks, vec!["part"]);
        assert!(matches!(outcome, StreamOutcome::Failed(LlmError::Io(_))));
    }

    #[tokio::test]
    async fn cancelled_before_read_emits_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (chunks, outcome) = run(vec![Ok(SCENARIO.as_bytes().to_vec())], &cancel).await;
        assert!(chunks.is_empty());
        assert!(matches!(outcome, StreamOutcome::Cancelled));
    }

    #[tokio::test]
    async fn cancellation_suppresses_later_read_failure() {
        let cancel = CancellationToken::new();
        let (body_tx, body_rx) = mpsc::channel::<Result<Vec<u8>, std::io::Error>>(4);
        let (chunk_tx, mut chunk_rx) = mpsc::channel(4);

        let driver = drive_stream(ReceiverStream::new(body_rx), &cancel, &chunk_tx);
        let script = async {
            body_tx.send(Ok(delta_line("Par").into_bytes())).await.unwrap();
            let first = chunk_rx.recv().await;
            cancel.cancel();
            let _ = body_tx.send(Err(std::io::Error::other("aborted"))).await;
            first
        };
        let (outcome, first) = tokio::join!(driver, script);

        assert_eq!(first.as_deref(), Some("Par"));
        assert!(matches!(outcome, StreamOutcome::Cancelled));
    }

    #[tokio::test]
    async fn dropped_receiver_ends_session_quietly() {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let outcome = drive_stream(
            futures::stream::iter(vec![Ok::<_, std::io::Error>(SCENARIO.as_bytes().to_vec())]),
            &cancel,
            &tx
        ).await;
        assert!(matches!(outcome, StreamOutcome::Cancelled));
    }
}
