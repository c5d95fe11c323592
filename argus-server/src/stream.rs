//! Line-streamed response relay.
//!
//! A streamed reply is newline-delimited JSON. Each line is handed to the
//! client as soon as it is complete and only then decoded, so the client sees
//! malformed lines too. The decoder remembers the last terminal (`done`)
//! record and whether any line failed to decode; at end of stream that
//! decides what, if anything, is recorded for the request.

use crate::shutdown::Shutdown;
use crate::stats::StatsStore;
use argus_common::ModelResponse;
use bytes::{BufMut, Bytes, BytesMut};
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, Incoming};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Lines buffered between the relay task and the client connection
const RELAY_BUFFER: usize = 16;

/// Longest line that is still decoded; anything longer fails the stream
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// No terminal record and no decode error so far
    Streaming,
    /// A line failed to decode or the transport broke; sticky
    ErrorSeen,
    /// A terminal record has been seen and no error
    TerminalSeen,
}

/// What a finished stream amounts to
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    /// Record a failure
    Failed,
    /// Record a success with the last terminal record
    Completed(ModelResponse),
    /// Ended cleanly without a terminal record; nothing is recorded
    Truncated,
}

/// A piece of the body ready for the client
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// A complete line, relayed and then decoded
    Line(Bytes),
    /// Part of a line longer than [`MAX_LINE_BYTES`], relayed without decoding
    Overflow(Bytes),
}

/// Incremental line splitter and terminal-record tracker
#[derive(Debug)]
pub struct StreamDecoder {
    buffer: BytesMut,
    /// Prefix of `buffer` already searched for `\n`
    scanned: usize,
    /// Inside an over-long line; bytes pass through until its `\n`
    overflowing: bool,
    state: DecoderState,
    terminal: Option<ModelResponse>,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            scanned: 0,
            overflowing: false,
            state: DecoderState::Streaming,
            terminal: None,
        }
    }

    /// Append raw body bytes
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next segment to relay.
    ///
    /// Complete lines keep their `\n`; empty lines (and lone `\r`) are
    /// consumed and skipped. A line that grows past [`MAX_LINE_BYTES`] fails
    /// the stream and is flushed as [`Segment::Overflow`] pieces so the
    /// buffer stays bounded.
    pub fn next_segment(&mut self) -> Option<Segment> {
        loop {
            let Some(offset) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n') else {
                return self.flush_partial();
            };
            let end = self.scanned + offset + 1;
            self.scanned = 0;
            let line = self.buffer.split_to(end).freeze();

            if self.overflowing {
                self.overflowing = false;
                return Some(Segment::Overflow(line));
            }
            if trim_line(&line).len() > MAX_LINE_BYTES {
                self.mark_oversized();
                return Some(Segment::Overflow(line));
            }
            if !trim_line(&line).is_empty() {
                return Some(Segment::Line(line));
            }
        }
    }

    /// No `\n` left in the buffer: remember how far we looked, or flush it if
    /// the pending line is already too long
    fn flush_partial(&mut self) -> Option<Segment> {
        if !self.overflowing && self.buffer.len() > MAX_LINE_BYTES {
            self.mark_oversized();
            self.overflowing = true;
        }
        if self.overflowing && !self.buffer.is_empty() {
            self.scanned = 0;
            return Some(Segment::Overflow(self.buffer.split().freeze()));
        }
        self.scanned = self.buffer.len();
        None
    }

    fn mark_oversized(&mut self) {
        warn!("Stream line exceeds {} bytes, not decoding it", MAX_LINE_BYTES);
        self.state = DecoderState::ErrorSeen;
    }

    /// Take whatever is left after the body ended.
    ///
    /// An unterminated final line is completed with `\n`.
    pub fn finish(&mut self) -> Option<Segment> {
        let rest = self.buffer.split();
        self.scanned = 0;
        if std::mem::take(&mut self.overflowing) {
            return (!rest.is_empty()).then(|| Segment::Overflow(rest.freeze()));
        }
        if trim_line(&rest).is_empty() {
            return None;
        }
        let mut line = BytesMut::with_capacity(rest.len() + 1);
        line.extend_from_slice(&rest);
        line.put_u8(b'\n');
        Some(Segment::Line(line.freeze()))
    }

    /// Decode a line that has already been relayed
    pub fn observe(&mut self, line: &[u8]) {
        match ModelResponse::parse(trim_line(line)) {
            Ok(record) => {
                if record.done {
                    if self.state == DecoderState::Streaming {
                        self.state = DecoderState::TerminalSeen;
                    }
                    self.terminal = Some(record);
                }
            }
            Err(e) => {
                warn!("Failed to parse stream chunk: {}", e);
                self.state = DecoderState::ErrorSeen;
            }
        }
    }

    pub fn mark_transport_error(&mut self) {
        self.state = DecoderState::ErrorSeen;
    }

    pub fn outcome(self) -> StreamOutcome {
        match (self.state, self.terminal) {
            (DecoderState::ErrorSeen, _) => StreamOutcome::Failed,
            (_, Some(record)) => StreamOutcome::Completed(record),
            (_, None) => StreamOutcome::Truncated,
        }
    }
}

/// Strip the line terminator (`\n` and an optional `\r`)
fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Request-scoped values the relay task needs
pub struct StreamContext {
    pub model: String,
    pub started: Instant,
    pub stats: Arc<StatsStore>,
    pub shutdown: Shutdown,
}

/// Response body fed line by line from the relay task
pub struct RelayBody {
    rx: mpsc::Receiver<Result<Bytes, io::Error>>,
}

impl Body for RelayBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        self.rx
            .poll_recv(cx)
            .map(|item| item.map(|result| result.map(Frame::data)))
    }
}

/// Start relaying `body` and return the client-side body
pub fn relay(body: Incoming, ctx: StreamContext) -> RelayBody {
    let (tx, rx) = mpsc::channel(RELAY_BUFFER);
    tokio::spawn(pump(body, tx, ctx));
    RelayBody { rx }
}

/// How the read loop ended
enum StreamEnd {
    Clean,
    TransportError(hyper::Error),
    Cancelled,
}

async fn pump(
    mut body: Incoming,
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
    mut ctx: StreamContext,
) {
    let mut decoder = StreamDecoder::new();
    let mut client = ClientSink::new(tx);

    let mut end = 'read: loop {
        let frame = tokio::select! {
            frame = body.frame() => frame,
            _ = ctx.shutdown.wait() => break StreamEnd::Cancelled,
        };

        match frame {
            Some(Ok(frame)) => {
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                decoder.push(&data);
                while let Some(segment) = decoder.next_segment() {
                    if !deliver(segment, &mut client, &mut decoder, &mut ctx.shutdown).await {
                        break 'read StreamEnd::Cancelled;
                    }
                }
            }
            Some(Err(e)) => break StreamEnd::TransportError(e),
            None => break StreamEnd::Clean,
        }
    };

    if matches!(end, StreamEnd::Clean) {
        if let Some(segment) = decoder.finish() {
            if !deliver(segment, &mut client, &mut decoder, &mut ctx.shutdown).await {
                end = StreamEnd::Cancelled;
            }
        }
    }

    let cancelled = matches!(end, StreamEnd::Cancelled);
    let client_error = match end {
        StreamEnd::Clean => None,
        StreamEnd::TransportError(e) => {
            error!("Error reading stream for model {}: {}", ctx.model, e);
            decoder.mark_transport_error();
            Some(io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))
        }
        StreamEnd::Cancelled => Some(io::Error::new(
            io::ErrorKind::Interrupted,
            "proxy is shutting down",
        )),
    };

    // The client only sees the end of the body once the outcome is recorded
    settle(decoder.outcome(), cancelled, &ctx);
    if let Some(err) = client_error {
        client.fail(err, &mut ctx.shutdown).await;
    }
}

/// Relay one segment, decoding complete lines once they are handed over.
/// Returns false when shutdown interrupted the hand-off.
async fn deliver(
    segment: Segment,
    client: &mut ClientSink,
    decoder: &mut StreamDecoder,
    shutdown: &mut Shutdown,
) -> bool {
    match segment {
        Segment::Line(line) => {
            if !client.send(line.clone(), shutdown).await {
                return false;
            }
            decoder.observe(&line);
            true
        }
        Segment::Overflow(bytes) => client.send(bytes, shutdown).await,
    }
}

fn settle(outcome: StreamOutcome, cancelled: bool, ctx: &StreamContext) {
    match (outcome, cancelled) {
        (StreamOutcome::Completed(record), _) => {
            let elapsed = ctx.started.elapsed().as_secs_f64();
            debug!(
                "Stream for model {} completed in {:.3}s (backend reported {:.3}s)",
                ctx.model,
                elapsed,
                record.total_duration_secs()
            );
            ctx.stats.record_success(&ctx.model, &record, elapsed);
        }
        (_, true) => {
            debug!(
                "Stream for model {} cancelled before completion, not recorded",
                ctx.model
            );
        }
        (StreamOutcome::Failed, false) => ctx.stats.record_failure(&ctx.model),
        (StreamOutcome::Truncated, false) => {
            // Clean end with no terminal record is left unaccounted
            warn!(
                "Stream for model {} ended without a final record, not recorded",
                ctx.model
            );
        }
    }
}

/// Client side of the relay channel.
///
/// A client that hangs up does not stop the relay: the backend stream is
/// still drained so the request is accounted for.
struct ClientSink {
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
    open: bool,
}

impl ClientSink {
    fn new(tx: mpsc::Sender<Result<Bytes, io::Error>>) -> Self {
        Self { tx, open: true }
    }

    /// Hand bytes to the client. Returns false if shutdown fired while the
    /// client was not reading.
    async fn send(&mut self, bytes: Bytes, shutdown: &mut Shutdown) -> bool {
        if !self.open {
            return true;
        }
        let sent = tokio::select! {
            biased;
            result = self.tx.send(Ok(bytes)) => result.is_ok(),
            _ = shutdown.wait() => return false,
        };
        if !sent {
            debug!("Client disconnected mid-stream, draining backend");
            self.open = false;
        }
        true
    }

    async fn fail(&mut self, err: io::Error, shutdown: &mut Shutdown) {
        if !self.open {
            return;
        }
        self.open = false;
        tokio::select! {
            biased;
            _ = self.tx.send(Err(err)) => {}
            _ = shutdown.wait() => debug!("Client not reading, dropping stream error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK_1: &[u8] = br#"{"model":"llama3","message":{"role":"assistant","content":"Hel"},"done":false}"#;
    const CHUNK_2: &[u8] = br#"{"model":"llama3","message":{"role":"assistant","content":"lo"},"done":false}"#;
    const FINAL: &[u8] = br#"{"model":"llama3","done":true,"total_duration":3000000000,"load_duration":2000000000,"prompt_eval_count":10,"eval_count":42}"#;

    fn feed(decoder: &mut StreamDecoder, bytes: &[u8]) -> Vec<Bytes> {
        decoder.push(bytes);
        let mut relayed = Vec::new();
        while let Some(segment) = decoder.next_segment() {
            match segment {
                Segment::Line(line) => {
                    decoder.observe(&line);
                    relayed.push(line);
                }
                Segment::Overflow(bytes) => relayed.push(bytes),
            }
        }
        relayed
    }

    fn ndjson(lines: &[&[u8]]) -> Vec<u8> {
        let mut body = Vec::new();
        for line in lines {
            body.extend_from_slice(line);
            body.push(b'\n');
        }
        body
    }

    #[test]
    fn test_three_line_stream_completes() {
        let mut decoder = StreamDecoder::new();
        let body = ndjson(&[CHUNK_1, CHUNK_2, FINAL]);
        let relayed = feed(&mut decoder, &body);

        assert_eq!(relayed.len(), 3);
        assert_eq!(relayed.concat(), body);
        assert_eq!(decoder.state, DecoderState::TerminalSeen);

        match decoder.outcome() {
            StreamOutcome::Completed(record) => {
                assert_eq!(record.eval_count, 42);
                assert_eq!(record.load_duration_secs(), 2.0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_lines_split_across_chunks() {
        let mut decoder = StreamDecoder::new();
        let body = ndjson(&[CHUNK_1, FINAL]);
        let (head, tail) = body.split_at(CHUNK_1.len() / 2);

        assert!(feed(&mut decoder, head).is_empty());
        let relayed = feed(&mut decoder, tail);
        assert_eq!(relayed.len(), 2);
        assert_eq!(relayed.concat(), body);
        assert!(matches!(decoder.outcome(), StreamOutcome::Completed(_)));
    }

    #[test]
    fn test_malformed_line_is_relayed_and_sticky() {
        let mut decoder = StreamDecoder::new();
        let body = ndjson(&[CHUNK_1, b"{not json", FINAL]);
        let relayed = feed(&mut decoder, &body);

        assert_eq!(&relayed[1][..], b"{not json\n");
        assert_eq!(relayed.concat(), body);
        // A later terminal record does not clear the error
        assert_eq!(decoder.state, DecoderState::ErrorSeen);
        assert_eq!(decoder.outcome(), StreamOutcome::Failed);
    }

    #[test]
    fn test_last_terminal_record_wins() {
        let mut decoder = StreamDecoder::new();
        let second = br#"{"model":"llama3","done":true,"eval_count":7}"#;
        feed(&mut decoder, &ndjson(&[FINAL, second]));

        match decoder.outcome() {
            StreamOutcome::Completed(record) => assert_eq!(record.eval_count, 7),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_stream_without_terminal_record_is_truncated() {
        let mut decoder = StreamDecoder::new();
        feed(&mut decoder, &ndjson(&[CHUNK_1, CHUNK_2]));
        assert_eq!(decoder.state, DecoderState::Streaming);
        assert_eq!(decoder.outcome(), StreamOutcome::Truncated);
    }

    #[test]
    fn test_transport_error_fails_even_after_terminal() {
        let mut decoder = StreamDecoder::new();
        feed(&mut decoder, &ndjson(&[FINAL]));
        decoder.mark_transport_error();
        assert_eq!(decoder.outcome(), StreamOutcome::Failed);
    }

    #[test]
    fn test_empty_lines_skipped_and_crlf_kept() {
        let mut decoder = StreamDecoder::new();
        let mut body = Vec::new();
        body.extend_from_slice(b"\n\r\n");
        body.extend_from_slice(CHUNK_1);
        body.extend_from_slice(b"\r\n\n");

        let relayed = feed(&mut decoder, &body);
        assert_eq!(relayed.len(), 1);
        assert!(relayed[0].ends_with(b"\r\n"));
        assert_eq!(decoder.state, DecoderState::Streaming);
    }

    #[test]
    fn test_unterminated_final_line() {
        let mut decoder = StreamDecoder::new();
        let mut body = ndjson(&[CHUNK_1]);
        body.extend_from_slice(FINAL);

        assert_eq!(feed(&mut decoder, &body).len(), 1);
        let Some(Segment::Line(last)) = decoder.finish() else {
            panic!("expected a completed final line");
        };
        assert_eq!(&last[..last.len() - 1], FINAL);
        assert_eq!(last.last(), Some(&b'\n'));
        decoder.observe(&last);

        assert!(decoder.finish().is_none());
        assert!(matches!(decoder.outcome(), StreamOutcome::Completed(_)));
    }

    #[test]
    fn test_long_line_without_newline_scans_incrementally() {
        let mut decoder = StreamDecoder::new();
        let piece = vec![b'x'; 4096];
        for _ in 0..16 {
            assert!(feed(&mut decoder, &piece).is_empty());
        }
        assert_eq!(decoder.scanned, 16 * 4096);

        let relayed = feed(&mut decoder, b"\n");
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].len(), 16 * 4096 + 1);
        assert_eq!(decoder.scanned, 0);
    }

    #[test]
    fn test_oversized_line_is_flushed_and_fails() {
        let mut decoder = StreamDecoder::new();
        let piece = vec![b'x'; 64 * 1024];
        let mut relayed_bytes = 0;
        for _ in 0..20 {
            relayed_bytes += feed(&mut decoder, &piece).iter().map(Bytes::len).sum::<usize>();
            assert!(decoder.buffer.len() <= MAX_LINE_BYTES);
        }
        assert_eq!(decoder.state, DecoderState::ErrorSeen);

        // The rest of the long line passes through, later lines decode again
        let mut tail = b"xyz\n".to_vec();
        tail.extend_from_slice(&ndjson(&[FINAL]));
        let relayed = feed(&mut decoder, &tail);
        relayed_bytes += relayed.iter().map(Bytes::len).sum::<usize>();

        assert_eq!(relayed_bytes, 20 * 64 * 1024 + tail.len());
        assert_eq!(&relayed[0][..], b"xyz\n");
        assert!(decoder.terminal.is_some());
        assert_eq!(decoder.outcome(), StreamOutcome::Failed);
    }

    #[test]
    fn test_oversized_line_in_one_chunk() {
        let mut decoder = StreamDecoder::new();
        let mut body = vec![b'x'; MAX_LINE_BYTES + 1];
        body.push(b'\n');
        body.extend_from_slice(&ndjson(&[FINAL]));

        let relayed = feed(&mut decoder, &body);
        assert_eq!(relayed.len(), 2);
        assert_eq!(relayed[0].len(), MAX_LINE_BYTES + 2);
        // The following line is decoded normally
        assert!(decoder.terminal.is_some());
        assert_eq!(decoder.outcome(), StreamOutcome::Failed);
    }

    #[test]
    fn test_oversized_line_at_end_of_body() {
        let mut decoder = StreamDecoder::new();
        let mut relayed = feed(&mut decoder, &vec![b'x'; MAX_LINE_BYTES + 10]);
        relayed.extend(feed(&mut decoder, b"abc"));

        let total: usize = relayed.iter().map(Bytes::len).sum();
        assert_eq!(total, MAX_LINE_BYTES + 10 + 3);
        assert!(decoder.finish().is_none());
        assert_eq!(decoder.outcome(), StreamOutcome::Failed);
    }

    #[tokio::test]
    async fn test_send_gives_up_on_stalled_client_at_shutdown() {
        let (tx, _rx) = mpsc::channel(1);
        let mut client = ClientSink::new(tx);
        let (trigger, mut shutdown) = crate::shutdown::channel();

        assert!(client.send(Bytes::from_static(b"a\n"), &mut shutdown).await);
        trigger.trigger();
        // Channel is full and nobody reads it
        let sent = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            client.send(Bytes::from_static(b"b\n"), &mut shutdown),
        )
        .await
        .unwrap();
        assert!(!sent);

        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            client.fail(io::Error::other("stop"), &mut shutdown),
        )
        .await
        .unwrap();
    }
}
