//! Streaming reconciliation for server-sent-event responses.
//!
//! [`SseReconciler`] sits between an upstream provider stream and the caller:
//! it forwards every frame in arrival order (rewriting JSON frames through an
//! injected hook), and captures the terminal usage snapshot to finalize
//! billing exactly once. The finalize transition is guarded by a one-way
//! latch: a stream that ends, errors, or is cancelled before a terminal frame
//! still finalizes, with a null usage payload and reason `aborted`, so no
//! request is left unbilled and unaudited.
//!
//! Each streamed request owns one reconciler task; the only shared boundary
//! with the HTTP layer is the `mpsc` writer, which is released on every exit
//! path. Nothing in the frame loop blocks on state shared across requests.

use crate::types::{FinalizeReason, RequestId};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Frames waiting for the downstream writer before back-pressure applies.
const FORWARD_CHANNEL_CAPACITY: usize = 32;

/// Receives the terminal usage snapshot (or the aborted signal) for one
/// streamed request. Implementations typically price the usage and hand the
/// bill to the audit sink; they may await persistence writes.
///
/// Errors returned here are caught and logged by the reconciler; they never
/// reach the forwarding path.
#[async_trait]
pub trait UsageFinalizer: Send + Sync {
    async fn finalize(&self, usage: Option<Value>, reason: FinalizeReason) -> anyhow::Result<()>;
}

/// Rewrites one parsed JSON frame before it is forwarded (strip internal
/// identifiers, inject the caller-visible request id, reshape `usage`).
/// A rewrite error forwards the original frame; it never stops the stream.
pub type FrameRewrite = Box<dyn FnMut(Value) -> anyhow::Result<Value> + Send + Sync>;

enum FrameOutcome {
    Forwarded,
    DownstreamClosed,
}

/// Per-request reconciliation state. The buffer and the finalize latch are
/// private to the request's task.
pub struct SseReconciler {
    request_id: RequestId,
    rewrite: FrameRewrite,
    finalizer: Arc<dyn UsageFinalizer>,
    cancel: CancellationToken,
    settled: bool,
}

impl SseReconciler {
    pub fn new(request_id: RequestId, rewrite: FrameRewrite, finalizer: Arc<dyn UsageFinalizer>) -> Self {
        Self {
            request_id,
            rewrite,
            finalizer,
            cancel: CancellationToken::new(),
            settled: false,
        }
    }

    /// Token that stops the upstream read when the downstream caller goes
    /// away. An unfinalized stream still takes the aborted finalize path.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Spawns the reconciliation task and returns the forwarded-frame
    /// receiver. The writer half lives inside the task and is released on
    /// every exit path.
    pub fn spawn<S, E>(self, upstream: S) -> mpsc::Receiver<Bytes>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(FORWARD_CHANNEL_CAPACITY);
        tokio::spawn(self.run(upstream, tx));
        rx
    }

    /// Drives the frame loop to completion. Exposed for direct use in tests
    /// and callers that manage their own tasks.
    pub async fn run<S, E>(mut self, mut upstream: S, tx: mpsc::Sender<Bytes>)
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin + Send,
        E: std::fmt::Display,
    {
        let request_id = self.request_id;
        // Guarantees the downstream writer is released on every exit path,
        // including a panic inside the frame loop.
        let tx = scopeguard::guard(tx, move |_tx| {
            debug!(request_id = %request_id, "downstream writer released");
        });

        // Raw bytes: a multibyte character split across read chunks must not
        // be decoded until its frame is complete.
        let mut buffer = BytesMut::new();

        'read: loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(request_id = %self.request_id, "downstream cancelled, stopping upstream read");
                    break 'read;
                }
                item = upstream.next() => item,
            };

            let chunk = match item {
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => {
                    warn!(request_id = %self.request_id, error = %err, "upstream stream error");
                    break 'read;
                }
                None => break 'read,
            };

            buffer.extend_from_slice(&chunk);

            // Split on the SSE frame boundary; the trailing partial frame
            // stays buffered for the next chunk.
            while let Some((frame_len, delimiter_len)) = frame_boundary(&buffer) {
                let raw = buffer.split_to(frame_len + delimiter_len).freeze();
                match self.handle_frame(raw, frame_len, &tx).await {
                    FrameOutcome::Forwarded => {}
                    FrameOutcome::DownstreamClosed => break 'read,
                }
            }
        }

        // End of stream, upstream error, or cancellation without a terminal
        // frame: the latch makes this a no-op after a complete finalize.
        self.finalize(None, FinalizeReason::Aborted).await;
    }

    /// Processes one complete frame (`raw` includes the trailing delimiter):
    /// concatenate `data:` payloads, parse, rewrite, forward, and run
    /// terminal-usage detection.
    async fn handle_frame(&mut self, raw: Bytes, frame_len: usize, tx: &mpsc::Sender<Bytes>) -> FrameOutcome {
        let mut data = String::new();
        {
            let frame = String::from_utf8_lossy(&raw[..frame_len]);
            for line in frame.split('\n') {
                let line = line.strip_suffix('\r').unwrap_or(line);
                if let Some(payload) = line.strip_prefix("data:") {
                    data.push_str(payload.trim_start());
                }
                // event:, id:, retry: and comment lines ride along in the raw
                // frame when it is passed through.
            }
        }

        let parsed: Option<Value> = if data.is_empty() { None } else { serde_json::from_str(&data).ok() };
        let Some(parsed) = parsed else {
            // Non-JSON (or non-data) content: forward byte-identical,
            // delimiter included.
            return self.forward(raw, tx).await;
        };

        // Detection reads the frame before the rewrite runs, so a rewrite
        // that strips `usage` for the client cannot starve billing.
        let terminal = detect_terminal_usage(&parsed);

        let rewritten = match (self.rewrite)(parsed.clone()) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(request_id = %self.request_id, error = %err, "frame rewrite failed, forwarding original");
                parsed
            }
        };

        let outcome = self.forward(encode_data_frame(&rewritten), tx).await;

        // The client sees its frame before billing is finalized.
        if let (FrameOutcome::Forwarded, Some(usage)) = (&outcome, terminal) {
            self.finalize(usage, FinalizeReason::Complete).await;
        }
        outcome
    }

    async fn forward(&self, bytes: Bytes, tx: &mpsc::Sender<Bytes>) -> FrameOutcome {
        if tx.send(bytes).await.is_err() {
            debug!(request_id = %self.request_id, "downstream receiver dropped");
            return FrameOutcome::DownstreamClosed;
        }
        FrameOutcome::Forwarded
    }

    /// One-way latched transition into `FINALIZED`. Finalizer failures are
    /// logged and swallowed; they never affect the forwarding path.
    async fn finalize(&mut self, usage: Option<Value>, reason: FinalizeReason) {
        if self.settled {
            return;
        }
        self.settled = true;

        if reason == FinalizeReason::Aborted {
            warn!(request_id = %self.request_id, "stream ended before a terminal usage frame");
        }

        if let Err(err) = self.finalizer.finalize(usage, reason).await {
            error!(request_id = %self.request_id, error = %err, reason = %reason, "usage finalizer failed");
        }
    }
}

/// Serializes a JSON frame as an SSE data frame.
fn encode_data_frame(frame: &Value) -> Bytes {
    Bytes::from(format!("data: {frame}\n\n"))
}

/// Locates the earliest frame delimiter in the buffer, returning the frame
/// length and the delimiter length. Both bare-LF and CRLF framing are
/// recognized.
fn frame_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|pos| (pos, 2));
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| (pos, 4));
    match (lf, crlf) {
        (Some(lf), Some(crlf)) => Some(if lf.0 <= crlf.0 { lf } else { crlf }),
        (lf, crlf) => lf.or(crlf),
    }
}

/// Recognizes the terminal snapshot frame. Returns `Some(usage)` when the
/// frame's shape says the response is complete: a terminal `object`
/// discriminator, or a non-null `usage` / `response.usage` field.
fn detect_terminal_usage(frame: &Value) -> Option<Option<Value>> {
    let usage = frame
        .get("usage")
        .filter(|value| !value.is_null())
        .or_else(|| frame.get("response").and_then(|response| response.get("usage")).filter(|value| !value.is_null()))
        .cloned();

    let object_terminal = matches!(
        frame.get("object").and_then(Value::as_str),
        Some("chat.completion") | Some("response")
    );

    if usage.is_some() || object_terminal { Some(usage) } else { None }
}

/// Wraps the forwarded-frame receiver into an SSE response.
pub fn sse_response(status: StatusCode, frames: mpsc::Receiver<Bytes>) -> Response {
    let body = Body::from_stream(ReceiverStream::new(frames).map(Ok::<_, std::convert::Infallible>));
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-store")
        .body(body)
        .expect("static header set is always valid")
}

/// Body transform that injects `stream_options.include_usage = true` into
/// streaming completion requests, so upstream providers report token usage in
/// the terminal SSE frame at all. Returns `None` when the body needs no
/// rewrite.
pub fn ensure_stream_usage(path: &str, body_bytes: &[u8]) -> Option<Bytes> {
    if path.ends_with("/completions")
        && let Ok(mut json_body) = serde_json::from_slice::<Value>(body_bytes)
        && let Some(obj) = json_body.as_object_mut()
        && obj.get("stream").and_then(|v| v.as_bool()) == Some(true)
    {
        obj.entry("stream_options")
            .or_insert_with(|| serde_json::json!({}))
            .as_object_mut()?
            .insert("include_usage".to_string(), serde_json::json!(true));

        if let Ok(bytes) = serde_json::to_vec(&json_body) {
            return Some(Bytes::from(bytes));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingFinalizer {
        calls: Mutex<Vec<(Option<Value>, FinalizeReason)>>,
        fail: bool,
    }

    impl RecordingFinalizer {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<(Option<Value>, FinalizeReason)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UsageFinalizer for RecordingFinalizer {
        async fn finalize(&self, usage: Option<Value>, reason: FinalizeReason) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push((usage, reason));
            if self.fail {
                anyhow::bail!("persistence unavailable");
            }
            Ok(())
        }
    }

    fn upstream(chunks: Vec<&str>) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Unpin + Send {
        futures::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c.to_string()))).collect::<Vec<_>>())
    }

    fn identity_rewrite() -> FrameRewrite {
        Box::new(Ok)
    }

    async fn run_and_collect(
        chunks: Vec<&str>,
        rewrite: FrameRewrite,
        finalizer: Arc<RecordingFinalizer>,
    ) -> Vec<String> {
        let (tx, mut rx) = mpsc::channel(64);
        let reconciler = SseReconciler::new(Uuid::new_v4(), rewrite, finalizer);
        reconciler.run(upstream(chunks), tx).await;

        let mut frames = Vec::new();
        while let Some(bytes) = rx.recv().await {
            frames.push(String::from_utf8(bytes.to_vec()).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn forwards_frames_in_order_and_finalizes_on_terminal_usage() {
        let finalizer = Arc::new(RecordingFinalizer::default());
        let frames = run_and_collect(
            vec![
                "data: {\"object\":\"chat.completion.chunk\",\"n\":1}\n\n",
                "data: {\"object\":\"chat.completion.chunk\",\"n\":2}\n\n",
                "data: {\"object\":\"chat.completion\",\"usage\":{\"output_text_tokens\":7}}\n\n",
            ],
            identity_rewrite(),
            finalizer.clone(),
        )
        .await;

        assert_eq!(frames.len(), 3);
        assert!(frames[0].contains("\"n\":1"));
        assert!(frames[1].contains("\"n\":2"));
        assert!(frames[2].contains("usage"));

        let calls = finalizer.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, Some(json!({"output_text_tokens": 7})));
        assert_eq!(calls[0].1, FinalizeReason::Complete);
    }

    #[tokio::test]
    async fn aborted_stream_finalizes_once_with_null_usage() {
        let finalizer = Arc::new(RecordingFinalizer::default());
        let frames = run_and_collect(
            vec![
                "data: {\"object\":\"chat.completion.chunk\",\"n\":1}\n\n",
                "data: {\"object\":\"chat.completion.chunk\",\"n\":2}\n\n",
            ],
            identity_rewrite(),
            finalizer.clone(),
        )
        .await;

        // Both frames still reach the client, in order.
        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains("\"n\":1"));
        assert!(frames[1].contains("\"n\":2"));

        let calls = finalizer.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (None, FinalizeReason::Aborted));
    }

    #[tokio::test]
    async fn reassembles_frames_split_across_chunks() {
        let finalizer = Arc::new(RecordingFinalizer::default());
        let frames = run_and_collect(
            vec!["data: {\"object\":\"chat.comp", "letion\",\"usage\":{\"requests\":1}}\n", "\n"],
            identity_rewrite(),
            finalizer.clone(),
        )
        .await;

        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("\"requests\":1"));
        assert_eq!(finalizer.calls().len(), 1);
        assert_eq!(finalizer.calls()[0].1, FinalizeReason::Complete);
    }

    #[tokio::test]
    async fn reassembles_multibyte_characters_split_across_chunks() {
        let finalizer = Arc::new(RecordingFinalizer::default());
        let frame = "data: {\"object\":\"chat.completion.chunk\",\"delta\":\"café au lait\"}\n\n";
        let bytes = frame.as_bytes();
        // Split inside the two-byte encoding of 'é'.
        let mid = bytes.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let chunks = vec![
            Ok::<_, std::io::Error>(Bytes::copy_from_slice(&bytes[..mid])),
            Ok(Bytes::copy_from_slice(&bytes[mid..])),
        ];

        let (tx, mut rx) = mpsc::channel(8);
        SseReconciler::new(Uuid::new_v4(), identity_rewrite(), finalizer)
            .run(futures::stream::iter(chunks), tx)
            .await;

        let forwarded = String::from_utf8(rx.recv().await.expect("one frame").to_vec()).unwrap();
        assert!(forwarded.contains("café au lait"), "got: {forwarded}");
        assert!(!forwarded.contains('\u{FFFD}'));
    }

    #[tokio::test]
    async fn splits_frames_on_crlf_delimiters() {
        let finalizer = Arc::new(RecordingFinalizer::default());
        let frames = run_and_collect(
            vec![
                ": ping\r\n\r\n",
                "data: {\"object\":\"chat.completion\",\"usage\":{\"requests\":1}}\r\n\r\n",
            ],
            identity_rewrite(),
            finalizer.clone(),
        )
        .await;

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], ": ping\r\n\r\n");
        assert_eq!(finalizer.calls(), vec![(Some(json!({"requests": 1})), FinalizeReason::Complete)]);
    }

    #[tokio::test]
    async fn non_json_frames_pass_through_byte_identical() {
        let finalizer = Arc::new(RecordingFinalizer::default());
        let frames = run_and_collect(
            vec![": heartbeat\n\n", "data: [DONE]\n\n", "data: {\"usage\":{\"requests\":1}}\n\n"],
            identity_rewrite(),
            finalizer.clone(),
        )
        .await;

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], ": heartbeat\n\n");
        assert_eq!(frames[1], "data: [DONE]\n\n");
        assert_eq!(finalizer.calls().len(), 1);
    }

    #[tokio::test]
    async fn rewrite_mutates_forwarded_frames() {
        let finalizer = Arc::new(RecordingFinalizer::default());
        let rewrite: FrameRewrite = Box::new(|mut frame| {
            if let Some(obj) = frame.as_object_mut() {
                obj.remove("provider");
                obj.insert("id".into(), json!("req-visible"));
            }
            Ok(frame)
        });
        let frames = run_and_collect(
            vec!["data: {\"provider\":\"internal\",\"usage\":{\"requests\":1}}\n\n"],
            rewrite,
            finalizer.clone(),
        )
        .await;

        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("req-visible"));
        assert!(!frames[0].contains("internal"));
        // Detection ran on the pre-rewrite frame.
        assert_eq!(finalizer.calls()[0].0, Some(json!({"requests": 1})));
    }

    #[tokio::test]
    async fn rewrite_failure_forwards_the_original_frame() {
        let finalizer = Arc::new(RecordingFinalizer::default());
        let rewrite: FrameRewrite = Box::new(|_| anyhow::bail!("rewrite exploded"));
        let frames = run_and_collect(
            vec!["data: {\"object\":\"chat.completion.chunk\",\"n\":1}\n\n"],
            rewrite,
            finalizer.clone(),
        )
        .await;

        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("\"n\":1"));
    }

    #[tokio::test]
    async fn finalize_runs_exactly_once_despite_repeated_terminal_frames() {
        let finalizer = Arc::new(RecordingFinalizer::default());
        run_and_collect(
            vec![
                "data: {\"usage\":{\"requests\":1}}\n\n",
                "data: {\"usage\":{\"requests\":2}}\n\n",
                "data: {\"object\":\"response\"}\n\n",
            ],
            identity_rewrite(),
            finalizer.clone(),
        )
        .await;

        let calls = finalizer.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, Some(json!({"requests": 1})));
    }

    #[tokio::test]
    async fn finalizer_failure_does_not_stop_forwarding() {
        let finalizer = Arc::new(RecordingFinalizer::failing());
        let frames = run_and_collect(
            vec![
                "data: {\"usage\":{\"requests\":1}}\n\n",
                "data: {\"object\":\"chat.completion.chunk\",\"n\":2}\n\n",
            ],
            identity_rewrite(),
            finalizer.clone(),
        )
        .await;

        assert_eq!(frames.len(), 2);
        assert_eq!(finalizer.calls().len(), 1);
    }

    #[tokio::test]
    async fn spawn_returns_the_forwarded_frames() {
        let finalizer = Arc::new(RecordingFinalizer::default());
        // Stateful rewrite: the hook is FnMut and must ride the spawned task.
        let mut seen = 0u64;
        let rewrite: FrameRewrite = Box::new(move |mut frame| {
            seen += 1;
            if let Some(obj) = frame.as_object_mut() {
                obj.insert("seq".into(), json!(seen));
            }
            Ok(frame)
        });
        let mut rx = SseReconciler::new(Uuid::new_v4(), rewrite, finalizer.clone())
            .spawn(upstream(vec!["data: {\"usage\":{\"requests\":1}}\n\n"]));

        let frame = rx.recv().await.expect("one frame");
        let text = String::from_utf8(frame.to_vec()).unwrap();
        assert!(text.contains("usage"));
        assert!(text.contains("\"seq\":1"));
        assert!(rx.recv().await.is_none(), "writer is released when the task ends");
    }

    #[test_log::test(tokio::test)]
    async fn upstream_error_takes_the_aborted_path() {
        let finalizer = Arc::new(RecordingFinalizer::default());
        let upstream = futures::stream::iter(vec![
            Ok(Bytes::from("data: {\"object\":\"chat.completion.chunk\"}\n\n")),
            Err(std::io::Error::other("connection reset")),
        ]);
        let (tx, mut rx) = mpsc::channel(8);
        SseReconciler::new(Uuid::new_v4(), identity_rewrite(), finalizer.clone())
            .run(upstream, tx)
            .await;

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
        assert_eq!(finalizer.calls(), vec![(None, FinalizeReason::Aborted)]);
    }

    #[tokio::test]
    async fn downstream_disconnect_stops_reading_and_aborts() {
        let finalizer = Arc::new(RecordingFinalizer::default());
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        SseReconciler::new(Uuid::new_v4(), identity_rewrite(), finalizer.clone())
            .run(
                upstream(vec![
                    "data: {\"n\":1}\n\n",
                    "data: {\"usage\":{\"requests\":1}}\n\n",
                ]),
                tx,
            )
            .await;

        // The terminal frame was never forwarded, so the request aborts.
        assert_eq!(finalizer.calls(), vec![(None, FinalizeReason::Aborted)]);
    }

    #[tokio::test]
    async fn cancellation_aborts_an_unfinalized_stream() {
        let finalizer = Arc::new(RecordingFinalizer::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, _rx) = mpsc::channel(8);
        SseReconciler::new(Uuid::new_v4(), identity_rewrite(), finalizer.clone())
            .with_cancellation(cancel)
            .run(futures::stream::pending::<Result<Bytes, std::io::Error>>(), tx)
            .await;

        assert_eq!(finalizer.calls(), vec![(None, FinalizeReason::Aborted)]);
    }

    #[tokio::test]
    async fn concatenates_multiple_data_lines_per_frame() {
        let finalizer = Arc::new(RecordingFinalizer::default());
        let frames = run_and_collect(
            vec!["data: {\"usage\":\ndata: {\"requests\":3}}\n\n"],
            identity_rewrite(),
            finalizer.clone(),
        )
        .await;

        assert_eq!(frames.len(), 1);
        assert_eq!(finalizer.calls()[0].0, Some(json!({"requests": 3})));
    }

    #[tokio::test]
    async fn terminal_usage_flows_into_billing_and_audit() {
        use crate::audit::{AuditSink, MemoryAuditSink, SuccessRecord};
        use crate::pricing::{Catalog, UsageSample, compute_bill};

        struct BillingFinalizer {
            catalog: Catalog,
            sink: Arc<MemoryAuditSink>,
        }

        #[async_trait]
        impl UsageFinalizer for BillingFinalizer {
            async fn finalize(&self, usage: Option<Value>, _reason: FinalizeReason) -> anyhow::Result<()> {
                let now = "2026-06-01T00:00:00Z".parse().unwrap();
                let card = self
                    .catalog
                    .load_card("openai", "gpt-4o", "chat.completions", now)
                    .ok_or_else(|| anyhow::anyhow!("no active price card"))?;
                let raw = usage.unwrap_or(Value::Null);
                let sample = UsageSample::split(&raw, &card);
                let bill = compute_bill(Some(&card), &sample, &sample.context, "standard");
                self.sink
                    .record_success(SuccessRecord {
                        request_id: Uuid::new_v4(),
                        team_id: None,
                        provider: card.provider.clone(),
                        model: card.model.clone(),
                        endpoint: card.endpoint.clone(),
                        pricing_plan: "standard".into(),
                        card_version: card.version,
                        usage: raw,
                        bill,
                        latency_ms: None,
                        generation_ms: None,
                        finish_reason: Some("stop".into()),
                        recorded_at: chrono::Utc::now(),
                    })
                    .await
            }
        }

        let catalog = Catalog::from_json_str(
            &serde_json::json!([{
                "id": "out",
                "model_key": "openai:gpt-4o:chat.completions",
                "pricing_plan": "standard",
                "meter": "output_text_tokens",
                "unit": "token",
                "unit_size": 1000,
                "price_per_unit": "0.002",
                "match": [],
                "priority": 100,
                "effective_from": "2026-01-01T00:00:00Z",
                "updated_at": "2026-01-01T00:00:00Z",
            }])
            .to_string(),
        )
        .unwrap();
        let sink = Arc::new(MemoryAuditSink::default());
        let finalizer = Arc::new(BillingFinalizer {
            catalog,
            sink: sink.clone(),
        });

        let (tx, mut rx) = mpsc::channel(8);
        SseReconciler::new(Uuid::new_v4(), Box::new(Ok), finalizer)
            .run(
                upstream(vec![
                    "data: {\"object\":\"chat.completion.chunk\"}\n\n",
                    "data: {\"object\":\"chat.completion\",\"usage\":{\"output_text_tokens\":2500}}\n\n",
                ]),
                tx,
            )
            .await;
        while rx.recv().await.is_some() {}

        let successes = sink.successes();
        assert_eq!(successes.len(), 1);
        // ceil(2500 / 1000) = 3 units at 0.002.
        assert_eq!(successes[0].bill.total_nanos, 6_000_000);
        assert_eq!(successes[0].bill.total_usd_str, "0.006000000");
    }

    #[test]
    fn detects_terminal_shapes() {
        assert_eq!(detect_terminal_usage(&json!({"object": "chat.completion.chunk"})), None);
        assert_eq!(detect_terminal_usage(&json!({"object": "chat.completion"})), Some(None));
        assert_eq!(
            detect_terminal_usage(&json!({"response": {"usage": {"t": 1}}})),
            Some(Some(json!({"t": 1})))
        );
        assert_eq!(detect_terminal_usage(&json!({"usage": null})), None);
    }

    #[test]
    fn sse_response_sets_stream_headers() {
        let (_tx, rx) = mpsc::channel(1);
        let response = sse_response(StatusCode::OK, rx);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
    }

    mod stream_usage {
        use super::super::ensure_stream_usage;

        fn call(path: &str, body: &serde_json::Value) -> Option<serde_json::Value> {
            let bytes = serde_json::to_vec(body).unwrap();
            ensure_stream_usage(path, &bytes).map(|b| serde_json::from_slice(&b).unwrap())
        }

        #[test]
        fn injects_stream_options_when_missing() {
            let body = serde_json::json!({"model": "gpt-4", "stream": true});
            let result = call("/chat/completions", &body).expect("should transform");
            assert_eq!(result["stream_options"]["include_usage"], true);
        }

        #[test]
        fn overwrites_existing_include_usage() {
            let body = serde_json::json!({"stream": true, "stream_options": {"include_usage": false}});
            let result = call("/v1/chat/completions", &body).expect("should transform");
            assert_eq!(result["stream_options"]["include_usage"], true);
        }

        #[test]
        fn skips_non_streaming_and_non_completion_requests() {
            assert!(call("/chat/completions", &serde_json::json!({"stream": false})).is_none());
            assert!(call("/chat/completions", &serde_json::json!({"model": "gpt-4"})).is_none());
            assert!(call("/embeddings", &serde_json::json!({"stream": true})).is_none());
        }
    }
}
