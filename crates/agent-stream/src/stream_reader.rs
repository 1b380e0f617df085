use agent_stream_proto::{DecodedFrame, FrameDecoder};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{StreamError, StreamResult};
use crate::failover::{fetch_with_failover, FailureAction, SharedFailover};
use crate::fetch_mode::{FetchShape, Origin, ReadRequest};
use crate::transport::{AgentResponse, RequestIssuer};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Idle,
    Streaming,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Decoded content; `offset` is the absolute position after `text`.
    Chunk { offset: u64, text: String },
    FileEvent { offset: u64, event: String },
    /// The stream was reopened on the other path after a failure.
    Resumed { offset: Option<u64> },
    Halted(StreamError),
    Ended,
}

#[derive(Debug)]
struct Progress {
    state: ReaderState,
    offset: Option<u64>,
}

/// Follow-mode reader: one long-lived read, decoded incrementally and fanned
/// out to subscribers in the order bytes arrive.
pub struct StreamReader {
    issuer: Arc<dyn RequestIssuer>,
    failover: SharedFailover,
    request: ReadRequest,
    idle_timeout: Duration,
    events: broadcast::Sender<StreamEvent>,
    progress: Arc<Mutex<Progress>>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl StreamReader {
    /// Only streamed shapes are accepted; one-shot reads go through a
    /// snapshot fetch instead.
    pub fn new(
        issuer: Arc<dyn RequestIssuer>,
        failover: SharedFailover,
        request: ReadRequest,
        idle_timeout: Duration,
    ) -> StreamResult<Self> {
        if !request.shape().is_stream() {
            return Err(StreamError::Unsupported(format!(
                "{} is not a streamed read",
                request.handle()
            )));
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            issuer,
            failover,
            request,
            idle_timeout,
            events,
            progress: Arc::new(Mutex::new(Progress {
                state: ReaderState::Idle,
                offset: None,
            })),
            cancel: None,
            task: None,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ReaderState {
        self.progress.lock().state
    }

    /// Absolute offset after the last emitted chunk.
    pub fn offset(&self) -> Option<u64> {
        self.progress.lock().offset
    }

    pub fn request(&self) -> &ReadRequest {
        &self.request
    }

    /// Idle → Streaming. Returns `false` if the reader was not idle.
    pub fn start(&mut self) -> bool {
        {
            let mut progress = self.progress.lock();
            if progress.state != ReaderState::Idle {
                return false;
            }
            progress.state = ReaderState::Streaming;
        }

        let cancel = CancellationToken::new();
        let task = ReaderTask {
            issuer: self.issuer.clone(),
            failover: self.failover.clone(),
            request: self.request.clone(),
            idle_timeout: self.idle_timeout,
            events: self.events.clone(),
            progress: self.progress.clone(),
            cancel: cancel.clone(),
        };
        self.cancel = Some(cancel);
        self.task = Some(tokio::spawn(task.run()));
        true
    }

    /// Streaming → Stopped, releasing the connection. No-op otherwise.
    pub fn stop(&mut self) {
        if self.mark_stopped() {
            self.release();
        }
    }

    /// Like [`stop`](Self::stop), but waits until the reader task (and with it
    /// the response body) has been dropped.
    pub async fn shutdown(&mut self) {
        self.mark_stopped();
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }

    fn mark_stopped(&self) -> bool {
        let mut progress = self.progress.lock();
        if progress.state != ReaderState::Streaming {
            return false;
        }
        progress.state = ReaderState::Stopped;
        debug!(target = "agent_stream.reader", handle = %self.request.handle(), "stream stopped");
        true
    }

    /// Stops, forgets the current offset, and opens the original shape again.
    /// The previous task is gone before the new one starts, so it cannot
    /// publish into the fresh stream.
    pub async fn restart(&mut self) -> bool {
        self.shutdown().await;
        {
            let mut progress = self.progress.lock();
            progress.state = ReaderState::Idle;
            progress.offset = None;
        }
        self.start()
    }

    fn release(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.stop();
        self.release();
    }
}

struct ReaderTask {
    issuer: Arc<dyn RequestIssuer>,
    failover: SharedFailover,
    request: ReadRequest,
    idle_timeout: Duration,
    events: broadcast::Sender<StreamEvent>,
    progress: Arc<Mutex<Progress>>,
    cancel: CancellationToken,
}

enum PumpEnd {
    Eof,
    Cancelled,
    Failed(StreamError),
}

impl ReaderTask {
    async fn run(self) {
        let mut request = self.request.clone();
        let mut text = Utf8Carry::default();
        loop {
            let opened = fetch_with_failover(
                self.issuer.as_ref(),
                &self.failover,
                &self.cancel,
                |base| request.url(base),
                |response| async move { Ok::<_, StreamError>(response) },
            )
            .await;
            let response = match opened {
                Ok(response) => response,
                Err(StreamError::Cancelled) => return,
                Err(err) => return self.halt(err),
            };

            match self.pump(response, &mut text).await {
                PumpEnd::Cancelled => return,
                PumpEnd::Eof => {
                    info!(target = "agent_stream.reader", handle = %request.handle(), "stream ended");
                    self.finish();
                    let _ = self.events.send(StreamEvent::Ended);
                    return;
                }
                PumpEnd::Failed(err) => {
                    let action = self.failover.lock().record_failure(&err);
                    match action {
                        FailureAction::Retry(route) => {
                            let offset = self.progress.lock().offset;
                            warn!(
                                target = "agent_stream.reader",
                                error = %err,
                                offset = ?offset,
                                state = ?route.state,
                                "stream failed; resuming on the other path"
                            );
                            request = self.resume_request(offset);
                            let _ = self.events.send(StreamEvent::Resumed { offset });
                        }
                        FailureAction::Halt if err.is_transient() => {
                            return self.halt(StreamError::NoConnection)
                        }
                        FailureAction::Halt => return self.halt(err),
                    }
                }
            }
        }
    }

    /// Continue from what was already delivered rather than replaying.
    fn resume_request(&self, offset: Option<u64>) -> ReadRequest {
        match offset {
            Some(offset) => self.request.with_shape(FetchShape::OpenStream {
                offset,
                origin: Origin::Start,
            }),
            None => self.request.clone(),
        }
    }

    /// `text` outlives the connection: a resume continues at the byte after
    /// the last frame, so a split character completes on the new path.
    async fn pump(&self, response: AgentResponse, text: &mut Utf8Carry) -> PumpEnd {
        let mut body = response.body;
        let mut decoder = FrameDecoder::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PumpEnd::Cancelled,
                next = tokio::time::timeout(self.idle_timeout, body.next()) => next,
            };
            let chunk = match next {
                Err(_) => return PumpEnd::Failed(StreamError::Timeout(self.idle_timeout)),
                Ok(None) if self.cancel.is_cancelled() => return PumpEnd::Cancelled,
                Ok(None) => return PumpEnd::Eof,
                Ok(Some(Err(err))) => return PumpEnd::Failed(err),
                Ok(Some(Ok(chunk))) => chunk,
            };

            let batch = decoder.feed(&chunk);
            if batch.dropped > 0 {
                debug!(
                    target = "agent_stream.reader",
                    dropped = batch.dropped,
                    "dropped undecodable frames"
                );
            }
            for frame in batch.frames {
                self.emit(frame, text);
            }
        }
    }

    fn emit(&self, frame: DecodedFrame, carry: &mut Utf8Carry) {
        let event = match frame {
            DecodedFrame::Data { offset, bytes } => {
                self.progress.lock().offset = Some(offset);
                let text = carry.push(&bytes);
                if text.is_empty() {
                    return;
                }
                StreamEvent::Chunk { offset, text }
            }
            DecodedFrame::FileEvent { offset, event } => {
                info!(target = "agent_stream.reader", event = %event, "file event");
                StreamEvent::FileEvent { offset, event }
            }
        };
        let _ = self.events.send(event);
    }

    fn halt(&self, err: StreamError) {
        warn!(target = "agent_stream.reader", error = %err, "stream halted");
        self.finish();
        let _ = self.events.send(StreamEvent::Halted(err));
    }

    fn finish(&self) {
        let mut progress = self.progress.lock();
        if progress.state == ReaderState::Streaming {
            progress.state = ReaderState::Stopped;
        }
    }
}

/// Holds back the bytes of a UTF-8 sequence cut off at a frame boundary so
/// the character is emitted whole once the rest arrives.
#[derive(Debug, Default)]
struct Utf8Carry {
    partial: Vec<u8>,
}

impl Utf8Carry {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.partial.extend_from_slice(bytes);
        let mut text = String::new();
        loop {
            let err = match std::str::from_utf8(&self.partial) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.partial.clear();
                    return text;
                }
                Err(err) => err,
            };
            let valid = err.valid_up_to();
            text.push_str(&String::from_utf8_lossy(&self.partial[..valid]));
            match err.error_len() {
                // Incomplete trailing sequence; at most three bytes stay behind.
                None => {
                    self.partial.drain(..valid);
                    return text;
                }
                Some(invalid) => {
                    text.push(char::REPLACEMENT_CHARACTER);
                    self.partial.drain(..valid + invalid);
                }
            }
        }
    }
}
