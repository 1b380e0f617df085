use agent_stream_proto::{DecodedFrame, FileInfo, FrameDecoder};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address::AddressResolver;
use crate::config::StreamConfig;
use crate::error::{StreamError, StreamResult};
use crate::failover::{fetch_with_failover, FailoverController, SharedFailover, TransportState};
use crate::fetch_mode::{resolve_with_threshold, stat_url, Decoding, FetchShape, ReadRequest};
use crate::resource::{ReadMode, ResourceHandle};
use crate::stream_reader::{StreamEvent, StreamReader};
use crate::transport::RequestIssuer;

const EVENT_CAPACITY: usize = 256;

/// What the rendering layer needs to draw the viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewState {
    pub mode: ReadMode,
    pub transport_state: TransportState,
    pub is_streaming: bool,
    pub no_connection: bool,
    pub content: String,
    pub error: Option<String>,
    pub known_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEvent {
    Replaced(String),
    Appended(String),
    ScrollToEnd,
    NoConnection,
    Error(String),
    FileEvent(String),
}

/// One open viewer on a file or task log. Owns its failover state, so two
/// sessions never influence each other's transport choice.
pub struct ViewSession {
    handle: ResourceHandle,
    issuer: Arc<dyn RequestIssuer>,
    resolver: Arc<dyn AddressResolver>,
    config: StreamConfig,
    failover: SharedFailover,
    cancel: CancellationToken,
    size_hint: Option<u64>,
    state: Arc<RwLock<ViewState>>,
    events: broadcast::Sender<ViewEvent>,
    reader: Option<StreamReader>,
    pump: Option<JoinHandle<()>>,
}

impl ViewSession {
    pub fn new(
        handle: ResourceHandle,
        issuer: Arc<dyn RequestIssuer>,
        resolver: Arc<dyn AddressResolver>,
        config: StreamConfig,
    ) -> StreamResult<Self> {
        if !handle.is_readable() {
            return Err(StreamError::Unsupported(format!("{handle} cannot be viewed")));
        }
        let failover = FailoverController::for_handle(resolver.as_ref(), &handle, &config).shared();
        let state = ViewState {
            mode: ReadMode::default(),
            transport_state: failover.lock().state(),
            is_streaming: false,
            no_connection: false,
            content: String::new(),
            error: None,
            known_size: None,
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            handle,
            issuer,
            resolver,
            config,
            failover,
            cancel: CancellationToken::new(),
            size_hint: None,
            state: Arc::new(RwLock::new(state)),
            events,
            reader: None,
            pump: None,
        })
    }

    /// Size used when the agent cannot be asked. Task logs are never probed,
    /// so this is their only size source.
    pub fn with_size_hint(mut self, size: u64) -> Self {
        self.size_hint = Some(size);
        self
    }

    pub fn handle(&self) -> &ResourceHandle {
        &self.handle
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ViewEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ViewState {
        let mut state = self.state.read().clone();
        state.transport_state = self.failover.lock().state();
        state.no_connection = state.transport_state == TransportState::Unreachable;
        state
    }

    pub async fn open(&mut self, mode: ReadMode) -> StreamResult<()> {
        self.set_mode(mode).await
    }

    /// Switches the read mode. Any active stream is fully released before the
    /// next request goes out.
    pub async fn set_mode(&mut self, mode: ReadMode) -> StreamResult<()> {
        self.stop_stream().await;
        {
            let mut state = self.state.write();
            state.mode = mode;
            state.error = None;
        }
        if self.failover.lock().is_unreachable() {
            return Err(StreamError::NoConnection);
        }
        debug!(target = "agent_stream.view", handle = %self.handle, mode = ?mode, "loading");
        match self.load(mode).await {
            Ok(()) => Ok(()),
            Err(StreamError::Cancelled) => Err(StreamError::Cancelled),
            Err(StreamError::NoConnection) => {
                warn!(target = "agent_stream.view", handle = %self.handle, "agent unreachable");
                let _ = self.events.send(ViewEvent::NoConnection);
                Err(StreamError::NoConnection)
            }
            Err(err) => {
                self.state.write().error = Some(err.to_string());
                let _ = self.events.send(ViewEvent::Error(err.to_string()));
                Err(err)
            }
        }
    }

    pub async fn refresh(&mut self) -> StreamResult<()> {
        let mode = self.state.read().mode;
        self.set_mode(mode).await
    }

    /// Fresh transport state and cancellation scope, then reload the current
    /// mode. The only way out of `no_connection`.
    pub async fn restart(&mut self) -> StreamResult<()> {
        self.stop_stream().await;
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.failover =
            FailoverController::for_handle(self.resolver.as_ref(), &self.handle, &self.config)
                .shared();
        info!(target = "agent_stream.view", handle = %self.handle, "session restarted");
        self.refresh().await
    }

    pub async fn close(&mut self) {
        self.stop_stream().await;
        self.cancel.cancel();
    }

    async fn load(&mut self, mode: ReadMode) -> StreamResult<()> {
        let known_size = self.probe_size().await?;
        let shape = resolve_with_threshold(mode, known_size, self.config.size_threshold);
        let request = ReadRequest::new(self.handle.clone(), shape)?;
        self.state.write().known_size = known_size;

        if shape.is_stream() {
            return self.start_stream(request);
        }

        let text = self.fetch_snapshot(&request).await?;
        self.state.write().content = text.clone();
        let _ = self.events.send(ViewEvent::Replaced(text));
        if mode == ReadMode::Tail {
            let _ = self.events.send(ViewEvent::ScrollToEnd);
        }
        Ok(())
    }

    async fn probe_size(&self) -> StreamResult<Option<u64>> {
        if !matches!(self.handle, ResourceHandle::File { .. }) {
            return Ok(self.size_hint);
        }
        let info = fetch_with_failover(
            self.issuer.as_ref(),
            &self.failover,
            &self.cancel,
            |base| stat_url(&self.handle, base),
            |response| async move {
                let body = response.bytes().await?;
                Ok::<_, StreamError>(serde_json::from_slice::<FileInfo>(&body)?)
            },
        )
        .await;
        match info {
            Ok(info) => Ok(Some(info.size)),
            Err(err @ (StreamError::NoConnection | StreamError::Cancelled)) => Err(err),
            Err(err) => {
                debug!(target = "agent_stream.view", handle = %self.handle, error = %err, "size probe failed");
                Ok(self.size_hint)
            }
        }
    }

    async fn fetch_snapshot(&self, request: &ReadRequest) -> StreamResult<String> {
        let decoding = request.decoding();
        let limit = match request.shape() {
            FetchShape::RangeRead { limit, .. } if decoding == Decoding::Plain => {
                usize::try_from(limit).unwrap_or(usize::MAX)
            }
            _ => usize::MAX,
        };
        let body = fetch_with_failover(
            self.issuer.as_ref(),
            &self.failover,
            &self.cancel,
            |base| request.url(base),
            |response| response.bytes_limited(limit),
        )
        .await?;

        match decoding {
            Decoding::Plain => Ok(String::from_utf8_lossy(&body).into_owned()),
            Decoding::Framed => {
                let mut decoder = FrameDecoder::new();
                let mut bytes = Vec::new();
                for frame in decoder.feed(&body).frames {
                    match frame {
                        DecodedFrame::Data { bytes: data, .. } => bytes.extend_from_slice(&data),
                        DecodedFrame::FileEvent { event, .. } => {
                            let _ = self.events.send(ViewEvent::FileEvent(event));
                        }
                    }
                }
                // Reads from the end keep the newest bytes of the window.
                if let Some(limit) = request.shape().limit() {
                    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
                    let excess = bytes.len().saturating_sub(limit);
                    bytes.drain(..excess);
                }
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
        }
    }

    fn start_stream(&mut self, request: ReadRequest) -> StreamResult<()> {
        let mut reader = StreamReader::new(
            self.issuer.clone(),
            self.failover.clone(),
            request,
            self.config.stream_idle_timeout(),
        )?;
        let stream_events = reader.subscribe();
        {
            let mut state = self.state.write();
            state.content.clear();
            state.is_streaming = true;
        }
        let _ = self.events.send(ViewEvent::Replaced(String::new()));
        let _ = self.events.send(ViewEvent::ScrollToEnd);

        self.pump = Some(tokio::spawn(pump_stream(
            stream_events,
            self.state.clone(),
            self.events.clone(),
        )));
        reader.start();
        self.reader = Some(reader);
        Ok(())
    }

    async fn stop_stream(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            reader.shutdown().await;
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.state.write().is_streaming = false;
    }
}

impl Drop for ViewSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

async fn pump_stream(
    mut stream_events: broadcast::Receiver<StreamEvent>,
    state: Arc<RwLock<ViewState>>,
    events: broadcast::Sender<ViewEvent>,
) {
    loop {
        let event = match stream_events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(target = "agent_stream.view", skipped, "view fell behind the stream");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        match event {
            StreamEvent::Chunk { text, .. } => {
                state.write().content.push_str(&text);
                let _ = events.send(ViewEvent::Appended(text));
                let _ = events.send(ViewEvent::ScrollToEnd);
            }
            StreamEvent::FileEvent { event, .. } => {
                let _ = events.send(ViewEvent::FileEvent(event));
            }
            StreamEvent::Resumed { .. } => {}
            StreamEvent::Halted(StreamError::NoConnection) => {
                state.write().is_streaming = false;
                let _ = events.send(ViewEvent::NoConnection);
                return;
            }
            StreamEvent::Halted(err) => {
                {
                    let mut state = state.write();
                    state.is_streaming = false;
                    state.error = Some(err.to_string());
                }
                let _ = events.send(ViewEvent::Error(err.to_string()));
                return;
            }
            StreamEvent::Ended => {
                state.write().is_streaming = false;
                return;
            }
        }
    }
}
