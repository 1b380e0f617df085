use agent_stream_proto::{AllocStats, HostStats};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address::AddressResolver;
use crate::config::StreamConfig;
use crate::error::{StreamError, StreamResult};
use crate::failover::{fetch_with_failover, FailoverController, SharedFailover, TransportState};
use crate::fetch_mode::stats_url;
use crate::frame_buffer::{FrameBuffer, Sample};
use crate::resource::{ResourceHandle, StatsTarget};
use crate::transport::RequestIssuer;

const EVENT_CAPACITY: usize = 64;

/// Capacity the percentages are computed against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_mhz: u64,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsFrame {
    pub cpu: Sample,
    pub memory: Sample,
}

pub fn decode_frame(
    target: &StatsTarget,
    body: &[u8],
    limits: &ResourceLimits,
) -> StreamResult<StatsFrame> {
    let (timestamp, cpu_ticks, memory_used) = match target {
        StatsTarget::Node(_) => {
            let stats: HostStats = serde_json::from_slice(body)?;
            (stats.timestamp, stats.cpu_ticks_consumed, stats.memory.used)
        }
        StatsTarget::Allocation(_) => {
            let stats: AllocStats = serde_json::from_slice(body)?;
            let usage = &stats.resource_usage;
            (
                stats.timestamp,
                usage.cpu_stats.total_ticks,
                usage.memory_stats.used(),
            )
        }
    };
    let timestamp = UNIX_EPOCH + Duration::from_nanos(timestamp);
    let cpu_ticks = cpu_ticks.max(0.0);
    Ok(StatsFrame {
        cpu: Sample {
            timestamp,
            used: cpu_ticks.round() as u64,
            percent: ratio(cpu_ticks, limits.cpu_mhz),
        },
        memory: Sample {
            timestamp,
            used: memory_used,
            percent: ratio(memory_used as f64, limits.memory_bytes),
        },
    })
}

fn ratio(used: f64, limit: u64) -> f64 {
    if limit == 0 {
        0.0
    } else {
        used / limit as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Appended,
    Missed { misses: u32 },
    /// The miss threshold was reached; the scheduling loop must stop.
    Paused,
    /// Another poll was still in flight, or the tracker was closed.
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Frame(StatsFrame),
    Missed { misses: u32, error: StreamError },
    Paused,
}

/// Single-flight telemetry poll feeding a cpu and a memory history.
pub struct PollingTracker {
    issuer: Arc<dyn RequestIssuer>,
    failover: SharedFailover,
    target: StatsTarget,
    limits: ResourceLimits,
    cpu: FrameBuffer<Sample>,
    memory: FrameBuffer<Sample>,
    misses: Mutex<u32>,
    max_misses: u32,
    in_flight: AtomicBool,
    events: broadcast::Sender<TelemetryEvent>,
    cancel: CancellationToken,
}

impl PollingTracker {
    pub fn new(
        issuer: Arc<dyn RequestIssuer>,
        resolver: &dyn AddressResolver,
        target: StatsTarget,
        limits: ResourceLimits,
        config: &StreamConfig,
    ) -> Self {
        let handle = ResourceHandle::Stats(target.clone());
        let failover = FailoverController::for_handle(resolver, &handle, config).shared();
        Self::with_failover(issuer, failover, target, limits, config)
    }

    pub fn with_failover(
        issuer: Arc<dyn RequestIssuer>,
        failover: SharedFailover,
        target: StatsTarget,
        limits: ResourceLimits,
        config: &StreamConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            issuer,
            failover,
            target,
            limits,
            cpu: FrameBuffer::new(config.buffer_size),
            memory: FrameBuffer::new(config.buffer_size),
            misses: Mutex::new(0),
            max_misses: config.max_frame_misses.max(1),
            in_flight: AtomicBool::new(false),
            events,
            cancel: CancellationToken::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.events.subscribe()
    }

    pub fn target(&self) -> &StatsTarget {
        &self.target
    }

    pub fn cpu(&self) -> Vec<Sample> {
        self.cpu.snapshot()
    }

    pub fn memory(&self) -> Vec<Sample> {
        self.memory.snapshot()
    }

    pub fn misses(&self) -> u32 {
        *self.misses.lock()
    }

    pub fn transport_state(&self) -> TransportState {
        self.failover.lock().state()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Aborts any in-flight request; later polls are skipped.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub async fn poll(&self) -> PollOutcome {
        if self.cancel.is_cancelled() || self.in_flight.swap(true, Ordering::AcqRel) {
            return PollOutcome::Skipped;
        }
        let _flight = InFlight(&self.in_flight);

        let fetched = fetch_with_failover(
            self.issuer.as_ref(),
            &self.failover,
            &self.cancel,
            |base| stats_url(&self.target, base),
            |response| response.bytes(),
        )
        .await;

        let decoded = match fetched {
            Ok(body) => decode_frame(&self.target, &body, &self.limits),
            Err(StreamError::Cancelled) => return PollOutcome::Skipped,
            Err(err) => Err(err),
        };

        match decoded {
            Ok(frame) => {
                self.cpu.push(frame.cpu);
                self.memory.push(frame.memory);
                *self.misses.lock() = 0;
                let _ = self.events.send(TelemetryEvent::Frame(frame));
                PollOutcome::Appended
            }
            Err(error) => self.record_miss(error),
        }
    }

    fn record_miss(&self, error: StreamError) -> PollOutcome {
        let misses = {
            let mut misses = self.misses.lock();
            *misses += 1;
            if *misses >= self.max_misses {
                *misses = 0;
                None
            } else {
                Some(*misses)
            }
        };
        match misses {
            Some(misses) => {
                debug!(
                    target = "agent_stream.poller",
                    target_id = %self.target,
                    misses,
                    error = %error,
                    "telemetry poll missed"
                );
                let _ = self.events.send(TelemetryEvent::Missed { misses, error });
                PollOutcome::Missed { misses }
            }
            None => {
                warn!(
                    target = "agent_stream.poller",
                    target_id = %self.target,
                    error = %error,
                    "too many missed frames; pausing telemetry"
                );
                let _ = self.events.send(TelemetryEvent::Paused);
                PollOutcome::Paused
            }
        }
    }
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Live handle on a scheduled tracker. Dropping it stops the loop and aborts
/// whatever request is outstanding.
pub struct TelemetrySubscription {
    tracker: Arc<PollingTracker>,
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

pub fn spawn_poller(tracker: Arc<PollingTracker>, interval: Duration) -> TelemetrySubscription {
    let mut subscription = TelemetrySubscription {
        tracker,
        interval,
        task: None,
    };
    subscription.resume();
    subscription
}

impl TelemetrySubscription {
    pub fn tracker(&self) -> &Arc<PollingTracker> {
        &self.tracker
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map_or(false, |task| !task.is_finished())
    }

    /// Restarts a paused loop. Returns `false` if it is running or closed.
    pub fn resume(&mut self) -> bool {
        if self.tracker.is_closed() || self.is_running() {
            return false;
        }
        info!(target = "agent_stream.poller", target_id = %self.tracker.target(), "telemetry polling started");
        self.task = Some(tokio::spawn(run_poll_loop(
            self.tracker.clone(),
            self.interval,
        )));
        true
    }

    pub fn close(&mut self) {
        self.tracker.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for TelemetrySubscription {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_poll_loop(tracker: Arc<PollingTracker>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = tracker.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if tracker.poll().await == PollOutcome::Paused {
            break;
        }
    }
    debug!(target = "agent_stream.poller", target_id = %tracker.target(), "telemetry loop exited");
}
