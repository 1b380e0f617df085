use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::address::AddressResolver;
use crate::config::StreamConfig;
use crate::error::{StreamError, StreamResult};
use crate::race::race;
use crate::resource::ResourceHandle;
use crate::transport::{AgentResponse, RequestIssuer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    Direct,
    Proxied,
    Unreachable,
}

/// Where the next attempt goes and how long it may take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub state: TransportState,
    pub base: Url,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    Retry(Route),
    Halt,
}

/// Per-session transport choice. Moves Direct → Proxied → Unreachable and
/// never back; a new session is the only way to try the direct path again.
#[derive(Debug)]
pub struct FailoverController {
    state: TransportState,
    direct: Option<Url>,
    proxied: Url,
    direct_timeout: Duration,
    proxied_timeout: Duration,
}

pub type SharedFailover = Arc<Mutex<FailoverController>>;

impl FailoverController {
    pub fn new(direct: Option<Url>, proxied: Url, config: &StreamConfig) -> Self {
        let state = if direct.is_some() {
            TransportState::Direct
        } else {
            TransportState::Proxied
        };
        Self {
            state,
            direct,
            proxied,
            direct_timeout: config.direct_timeout(),
            proxied_timeout: config.proxied_timeout(),
        }
    }

    pub fn for_handle(
        resolver: &dyn AddressResolver,
        handle: &ResourceHandle,
        config: &StreamConfig,
    ) -> Self {
        Self::new(
            resolver.direct_base(handle),
            resolver.proxied_base(handle),
            config,
        )
    }

    pub fn shared(self) -> SharedFailover {
        Arc::new(Mutex::new(self))
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn is_unreachable(&self) -> bool {
        self.state == TransportState::Unreachable
    }

    pub fn route(&self) -> Option<Route> {
        match (self.state, &self.direct) {
            (TransportState::Direct, Some(direct)) => Some(Route {
                state: TransportState::Direct,
                base: direct.clone(),
                timeout: self.direct_timeout,
            }),
            (TransportState::Direct, None) | (TransportState::Proxied, _) => Some(Route {
                state: TransportState::Proxied,
                base: self.proxied.clone(),
                timeout: self.proxied_timeout,
            }),
            (TransportState::Unreachable, _) => None,
        }
    }

    /// Successes are deliberately not state-changing: a working transport
    /// stays pinned.
    pub fn record_success(&self) {
        debug!(target = "agent_stream.failover", state = ?self.state, "attempt succeeded");
    }

    pub fn record_failure(&mut self, err: &StreamError) -> FailureAction {
        if !err.is_transient() {
            debug!(
                target = "agent_stream.failover",
                state = ?self.state,
                error = %err,
                "non-transport failure; not switching paths"
            );
            return FailureAction::Halt;
        }
        match self.state {
            TransportState::Direct => {
                self.state = TransportState::Proxied;
                warn!(
                    target = "agent_stream.failover",
                    error = %err,
                    "direct agent path failed; switching to proxied path"
                );
                self.route().map_or(FailureAction::Halt, FailureAction::Retry)
            }
            TransportState::Proxied => {
                self.state = TransportState::Unreachable;
                warn!(
                    target = "agent_stream.failover",
                    error = %err,
                    "proxied path failed; agent unreachable"
                );
                FailureAction::Halt
            }
            TransportState::Unreachable => FailureAction::Halt,
        }
    }
}

/// Runs one logical read through the session's failover policy.
///
/// Each attempt builds its URL from the current route and races `issue` plus
/// `consume` against that route's timeout. A transient failure on the direct
/// path is retried once against the proxied path; a transient failure on the
/// proxied path yields [`StreamError::NoConnection`].
pub async fn fetch_with_failover<T, B, C, Fut>(
    issuer: &dyn RequestIssuer,
    failover: &Mutex<FailoverController>,
    cancel: &CancellationToken,
    build_url: B,
    consume: C,
) -> StreamResult<T>
where
    B: Fn(&Url) -> StreamResult<Url>,
    C: Fn(AgentResponse) -> Fut,
    Fut: Future<Output = StreamResult<T>>,
{
    loop {
        let route = failover.lock().route().ok_or(StreamError::NoConnection)?;
        let url = build_url(&route.base)?;
        let attempt = cancel.child_token();
        debug!(
            target = "agent_stream.failover",
            url = %url,
            state = ?route.state,
            timeout_ms = route.timeout.as_millis() as u64,
            "issuing request"
        );

        let outcome = race(
            async {
                let response = issuer.get(&url, &attempt).await?;
                if !response.ok() {
                    return Err(StreamError::HttpStatus(response.status));
                }
                consume(response).await
            },
            route.timeout,
            &attempt,
        )
        .await;

        let err = match outcome {
            Ok(value) => {
                failover.lock().record_success();
                return Ok(value);
            }
            Err(StreamError::Cancelled) => return Err(StreamError::Cancelled),
            Err(err) => err,
        };

        let action = failover.lock().record_failure(&err);
        match action {
            FailureAction::Retry(_) => continue,
            FailureAction::Halt if err.is_transient() => return Err(StreamError::NoConnection),
            FailureAction::Halt => return Err(err),
        }
    }
}
