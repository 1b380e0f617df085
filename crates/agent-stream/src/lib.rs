//! Client for viewing files, task logs and resource telemetry served by a
//! remote client agent. Every session prefers the direct agent address and
//! falls back to the cluster proxy once; a second transport failure leaves
//! the session in `no_connection` until it is restarted.

pub mod address;
pub mod config;
pub mod error;
pub mod failover;
pub mod fetch_mode;
pub mod frame_buffer;
pub mod poller;
pub mod race;
pub mod resource;
pub mod stream_reader;
pub mod telemetry;
pub mod transport;
pub mod view;

#[cfg(test)]
pub(crate) mod mock;

pub use address::{AddressResolver, StaticAddresses};
pub use config::StreamConfig;
pub use error::{StreamError, StreamResult};
pub use failover::{
    fetch_with_failover, FailoverController, FailureAction, Route, SharedFailover, TransportState,
};
pub use fetch_mode::{resolve, Decoding, FetchShape, Origin, ReadRequest, SIZE_THRESHOLD};
pub use frame_buffer::{FrameBuffer, Sample};
pub use poller::{
    decode_frame, spawn_poller, PollOutcome, PollingTracker, ResourceLimits, StatsFrame,
    TelemetryEvent, TelemetrySubscription,
};
pub use race::race;
pub use resource::{LogKind, ReadMode, ResourceHandle, StatsTarget};
pub use stream_reader::{ReaderState, StreamEvent, StreamReader};
pub use transport::{AgentResponse, ByteStream, ReqwestIssuer, RequestIssuer};
pub use view::{ViewEvent, ViewSession, ViewState};
