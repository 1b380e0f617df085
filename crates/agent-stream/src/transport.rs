use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::StatusCode;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use url::Url;

use crate::error::{StreamError, StreamResult};

pub type ByteStream = BoxStream<'static, StreamResult<Bytes>>;

/// Status plus a lazily-read body. Dropping the body aborts the connection.
pub struct AgentResponse {
    pub status: StatusCode,
    pub body: ByteStream,
}

impl AgentResponse {
    pub fn new(status: StatusCode, body: ByteStream) -> Self {
        Self { status, body }
    }

    pub fn from_bytes(status: StatusCode, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self {
            status,
            body: stream::once(async move { Ok(body) }).boxed(),
        }
    }

    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    pub async fn bytes(self) -> StreamResult<Bytes> {
        let mut body = self.body;
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// Reads at most `limit` bytes, then drops the rest of the body.
    pub async fn bytes_limited(self, limit: usize) -> StreamResult<Bytes> {
        let mut body = self.body;
        let mut buf = BytesMut::new();
        while buf.len() < limit {
            match body.next().await {
                Some(chunk) => buf.extend_from_slice(&chunk?),
                None => break,
            }
        }
        buf.truncate(limit);
        Ok(buf.freeze())
    }
}

impl fmt::Debug for AgentResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Issues one authenticated GET. Implementations must stop reading (and
/// release the connection) once `cancel` fires, including mid-body.
#[async_trait]
pub trait RequestIssuer: Send + Sync {
    async fn get(&self, url: &Url, cancel: &CancellationToken) -> StreamResult<AgentResponse>;
}

#[derive(Clone)]
enum Credential {
    Bearer(String),
    Header { name: HeaderName, value: HeaderValue },
}

#[derive(Clone)]
pub struct ReqwestIssuer {
    client: reqwest::Client,
    credential: Option<Credential>,
}

impl ReqwestIssuer {
    /// No overall request timeout is set: follow streams are unbounded and
    /// each attempt is raced against its own timer by the caller.
    pub fn new() -> StreamResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            credential: None,
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.credential = Some(Credential::Bearer(token.into()));
        self
    }

    pub fn with_token_header(mut self, name: &str, token: &str) -> StreamResult<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| StreamError::InvalidConfig(format!("invalid header name: {err}")))?;
        let mut value = HeaderValue::from_str(token)
            .map_err(|err| StreamError::InvalidConfig(format!("invalid token value: {err}")))?;
        value.set_sensitive(true);
        self.credential = Some(Credential::Header { name, value });
        Ok(self)
    }
}

#[async_trait]
impl RequestIssuer for ReqwestIssuer {
    async fn get(&self, url: &Url, cancel: &CancellationToken) -> StreamResult<AgentResponse> {
        let mut builder = self.client.get(url.clone());
        builder = match &self.credential {
            Some(Credential::Bearer(token)) => builder.bearer_auth(token),
            Some(Credential::Header { name, value }) => builder.header(name.clone(), value.clone()),
            None => builder,
        };

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(StreamError::Cancelled),
            response = builder.send() => response?,
        };
        let status = response.status();
        trace!(target = "agent_stream.transport", url = %url, status = %status, "response headers received");

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(StreamError::from))
            .take_until(cancel.clone().cancelled_owned())
            .boxed();
        Ok(AgentResponse::new(status, body))
    }
}
