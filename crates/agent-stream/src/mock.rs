//! Scripted [`RequestIssuer`] for unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::StatusCode;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{StreamError, StreamResult};
use crate::transport::{AgentResponse, RequestIssuer};

#[derive(Clone, Debug)]
pub(crate) enum Reply {
    Body(StatusCode, Vec<u8>),
    After(Duration, StatusCode, Vec<u8>),
    Fail(String),
    Hang,
    Stream(Vec<Step>),
}

impl Reply {
    pub(crate) fn ok(body: impl AsRef<[u8]>) -> Self {
        Reply::Body(StatusCode::OK, body.as_ref().to_vec())
    }

    pub(crate) fn status(status: StatusCode, body: impl AsRef<[u8]>) -> Self {
        Reply::Body(status, body.as_ref().to_vec())
    }
}

#[derive(Clone, Debug)]
pub(crate) enum Step {
    Chunk(Vec<u8>),
    Wait(Duration),
    Fail(String),
    Hang,
}

struct Rule {
    pattern: String,
    replies: VecDeque<Reply>,
}

/// Matches the first rule whose pattern occurs in the URL. Queued replies are
/// consumed in order and the last one repeats.
#[derive(Clone, Default)]
pub(crate) struct MockIssuer {
    rules: Arc<Mutex<Vec<Rule>>>,
    log: Arc<Mutex<Vec<String>>>,
}

impl MockIssuer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on(&self, pattern: &str, reply: Reply) {
        self.on_sequence(pattern, vec![reply]);
    }

    pub(crate) fn on_sequence(&self, pattern: &str, replies: Vec<Reply>) {
        self.rules.lock().push(Rule {
            pattern: pattern.to_string(),
            replies: replies.into(),
        });
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub(crate) fn requests(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter_map(|line| line.strip_prefix("GET ").map(str::to_string))
            .collect()
    }

    fn next_reply(&self, url: &str) -> Option<Reply> {
        let mut rules = self.rules.lock();
        let rule = rules.iter_mut().find(|rule| url.contains(&rule.pattern))?;
        if rule.replies.len() > 1 {
            rule.replies.pop_front()
        } else {
            rule.replies.front().cloned()
        }
    }
}

struct LogOnDrop {
    log: Arc<Mutex<Vec<String>>>,
    entry: Option<String>,
}

impl LogOnDrop {
    fn new(log: &Arc<Mutex<Vec<String>>>, entry: String) -> Self {
        Self {
            log: log.clone(),
            entry: Some(entry),
        }
    }

    fn disarm(mut self) {
        self.entry = None;
    }
}

impl Drop for LogOnDrop {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.log.lock().push(entry);
        }
    }
}

#[async_trait]
impl RequestIssuer for MockIssuer {
    async fn get(&self, url: &Url, cancel: &CancellationToken) -> StreamResult<AgentResponse> {
        let url = url.to_string();
        self.log.lock().push(format!("GET {url}"));
        let abort = LogOnDrop::new(&self.log, format!("ABORT {url}"));

        let reply = self
            .next_reply(&url)
            .unwrap_or_else(|| Reply::status(StatusCode::NOT_FOUND, "no route"));
        let result = match reply {
            Reply::Body(status, body) => Ok(AgentResponse::from_bytes(status, body)),
            Reply::After(delay, status, body) => {
                tokio::time::sleep(delay).await;
                Ok(AgentResponse::from_bytes(status, body))
            }
            Reply::Fail(message) => Err(StreamError::Network(message)),
            Reply::Hang => {
                cancel.cancelled().await;
                Err(StreamError::Cancelled)
            }
            Reply::Stream(steps) => Ok(scripted_body(steps, &self.log, &url, cancel.clone())),
        };
        abort.disarm();
        result
    }
}

fn scripted_body(
    steps: Vec<Step>,
    log: &Arc<Mutex<Vec<String>>>,
    url: &str,
    cancel: CancellationToken,
) -> AgentResponse {
    let closed = LogOnDrop::new(log, format!("CLOSE {url}"));
    let state = (VecDeque::from(steps), closed);
    let body = stream::unfold(state, |(mut steps, closed)| async move {
        loop {
            match steps.pop_front()? {
                Step::Chunk(bytes) => return Some((Ok(Bytes::from(bytes)), (steps, closed))),
                Step::Wait(delay) => tokio::time::sleep(delay).await,
                Step::Fail(message) => {
                    return Some((Err(StreamError::Network(message)), (steps, closed)))
                }
                Step::Hang => futures::future::pending::<()>().await,
            }
        }
    })
    .take_until(cancel.cancelled_owned())
    .boxed();
    AgentResponse::new(StatusCode::OK, body)
}
