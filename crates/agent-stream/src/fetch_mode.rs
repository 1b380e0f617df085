use url::Url;

use crate::error::{StreamError, StreamResult};
use crate::resource::{ReadMode, ResourceHandle, StatsTarget};

/// Largest resource fetched whole; anything bigger is read in a window.
pub const SIZE_THRESHOLD: u64 = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Start,
    End,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Start => "start",
            Origin::End => "end",
        }
    }
}

/// The read primitive chosen for a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchShape {
    FullContent,
    RangeRead {
        offset: u64,
        limit: u64,
        origin: Origin,
    },
    OpenStream {
        offset: u64,
        origin: Origin,
    },
}

impl FetchShape {
    pub fn is_stream(&self) -> bool {
        matches!(self, FetchShape::OpenStream { .. })
    }

    pub fn limit(&self) -> Option<u64> {
        match self {
            FetchShape::RangeRead { limit, .. } => Some(*limit),
            _ => None,
        }
    }
}

/// How a response body must be turned into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoding {
    Plain,
    Framed,
}

pub fn resolve(mode: ReadMode, known_size: Option<u64>) -> FetchShape {
    resolve_with_threshold(mode, known_size, SIZE_THRESHOLD)
}

/// An unknown size is treated as oversized so nothing unbounded is ever
/// fetched whole.
pub fn resolve_with_threshold(mode: ReadMode, known_size: Option<u64>, threshold: u64) -> FetchShape {
    let small = known_size.filter(|size| *size < threshold);
    match (mode, small) {
        (ReadMode::Follow, _) => FetchShape::OpenStream {
            offset: known_size.unwrap_or(threshold),
            origin: Origin::End,
        },
        (_, Some(_)) => FetchShape::FullContent,
        (ReadMode::Head, None) => FetchShape::RangeRead {
            offset: 0,
            limit: threshold,
            origin: Origin::Start,
        },
        (ReadMode::Tail, None) => match known_size {
            Some(size) => FetchShape::RangeRead {
                offset: size.saturating_sub(threshold),
                limit: threshold,
                origin: Origin::Start,
            },
            None => FetchShape::RangeRead {
                offset: threshold,
                limit: threshold,
                origin: Origin::End,
            },
        },
    }
}

/// A shape bound to a concrete resource, renderable against either base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    handle: ResourceHandle,
    shape: FetchShape,
}

impl ReadRequest {
    pub fn new(handle: ResourceHandle, shape: FetchShape) -> StreamResult<Self> {
        if !handle.is_readable() {
            return Err(StreamError::Unsupported(format!("{handle} cannot be read")));
        }
        Ok(Self { handle, shape })
    }

    pub fn handle(&self) -> &ResourceHandle {
        &self.handle
    }

    pub fn shape(&self) -> FetchShape {
        self.shape
    }

    pub fn with_shape(&self, shape: FetchShape) -> Self {
        Self {
            handle: self.handle.clone(),
            shape,
        }
    }

    /// Plain log reads and cat/readat come back as raw text; everything served
    /// by the stream endpoints is framed.
    pub fn decoding(&self) -> Decoding {
        match (&self.handle, self.shape) {
            (_, FetchShape::OpenStream { .. }) => Decoding::Framed,
            (
                ResourceHandle::File { .. },
                FetchShape::RangeRead {
                    origin: Origin::End,
                    ..
                },
            ) => Decoding::Framed,
            _ => Decoding::Plain,
        }
    }

    pub fn url(&self, base: &Url) -> StreamResult<Url> {
        match &self.handle {
            ResourceHandle::File { alloc_id, .. } => {
                let path = self.handle.agent_path().unwrap_or_default();
                let (op, params): (&str, Vec<(&str, String)>) = match self.shape {
                    FetchShape::FullContent => ("cat", vec![]),
                    FetchShape::RangeRead {
                        offset,
                        limit,
                        origin: Origin::Start,
                    } => (
                        "readat",
                        vec![("offset", offset.to_string()), ("limit", limit.to_string())],
                    ),
                    FetchShape::RangeRead {
                        offset,
                        origin: Origin::End,
                        ..
                    } => (
                        "stream",
                        vec![
                            ("offset", offset.to_string()),
                            ("origin", Origin::End.as_str().to_string()),
                            ("follow", "false".to_string()),
                        ],
                    ),
                    FetchShape::OpenStream { offset, origin } => (
                        "stream",
                        vec![
                            ("offset", offset.to_string()),
                            ("origin", origin.as_str().to_string()),
                        ],
                    ),
                };
                let mut url = join_segments(base, &["fs", op, alloc_id])?;
                {
                    let mut query = url.query_pairs_mut();
                    query.append_pair("path", &path);
                    for (key, value) in &params {
                        query.append_pair(key, value);
                    }
                }
                Ok(url)
            }
            ResourceHandle::TaskLog {
                alloc_id,
                task,
                kind,
            } => {
                let mut url = join_segments(base, &["fs", "logs", alloc_id])?;
                {
                    let mut query = url.query_pairs_mut();
                    query.append_pair("task", task);
                    query.append_pair("type", kind.as_str());
                    match self.shape {
                        FetchShape::FullContent => {
                            query.append_pair("plain", "true");
                            query.append_pair("follow", "false");
                            query.append_pair("origin", Origin::Start.as_str());
                            query.append_pair("offset", "0");
                        }
                        FetchShape::RangeRead { offset, origin, .. } => {
                            query.append_pair("plain", "true");
                            query.append_pair("follow", "false");
                            query.append_pair("origin", origin.as_str());
                            query.append_pair("offset", &offset.to_string());
                        }
                        FetchShape::OpenStream { offset, origin } => {
                            query.append_pair("follow", "true");
                            query.append_pair("origin", origin.as_str());
                            query.append_pair("offset", &offset.to_string());
                        }
                    }
                }
                Ok(url)
            }
            ResourceHandle::Stats(_) => Err(StreamError::Unsupported(format!(
                "{} cannot be read",
                self.handle
            ))),
        }
    }
}

/// `fs/stat` probe used to learn a file's size before choosing a shape.
pub fn stat_url(handle: &ResourceHandle, base: &Url) -> StreamResult<Url> {
    match handle {
        ResourceHandle::File { alloc_id, .. } => {
            let mut url = join_segments(base, &["fs", "stat", alloc_id])?;
            url.query_pairs_mut()
                .append_pair("path", &handle.agent_path().unwrap_or_default());
            Ok(url)
        }
        other => Err(StreamError::Unsupported(format!("{other} has no stat endpoint"))),
    }
}

pub fn stats_url(target: &StatsTarget, base: &Url) -> StreamResult<Url> {
    match target {
        StatsTarget::Node(node_id) => {
            let mut url = join_segments(base, &["stats"])?;
            url.query_pairs_mut().append_pair("node_id", node_id);
            Ok(url)
        }
        StatsTarget::Allocation(alloc_id) => join_segments(base, &["allocation", alloc_id, "stats"]),
    }
}

fn join_segments(base: &Url, segments: &[&str]) -> StreamResult<Url> {
    let mut url = base.clone();
    url.set_query(None);
    url.path_segments_mut()
        .map_err(|_| StreamError::InvalidUrl(format!("{base} cannot be used as a base url")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
