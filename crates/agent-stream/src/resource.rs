use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogKind {
    Stdout,
    Stderr,
}

impl LogKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LogKind::Stdout => "stdout",
            LogKind::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatsTarget {
    Node(String),
    Allocation(String),
}

impl fmt::Display for StatsTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatsTarget::Node(id) => write!(f, "node stats {id}"),
            StatsTarget::Allocation(id) => write!(f, "alloc stats {id}"),
        }
    }
}

/// What a viewing session points at. Fixed for the lifetime of the session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceHandle {
    File {
        alloc_id: String,
        task: Option<String>,
        path: String,
    },
    TaskLog {
        alloc_id: String,
        task: String,
        kind: LogKind,
    },
    Stats(StatsTarget),
}

impl ResourceHandle {
    pub fn file(alloc_id: impl Into<String>, path: impl Into<String>) -> Self {
        ResourceHandle::File {
            alloc_id: alloc_id.into(),
            task: None,
            path: path.into(),
        }
    }

    pub fn task_file(
        alloc_id: impl Into<String>,
        task: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        ResourceHandle::File {
            alloc_id: alloc_id.into(),
            task: Some(task.into()),
            path: path.into(),
        }
    }

    pub fn task_log(alloc_id: impl Into<String>, task: impl Into<String>, kind: LogKind) -> Self {
        ResourceHandle::TaskLog {
            alloc_id: alloc_id.into(),
            task: task.into(),
            kind,
        }
    }

    pub fn node_stats(node_id: impl Into<String>) -> Self {
        ResourceHandle::Stats(StatsTarget::Node(node_id.into()))
    }

    pub fn allocation_stats(alloc_id: impl Into<String>) -> Self {
        ResourceHandle::Stats(StatsTarget::Allocation(alloc_id.into()))
    }

    pub fn alloc_id(&self) -> Option<&str> {
        match self {
            ResourceHandle::File { alloc_id, .. } | ResourceHandle::TaskLog { alloc_id, .. } => {
                Some(alloc_id)
            }
            ResourceHandle::Stats(StatsTarget::Allocation(alloc_id)) => Some(alloc_id),
            ResourceHandle::Stats(StatsTarget::Node(_)) => None,
        }
    }

    /// Path relative to the allocation directory, as the agent's `fs/*`
    /// endpoints expect it.
    pub fn agent_path(&self) -> Option<String> {
        match self {
            ResourceHandle::File {
                task: Some(task),
                path,
                ..
            } => Some(format!(
                "{}/{}",
                task.trim_end_matches('/'),
                path.trim_start_matches('/')
            )),
            ResourceHandle::File { task: None, path, .. } => Some(path.clone()),
            _ => None,
        }
    }

    pub fn is_readable(&self) -> bool {
        !matches!(self, ResourceHandle::Stats(_))
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceHandle::File { alloc_id, .. } => {
                write!(f, "file {}:{}", alloc_id, self.agent_path().unwrap_or_default())
            }
            ResourceHandle::TaskLog {
                alloc_id,
                task,
                kind,
            } => write!(f, "log {alloc_id}:{task}/{}", kind.as_str()),
            ResourceHandle::Stats(target) => fmt::Display::fmt(target, f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReadMode {
    #[default]
    Head,
    Tail,
    Follow,
}

impl ReadMode {
    pub fn is_snapshot(self) -> bool {
        !matches!(self, ReadMode::Follow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_files_are_prefixed_with_the_task_dir() {
        let handle = ResourceHandle::task_file("alloc-1", "web", "/local/app.log");
        assert_eq!(handle.agent_path().as_deref(), Some("web/local/app.log"));
        assert_eq!(handle.alloc_id(), Some("alloc-1"));
    }

    #[test]
    fn stats_handles_are_not_readable() {
        assert!(!ResourceHandle::node_stats("node-1").is_readable());
        assert!(ResourceHandle::task_log("a", "web", LogKind::Stderr).is_readable());
        assert_eq!(ResourceHandle::node_stats("node-1").alloc_id(), None);
    }
}
