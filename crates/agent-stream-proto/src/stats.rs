use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Node-level frame returned by `stats?node_id=...`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostStats {
    /// Unix nanoseconds.
    pub timestamp: u64,
    #[serde(rename = "CPUTicksConsumed")]
    pub cpu_ticks_consumed: f64,
    pub memory: HostMemoryStats,
    #[serde(default)]
    pub uptime: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostMemoryStats {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub available: u64,
    pub used: u64,
    #[serde(default)]
    pub free: u64,
}

/// Allocation-level frame returned by `allocation/<id>/stats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AllocStats {
    /// Unix nanoseconds.
    pub timestamp: u64,
    pub resource_usage: ResourceUsage,
    #[serde(default)]
    pub tasks: HashMap<String, TaskStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskStats {
    #[serde(default)]
    pub timestamp: u64,
    pub resource_usage: ResourceUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceUsage {
    pub memory_stats: MemoryStats,
    pub cpu_stats: CpuStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MemoryStats {
    #[serde(rename = "RSS", default)]
    pub rss: u64,
    #[serde(default)]
    pub usage: u64,
    #[serde(default)]
    pub cache: u64,
    #[serde(default)]
    pub swap: u64,
}

impl MemoryStats {
    /// Resident set size, or total usage on drivers that do not report RSS.
    pub fn used(&self) -> u64 {
        if self.rss > 0 {
            self.rss
        } else {
            self.usage
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CpuStats {
    #[serde(default)]
    pub total_ticks: f64,
    #[serde(default)]
    pub percent: f64,
    #[serde(default)]
    pub system_mode: f64,
    #[serde(default)]
    pub user_mode: f64,
}
