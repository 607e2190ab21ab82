//! Guest statistics collection.
//!
//! Sections come from the container's cgroup and the kernel's network
//! counters; sources that do not exist (embedded mode, cgroup v2 not
//! mounted) yield zeroed sections rather than errors.

use std::path::Path;
use std::sync::Arc;

use silo_shared::protocol::{
    MemoryEvents, MemoryStats, NetworkStats, ProcessStats, StatisticsCategory, StatisticsReport,
};
use tracing::trace;

use crate::server::AgentState;

pub(crate) fn collect(
    state: &Arc<AgentState>,
    container_id: &str,
    categories: &[StatisticsCategory],
) -> StatisticsReport {
    let mut report = StatisticsReport::default();
    let cgroup_dir = state
        .scopes
        .get(container_id)
        .ok()
        .and_then(|scope| scope.cgroup_dir.clone());

    for category in categories {
        match category {
            StatisticsCategory::Process => {
                report.process = Some(ProcessStats {
                    running: state.registry.running_in(container_id),
                });
            }
            StatisticsCategory::Memory => {
                report.memory = Some(match &cgroup_dir {
                    Some(dir) => MemoryStats {
                        usage_bytes: read_u64(&dir.join("memory.current")).unwrap_or(0),
                        limit_bytes: read_u64(&dir.join("memory.max")),
                    },
                    None => MemoryStats::default(),
                });
            }
            StatisticsCategory::MemoryEvents => {
                let events = cgroup_dir
                    .as_ref()
                    .and_then(|dir| std::fs::read_to_string(dir.join("memory.events")).ok())
                    .map(|text| parse_memory_events(&text))
                    .unwrap_or_default();
                report.memory_events = Some(events);
            }
            StatisticsCategory::Network => {
                report.network = read_network_counters();
            }
        }
    }
    report
}

fn read_u64(path: &Path) -> Option<u64> {
    let text = std::fs::read_to_string(path).ok()?;
    // "max" in memory.max means unlimited.
    text.trim().parse().ok()
}

/// Parse a cgroup v2 `memory.events` file.
pub(crate) fn parse_memory_events(text: &str) -> MemoryEvents {
    let mut events = MemoryEvents::default();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let (Some(key), Some(value)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Ok(value) = value.parse::<u64>() else {
            continue;
        };
        match key {
            "low" => events.low = value,
            "high" => events.high = value,
            "max" => events.max = value,
            "oom" => events.oom = value,
            "oom_kill" => events.oom_kill = value,
            other => trace!(key = other, "unrecognized memory event"),
        }
    }
    events
}

fn read_network_counters() -> Vec<NetworkStats> {
    let mut stats = Vec::new();
    let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
        return stats;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "lo" {
            continue;
        }
        let base = entry.path().join("statistics");
        stats.push(NetworkStats {
            interface: name,
            rx_bytes: read_u64(&base.join("rx_bytes")).unwrap_or(0),
            tx_bytes: read_u64(&base.join("tx_bytes")).unwrap_or(0),
        });
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_events() {
        let text = "low 0\nhigh 12\nmax 3\noom 2\noom_kill 1\n";
        let events = parse_memory_events(text);
        assert_eq!(events.high, 12);
        assert_eq!(events.max, 3);
        assert_eq!(events.oom, 2);
        assert_eq!(events.oom_kill, 1);
    }

    #[test]
    fn test_parse_memory_events_tolerates_noise() {
        let events = parse_memory_events("oom_kill 4\nfuture_field 9\nbroken\n");
        assert_eq!(events.oom_kill, 4);
        assert_eq!(events.oom, 0);
    }
}
