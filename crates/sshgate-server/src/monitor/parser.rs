//! Parsing of remote telemetry command output.
//!
//! Both sample commands print marker lines between their sections so each
//! metric can be cut out on its own. A metric whose section is missing or
//! malformed falls back to `0.0` / `"N/A"`; the others are unaffected.

use sshgate_core::{ContainerStats, SystemStats};
use std::time::Duration;

/// Placeholder for a metric that could not be read.
pub const NOT_AVAILABLE: &str = "N/A";

const MARK_PREFIX: &str = "---SSHGATE_";

/// First sample of a tick: every host metric.
pub const FULL_SAMPLE_COMMAND: &str = concat!(
    "echo '---SSHGATE_CPU_MODEL---';",
    "grep -m1 'model name' /proc/cpuinfo 2>/dev/null | cut -d: -f2;",
    "echo '---SSHGATE_UPTIME---';",
    "uptime -p 2>/dev/null || uptime;",
    "echo '---SSHGATE_STAT---';",
    "head -1 /proc/stat;",
    "echo '---SSHGATE_MEM---';",
    "free -b;",
    "echo '---SSHGATE_DISK---';",
    "df -h 2>/dev/null;",
    "echo '---SSHGATE_NET---';",
    "cat /proc/net/dev;",
    "echo '---SSHGATE_END---'",
);

/// Second sample of a tick: only the counters that are turned into rates.
pub const RATE_SAMPLE_COMMAND: &str = concat!(
    "echo '---SSHGATE_STAT---';",
    "head -1 /proc/stat;",
    "echo '---SSHGATE_NET---';",
    "cat /proc/net/dev;",
    "echo '---SSHGATE_END---'",
);

/// Prints `yes` when a docker CLI is installed.
pub const DOCKER_DETECT_COMMAND: &str =
    "command -v docker >/dev/null 2>&1 && echo yes || echo no";

/// Running containers and a one-shot stats read in one round trip.
pub const DOCKER_COMMAND: &str = concat!(
    "echo '---SSHGATE_DOCKER_PS---';",
    "docker ps --format '{{.ID}}|{{.Names}}|{{.Status}}' 2>/dev/null;",
    "echo '---SSHGATE_DOCKER_STATS---';",
    "docker stats --no-stream --format '{{.ID}}|{{.CPUPerc}}|{{.MemUsage}}' 2>/dev/null;",
    "echo '---SSHGATE_END---'",
);

/// Aggregate counters from the `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuSnapshot {
    /// Sum of every time field.
    pub total: u64,
    /// `idle + iowait`.
    pub idle: u64,
}

/// Byte counters summed over every interface in `/proc/net/dev`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetSnapshot {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Text following the `---SSHGATE_<name>---` marker up to the next marker.
pub fn section<'a>(output: &'a str, name: &str) -> Option<&'a str> {
    let marker = format!("{MARK_PREFIX}{name}---");
    let start = output.find(&marker)? + marker.len();
    let rest = &output[start..];
    let end = rest.find(MARK_PREFIX).unwrap_or(rest.len());
    Some(rest[..end].trim())
}

fn text_or_na(value: Option<&str>) -> String {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => NOT_AVAILABLE.to_string(),
    }
}

/// Format: `cpu  user nice system idle iowait irq softirq steal ...`
pub fn parse_cpu(section: &str) -> Option<CpuSnapshot> {
    let line = section.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuSnapshot {
        total: fields.iter().sum(),
        idle,
    })
}

/// Utilization between two samples, in `[0, 100]`. Zero when the total did
/// not advance.
pub fn cpu_percent(before: CpuSnapshot, after: CpuSnapshot) -> f64 {
    let total = after.total as f64 - before.total as f64;
    if total <= 0.0 {
        return 0.0;
    }
    let idle = after.idle as f64 - before.idle as f64;
    (100.0 * (total - idle) / total).clamp(0.0, 100.0)
}

/// `(used, total)` bytes from the `Mem:` line of `free -b`.
pub fn parse_memory(section: &str) -> Option<(u64, u64)> {
    let line = section.lines().find(|l| l.trim_start().starts_with("Mem:"))?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    let total = fields.get(1)?.parse().ok()?;
    let used = fields.get(2)?.parse().ok()?;
    Some((used, total))
}

pub fn memory_percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    used as f64 / total as f64 * 100.0
}

/// Use% of the filesystem mounted exactly at `/`.
///
/// Long device names make `df -h` wrap a row, so only the mount column and
/// the percentage column are relied on.
pub fn parse_disk(section: &str) -> Option<String> {
    section.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.last() != Some(&"/") {
            return None;
        }
        fields
            .iter()
            .rev()
            .find(|f| f.ends_with('%'))
            .map(|f| f.to_string())
    })
}

/// Format: `iface: rx_bytes rx_packets ... (8 rx fields) tx_bytes ...`
pub fn parse_net(section: &str) -> Option<NetSnapshot> {
    let mut snapshot = NetSnapshot::default();
    let mut seen = false;
    for line in section.lines() {
        let Some((_iface, stats)) = line.split_once(':') else {
            continue;
        };
        let fields: Vec<&str> = stats.split_whitespace().collect();
        if fields.len() < 9 {
            continue;
        }
        let (Ok(rx), Ok(tx)) = (fields[0].parse::<u64>(), fields[8].parse::<u64>()) else {
            continue;
        };
        snapshot.rx_bytes = snapshot.rx_bytes.saturating_add(rx);
        snapshot.tx_bytes = snapshot.tx_bytes.saturating_add(tx);
        seen = true;
    }
    seen.then_some(snapshot)
}

/// Bytes per second between two counter reads. Counter resets read as 0.
pub fn byte_rate(before: u64, after: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    after.saturating_sub(before) as f64 / secs
}

/// `1536.0` -> `"1.5 KB/s"`.
pub fn format_rate(bytes_per_sec: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];
    let mut value = bytes_per_sec.max(0.0);
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// Build host stats from the full sample and the rate sample of one tick.
pub fn system_stats(first: &str, second: &str, elapsed: Duration) -> SystemStats {
    let cpu_usage = match (
        section(first, "STAT").and_then(parse_cpu),
        section(second, "STAT").and_then(parse_cpu),
    ) {
        (Some(a), Some(b)) => cpu_percent(a, b),
        _ => 0.0,
    };

    let (memory_used, memory_total) = section(first, "MEM").and_then(parse_memory).unwrap_or((0, 0));

    let (network_rx, network_tx) = match (
        section(first, "NET").and_then(parse_net),
        section(second, "NET").and_then(parse_net),
    ) {
        (Some(a), Some(b)) => (
            format_rate(byte_rate(a.rx_bytes, b.rx_bytes, elapsed)),
            format_rate(byte_rate(a.tx_bytes, b.tx_bytes, elapsed)),
        ),
        _ => (NOT_AVAILABLE.to_string(), NOT_AVAILABLE.to_string()),
    };

    SystemStats {
        cpu_model: text_or_na(section(first, "CPU_MODEL")),
        uptime: text_or_na(section(first, "UPTIME")),
        cpu_usage,
        memory_usage: memory_percent(memory_used, memory_total),
        memory_used,
        memory_total,
        disk_usage: section(first, "DISK")
            .and_then(parse_disk)
            .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
        network_rx,
        network_tx,
    }
}

/// Whether [`DOCKER_DETECT_COMMAND`] found a docker CLI.
pub fn docker_detected(output: &str) -> bool {
    output.lines().any(|l| l.trim() == "yes")
}

/// Join `docker ps` rows with `docker stats` rows on container id.
///
/// Either side may print a shortened id, so ids match on prefix.
pub fn parse_containers(output: &str) -> Vec<ContainerStats> {
    let ps = section(output, "DOCKER_PS").unwrap_or("");
    let stats: Vec<Vec<&str>> = section(output, "DOCKER_STATS")
        .unwrap_or("")
        .lines()
        .map(|l| l.trim().split('|').collect::<Vec<_>>())
        .filter(|f| f.len() >= 3 && !f[0].is_empty())
        .collect();

    ps.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.trim().split('|').collect();
            if fields.len() < 3 || fields[0].is_empty() {
                return None;
            }
            let id = fields[0];
            let usage = stats
                .iter()
                .find(|s| s[0].starts_with(id) || id.starts_with(s[0]));
            let cpu = usage.map(|s| s[1].trim()).filter(|v| !v.is_empty());
            let memory = usage
                .map(|s| s[2].split(" / ").next().unwrap_or("").trim())
                .filter(|v| !v.is_empty());
            Some(ContainerStats {
                id: id.to_string(),
                name: fields[1].to_string(),
                status: fields[2].to_string(),
                cpu: text_or_na(cpu),
                memory: text_or_na(memory),
            })
        })
        .collect()
}
