//! Metric collector: a fixed battery of probes run through the command runner,
//! parsed defensively into a [`MetricsSnapshot`], then evaluated for anomalies.

use crate::config::{PolicyConfig, ThresholdsConfig};
use chrono::{DateTime, Utc};
use guardian_tools::CommandRunner;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, LazyLock};

const CPU_PROBE: &str = "top -bn2 -d 0.5 | grep 'Cpu(s)' | tail -n 1";
const DISK_PROBE: &str = "df -h /";
const MEMORY_PROBE: &str = "free -m";
const NETWORK_PROBE: &str = "cat /proc/net/dev";
const PROCESS_PROBE: &str = "ps -eo pid,cmd,%mem,%cpu --sort=-%cpu | head -n 10";
const UPTIME_PROBE: &str = "uptime";

const NETWORK_RAW_MAX_CHARS: usize = 200;
const TOP_PROCESS_ROWS: usize = 5;

static CPU_IDLE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"([0-9]+(?:[.,][0-9]+)?)\s*id\b").ok());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub host: String,
    pub cpu_usage_percent: f64,
    pub ram_usage_percent: f64,
    pub disk_usage_percent: f64,
    pub network_raw: String,
    /// Header row first, then the busiest processes.
    pub top_processes: Vec<String>,
    pub uptime_raw: String,
    pub collected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnomalyKind {
    HighCpu,
    HighDisk,
    HighRam,
    ManualCheck,
    Test,
}

impl AnomalyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HighCpu => "high-cpu",
            Self::HighDisk => "high-disk",
            Self::HighRam => "high-ram",
            Self::ManualCheck => "manual-check",
            Self::Test => "test",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub detail: String,
}

impl Anomaly {
    fn new(kind: AnomalyKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.detail)
    }
}

pub struct MetricCollector {
    runner: Arc<dyn CommandRunner>,
    thresholds: ThresholdsConfig,
    policy: PolicyConfig,
}

impl MetricCollector {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        thresholds: ThresholdsConfig,
        policy: PolicyConfig,
    ) -> Self {
        Self {
            runner,
            thresholds,
            policy,
        }
    }

    pub fn thresholds(&self) -> &ThresholdsConfig {
        &self.thresholds
    }

    /// Sample `host` and evaluate anomalies for this cycle.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn collect(&self, host: &str, is_manual: bool) -> (MetricsSnapshot, Vec<Anomaly>) {
        let snapshot = self.sample(host).await;
        let anomalies = evaluate(&snapshot, &self.thresholds, &self.policy, is_manual);
        tracing::info!(
            cpu = snapshot.cpu_usage_percent,
            ram = snapshot.ram_usage_percent,
            disk = snapshot.disk_usage_percent,
            anomalies = anomalies.len(),
            "metrics collected"
        );
        (snapshot, anomalies)
    }

    /// Run every probe in sequence. Failed probes leave their field at its default.
    pub async fn sample(&self, host: &str) -> MetricsSnapshot {
        let cpu = self.probe(host, CPU_PROBE).await;
        let uptime = self.probe(host, UPTIME_PROBE).await;
        let disk = self.probe(host, DISK_PROBE).await;
        let memory = self.probe(host, MEMORY_PROBE).await;
        let network = self.probe(host, NETWORK_PROBE).await;
        let processes = self.probe(host, PROCESS_PROBE).await;

        let self_pid = host
            .eq_ignore_ascii_case(guardian_tools::LOCAL_HOST)
            .then(std::process::id);

        MetricsSnapshot {
            host: host.to_string(),
            cpu_usage_percent: percent(cpu.as_deref().and_then(parse_cpu_usage)),
            ram_usage_percent: percent(memory.as_deref().and_then(parse_ram_usage)),
            disk_usage_percent: percent(disk.as_deref().and_then(parse_disk_usage)),
            network_raw: truncate_network(network.as_deref().unwrap_or_default()),
            top_processes: processes
                .as_deref()
                .map(|raw| top_processes(raw, self_pid, TOP_PROCESS_ROWS))
                .unwrap_or_default(),
            uptime_raw: uptime.unwrap_or_default(),
            collected_at: Utc::now(),
        }
    }

    async fn probe(&self, host: &str, command: &str) -> Option<String> {
        match self.runner.run(command, host).await {
            Ok(out) => Some(out),
            Err(e) => {
                tracing::debug!(command, error = %e, "probe failed; field defaults");
                None
            }
        }
    }
}

/// Threshold breaches (strictly greater), manual-check injection, passive-mode
/// filtering, then the optional test anomaly.
pub fn evaluate(
    snapshot: &MetricsSnapshot,
    thresholds: &ThresholdsConfig,
    policy: &PolicyConfig,
    is_manual: bool,
) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();
    if snapshot.cpu_usage_percent > thresholds.cpu {
        anomalies.push(Anomaly::new(
            AnomalyKind::HighCpu,
            format!(
                "High CPU Usage: {:.2}% (Threshold: {}%)",
                snapshot.cpu_usage_percent, thresholds.cpu
            ),
        ));
    }
    if snapshot.disk_usage_percent > thresholds.disk {
        anomalies.push(Anomaly::new(
            AnomalyKind::HighDisk,
            format!(
                "High Disk Usage: {:.1}% (Threshold: {}%)",
                snapshot.disk_usage_percent, thresholds.disk
            ),
        ));
    }
    if snapshot.ram_usage_percent > thresholds.ram {
        anomalies.push(Anomaly::new(
            AnomalyKind::HighRam,
            format!(
                "High RAM Usage: {:.1}% (Threshold: {}%)",
                snapshot.ram_usage_percent, thresholds.ram
            ),
        ));
    }

    if is_manual && anomalies.is_empty() {
        anomalies.push(Anomaly::new(
            AnomalyKind::ManualCheck,
            "Manual System Check Requested",
        ));
    }

    if policy.passive_mode && !is_manual {
        if !anomalies.is_empty() {
            tracing::debug!(
                suppressed = anomalies.len(),
                "passive mode: threshold breaches not escalated"
            );
        }
        anomalies.clear();
    }

    if policy.test_anomaly {
        anomalies.push(Anomaly::new(AnomalyKind::Test, "Simulated High CPU"));
    }
    anomalies
}

fn percent(v: Option<f64>) -> f64 {
    match v {
        Some(v) if v.is_finite() => v.clamp(0.0, 100.0),
        _ => 0.0,
    }
}

/// `%Cpu(s):  5.9 us,  2.0 sy,  0.0 ni, 92.1 id, ...` gives 7.9.
pub fn parse_cpu_usage(line: &str) -> Option<f64> {
    let re = CPU_IDLE.as_ref()?;
    let caps = re.captures(line)?;
    let idle: f64 = caps.get(1)?.as_str().replace(',', ".").parse().ok()?;
    Some(((100.0 - idle) * 100.0).round() / 100.0)
}

/// The percentage column of the row mounted at `/`.
pub fn parse_disk_usage(df: &str) -> Option<f64> {
    df.lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>())
        .find(|fields| fields.last() == Some(&"/"))?
        .iter()
        .find_map(|f| f.strip_suffix('%'))?
        .parse()
        .ok()
}

/// used / total from the `Mem:` row of `free -m`.
pub fn parse_ram_usage(free: &str) -> Option<f64> {
    let line = free.lines().find(|l| l.trim_start().starts_with("Mem:"))?;
    let mut fields = line.split_whitespace().skip(1);
    let total: f64 = fields.next()?.parse().ok()?;
    let used: f64 = fields.next()?.parse().ok()?;
    if total <= 0.0 {
        return None;
    }
    Some(used / total * 100.0)
}

fn truncate_network(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let mut out: String = raw.chars().take(NETWORK_RAW_MAX_CHARS).collect();
    out.push_str("...");
    out
}

/// Header plus the first `rows` process lines, skipping this process and the
/// probe's own pipeline.
pub fn top_processes(raw: &str, self_pid: Option<u32>, rows: usize) -> Vec<String> {
    let mut lines = raw.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let self_pid = self_pid.map(|p| p.to_string());
    let mut out = vec![header.to_string()];
    out.extend(
        lines
            .filter(|l| {
                let pid = l.split_whitespace().next();
                self_pid.as_deref() != pid && !l.contains("ps -eo pid,cmd")
            })
            .take(rows)
            .map(str::to_string),
    );
    out
}

/// Human-readable snapshot for chat status replies.
pub fn render_status(s: &MetricsSnapshot) -> String {
    let mut msg = format!("📊 *System Status* ({})\n", s.host);
    msg.push_str(&format!("- *cpu_usage*: `{:.2}%`\n", s.cpu_usage_percent));
    msg.push_str(&format!("- *ram_usage*: `{:.1}%`\n", s.ram_usage_percent));
    msg.push_str(&format!("- *disk_usage*: `{:.1}%`\n", s.disk_usage_percent));
    msg.push_str(&format!("- *uptime*: `{}`\n", s.uptime_raw.trim()));
    if s.top_processes.len() > 1 {
        msg.push_str(&format!(
            "- *top_processes*:\n```\n{}\n```\n",
            s.top_processes.join("\n")
        ));
    }
    msg.push_str(&format!("_collected {}_", s.collected_at.format("%Y-%m-%d %H:%M:%S UTC")));
    msg
}

/// Per-metric NORMAL/HIGH report for the chat assistant.
pub fn render_report(s: &MetricsSnapshot, t: &ThresholdsConfig) -> String {
    let label = |v: f64, limit: f64| if v > limit { "HIGH" } else { "NORMAL" };
    format!(
        "Host: {}\nCPU: {:.2}% ({})\nRAM: {:.1}% ({})\nDisk: {:.1}% ({})\nUptime: {}\nTop processes:\n{}",
        s.host,
        s.cpu_usage_percent,
        label(s.cpu_usage_percent, t.cpu),
        s.ram_usage_percent,
        label(s.ram_usage_percent, t.ram),
        s.disk_usage_percent,
        label(s.disk_usage_percent, t.disk),
        s.uptime_raw.trim(),
        s.top_processes.join("\n"),
    )
}
