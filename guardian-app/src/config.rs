//! Guardian configuration loader.
//!
//! Every field has a default, so a missing config file is a valid setup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardianConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub thresholds: ThresholdsConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub hosts: HostsConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Host the monitor cycle samples.
    #[serde(default = "default_monitor_host")]
    pub host: String,
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
}

fn default_monitor_host() -> String {
    "local".to_string()
}

fn default_interval_seconds() -> u64 {
    60
}

fn default_max_steps() -> u32 {
    10
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            host: default_monitor_host(),
            interval_seconds: default_interval_seconds(),
            max_steps: default_max_steps(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdsConfig {
    #[serde(default = "default_cpu_threshold")]
    pub cpu: f64,
    #[serde(default = "default_disk_threshold")]
    pub disk: f64,
    #[serde(default = "default_ram_threshold")]
    pub ram: f64,
}

fn default_cpu_threshold() -> f64 {
    80.0
}

fn default_disk_threshold() -> f64 {
    90.0
}

fn default_ram_threshold() -> f64 {
    90.0
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            cpu: default_cpu_threshold(),
            disk: default_disk_threshold(),
            ram: default_ram_threshold(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Threshold breaches alone never start a diagnosis; only an operator request does.
    #[serde(default = "default_true")]
    pub passive_mode: bool,
    /// Append a synthetic `test` anomaly to every cycle.
    #[serde(default)]
    pub test_anomaly: bool,
}

fn default_true() -> bool {
    true
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            passive_mode: true,
            test_anomaly: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// Sampling temperature for diagnoses.
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_chat_temperature")]
    pub chat_temperature: f32,
    #[serde(default = "default_llm_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_model() -> String {
    "llama3".to_string()
}

fn default_llm_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_chat_temperature() -> f32 {
    0.7
}

fn default_llm_timeout_seconds() -> u64 {
    60
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_llm_base_url(),
            temperature: 0.0,
            chat_temperature: default_chat_temperature(),
            timeout_seconds: default_llm_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysConfig {
    /// Bearer token for OpenAI-compatible endpoints; Ollama needs none.
    pub openai_api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    /// The only chat the bot serves and posts approvals to.
    #[serde(default)]
    pub chat_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default = "default_approval_timeout_seconds")]
    pub timeout_seconds: u64,
    /// First tokens of read-only commands that `investigate` actions may run unattended.
    #[serde(default = "default_auto_approve_commands")]
    pub auto_approve_commands: Vec<String>,
}

fn default_approval_timeout_seconds() -> u64 {
    120
}

fn default_auto_approve_commands() -> Vec<String> {
    [
        "ls",
        "cat",
        "grep",
        "head",
        "tail",
        "who",
        "ps",
        "top",
        "df",
        "free",
        "ip",
        "uptime",
        "journalctl",
        "netstat",
        "ss",
        "search",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_approval_timeout_seconds(),
            auto_approve_commands: default_auto_approve_commands(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostsConfig {
    #[serde(default = "default_hosts_file")]
    pub file: String,
}

fn default_hosts_file() -> String {
    "~/.guardian/hosts.json".to_string()
}

impl Default for HostsConfig {
    fn default() -> Self {
        Self {
            file: default_hosts_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    #[serde(default = "default_knowledge_file")]
    pub file: String,
}

fn default_knowledge_file() -> String {
    "~/.guardian/knowledge.md".to_string()
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            file: default_knowledge_file(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_command_timeout_seconds")]
    pub command_timeout_seconds: u64,
    #[serde(default = "default_ssh_connect_timeout_seconds")]
    pub ssh_connect_timeout_seconds: u64,
}

fn default_command_timeout_seconds() -> u64 {
    60
}

fn default_ssh_connect_timeout_seconds() -> u64 {
    10
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            command_timeout_seconds: default_command_timeout_seconds(),
            ssh_connect_timeout_seconds: default_ssh_connect_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_http_bind")]
    pub bind: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_http_bind() -> String {
    "127.0.0.1:8088".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    64
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_http_bind(),
            timeout_seconds: default_http_timeout_seconds(),
            max_in_flight: default_http_max_in_flight(),
        }
    }
}

impl GuardianConfig {
    /// Load from `path` (or `GUARDIAN_CONFIG`, or the default location), then apply
    /// environment overrides and validate. A missing file yields the defaults.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path
            .or_else(|| {
                std::env::var("GUARDIAN_CONFIG")
                    .ok()
                    .filter(|v| !v.trim().is_empty())
                    .map(|v| expand_home(&v))
            })
            .unwrap_or_else(default_config_path);

        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::parse(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file; using defaults");
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    pub(crate) fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("GUARDIAN_MODEL").or_else(|| get("OLLAMA_MODEL")) {
            self.llm.model = v.trim().to_string();
        }
        if let Some(v) = get("OLLAMA_BASE_URL") {
            self.llm.base_url = v.trim().to_string();
        }
        if let Some(v) = get("OPENAI_API_KEY") {
            self.keys.openai_api_key = Some(v);
        }
        if let Some(v) = get("TELEGRAM_TOKEN") {
            self.telegram.bot_token = v.trim().to_string();
            self.telegram.enabled = true;
        }
        if let Some(v) = get("TELEGRAM_CHAT_ID") {
            self.telegram.chat_id = v.trim().to_string();
        }
        if let Some(v) = get("CPU_THRESHOLD") {
            self.thresholds.cpu = parse_override("CPU_THRESHOLD", &v)?;
        }
        if let Some(v) = get("RAM_THRESHOLD") {
            self.thresholds.ram = parse_override("RAM_THRESHOLD", &v)?;
        }
        if let Some(v) = get("DISK_THRESHOLD") {
            self.thresholds.disk = parse_override("DISK_THRESHOLD", &v)?;
        }
        if let Some(v) = get("TEST_ANOMALY") {
            self.policy.test_anomaly = parse_bool_override("TEST_ANOMALY", &v)?;
        }
        if let Some(v) = get("PASSIVE_MODE") {
            self.policy.passive_mode = parse_bool_override("PASSIVE_MODE", &v)?;
        }
        if let Some(v) = get("GUARDIAN_HOSTS_FILE") {
            self.hosts.file = v.trim().to_string();
        }
        if let Some(v) = get("GUARDIAN_KNOWLEDGE_FILE") {
            self.knowledge.file = v.trim().to_string();
        }
        if let Some(v) = get("GUARDIAN_MONITOR_HOST") {
            self.general.host = v.trim().to_string();
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.llm.model.trim().is_empty() {
            return Err(anyhow::anyhow!("llm.model is required"));
        }
        for (name, v) in [
            ("cpu", self.thresholds.cpu),
            ("disk", self.thresholds.disk),
            ("ram", self.thresholds.ram),
        ] {
            if !(v > 0.0 && v <= 100.0) {
                return Err(anyhow::anyhow!(
                    "thresholds.{name} must be in (0, 100], got {v}"
                ));
            }
        }
        if self.general.max_steps == 0 {
            return Err(anyhow::anyhow!("general.max_steps must be > 0"));
        }
        if self.general.interval_seconds == 0 {
            return Err(anyhow::anyhow!("general.interval_seconds must be > 0"));
        }
        if self.general.host.trim().is_empty() {
            return Err(anyhow::anyhow!("general.host must not be empty"));
        }
        if self.approval.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("approval.timeout_seconds must be > 0"));
        }
        if self.telegram.enabled {
            if self.telegram.bot_token.trim().is_empty() {
                return Err(anyhow::anyhow!("telegram.bot_token is required when telegram is enabled"));
            }
            if self.telegram.chat_id.trim().is_empty() {
                return Err(anyhow::anyhow!("telegram.chat_id is required when telegram is enabled"));
            }
        }
        if self.http.enabled && self.http.max_in_flight == 0 {
            return Err(anyhow::anyhow!("http.max_in_flight must be > 0"));
        }
        Ok(())
    }

    pub fn api_key(&self) -> Option<String> {
        self.keys
            .openai_api_key
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    pub fn llm_settings(&self) -> guardian_llm::LlmSettings {
        guardian_llm::LlmSettings {
            model: self.llm.model.clone(),
            base_url: Some(self.llm.base_url.clone()).filter(|s| !s.trim().is_empty()),
            api_key: self.api_key(),
            timeout: Duration::from_secs(self.llm.timeout_seconds),
        }
    }

    pub fn hosts_path(&self) -> PathBuf {
        expand_home(&self.hosts.file)
    }

    pub fn knowledge_path(&self) -> PathBuf {
        expand_home(&self.knowledge.file)
    }

    pub fn runner_settings(&self) -> guardian_tools::RunnerSettings {
        guardian_tools::RunnerSettings {
            command_timeout: Duration::from_secs(self.execution.command_timeout_seconds),
            ssh_connect_timeout: Duration::from_secs(self.execution.ssh_connect_timeout_seconds),
        }
    }
}

fn parse_override<T: FromStr>(key: &str, raw: &str) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}"))
}

fn parse_bool_override(key: &str, raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow::anyhow!("invalid {key}={other:?}: expected true or false")),
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".guardian").join("config.toml")
}

pub fn expand_home(path: &str) -> PathBuf {
    let trimmed = path.trim();
    if let Some(rest) = trimmed.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = GuardianConfig::parse("").expect("parse empty");
        assert_eq!(cfg.general.host, "local");
        assert_eq!(cfg.general.max_steps, 10);
        assert_eq!(cfg.thresholds, ThresholdsConfig::default());
        assert!(cfg.policy.passive_mode);
        assert_eq!(cfg.approval.timeout_seconds, 120);
        assert!(cfg.approval.auto_approve_commands.iter().any(|c| c == "journalctl"));
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn sections_override_defaults() {
        let cfg = GuardianConfig::parse(
            r#"
[general]
host = "web-01"
max_steps = 3

[thresholds]
cpu = 70.5

[telegram]
enabled = true
bot_token = "t"
chat_id = "42"
"#,
        )
        .expect("parse");
        assert_eq!(cfg.general.host, "web-01");
        assert_eq!(cfg.general.interval_seconds, 60);
        assert_eq!(cfg.thresholds.cpu, 70.5);
        assert_eq!(cfg.thresholds.disk, 90.0);
        cfg.validate().expect("valid");
    }

    #[test]
    fn env_overrides_win_and_enable_telegram() {
        let mut cfg = GuardianConfig::default();
        cfg.apply_overrides_from(lookup(&[
            ("OLLAMA_MODEL", "qwen2.5"),
            ("TELEGRAM_TOKEN", "abc"),
            ("TELEGRAM_CHAT_ID", "99"),
            ("CPU_THRESHOLD", "65"),
            ("PASSIVE_MODE", "false"),
            ("TEST_ANOMALY", "1"),
            ("RAM_THRESHOLD", "  "),
        ]))
        .expect("overrides");
        assert_eq!(cfg.llm.model, "qwen2.5");
        assert!(cfg.telegram.enabled);
        assert_eq!(cfg.telegram.chat_id, "99");
        assert_eq!(cfg.thresholds.cpu, 65.0);
        assert_eq!(cfg.thresholds.ram, 90.0);
        assert!(!cfg.policy.passive_mode);
        assert!(cfg.policy.test_anomaly);
    }

    #[test]
    fn guardian_model_beats_ollama_model() {
        let mut cfg = GuardianConfig::default();
        cfg.apply_overrides_from(lookup(&[
            ("GUARDIAN_MODEL", "gpt-4o-mini"),
            ("OLLAMA_MODEL", "llama3.1"),
        ]))
        .expect("overrides");
        assert_eq!(cfg.llm.model, "gpt-4o-mini");
    }

    #[test]
    fn bad_numeric_override_names_the_variable() {
        let mut cfg = GuardianConfig::default();
        let err = cfg
            .apply_overrides_from(lookup(&[("DISK_THRESHOLD", "ninety")]))
            .expect_err("not a number");
        assert!(err.to_string().contains("DISK_THRESHOLD"));
    }

    #[test]
    fn validate_rejects_out_of_range_and_missing_chat_id() {
        let mut cfg = GuardianConfig::default();
        cfg.thresholds.ram = 120.0;
        assert!(cfg.validate().is_err());

        let mut cfg = GuardianConfig::default();
        cfg.telegram.enabled = true;
        cfg.telegram.bot_token = "t".to_string();
        let err = cfg.validate().expect_err("chat id required");
        assert!(err.to_string().contains("chat_id"));

        let mut cfg = GuardianConfig::default();
        cfg.general.max_steps = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn blank_api_key_counts_as_absent() {
        let mut cfg = GuardianConfig::default();
        cfg.keys.openai_api_key = Some("  ".to_string());
        assert_eq!(cfg.api_key(), None);
        cfg.keys.openai_api_key = Some(" sk-o ".to_string());
        cfg.llm.model = "gpt-4o".to_string();
        assert_eq!(cfg.llm_settings().api_key.as_deref(), Some("sk-o"));
    }

    #[tokio::test]
    async fn load_reads_explicit_path_and_tolerates_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "[general]\ninterval_seconds = 5\n")
            .await
            .expect("write config");
        let (cfg, used) = GuardianConfig::load(Some(path.clone())).await.expect("load");
        assert_eq!(used, path);
        assert_eq!(cfg.general.interval_seconds, 5);

        let (cfg, _) = GuardianConfig::load(Some(dir.path().join("absent.toml")))
            .await
            .expect("missing file is fine");
        assert_eq!(cfg.general.interval_seconds, 60);
    }
}
