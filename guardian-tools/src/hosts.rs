use crate::error::HostConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const LOCAL_HOST: &str = "local";
const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKind {
    Local,
    #[serde(alias = "remote-shell", alias = "remote_shell")]
    Ssh,
}

impl HostKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HostKind::Local => "local",
            HostKind::Ssh => "ssh",
        }
    }
}

/// A named execution target from the hosts file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDescriptor {
    pub name: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: HostKind,
    #[serde(default, alias = "address")]
    pub ip: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub description: String,
}

fn default_kind() -> HostKind {
    HostKind::Local
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl HostDescriptor {
    pub fn local() -> Self {
        Self {
            name: LOCAL_HOST.to_string(),
            kind: HostKind::Local,
            ip: None,
            port: DEFAULT_SSH_PORT,
            user: None,
            key_path: None,
            description: "The machine the guardian runs on".to_string(),
        }
    }

    pub fn summary_line(&self) -> String {
        let location = match self.kind {
            HostKind::Local => "local".to_string(),
            HostKind::Ssh => format!(
                "{}@{}:{}",
                self.user.as_deref().unwrap_or("?"),
                self.ip.as_deref().unwrap_or("?"),
                self.port
            ),
        };
        if self.description.trim().is_empty() {
            format!("- {} ({location})", self.name)
        } else {
            format!("- {}: {} ({location})", self.name, self.description.trim())
        }
    }

    fn validate(&self) -> Result<(), HostConfigError> {
        if self.name.trim().is_empty() {
            return Err(HostConfigError::Invalid {
                name: self.name.clone(),
                reason: "name must not be empty".to_string(),
            });
        }
        if self.kind == HostKind::Ssh {
            let missing = |v: &Option<String>| v.as_deref().map(str::trim).unwrap_or("").is_empty();
            if missing(&self.ip) {
                return Err(HostConfigError::Invalid {
                    name: self.name.clone(),
                    reason: "ssh hosts need an ip".to_string(),
                });
            }
            if missing(&self.user) {
                return Err(HostConfigError::Invalid {
                    name: self.name.clone(),
                    reason: "ssh hosts need a user".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct HostsFile {
    #[serde(default)]
    hosts: Vec<HostDescriptor>,
}

/// Named execution targets. The name `local` always resolves, even when the
/// hosts file does not list it.
#[derive(Debug, Clone, Default)]
pub struct HostRegistry {
    hosts: Vec<HostDescriptor>,
}

impl HostRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_hosts(hosts: Vec<HostDescriptor>) -> Result<Self, HostConfigError> {
        for h in &hosts {
            h.validate()?;
        }
        Ok(Self { hosts })
    }

    pub fn parse(raw: &str) -> Result<Self, HostConfigError> {
        let file: HostsFile =
            serde_json::from_str(raw).map_err(|e| HostConfigError::Parse(e.to_string()))?;
        Self::from_hosts(file.hosts)
    }

    /// Load the hosts file. A missing file yields a registry with only `local`.
    #[tracing::instrument(level = "debug")]
    pub async fn load(path: &Path) -> Result<Self, HostConfigError> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => {
                let registry = Self::parse(&raw)?;
                tracing::info!(path = %path.display(), hosts = registry.hosts.len(), "hosts file loaded");
                Ok(registry)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no hosts file; only local execution available");
                Ok(Self::empty())
            }
            Err(e) => Err(HostConfigError::Io {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }

    /// Case-insensitive lookup by name.
    pub fn resolve(&self, name: &str) -> Option<HostDescriptor> {
        let name = name.trim();
        if let Some(h) = self
            .hosts
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
        {
            return Some(h.clone());
        }
        if name.eq_ignore_ascii_case(LOCAL_HOST) {
            return Some(HostDescriptor::local());
        }
        None
    }

    pub fn hosts(&self) -> &[HostDescriptor] {
        &self.hosts
    }

    /// Every reachable host, `local` first when the file does not define it.
    pub fn listing(&self) -> Vec<HostDescriptor> {
        let mut out = Vec::with_capacity(self.hosts.len() + 1);
        if !self
            .hosts
            .iter()
            .any(|h| h.name.eq_ignore_ascii_case(LOCAL_HOST))
        {
            out.push(HostDescriptor::local());
        }
        out.extend(self.hosts.iter().cloned());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "hosts": [
            {"name": "web-01", "type": "ssh", "ip": "10.0.0.5", "user": "admin", "key_path": "/home/admin/.ssh/id_ed25519", "description": "Nginx front"},
            {"name": "db", "type": "remote-shell", "ip": "10.0.0.6", "port": 2222, "user": "root"}
        ]
    }"#;

    #[test]
    fn parses_hosts_and_resolves_case_insensitively() {
        let reg = HostRegistry::parse(SAMPLE).expect("parse hosts");
        let web = reg.resolve("WEB-01").expect("web-01 resolves");
        assert_eq!(web.kind, HostKind::Ssh);
        assert_eq!(web.port, 22);
        assert_eq!(web.ip.as_deref(), Some("10.0.0.5"));

        let db = reg.resolve("db").expect("db resolves");
        assert_eq!(db.kind, HostKind::Ssh);
        assert_eq!(db.port, 2222);
        assert!(reg.resolve("cache").is_none());
    }

    #[test]
    fn local_always_resolves() {
        let reg = HostRegistry::empty();
        assert_eq!(reg.resolve("local").map(|h| h.kind), Some(HostKind::Local));
        assert_eq!(reg.resolve("LOCAL").map(|h| h.kind), Some(HostKind::Local));
        assert_eq!(reg.listing().len(), 1);
    }

    #[test]
    fn ssh_host_without_user_is_rejected() {
        let err = HostRegistry::parse(r#"{"hosts":[{"name":"x","type":"ssh","ip":"1.2.3.4"}]}"#)
            .expect_err("user is required");
        assert!(err.to_string().contains("need a user"));
    }

    #[tokio::test]
    async fn missing_file_is_an_empty_registry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = HostRegistry::load(&dir.path().join("hosts.json"))
            .await
            .expect("missing file is fine");
        assert!(reg.hosts().is_empty());
    }

    #[tokio::test]
    async fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hosts.json");
        tokio::fs::write(&path, SAMPLE).await.expect("write hosts");
        let reg = HostRegistry::load(&path).await.expect("load hosts");
        assert_eq!(reg.hosts().len(), 2);
        assert_eq!(reg.listing()[0].name, "local");
        assert!(reg.listing()[1].summary_line().contains("admin@10.0.0.5:22"));
    }
}
