use crate::error::ExecutionError;
use crate::hosts::{HostKind, HostRegistry};
use crate::shell::run_local;
use crate::ssh::{SshTarget, exec_blocking};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Runs a shell command on a named host and returns its trimmed stdout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str, host: &str) -> Result<String, ExecutionError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RunnerSettings {
    pub command_timeout: Duration,
    pub ssh_connect_timeout: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(60),
            ssh_connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Dispatches to a local shell or a fresh SSH session depending on the host kind.
pub struct HostCommandRunner {
    registry: Arc<HostRegistry>,
    settings: RunnerSettings,
}

impl HostCommandRunner {
    pub fn new(registry: Arc<HostRegistry>, settings: RunnerSettings) -> Self {
        Self { registry, settings }
    }

    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }
}

#[async_trait]
impl CommandRunner for HostCommandRunner {
    #[tracing::instrument(level = "info", skip(self), fields(kind = tracing::field::Empty))]
    async fn run(&self, command: &str, host: &str) -> Result<String, ExecutionError> {
        let Some(descriptor) = self.registry.resolve(host) else {
            tracing::warn!("unknown host");
            return Err(ExecutionError::HostNotFound(host.to_string()));
        };

        let started = Instant::now();
        let result = match descriptor.kind {
            HostKind::Local => {
                tracing::Span::current().record("kind", "local");
                run_local(command, self.settings.command_timeout).await
            }
            HostKind::Ssh => {
                tracing::Span::current().record("kind", "ssh");
                let target = SshTarget::from_descriptor(&descriptor)?;
                let command = command.to_string();
                let settings = self.settings;
                tokio::task::spawn_blocking(move || {
                    exec_blocking(
                        &target,
                        &command,
                        settings.ssh_connect_timeout,
                        settings.command_timeout,
                    )
                })
                .await
                .map_err(|e| ExecutionError::Io(format!("ssh task failed: {e}")))?
            }
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(out) => tracing::debug!(latency_ms, bytes = out.len(), "command succeeded"),
            Err(e) => tracing::info!(latency_ms, error = %e, "command failed"),
        }
        result
    }
}

/// Text form of an execution result: stdout on success, the error rendering otherwise.
pub fn outcome_text(result: &Result<String, ExecutionError>) -> String {
    match result {
        Ok(out) => out.clone(),
        Err(e) => e.to_string(),
    }
}
