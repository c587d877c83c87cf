//! Approval gate: decides whether a proposed command may run.
//!
//! Allow-listed `investigate` actions run unattended. Everything else is
//! escalated, either to the operator channel (bounded wait) or to a direct
//! yes/no prompt when no channel is configured.

use crate::diagnosis::{ActionType, FINISH};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::io::{BufRead as _, Write as _};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

pub const APPROVE_PREFIX: &str = "approve:";
pub const DENY_PREFIX: &str = "deny:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalProvenance {
    AutoApproved,
    HumanApproved,
    HumanDenied,
    TimedOutDenied,
    CliApproved,
    CliDenied,
    Finished,
    Superseded,
    Undeliverable,
}

impl ApprovalProvenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutoApproved => "auto-approved",
            Self::HumanApproved => "human-approved",
            Self::HumanDenied => "human-denied",
            Self::TimedOutDenied => "timed-out-denied",
            Self::CliApproved => "cli-approved",
            Self::CliDenied => "cli-denied",
            Self::Finished => "finished",
            Self::Superseded => "superseded",
            Self::Undeliverable => "undeliverable",
        }
    }

    fn approves(self) -> bool {
        matches!(
            self,
            Self::AutoApproved | Self::HumanApproved | Self::CliApproved
        )
    }
}

impl fmt::Display for ApprovalProvenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ApprovalOutcome {
    pub approved: bool,
    pub provenance: ApprovalProvenance,
}

impl From<ApprovalProvenance> for ApprovalOutcome {
    fn from(provenance: ApprovalProvenance) -> Self {
        Self {
            approved: provenance.approves(),
            provenance,
        }
    }
}

/// Decode `approve:<id>` / `deny:<id>` callback data.
pub fn parse_choice(data: &str) -> Option<(Uuid, bool)> {
    let (raw, approved) = if let Some(rest) = data.strip_prefix(APPROVE_PREFIX) {
        (rest, true)
    } else if let Some(rest) = data.strip_prefix(DENY_PREFIX) {
        (rest, false)
    } else {
        return None;
    };
    Uuid::parse_str(raw.trim()).ok().map(|id| (id, approved))
}

struct Pending {
    id: Uuid,
    action: String,
    tx: oneshot::Sender<bool>,
}

/// Holds at most one outstanding escalation.
///
/// Each escalation gets a fresh one-shot channel. Arming a new one drops the
/// previous sender, which the previous waiter observes as `Superseded`.
#[derive(Default)]
pub struct ApprovalBroker {
    pending: Mutex<Option<Pending>>,
}

pub struct ArmedApproval {
    pub id: Uuid,
    rx: oneshot::Receiver<bool>,
}

impl ApprovalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an escalation for `action`, replacing any outstanding one.
    pub fn arm(&self, action: impl Into<String>) -> ArmedApproval {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let previous = self.lock().replace(Pending {
            id,
            action: action.into(),
            tx,
        });
        if let Some(previous) = previous {
            tracing::warn!(superseded = %previous.id, id = %id, "replacing outstanding escalation");
        }
        ArmedApproval { id, rx }
    }

    /// Deliver a decision and return the action it was about. `None` for
    /// stale or unknown ids.
    pub fn resolve(&self, id: Uuid, approved: bool) -> Option<String> {
        let pending = {
            let mut slot = self.lock();
            match slot.as_ref() {
                Some(p) if p.id == id => slot.take(),
                _ => None,
            }
        };
        let p = pending?;
        p.tx.send(approved).ok().map(|()| p.action)
    }

    /// Drop the escalation `id` if it is still the outstanding one.
    pub fn withdraw(&self, id: Uuid) {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|p| p.id == id) {
            slot.take();
        }
    }

    pub fn outstanding(&self) -> Option<Uuid> {
        self.lock().as_ref().map(|p| p.id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Pending>> {
        // The slot holds plain data; a poisoned lock is still consistent.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Posts an approve/deny request to the operator.
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    async fn request_approval(&self, id: Uuid, diagnosis: &str, action: &str)
    -> anyhow::Result<()>;
}

/// Direct yes/no prompt used when no channel is configured.
#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    async fn confirm(&self, diagnosis: &str, action: &str) -> bool;
}

pub struct StdinPrompt;

#[async_trait]
impl OperatorPrompt for StdinPrompt {
    async fn confirm(&self, diagnosis: &str, action: &str) -> bool {
        let diagnosis = diagnosis.to_string();
        let action = action.to_string();
        let answer = tokio::task::spawn_blocking(move || {
            let mut out = std::io::stdout().lock();
            let _ = writeln!(out, "\nDiagnosis: {diagnosis}\nProposed action: {action}");
            let _ = write!(out, "Do you approve this action? (y/n): ");
            let _ = out.flush();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;
        match answer {
            Ok(Ok(line)) => answer_approves(&line),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failed to read approval answer, denying");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "approval prompt task failed, denying");
                false
            }
        }
    }
}

/// "y", "Y", "yes", "Yep" approve; anything else denies.
fn answer_approves(line: &str) -> bool {
    line.trim().to_ascii_lowercase().starts_with('y')
}

pub enum Escalation {
    Channel(Arc<dyn ApprovalChannel>),
    Prompt(Arc<dyn OperatorPrompt>),
}

pub struct ApprovalGate {
    broker: Arc<ApprovalBroker>,
    escalation: Escalation,
    allow_list: Vec<String>,
    timeout: Duration,
}

impl ApprovalGate {
    pub fn new(
        broker: Arc<ApprovalBroker>,
        escalation: Escalation,
        allow_list: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            broker,
            escalation,
            allow_list,
            timeout,
        }
    }

    /// Whether `action` would run without a human decision.
    pub fn auto_approves(&self, action: &str, action_type: ActionType) -> bool {
        action_type == ActionType::Investigate
            && action
                .split_whitespace()
                .next()
                .is_some_and(|verb| self.allow_list.iter().any(|a| a == verb))
    }

    #[tracing::instrument(level = "info", skip_all, fields(action = %action, action_type = %action_type))]
    pub async fn decide(
        &self,
        action: &str,
        action_type: ActionType,
        diagnosis: &str,
    ) -> ApprovalOutcome {
        if action_type == ActionType::Finish || action.trim() == FINISH {
            return ApprovalProvenance::Finished.into();
        }
        if self.auto_approves(action, action_type) {
            tracing::info!("auto-approved read-only investigation");
            return ApprovalProvenance::AutoApproved.into();
        }

        let outcome: ApprovalOutcome = match &self.escalation {
            Escalation::Channel(channel) => {
                self.escalate(channel.as_ref(), action, diagnosis).await
            }
            Escalation::Prompt(prompt) => {
                if prompt.confirm(diagnosis, action).await {
                    ApprovalProvenance::CliApproved.into()
                } else {
                    ApprovalProvenance::CliDenied.into()
                }
            }
        };
        tracing::info!(
            approved = outcome.approved,
            provenance = %outcome.provenance,
            "approval resolved"
        );
        outcome
    }

    async fn escalate(
        &self,
        channel: &dyn ApprovalChannel,
        action: &str,
        diagnosis: &str,
    ) -> ApprovalOutcome {
        let armed = self.broker.arm(action);
        let id = armed.id;

        if let Err(e) = channel.request_approval(id, diagnosis, action).await {
            tracing::error!(error = %e, id = %id, "could not post approval request");
            self.broker.withdraw(id);
            return ApprovalProvenance::Undeliverable.into();
        }

        match tokio::time::timeout(self.timeout, armed.rx).await {
            Ok(Ok(true)) => ApprovalProvenance::HumanApproved.into(),
            Ok(Ok(false)) => ApprovalProvenance::HumanDenied.into(),
            Ok(Err(_)) => ApprovalProvenance::Superseded.into(),
            Err(_) => {
                self.broker.withdraw(id);
                tracing::warn!(
                    id = %id,
                    timeout_secs = self.timeout.as_secs(),
                    "approval timed out, denying"
                );
                ApprovalProvenance::TimedOutDenied.into()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingChannel {
        requests: Mutex<Vec<(Uuid, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl ApprovalChannel for RecordingChannel {
        async fn request_approval(
            &self,
            id: Uuid,
            _diagnosis: &str,
            action: &str,
        ) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("chat not found");
            }
            self.requests
                .lock()
                .expect("lock")
                .push((id, action.to_string()));
            Ok(())
        }
    }

    struct FixedPrompt {
        answer: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OperatorPrompt for FixedPrompt {
        async fn confirm(&self, _diagnosis: &str, _action: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer
        }
    }

    fn allow_list() -> Vec<String> {
        ["ls", "cat", "ps", "df", "search"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn channel_gate(channel: Arc<RecordingChannel>, timeout: Duration) -> (ApprovalGate, Arc<ApprovalBroker>) {
        let broker = Arc::new(ApprovalBroker::new());
        let gate = ApprovalGate::new(
            broker.clone(),
            Escalation::Channel(channel),
            allow_list(),
            timeout,
        );
        (gate, broker)
    }

    #[tokio::test]
    async fn allow_listed_investigation_skips_escalation() {
        let channel = Arc::new(RecordingChannel::default());
        let (gate, _) = channel_gate(channel.clone(), Duration::from_secs(5));
        let out = gate.decide("ps aux", ActionType::Investigate, "cpu high").await;
        assert!(out.approved);
        assert_eq!(out.provenance, ApprovalProvenance::AutoApproved);
        assert!(channel.requests.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn finish_short_circuits_without_escalation() {
        let channel = Arc::new(RecordingChannel::default());
        let (gate, _) = channel_gate(channel.clone(), Duration::from_secs(5));
        let out = gate.decide("FINISH", ActionType::Investigate, "done").await;
        assert_eq!(out, ApprovalProvenance::Finished.into());
        let out = gate.decide("ls", ActionType::Finish, "done").await;
        assert!(!out.approved);
        assert!(channel.requests.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn fix_is_escalated_even_when_allow_listed() {
        let channel = Arc::new(RecordingChannel::default());
        let (gate, broker) = channel_gate(channel.clone(), Duration::from_secs(5));
        let decide = tokio::spawn(async move {
            gate.decide("ps aux", ActionType::Fix, "cpu high").await
        });

        let id = loop {
            if let Some(id) = broker.outstanding() {
                break id;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(broker.resolve(id, true).as_deref(), Some("ps aux"));
        let out = decide.await.expect("join");
        assert_eq!(out.provenance, ApprovalProvenance::HumanApproved);
        assert_eq!(channel.requests.lock().expect("lock").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_escalation_times_out_as_denial() {
        let channel = Arc::new(RecordingChannel::default());
        let (gate, broker) = channel_gate(channel, Duration::from_secs(120));
        let out = gate
            .decide("systemctl restart nginx", ActionType::Fix, "nginx down")
            .await;
        assert!(!out.approved);
        assert_eq!(out.provenance, ApprovalProvenance::TimedOutDenied);
        assert!(broker.outstanding().is_none());
    }

    #[tokio::test]
    async fn stale_ids_are_ignored() {
        let broker = ApprovalBroker::new();
        let first = broker.arm("df -h");
        let second = broker.arm("du -sh /var");
        assert_eq!(broker.resolve(first.id, true), None);
        assert_eq!(broker.resolve(second.id, false).as_deref(), Some("du -sh /var"));
        assert_eq!(broker.resolve(second.id, true), None);
        assert!(first.rx.await.is_err());
        assert_eq!(second.rx.await.ok(), Some(false));
    }

    #[tokio::test]
    async fn newer_escalation_supersedes_waiting_one() {
        let channel = Arc::new(RecordingChannel::default());
        let (gate, broker) = channel_gate(channel, Duration::from_secs(30));
        let decide = tokio::spawn(async move {
            gate.decide("rm /tmp/big.log", ActionType::Fix, "disk full").await
        });
        while broker.outstanding().is_none() {
            tokio::task::yield_now().await;
        }
        let _replacement = broker.arm("ls /tmp");
        let out = decide.await.expect("join");
        assert_eq!(out.provenance, ApprovalProvenance::Superseded);
        assert!(!out.approved);
    }

    #[tokio::test]
    async fn undeliverable_request_fails_closed() {
        let channel = Arc::new(RecordingChannel {
            fail: true,
            ..Default::default()
        });
        let (gate, broker) = channel_gate(channel, Duration::from_secs(30));
        let out = gate.decide("reboot", ActionType::Fix, "kernel panic").await;
        assert_eq!(out.provenance, ApprovalProvenance::Undeliverable);
        assert!(broker.outstanding().is_none());
    }

    #[tokio::test]
    async fn prompt_fallback_is_used_without_channel() {
        let prompt = Arc::new(FixedPrompt {
            answer: false,
            calls: AtomicUsize::new(0),
        });
        let gate = ApprovalGate::new(
            Arc::new(ApprovalBroker::new()),
            Escalation::Prompt(prompt.clone()),
            allow_list(),
            Duration::from_secs(1),
        );
        let out = gate.decide("kill 1234", ActionType::Fix, "runaway").await;
        assert_eq!(out.provenance, ApprovalProvenance::CliDenied);
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn prompt_answers_starting_with_y_approve() {
        for answer in ["y\n", "Y", "yes\n", "  Yes please "] {
            assert!(answer_approves(answer), "{answer:?}");
        }
        for answer in ["n\n", "", "no", "sure", " \n"] {
            assert!(!answer_approves(answer), "{answer:?}");
        }
    }

    #[test]
    fn callback_data_round_trips() {
        let id = Uuid::new_v4();
        assert_eq!(parse_choice(&format!("approve:{id}")), Some((id, true)));
        assert_eq!(parse_choice(&format!("deny:{id}")), Some((id, false)));
        assert_eq!(parse_choice("approve"), None);
        assert_eq!(parse_choice("approve:not-a-uuid"), None);
    }
}
