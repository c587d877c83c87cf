//! Monitor → Diagnose → Review → Execute.
//!
//! One [`InvestigationState`] is threaded through a cycle. Review and Execute
//! loop back to Diagnose until the collaborator finishes, the gate denies, the
//! step budget runs out, or the proposal sanitizes to nothing.

use crate::approval::{ApprovalGate, ApprovalProvenance};
use crate::context::GuardianContext;
use crate::diagnosis::{ActionType, Diagnoser, DiagnosisRequest, FINISH, Proposal};
use crate::metrics::{Anomaly, MetricCollector, MetricsSnapshot};
use crate::notifier::{Notifier, truncate_chars};
use crate::sanitizer::sanitize;
use guardian_tools::{CommandRunner, WebSearch, outcome_text};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const SEARCH_PREFIX: &str = "search ";
const HISTORY_OUTPUT_CHARS: usize = 500;
const REASONING_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct InvestigationState {
    pub metrics: MetricsSnapshot,
    pub anomalies: Vec<Anomaly>,
    pub diagnosis: String,
    pub proposed_action: String,
    pub action_type: ActionType,
    pub human_approval: bool,
    pub history: Vec<String>,
    pub steps_count: u32,
}

impl InvestigationState {
    fn new(metrics: MetricsSnapshot, anomalies: Vec<Anomaly>) -> Self {
        Self {
            metrics,
            anomalies,
            diagnosis: String::new(),
            proposed_action: String::new(),
            action_type: ActionType::None,
            human_approval: false,
            history: Vec::new(),
            steps_count: 0,
        }
    }

    fn apply(&mut self, proposal: Proposal) {
        self.diagnosis = proposal.diagnosis;
        self.action_type = proposal.action_type;
        self.proposed_action = if proposal.proposed_action.trim() == FINISH {
            FINISH.to_string()
        } else {
            sanitize(&proposal.proposed_action)
        };
        self.human_approval = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "provenance")]
pub enum Termination {
    Healthy,
    Finished,
    Denied(ApprovalProvenance),
    StepLimit,
    InvalidAction,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            Self::Finished => f.write_str("finished"),
            Self::Denied(p) => write!(f, "denied ({p})"),
            Self::StepLimit => f.write_str("step limit reached"),
            Self::InvalidAction => f.write_str("invalid action"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub termination: Termination,
    pub state: InvestigationState,
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub host: String,
    pub max_steps: u32,
    pub interval: Duration,
}

pub struct ControlLoop {
    ctx: Arc<GuardianContext>,
    collector: MetricCollector,
    diagnoser: Arc<dyn Diagnoser>,
    gate: Arc<ApprovalGate>,
    runner: Arc<dyn CommandRunner>,
    search: Arc<dyn WebSearch>,
    notifier: Arc<Notifier>,
    settings: LoopSettings,
}

impl ControlLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: Arc<GuardianContext>,
        collector: MetricCollector,
        diagnoser: Arc<dyn Diagnoser>,
        gate: Arc<ApprovalGate>,
        runner: Arc<dyn CommandRunner>,
        search: Arc<dyn WebSearch>,
        notifier: Arc<Notifier>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            ctx,
            collector,
            diagnoser,
            gate,
            runner,
            search,
            notifier,
            settings,
        }
    }

    /// Run cycles until cancelled: one immediately, then on each interval
    /// tick or manual wake-up, whichever comes first.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            host = %self.settings.host,
            interval_secs = self.settings.interval.as_secs(),
            max_steps = self.settings.max_steps,
            "control loop started"
        );
        loop {
            let is_manual = self.ctx.take_manual_trigger();
            let report = tokio::select! {
                _ = cancel.cancelled() => break,
                report = self.run_cycle(is_manual) => report,
            };
            tracing::info!(
                termination = %report.termination,
                steps_count = report.state.steps_count,
                "cycle complete"
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {}
                _ = self.ctx.manual_check_requested() => {
                    tracing::info!("manual check requested");
                }
            }
        }
        self.ctx.clear_review();
        tracing::info!("control loop stopped");
    }

    #[tracing::instrument(level = "info", skip(self), fields(host = %self.settings.host))]
    pub async fn run_cycle(&self, is_manual: bool) -> CycleReport {
        let (metrics, anomalies) = self.collector.collect(&self.settings.host, is_manual).await;
        self.ctx.publish_snapshot(metrics.clone());
        let mut state = InvestigationState::new(metrics, anomalies);

        let termination = self.investigate(&mut state).await;
        self.ctx.clear_review();

        if !state.anomalies.is_empty() {
            self.notifier
                .post(&format!(
                    "🩺 *Investigation ended* ({termination})\n\n{}",
                    state.diagnosis
                ))
                .await;
        }
        CycleReport { termination, state }
    }

    async fn investigate(&self, state: &mut InvestigationState) -> Termination {
        loop {
            if state.anomalies.is_empty() && state.history.is_empty() {
                state.apply(Proposal::healthy());
                return Termination::Healthy;
            }
            if state.steps_count >= self.settings.max_steps {
                tracing::warn!(steps_count = state.steps_count, "step budget exhausted");
                return Termination::StepLimit;
            }

            let proposal = self.diagnose(state).await;
            state.apply(proposal);
            tracing::info!(
                action_type = %state.action_type,
                action = %state.proposed_action,
                steps_count = state.steps_count,
                "diagnosis received"
            );

            if state.proposed_action.is_empty() && state.action_type != ActionType::Finish {
                tracing::warn!("proposal sanitized to an empty command");
                return Termination::InvalidAction;
            }
            if is_search(&state.proposed_action)
                && search_query(&state.proposed_action).is_none()
            {
                tracing::warn!(action = %state.proposed_action, "search proposal without a query");
                return Termination::InvalidAction;
            }

            self.ctx.set_review(&state.diagnosis, &state.proposed_action);
            let outcome = self
                .gate
                .decide(&state.proposed_action, state.action_type, &state.diagnosis)
                .await;
            state.human_approval = outcome.approved;
            if !outcome.approved {
                return match outcome.provenance {
                    ApprovalProvenance::Finished => Termination::Finished,
                    other => {
                        if other == ApprovalProvenance::TimedOutDenied {
                            self.notifier
                                .post(&format!(
                                    "⌛ Approval timed out, not running `{}`",
                                    state.proposed_action
                                ))
                                .await;
                        }
                        Termination::Denied(other)
                    }
                };
            }
            if outcome.provenance == ApprovalProvenance::AutoApproved {
                let preview = truncate_chars(&state.diagnosis, REASONING_PREVIEW_CHARS);
                let ellipsis = if preview.len() < state.diagnosis.len() {
                    "..."
                } else {
                    ""
                };
                self.notifier
                    .post_execution_result(
                        &format!("(Auto) {}", state.proposed_action),
                        &format!("🧠 Reasoning: {preview}{ellipsis}\n\nRunning investigation..."),
                    )
                    .await;
            }

            self.execute(state).await;
        }
    }

    async fn diagnose(&self, state: &InvestigationState) -> Proposal {
        let req = DiagnosisRequest {
            metrics: &state.metrics,
            anomalies: &state.anomalies,
            history: &state.history,
        };
        match self.diagnoser.diagnose(req).await {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "diagnosis failed; finishing cycle");
                Proposal::degraded(&e)
            }
        }
    }

    async fn execute(&self, state: &mut InvestigationState) {
        let action = state.proposed_action.clone();
        let started = Instant::now();
        let (ok, output) = match search_query(&action) {
            Some(query) => (true, self.search.search(query).await),
            None => {
                let result = self.runner.run(&action, &self.settings.host).await;
                (result.is_ok(), outcome_text(&result))
            }
        };
        tracing::info!(
            command = %action,
            ok,
            latency_ms = started.elapsed().as_millis() as u64,
            "action executed"
        );

        self.notifier.post_execution_result(&action, &output).await;

        let label = if ok { "[SUCCESS]" } else { "[FAILURE]" };
        state.history.push(format!(
            "{label} Command: {action}\nOutput: {}",
            truncate_chars(&output, HISTORY_OUTPUT_CHARS)
        ));
        state.steps_count += 1;
    }
}

fn is_search(action: &str) -> bool {
    action == SEARCH_PREFIX.trim_end() || action.starts_with(SEARCH_PREFIX)
}

/// `search "nginx 502"` → `nginx 502`.
fn search_query(action: &str) -> Option<&str> {
    let query = action
        .strip_prefix(SEARCH_PREFIX)?
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim();
    (!query.is_empty()).then_some(query)
}
