//! Guardian runtime wiring.
//!
//! Builds the shared context, the approval gate, the control loop and the chat
//! gateway from config, and mounts the optional HTTP status surface.

use crate::approval::{ApprovalBroker, ApprovalGate, Escalation, StdinPrompt};
use crate::assistant::Assistant;
use crate::config::GuardianConfig;
use crate::context::GuardianContext;
use crate::control_loop::{ControlLoop, LoopSettings};
use crate::diagnosis::LlmDiagnoser;
use crate::gateway::Gateway;
use crate::metrics::MetricCollector;
use crate::notifier::Notifier;
use crate::routes;
use crate::session::SessionManager;
use crate::tools::{GatedCommandTool, SystemMetricsTool};
use anyhow::Result;
use axum::Extension;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use guardian_channels::{ChannelAdapter, TelegramAdapter};
use guardian_llm::{LlmClient, validate_tool_name};
use guardian_tools::{
    CommandRunner, DuckDuckGoSearch, HostCommandRunner, HostRegistry, KnowledgeStore,
    SaveKnowledgeTool, SystemLogsTool, TerminalCommandTool, Tool, WebSearch, WebSearchTool,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const INBOUND_BUFFER: usize = 256;

/// State shared with the HTTP handlers.
pub struct ApiState {
    pub ctx: Arc<GuardianContext>,
    pub started_at: Instant,
    pub host: String,
}

/// Everything a cycle or a chat turn needs, built once from config.
struct Runtime {
    cfg: GuardianConfig,
    ctx: Arc<GuardianContext>,
    hosts: Arc<HostRegistry>,
    runner: Arc<dyn CommandRunner>,
    search: Arc<dyn WebSearch>,
    knowledge: KnowledgeStore,
    llm: LlmClient,
    telegram: Option<Arc<dyn ChannelAdapter>>,
    notifier: Arc<Notifier>,
    gate: Arc<ApprovalGate>,
}

impl Runtime {
    /// `with_chat` connects Telegram when configured; without it every
    /// escalation goes to the terminal prompt.
    #[tracing::instrument(level = "info", skip_all, fields(with_chat = with_chat))]
    async fn build(cfg: GuardianConfig, with_chat: bool) -> Result<Self> {
        let hosts = Arc::new(HostRegistry::load(&cfg.hosts_path()).await?);
        let runner: Arc<dyn CommandRunner> = Arc::new(HostCommandRunner::new(
            hosts.clone(),
            cfg.runner_settings(),
        ));
        let search: Arc<dyn WebSearch> = Arc::new(DuckDuckGoSearch::new()?);
        let knowledge = KnowledgeStore::new(cfg.knowledge_path());
        let llm = LlmClient::new(cfg.llm_settings())?;

        let telegram: Option<Arc<dyn ChannelAdapter>> = if with_chat && cfg.telegram.enabled {
            Some(Arc::new(TelegramAdapter::new(&cfg.telegram.bot_token)?))
        } else {
            None
        };
        let notifier = Arc::new(match telegram.as_ref() {
            Some(channel) => Notifier::new(channel.clone(), cfg.telegram.chat_id.trim()),
            None => Notifier::disabled(),
        });
        let escalation = if notifier.is_enabled() {
            Escalation::Channel(notifier.clone())
        } else {
            Escalation::Prompt(Arc::new(StdinPrompt))
        };

        let broker = Arc::new(ApprovalBroker::new());
        let ctx = Arc::new(GuardianContext::new(broker.clone()));
        let gate = Arc::new(ApprovalGate::new(
            broker,
            escalation,
            cfg.approval.auto_approve_commands.clone(),
            Duration::from_secs(cfg.approval.timeout_seconds),
        ));

        tracing::info!(
            model = %llm.model(),
            provider = llm.provider().as_str(),
            monitored_host = %cfg.general.host,
            hosts = hosts.hosts().len(),
            telegram = notifier.is_enabled(),
            passive_mode = cfg.policy.passive_mode,
            "runtime built"
        );
        Ok(Self {
            cfg,
            ctx,
            hosts,
            runner,
            search,
            knowledge,
            llm,
            telegram,
            notifier,
            gate,
        })
    }

    fn collector(&self) -> MetricCollector {
        MetricCollector::new(self.runner.clone(), self.cfg.thresholds, self.cfg.policy)
    }

    async fn control_loop(&self) -> ControlLoop {
        // Facts are read once per loop; notes saved later reach the next run.
        let facts = match self.knowledge.load().await {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!(error = %e, "could not read knowledge file");
                String::new()
            }
        };
        let diagnoser = Arc::new(LlmDiagnoser::new(
            self.llm.clone(),
            self.cfg.llm.temperature,
            facts,
        ));
        ControlLoop::new(
            self.ctx.clone(),
            self.collector(),
            diagnoser,
            self.gate.clone(),
            self.runner.clone(),
            self.search.clone(),
            self.notifier.clone(),
            LoopSettings {
                host: self.cfg.general.host.clone(),
                max_steps: self.cfg.general.max_steps,
                interval: Duration::from_secs(self.cfg.general.interval_seconds),
            },
        )
    }

    fn assistant_tools(&self) -> Vec<Arc<dyn Tool>> {
        let terminal: Arc<dyn Tool> = Arc::new(TerminalCommandTool::new(self.runner.clone()));
        vec![
            Arc::new(SystemMetricsTool::new(
                self.runner.clone(),
                Arc::new(self.collector()),
            )),
            Arc::new(SystemLogsTool::new(self.runner.clone())),
            Arc::new(GatedCommandTool::new(terminal, self.gate.clone())),
            Arc::new(WebSearchTool::new(self.search.clone())),
            Arc::new(SaveKnowledgeTool::new(self.knowledge.clone())),
        ]
    }
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = GuardianConfig::load(config_path).await?;
    let hosts = HostRegistry::load(&cfg.hosts_path()).await?;
    let llm = LlmClient::new(cfg.llm_settings())?;
    tracing::info!(
        config_path = %path.display(),
        model = %llm.model(),
        provider = llm.provider().as_str(),
        monitored_host = %cfg.general.host,
        telegram_enabled = cfg.telegram.enabled,
        http_enabled = cfg.http.enabled,
        "config ok"
    );
    if hosts.resolve(&cfg.general.host).is_none() {
        return Err(anyhow::anyhow!(
            "general.host {:?} is not in {}",
            cfg.general.host,
            cfg.hosts_path().display()
        ));
    }
    println!("config: {}", path.display());
    println!("llm: {} ({})", llm.model(), llm.provider().as_str());
    println!("hosts:");
    for host in hosts.listing() {
        println!("  {}", host.summary_line());
    }
    Ok(())
}

pub async fn hosts(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, _) = GuardianConfig::load(config_path).await?;
    let registry = HostRegistry::load(&cfg.hosts_path()).await?;
    println!("{:<16} {:<6} {:<28} DESCRIPTION", "NAME", "TYPE", "ADDRESS");
    for host in registry.listing() {
        let address = match (host.user.as_deref(), host.ip.as_deref()) {
            (Some(user), Some(ip)) => format!("{user}@{ip}:{}", host.port),
            (None, Some(ip)) => format!("{ip}:{}", host.port),
            _ => "-".to_string(),
        };
        println!(
            "{:<16} {:<6} {:<28} {}",
            host.name,
            host.kind.as_str(),
            address,
            host.description
        );
    }
    Ok(())
}

/// One manual cycle in the foreground; approvals go to the terminal.
pub async fn check(config_path: Option<PathBuf>, host: Option<String>) -> Result<()> {
    let (mut cfg, _) = GuardianConfig::load(config_path).await?;
    if let Some(host) = host.filter(|h| !h.trim().is_empty()) {
        cfg.general.host = host.trim().to_string();
    }
    let runtime = Runtime::build(cfg, false).await?;
    if runtime.hosts.resolve(&runtime.cfg.general.host).is_none() {
        return Err(anyhow::anyhow!("unknown host {:?}", runtime.cfg.general.host));
    }

    let report = runtime.control_loop().await.run_cycle(true).await;
    println!("host: {}", runtime.cfg.general.host);
    println!("termination: {}", report.termination);
    println!("diagnosis: {}", report.state.diagnosis);
    println!("steps: {}", report.state.steps_count);
    for (i, entry) in report.state.history.iter().enumerate() {
        println!("--- step {} ---\n{entry}", i + 1);
    }
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = GuardianConfig::load(config_path).await?;
    let started_at = Instant::now();
    tracing::info!(
        config_path = %cfg_path.display(),
        monitored_host = %cfg.general.host,
        interval_seconds = cfg.general.interval_seconds,
        max_steps = cfg.general.max_steps,
        cpu_threshold = cfg.thresholds.cpu,
        disk_threshold = cfg.thresholds.disk,
        ram_threshold = cfg.thresholds.ram,
        passive_mode = cfg.policy.passive_mode,
        test_anomaly = cfg.policy.test_anomaly,
        model = %cfg.llm.model,
        telegram_enabled = cfg.telegram.enabled,
        approval_timeout_seconds = cfg.approval.timeout_seconds,
        http_enabled = cfg.http.enabled,
        http_bind = %cfg.http.bind,
        "server configuration loaded"
    );

    let listener = if cfg.http.enabled {
        let addr: SocketAddr = cfg
            .http
            .bind
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid http.bind {:?}: {e}", cfg.http.bind))?;
        Some(preflight_bind_listener(addr).await?)
    } else {
        None
    };

    let runtime = Runtime::build(cfg, true).await?;
    let shutdown = CancellationToken::new();

    let gateway_handle = match runtime.telegram.clone() {
        Some(channel) => {
            let tools = runtime.assistant_tools();
            preflight_validate_tool_names(&tools)?;
            let assistant = Arc::new(Assistant::new(
                runtime.llm.clone(),
                runtime.cfg.llm.chat_temperature,
                tools,
                runtime.ctx.clone(),
                runtime.hosts.clone(),
                runtime.knowledge.clone(),
            ));
            let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
            channel.start(inbound_tx).await?;
            let gateway = Arc::new(Gateway::new(
                runtime.cfg.telegram.chat_id.trim(),
                channel,
                runtime.ctx.clone(),
                Arc::new(SessionManager::new()),
                Some(assistant),
                inbound_rx,
            ));
            tracing::info!("gateway started");
            runtime
                .notifier
                .post(&format!(
                    "🛡️ Guardian online, watching `{}`.",
                    runtime.cfg.general.host
                ))
                .await;
            Some(gateway.start(shutdown.child_token()))
        }
        None => {
            tracing::warn!("telegram disabled; approvals will be asked on this terminal");
            None
        }
    };

    let control = runtime.control_loop().await;
    let loop_token = shutdown.child_token();
    let loop_handle = tokio::spawn(async move { control.run(loop_token).await });

    match listener {
        Some(listener) => {
            let state = Arc::new(ApiState {
                ctx: runtime.ctx.clone(),
                started_at,
                host: runtime.cfg.general.host.clone(),
            });
            let app = http_app(state, &runtime.cfg);
            let addr = listener.local_addr()?;
            tracing::info!(%addr, "guardian http serving");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
                .await?;
            tracing::info!("http server shutdown completed");
        }
        None => shutdown_signal(shutdown.clone()).await,
    }

    shutdown.cancel();
    match loop_handle.await {
        Ok(()) => tracing::info!("control loop shutdown completed"),
        Err(e) => tracing::error!(error = %e, "control loop task join failed during shutdown"),
    }
    if let Some(handle) = gateway_handle {
        match handle.await {
            Ok(()) => tracing::info!("gateway shutdown completed"),
            Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
        }
    }
    Ok(())
}

fn http_app(state: Arc<ApiState>, cfg: &GuardianConfig) -> axum::Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.http.max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.http.timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn preflight_validate_tool_names(tools: &[Arc<dyn Tool>]) -> Result<()> {
    for tool in tools {
        let spec = tool.spec();
        validate_tool_name(&spec.name).map_err(|e| {
            anyhow::anyhow!(
                "preflight tool name validation failed for '{}': {e}",
                spec.name
            )
        })?;
    }
    tracing::info!(tool_count = tools.len(), "preflight tool name validation passed");
    Ok(())
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_falls_back_when_header_missing() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_id_from_headers(&headers), "missing");
        headers.insert("x-request-id", "abc-123".parse().expect("header"));
        assert_eq!(request_id_from_headers(&headers), "abc-123");
    }

    #[tokio::test]
    async fn assistant_tool_names_pass_provider_validation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = GuardianConfig::default();
        cfg.hosts.file = dir.path().join("hosts.json").display().to_string();
        cfg.knowledge.file = dir.path().join("knowledge.md").display().to_string();
        let runtime = Runtime::build(cfg, false).await.expect("runtime");
        let tools = runtime.assistant_tools();
        preflight_validate_tool_names(&tools).expect("valid names");
        let names: Vec<String> = tools.iter().map(|t| t.spec().name).collect();
        assert!(names.contains(&"get_system_metrics".to_string()));
        assert!(names.contains(&"execute_terminal_command".to_string()));
        assert!(!runtime.notifier.is_enabled());
    }
}
