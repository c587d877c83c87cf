//! Slash commands and trigger keywords from the operator chat.

use crate::context::GuardianContext;
use crate::metrics::render_status;

pub const MANUAL_CHECK_REPLY: &str = "🔎 Starting manual diagnosis...";

const TRIGGER_KEYWORDS: &[&str] = &["diagnose", "scan", "check", "analiza", "revisa"];

/// Reply for a `/command`, or `None` when `input` is not one.
pub fn handle_command(ctx: &GuardianContext, input: &str) -> Option<String> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let command = trimmed.split_whitespace().next().unwrap_or(trimmed);

    match command {
        "/start" => Some("Guardian Bot Started! Use /status to check system.".to_string()),
        "/status" => Some(match ctx.latest_snapshot() {
            Some(snapshot) => render_status(&snapshot),
            None => "No metrics available yet.".to_string(),
        }),
        "/check" => {
            ctx.request_manual_check();
            Some(MANUAL_CHECK_REPLY.to_string())
        }
        "/help" => Some(
            "/status latest metrics\n/check run a manual diagnosis\nOr just ask me about your servers."
                .to_string(),
        ),
        _ => Some("Unknown command. Supported: /start /status /check /help".to_string()),
    }
}

/// Free text asking for a diagnosis, e.g. "please check the server".
pub fn is_trigger_request(text: &str) -> bool {
    let lower = text.to_lowercase();
    TRIGGER_KEYWORDS.iter().any(|k| lower.contains(k))
}
