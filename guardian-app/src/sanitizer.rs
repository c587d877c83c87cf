//! Turns a model's free-text action proposal into one executable command line.

const KILL_VERBS: &[&str] = &["kill", "pkill", "killall"];
const RUN_PREFIX: &str = "run:";

/// Normalize `raw` into a single trimmed command line.
///
/// Steps are applied until nothing changes, so the result is stable under a
/// second pass. Empty output means there is nothing safe to execute.
pub fn sanitize(raw: &str) -> String {
    let mut current = raw.to_string();
    loop {
        let next = sanitize_once(&current);
        if next == current {
            return next;
        }
        current = next;
    }
}

fn sanitize_once(raw: &str) -> String {
    let mut cmd = raw.trim().lines().next().unwrap_or("").trim();

    cmd = strip_run_prefix(cmd);
    cmd = cmd.trim_matches('`').trim();

    if let Some((before, _)) = cmd.split_once('#') {
        cmd = before.trim();
    }

    // `kill 1234 (rustdesk)`: the parenthesized name is for the human reviewer.
    if is_kill_command(cmd) {
        if let Some((before, _)) = cmd.split_once('(') {
            cmd = before.trim();
        }
    }

    cmd.to_string()
}

fn strip_run_prefix(cmd: &str) -> &str {
    match cmd.get(..RUN_PREFIX.len()) {
        Some(head) if head.eq_ignore_ascii_case(RUN_PREFIX) => cmd[RUN_PREFIX.len()..].trim(),
        _ => cmd,
    }
}

fn is_kill_command(cmd: &str) -> bool {
    cmd.split_whitespace()
        .next()
        .is_some_and(|verb| KILL_VERBS.contains(&verb))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_annotation_and_comment_are_dropped() {
        assert_eq!(sanitize("kill 1234 (rustdesk) # seems heavy"), "kill 1234");
        assert_eq!(sanitize("pkill -f chrome (browser)"), "pkill -f chrome");
    }

    #[test]
    fn only_first_line_survives() {
        assert_eq!(
            sanitize("  df -h /\nThis shows disk usage for root.\nrm -rf /"),
            "df -h /"
        );
    }

    #[test]
    fn run_prefix_is_stripped_case_insensitively() {
        assert_eq!(sanitize("Run: uptime"), "uptime");
        assert_eq!(sanitize("RUN:   free -m"), "free -m");
        assert_eq!(sanitize("running-services"), "running-services");
    }

    #[test]
    fn run_prefix_before_kill_still_drops_annotation() {
        assert_eq!(sanitize("Run: kill 1234 (x)"), "kill 1234");
    }

    #[test]
    fn parentheses_outside_kill_commands_are_kept() {
        assert_eq!(sanitize("echo $(hostname)"), "echo $(hostname)");
    }

    #[test]
    fn backticks_are_removed() {
        assert_eq!(sanitize("`systemctl status nginx`"), "systemctl status nginx");
    }

    #[test]
    fn empty_and_comment_only_inputs_are_empty() {
        assert_eq!(sanitize(""), "");
        assert_eq!(sanitize("   \n  "), "");
        assert_eq!(sanitize("# nothing to do"), "");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let inputs = [
            "kill 1234 (rustdesk) # seems heavy",
            "Run: kill 1234 (x)",
            "run: run: ls -la",
            "`Run: ps aux` # top talkers",
            "killall (node)",
            "search \"nginx 502 bad gateway\"",
            "  journalctl -u nginx -n 50 --no-pager \n more text",
            "FINISH",
            "",
        ];
        for raw in inputs {
            let once = sanitize(raw);
            assert_eq!(sanitize(&once), once, "not idempotent for {raw:?}");
            assert!(!once.contains('\n'));
            assert_eq!(once.trim(), once);
        }
    }
}
