//! Command-line helpers shared by the supervisors.

use crate::error::{Result, RunnerError};

/// Split a command string into (command, args) on whitespace.
///
/// # Errors
///
/// Returns `SpawnFailed` for an empty string.
pub fn parse_command_line(command_line: &str) -> Result<(String, Vec<String>)> {
    let mut parts = command_line.split_whitespace().map(str::to_string);
    let command = parts
        .next()
        .ok_or_else(|| RunnerError::SpawnFailed("command string is empty".into()))?;
    Ok((command, parts.collect()))
}

/// Join a command and its arguments back into a display string.
#[must_use]
pub fn render_command_line(command: &str, args: &[String]) -> String {
    let mut parts = vec![command.to_string()];
    parts.extend(args.iter().cloned());
    parts.join(" ")
}

/// Probe whether `command` is on PATH, with a best-effort `--version` check
/// for a friendlier message. Never fails; the boolean is the answer.
pub async fn validate_command_available(command: &str) -> (bool, String) {
    if which::which(command).is_err() {
        return (false, format!("{command} not found in PATH"));
    }

    let mut probe = tokio::process::Command::new(command);
    probe.arg("--version");
    match tokio::time::timeout(std::time::Duration::from_secs(5), probe.output()).await {
        Ok(Ok(output)) => {
            let text = if output.stdout.is_empty() {
                output.stderr
            } else {
                output.stdout
            };
            let version = String::from_utf8_lossy(&text)
                .lines()
                .next()
                .unwrap_or_default()
                .trim()
                .to_string();
            if version.is_empty() {
                (true, format!("{command} is available in PATH"))
            } else {
                (true, format!("{command} is available: {version}"))
            }
        }
        _ => (true, format!("{command} is available in PATH")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_on_whitespace() {
        let (cmd, args) = parse_command_line("npx @modelcontextprotocol/server-filesystem /tmp")
            .expect("non-empty");
        assert_eq!(cmd, "npx");
        assert_eq!(args, vec!["@modelcontextprotocol/server-filesystem", "/tmp"]);
    }

    #[test]
    fn parse_rejects_empty() {
        assert!(parse_command_line("   ").is_err());
    }

    #[test]
    fn render_roundtrip() {
        let (cmd, args) = parse_command_line("python -m mcp_server --verbose").unwrap();
        assert_eq!(render_command_line(&cmd, &args), "python -m mcp_server --verbose");
    }

    #[tokio::test]
    async fn validate_reports_missing_command() {
        let (ok, message) = validate_command_available("definitely-not-a-real-command-xyz").await;
        assert!(!ok);
        assert!(message.contains("not found"));
    }

    #[tokio::test]
    async fn validate_finds_sh() {
        let (ok, _) = validate_command_available("sh").await;
        assert!(ok);
    }
}
