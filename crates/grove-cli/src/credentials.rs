//! Agent credential forwarding for start/restart requests.
//!
//! The daemon typically runs without the user's shell environment, so a
//! token that only exists in the invoking shell must travel on the request
//! itself. Tokens already persisted in `<root>/env` are injected by the
//! daemon directly and are not echoed back through the request.

use std::collections::HashMap;
use std::path::Path;

use grove_types::{envfile, paths, OverlayConfig, OVERLAY_FILE};

use crate::client;

const CREDENTIAL_KEYS: [&str; 2] = ["CLAUDE_CODE_OAUTH_TOKEN", "ANTHROPIC_API_KEY"];

/// Environment entries to carry on a START/RESTART request for `project`.
pub fn ensure_agent_credentials(project: &str) -> HashMap<String, String> {
    gather(&client::root_dir(), project, |key| std::env::var(key).ok())
}

fn gather(
    root: &Path,
    project: &str,
    shell_env: impl Fn(&str) -> Option<String>,
) -> HashMap<String, String> {
    // Skip only when we know for certain the agent is not claude. An
    // unreadable grove.yaml (e.g. first run, before the repo is cloned)
    // still checks — claude is the default, and skipping silently would
    // leave the container without credentials.
    if let Some(agent) = detect_agent_command(root, project) {
        if agent != "claude" {
            return HashMap::new();
        }
    }

    let persisted = envfile::load(&paths::env_file(root));
    if CREDENTIAL_KEYS
        .iter()
        .any(|key| persisted.get(*key).is_some_and(|v| !v.is_empty()))
    {
        return HashMap::new();
    }

    let mut agent_env = HashMap::new();
    for key in CREDENTIAL_KEYS {
        if let Some(value) = shell_env(key) {
            if !value.is_empty() {
                agent_env.insert(key.to_string(), value);
            }
        }
    }
    agent_env
}

/// The agent command from the project's `grove.yaml`, if readable.
fn detect_agent_command(root: &Path, project: &str) -> Option<String> {
    let path = paths::main_dir(root, project).join(OVERLAY_FILE);
    let content = std::fs::read_to_string(path).ok()?;
    let config: OverlayConfig = serde_yaml::from_str(&content).ok()?;
    config.agent.command.filter(|c| !c.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_overlay(root: &Path, project: &str, yaml: &str) {
        let main = paths::main_dir(root, project);
        std::fs::create_dir_all(&main).unwrap();
        std::fs::write(main.join(OVERLAY_FILE), yaml).unwrap();
    }

    fn shell<'a>(entries: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            entries
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn forwards_shell_token_when_nothing_persisted() {
        let root = tempfile::tempdir().unwrap();
        write_overlay(root.path(), "app", "agent:\n  command: claude\n");

        let env = gather(root.path(), "app", shell(&[("CLAUDE_CODE_OAUTH_TOKEN", "sk-shell")]));
        assert_eq!(env.len(), 1);
        assert_eq!(env["CLAUDE_CODE_OAUTH_TOKEN"], "sk-shell");
    }

    #[test]
    fn forwards_both_keys_when_present() {
        let root = tempfile::tempdir().unwrap();
        let env = gather(
            root.path(),
            "app",
            shell(&[("CLAUDE_CODE_OAUTH_TOKEN", "sk-1"), ("ANTHROPIC_API_KEY", "sk-2")]),
        );
        assert_eq!(env.len(), 2);
        assert_eq!(env["ANTHROPIC_API_KEY"], "sk-2");
    }

    #[test]
    fn skips_when_token_already_persisted() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(paths::env_file(root.path()), "CLAUDE_CODE_OAUTH_TOKEN=sk-saved\n")
            .unwrap();

        let env = gather(root.path(), "app", shell(&[("CLAUDE_CODE_OAUTH_TOKEN", "sk-shell")]));
        assert!(env.is_empty(), "persisted tokens are injected daemon-side");
    }

    #[test]
    fn skips_for_non_claude_agents() {
        let root = tempfile::tempdir().unwrap();
        write_overlay(root.path(), "app", "agent:\n  command: aider\n");

        let env = gather(root.path(), "app", shell(&[("ANTHROPIC_API_KEY", "sk-shell")]));
        assert!(env.is_empty());
    }

    #[test]
    fn unreadable_overlay_still_forwards() {
        // First run: the repo is not cloned yet, so grove.yaml cannot be
        // read. Claude is the default agent, so credentials still travel.
        let root = tempfile::tempdir().unwrap();
        let env = gather(root.path(), "app", shell(&[("ANTHROPIC_API_KEY", "sk-shell")]));
        assert_eq!(env["ANTHROPIC_API_KEY"], "sk-shell");
    }

    #[test]
    fn empty_shell_yields_empty_map() {
        let root = tempfile::tempdir().unwrap();
        write_overlay(root.path(), "app", "agent:\n  command: claude\n");
        let env = gather(root.path(), "app", shell(&[]));
        assert!(env.is_empty());
    }

    #[test]
    fn detect_reads_agent_command() {
        let root = tempfile::tempdir().unwrap();
        write_overlay(root.path(), "app", "agent:\n  command: aider\n");
        assert_eq!(
            detect_agent_command(root.path(), "app").as_deref(),
            Some("aider")
        );
        assert_eq!(detect_agent_command(root.path(), "ghost"), None);

        write_overlay(root.path(), "bare", "start:\n  - make setup\n");
        assert_eq!(detect_agent_command(root.path(), "bare"), None);
    }
}
