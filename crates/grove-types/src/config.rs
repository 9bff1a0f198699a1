//! Project registration and the in-repo `grove.yaml` overlay.
//!
//! A project is registered once under the data root
//! (`projects/<name>/project.yaml`: name + repo URL). Everything describing
//! *how* to run an instance — container, agent command, lifecycle command
//! lists — lives in `grove.yaml` at the root of the project repository and
//! is re-read on demand, so config edits take effect without daemon
//! restarts.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::GroveError;
use crate::paths;

/// File name of the per-project registration under the data root.
pub const PROJECT_FILE: &str = "project.yaml";

/// File name of the overlay config at the repository root.
pub const OVERLAY_FILE: &str = "grove.yaml";

const DEFAULT_WORKDIR: &str = "/workspace";
const DEFAULT_SERVICE: &str = "app";
const DEFAULT_AGENT: &str = "sh";

/// Parsed `project.yaml` registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectFile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub repo: String,
}

/// The `container:` section of `grove.yaml`.
///
/// Either `image` (single container) or `compose` + `service` (compose
/// application) is set. `mounts` are extra host paths bind-mounted into the
/// container; `~`-prefixed entries resolve against the host home directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSection {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub compose: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub mounts: Vec<String>,
}

/// The `agent:` section of `grove.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// The full `grove.yaml` overlay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverlayConfig {
    #[serde(default)]
    pub container: ContainerSection,
    #[serde(default)]
    pub agent: AgentSection,
    /// Commands run inside the container during setup, in order.
    #[serde(default)]
    pub start: Vec<String>,
    /// Commands run concurrently by `CHECK`.
    #[serde(default)]
    pub check: Vec<String>,
    /// Commands run in order by `FINISH`; `{{branch}}` expands to the
    /// instance branch.
    #[serde(default)]
    pub finish: Vec<String>,
}

/// A registered project plus its (possibly not-yet-loaded) overlay.
#[derive(Debug, Clone)]
pub struct Project {
    pub name: String,
    pub repo: String,
    pub config: OverlayConfig,
    root: PathBuf,
}

impl Project {
    /// Load a project registration from `projects/<name>/project.yaml`.
    pub fn load(root: &Path, name: &str) -> Result<Self, GroveError> {
        let path = paths::project_dir(root, name).join(PROJECT_FILE);
        let content = std::fs::read_to_string(&path).map_err(|_| {
            GroveError::Config(format!(
                "unknown project {name:?} (create it with: grove project create {name})"
            ))
        })?;
        let file: ProjectFile = serde_yaml::from_str(&content)
            .map_err(|e| GroveError::Config(format!("invalid {}: {e}", path.display())))?;
        Ok(Self {
            name: if file.name.is_empty() { name.to_string() } else { file.name },
            repo: file.repo,
            config: OverlayConfig::default(),
            root: root.to_path_buf(),
        })
    }

    /// The canonical checkout directory.
    pub fn main_dir(&self) -> PathBuf {
        paths::main_dir(&self.root, &self.name)
    }

    /// The worktree directory for one instance.
    pub fn worktree_dir(&self, instance_id: &str) -> PathBuf {
        paths::worktree_dir(&self.root, &self.name, instance_id)
    }

    /// Read `grove.yaml` from the main checkout into `self.config`.
    ///
    /// Returns `Ok(false)` when the file does not exist (the project is not
    /// configured enough to start an instance).
    pub fn load_overlay(&mut self) -> Result<bool, GroveError> {
        let path = self.main_dir().join(OVERLAY_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(GroveError::Config(format!("read {}: {e}", path.display()))),
        };
        self.config = serde_yaml::from_str(&content)
            .map_err(|e| GroveError::Config(format!("invalid {}: {e}", path.display())))?;
        Ok(true)
    }

    /// The agent command, defaulting to a plain shell.
    pub fn agent_command(&self) -> &str {
        self.config
            .agent
            .command
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_AGENT)
    }

    /// Where the worktree is mounted inside the container.
    pub fn container_workdir(&self) -> &str {
        self.config
            .container
            .workdir
            .as_deref()
            .filter(|w| !w.is_empty())
            .unwrap_or(DEFAULT_WORKDIR)
    }

    /// The compose service that hosts the agent.
    pub fn container_service(&self) -> &str {
        self.config
            .container
            .service
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SERVICE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_project(root: &Path, name: &str, yaml: &str) {
        let dir = paths::project_dir(root, name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(PROJECT_FILE), yaml).unwrap();
    }

    #[test]
    fn load_reads_registration() {
        let root = tempfile::tempdir().unwrap();
        write_project(root.path(), "api", "name: api\nrepo: https://example.com/api.git\n");

        let p = Project::load(root.path(), "api").unwrap();
        assert_eq!(p.name, "api");
        assert_eq!(p.repo, "https://example.com/api.git");
        assert!(p.main_dir().ends_with("projects/api/main"));
        assert!(p.worktree_dir("7").ends_with("projects/api/worktrees/7"));
    }

    #[test]
    fn load_unknown_project_fails() {
        let root = tempfile::tempdir().unwrap();
        let err = Project::load(root.path(), "ghost").unwrap_err();
        assert!(err.to_string().contains("unknown project"));
    }

    #[test]
    fn overlay_absent_reports_false() {
        let root = tempfile::tempdir().unwrap();
        write_project(root.path(), "api", "name: api\nrepo: r\n");
        let mut p = Project::load(root.path(), "api").unwrap();
        assert!(!p.load_overlay().unwrap());
        assert_eq!(p.agent_command(), "sh");
        assert_eq!(p.container_workdir(), "/workspace");
        assert_eq!(p.container_service(), "app");
    }

    #[test]
    fn overlay_parses_all_sections() {
        let root = tempfile::tempdir().unwrap();
        write_project(root.path(), "api", "name: api\nrepo: r\n");
        let mut p = Project::load(root.path(), "api").unwrap();
        std::fs::create_dir_all(p.main_dir()).unwrap();
        std::fs::write(
            p.main_dir().join(OVERLAY_FILE),
            concat!(
                "container:\n",
                "  image: ubuntu:24.04\n",
                "  workdir: /src\n",
                "  mounts:\n",
                "    - ~/.config/gh\n",
                "agent:\n",
                "  command: claude\n",
                "  args: [\"--dangerously-skip-permissions\"]\n",
                "start:\n",
                "  - apt-get update\n",
                "check:\n",
                "  - cargo test\n",
                "finish:\n",
                "  - git push origin {{branch}}\n",
            ),
        )
        .unwrap();

        assert!(p.load_overlay().unwrap());
        assert_eq!(p.config.container.image.as_deref(), Some("ubuntu:24.04"));
        assert_eq!(p.container_workdir(), "/src");
        assert_eq!(p.agent_command(), "claude");
        assert_eq!(p.config.agent.args, vec!["--dangerously-skip-permissions"]);
        assert_eq!(p.config.start, vec!["apt-get update"]);
        assert_eq!(p.config.check, vec!["cargo test"]);
        assert_eq!(p.config.finish, vec!["git push origin {{branch}}"]);
    }

    #[test]
    fn overlay_rejects_bad_yaml() {
        let root = tempfile::tempdir().unwrap();
        write_project(root.path(), "api", "name: api\nrepo: r\n");
        let mut p = Project::load(root.path(), "api").unwrap();
        std::fs::create_dir_all(p.main_dir()).unwrap();
        std::fs::write(p.main_dir().join(OVERLAY_FILE), "container: [not: a map").unwrap();
        assert!(p.load_overlay().is_err());
    }
}
