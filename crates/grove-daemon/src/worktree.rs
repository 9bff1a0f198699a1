//! Git worktree contract and its subprocess implementation.
//!
//! Each instance works on its own branch in a dedicated worktree that
//! shares the object store of the project's canonical checkout.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::warn;

use grove_types::{GroveError, Project};

use crate::stream::SetupLog;

/// Contract to the git worktree collaborator.
#[async_trait]
pub trait WorktreeProvider: Send + Sync {
    /// Make sure the canonical checkout exists, cloning it if missing.
    async fn ensure_main_checkout(
        &self,
        project: &Project,
        log: &mut SetupLog,
    ) -> Result<(), GroveError>;

    /// Pull the canonical checkout. Callers treat failures as non-fatal so
    /// offline use still works.
    async fn pull_main(&self, project: &Project, log: &mut SetupLog) -> Result<(), GroveError>;

    /// Create the instance worktree on a new branch; returns its path.
    async fn create_worktree(
        &self,
        project: &Project,
        instance_id: &str,
        branch: &str,
        log: &mut SetupLog,
    ) -> Result<PathBuf, GroveError>;

    /// Remove a worktree and delete its branch. Best-effort.
    async fn remove_worktree(&self, main_dir: &Path, worktree_dir: &Path, branch: &str);
}

/// Real git, via subprocess.
pub struct GitWorktrees;

impl GitWorktrees {
    pub fn new() -> Self {
        Self
    }

    async fn git(args: &[&str], log: Option<&mut SetupLog>) -> Result<(), GroveError> {
        let output = Command::new("git")
            .args(args)
            .output()
            .await
            .map_err(|e| GroveError::Worktree(format!("run git: {e}")))?;
        if let Some(log) = log {
            log.append(&output.stdout);
            log.append(&output.stderr);
        }
        if !output.status.success() {
            return Err(GroveError::Worktree(format!(
                "git {}: {}",
                args.first().copied().unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

impl Default for GitWorktrees {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorktreeProvider for GitWorktrees {
    async fn ensure_main_checkout(
        &self,
        project: &Project,
        log: &mut SetupLog,
    ) -> Result<(), GroveError> {
        let main_dir = project.main_dir();
        if main_dir.join(".git").exists() {
            return Ok(());
        }
        if project.repo.is_empty() {
            return Err(GroveError::Worktree(format!(
                "project {:?} has no repo URL; set one in project.yaml",
                project.name
            )));
        }
        if let Some(parent) = main_dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        log.line(&format!("Cloning {} …", project.repo));
        Self::git(
            &["clone", &project.repo, &main_dir.display().to_string()],
            Some(log),
        )
        .await
        .map_err(|e| GroveError::Worktree(format!("clone {}: {e}", project.repo)))
    }

    async fn pull_main(&self, project: &Project, log: &mut SetupLog) -> Result<(), GroveError> {
        let main_dir = project.main_dir().display().to_string();
        Self::git(&["-C", &main_dir, "pull", "--ff-only"], Some(log)).await
    }

    async fn create_worktree(
        &self,
        project: &Project,
        instance_id: &str,
        branch: &str,
        log: &mut SetupLog,
    ) -> Result<PathBuf, GroveError> {
        let worktree_dir = project.worktree_dir(instance_id);
        if let Some(parent) = worktree_dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let main_dir = project.main_dir().display().to_string();
        log.line(&format!(
            "Creating worktree {} on branch {branch} …",
            worktree_dir.display()
        ));
        Self::git(
            &[
                "-C",
                &main_dir,
                "worktree",
                "add",
                "-b",
                branch,
                &worktree_dir.display().to_string(),
            ],
            Some(log),
        )
        .await?;
        Ok(worktree_dir)
    }

    async fn remove_worktree(&self, main_dir: &Path, worktree_dir: &Path, branch: &str) {
        let main = main_dir.display().to_string();
        if let Err(e) = Self::git(
            &[
                "-C",
                &main,
                "worktree",
                "remove",
                "--force",
                &worktree_dir.display().to_string(),
            ],
            None,
        )
        .await
        {
            warn!(worktree = %worktree_dir.display(), error = %e, "git worktree remove failed");
        }
        if let Err(e) = Self::git(&["-C", &main, "branch", "-D", branch], None).await {
            warn!(branch, error = %e, "git branch -D failed");
        }
    }
}

/// A hint for clone failures on scheme-less forge URLs.
pub fn repo_url_hint(repo: &str) -> Option<&'static str> {
    const FORGES: [&str; 3] = ["github.com/", "gitlab.com/", "bitbucket.org/"];
    if FORGES.iter().any(|f| repo.starts_with(f)) {
        Some("repo URL may be missing scheme; try https://host/org/repo.git or git@host:org/repo.git")
    } else {
        None
    }
}
