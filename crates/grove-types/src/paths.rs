//! Data-root layout helpers.
//!
//! Everything grove persists lives under a single data root, default
//! `~/.grove`, overridable with the `GROVE_ROOT` environment variable.

use std::path::{Path, PathBuf};

/// Resolve the grove data root. `GROVE_ROOT` (made absolute) wins over
/// `~/.grove`.
pub fn data_root() -> PathBuf {
    if let Ok(env) = std::env::var("GROVE_ROOT") {
        if !env.is_empty() {
            let p = PathBuf::from(&env);
            return std::fs::canonicalize(&p).unwrap_or(p);
        }
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".grove")
}

/// The daemon's request socket.
pub fn socket_path(root: &Path) -> PathBuf {
    root.join("groved.sock")
}

/// The daemon's own process log.
pub fn daemon_log(root: &Path) -> PathBuf {
    root.join("daemon.log")
}

/// The dotenv-style agent environment file.
pub fn env_file(root: &Path) -> PathBuf {
    root.join("env")
}

/// Directory of project registrations.
pub fn projects_dir(root: &Path) -> PathBuf {
    root.join("projects")
}

/// Directory of persisted instance records.
pub fn instances_dir(root: &Path) -> PathBuf {
    root.join("instances")
}

/// Directory of per-instance log files.
pub fn logs_dir(root: &Path) -> PathBuf {
    root.join("logs")
}

/// A project's directory under the data root.
pub fn project_dir(root: &Path, project: &str) -> PathBuf {
    projects_dir(root).join(project)
}

/// A project's canonical checkout.
pub fn main_dir(root: &Path, project: &str) -> PathBuf {
    project_dir(root, project).join("main")
}

/// A project's worktree directory for one instance.
pub fn worktree_dir(root: &Path, project: &str, instance_id: &str) -> PathBuf {
    project_dir(root, project).join("worktrees").join(instance_id)
}

/// The persisted metadata record for one instance.
pub fn instance_record(root: &Path, instance_id: &str) -> PathBuf {
    instances_dir(root).join(format!("{instance_id}.json"))
}

/// The append-only log file for one instance.
pub fn instance_log(root: &Path, instance_id: &str) -> PathBuf {
    logs_dir(root).join(format!("{instance_id}.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_under_root() {
        let root = Path::new("/data/grove");
        assert_eq!(socket_path(root), Path::new("/data/grove/groved.sock"));
        assert_eq!(
            main_dir(root, "my-app"),
            Path::new("/data/grove/projects/my-app/main")
        );
        assert_eq!(
            worktree_dir(root, "my-app", "3"),
            Path::new("/data/grove/projects/my-app/worktrees/3")
        );
        assert_eq!(
            instance_record(root, "3"),
            Path::new("/data/grove/instances/3.json")
        );
        assert_eq!(instance_log(root, "3"), Path::new("/data/grove/logs/3.log"));
    }
}
