//! groved — the long-lived supervisor for containerized AI coding-agent
//! sessions.
//!
//! The daemon listens on a Unix socket under the data root and owns a
//! registry of instances. Each instance binds a project, a git worktree on
//! its own branch, a container, and a PTY-backed agent process that
//! survives client disconnects. Clients (the `grove` CLI) open short-lived
//! connections to create, inspect, attach to, and tear down instances.

pub mod container;
pub mod handlers;
pub mod instance;
pub mod persist;
pub mod pty;
pub mod registry;
pub mod ring;
pub mod server;
pub mod stream;
pub mod worktree;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use grove_types::{paths, GroveError};

use container::{ContainerRuntime, DockerRuntime};
use registry::Registry;
use worktree::{GitWorktrees, WorktreeProvider};

/// The supervisor: data root, instance registry, and external
/// collaborators. Constructed once at startup; every handler receives it
/// explicitly.
pub struct Daemon {
    pub root: PathBuf,
    pub registry: Registry,
    pub containers: Box<dyn ContainerRuntime>,
    pub worktrees: Box<dyn WorktreeProvider>,
}

impl Daemon {
    /// Build the production daemon: Docker + git, with Docker availability
    /// checked up front (a missing runtime is a fatal startup error).
    pub async fn new(root: PathBuf) -> Result<Arc<Self>, GroveError> {
        let containers = DockerRuntime::new();
        containers.validate().await?;
        Self::with_collaborators(root, Box::new(containers), Box::new(GitWorktrees::new()))
    }

    /// Build a daemon with explicit collaborators (tests substitute local
    /// fakes here). Creates the data-root layout and reloads persisted
    /// instances.
    pub fn with_collaborators(
        root: PathBuf,
        containers: Box<dyn ContainerRuntime>,
        worktrees: Box<dyn WorktreeProvider>,
    ) -> Result<Arc<Self>, GroveError> {
        for dir in [
            paths::projects_dir(&root),
            paths::instances_dir(&root),
            paths::logs_dir(&root),
        ] {
            std::fs::create_dir_all(dir)?;
        }

        let registry = Registry::new();
        registry.load_persisted(&root);

        Ok(Arc::new(Self {
            root,
            registry,
            containers,
            worktrees,
        }))
    }

    /// Serve the request socket until shutdown signals. Instance child
    /// processes are left running on daemon exit.
    pub async fn run(
        self: &Arc<Self>,
        socket_path: &Path,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), GroveError> {
        server::serve(self.clone(), socket_path, shutdown).await
    }
}
