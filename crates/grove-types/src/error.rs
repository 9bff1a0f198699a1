//! Error types shared across all grove crates.

/// Errors that can occur across the grove runtime.
///
/// Each variant corresponds to a subsystem: configuration loading, the PTY
/// layer, the container runtime, the git worktree collaborator, or the wire
/// protocol.
#[derive(Debug, thiserror::Error)]
pub enum GroveError {
    /// Project registration or `grove.yaml` overlay failure.
    #[error("configuration error: {0}")]
    Config(String),

    /// PTY allocation, spawn, or I/O failure.
    #[error("pty error: {0}")]
    Pty(String),

    /// Container runtime (docker / docker compose) failure.
    #[error("container runtime error: {0}")]
    Container(String),

    /// Git worktree collaborator failure.
    #[error("git worktree error: {0}")]
    Worktree(String),

    /// Malformed request, response, or attach frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Plain I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
