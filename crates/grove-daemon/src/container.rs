//! Container runtime contract and its Docker implementation.
//!
//! Each instance gets a long-lived container (plain `docker run … sleep
//! infinity` or a compose application) with the worktree bind-mounted at the
//! configured workdir. The agent itself runs as a `docker exec` session
//! inside it, and check/finish commands exec alongside.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use grove_types::{GroveError, Project};

use crate::stream::{ResilientWriter, SetupLog};

/// A started container (or compose service) ready for exec.
#[derive(Debug, Clone)]
pub struct StartedContainer {
    /// The `docker exec` target.
    pub name: String,
    /// Compose project name; empty for plain containers.
    pub compose_project: String,
}

/// Contract to the container runtime collaborator.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Fail fast when the runtime is unusable (daemon startup check).
    async fn validate(&self) -> Result<(), GroveError>;

    /// Start the instance's container with the worktree bind-mounted.
    async fn start(
        &self,
        project: &Project,
        instance_id: &str,
        worktree_dir: &Path,
        log: &mut SetupLog,
    ) -> Result<StartedContainer, GroveError>;

    /// Run a shell command inside the container, capturing combined output
    /// into the setup log.
    async fn exec_logged(
        &self,
        target: &str,
        command: &str,
        log: &mut SetupLog,
    ) -> Result<(), GroveError>;

    /// Run a shell command inside the container, streaming output as it
    /// arrives.
    async fn exec_streamed(
        &self,
        target: &str,
        command: &str,
        out: &ResilientWriter,
    ) -> Result<(), GroveError>;

    /// Tear down the container or compose application. Best-effort.
    async fn stop(&self, target: &str, compose_project: &str);

    /// Make sure the agent binary exists inside the container, installing
    /// known agents automatically.
    async fn ensure_agent_installed(
        &self,
        agent: &str,
        target: &str,
        log: &mut SetupLog,
    ) -> Result<(), GroveError>;

    /// Seed agent credentials/preferences into a fresh container.
    async fn seed_agent_config(&self, agent: &str, target: &str);

    /// The host command line that execs the agent inside the container.
    fn agent_argv(
        &self,
        target: &str,
        workdir: &str,
        agent: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Vec<String>;
}

/// The real Docker-backed runtime.
pub struct DockerRuntime;

impl DockerRuntime {
    pub fn new() -> Self {
        Self
    }

    fn container_name(instance_id: &str) -> String {
        format!("grove-{instance_id}")
    }

    async fn docker(args: &[String]) -> Result<std::process::Output, GroveError> {
        Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|e| GroveError::Container(format!("run docker: {e}")))
    }

    async fn start_single(
        &self,
        project: &Project,
        instance_id: &str,
        worktree_dir: &Path,
        image: &str,
        log: &mut SetupLog,
    ) -> Result<StartedContainer, GroveError> {
        let name = Self::container_name(instance_id);
        let workdir = project.container_workdir();

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.clone(),
            "-v".into(),
            format!("{}:{workdir}", worktree_dir.display()),
            "-w".into(),
            workdir.into(),
        ];
        for (source, target) in build_mounts(project, log) {
            args.push("-v".into());
            args.push(format!("{}:{target}", source.display()));
        }
        args.push(image.into());
        args.push("sleep".into());
        args.push("infinity".into());

        log.line(&format!("Starting container {name} (image: {image}) …"));
        let output = Self::docker(&args).await?;
        log.append(&output.stdout);
        log.append(&output.stderr);
        if !output.status.success() {
            return Err(GroveError::Container(format!(
                "docker run: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(StartedContainer {
            name,
            compose_project: String::new(),
        })
    }

    async fn start_compose(
        &self,
        project: &Project,
        instance_id: &str,
        worktree_dir: &Path,
        compose_file: &str,
        log: &mut SetupLog,
    ) -> Result<StartedContainer, GroveError> {
        let compose_project = Self::container_name(instance_id);
        let service = project.container_service();
        let workdir = project.container_workdir();

        // Override file bind-mounting the worktree (and extras) into the
        // agent service; removed when it goes out of scope.
        let mut volumes = compose_bind(&worktree_dir.display().to_string(), workdir);
        for (source, target) in build_mounts(project, log) {
            volumes.push_str(&compose_bind(&source.display().to_string(), &target));
        }
        let override_content = format!("services:\n  {service}:\n    volumes:\n{volumes}");

        let mut override_file = tempfile::Builder::new()
            .prefix("grove-compose-override-")
            .suffix(".yml")
            .tempfile()
            .map_err(|e| GroveError::Container(format!("create compose override: {e}")))?;
        override_file
            .write_all(override_content.as_bytes())
            .map_err(|e| GroveError::Container(format!("write compose override: {e}")))?;

        log.line(&format!(
            "Starting compose stack {compose_project} (compose: {compose_file}, service: {service}) …"
        ));
        let args: Vec<String> = vec![
            "compose".into(),
            "-p".into(),
            compose_project.clone(),
            "-f".into(),
            compose_file.into(),
            "-f".into(),
            override_file.path().display().to_string(),
            "up".into(),
            "-d".into(),
        ];
        let output = Self::docker(&args).await?;
        log.append(&output.stdout);
        log.append(&output.stderr);
        if !output.status.success() {
            return Err(GroveError::Container(format!(
                "docker compose up: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(StartedContainer {
            name: format!("{compose_project}-{service}-1"),
            compose_project,
        })
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn validate(&self) -> Result<(), GroveError> {
        let output = Self::docker(&["info".into()]).await.map_err(|_| {
            GroveError::Container(
                "docker is not available\nInstall Docker: https://docs.docker.com/get-docker/"
                    .into(),
            )
        })?;
        if !output.status.success() {
            return Err(GroveError::Container(
                "docker is not available (docker info failed)\nInstall Docker: https://docs.docker.com/get-docker/"
                    .into(),
            ));
        }
        Ok(())
    }

    async fn start(
        &self,
        project: &Project,
        instance_id: &str,
        worktree_dir: &Path,
        log: &mut SetupLog,
    ) -> Result<StartedContainer, GroveError> {
        if let Some(compose) = project
            .config
            .container
            .compose
            .clone()
            .filter(|c| !c.is_empty())
        {
            return self
                .start_compose(project, instance_id, worktree_dir, &compose, log)
                .await;
        }
        let Some(image) = project
            .config
            .container
            .image
            .clone()
            .filter(|i| !i.is_empty())
        else {
            return Err(GroveError::Container(format!(
                "no container configured in {}\nadd a 'container:' section, e.g.:\n\n  container:\n    image: ubuntu:24.04\n",
                project.main_dir().join(grove_types::OVERLAY_FILE).display()
            )));
        };
        self.start_single(project, instance_id, worktree_dir, &image, log)
            .await
    }

    async fn exec_logged(
        &self,
        target: &str,
        command: &str,
        log: &mut SetupLog,
    ) -> Result<(), GroveError> {
        let args: Vec<String> = vec![
            "exec".into(),
            target.into(),
            "sh".into(),
            "-c".into(),
            command.into(),
        ];
        let output = Self::docker(&args).await?;
        log.append(&output.stdout);
        log.append(&output.stderr);
        if !output.status.success() {
            return Err(GroveError::Container(format!(
                "exec in container {target}: {}",
                output.status
            )));
        }
        Ok(())
    }

    async fn exec_streamed(
        &self,
        target: &str,
        command: &str,
        out: &ResilientWriter,
    ) -> Result<(), GroveError> {
        let mut child = Command::new("docker")
            .args(["exec", target, "sh", "-c", command])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| GroveError::Container(format!("run docker exec: {e}")))?;

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let copy_stdout = async {
            if let Some(stream) = stdout.as_mut() {
                let mut buf = [0u8; 4096];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    out.write(&buf[..n]).await;
                }
            }
        };
        let copy_stderr = async {
            if let Some(stream) = stderr.as_mut() {
                let mut buf = [0u8; 4096];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    out.write(&buf[..n]).await;
                }
            }
        };
        tokio::join!(copy_stdout, copy_stderr);

        let status = child
            .wait()
            .await
            .map_err(|e| GroveError::Container(format!("wait for docker exec: {e}")))?;
        if !status.success() {
            return Err(GroveError::Container(format!(
                "exec in container {target}: {status}"
            )));
        }
        Ok(())
    }

    async fn stop(&self, target: &str, compose_project: &str) {
        if !compose_project.is_empty() {
            let args: Vec<String> = vec![
                "compose".into(),
                "-p".into(),
                compose_project.into(),
                "down".into(),
                "-v".into(),
            ];
            if let Err(e) = Self::docker(&args).await {
                debug!(compose_project, error = %e, "compose down failed");
            }
            return;
        }
        for verb in ["stop", "rm"] {
            let args: Vec<String> = vec![verb.into(), target.into()];
            if let Err(e) = Self::docker(&args).await {
                debug!(target, verb, error = %e, "container teardown step failed");
            }
        }
    }

    async fn ensure_agent_installed(
        &self,
        agent: &str,
        target: &str,
        log: &mut SetupLog,
    ) -> Result<(), GroveError> {
        let probe = format!("command -v {agent} >/dev/null 2>&1");
        if self.exec_logged(target, &probe, log).await.is_ok() {
            return Ok(());
        }

        let (install_script, start_snippet) = match agent {
            // Claude Code ships a native installer; the binary lands in
            // $HOME/.local/bin, symlinked into /usr/local/bin so plain
            // `docker exec … claude` finds it without a login shell.
            "claude" => (
                CLAUDE_INSTALL_SCRIPT,
                "  start:\n    - curl -fsSL https://claude.ai/install.sh | bash\n    - ln -sf /root/.local/bin/claude /usr/local/bin/claude",
            ),
            "aider" => (
                AIDER_INSTALL_SCRIPT,
                "  start:\n    - pip install aider-chat",
            ),
            _ => {
                return Err(GroveError::Container(format!(
                    "agent command {agent:?} not found in container {target}\ninstall it in your container image or add it to 'start:' in grove.yaml"
                )));
            }
        };

        log.line(&format!(
            "Agent {agent:?} not found — auto-installing (this runs once per container)…"
        ));
        if let Err(e) = self.exec_logged(target, install_script, log).await {
            return Err(GroveError::Container(format!(
                "auto-install of {agent:?} failed: {e}\nto install it yourself, add to grove.yaml:\n{start_snippet}"
            )));
        }

        if self.exec_logged(target, &probe, log).await.is_err() {
            return Err(GroveError::Container(format!(
                "auto-install of {agent:?} appeared to succeed but the command is still not in PATH\ncheck that the install placed the binary in a directory on $PATH inside the container"
            )));
        }

        log.line(&format!("Agent {agent:?} installed successfully."));
        Ok(())
    }

    async fn seed_agent_config(&self, agent: &str, target: &str) {
        // A copy, not a bind mount: host and container Claude both rewrite
        // ~/.claude.json frequently, and sharing it corrupts the host file.
        if agent != "claude" {
            return;
        }
        let Some(home) = home_dir() else { return };
        let src = home.join(".claude.json");
        let Ok(data) = std::fs::read(&src) else { return };
        if serde_json::from_slice::<serde_json::Value>(&data).is_err() {
            warn!(path = %src.display(), "not valid JSON, skipping claude config seed");
            return;
        }

        let args: Vec<String> = vec![
            "cp".into(),
            src.display().to_string(),
            format!("{target}:/root/.claude.json"),
        ];
        match Self::docker(&args).await {
            Ok(output) if !output.status.success() => {
                warn!(
                    target,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "docker cp of claude config failed"
                );
            }
            Err(e) => warn!(target, error = %e, "docker cp of claude config failed"),
            Ok(_) => {}
        }
    }

    fn agent_argv(
        &self,
        target: &str,
        workdir: &str,
        agent: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Vec<String> {
        let mut argv: Vec<String> = vec![
            "docker".into(),
            "exec".into(),
            "-i".into(),
            "-t".into(),
            "-w".into(),
            workdir.into(),
        ];
        let mut keys: Vec<&String> = env.keys().collect();
        keys.sort();
        for key in keys {
            argv.push("-e".into());
            argv.push(format!("{key}={}", env[key]));
        }
        argv.push(target.into());
        argv.push(agent.into());
        argv.extend(args.iter().cloned());
        argv
    }
}

const CLAUDE_INSTALL_SCRIPT: &str = r#"set -e
export HOME=/root
export PATH=/root/.local/bin:$PATH
if command -v apk >/dev/null 2>&1; then
  apk add --no-cache libgcc libstdc++ ripgrep curl
elif ! command -v curl >/dev/null 2>&1; then
  if command -v apt-get >/dev/null 2>&1; then
    apt-get update -qq && apt-get install -y -qq curl
  else
    echo "Cannot install Claude: curl not found and no supported package manager." >&2
    exit 1
  fi
fi
curl -fsSL https://claude.ai/install.sh | bash
if [ -f /root/.local/bin/claude ] && [ ! -e /usr/local/bin/claude ]; then
  ln -sf /root/.local/bin/claude /usr/local/bin/claude
fi"#;

const AIDER_INSTALL_SCRIPT: &str = r#"set -e
if ! command -v pip >/dev/null 2>&1 && ! command -v pip3 >/dev/null 2>&1; then
  if command -v apt-get >/dev/null 2>&1; then
    apt-get update -qq && apt-get install -y -qq python3 python3-pip
  elif command -v apk >/dev/null 2>&1; then
    apk add --no-cache python3 py3-pip
  else
    echo "pip not found and no supported package manager available" >&2
    exit 1
  fi
fi
pip install aider-chat 2>/dev/null || pip3 install aider-chat"#;

fn compose_bind(source: &str, target: &str) -> String {
    format!("      - type: bind\n        source: {source}\n        target: {target}\n")
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

/// All (source, target) bind mounts for a container: auto-detected agent
/// credentials first, then user-configured mounts. Missing credential dirs
/// are skipped silently (the agent may not be installed on the host);
/// missing user paths get a warning in the setup log.
pub fn build_mounts(project: &Project, log: &mut SetupLog) -> Vec<(PathBuf, String)> {
    let home = home_dir().unwrap_or_else(|| PathBuf::from("/root"));
    let mut mounts = Vec::new();

    for (source, target) in agent_credential_mounts(project.agent_command(), &home) {
        if source.exists() {
            log.line(&format!("Mounting credentials: {} → {target}", source.display()));
            mounts.push((source, target));
        }
    }

    for entry in &project.config.container.mounts {
        let (source, target) = resolve_mount_path(entry, &home);
        if source.exists() {
            log.line(&format!("Mounting: {} → {target}", source.display()));
            mounts.push((source, target));
        } else {
            log.line(&format!(
                "Warning: skipping mount {entry:?} — path not found on host"
            ));
        }
    }

    mounts
}

/// Credential directories worth mounting for known agent CLIs.
///
/// `~/.claude.json` is deliberately absent: it is seeded by copy instead
/// (see [`ContainerRuntime::seed_agent_config`]).
fn agent_credential_mounts(agent: &str, home: &Path) -> Vec<(PathBuf, String)> {
    match agent {
        "claude" => vec![(home.join(".claude"), "/root/.claude".into())],
        "aider" => vec![(home.join(".aider"), "/root/.aider".into())],
        _ => Vec::new(),
    }
}

/// Expand a user-specified mount path to (host source, container target).
/// `~` maps to `/root`, `~/x` to `/root/x`, absolute paths map to
/// themselves.
pub fn resolve_mount_path(entry: &str, home: &Path) -> (PathBuf, String) {
    if entry == "~" {
        return (home.to_path_buf(), "/root".into());
    }
    if let Some(rel) = entry.strip_prefix("~/") {
        return (home.join(rel), format!("/root/{rel}"));
    }
    (PathBuf::from(entry), entry.to_string())
}
