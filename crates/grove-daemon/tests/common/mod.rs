//! Shared helpers for integration tests.
//!
//! Each integration test file compiles common/ as its own module, so not
//! every helper is used in every file.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use grove_daemon::container::{ContainerRuntime, StartedContainer};
use grove_daemon::stream::{ResilientWriter, SetupLog};
use grove_daemon::worktree::WorktreeProvider;
use grove_daemon::Daemon;
use grove_proto::{Request, Response};
use grove_types::{paths, GroveError, Project};

/// Records collaborator teardown calls so tests can assert rollback order.
pub type Events = Arc<Mutex<Vec<String>>>;

pub fn events() -> Events {
    Arc::new(Mutex::new(Vec::new()))
}

/// A container runtime that runs everything locally with `sh -c` and execs
/// the agent directly, so instance lifecycles can be exercised without
/// Docker.
pub struct ShellRuntime {
    pub events: Events,
}

impl ShellRuntime {
    pub fn new() -> Self {
        Self { events: events() }
    }

    pub fn with_events(events: Events) -> Self {
        Self { events }
    }
}

#[async_trait]
impl ContainerRuntime for ShellRuntime {
    async fn validate(&self) -> Result<(), GroveError> {
        Ok(())
    }

    async fn start(
        &self,
        _project: &Project,
        instance_id: &str,
        worktree_dir: &Path,
        log: &mut SetupLog,
    ) -> Result<StartedContainer, GroveError> {
        log.line(&format!(
            "Starting shell container for {instance_id} at {}",
            worktree_dir.display()
        ));
        Ok(StartedContainer {
            name: format!("shell-{instance_id}"),
            compose_project: String::new(),
        })
    }

    async fn exec_logged(
        &self,
        _target: &str,
        command: &str,
        log: &mut SetupLog,
    ) -> Result<(), GroveError> {
        let output = tokio::process::Command::new("/bin/sh")
            .args(["-c", command])
            .output()
            .await
            .map_err(|e| GroveError::Container(format!("run sh: {e}")))?;
        log.append(&output.stdout);
        log.append(&output.stderr);
        if !output.status.success() {
            return Err(GroveError::Container(format!(
                "command {command:?} failed: {}",
                output.status
            )));
        }
        Ok(())
    }

    async fn exec_streamed(
        &self,
        _target: &str,
        command: &str,
        out: &ResilientWriter,
    ) -> Result<(), GroveError> {
        let mut child = tokio::process::Command::new("/bin/sh")
            .args(["-c", command])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| GroveError::Container(format!("run sh: {e}")))?;

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let copy_out = async {
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
        let copy_err = async {
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
        tokio::join!(copy_out, copy_err);

        let status = child
            .wait()
            .await
            .map_err(|e| GroveError::Container(format!("wait: {e}")))?;
        if !status.success() {
            return Err(GroveError::Container(format!(
                "command {command:?} failed: {status}"
            )));
        }
        Ok(())
    }

    async fn stop(&self, target: &str, _compose_project: &str) {
        self.events.lock().unwrap().push(format!("container-stop:{target}"));
    }

    async fn ensure_agent_installed(
        &self,
        _agent: &str,
        _target: &str,
        _log: &mut SetupLog,
    ) -> Result<(), GroveError> {
        Ok(())
    }

    async fn seed_agent_config(&self, _agent: &str, _target: &str) {}

    fn agent_argv(
        &self,
        _target: &str,
        _workdir: &str,
        agent: &str,
        args: &[String],
        _env: &HashMap<String, String>,
    ) -> Vec<String> {
        let mut argv = vec![agent.to_string()];
        argv.extend(args.iter().cloned());
        argv
    }
}

/// A worktree provider that just makes directories under the data root.
pub struct TempWorktrees {
    pub events: Events,
}

impl TempWorktrees {
    pub fn new() -> Self {
        Self { events: events() }
    }

    pub fn with_events(events: Events) -> Self {
        Self { events }
    }
}

#[async_trait]
impl WorktreeProvider for TempWorktrees {
    async fn ensure_main_checkout(
        &self,
        project: &Project,
        _log: &mut SetupLog,
    ) -> Result<(), GroveError> {
        std::fs::create_dir_all(project.main_dir())?;
        Ok(())
    }

    async fn pull_main(&self, _project: &Project, _log: &mut SetupLog) -> Result<(), GroveError> {
        Ok(())
    }

    async fn create_worktree(
        &self,
        project: &Project,
        instance_id: &str,
        _branch: &str,
        log: &mut SetupLog,
    ) -> Result<PathBuf, GroveError> {
        let dir = project.worktree_dir(instance_id);
        std::fs::create_dir_all(&dir)?;
        log.line(&format!("Created worktree {}", dir.display()));
        Ok(dir)
    }

    async fn remove_worktree(&self, _main_dir: &Path, worktree_dir: &Path, branch: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("worktree-remove:{branch}"));
        let _ = std::fs::remove_dir_all(worktree_dir);
    }
}

/// A running daemon on a temp root, reachable over its real socket.
pub struct Harness {
    pub root: tempfile::TempDir,
    pub socket: PathBuf,
    pub daemon: Arc<Daemon>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
}

impl Harness {
    pub async fn start() -> Self {
        Self::start_with(
            tempfile::tempdir().unwrap(),
            Box::new(ShellRuntime::new()),
            Box::new(TempWorktrees::new()),
        )
        .await
    }

    pub async fn start_with(
        root: tempfile::TempDir,
        containers: Box<dyn ContainerRuntime>,
        worktrees: Box<dyn WorktreeProvider>,
    ) -> Self {
        let daemon =
            Daemon::with_collaborators(root.path().to_path_buf(), containers, worktrees).unwrap();
        let socket = paths::socket_path(root.path());
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        {
            let daemon = daemon.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                daemon.run(&socket, shutdown_rx).await.unwrap();
            });
        }
        // Wait for the listener to come up.
        for _ in 0..200 {
            if UnixStream::connect(&socket).await.is_ok() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        Self {
            root,
            socket,
            daemon,
            shutdown_tx,
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Register a project and write its `grove.yaml` overlay.
    pub fn add_project(&self, name: &str, overlay: &str) {
        let dir = paths::project_dir(self.root.path(), name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("project.yaml"),
            format!("name: {name}\nrepo: local\n"),
        )
        .unwrap();
        let main = paths::main_dir(self.root.path(), name);
        std::fs::create_dir_all(&main).unwrap();
        std::fs::write(main.join("grove.yaml"), overlay).unwrap();
    }

    /// Open a connection and send one request; the caller drives the rest.
    pub async fn connect_send(
        &self,
        req: &Request,
    ) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf, Response) {
        let stream = UnixStream::connect(&self.socket).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut data = serde_json::to_vec(req).unwrap();
        data.push(b'\n');
        write_half.write_all(&data).await.unwrap();

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let resp: Response = serde_json::from_str(line.trim()).unwrap();
        (reader, write_half, resp)
    }

    /// One-shot request/response.
    pub async fn rpc(&self, req: &Request) -> Response {
        let (_reader, _writer, resp) = self.connect_send(req).await;
        resp
    }

    /// START an instance and return its ID (panics on failure).
    pub async fn start_instance(&self, project: &str, branch: &str) -> String {
        let mut req = Request::new(grove_proto::RequestType::Start);
        req.project = project.to_string();
        req.branch = branch.to_string();
        let resp = self.rpc(&req).await;
        assert!(resp.ok, "start failed: {}", resp.error);
        resp.instance_id
    }

    pub async fn list(&self) -> Vec<grove_proto::InstanceInfo> {
        let resp = self.rpc(&Request::new(grove_proto::RequestType::List)).await;
        assert!(resp.ok, "list failed: {}", resp.error);
        resp.instances
    }

    /// Poll LIST until the instance reaches `state` or the timeout expires.
    pub async fn wait_for_state(
        &self,
        instance_id: &str,
        state: grove_types::InstanceState,
        timeout: std::time::Duration,
    ) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            let instances = self.list().await;
            if instances
                .iter()
                .any(|i| i.id == instance_id && i.state == state)
            {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        false
    }

    pub fn instance_log(&self, instance_id: &str) -> String {
        std::fs::read_to_string(paths::instance_log(self.root.path(), instance_id))
            .unwrap_or_default()
    }
}

/// A minimal overlay running a quiet long-lived shell agent.
pub fn quiet_agent_overlay() -> &'static str {
    "agent:\n  command: /bin/sh\n  args: [\"-c\", \"exec cat\"]\n"
}
