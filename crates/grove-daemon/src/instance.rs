//! A supervised agent session: PTY runtime, output fan-out, state machine.
//!
//! The instance owns its PTY, child, output ring, and attached client
//! sinks. A dedicated reader thread moves PTY bytes into the append-only
//! log, the ring, and every attached sink, then observes the child's exit
//! and records the terminal state. Handlers interact with the instance only
//! through short lock-held snapshots; nothing here blocks on a client.

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use grove_proto::InstanceInfo;
use grove_types::{GroveError, InstanceState};

use crate::persist;
use crate::pty::PtySession;
use crate::ring::OutputRing;

/// Idle threshold: no PTY output for longer than this reports `WAITING`.
pub const IDLE_THRESHOLD: Duration = Duration::from_secs(2);

/// An attached client, identified so detach removes exactly one sink.
struct AttachSink {
    id: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

struct Runtime {
    state: InstanceState,
    ended_at: Option<DateTime<Utc>>,
    ring: OutputRing,
    last_output: Instant,
    sinks: Vec<AttachSink>,
    next_sink_id: u64,
    kill_requested: bool,
    finish_requested: bool,
    killed: bool,
    pty: Option<Arc<PtySession>>,
    done_rx: watch::Receiver<bool>,
}

/// One supervised agent session.
pub struct Instance {
    pub id: String,
    pub project: String,
    pub branch: String,
    pub worktree_dir: String,
    pub container_id: String,
    pub compose_project: String,
    pub created_at: DateTime<Utc>,
    pub log_path: PathBuf,
    pub record_path: PathBuf,
    runtime: Mutex<Runtime>,
}

impl Instance {
    /// A freshly set-up instance, before its agent is spawned.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        id: String,
        project: String,
        branch: String,
        worktree_dir: String,
        container_id: String,
        compose_project: String,
        log_path: PathBuf,
        record_path: PathBuf,
    ) -> Arc<Self> {
        let (_, done_rx) = watch::channel(true);
        Arc::new(Self {
            id,
            project,
            branch,
            worktree_dir,
            container_id,
            compose_project,
            created_at: Utc::now(),
            log_path,
            record_path,
            runtime: Mutex::new(Runtime {
                state: InstanceState::Running,
                ended_at: None,
                ring: OutputRing::default(),
                last_output: Instant::now(),
                sinks: Vec::new(),
                next_sink_id: 0,
                kill_requested: false,
                finish_requested: false,
                killed: false,
                pty: None,
                done_rx,
            }),
        })
    }

    /// Rebuild an instance from its persisted record (no child process).
    pub fn from_record(
        info: &InstanceInfo,
        log_path: PathBuf,
        record_path: PathBuf,
    ) -> Arc<Self> {
        let (_, done_rx) = watch::channel(true);
        Arc::new(Self {
            id: info.id.clone(),
            project: info.project.clone(),
            branch: info.branch.clone(),
            worktree_dir: info.worktree_dir.clone(),
            container_id: info.container_id.clone(),
            compose_project: info.compose_project.clone(),
            created_at: Utc
                .timestamp_opt(info.created_at, 0)
                .single()
                .unwrap_or_else(Utc::now),
            log_path,
            record_path,
            runtime: Mutex::new(Runtime {
                state: info.state,
                ended_at: if info.ended_at > 0 {
                    Utc.timestamp_opt(info.ended_at, 0).single()
                } else {
                    None
                },
                ring: OutputRing::default(),
                last_output: Instant::now(),
                sinks: Vec::new(),
                next_sink_id: 0,
                kill_requested: false,
                finish_requested: false,
                killed: false,
                pty: None,
                done_rx,
            }),
        })
    }

    /// Spawn the agent in a fresh PTY and start the reader thread.
    ///
    /// `argv` is the full command line (for normal operation, the container
    /// exec of the agent); `env` is the complete child environment.
    pub fn start_agent(self: &Arc<Self>, argv: &[String], env: &[String]) -> Result<(), GroveError> {
        let pty = Arc::new(PtySession::spawn(argv, env)?);
        let (done_tx, done_rx) = watch::channel(false);
        {
            let mut rt = self.runtime.lock().unwrap();
            rt.state = InstanceState::Running;
            rt.ended_at = None;
            rt.last_output = Instant::now();
            rt.pty = Some(pty.clone());
            rt.done_rx = done_rx;
        }
        self.persist();
        info!(instance = %self.id, pid = pty.pid(), command = %argv.join(" "), "agent spawned");

        let inst = Arc::clone(self);
        std::thread::spawn(move || inst.read_loop(pty, done_tx));
        Ok(())
    }

    /// Reader thread: PTY → log + ring + sinks, then exit observation.
    fn read_loop(self: Arc<Self>, pty: Arc<PtySession>, done_tx: watch::Sender<bool>) {
        let mut log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|e| {
                warn!(instance = %self.id, error = %e, "could not open instance log");
                e
            })
            .ok();
        let mut buf = [0u8; 8192];

        loop {
            let readable = match pty.poll_readable(200) {
                Ok(r) => r,
                Err(e) => {
                    warn!(instance = %self.id, error = %e, "pty poll failed");
                    break;
                }
            };
            if readable {
                match pty.read(&mut buf) {
                    Ok(0) => {
                        if !pty.is_alive() {
                            break;
                        }
                    }
                    Ok(n) => self.publish(&buf[..n], log.as_mut()),
                    Err(e) => {
                        warn!(instance = %self.id, error = %e, "pty read failed");
                        break;
                    }
                }
            } else if !pty.is_alive() {
                // Drain whatever the child wrote before exiting.
                while let Ok(n) = pty.read(&mut buf) {
                    if n == 0 {
                        break;
                    }
                    self.publish(&buf[..n], log.as_mut());
                }
                break;
            }
        }

        self.observe_exit(&pty);
        let _ = done_tx.send(true);
    }

    /// One chunk of agent output, in PTY order.
    fn publish(&self, chunk: &[u8], log: Option<&mut std::fs::File>) {
        if let Some(f) = log {
            let _ = f.write_all(chunk);
        }
        let mut rt = self.runtime.lock().unwrap();
        rt.ring.push(chunk);
        rt.last_output = Instant::now();
        rt.sinks.retain(|sink| sink.tx.send(chunk.to_vec()).is_ok());
    }

    /// Collect the exit status and record the terminal state.
    fn observe_exit(self: &Arc<Self>, pty: &PtySession) {
        let code = match pty.wait() {
            Ok(code) => code,
            Err(e) => {
                warn!(instance = %self.id, error = %e, "wait for agent failed");
                -1
            }
        };

        let state = {
            let mut rt = self.runtime.lock().unwrap();
            let state = if rt.finish_requested {
                InstanceState::Finished
            } else if rt.kill_requested {
                InstanceState::Killed
            } else if code == 0 {
                InstanceState::Exited
            } else {
                InstanceState::Crashed
            };
            rt.state = state;
            rt.ended_at = Some(Utc::now());
            rt.pty = None;
            rt.sinks.clear();
            state
        };

        info!(instance = %self.id, exit_code = code, state = %state, "agent exited");
        self.persist();
    }

    /// Current publication state, with live instances derived as
    /// `RUNNING`/`WAITING` from output recency.
    pub fn state(&self) -> InstanceState {
        let rt = self.runtime.lock().unwrap();
        Self::published_state(&rt)
    }

    fn published_state(rt: &Runtime) -> InstanceState {
        match rt.state {
            InstanceState::Running | InstanceState::Waiting => {
                if rt.last_output.elapsed() > IDLE_THRESHOLD {
                    InstanceState::Waiting
                } else {
                    InstanceState::Running
                }
            }
            other => other,
        }
    }

    /// Public summary for `LIST` and streaming clients.
    pub fn info(&self) -> InstanceInfo {
        let rt = self.runtime.lock().unwrap();
        self.info_with_state(&rt, Self::published_state(&rt))
    }

    /// The record persisted to disk: the raw state, never the idle-derived
    /// publication.
    pub fn record(&self) -> InstanceInfo {
        let rt = self.runtime.lock().unwrap();
        self.info_with_state(&rt, rt.state)
    }

    fn info_with_state(&self, rt: &Runtime, state: InstanceState) -> InstanceInfo {
        InstanceInfo {
            id: self.id.clone(),
            project: self.project.clone(),
            branch: self.branch.clone(),
            worktree_dir: self.worktree_dir.clone(),
            container_id: self.container_id.clone(),
            compose_project: self.compose_project.clone(),
            created_at: self.created_at.timestamp(),
            ended_at: rt.ended_at.map(|t| t.timestamp()).unwrap_or(0),
            state,
        }
    }

    /// Write the persistent record; failures are logged, not surfaced.
    pub fn persist(&self) {
        let record = self.record();
        if let Err(e) = persist::write_record(&self.record_path, &record) {
            warn!(instance = %self.id, error = %e, "could not persist instance record");
        }
    }

    /// Register an attach sink. Returns the sink handle, the output
    /// receiver, and the PTY for input injection.
    pub fn attach(
        &self,
    ) -> Result<(u64, mpsc::UnboundedReceiver<Vec<u8>>, Arc<PtySession>), GroveError> {
        let mut rt = self.runtime.lock().unwrap();
        if rt.state.is_terminal() {
            return Err(GroveError::Protocol(format!(
                "instance has {}",
                rt.state.as_str().to_lowercase()
            )));
        }
        let pty = rt
            .pty
            .clone()
            .ok_or_else(|| GroveError::Pty("agent process is not running".into()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = rt.next_sink_id;
        rt.next_sink_id += 1;
        rt.sinks.push(AttachSink { id, tx });
        if matches!(rt.state, InstanceState::Running | InstanceState::Waiting) {
            rt.state = InstanceState::Attached;
        }
        Ok((id, rx, pty))
    }

    /// Remove an attach sink; reverts `ATTACHED` while the child is alive.
    pub fn detach(&self, sink_id: u64) {
        let mut rt = self.runtime.lock().unwrap();
        rt.sinks.retain(|sink| sink.id != sink_id);
        if rt.state == InstanceState::Attached {
            rt.state = InstanceState::Running;
        }
    }

    /// Mark the finish request so the exit observer records `FINISHED`.
    pub fn request_finish(&self) {
        self.runtime.lock().unwrap().finish_requested = true;
    }

    /// Directly promote an already-dead instance to `FINISHED`.
    pub fn set_finished(&self) {
        let mut rt = self.runtime.lock().unwrap();
        rt.state = InstanceState::Finished;
        if rt.ended_at.is_none() {
            rt.ended_at = Some(Utc::now());
        }
    }

    /// Enter `CHECKING`; fails with the current state when terminal or
    /// already checking.
    pub fn begin_check(&self) -> Result<(), InstanceState> {
        let mut rt = self.runtime.lock().unwrap();
        if rt.state.is_terminal() || rt.state == InstanceState::Checking {
            return Err(Self::published_state(&rt));
        }
        rt.state = InstanceState::Checking;
        Ok(())
    }

    /// Leave `CHECKING`. A terminal state recorded meanwhile (agent exit
    /// during the check) is left untouched.
    pub fn end_check(&self) {
        let mut rt = self.runtime.lock().unwrap();
        if rt.state == InstanceState::Checking {
            rt.state = InstanceState::Waiting;
        }
    }

    /// Kill the agent's process group. Sets the kill-requested flag first so
    /// the exit observer records `KILLED`. Idempotent; a missing process is
    /// not an error.
    pub fn destroy(&self) {
        let (pty, first_kill) = {
            let mut rt = self.runtime.lock().unwrap();
            rt.kill_requested = true;
            let first_kill = !rt.killed;
            rt.killed = true;
            (rt.pty.clone(), first_kill)
        };
        if let Some(pty) = pty {
            if first_kill {
                info!(instance = %self.id, pid = pty.pid(), "kill requested");
            }
            if let Err(e) = pty.kill_group() {
                warn!(instance = %self.id, error = %e, "kill failed");
            }
        }
    }

    /// Clear end-of-life bookkeeping before respawning in place.
    pub fn reset_for_restart(&self) {
        let mut rt = self.runtime.lock().unwrap();
        rt.ended_at = None;
        rt.kill_requested = false;
        rt.finish_requested = false;
        rt.killed = false;
    }

    /// A receiver that becomes `true` once the current child's exit has been
    /// observed (immediately `true` when there is no child).
    pub fn done_receiver(&self) -> watch::Receiver<bool> {
        self.runtime.lock().unwrap().done_rx.clone()
    }

    /// Copy of the output ring.
    pub fn ring_snapshot(&self) -> (Vec<u8>, u64) {
        let rt = self.runtime.lock().unwrap();
        (rt.ring.snapshot(), rt.ring.end_offset())
    }

    /// Ring bytes past `offset` (clamped if the ring wrapped) and the new
    /// offset.
    pub fn ring_read_from(&self, offset: u64) -> (Vec<u8>, u64) {
        let rt = self.runtime.lock().unwrap();
        rt.ring.read_from(offset)
    }
}
