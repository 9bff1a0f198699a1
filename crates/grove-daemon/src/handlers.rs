//! One handler per request type.
//!
//! Handlers validate, mutate the registry, and orchestrate the container
//! and worktree collaborators. Per-instance failures never take the daemon
//! down; they become one-line error responses or log entries.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use grove_proto::{frames, Request, Response};
use grove_types::{envfile, paths, Project};

use crate::instance::Instance;
use crate::persist;
use crate::stream::{ResilientWriter, SetupLog};
use crate::worktree::repo_url_hint;
use crate::Daemon;

type ConnReader = BufReader<OwnedReadHalf>;

/// Write the single JSON response line.
pub(crate) async fn respond(writer: &mut OwnedWriteHalf, resp: &Response) -> std::io::Result<()> {
    let mut data = serde_json::to_vec(resp)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    data.push(b'\n');
    writer.write_all(&data).await
}

fn lookup(daemon: &Daemon, instance_id: &str) -> Result<Arc<Instance>, Response> {
    daemon
        .registry
        .get(instance_id)
        .ok_or_else(|| Response::error(format!("instance not found: {instance_id}")))
}

/// Everything the daemon acquired for an instance during setup, in
/// acquisition order. On failure the steps are compensated in reverse.
enum Rollback {
    Worktree {
        main_dir: PathBuf,
        worktree_dir: PathBuf,
        branch: String,
    },
    Container {
        target: String,
        compose_project: String,
    },
}

async fn unwind(daemon: &Daemon, rollbacks: Vec<Rollback>) {
    for step in rollbacks.into_iter().rev() {
        match step {
            Rollback::Container {
                target,
                compose_project,
            } => daemon.containers.stop(&target, &compose_project).await,
            Rollback::Worktree {
                main_dir,
                worktree_dir,
                branch,
            } => {
                daemon
                    .worktrees
                    .remove_worktree(&main_dir, &worktree_dir, &branch)
                    .await
            }
        }
    }
}

/// Log which credential keys the agent environment carries (names only) so
/// auth problems can be diagnosed from the daemon log.
fn log_agent_credentials(instance_id: &str, env: &std::collections::HashMap<String, String>) {
    let found: Vec<&str> = ["CLAUDE_CODE_OAUTH_TOKEN", "ANTHROPIC_API_KEY"]
        .into_iter()
        .filter(|k| env.get(*k).is_some_and(|v| !v.is_empty()))
        .collect();
    if found.is_empty() {
        warn!(instance = instance_id, "no agent credentials found — agent may show a login screen");
    } else {
        info!(instance = instance_id, keys = found.join(", "), "agent credentials present");
    }
}

/// The complete environment for the agent child: the daemon's own
/// environment with the agent entries merged over it.
fn child_env(agent_env: &std::collections::HashMap<String, String>) -> Vec<String> {
    let host: Vec<String> = std::env::vars().map(|(k, v)| format!("{k}={v}")).collect();
    envfile::env_with(&host, agent_env.iter().map(|(k, v)| format!("{k}={v}")))
}

fn agent_environment(
    daemon: &Daemon,
    req: &Request,
) -> std::collections::HashMap<String, String> {
    let mut env = envfile::load(&paths::env_file(&daemon.root));
    for (k, v) in &req.agent_env {
        env.insert(k.clone(), v.clone());
    }
    env
}

// ─── START ───────────────────────────────────────────────────────────────

pub(crate) async fn handle_start(daemon: &Arc<Daemon>, mut writer: OwnedWriteHalf, req: Request) {
    if req.project.is_empty() {
        let _ = respond(&mut writer, &Response::error("project name required")).await;
        return;
    }
    if req.branch.is_empty() {
        let _ = respond(&mut writer, &Response::error("branch name required")).await;
        return;
    }

    let mut project = match Project::load(&daemon.root, &req.project) {
        Ok(p) => p,
        Err(e) => {
            let _ = respond(&mut writer, &Response::error(e.to_string())).await;
            return;
        }
    };

    let started = Instant::now();
    let instance_id = daemon.registry.allocate_id();
    let mut setup = SetupLog::new(&paths::instance_log(&daemon.root, &instance_id));
    info!(
        project = %req.project,
        branch = %req.branch,
        instance = %instance_id,
        repo = %project.repo,
        main_dir = %project.main_dir().display(),
        "start requested"
    );

    let mut rollbacks: Vec<Rollback> = Vec::new();
    match run_setup(daemon, &mut project, &req, &instance_id, &mut setup, &mut rollbacks, started)
        .await
    {
        Ok(instance) => {
            daemon.registry.insert(instance.clone());
            instance.persist();
            let _ = respond(&mut writer, &Response::with_instance(&instance_id)).await;
            if !setup.buffer().is_empty() {
                let _ = writer.write_all(setup.buffer()).await;
            }
            info!(
                project = %req.project,
                branch = %req.branch,
                instance = %instance_id,
                worktree = %instance.worktree_dir,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "start succeeded"
            );
        }
        Err(failure) => {
            unwind(daemon, rollbacks).await;
            daemon.registry.release_id(&instance_id);
            let _ = respond(&mut writer, &failure).await;
        }
    }
}

/// The ordered setup ladder. Each fallible step logs its stage and elapsed
/// time on failure; each acquired resource pushes a compensating rollback.
async fn run_setup(
    daemon: &Arc<Daemon>,
    project: &mut Project,
    req: &Request,
    instance_id: &str,
    setup: &mut SetupLog,
    rollbacks: &mut Vec<Rollback>,
    started: Instant,
) -> Result<Arc<Instance>, Response> {
    let fail_project = project.name.clone();
    let fail_branch = req.branch.clone();
    let fail_instance = instance_id.to_string();
    let fail_log = move |stage: &str, err: &dyn std::fmt::Display| {
        error!(
            stage,
            project = %fail_project,
            branch = %fail_branch,
            instance = %fail_instance,
            elapsed_ms = started.elapsed().as_millis() as u64,
            error = %err,
            "start failed"
        );
    };

    if let Err(e) = daemon.worktrees.ensure_main_checkout(project, setup).await {
        if let Some(hint) = repo_url_hint(&project.repo) {
            error!(
                stage = "clone",
                project = %project.name,
                repo = %project.repo,
                hint,
                error = %e,
                "start failed"
            );
        } else {
            fail_log("clone", &e);
        }
        return Err(Response::error(e.to_string()));
    }

    // Pull so the worktree branches from the current remote HEAD; offline
    // use still works.
    if let Err(e) = daemon.worktrees.pull_main(project, setup).await {
        warn!(project = %project.name, error = %e, "git pull failed");
    }

    match project.load_overlay() {
        Ok(true) => {}
        Ok(false) => {
            // Not configured enough to start; hand the client the main
            // directory so it can prompt the user to create grove.yaml.
            return Err(Response {
                init_path: project.main_dir().display().to_string(),
                ..Response::error(format!("no grove.yaml found in {}", project.name))
            });
        }
        Err(e) => {
            fail_log("config", &e);
            return Err(Response::error(e.to_string()));
        }
    }

    let worktree_dir = match daemon
        .worktrees
        .create_worktree(project, instance_id, &req.branch, setup)
        .await
    {
        Ok(dir) => dir,
        Err(e) => {
            fail_log("worktree", &e);
            return Err(Response::error(e.to_string()));
        }
    };
    rollbacks.push(Rollback::Worktree {
        main_dir: project.main_dir(),
        worktree_dir: worktree_dir.clone(),
        branch: req.branch.clone(),
    });

    let container = match daemon
        .containers
        .start(project, instance_id, &worktree_dir, setup)
        .await
    {
        Ok(c) => c,
        Err(e) => {
            fail_log("container", &e);
            return Err(Response::error(e.to_string()));
        }
    };
    rollbacks.push(Rollback::Container {
        target: container.name.clone(),
        compose_project: container.compose_project.clone(),
    });

    let agent_cmd = project.agent_command().to_string();
    daemon
        .containers
        .seed_agent_config(&agent_cmd, &container.name)
        .await;

    for cmd in &project.config.start {
        setup.line(&format!("$ {cmd}"));
        if let Err(e) = daemon
            .containers
            .exec_logged(&container.name, cmd, setup)
            .await
        {
            fail_log("start", &e);
            return Err(Response::error(e.to_string()));
        }
    }

    if let Err(e) = daemon
        .containers
        .ensure_agent_installed(&agent_cmd, &container.name, setup)
        .await
    {
        fail_log("agent-install", &e);
        return Err(Response::error(e.to_string()));
    }

    let instance = Instance::create(
        instance_id.to_string(),
        project.name.clone(),
        req.branch.clone(),
        worktree_dir.display().to_string(),
        container.name.clone(),
        container.compose_project.clone(),
        paths::instance_log(&daemon.root, instance_id),
        paths::instance_record(&daemon.root, instance_id),
    );

    let agent_env = agent_environment(daemon, req);
    log_agent_credentials(instance_id, &agent_env);
    let argv = daemon.containers.agent_argv(
        &container.name,
        project.container_workdir(),
        &agent_cmd,
        &project.config.agent.args,
        &agent_env,
    );
    if let Err(e) = instance.start_agent(&argv, &child_env(&agent_env)) {
        fail_log("agent-launch", &e);
        return Err(Response::error(e.to_string()));
    }

    Ok(instance)
}

// ─── LIST ────────────────────────────────────────────────────────────────

pub(crate) async fn handle_list(daemon: &Arc<Daemon>, mut writer: OwnedWriteHalf) {
    let mut infos: Vec<_> = daemon
        .registry
        .snapshot()
        .iter()
        .map(|inst| inst.info())
        .collect();
    infos.sort_by_key(|info| info.created_at);

    let resp = Response {
        instances: infos,
        ..Response::ok()
    };
    let _ = respond(&mut writer, &resp).await;
}

// ─── ATTACH ──────────────────────────────────────────────────────────────

pub(crate) async fn handle_attach(
    daemon: &Arc<Daemon>,
    reader: ConnReader,
    mut writer: OwnedWriteHalf,
    req: Request,
) {
    let inst = match lookup(daemon, &req.instance_id) {
        Ok(inst) => inst,
        Err(resp) => {
            let _ = respond(&mut writer, &resp).await;
            return;
        }
    };

    let (sink_id, mut output_rx, pty) = match inst.attach() {
        Ok(attached) => attached,
        Err(e) => {
            let _ = respond(&mut writer, &Response::error(e.to_string())).await;
            return;
        }
    };
    if respond(&mut writer, &Response::ok()).await.is_err() {
        inst.detach(sink_id);
        return;
    }
    info!(instance = %inst.id, "client attached");

    // Client → PTY on its own task so a half-read frame is never torn by
    // the output side finishing first.
    let (detach_tx, mut detach_rx) = tokio::sync::oneshot::channel::<()>();
    let pty_in = pty.clone();
    let input_task = tokio::spawn(async move {
        let mut reader = reader;
        loop {
            match frames::read_frame(&mut reader).await {
                Ok((frames::FRAME_DATA, payload)) => {
                    if pty_in.write_all(&payload).is_err() {
                        break;
                    }
                }
                Ok((frames::FRAME_RESIZE, payload)) => {
                    if let Some((cols, rows)) = frames::parse_resize(&payload) {
                        let _ = pty_in.resize(cols, rows);
                    }
                }
                Ok((frames::FRAME_DETACH, _)) => break,
                Ok(_) => {} // unknown frame types are ignored
                Err(_) => break,
            }
        }
        let _ = detach_tx.send(());
    });

    // PTY → client until detach, client error, or agent exit (which closes
    // the sink).
    loop {
        tokio::select! {
            chunk = output_rx.recv() => match chunk {
                Some(data) => {
                    if frames::write_frame(&mut writer, frames::FRAME_DATA, &data)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                None => break,
            },
            _ = &mut detach_rx => break,
        }
    }

    inst.detach(sink_id);
    input_task.abort();
    info!(instance = %inst.id, "client detached");
}

// ─── LOGS / LOGS_FOLLOW ──────────────────────────────────────────────────

pub(crate) async fn handle_logs(daemon: &Arc<Daemon>, mut writer: OwnedWriteHalf, req: Request) {
    let inst = match lookup(daemon, &req.instance_id) {
        Ok(inst) => inst,
        Err(resp) => {
            let _ = respond(&mut writer, &resp).await;
            return;
        }
    };
    let (snapshot, _) = inst.ring_snapshot();
    if respond(&mut writer, &Response::with_instance(&inst.id)).await.is_err() {
        return;
    }
    let _ = writer.write_all(&snapshot).await;
}

pub(crate) async fn handle_logs_follow(
    daemon: &Arc<Daemon>,
    mut writer: OwnedWriteHalf,
    req: Request,
) {
    let inst = match lookup(daemon, &req.instance_id) {
        Ok(inst) => inst,
        Err(resp) => {
            let _ = respond(&mut writer, &resp).await;
            return;
        }
    };
    if respond(&mut writer, &Response::ok()).await.is_err() {
        return;
    }

    let (snapshot, mut offset) = inst.ring_snapshot();
    if !snapshot.is_empty() && writer.write_all(&snapshot).await.is_err() {
        return;
    }

    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(100));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let (delta, next_offset) = inst.ring_read_from(offset);
        offset = next_offset;
        if !delta.is_empty() && writer.write_all(&delta).await.is_err() {
            return;
        }
        if inst.state().is_terminal() && delta.is_empty() {
            return;
        }
    }
}

// ─── STOP ────────────────────────────────────────────────────────────────

pub(crate) async fn handle_stop(daemon: &Arc<Daemon>, mut writer: OwnedWriteHalf, req: Request) {
    let inst = match lookup(daemon, &req.instance_id) {
        Ok(inst) => inst,
        Err(resp) => {
            let _ = respond(&mut writer, &resp).await;
            return;
        }
    };
    // The exit observer performs the KILLED transition; already-dead
    // instances make this a no-op.
    inst.destroy();
    let _ = respond(&mut writer, &Response::ok()).await;
}

// ─── DROP ────────────────────────────────────────────────────────────────

pub(crate) async fn handle_drop(daemon: &Arc<Daemon>, mut writer: OwnedWriteHalf, req: Request) {
    let inst = match lookup(daemon, &req.instance_id) {
        Ok(inst) => inst,
        Err(resp) => {
            let _ = respond(&mut writer, &resp).await;
            return;
        }
    };

    inst.destroy();
    daemon
        .containers
        .stop(&inst.container_id, &inst.compose_project)
        .await;

    let main_dir = paths::main_dir(&daemon.root, &inst.project);
    daemon
        .worktrees
        .remove_worktree(&main_dir, std::path::Path::new(&inst.worktree_dir), &inst.branch)
        .await;

    daemon.registry.remove(&inst.id);
    persist::remove_record(&inst.record_path);
    info!(instance = %inst.id, project = %inst.project, "instance dropped");

    let _ = respond(&mut writer, &Response::ok()).await;
}

// ─── FINISH ──────────────────────────────────────────────────────────────

pub(crate) async fn handle_finish(daemon: &Arc<Daemon>, mut writer: OwnedWriteHalf, req: Request) {
    let inst = match lookup(daemon, &req.instance_id) {
        Ok(inst) => inst,
        Err(resp) => {
            let _ = respond(&mut writer, &resp).await;
            return;
        }
    };

    let ack = Response {
        worktree_dir: inst.worktree_dir.clone(),
        branch: inst.branch.clone(),
        ..Response::ok()
    };

    use grove_types::InstanceState::*;
    match inst.record().state {
        Finished => {
            // Already finished; skip the finish commands.
            let _ = respond(&mut writer, &ack).await;
            return;
        }
        Exited | Crashed | Killed => {
            // Process already dead; promote directly.
            inst.set_finished();
        }
        _ => {
            // Agent is alive: request finish so the exit observer records
            // FINISHED, kill it, and wait for the exit observation.
            inst.request_finish();
            inst.destroy();
            let mut done = inst.done_receiver();
            let _ = done.wait_for(|&v| v).await;
        }
    }

    inst.persist();
    let _ = respond(&mut writer, &ack).await;

    // Finish commands run after the ACK; the instance stays FINISHED no
    // matter what they do.
    let mut project = match Project::load(&daemon.root, &inst.project) {
        Ok(p) => p,
        Err(e) => {
            let _ = writer
                .write_all(format!("warning: could not load project to run finish commands: {e}\n").as_bytes())
                .await;
            return;
        }
    };
    if let Err(e) = project.load_overlay() {
        warn!(project = %inst.project, error = %e, "could not read grove.yaml");
    }
    if project.config.finish.is_empty() {
        return;
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&inst.log_path)
        .ok();
    let out = ResilientWriter::new(Some(writer), log_file);

    for cmd in &project.config.finish {
        let expanded = cmd.replace("{{branch}}", &inst.branch);
        out.line(&format!("$ {expanded}")).await;
        if let Err(e) = daemon
            .containers
            .exec_streamed(&inst.container_id, &expanded, &out)
            .await
        {
            out.line(&format!("error: command failed: {e}")).await;
            warn!(instance = %inst.id, error = %e, "finish command failed");
            return;
        }
    }
}

// ─── CHECK ───────────────────────────────────────────────────────────────

/// Reverts `CHECKING` when the handler leaves, however it leaves.
struct CheckGuard(Arc<Instance>);

impl Drop for CheckGuard {
    fn drop(&mut self) {
        self.0.end_check();
    }
}

pub(crate) async fn handle_check(daemon: &Arc<Daemon>, mut writer: OwnedWriteHalf, req: Request) {
    let inst = match lookup(daemon, &req.instance_id) {
        Ok(inst) => inst,
        Err(resp) => {
            let _ = respond(&mut writer, &resp).await;
            return;
        }
    };

    if let Err(state) = inst.begin_check() {
        let _ = respond(
            &mut writer,
            &Response::error(format!("cannot check: instance is {state}")),
        )
        .await;
        return;
    }
    let _guard = CheckGuard(inst.clone());

    let mut project = match Project::load(&daemon.root, &inst.project) {
        Ok(p) => p,
        Err(e) => {
            let _ = respond(&mut writer, &Response::error(e.to_string())).await;
            return;
        }
    };
    if let Err(e) = project.load_overlay() {
        warn!(project = %inst.project, error = %e, "could not read grove.yaml");
    }
    if project.config.check.is_empty() {
        let _ = respond(
            &mut writer,
            &Response::error("no check commands defined in grove.yaml"),
        )
        .await;
        return;
    }

    if respond(&mut writer, &Response::ok()).await.is_err() {
        return;
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&inst.log_path)
        .ok();
    let out = Arc::new(ResilientWriter::new(Some(writer), log_file));

    // All check commands run concurrently, next to the live agent.
    let mut tasks = JoinSet::new();
    for cmd in project.config.check.clone() {
        let daemon = daemon.clone();
        let out = out.clone();
        let target = inst.container_id.clone();
        let instance_id = inst.id.clone();
        tasks.spawn(async move {
            out.line(&format!("$ {cmd}")).await;
            if let Err(e) = daemon.containers.exec_streamed(&target, &cmd, &out).await {
                out.line(&format!("error: check command failed: {e}")).await;
                warn!(instance = %instance_id, command = %cmd, error = %e, "check command failed");
            }
        });
    }
    while tasks.join_next().await.is_some() {}
}

// ─── RESTART ─────────────────────────────────────────────────────────────

pub(crate) async fn handle_restart(daemon: &Arc<Daemon>, mut writer: OwnedWriteHalf, req: Request) {
    let inst = match lookup(daemon, &req.instance_id) {
        Ok(inst) => inst,
        Err(resp) => {
            let _ = respond(&mut writer, &resp).await;
            return;
        }
    };

    let state = inst.record().state;
    if !state.is_terminal() {
        let _ = respond(
            &mut writer,
            &Response::error(format!("cannot restart: instance is {state}")),
        )
        .await;
        return;
    }

    let mut project = match Project::load(&daemon.root, &inst.project) {
        Ok(p) => p,
        Err(e) => {
            let _ = respond(&mut writer, &Response::error(e.to_string())).await;
            return;
        }
    };
    if let Err(e) = project.load_overlay() {
        warn!(project = %inst.project, error = %e, "could not read grove.yaml");
    }

    inst.reset_for_restart();

    let agent_cmd = project.agent_command().to_string();
    let agent_env = agent_environment(daemon, &req);
    log_agent_credentials(&inst.id, &agent_env);
    let argv = daemon.containers.agent_argv(
        &inst.container_id,
        project.container_workdir(),
        &agent_cmd,
        &project.config.agent.args,
        &agent_env,
    );

    if let Err(e) = inst.start_agent(&argv, &child_env(&agent_env)) {
        let _ = respond(&mut writer, &Response::error(e.to_string())).await;
        return;
    }
    inst.persist();
    info!(instance = %inst.id, "instance restarted");
    let _ = respond(&mut writer, &Response::ok()).await;
}
