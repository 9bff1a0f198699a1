//! Instance verbs: start, list, stop, restart, drop, finish, check, prune,
//! logs, dir, shell, watch, daemon status/logs.

use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::io::BufReader;

use grove_proto::{InstanceInfo, Request, RequestType};
use grove_types::{paths, InstanceState};

use crate::attach;
use crate::client;
use crate::credentials;
use crate::project;
use crate::ui::{state_color, BOLD, CYAN, DIM, GREEN, RESET, YELLOW};

pub async fn start(project_arg: &str, branch: &str, detach: bool) -> Result<()> {
    let project_name = project::resolve(project_arg)?;
    let agent_env = credentials::ensure_agent_credentials(&project_name);

    let stream = client::connect().await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut req = Request::new(RequestType::Start);
    req.project = project_name.clone();
    req.branch = branch.to_string();
    req.agent_env = agent_env;
    client::write_request(&mut write_half, &req).await?;

    // Spinner while the daemon clones, starts the container, and installs
    // the agent.
    let spinner = tokio::spawn(async {
        let frames = ['|', '/', '-', '\\'];
        let mut i = 0;
        loop {
            eprint!("\r  Starting instance {}  ", frames[i]);
            let _ = std::io::stderr().flush();
            i = (i + 1) % frames.len();
            tokio::time::sleep(Duration::from_millis(120)).await;
        }
    });
    let resp = client::read_response(&mut reader).await;
    spinner.abort();
    eprint!("\r  \x1b[K");

    let resp = resp?;
    if !resp.ok {
        if !resp.init_path.is_empty() {
            // Project exists but has no grove.yaml; tell the user how to
            // create one.
            eprintln!("{YELLOW}{BOLD}⚠  {project_name} has no grove.yaml{RESET}\n");
            eprintln!("Create one at the root of the repository:\n");
            eprintln!("  {CYAN}{}/grove.yaml{RESET}\n", resp.init_path);
            eprintln!("Minimal example:\n");
            eprintln!("  container:");
            eprintln!("    image: ubuntu:24.04");
            eprintln!("  agent:");
            eprintln!("    command: claude");
            bail!("no grove.yaml");
        }
        eprintln!("check daemon logs with: grove daemon logs -n 100");
        bail!("{}", resp.error);
    }

    // Stream any setup output (clone, pull, bootstrap) the daemon buffered.
    let mut stdout = tokio::io::stdout();
    let _ = tokio::io::copy(&mut reader, &mut stdout).await;

    println!("\n{GREEN}{BOLD}✓  Started instance{RESET} {CYAN}{}{RESET}\n", resp.instance_id);

    if !detach {
        attach::attach(&resp.instance_id).await?;
    }
    Ok(())
}

pub async fn list(active_only: bool) -> Result<()> {
    let resp = client::request(&Request::new(RequestType::List)).await?;
    let instances: Vec<InstanceInfo> = resp
        .instances
        .into_iter()
        .filter(|i| !(active_only && i.state == InstanceState::Finished))
        .collect();
    print_instances(&instances);
    Ok(())
}

fn print_instances(instances: &[InstanceInfo]) {
    if instances.is_empty() {
        println!("{DIM}no instances{RESET}");
        return;
    }
    println!("{BOLD}{:<10}  {:<12}  {:<10}  BRANCH{RESET}", "ID", "PROJECT", "STATE");
    println!(
        "{DIM}{:<10}  {:<12}  {:<10}  ------{RESET}",
        "----------", "------------", "----------"
    );
    for inst in instances {
        let color = state_color(inst.state);
        println!(
            "{:<10}  {:<12}  {color}{:<10}{RESET}  {}",
            inst.id,
            inst.project,
            inst.state.as_str(),
            inst.branch
        );
    }
}

pub async fn stop(instance_id: &str) -> Result<()> {
    client::request(&Request::for_instance(RequestType::Stop, instance_id)).await?;
    println!("\n{GREEN}{BOLD}✓  Stopped{RESET} {CYAN}{instance_id}{RESET}\n");
    Ok(())
}

pub async fn restart(instance_id: &str, detach: bool) -> Result<()> {
    let mut req = Request::for_instance(RequestType::Restart, instance_id);
    // Re-derive credentials for the respawn; a missing instance is left for
    // the daemon to report.
    if let Ok(inst) = client::find_instance(instance_id).await {
        req.agent_env = credentials::ensure_agent_credentials(&inst.project);
    }
    client::request(&req).await?;
    println!("\n{GREEN}{BOLD}✓  Restarted{RESET} {CYAN}{instance_id}{RESET}\n");
    if !detach {
        attach::attach(instance_id).await?;
    }
    Ok(())
}

pub async fn drop(instance_id: &str, force: bool) -> Result<()> {
    let inst = client::find_instance(instance_id).await?;

    if !force {
        println!("\n{BOLD}Instance{RESET} {CYAN}{instance_id}{RESET}\n");
        println!("  {DIM}Project:{RESET}  {CYAN}{}{RESET}", inst.project);
        println!("  {DIM}Worktree:{RESET} {CYAN}{}{RESET}", inst.worktree_dir);
        println!("  {DIM}Branch:{RESET}   {CYAN}{}{RESET}\n", inst.branch);
        if !project::confirm(&format!(
            "{BOLD}Delete instance {:?} and worktree?{RESET} [y/N] ",
            inst.project
        ))? {
            println!("{DIM}aborted{RESET}");
            return Ok(());
        }
    }

    client::request(&Request::for_instance(RequestType::Drop, instance_id)).await?;
    println!("\n{GREEN}{BOLD}✓  Dropped{RESET} {CYAN}{instance_id}{RESET}\n");
    Ok(())
}

pub async fn finish(instance_id: &str) -> Result<()> {
    client::stream_command(&Request::for_instance(RequestType::Finish, instance_id)).await
}

pub async fn check(instance_id: &str) -> Result<()> {
    client::stream_command(&Request::for_instance(RequestType::Check, instance_id)).await
}

pub async fn logs(instance_id: &str, follow: bool) -> Result<()> {
    let kind = if follow {
        RequestType::LogsFollow
    } else {
        RequestType::Logs
    };
    client::stream_command(&Request::for_instance(kind, instance_id)).await
}

pub async fn prune(include_finished: bool) -> Result<()> {
    let resp = client::request(&Request::new(RequestType::List)).await?;
    let dead: Vec<InstanceInfo> = resp
        .instances
        .into_iter()
        .filter(|i| match i.state {
            InstanceState::Exited | InstanceState::Crashed | InstanceState::Killed => true,
            InstanceState::Finished => include_finished,
            _ => false,
        })
        .collect();

    if dead.is_empty() {
        println!("{DIM}nothing to prune{RESET}");
        return Ok(());
    }

    println!(
        "\n{YELLOW}{BOLD}⚠  Prune{RESET} — the following instance(s) and their worktrees will be removed:\n"
    );
    for inst in &dead {
        println!("  {BOLD}{}{RESET}", inst.id);
        println!("    {DIM}Project:{RESET}   {CYAN}{}{RESET}", inst.project);
        println!("    {DIM}Worktree:{RESET}  {CYAN}{}{RESET}", inst.worktree_dir);
        println!("    {DIM}Branch:{RESET}    {CYAN}{}{RESET}", inst.branch);
        println!("    {DIM}State:{RESET}     {}\n", inst.state);
    }
    println!("  This will drop {} instance(s) and their worktrees.\n", dead.len());
    if !project::confirm(&format!("{BOLD}Continue?{RESET} [y/N] "))? {
        println!("{DIM}aborted{RESET}");
        return Ok(());
    }

    for inst in dead {
        client::request(&Request::for_instance(RequestType::Drop, &inst.id)).await?;
        println!("{GREEN}{BOLD}✓  Dropped{RESET} {CYAN}{}{RESET}", inst.id);
    }
    println!();
    Ok(())
}

pub async fn dir(instance_id: &str) -> Result<()> {
    let inst = client::find_instance(instance_id).await?;
    println!("{}", inst.worktree_dir);
    Ok(())
}

pub async fn shell(instance_id: &str, shell: Option<&str>) -> Result<()> {
    let inst = client::find_instance(instance_id).await?;
    if inst.container_id.is_empty() {
        bail!("instance not found: {instance_id}");
    }
    let shell = shell.unwrap_or("sh");

    let status = std::process::Command::new("docker")
        .args([
            "exec",
            "-it",
            "-u",
            "root",
            "-e",
            "HOME=/root",
            &inst.container_id,
            shell,
        ])
        .status()?;
    if !status.success() {
        std::process::exit(status.code().unwrap_or(1));
    }
    Ok(())
}

pub async fn watch() -> Result<()> {
    loop {
        let resp = client::request(&Request::new(RequestType::List)).await?;
        print!("\x1b[2J\x1b[H");
        println!("{BOLD}grove watch{RESET}  {DIM}(Ctrl-C to quit){RESET}\n");
        print_instances(&resp.instances);
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

pub async fn daemon_status() -> Result<()> {
    let root = client::root_dir();
    let socket = paths::socket_path(&root);
    if client::ping(&socket).await {
        println!("{GREEN}{BOLD}●{RESET} groved is running ({})", socket.display());
    } else {
        println!("{DIM}○ groved is not running{RESET}");
        client::warn_if_docker_unavailable();
    }
    Ok(())
}

pub async fn daemon_logs(lines: usize) -> Result<()> {
    let path = paths::daemon_log(&client::root_dir());
    let content = std::fs::read_to_string(&path)
        .map_err(|_| anyhow::anyhow!("no daemon log at {}", path.display()))?;
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    for line in &all[start..] {
        println!("{line}");
    }
    Ok(())
}
