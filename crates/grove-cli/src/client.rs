//! Daemon connection plumbing: root resolution, auto-start, ping,
//! request/response.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use grove_proto::{Request, RequestType, Response};
use grove_types::paths;

/// The grove data root for this invocation.
pub fn root_dir() -> PathBuf {
    paths::data_root()
}

/// Connect to the daemon socket, starting the daemon if needed.
pub async fn connect() -> Result<UnixStream> {
    let root = root_dir();
    let socket = paths::socket_path(&root);
    ensure_daemon(&root, &socket).await?;
    UnixStream::connect(&socket)
        .await
        .with_context(|| format!("connect to daemon at {}", socket.display()))
}

/// Start `groved` in its own session when the socket is dead, then wait for
/// it to answer pings.
async fn ensure_daemon(root: &Path, socket: &Path) -> Result<()> {
    if ping(socket).await {
        return Ok(());
    }

    // Prefer the groved next to this binary; fall back to PATH.
    let mut daemon_bin = PathBuf::from("groved");
    if let Ok(exe) = std::env::current_exe() {
        let sibling = exe.with_file_name("groved");
        if sibling.exists() {
            daemon_bin = sibling;
        }
    }

    let mut cmd = std::process::Command::new(&daemon_bin);
    cmd.arg("--root")
        .arg(root)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    cmd.spawn()
        .with_context(|| format!("could not start daemon ({})", daemon_bin.display()))?;

    // Wait up to 3 seconds for it to become ready.
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if ping(socket).await {
            return Ok(());
        }
    }

    warn_if_docker_unavailable();
    bail!("daemon did not start in time (see {}/daemon.log)", root.display())
}

/// True when a live daemon answers a PING on this socket.
pub async fn ping(socket: &Path) -> bool {
    let attempt = async {
        let stream = UnixStream::connect(socket).await.ok()?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        write_request(&mut write_half, &Request::new(RequestType::Ping))
            .await
            .ok()?;
        read_response(&mut reader).await.ok()
    };
    match tokio::time::timeout(Duration::from_millis(500), attempt).await {
        Ok(Some(resp)) => resp.ok,
        _ => false,
    }
}

pub async fn write_request(writer: &mut OwnedWriteHalf, req: &Request) -> Result<()> {
    let mut data = serde_json::to_vec(req)?;
    data.push(b'\n');
    writer.write_all(&data).await?;
    Ok(())
}

pub async fn read_response(reader: &mut BufReader<OwnedReadHalf>) -> Result<Response> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        bail!("daemon closed the connection");
    }
    serde_json::from_str(line.trim()).map_err(|e| anyhow!("bad response: {e}"))
}

/// Send one request and return its response; the daemon is auto-started and
/// a `!ok` response becomes an error.
pub async fn request(req: &Request) -> Result<Response> {
    let stream = connect().await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    write_request(&mut write_half, req).await?;
    let resp = read_response(&mut reader).await?;
    if !resp.ok {
        bail!("{}", resp.error);
    }
    Ok(resp)
}

/// Like [`request`], but tolerates a daemon that is not running (no
/// auto-start).
pub async fn try_request(req: &Request) -> Result<Response> {
    let socket = paths::socket_path(&root_dir());
    let stream = UnixStream::connect(&socket).await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    write_request(&mut write_half, req).await?;
    let resp = read_response(&mut reader).await?;
    if !resp.ok {
        bail!("{}", resp.error);
    }
    Ok(resp)
}

/// Send a request and copy the daemon's byte stream to stdout until it
/// closes. Used by `finish`, `check`, and `logs`.
pub async fn stream_command(req: &Request) -> Result<()> {
    let stream = connect().await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    write_request(&mut write_half, req).await?;
    let resp = read_response(&mut reader).await?;
    if !resp.ok {
        bail!("{}", resp.error);
    }
    let mut stdout = tokio::io::stdout();
    tokio::io::copy(&mut reader, &mut stdout).await?;
    Ok(())
}

/// Look up one instance from a live LIST.
pub async fn find_instance(instance_id: &str) -> Result<grove_proto::InstanceInfo> {
    let resp = request(&Request::new(RequestType::List)).await?;
    resp.instances
        .into_iter()
        .find(|i| i.id == instance_id)
        .ok_or_else(|| anyhow!("instance not found: {instance_id}"))
}

/// Print a pointed warning when Docker itself is the problem.
pub fn warn_if_docker_unavailable() {
    let available = std::process::Command::new("docker")
        .arg("info")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if !available {
        eprintln!(
            "{}{}grove requires Docker.{} Docker does not appear to be running.",
            crate::ui::RED,
            crate::ui::BOLD,
            crate::ui::RESET
        );
        eprintln!("  Start Docker Desktop or install it: https://docs.docker.com/get-docker/");
    }
}
