//! Socket listener and per-connection dispatch.
//!
//! Each connection carries exactly one newline-delimited JSON request. The
//! handler writes one JSON response and either closes or keeps streaming
//! (attach, logs-follow, setup output, finish/check output).

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use grove_proto::{Request, RequestType, Response};
use grove_types::GroveError;

use crate::handlers;
use crate::Daemon;

/// Upper bound on a request line. Requests are small; anything bigger is a
/// broken or hostile client.
const MAX_REQUEST_LEN: u64 = 1024 * 1024;

/// Bind the socket (removing any stale file) and accept until shutdown.
///
/// Outstanding instances keep running across shutdown; their records are
/// reconciled as `CRASHED` on the next startup.
pub(crate) async fn serve(
    daemon: Arc<Daemon>,
    socket_path: &Path,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), GroveError> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(GroveError::Io(e));
        }
    }

    let listener = UnixListener::bind(socket_path).map_err(|e| {
        GroveError::Protocol(format!("listen on {}: {e}", socket_path.display()))
    })?;
    info!(path = %socket_path.display(), "groved listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let daemon = daemon.clone();
                        tokio::spawn(async move {
                            handle_connection(daemon, stream).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            _ = shutdown.wait_for(|&v| v) => {
                info!("shutdown requested");
                break;
            }
        }
    }

    let _ = std::fs::remove_file(socket_path);
    Ok(())
}

async fn handle_connection(daemon: Arc<Daemon>, stream: UnixStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    {
        let mut limited = (&mut reader).take(MAX_REQUEST_LEN);
        match limited.read_line(&mut line).await {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "request read failed");
                return;
            }
        }
    }

    let req: Request = match serde_json::from_str(line.trim()) {
        Ok(req) => req,
        Err(e) => {
            let _ = handlers::respond(
                &mut write_half,
                &Response::error(format!("bad request: {e}")),
            )
            .await;
            return;
        }
    };

    match req.kind {
        RequestType::Ping => {
            let _ = handlers::respond(&mut write_half, &Response::ok()).await;
        }
        RequestType::Start => handlers::handle_start(&daemon, write_half, req).await,
        RequestType::List => handlers::handle_list(&daemon, write_half).await,
        RequestType::Attach => handlers::handle_attach(&daemon, reader, write_half, req).await,
        RequestType::Logs => handlers::handle_logs(&daemon, write_half, req).await,
        RequestType::LogsFollow => handlers::handle_logs_follow(&daemon, write_half, req).await,
        RequestType::Stop => handlers::handle_stop(&daemon, write_half, req).await,
        RequestType::Restart => handlers::handle_restart(&daemon, write_half, req).await,
        RequestType::Drop => handlers::handle_drop(&daemon, write_half, req).await,
        RequestType::Finish => handlers::handle_finish(&daemon, write_half, req).await,
        RequestType::Check => handlers::handle_check(&daemon, write_half, req).await,
    }
}
