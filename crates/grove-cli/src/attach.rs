//! Interactive attach: raw-mode terminal proxied over the attach framing.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::Mutex;

use grove_proto::{frames, Request, RequestType};

use crate::client;

/// The detach key: Ctrl-].
const DETACH_KEY: u8 = 0x1d;

/// Restores the terminal exactly once, whether the session ends normally or
/// the function unwinds.
struct RawModeGuard {
    restored: bool,
}

impl RawModeGuard {
    fn enable() -> Result<Self> {
        crossterm::terminal::enable_raw_mode().context("cannot set raw mode")?;
        Ok(Self { restored: false })
    }

    fn restore(&mut self) {
        if !self.restored {
            self.restored = true;
            let _ = crossterm::terminal::disable_raw_mode();
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

async fn send_frame(
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    frame_type: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    let mut writer = writer.lock().await;
    frames::write_frame(&mut *writer, frame_type, payload).await
}

async fn send_resize(writer: &Arc<Mutex<OwnedWriteHalf>>) {
    if let Ok((cols, rows)) = crossterm::terminal::size() {
        let _ = send_frame(writer, frames::FRAME_RESIZE, &frames::resize_payload(cols, rows)).await;
    }
}

/// Connect the terminal to the instance PTY and block until the user
/// detaches (Ctrl-]) or the agent exits.
pub async fn attach(instance_id: &str) -> Result<()> {
    let stream = client::connect().await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    client::write_request(
        &mut write_half,
        &Request::for_instance(RequestType::Attach, instance_id),
    )
    .await?;
    let resp = client::read_response(&mut reader).await?;
    if !resp.ok {
        bail!("{}", resp.error);
    }

    let mut raw = RawModeGuard::enable()?;
    print!("\r\n[grove] attached to {instance_id}  (detach: Ctrl-])\r\n");

    let writer = Arc::new(Mutex::new(write_half));
    let (done_tx, mut done_rx) = tokio::sync::mpsc::channel::<()>(1);

    // Server → terminal: DATA frames onto stdout.
    let output_task = {
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            loop {
                match frames::read_frame(&mut reader).await {
                    Ok((frames::FRAME_DATA, payload)) => {
                        use tokio::io::AsyncWriteExt;
                        if stdout.write_all(&payload).await.is_err() {
                            break;
                        }
                        let _ = stdout.flush().await;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            let _ = done_tx.try_send(());
        })
    };

    // Terminal → server: raw stdin bytes as DATA frames, watching for the
    // detach key.
    let input_task = {
        let writer = writer.clone();
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let mut buf = [0u8; 256];
            loop {
                match stdin.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if buf[..n].contains(&DETACH_KEY) {
                            let _ = send_frame(&writer, frames::FRAME_DETACH, &[]).await;
                            break;
                        }
                        if send_frame(&writer, frames::FRAME_DATA, &buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = done_tx.try_send(());
        })
    };

    // Window-size changes, plus the initial size.
    let winch_task = {
        let writer = writer.clone();
        tokio::spawn(async move {
            let Ok(mut winch) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())
            else {
                return;
            };
            while winch.recv().await.is_some() {
                send_resize(&writer).await;
            }
        })
    };
    send_resize(&writer).await;

    let _ = done_rx.recv().await;
    output_task.abort();
    input_task.abort();
    winch_task.abort();

    // Restore before printing so the notice is not rendered in raw mode,
    // and reset modes the agent may have left on (focus reporting,
    // bracketed paste).
    raw.restore();
    print!("\x1b[?1004l\x1b[?2004l");
    println!("\n[grove] detached from {instance_id}");
    Ok(())
}
