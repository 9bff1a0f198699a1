//! Output fan-out helpers for setup and command streaming.

use std::io::Write;
use std::path::Path;

use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;

/// Captures setup output in memory while mirroring it to the instance log.
///
/// The memory buffer is streamed to the client after the start
/// acknowledgement; the log copy survives the connection.
pub struct SetupLog {
    buf: Vec<u8>,
    file: Option<std::fs::File>,
}

impl SetupLog {
    /// Open the instance log for appending; a log that cannot be opened
    /// degrades to memory-only capture.
    pub fn new(log_path: &Path) -> Self {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .ok();
        Self { buf: Vec::new(), file }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if let Some(f) = self.file.as_mut() {
            let _ = f.write_all(data);
        }
    }

    pub fn line(&mut self, text: &str) {
        self.append(text.as_bytes());
        self.append(b"\n");
    }

    /// Everything captured so far.
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }
}

/// Fans command output to the client connection (best-effort) and the
/// instance log (always).
///
/// Once a client write fails the connection is dropped silently and
/// subsequent writes go to the log only, so finish/check commands run to
/// completion even after the client disconnects.
pub struct ResilientWriter {
    inner: tokio::sync::Mutex<ResilientInner>,
}

struct ResilientInner {
    conn: Option<OwnedWriteHalf>,
    log: Option<std::fs::File>,
}

impl ResilientWriter {
    pub fn new(conn: Option<OwnedWriteHalf>, log: Option<std::fs::File>) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(ResilientInner { conn, log }),
        }
    }

    pub async fn write(&self, data: &[u8]) {
        let mut inner = self.inner.lock().await;
        if let Some(conn) = inner.conn.as_mut() {
            if conn.write_all(data).await.is_err() {
                inner.conn = None;
            }
        }
        if let Some(f) = inner.log.as_mut() {
            let _ = f.write_all(data);
        }
    }

    pub async fn line(&self, text: &str) {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(b'\n');
        self.write(&bytes).await;
    }
}
