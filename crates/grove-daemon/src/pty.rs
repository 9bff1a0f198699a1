//! Pseudo-terminal process management.
//!
//! Each instance's agent runs as a child whose controlling terminal is the
//! slave end of a PTY pair. The daemon keeps the master end for reading
//! agent output, injecting keystrokes, and propagating window-size changes.

use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::Mutex;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::pty::openpty;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

use grove_types::GroveError;

/// A child process running in a pseudo-terminal.
///
/// The master fd is non-blocking; readers drive it with [`poll_readable`]
/// (PtySession::poll_readable). The exit status is cached so liveness checks
/// and the final wait can both observe it.
pub struct PtySession {
    master: OwnedFd,
    child_pid: Pid,
    status: Mutex<Option<i32>>,
}

impl PtySession {
    /// Fork and exec `argv` (searching `PATH`) with `env` as the complete
    /// child environment, the slave PTY as its controlling terminal.
    pub fn spawn(argv: &[String], env: &[String]) -> Result<Self, GroveError> {
        if argv.is_empty() {
            return Err(GroveError::Pty("empty command".into()));
        }
        let pty = openpty(None, None)
            .map_err(|e| GroveError::Pty(format!("openpty failed: {e}")))?;

        // Safety: standard fork-for-PTY pattern; the child only calls
        // async-signal-safe functions before exec.
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Child) => {
                drop(pty.master);

                // New session; the slave becomes the controlling terminal.
                if unistd::setsid().is_err() {
                    unsafe { libc::_exit(127) };
                }
                unsafe {
                    if libc::ioctl(pty.slave.as_raw_fd(), libc::TIOCSCTTY as _, 0) < 0 {
                        libc::_exit(127);
                    }
                }

                for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
                    if unistd::dup2(pty.slave.as_raw_fd(), fd).is_err() {
                        unsafe { libc::_exit(127) };
                    }
                }
                drop(pty.slave);

                let Ok(c_argv) = argv
                    .iter()
                    .map(|a| CString::new(a.as_str()))
                    .collect::<Result<Vec<_>, _>>()
                else {
                    unsafe { libc::_exit(127) };
                };
                let Ok(c_env) = env
                    .iter()
                    .map(|e| CString::new(e.as_str()))
                    .collect::<Result<Vec<_>, _>>()
                else {
                    unsafe { libc::_exit(127) };
                };

                let _ = unistd::execvpe(&c_argv[0], &c_argv, &c_env);
                unsafe { libc::_exit(127) };
            }
            Ok(ForkResult::Parent { child }) => {
                drop(pty.slave);

                let flags = fcntl(pty.master.as_raw_fd(), FcntlArg::F_GETFL)
                    .map_err(|e| GroveError::Pty(format!("fcntl F_GETFL: {e}")))?;
                let flags = OFlag::from_bits_truncate(flags);
                fcntl(
                    pty.master.as_raw_fd(),
                    FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK),
                )
                .map_err(|e| GroveError::Pty(format!("fcntl F_SETFL: {e}")))?;

                Ok(Self {
                    master: pty.master,
                    child_pid: child,
                    status: Mutex::new(None),
                })
            }
            Err(e) => Err(GroveError::Pty(format!("fork failed: {e}"))),
        }
    }

    /// Non-blocking read from the master PTY.
    ///
    /// Returns `Ok(0)` when no data is available (EAGAIN) or the child has
    /// closed the slave (EIO).
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, GroveError> {
        match unistd::read(self.master.as_raw_fd(), buf) {
            Ok(n) => Ok(n),
            Err(Errno::EAGAIN) => Ok(0),
            Err(Errno::EIO) => Ok(0),
            Err(e) => Err(GroveError::Pty(format!("pty read: {e}"))),
        }
    }

    /// Write all bytes to the master PTY (the child's stdin).
    pub fn write_all(&self, data: &[u8]) -> Result<(), GroveError> {
        let mut written = 0;
        while written < data.len() {
            match unistd::write(&self.master, &data[written..]) {
                Ok(n) => written += n,
                Err(Errno::EAGAIN) => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => return Err(GroveError::Pty(format!("pty write: {e}"))),
            }
        }
        Ok(())
    }

    /// Propagate a window-size change to the slave terminal.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), GroveError> {
        let ws = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let rc = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ as _, &ws) };
        if rc < 0 {
            return Err(GroveError::Pty(format!(
                "TIOCSWINSZ: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Poll the master fd for readability with a timeout in milliseconds.
    pub fn poll_readable(&self, timeout_ms: i32) -> Result<bool, GroveError> {
        let borrowed = self.master.as_fd();
        let mut poll_fd = [PollFd::new(borrowed, PollFlags::POLLIN)];
        let timeout = if timeout_ms < 0 {
            PollTimeout::NONE
        } else {
            PollTimeout::try_from(timeout_ms as u32).unwrap_or(PollTimeout::MAX)
        };

        match nix::poll::poll(&mut poll_fd, timeout) {
            Ok(0) => Ok(false),
            Ok(_) => {
                let revents = poll_fd[0].revents().unwrap_or(PollFlags::empty());
                Ok(revents.contains(PollFlags::POLLIN) || revents.contains(PollFlags::POLLHUP))
            }
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(GroveError::Pty(format!("poll: {e}"))),
        }
    }

    /// Whether the child has not yet been observed to exit.
    pub fn is_alive(&self) -> bool {
        self.try_wait().is_none()
    }

    /// Reap the child if it has exited, caching the status.
    ///
    /// Negative values encode signal termination (`-signum`).
    pub fn try_wait(&self) -> Option<i32> {
        let mut cached = self.status.lock().unwrap();
        if cached.is_some() {
            return *cached;
        }
        match waitpid(self.child_pid, Some(nix::sys::wait::WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => None,
            Ok(WaitStatus::Exited(_, code)) => {
                *cached = Some(code);
                *cached
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                *cached = Some(-(sig as i32));
                *cached
            }
            Ok(_) => None,
            Err(Errno::ECHILD) => {
                *cached = Some(0);
                *cached
            }
            Err(_) => None,
        }
    }

    /// Block until the child exits and return its status.
    pub fn wait(&self) -> Result<i32, GroveError> {
        if let Some(code) = *self.status.lock().unwrap() {
            return Ok(code);
        }
        loop {
            match waitpid(self.child_pid, None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    *self.status.lock().unwrap() = Some(code);
                    return Ok(code);
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    let code = -(sig as i32);
                    *self.status.lock().unwrap() = Some(code);
                    return Ok(code);
                }
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    // Reaped by a concurrent try_wait; re-read the cache.
                    if let Some(code) = *self.status.lock().unwrap() {
                        return Ok(code);
                    }
                    *self.status.lock().unwrap() = Some(0);
                    return Ok(0);
                }
                Err(e) => return Err(GroveError::Pty(format!("waitpid: {e}"))),
            }
        }
    }

    /// Terminate the child's whole process group; a no-op once the group is
    /// gone.
    pub fn kill_group(&self) -> Result<(), GroveError> {
        match signal::killpg(self.child_pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(GroveError::Pty(format!("killpg: {e}"))),
        }
    }

    /// The child's process ID.
    pub fn pid(&self) -> u32 {
        self.child_pid.as_raw() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn host_env() -> Vec<String> {
        std::env::vars().map(|(k, v)| format!("{k}={v}")).collect()
    }

    fn drain(session: &PtySession) -> Vec<u8> {
        let mut buf = [0u8; 1024];
        let mut output = Vec::new();
        loop {
            match session.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => output.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        output
    }

    #[test]
    fn spawn_echo_and_read_output() {
        let session =
            PtySession::spawn(&argv(&["/bin/echo", "hello grove"]), &host_env()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));

        let text = String::from_utf8_lossy(&drain(&session)).to_string();
        assert!(text.contains("hello grove"), "unexpected output: {text:?}");
        assert_eq!(session.wait().unwrap(), 0);
    }

    #[test]
    fn write_reaches_child_stdin() {
        let session = PtySession::spawn(&argv(&["/bin/cat"]), &host_env()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));

        session.write_all(b"ping\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));
        let text = String::from_utf8_lossy(&drain(&session)).to_string();
        assert!(text.contains("ping"), "unexpected output: {text:?}");

        session.write_all(&[0x04]).unwrap(); // Ctrl-D
        assert_eq!(session.wait().unwrap(), 0);
    }

    #[test]
    fn nonzero_exit_status_reported() {
        let session =
            PtySession::spawn(&argv(&["/bin/sh", "-c", "exit 3"]), &host_env()).unwrap();
        assert_eq!(session.wait().unwrap(), 3);
        assert!(!session.is_alive());
    }

    #[test]
    fn exit_status_survives_is_alive_reap() {
        let session =
            PtySession::spawn(&argv(&["/bin/sh", "-c", "exit 5"]), &host_env()).unwrap();
        // Poll liveness until the child is gone; this reaps the status.
        for _ in 0..100 {
            if !session.is_alive() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(session.wait().unwrap(), 5);
    }

    #[test]
    fn kill_group_is_idempotent() {
        let session = PtySession::spawn(&argv(&["/bin/sleep", "30"]), &host_env()).unwrap();
        session.kill_group().unwrap();
        let code = session.wait().unwrap();
        assert_eq!(code, -(Signal::SIGKILL as i32));
        // Group is gone; a second kill must not error.
        session.kill_group().unwrap();
    }

    #[test]
    fn resize_succeeds_on_live_pty() {
        let session = PtySession::spawn(&argv(&["/bin/sleep", "1"]), &host_env()).unwrap();
        session.resize(120, 40).unwrap();
        session.kill_group().unwrap();
        session.wait().unwrap();
    }

    #[test]
    fn poll_readable_sees_output() {
        let session = PtySession::spawn(&argv(&["/bin/echo", "poll"]), &host_env()).unwrap();
        assert!(session.poll_readable(1000).unwrap());
        session.wait().unwrap();
    }
}
