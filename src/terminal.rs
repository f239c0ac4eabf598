//! PTY-backed interactive shell lifecycle.
//!
//! Owns the fork/exec of an interactive `bash` under a pseudo-terminal, the
//! non-blocking master file descriptor, the prompt-ready sentinel pipe, and
//! the signal/teardown paths that operate on the shell's process group.
//!
//! # Sentinel pipe
//!
//! The spawned shell's `PROMPT_COMMAND` writes a fixed marker to a pipe
//! whose write end it inherits as `$READY_FD`. A readable sentinel pipe
//! means the shell has returned to its prompt; this is how the engine knows
//! a command finished without parsing the shell's own output.
//!
//! # Process group signaling
//!
//! The shell calls `setsid()` before exec, so its pid is also its process
//! group id. Reading the PTY's foreground process group (`TIOCGPGRP`) and
//! signaling that group distinguishes "signal the shell" from "signal the
//! command currently running under it" without the caller having to track
//! which one is active — the kernel already knows.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::openpty;
use nix::sys::select::{select, FdSet};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, error, trace, warn};

use crate::error::EngineError;

const READ_CHUNK: usize = 16384;
const CLOSE_GRACE: Duration = Duration::from_secs(2);
const CTRL_C_ECHO_WINDOW: Duration = Duration::from_millis(1500);

/// One cycle of PTY output as handed up by [`Terminal::read_blocking`].
///
/// `is_done=true` iff the sentinel fired during this read — the shell
/// returned to its prompt. `output` is `None` on a cycle where the master
/// FD had nothing to offer (EAGAIN), which is not an error.
#[derive(Debug, Clone, Default)]
pub struct TerminalOutput {
    pub is_done: bool,
    pub output: Option<Vec<u8>>,
    pub error: Option<String>,
    pub stop_mark_found: bool,
}

/// `Starting -> Running -> Closed`. There is no "command running" state —
/// that is a transient property of the foreground process group, not of
/// the Terminal itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TerminalState {
    Running,
    Closed,
}

/// A single PTY-backed shell. Exactly one reader (see [`crate::reader`])
/// consumes the master FD; writers (`send_bytes`/`send_text`/`send_signal`)
/// may be called concurrently from the event-loop side without coordinating
/// with the reader, since reads and writes on the same FD do not race.
pub struct Terminal {
    pid: Pid,
    master_raw_fd: RawFd,
    sentinel_raw_fd: RawFd,
    // `Option` so `close()` can `take()` and drop each `OwnedFd` exactly
    // once; relying on `Drop` to do the actual close (rather than an
    // explicit `libc::close`) means there is only ever one closer.
    master_fd: Mutex<Option<OwnedFd>>,
    sentinel_read_fd: Mutex<Option<OwnedFd>>,
    state: Mutex<TerminalState>,
    last_ctrl_c_at: Mutex<Option<Instant>>,
}

impl Terminal {
    /// Open a PTY pair and a sentinel pipe, fork, and exec an interactive
    /// `bash` in the child under the slave side. Returns once the parent
    /// side has been set up; the shell may still be initializing.
    pub fn start() -> Result<Self, EngineError> {
        let pty = openpty(None, None)
            .map_err(|e| EngineError::SpawnError(format!("openpty failed: {e}")))?;
        let (sentinel_read_fd, sentinel_write_fd) = nix::unistd::pipe()
            .map_err(|e| EngineError::SpawnError(format!("pipe failed: {e}")))?;

        let master_fd = pty.master;
        let slave_fd = pty.slave;
        let slave_raw = slave_fd.as_raw_fd();
        let master_raw = master_fd.as_raw_fd();
        let sentinel_read_raw = sentinel_read_fd.as_raw_fd();
        let sentinel_write_raw = sentinel_write_fd.as_raw_fd();

        let home = std::env::var("HOME").unwrap_or_default();
        let path = std::env::var("PATH").unwrap_or_default();
        let user = std::env::var("USER").unwrap_or_default();
        let logname = std::env::var("LOGNAME").unwrap_or_else(|_| user.clone());
        let parent_pid = std::process::id();

        let mut cmd = Command::new("/bin/bash");
        cmd.arg0(format!("bash action-terminal (parent={parent_pid})"));
        cmd.args(["--norc", "--noprofile", "-i"]);
        cmd.env_clear();
        cmd.env("TERM", "xterm-256color");
        cmd.env("LANG", "en_US.UTF-8");
        cmd.env("PATH", path);
        cmd.env("HOME", home);
        cmd.env("SHELL", "/bin/bash");
        cmd.env("PS1", "cmd> ");
        cmd.env("USER", user);
        cmd.env("LOGNAME", logname);
        cmd.env("READY_FD", sentinel_write_raw.to_string());
        cmd.env(
            "PROMPT_COMMAND",
            format!("printf \"READY\\n\" >&{sentinel_write_raw}"),
        );

        // SAFETY: dup() of a valid, open FD we own; the resulting FDs are
        // handed to Command, which owns and closes them after fork+dup2.
        unsafe {
            cmd.stdin(Stdio::from_raw_fd(checked_dup(slave_raw)?));
            cmd.stdout(Stdio::from_raw_fd(checked_dup(slave_raw)?));
            cmd.stderr(Stdio::from_raw_fd(checked_dup(slave_raw)?));
        }

        // SAFETY: pre_exec runs in the forked child before exec, on a
        // single-threaded copy of this process's memory. Only
        // async-signal-safe syscalls are used: setsid, ioctl, close, fcntl.
        unsafe {
            cmd.pre_exec(move || {
                if libc::setsid() < 0 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                let ws = libc::winsize {
                    ws_row: 24,
                    ws_col: 80,
                    ws_xpixel: 0,
                    ws_ypixel: 0,
                };
                libc::ioctl(0, libc::TIOCSWINSZ as _, &ws);

                // Close the parent-side copies; the child's stdio is the
                // dup()'d slave set above.
                libc::close(master_raw);
                libc::close(sentinel_read_raw);
                libc::close(slave_raw);

                // READY_FD must survive exec.
                let flags = libc::fcntl(sentinel_write_raw, libc::F_GETFD);
                if flags >= 0 {
                    libc::fcntl(sentinel_write_raw, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
                }
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| EngineError::SpawnError(format!("exec /bin/bash failed: {e}")))?;
        let pid = Pid::from_raw(child.id() as i32);
        // We manage the lifecycle ourselves via waitpid in `close`; drop the
        // std::process::Child handle (and its dup'd stdio copies) now that
        // the child has its own.
        drop(child);

        // Parent no longer needs the slave side or the sentinel write end.
        drop(slave_fd);
        drop(sentinel_write_fd);

        set_nonblocking(master_fd.as_raw_fd())?;
        set_nonblocking(sentinel_read_fd.as_raw_fd())?;

        debug!(pid = pid.as_raw(), "terminal started");

        let master_raw_fd = master_fd.as_raw_fd();
        let sentinel_raw_fd = sentinel_read_fd.as_raw_fd();

        Ok(Terminal {
            pid,
            master_raw_fd,
            sentinel_raw_fd,
            master_fd: Mutex::new(Some(master_fd)),
            sentinel_read_fd: Mutex::new(Some(sentinel_read_fd)),
            state: Mutex::new(TerminalState::Running),
            last_ctrl_c_at: Mutex::new(None),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Cached at construction time; stays valid for reads/writes/ioctls
    /// for as long as the Terminal is `Running` (the FD itself is only
    /// ever closed once, in `close()`).
    fn master_raw(&self) -> RawFd {
        self.master_raw_fd
    }

    fn sentinel_raw(&self) -> RawFd {
        self.sentinel_raw_fd
    }

    /// Block (via `select`, retrying on `EINTR`) until the sentinel or the
    /// master FD has data, then drain whichever is ready. Called in a loop
    /// by the dedicated reader thread for this terminal.
    pub fn read_blocking(&self) -> TerminalOutput {
        let master = self.master_raw();
        let sentinel = self.sentinel_raw();
        let nfds = master.max(sentinel) + 1;

        loop {
            let mut read_fds = FdSet::new();
            read_fds.insert(master);
            read_fds.insert(sentinel);

            match select(Some(nfds), &mut read_fds, None, None, None) {
                Ok(_) => {
                    let is_done = if read_fds.contains(sentinel) {
                        match read_raw(sentinel, READ_CHUNK) {
                            Ok(_) => true,
                            Err(e) => {
                                warn!(error = %e, "sentinel read failed");
                                true
                            }
                        }
                    } else {
                        false
                    };

                    let output = if read_fds.contains(master) {
                        match read_raw(master, READ_CHUNK) {
                            Ok(bytes) => Some(bytes),
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
                            Err(e) => {
                                return TerminalOutput {
                                    is_done,
                                    output: None,
                                    error: Some(e.to_string()),
                                    stop_mark_found: false,
                                };
                            }
                        }
                    } else {
                        None
                    };

                    return TerminalOutput {
                        is_done,
                        output,
                        error: None,
                        stop_mark_found: false,
                    };
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    return TerminalOutput {
                        is_done: false,
                        output: None,
                        error: Some(e.to_string()),
                        stop_mark_found: false,
                    };
                }
            }
        }
    }

    /// Write every byte to the master FD, looping on short writes and on
    /// `EAGAIN`/`EWOULDBLOCK` (the master is non-blocking; a full PTY input
    /// buffer must stall the write, not truncate it).
    pub fn send_bytes(&self, data: &[u8]) -> Result<(), EngineError> {
        let fd = self.master_raw();
        let mut written = 0usize;
        while written < data.len() {
            // SAFETY: fd is valid and open for the lifetime of self.
            let n = unsafe {
                libc::write(
                    fd,
                    data[written..].as_ptr() as *const libc::c_void,
                    data.len() - written,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    wait_for_writable(fd)?;
                    continue;
                }
                return Err(EngineError::TransportError(format!(
                    "write to terminal failed: {err}"
                )));
            }
            written += n as usize;
        }
        if data.contains(&0x03) {
            *self.last_ctrl_c_at.lock().unwrap() = Some(Instant::now());
        }
        Ok(())
    }

    pub fn send_text(&self, text: &str) -> Result<(), EngineError> {
        self.send_bytes(text.as_bytes())
    }

    /// `true` if ctrl-C was sent within the echo-fix window. The execution
    /// aggregator uses this to prefix `^C\n` when the shell hasn't already
    /// echoed it.
    pub fn ctrl_c_recently_sent(&self) -> bool {
        self.last_ctrl_c_at
            .lock()
            .unwrap()
            .map(|t| t.elapsed() < CTRL_C_ECHO_WINDOW)
            .unwrap_or(false)
    }

    /// Read the PTY's foreground process group (`TIOCGPGRP`) and signal it.
    /// This lands on the shell when it's idle and on a running command's
    /// own group otherwise — whichever the kernel currently reports.
    pub fn send_signal(&self, signal: Signal) -> Result<(), EngineError> {
        let fgpgrp = self.foreground_pgrp()?;
        // killpg(pgid, sig) == kill(-pgid, sig).
        kill(Pid::from_raw(-fgpgrp), signal)
            .map_err(|e| EngineError::TransportError(format!("signal delivery failed: {e}")))
    }

    fn foreground_pgrp(&self) -> Result<i32, EngineError> {
        let mut pgrp: libc::pid_t = 0;
        // SAFETY: master_fd is a valid, open FD for the lifetime of self;
        // TIOCGPGRP writes a pid_t into the buffer we provide.
        let res = unsafe { libc::ioctl(self.master_raw(), libc::TIOCGPGRP, &mut pgrp) };
        if res < 0 {
            return Err(EngineError::TransportError(format!(
                "TIOCGPGRP failed: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(pgrp)
    }

    /// Close FDs, SIGTERM the process group, wait up to ~2s, SIGKILL, reap.
    /// Idempotent: a second call observes `Closed` and returns immediately.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == TerminalState::Closed {
            return;
        }
        *state = TerminalState::Closed;
        drop(state);

        debug!(pid = self.pid.as_raw(), "closing terminal");

        // Taking each `Option` drops the `OwnedFd` right here, closing it
        // exactly once; matches the reference implementation's
        // close_fd_and_suppress_errors without a second manual close.
        self.master_fd.lock().unwrap().take();
        self.sentinel_read_fd.lock().unwrap().take();

        match kill(Pid::from_raw(-self.pid.as_raw()), Signal::SIGTERM) {
            Ok(()) => {}
            Err(nix::errno::Errno::ESRCH) => {
                debug!(pid = self.pid.as_raw(), "already dead on SIGTERM");
                return;
            }
            Err(e) => warn!(pid = self.pid.as_raw(), error = %e, "SIGTERM delivery failed"),
        }

        let deadline = Instant::now() + CLOSE_GRACE;
        while Instant::now() < deadline {
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Ok(_) => {
                    debug!(pid = self.pid.as_raw(), "reaped during graceful shutdown");
                    return;
                }
                Err(nix::errno::Errno::ECHILD) => return,
                Err(e) => {
                    error!(pid = self.pid.as_raw(), error = %e, "waitpid error");
                    return;
                }
            }
        }

        if let Err(e) = kill(Pid::from_raw(-self.pid.as_raw()), Signal::SIGKILL) {
            if e != nix::errno::Errno::ESRCH {
                warn!(pid = self.pid.as_raw(), error = %e, "SIGKILL delivery failed");
            }
        }

        loop {
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => std::thread::sleep(Duration::from_millis(10)),
                Ok(_) | Err(_) => break,
            }
        }
    }
}

impl Drop for Terminal {
    fn drop(&mut self) {
        self.close();
    }
}

/// Parse a signal name (`"SIGINT"`, `"INT"`, case-insensitive) into a
/// [`Signal`]. Used by the execution engine's per-pid `signal` action.
pub fn parse_signal(name: &str) -> Result<Signal, EngineError> {
    let upper = name.trim().to_ascii_uppercase();
    let normalized = upper.strip_prefix("SIG").unwrap_or(&upper);
    match normalized {
        "INT" => Ok(Signal::SIGINT),
        "TERM" => Ok(Signal::SIGTERM),
        "KILL" => Ok(Signal::SIGKILL),
        "HUP" => Ok(Signal::SIGHUP),
        "QUIT" => Ok(Signal::SIGQUIT),
        "STOP" => Ok(Signal::SIGSTOP),
        "CONT" => Ok(Signal::SIGCONT),
        "USR1" => Ok(Signal::SIGUSR1),
        "USR2" => Ok(Signal::SIGUSR2),
        "WINCH" => Ok(Signal::SIGWINCH),
        _ => Err(EngineError::TransportError(format!(
            "unrecognized signal name: {name}"
        ))),
    }
}

fn checked_dup(fd: RawFd) -> Result<RawFd, EngineError> {
    // SAFETY: fd is a valid, open FD owned by this process.
    let dup = unsafe { libc::dup(fd) };
    if dup < 0 {
        return Err(EngineError::SpawnError(format!(
            "dup failed: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(dup)
}

fn set_nonblocking(fd: RawFd) -> Result<(), EngineError> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)
        .map_err(|e| EngineError::SpawnError(format!("fcntl F_GETFL failed: {e}")))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))
        .map_err(|e| EngineError::SpawnError(format!("fcntl F_SETFL failed: {e}")))?;
    Ok(())
}

/// Block (retrying on `EINTR`) until `fd` is writable. Used by
/// [`Terminal::send_bytes`] between retries after `EAGAIN`.
fn wait_for_writable(fd: RawFd) -> Result<(), EngineError> {
    loop {
        let mut write_fds = FdSet::new();
        write_fds.insert(fd);
        match select(Some(fd + 1), None, &mut write_fds, None, None) {
            Ok(_) => return Ok(()),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                return Err(EngineError::TransportError(format!(
                    "select for write-readiness failed: {e}"
                )))
            }
        }
    }
}

fn read_raw(fd: RawFd, max: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; max];
    // SAFETY: fd is valid and open; buf is sized for the read.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, max) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    buf.truncate(n as usize);
    trace!(fd, bytes = n, "read from terminal fd");
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[test]
    fn spawn_and_read_until_prompt() {
        let term = Terminal::start().expect("terminal should spawn");
        let mut saw_prompt = false;
        for _ in 0..50 {
            let out = term.read_blocking();
            if let Some(bytes) = out.output {
                let text = String::from_utf8_lossy(&bytes);
                if text.contains("cmd> ") {
                    saw_prompt = true;
                    break;
                }
            }
            if out.is_done {
                saw_prompt = true;
                break;
            }
        }
        assert!(saw_prompt, "expected initial prompt within startup window");
    }

    #[test]
    fn echo_command_round_trips() {
        let term = Terminal::start().expect("terminal should spawn");
        // Drain the initial prompt.
        let _ = term.read_blocking();
        term.send_text("echo hi\n").expect("send should succeed");

        let mut combined = Vec::new();
        for _ in 0..100 {
            let out = term.read_blocking();
            if let Some(bytes) = out.output {
                combined.extend_from_slice(&bytes);
            }
            if out.is_done {
                break;
            }
        }
        let text = String::from_utf8_lossy(&combined);
        assert!(text.contains("hi"), "expected echoed output, got {text:?}");
    }

    #[test]
    fn close_is_idempotent() {
        let term = Terminal::start().expect("terminal should spawn");
        term.close();
        term.close();
    }

    #[test]
    fn ctrl_c_window_expires_is_initially_false() {
        let term = Terminal::start().expect("terminal should spawn");
        assert!(!term.ctrl_c_recently_sent());
        term.send_bytes(&[0x03]).expect("send should succeed");
        assert!(term.ctrl_c_recently_sent());
        std::thread::sleep(StdDuration::from_millis(50));
        assert!(term.ctrl_c_recently_sent());
        term.close();
    }
}
