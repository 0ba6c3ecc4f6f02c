// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Spawns the real compiler as a child process and, depending on
//! [`ChildMode`], feeds it a stdin buffer and/or captures its stdout.
//!
//! Two pipes are always involved: a "log" pipe used purely for
//! execve-failure detection (its write end is `O_CLOEXEC`, so it closes by
//! itself the moment `execve` succeeds, and the parent sees EOF with no
//! bytes), and, depending on the mode, a stdin and/or stdout data pipe.
//! The log pipe is always drained to EOF before the data pipes are touched
//! — if the child failed to exec, there is no point starting a poll loop
//! over pipes nobody will ever write to.
//!
//! Feeding and draining the child simultaneously needs `poll(2)`: a child
//! that both reads a large stdin buffer and writes a large stdout stream
//! will deadlock a parent that writes all of stdin before reading any of
//! stdout (the child's stdout pipe fills up while blocked on a full write
//! to its own stdout, and the parent is still blocked writing stdin).

use std::ffi::CString;
use std::os::unix::io::RawFd;

use libc::{c_short, nfds_t, pollfd, POLLHUP, POLLIN, POLLOUT};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

const LOG_BUF_LIMIT: usize = 4096;
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildMode {
    /// Neither feed stdin nor capture stdout; both are inherited as-is.
    None,
    /// Feed `stdin_buf` to the child; stdout is inherited.
    ToChild,
    /// Capture the child's stdout; stdin is inherited.
    FromChild,
    /// Feed `stdin_buf` and capture stdout at the same time.
    Both,
}

impl ChildMode {
    fn wants_stdin(self) -> bool {
        matches!(self, ChildMode::ToChild | ChildMode::Both)
    }

    fn wants_stdout(self) -> bool {
        matches!(self, ChildMode::FromChild | ChildMode::Both)
    }
}

pub struct ChildCtx {
    pub argv: Vec<String>,
    pub mode: ChildMode,
    pub stdin_buf: Option<Vec<u8>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChildRunError {
    #[error("argument {0:?} contains an embedded NUL byte")]
    NulInArgument(String),
    #[error("failed to create a pipe: {0}")]
    Pipe(#[source] nix::Error),
    #[error("fork failed: {0}")]
    Fork(#[source] nix::Error),
    #[error("{program} failed to start: {message}")]
    ExecFailed { program: String, message: String },
    #[error("I/O error communicating with child: {0}")]
    Io(#[source] std::io::Error),
    #[error("poll(2) failed with errno {0}")]
    Poll(i32),
    #[error("poll(2) reported an unexpected revents value: {0}")]
    UnexpectedPollResult(c_short),
    #[error("waitpid failed: {0}")]
    Wait(#[source] nix::Error),
    #[error("child exited with status {0}")]
    NonZeroExit(i32),
    #[error("child was killed by signal {0}")]
    Signaled(i32),
    #[error("waitpid returned an unexpected status: {0:?}")]
    UnexpectedWaitStatus(WaitStatus),
}

static SIGPIPE_IGNORED: std::sync::Once = std::sync::Once::new();

fn ignore_sigpipe() {
    SIGPIPE_IGNORED.call_once(|| {
        let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        // Safety: installing a simple ignore-disposition handler has no
        // preconditions beyond the ones `nix` already encodes in the type.
        unsafe {
            let _ = signal::sigaction(signal::SIGPIPE, &action);
        }
    });
}

fn cstring_argv(argv: &[String]) -> Result<Vec<CString>, ChildRunError> {
    argv.iter()
        .map(|s| CString::new(s.as_bytes()).map_err(|_| ChildRunError::NulInArgument(s.clone())))
        .collect()
}

fn pipe() -> Result<(RawFd, RawFd), ChildRunError> {
    let mut fds = [0i32; 2];
    // Safety: `fds` is a valid pointer to two `c_int`s.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(ChildRunError::Pipe(nix::Error::last()));
    }
    Ok((fds[0], fds[1]))
}

fn set_cloexec(fd: RawFd) {
    // Safety: `fd` is a valid, open file descriptor owned by this process.
    unsafe {
        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
    }
}

/// Marks the parent-side end of a data pipe `O_NONBLOCK` so a `write` after
/// `POLLOUT` (or a `read` after `POLLIN`) can never block past what the
/// kernel buffer actually holds — without this, `pump`'s poll loop can still
/// deadlock against a child that is itself blocked writing its own stdout.
fn set_nonblocking(fd: RawFd) {
    // Safety: `fd` is a valid, open file descriptor owned by this process.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

fn close_fd(fd: RawFd) {
    if fd >= 0 {
        let _ = nix::unistd::close(fd);
    }
}

/// Runs in the child after `fork`, before `execve`. Never returns.
fn run_child(
    argv: &[CString],
    stdin_read: RawFd,
    stdout_write: RawFd,
    log_write: RawFd,
    wants_stdin: bool,
    wants_stdout: bool,
) -> ! {
    if wants_stdin {
        // Safety: `stdin_read` is the read end of a pipe this process owns.
        unsafe { libc::dup2(stdin_read, libc::STDIN_FILENO) };
    }
    if wants_stdout {
        // Safety: `stdout_write` is the write end of a pipe this process owns.
        unsafe { libc::dup2(stdout_write, libc::STDOUT_FILENO) };
    }
    close_fd(stdin_read);
    close_fd(stdout_write);

    let mut arg_ptrs: Vec<*const libc::c_char> = argv.iter().map(|s| s.as_ptr()).collect();
    arg_ptrs.push(std::ptr::null());

    // Safety: `argv[0]` and `arg_ptrs` are both live for the duration of the
    // call; `environ` is the process's real environment block.
    unsafe {
        libc::execve(argv[0].as_ptr(), arg_ptrs.as_ptr(), libc::environ as *const *const libc::c_char);
    }

    let errno = nix::Error::last();
    let message = format!("execve failed: {errno}");
    let bytes = message.as_bytes();
    // Best effort: if even this write fails there is nothing left to do but
    // exit with a distinguishable, nonzero status.
    unsafe {
        libc::write(log_write, bytes.as_ptr() as *const libc::c_void, bytes.len());
        libc::_exit(127);
    }
}

/// Drains `fd` to EOF, appending into a fresh `Vec<u8>`, up to `limit`
/// bytes. Used only for the log pipe, which never carries more than a
/// short diagnostic message.
fn drain_to_eof(fd: RawFd, limit: usize) -> Result<Vec<u8>, ChildRunError> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        let n = unsafe { libc::read(fd, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len()) };
        if n < 0 {
            let errno = nix::Error::last();
            if errno == nix::Error::EINTR {
                continue;
            }
            return Err(ChildRunError::Io(std::io::Error::from(errno)));
        }
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&chunk[..n as usize]);
        if out.len() >= limit {
            return Ok(out);
        }
    }
}

/// Runs the bidirectional stdin-write/stdout-read loop with `poll(2)`,
/// writing `stdin_buf` (closing the write end once exhausted) while
/// draining whatever the child produces on `stdout_read`.
fn pump(
    stdin_write: RawFd,
    stdout_read: RawFd,
    mut stdin_buf: &[u8],
) -> Result<Vec<u8>, ChildRunError> {
    let mut out = Vec::new();
    let mut stdin_write = stdin_write;
    let mut stdout_read = stdout_read;
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        if stdin_write < 0 && stdout_read < 0 {
            return Ok(out);
        }

        let mut fds = Vec::with_capacity(2);
        if stdin_write >= 0 {
            fds.push(pollfd {
                fd: stdin_write,
                events: POLLOUT,
                revents: 0,
            });
        }
        if stdout_read >= 0 {
            fds.push(pollfd {
                fd: stdout_read,
                events: POLLIN,
                revents: 0,
            });
        }

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as nfds_t, -1) };
        if rc < 0 {
            let errno = nix::Error::last();
            if errno == nix::Error::EINTR || errno == nix::Error::EAGAIN {
                continue;
            }
            return Err(ChildRunError::Poll(errno as i32));
        }

        for pfd in &fds {
            if pfd.fd == stdin_write && pfd.revents != 0 {
                if pfd.revents & (POLLOUT | libc::POLLERR) == 0 {
                    return Err(ChildRunError::UnexpectedPollResult(pfd.revents));
                }
                if stdin_buf.is_empty() {
                    close_fd(stdin_write);
                    stdin_write = -1;
                    continue;
                }
                let n = unsafe {
                    libc::write(
                        stdin_write,
                        stdin_buf.as_ptr() as *const libc::c_void,
                        stdin_buf.len(),
                    )
                };
                if n < 0 {
                    let errno = nix::Error::last();
                    if errno == nix::Error::EINTR || errno == nix::Error::EAGAIN {
                        continue;
                    }
                    if errno == nix::Error::EPIPE {
                        // The child closed its stdin (e.g. it doesn't read
                        // all of it); stop feeding but keep draining stdout.
                        close_fd(stdin_write);
                        stdin_write = -1;
                        continue;
                    }
                    return Err(ChildRunError::Io(std::io::Error::from(errno)));
                }
                stdin_buf = &stdin_buf[n as usize..];
                if stdin_buf.is_empty() {
                    close_fd(stdin_write);
                    stdin_write = -1;
                }
            }
            if pfd.fd == stdout_read && pfd.revents != 0 {
                if pfd.revents & (POLLIN | POLLHUP) == 0 {
                    return Err(ChildRunError::UnexpectedPollResult(pfd.revents));
                }
                if pfd.revents & POLLIN != 0 {
                    let n = unsafe {
                        libc::read(stdout_read, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len())
                    };
                    if n < 0 {
                        let errno = nix::Error::last();
                        if errno == nix::Error::EINTR || errno == nix::Error::EAGAIN {
                            continue;
                        }
                        return Err(ChildRunError::Io(std::io::Error::from(errno)));
                    }
                    if n == 0 {
                        close_fd(stdout_read);
                        stdout_read = -1;
                    } else {
                        out.extend_from_slice(&chunk[..n as usize]);
                    }
                } else {
                    close_fd(stdout_read);
                    stdout_read = -1;
                }
            }
        }
    }
}

/// Forks, execs `ctx.argv[0]` with the remaining elements as arguments,
/// pumps stdin/stdout per `ctx.mode`, and reaps the child. Returns the
/// captured stdout bytes when `mode` wants them, `None` otherwise.
pub fn run(ctx: &ChildCtx) -> Result<Option<Vec<u8>>, ChildRunError> {
    ignore_sigpipe();

    let argv = cstring_argv(&ctx.argv)?;
    let program = ctx.argv.first().cloned().unwrap_or_default();

    let (log_read, log_write) = pipe()?;
    set_cloexec(log_write);

    let (stdin_read, stdin_write) = if ctx.mode.wants_stdin() {
        let (r, w) = pipe()?;
        set_nonblocking(w);
        (r, w)
    } else {
        (-1, -1)
    };
    let (stdout_read, stdout_write) = if ctx.mode.wants_stdout() {
        let (r, w) = pipe()?;
        set_nonblocking(r);
        (r, w)
    } else {
        (-1, -1)
    };

    // Safety: `fork` duplicates the process; the child branch below only
    // calls async-signal-safe functions before `execve`/`_exit`.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        close_fd(log_read);
        close_fd(log_write);
        close_fd(stdin_read);
        close_fd(stdin_write);
        close_fd(stdout_read);
        close_fd(stdout_write);
        return Err(ChildRunError::Fork(nix::Error::last()));
    }

    if pid == 0 {
        close_fd(log_read);
        close_fd(stdin_write);
        close_fd(stdout_read);
        run_child(
            &argv,
            stdin_read,
            stdout_write,
            log_write,
            ctx.mode.wants_stdin(),
            ctx.mode.wants_stdout(),
        );
    }

    let pid = Pid::from_raw(pid);
    close_fd(log_write);
    close_fd(stdin_read);
    close_fd(stdout_write);

    let log_message = drain_to_eof(log_read, LOG_BUF_LIMIT)?;
    close_fd(log_read);

    if !log_message.is_empty() {
        let _ = waitpid(pid, None);
        close_fd(stdin_write);
        close_fd(stdout_read);
        return Err(ChildRunError::ExecFailed {
            program,
            message: String::from_utf8_lossy(&log_message).into_owned(),
        });
    }

    let empty = Vec::new();
    let stdin_buf = ctx.stdin_buf.as_ref().unwrap_or(&empty);
    let captured = pump(stdin_write, stdout_read, stdin_buf)?;

    let status = waitpid(pid, None).map_err(ChildRunError::Wait)?;
    match status {
        WaitStatus::Exited(_, 0) => Ok(ctx.mode.wants_stdout().then_some(captured)),
        WaitStatus::Exited(_, code) => Err(ChildRunError::NonZeroExit(code)),
        WaitStatus::Signaled(_, sig, _) => Err(ChildRunError::Signaled(sig as i32)),
        other => Err(ChildRunError::UnexpectedWaitStatus(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_a_trivial_command_with_no_io() {
        let ctx = ChildCtx {
            argv: vec!["/bin/true".to_string()],
            mode: ChildMode::None,
            stdin_buf: None,
        };
        let out = run(&ctx).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn nonzero_exit_is_reported() {
        let ctx = ChildCtx {
            argv: vec!["/bin/false".to_string()],
            mode: ChildMode::None,
            stdin_buf: None,
        };
        let err = run(&ctx).unwrap_err();
        assert!(matches!(err, ChildRunError::NonZeroExit(1)));
    }

    #[test]
    fn missing_binary_reports_exec_failure() {
        let ctx = ChildCtx {
            argv: vec!["/no/such/binary-cc-wrapper-test".to_string()],
            mode: ChildMode::None,
            stdin_buf: None,
        };
        let err = run(&ctx).unwrap_err();
        assert!(matches!(err, ChildRunError::ExecFailed { .. }));
    }

    #[test]
    fn captures_stdout_from_child() {
        let ctx = ChildCtx {
            argv: vec!["/bin/echo".to_string(), "-n".to_string(), "hello".to_string()],
            mode: ChildMode::FromChild,
            stdin_buf: None,
        };
        let out = run(&ctx).unwrap().unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn feeds_a_large_buffer_to_cat_and_captures_it_back() {
        let payload = vec![b'x'; 1024 * 1024];
        let ctx = ChildCtx {
            argv: vec!["/bin/cat".to_string(), "-".to_string()],
            mode: ChildMode::Both,
            stdin_buf: Some(payload.clone()),
        };
        let out = run(&ctx).unwrap().unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn zero_input_to_a_command_that_ignores_stdin() {
        let ctx = ChildCtx {
            argv: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "echo -n Hello".to_string(),
            ],
            mode: ChildMode::Both,
            stdin_buf: Some(Vec::new()),
        };
        let out = run(&ctx).unwrap().unwrap();
        assert_eq!(out, b"Hello");
    }
}
