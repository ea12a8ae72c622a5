//! Thin wrappers over the job-control syscalls: process groups, terminal
//! ownership, continue signals, termios snapshots, and the waitpid calls
//! the reaper is built on. All retry EINTR where that is the right thing.

use std::io;

pub fn set_process_group(pid: libc::pid_t, pgid: libc::pid_t) -> io::Result<()> {
    loop {
        let rc = unsafe { libc::setpgid(pid, pgid) };
        if rc == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EINTR => continue,
            // Already exec'd or gone; caller can proceed with best-effort behavior.
            Some(code) if code == libc::EACCES || code == libc::ESRCH => return Ok(()),
            _ => return Err(err),
        }
    }
}

pub fn send_continue_to_group(pgid: libc::pid_t) -> io::Result<()> {
    if pgid <= 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "invalid process group id",
        ));
    }

    loop {
        let rc = unsafe { libc::kill(-pgid, libc::SIGCONT) };
        if rc == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(err);
    }
}

/// One pass of the reaper's wait loop.
pub enum WaitResult {
    /// A child changed state.
    Reaped(libc::pid_t, libc::c_int),
    /// Nothing to report (no children, or WNOHANG with no change).
    None,
    /// A signal interrupted a blocking wait; the caller decides whether to
    /// abort or retry.
    Interrupted,
}

/// `waitpid(-1, …)` with stop and continue reporting. Blocking only when
/// `block` is set.
pub fn wait_any(block: bool) -> WaitResult {
    let mut flags = libc::WUNTRACED | libc::WCONTINUED;
    if !block {
        flags |= libc::WNOHANG;
    }

    loop {
        let mut raw_status: libc::c_int = 0;
        let waited = unsafe { libc::waitpid(-1, &mut raw_status, flags) };
        if waited > 0 {
            return WaitResult::Reaped(waited, raw_status);
        }
        if waited == 0 {
            return WaitResult::None;
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::ECHILD => return WaitResult::None,
            Some(code) if code == libc::EINTR => {
                // Only a pending interrupt aborts a blocking wait; any
                // other signal just retries.
                if block && crate::signals::interrupt_pending() {
                    return WaitResult::Interrupted;
                }
                continue;
            }
            _ => return WaitResult::None,
        }
    }
}

/// Hands the controlling terminal to a job's process group; gives it back
/// to the shell when dropped.
pub struct ForegroundTerminalGuard {
    tty_fd: Option<libc::c_int>,
    shell_pgid: libc::pid_t,
}

impl ForegroundTerminalGuard {
    pub fn new(target_pgid: libc::pid_t) -> io::Result<Self> {
        let tty_fd = if unsafe { libc::isatty(libc::STDIN_FILENO) } == 1 {
            Some(libc::STDIN_FILENO)
        } else {
            None
        };

        let shell_pgid = unsafe { libc::getpgrp() };
        let guard = Self { tty_fd, shell_pgid };

        if let Some(fd) = guard.tty_fd {
            set_terminal_foreground(fd, target_pgid)?;
        }

        Ok(guard)
    }
}

impl Drop for ForegroundTerminalGuard {
    fn drop(&mut self) {
        if let Some(fd) = self.tty_fd {
            let _ = set_terminal_foreground(fd, self.shell_pgid);
        }
    }
}

struct SignalIgnoreGuard {
    signal: libc::c_int,
    previous: libc::sighandler_t,
}

impl SignalIgnoreGuard {
    fn ignore(signal: libc::c_int) -> io::Result<Self> {
        let previous = unsafe { libc::signal(signal, libc::SIG_IGN) };
        if previous == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { signal, previous })
    }
}

impl Drop for SignalIgnoreGuard {
    fn drop(&mut self) {
        unsafe {
            libc::signal(self.signal, self.previous);
        }
    }
}

/// `tcsetpgrp` with SIGTTOU suppressed: a background shell issuing it would
/// otherwise be stopped by the tty driver.
pub fn set_terminal_foreground(fd: libc::c_int, pgid: libc::pid_t) -> io::Result<()> {
    if pgid <= 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "invalid process group id",
        ));
    }

    let _sigttou = SignalIgnoreGuard::ignore(libc::SIGTTOU)?;
    loop {
        let rc = unsafe { libc::tcsetpgrp(fd, pgid) };
        if rc == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(err);
    }
}

/// Snapshot the terminal modes on `fd`, if it is a tty.
pub fn save_termios(fd: libc::c_int) -> Option<libc::termios> {
    let mut modes: libc::termios = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::tcgetattr(fd, &mut modes) };
    if rc == 0 { Some(modes) } else { None }
}

/// Restore previously saved terminal modes.
pub fn restore_termios(fd: libc::c_int, modes: &libc::termios) {
    loop {
        let rc = unsafe { libc::tcsetattr(fd, libc::TCSADRAIN, modes) };
        if rc == 0 {
            return;
        }
        if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return;
        }
    }
}
