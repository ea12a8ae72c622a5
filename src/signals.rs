//! Signal discipline for the shell process.
//!
//! Handlers do the minimum: set an atomic pending flag. The reaper and the
//! reader poll the flags at their next cooperative step. SIGCHLD is blocked
//! around every mutation of job state via [`SignalBlock`].

use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

static SIGCHLD_PENDING: AtomicBool = AtomicBool::new(false);
static INTERRUPT_PENDING: AtomicBool = AtomicBool::new(false);
static WINCH_PENDING: AtomicBool = AtomicBool::new(false);

/// Depth of the SIGCHLD block. The mask is installed on 0 -> 1 and removed
/// on 1 -> 0, so nested guards are cheap.
static BLOCK_DEPTH: AtomicUsize = AtomicUsize::new(0);

extern "C" fn handle_sigchld(_sig: libc::c_int) {
    SIGCHLD_PENDING.store(true, Ordering::SeqCst);
}

extern "C" fn handle_sigint(_sig: libc::c_int) {
    INTERRUPT_PENDING.store(true, Ordering::SeqCst);
}

extern "C" fn handle_sigwinch(_sig: libc::c_int) {
    WINCH_PENDING.store(true, Ordering::SeqCst);
}

/// Job-control signals an interactive shell must not react to itself.
const IGNORED_SIGNALS: &[libc::c_int] = &[
    libc::SIGTSTP,
    libc::SIGTTIN,
    libc::SIGTTOU,
    libc::SIGQUIT,
    libc::SIGPIPE,
];

fn set_handler(sig: libc::c_int, handler: libc::sighandler_t, restart: bool) -> io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handler;
        action.sa_flags = if restart { libc::SA_RESTART } else { 0 };
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Install the shell's handlers. SIGINT is installed without SA_RESTART so a
/// blocking `waitpid` returns EINTR and the foreground wait can be aborted.
pub fn install_handlers(interactive: bool) -> io::Result<()> {
    set_handler(libc::SIGCHLD, handle_sigchld as libc::sighandler_t, true)?;
    set_handler(libc::SIGINT, handle_sigint as libc::sighandler_t, false)?;
    set_handler(libc::SIGWINCH, handle_sigwinch as libc::sighandler_t, true)?;
    if interactive {
        for &sig in IGNORED_SIGNALS {
            set_handler(sig, libc::SIG_IGN, true)?;
        }
    }
    Ok(())
}

/// Restore every disposition the shell changed back to the default.
/// Called in children between fork and exec; SIG_IGN would survive the exec.
pub fn reset_handlers() {
    let all = [
        libc::SIGCHLD,
        libc::SIGINT,
        libc::SIGWINCH,
        libc::SIGTSTP,
        libc::SIGTTIN,
        libc::SIGTTOU,
        libc::SIGQUIT,
        libc::SIGPIPE,
    ];
    for sig in all {
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
        }
    }
}

fn chld_set() -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGCHLD);
        set
    }
}

fn mask_chld(how: libc::c_int) {
    let set = chld_set();
    unsafe {
        libc::sigprocmask(how, &set, std::ptr::null_mut());
    }
}

/// Scoped SIGCHLD block. The previous depth is restored on every exit path,
/// unwinding included.
pub struct SignalBlock(());

impl SignalBlock {
    pub fn new() -> Self {
        if BLOCK_DEPTH.fetch_add(1, Ordering::SeqCst) == 0 {
            mask_chld(libc::SIG_BLOCK);
        }
        SignalBlock(())
    }
}

impl Drop for SignalBlock {
    fn drop(&mut self) {
        if BLOCK_DEPTH.fetch_sub(1, Ordering::SeqCst) == 1 {
            mask_chld(libc::SIG_UNBLOCK);
        }
    }
}

/// Temporarily lift an enclosing [`SignalBlock`], e.g. while a builtin or a
/// nested evaluation runs. Re-establishes the mask on drop.
pub struct SignalLift(());

impl SignalLift {
    pub fn new() -> Self {
        if BLOCK_DEPTH.fetch_sub(1, Ordering::SeqCst) == 1 {
            mask_chld(libc::SIG_UNBLOCK);
        }
        SignalLift(())
    }
}

impl Drop for SignalLift {
    fn drop(&mut self) {
        if BLOCK_DEPTH.fetch_add(1, Ordering::SeqCst) == 0 {
            mask_chld(libc::SIG_BLOCK);
        }
    }
}

/// Clear the whole mask in a freshly forked child. The child inherited the
/// parent's block depth but owns a private copy of it now.
pub fn unblock_all_in_child() {
    BLOCK_DEPTH.store(0, Ordering::SeqCst);
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut());
    }
}

pub fn take_sigchld() -> bool {
    SIGCHLD_PENDING.swap(false, Ordering::SeqCst)
}

pub fn take_interrupt() -> bool {
    INTERRUPT_PENDING.swap(false, Ordering::SeqCst)
}

pub fn interrupt_pending() -> bool {
    INTERRUPT_PENDING.load(Ordering::SeqCst)
}

pub fn take_winch() -> bool {
    WINCH_PENDING.swap(false, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chld_blocked() -> bool {
        unsafe {
            let mut current: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut current);
            libc::sigprocmask(libc::SIG_BLOCK, std::ptr::null(), &mut current);
            libc::sigismember(&current, libc::SIGCHLD) == 1
        }
    }

    #[test]
    fn block_guard_nests_and_restores() {
        assert!(!chld_blocked());
        {
            let _outer = SignalBlock::new();
            assert!(chld_blocked());
            {
                let _inner = SignalBlock::new();
                assert!(chld_blocked());
            }
            assert!(chld_blocked());
            {
                let _lift = SignalLift::new();
                assert!(!chld_blocked());
            }
            assert!(chld_blocked());
        }
        assert!(!chld_blocked());
    }

    #[test]
    fn pending_flags_are_one_shot() {
        SIGCHLD_PENDING.store(true, Ordering::SeqCst);
        assert!(take_sigchld());
        assert!(!take_sigchld());
    }
}
