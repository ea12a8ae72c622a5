//! Process-wide registry of pipe fds the shell itself created.
//!
//! Children must close every registered fd their own io chain does not
//! reference before exec, so stray write ends of unrelated pipelines cannot
//! hold EOF back from their readers.

use std::cell::RefCell;
use std::collections::HashSet;
use std::io;
use std::os::fd::IntoRawFd;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use log::debug;

#[derive(Default)]
pub struct PipeRegistry {
    fds: RefCell<HashSet<RawFd>>,
}

impl PipeRegistry {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn register(&self, fd: RawFd) {
        self.fds.borrow_mut().insert(fd);
    }

    pub fn deregister(&self, fd: RawFd) {
        self.fds.borrow_mut().remove(&fd);
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.fds.borrow().contains(&fd)
    }

    pub fn len(&self) -> usize {
        self.fds.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.borrow().is_empty()
    }

    /// Registered fds, in unspecified order.
    pub fn snapshot(&self) -> Vec<RawFd> {
        self.fds.borrow().iter().copied().collect()
    }
}

/// Close an fd through the registry so the two never disagree about what is
/// open.
pub fn close_tracked(registry: &PipeRegistry, fd: RawFd) {
    loop {
        if unsafe { libc::close(fd) } == 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        debug!("close of fd {fd} failed: {err}");
        break;
    }
    registry.deregister(fd);
}

/// Owning handle for one end of a shell-created pipe. Dropping it closes the
/// fd and removes it from the registry.
pub struct TrackedFd {
    fd: RawFd,
    registry: Rc<PipeRegistry>,
}

impl TrackedFd {
    pub fn raw(&self) -> RawFd {
        self.fd
    }

    /// Give up ownership without closing: the fd stays open and stays
    /// registered, and whoever took it is responsible for routing it
    /// through [`close_tracked`].
    pub fn release(self) -> RawFd {
        let this = std::mem::ManuallyDrop::new(self);
        let fd = this.fd;
        // Drop our registry handle; ManuallyDrop suppressed the close.
        unsafe {
            std::ptr::read(&this.registry);
        }
        fd
    }
}

impl Drop for TrackedFd {
    fn drop(&mut self) {
        close_tracked(&self.registry, self.fd);
    }
}

/// Allocate a pipe and register both ends. Returns `(read, write)`.
pub fn create_pipe(registry: &Rc<PipeRegistry>) -> io::Result<(TrackedFd, TrackedFd)> {
    let (reader, writer) = os_pipe::pipe()?;
    let read_fd = reader.into_raw_fd();
    let write_fd = writer.into_raw_fd();
    registry.register(read_fd);
    registry.register(write_fd);
    debug!("created pipe using fds {read_fd} and {write_fd}");
    Ok((
        TrackedFd {
            fd: read_fd,
            registry: Rc::clone(registry),
        },
        TrackedFd {
            fd: write_fd,
            registry: Rc::clone(registry),
        },
    ))
}
