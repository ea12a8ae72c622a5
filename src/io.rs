//! IO redirection chains.
//!
//! A job carries an ordered chain of per-fd redirections. Order is
//! significant: a later entry targeting the same fd overrides an earlier
//! one, and the child-side installer applies entries strictly in order so
//! `3>&1 1>log` behaves as in POSIX shells.

use std::cell::RefCell;
use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use crate::pipes::{close_tracked, create_pipe, PipeRegistry};

/// Byte buffer shared between a `Buffer` redirection and its clones.
pub type SharedBuffer = Rc<RefCell<Vec<u8>>>;

#[derive(Debug, Clone)]
pub enum IoMode {
    /// Leave the fd closed.
    Close,
    /// Open a file at install time.
    File { path: String, flags: libc::c_int },
    /// Duplicate an existing fd.
    Fd { src: RawFd, close_src: bool },
    /// One leg of a pipeline. `ends[0]` is the read end, `ends[1]` the
    /// write end; an end not meant for this entry is -1.
    Pipe { ends: [RawFd; 2] },
    /// Like `Pipe`, but the parent drains the read end into a buffer after
    /// the job is constructed. The entry owns its buffer and read end; the
    /// write end is dup'd into the child.
    Buffer { ends: [RawFd; 2], buffer: SharedBuffer },
}

static NEXT_REDIRECT_ID: AtomicU64 = AtomicU64::new(1);

/// A single redirection. Cloning preserves the identity tag, so an entry
/// copied into a merged chain can still be removed by the handle the caller
/// kept — the pointer-equality analog of the original linked list.
#[derive(Debug, Clone)]
pub struct IoRedirect {
    pub fd: RawFd,
    pub mode: IoMode,
    id: u64,
}

impl IoRedirect {
    pub fn new(fd: RawFd, mode: IoMode) -> Self {
        IoRedirect {
            fd,
            mode,
            id: NEXT_REDIRECT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Ordered redirection chain.
#[derive(Debug, Default, Clone)]
pub struct IoChain {
    entries: Vec<IoRedirect>,
}

impl IoChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IoRedirect> {
        self.entries.iter()
    }

    /// Append at the tail.
    pub fn append(&mut self, entry: IoRedirect) {
        self.entries.push(entry);
    }

    /// Remove the first entry with the given identity. The detached entry is
    /// returned with its payload intact.
    pub fn remove(&mut self, id: u64) -> Option<IoRedirect> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos))
    }

    /// Replace the payload of the entry with the given identity.
    pub fn set_mode(&mut self, id: u64, mode: IoMode) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.mode = mode;
        }
    }

    /// Retarget the entry with the given identity at another fd.
    pub fn set_fd(&mut self, id: u64, fd: RawFd) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.fd = fd;
        }
    }

    /// The effective redirection for `fd`: the last entry targeting it.
    pub fn lookup(&self, fd: RawFd) -> Option<&IoRedirect> {
        self.entries.iter().rev().find(|e| e.fd == fd)
    }

    /// Deep copy of the spine; payloads are shallow-copied, so `Buffer`
    /// clones share the underlying byte buffer.
    pub fn duplicate(&self) -> IoChain {
        self.clone()
    }

    /// Append a duplicate of every entry in `other`.
    pub fn extend_from(&mut self, other: &IoChain) {
        for entry in &other.entries {
            self.entries.push(entry.clone());
        }
    }

    /// Whether `fd` is one of the pipe ends referenced by this chain. Used
    /// when deciding which registered pipe fds a child must close.
    pub fn references_fd(&self, fd: RawFd) -> bool {
        self.entries.iter().any(|e| match &e.mode {
            IoMode::Pipe { ends } | IoMode::Buffer { ends, .. } => {
                ends[0] == fd || ends[1] == fd
            }
            _ => false,
        })
    }
}

/// Create a `Buffer` redirection on `fd`. The backing pipe is registered and
/// its read end switched to nonblocking for the post-job drain.
pub fn buffer_redirect(fd: RawFd, registry: &Rc<PipeRegistry>) -> io::Result<IoRedirect> {
    let (read, write) = create_pipe(registry)?;
    // The chain entry owns both ends from here on.
    let ends = [read.release(), write.release()];
    if unsafe { libc::fcntl(ends[0], libc::F_SETFL, libc::O_NONBLOCK) } != 0 {
        let err = io::Error::last_os_error();
        close_tracked(registry, ends[0]);
        close_tracked(registry, ends[1]);
        return Err(err);
    }
    Ok(IoRedirect::new(
        fd,
        IoMode::Buffer {
            ends,
            buffer: Rc::new(RefCell::new(Vec::new())),
        },
    ))
}

/// Drain a `Buffer` redirection once its job can produce no more output.
/// Closes the write end first so the read loop sees EOF, then reads the
/// pipe dry in blocking mode.
pub fn read_into_buffer(redirect: &IoRedirect, registry: &PipeRegistry) {
    let IoMode::Buffer { ends, buffer } = &redirect.mode else {
        return;
    };
    close_tracked(registry, ends[1]);
    if unsafe { libc::fcntl(ends[0], libc::F_SETFL, 0) } != 0 {
        debug!("could not restore blocking mode on buffer fd {}", ends[0]);
        return;
    }
    let mut chunk = [0u8; 4096];
    loop {
        let n = unsafe { libc::read(ends[0], chunk.as_mut_ptr().cast(), chunk.len()) };
        if n == 0 {
            break;
        }
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                // A broken pipe can clear the EOF flag; treat EAGAIN as done.
                Some(libc::EAGAIN) => break,
                _ => {
                    debug!("error reading block output from fd {}: {err}", ends[0]);
                    break;
                }
            }
        }
        buffer.borrow_mut().extend_from_slice(&chunk[..n as usize]);
    }
}

/// Release a `Buffer` redirection's read end. The write end must already
/// have been closed by [`read_into_buffer`].
pub fn destroy_buffer(redirect: &IoRedirect, registry: &PipeRegistry) {
    if let IoMode::Buffer { ends, .. } = &redirect.mode {
        close_tracked(registry, ends[0]);
    }
}

/// Bytes captured so far by a `Buffer` redirection.
pub fn buffer_contents(redirect: &IoRedirect) -> Option<SharedBuffer> {
    match &redirect.mode {
        IoMode::Buffer { buffer, .. } => Some(Rc::clone(buffer)),
        _ => None,
    }
}

/// Payload-free mirror of [`IoMode`] used between fork and exec. Owns no
/// shared state, so an exec closure holding it can be `Send + Sync`;
/// `Buffer` degrades to its pipe ends, which is all the child needs.
#[derive(Debug, Clone)]
pub enum RawMode {
    Close,
    File { path: String, flags: libc::c_int },
    Fd { src: RawFd },
    Pipe { ends: [RawFd; 2] },
}

/// Compile a chain into the plain-data plan the child-side installer
/// applies, preserving order.
pub fn install_plan(chain: &IoChain) -> Vec<(RawFd, RawMode)> {
    chain
        .iter()
        .map(|entry| {
            let mode = match &entry.mode {
                IoMode::Close => RawMode::Close,
                IoMode::File { path, flags } => RawMode::File {
                    path: path.clone(),
                    flags: *flags,
                },
                IoMode::Fd { src, .. } => RawMode::Fd { src: *src },
                IoMode::Pipe { ends } | IoMode::Buffer { ends, .. } => {
                    RawMode::Pipe { ends: *ends }
                }
            };
            (entry.fd, mode)
        })
        .collect()
}

fn retry_dup(fd: RawFd) -> RawFd {
    loop {
        let duped = unsafe { libc::dup(fd) };
        if duped >= 0 {
            return duped;
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            let msg = format!("reef: error while redirecting file descriptor {fd}\n");
            unsafe {
                libc::write(2, msg.as_ptr().cast(), msg.len());
                libc::_exit(1);
            }
        }
    }
}

/// Move any pipe end occupying `fd` out of the way before `fd` is reused as
/// a redirection target.
fn evacuate_fd(plan: &mut [(RawFd, RawMode)], fd: RawFd) {
    for (_, mode) in plan.iter_mut() {
        if let RawMode::Pipe { ends } = mode {
            for end in ends.iter_mut() {
                if *end == fd {
                    *end = retry_dup(fd);
                }
            }
        }
    }
}

fn child_fail(what: &str, detail: &str) -> ! {
    let msg = format!("reef: {what}: {detail}\n");
    unsafe {
        libc::write(2, msg.as_ptr().cast(), msg.len());
        libc::_exit(1);
    }
}

fn install_dup2(src: RawFd, dst: RawFd) {
    if unsafe { libc::dup2(src, dst) } == -1 {
        child_fail(
            "dup2",
            &io::Error::last_os_error().to_string(),
        );
    }
}

/// Apply an install plan in the child, in order. Must only run between
/// fork and exec (or in the no-fork `exec` path, where the shell image is
/// about to be replaced anyway): failures print to the original stderr and
/// terminate the process with a nonzero status.
pub fn install_in_child(plan: &[(RawFd, RawMode)]) {
    let mut plan: Vec<(RawFd, RawMode)> = plan.to_vec();
    for i in 0..plan.len() {
        let fd = plan[i].0;

        if let RawMode::Fd { src } = &plan[i].1 {
            if *src == fd {
                continue;
            }
        }

        if fd > 2 {
            evacuate_fd(&mut plan, fd);
        }

        // Speculative close; an untracked fd at the target must not make
        // the dup2 below fail.
        unsafe {
            libc::close(fd);
        }

        match &plan[i].1 {
            RawMode::Close => {}
            RawMode::File { path, flags } => {
                let c_path = match CString::new(path.as_str()) {
                    Ok(p) => p,
                    Err(_) => child_fail(path, "path contains a NUL byte"),
                };
                let opened = unsafe { libc::open(c_path.as_ptr(), *flags, 0o777) };
                if opened == -1 {
                    child_fail(path, &io::Error::last_os_error().to_string());
                }
                if opened != fd {
                    install_dup2(opened, fd);
                    unsafe {
                        libc::close(opened);
                    }
                }
            }
            RawMode::Fd { src } => {
                install_dup2(*src, fd);
            }
            RawMode::Pipe { ends } => {
                let src = ends[if fd != 0 { 1 } else { 0 }];
                install_dup2(src, fd);
                if fd != 0 {
                    unsafe {
                        libc::close(ends[0]);
                        libc::close(ends[1]);
                    }
                } else {
                    unsafe {
                        libc::close(ends[0]);
                    }
                }
            }
        }
    }
}

/// Replace every `File` entry with an `Fd` entry carrying a freshly opened
/// fd, so a whole block shares one open of each file instead of reopening it
/// per inner command. Returns the converted chain and the fds opened here;
/// [`untransmogrify`] closes exactly those.
pub fn transmogrify(chain: &IoChain) -> io::Result<(IoChain, Vec<RawFd>)> {
    let mut out = IoChain::new();
    let mut opened = Vec::new();
    for entry in &chain.entries {
        match &entry.mode {
            IoMode::File { path, flags } => {
                let c_path = CString::new(path.as_str())
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in path"))?;
                let fd = loop {
                    let fd = unsafe {
                        libc::open(c_path.as_ptr(), *flags | libc::O_CLOEXEC, 0o777)
                    };
                    if fd >= 0 {
                        break fd;
                    }
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::EINTR) {
                        for fd in &opened {
                            unsafe {
                                libc::close(*fd);
                            }
                        }
                        return Err(io::Error::new(
                            err.kind(),
                            format!("{path}: {err}"),
                        ));
                    }
                };
                opened.push(fd);
                out.append(IoRedirect::new(
                    entry.fd,
                    IoMode::Fd {
                        src: fd,
                        close_src: true,
                    },
                ));
            }
            // Everything else passes through by value.
            _ => out.append(entry.clone()),
        }
    }
    Ok((out, opened))
}

/// Close the fds a [`transmogrify`] call opened.
pub fn untransmogrify(opened: Vec<RawFd>) {
    for fd in opened {
        loop {
            if unsafe { libc::close(fd) } == 0 {
                break;
            }
            if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_fd_count() -> usize {
        std::fs::read_dir("/proc/self/fd")
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[test]
    fn lookup_returns_last_entry_for_fd() {
        let mut chain = IoChain::new();
        chain.append(IoRedirect::new(1, IoMode::Close));
        chain.append(IoRedirect::new(
            1,
            IoMode::Fd {
                src: 2,
                close_src: false,
            },
        ));
        let found = chain.lookup(1).unwrap();
        assert!(matches!(found.mode, IoMode::Fd { src: 2, .. }));
        assert!(chain.lookup(5).is_none());
    }

    #[test]
    fn remove_detaches_first_identity_match() {
        let mut chain = IoChain::new();
        let a = IoRedirect::new(0, IoMode::Close);
        let a_id = a.id();
        chain.append(a);
        chain.append(IoRedirect::new(1, IoMode::Close));
        assert_eq!(chain.len(), 2);
        let removed = chain.remove(a_id).unwrap();
        assert_eq!(removed.fd, 0);
        assert_eq!(chain.len(), 1);
        assert!(chain.remove(a_id).is_none());
    }

    #[test]
    fn duplicate_preserves_order_and_shares_buffers() {
        let buffer: SharedBuffer = Rc::new(RefCell::new(b"abc".to_vec()));
        let mut chain = IoChain::new();
        chain.append(IoRedirect::new(0, IoMode::Close));
        chain.append(IoRedirect::new(
            1,
            IoMode::Buffer {
                ends: [-1, -1],
                buffer: Rc::clone(&buffer),
            },
        ));
        let copy = chain.duplicate();
        assert_eq!(copy.len(), 2);
        let IoMode::Buffer { buffer: shared, .. } = &copy.lookup(1).unwrap().mode else {
            panic!("expected buffer entry");
        };
        shared.borrow_mut().push(b'd');
        assert_eq!(&*buffer.borrow(), b"abcd");
    }

    #[test]
    fn duplicated_entry_removable_by_original_id() {
        let entry = IoRedirect::new(1, IoMode::Close);
        let id = entry.id();
        let mut original = IoChain::new();
        original.append(entry);
        let mut merged = IoChain::new();
        merged.extend_from(&original);
        assert!(merged.remove(id).is_some());
        assert!(merged.is_empty());
    }

    #[test]
    fn references_fd_sees_pipe_ends_only() {
        let mut chain = IoChain::new();
        chain.append(IoRedirect::new(1, IoMode::Pipe { ends: [7, 8] }));
        chain.append(IoRedirect::new(
            2,
            IoMode::Fd {
                src: 9,
                close_src: false,
            },
        ));
        assert!(chain.references_fd(7));
        assert!(chain.references_fd(8));
        assert!(!chain.references_fd(9));
        assert!(!chain.references_fd(2));
    }

    #[test]
    fn transmogrify_replaces_files_and_leaks_no_fds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let mut chain = IoChain::new();
        chain.append(IoRedirect::new(
            1,
            IoMode::File {
                path: path.to_string_lossy().into_owned(),
                flags: libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
            },
        ));
        chain.append(IoRedirect::new(
            2,
            IoMode::Fd {
                src: 1,
                close_src: false,
            },
        ));

        let before = open_fd_count();
        let (converted, opened) = transmogrify(&chain).unwrap();
        assert_eq!(opened.len(), 1);
        assert!(matches!(
            converted.lookup(1).unwrap().mode,
            IoMode::Fd { close_src: true, .. }
        ));
        assert!(matches!(
            converted.lookup(2).unwrap().mode,
            IoMode::Fd { src: 1, .. }
        ));
        untransmogrify(opened);
        assert_eq!(open_fd_count(), before);
    }

    #[test]
    fn transmogrify_missing_file_reports_error() {
        let mut chain = IoChain::new();
        chain.append(IoRedirect::new(
            0,
            IoMode::File {
                path: "/definitely/not/a/real/path".into(),
                flags: libc::O_RDONLY,
            },
        ));
        assert!(transmogrify(&chain).is_err());
    }

    #[test]
    fn buffer_drain_collects_written_bytes() {
        let registry = PipeRegistry::new();
        let redirect = buffer_redirect(1, &registry).unwrap();
        let ends = match &redirect.mode {
            IoMode::Buffer { ends, .. } => *ends,
            _ => panic!("expected buffer"),
        };
        let payload = b"captured output";
        let n = unsafe { libc::write(ends[1], payload.as_ptr().cast(), payload.len()) };
        assert_eq!(n as usize, payload.len());
        read_into_buffer(&redirect, &registry);
        let contents = buffer_contents(&redirect).unwrap();
        assert_eq!(&*contents.borrow(), payload);
        destroy_buffer(&redirect, &registry);
        assert!(registry.is_empty());
    }
}
