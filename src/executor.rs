//! Job execution: walk a job's process list, fork and exec external
//! commands, run builtins in-process against buffered IO, evaluate
//! functions and blocks recursively, wire the pipes, place every child in
//! the job's process group, and hand the terminal over for foreground jobs.
//!
//! This turns out to be rather involved, since a process can be one of
//! several rather different things, and the loop also has to handle the
//! pipelining between them.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::process::Command;

use log::debug;

use crate::builtins;
use crate::io::{
    buffer_contents, buffer_redirect, destroy_buffer, install_in_child, install_plan,
    read_into_buffer, IoChain, IoMode, IoRedirect, RawMode,
};
use crate::jobs::{job_continue, Job, ProcessType};
use crate::pipes::TrackedFd;
use crate::shell::Shell;
use crate::signals::{self, SignalBlock, SignalLift};

/// Everything a child needs between fork and exec, by value: no shared
/// state crosses the fork.
struct ChildSetup {
    plan: Vec<(RawFd, RawMode)>,
    close_fds: Vec<RawFd>,
    /// Job pgid at fork time; 0 means "become your own group leader".
    pgid: libc::pid_t,
    fg: bool,
    /// Whether job control applies (interactive, not a subshell or block).
    job_control: bool,
}

/// Initialize a freshly forked child: join the job's process group, take
/// the terminal if foreground (the parent does the same; whichever runs
/// first wins the race), reset signal dispositions, drop the signal mask,
/// close stray shell pipes, and apply the redirection chain.
fn setup_child_process(setup: &ChildSetup) {
    if setup.job_control {
        let pid = unsafe { libc::getpid() };
        let target = if setup.pgid == 0 { pid } else { setup.pgid };
        unsafe {
            libc::setpgid(0, target);
        }
        if setup.fg {
            // SIGTTOU is still ignored here; dispositions reset below.
            unsafe {
                libc::tcsetpgrp(libc::STDIN_FILENO, target);
            }
        }
    }
    signals::reset_handlers();
    signals::unblock_all_in_child();
    for &fd in &setup.close_fds {
        unsafe {
            libc::close(fd);
        }
    }
    install_in_child(&setup.plan);
}

fn write_all_fd(fd: RawFd, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if n <= 0 {
            if io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

/// Fork a helper child whose sole purpose is to emit captured bytes down
/// the pipeline (or to stdout/stderr) and exit with the captured status.
fn fork_writer(
    setup: &ChildSetup,
    out: &[u8],
    err: &[u8],
    status: i32,
) -> io::Result<libc::pid_t> {
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => {
            setup_child_process(setup);
            write_all_fd(1, out);
            write_all_fd(2, err);
            unsafe { libc::_exit(status & 0xff) }
        }
        pid => Ok(pid),
    }
}

/// Registered pipe fds (plus the universal socket) the child must close
/// because its own chain does not use them.
fn child_close_list(shell: &Shell, chain: &IoChain) -> Vec<RawFd> {
    let mut list: Vec<RawFd> = shell
        .registry
        .snapshot()
        .into_iter()
        .filter(|&fd| !chain.references_fd(fd))
        .collect();
    if let Some(fd) = shell.universal.socket_fd() {
        list.push(fd);
    }
    list
}

/// Parent-side bookkeeping for a newly forked child: record the pgid
/// (first child's pid names the group), repeat the `setpgid`, and repeat
/// the terminal hand-off for foreground jobs — both are raced with the
/// child on purpose.
fn handle_new_child(shell: &mut Shell, job_id: i32, pid: libc::pid_t, job_control: bool) {
    if job_control {
        let job = shell.jobs.get_mut(job_id).unwrap();
        if job.pgid == 0 {
            job.pgid = pid;
        }
        let pgid = job.pgid;
        let fg = job.fg;
        if let Err(err) = crate::job_control::set_process_group(pid, pgid) {
            eprintln!("reef: could not send process {pid} to group {pgid}: {err}");
        }
        if fg && shell.interactive {
            let _ = crate::job_control::set_terminal_foreground(libc::STDIN_FILENO, pgid);
        }
    } else {
        let job = shell.jobs.get_mut(job_id).unwrap();
        if job.pgid == 0 {
            job.pgid = unsafe { libc::getpid() };
        }
    }
}

/// Map a spawn/exec error to the appropriate exit code.
fn command_error(program: &str, err: &io::Error) -> i32 {
    if err.kind() == io::ErrorKind::NotFound {
        eprintln!("reef: command not found: {program}");
        127
    } else {
        eprintln!("reef: {program}: {err}");
        126
    }
}

/// Morph the chain into block-level redirections, evaluate, clean up, and
/// reap whatever finished during the evaluation.
fn internal_exec_helper(shell: &mut Shell, definition: &str, io_chain: &IoChain) -> i32 {
    let (transmogrified, opened) = match crate::io::transmogrify(io_chain) {
        Ok(result) => result,
        Err(err) => {
            eprintln!("reef: {err}");
            return 1;
        }
    };
    let was_block = shell.in_block;
    shell.in_block = true;
    let status = {
        let _lift = SignalLift::new();
        (shell.evaluator)(shell, definition, &transmogrified)
    };
    crate::io::untransmogrify(opened);
    crate::jobs::reap(shell, false, false);
    shell.in_block = was_block;
    status
}

/// Resolve a builtin's stdin from the job's fd-0 redirection. Returns the
/// fd and whether this function opened it (and so must close it after the
/// builtin returns). -1 means the redirection could not be honoured.
fn builtin_input_fd(chain: &IoChain) -> (RawFd, bool) {
    let Some(entry) = chain.lookup(0) else {
        return (libc::STDIN_FILENO, false);
    };
    match &entry.mode {
        IoMode::Fd { src, .. } => (*src, false),
        IoMode::Pipe { ends } | IoMode::Buffer { ends, .. } => (ends[0], false),
        IoMode::File { path, flags } => {
            let Ok(c_path) = CString::new(path.as_str()) else {
                return (-1, false);
            };
            let fd = unsafe { libc::open(c_path.as_ptr(), *flags, 0o777) };
            if fd == -1 {
                eprintln!(
                    "reef: {path}: {}",
                    io::Error::last_os_error()
                );
                (-1, false)
            } else {
                (fd, true)
            }
        }
        IoMode::Close => (-1, false),
    }
}

/// Replace the whole shell with the target command: redirections are
/// installed in-process and `execv` never returns on success.
fn exec_in_place(shell: &mut Shell, job: &Job) -> i32 {
    let process = &job.processes[0];
    let Some(path) = process.actual_cmd.clone() else {
        eprintln!("reef: command not found: {}", process.argv[0]);
        return 127;
    };
    // No pipes are involved; just honour the redirections.
    let plan = install_plan(&job.io);
    let exported = shell.export_array();
    let c_path = CString::new(path.clone()).unwrap_or_default();
    let c_argv: Vec<CString> = process
        .argv
        .iter()
        .filter_map(|arg| CString::new(arg.as_str()).ok())
        .collect();
    let mut argv_ptrs: Vec<*const libc::c_char> =
        c_argv.iter().map(|arg| arg.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());
    let c_env: Vec<CString> = exported
        .iter()
        .filter_map(|(k, v)| CString::new(format!("{k}={v}")).ok())
        .collect();
    let mut env_ptrs: Vec<*const libc::c_char> = c_env.iter().map(|e| e.as_ptr()).collect();
    env_ptrs.push(std::ptr::null());

    setup_child_process(&ChildSetup {
        plan,
        close_fds: child_close_list(shell, &job.io),
        pgid: 0,
        fg: job.fg,
        job_control: false,
    });
    unsafe {
        libc::execve(c_path.as_ptr(), argv_ptrs.as_ptr(), env_ptrs.as_ptr());
    }
    // Only reached when the exec failed; the shell image is already torn
    // down (fds moved), so leave like the child we almost became.
    eprintln!("reef: failed to execute {path}: {}", io::Error::last_os_error());
    unsafe { libc::_exit(1) }
}

/// Execute a job: start every process in it, wire the pipes between them,
/// and hand control to the foreground controller once construction is
/// complete.
pub fn exec_job(shell: &mut Shell, mut job: Job, block_io: &IoChain) {
    debug!("exec job {} '{}'", job.job_id, job.command);

    if matches!(job.processes.first(), Some(p) if p.ptype == ProcessType::Exec) {
        let code = exec_in_place(shell, &job);
        shell.set_last_status(code);
        return;
    }

    // Merge the caller's block-level io under the job's own entries. The
    // duplicate keeps entry identities, so the originals' ids can strip
    // the merged copies again after the loop.
    let block_io_ids: Vec<u64> = block_io.iter().map(|e| e.id()).collect();
    if !block_io.is_empty() {
        let mut merged = block_io.duplicate();
        merged.extend_from(&job.io);
        job.io = merged;
    }

    // Reserved sentinel: "stdout goes to the next process". Its payload is
    // filled per iteration; it is removed for the last process.
    let pipe_write = IoRedirect::new(1, IoMode::Pipe { ends: [-1, -1] });
    let pipe_write_id = pipe_write.id();
    job.io.append(pipe_write);
    let mut pipe_read_id: Option<u64> = None;

    let job_id = job.job_id;
    let fg = job.fg;
    let process_count = job.processes.len();
    let job_control = shell.interactive && !shell.in_subshell && !shell.in_block;

    let gate = SignalBlock::new();
    shell.jobs.add(job);

    let mut exported_env: Option<Vec<(String, String)>> = None;
    let mut upstream: Option<TrackedFd> = None;
    let mut exec_error = false;

    for idx in 0..process_count {
        let is_last = idx + 1 == process_count;
        let (ptype, argv, pipe_fd) = {
            let job = shell.jobs.get(job_id).unwrap();
            let p = &job.processes[idx];
            (p.ptype, p.argv.clone(), p.pipe_fd)
        };

        // Regenerate the exported environment once for the whole job, so
        // every child does not redo the work.
        if ptype == ProcessType::External && exported_env.is_none() {
            exported_env = Some(shell.export_array());
        }

        {
            let job = shell.jobs.get_mut(job_id).unwrap();
            job.io.set_fd(pipe_write_id, pipe_fd);
            if idx == 1 {
                let pipe_read = IoRedirect::new(0, IoMode::Pipe { ends: [-1, -1] });
                pipe_read_id = Some(pipe_read.id());
                job.io.append(pipe_read);
            }
            if let (Some(id), Some(upstream)) = (pipe_read_id, upstream.as_ref()) {
                job.io
                    .set_mode(id, IoMode::Pipe { ends: [upstream.raw(), -1] });
            }
        }

        // Pipe to the next process, or retire the write sentinel.
        let mut downstream: Option<(TrackedFd, TrackedFd)> = None;
        if !is_last {
            match crate::pipes::create_pipe(&shell.registry) {
                Ok((read, write)) => {
                    shell.jobs.get_mut(job_id).unwrap().io.set_mode(
                        pipe_write_id,
                        IoMode::Pipe {
                            ends: [read.raw(), write.raw()],
                        },
                    );
                    downstream = Some((read, write));
                }
                Err(err) => {
                    eprintln!("reef: failed to create pipe: {err}");
                    exec_error = true;
                    break;
                }
            }
        } else {
            shell.jobs.get_mut(job_id).unwrap().io.remove(pipe_write_id);
        }

        match ptype {
            ProcessType::Function | ProcessType::Block => {
                let definition = match ptype {
                    ProcessType::Function => {
                        let name = &argv[0];
                        match shell.functions.get(name) {
                            Some(def) => Some(def.body.clone()),
                            None => {
                                eprintln!("reef: unknown function: {name}");
                                let job = shell.jobs.get_mut(job_id).unwrap();
                                job.processes[idx].completed = true;
                                job.processes[idx].set_exit_code(127);
                                None
                            }
                        }
                    }
                    _ => Some(argv[0].clone()),
                };

                if let Some(definition) = definition {
                    let mut io_buffer: Option<IoRedirect> = None;
                    if !is_last {
                        match buffer_redirect(pipe_fd, &shell.registry) {
                            Ok(buffer) => {
                                shell
                                    .jobs
                                    .get_mut(job_id)
                                    .unwrap()
                                    .io
                                    .append(buffer.clone());
                                io_buffer = Some(buffer);
                            }
                            Err(err) => {
                                eprintln!(
                                    "reef: failed to create block output buffer: {err}"
                                );
                                exec_error = true;
                                break;
                            }
                        }
                    }

                    let io_snapshot = shell.jobs.get(job_id).unwrap().io.duplicate();
                    if ptype == ProcessType::Function {
                        shell.env.push(true);
                        shell.env.set(
                            "argv",
                            &crate::env::join_array(&argv[1..]),
                            crate::env::Scope::Local,
                            Some(false),
                        );
                    }
                    internal_exec_helper(shell, &definition, &io_snapshot);
                    if ptype == ProcessType::Function {
                        shell.env.pop();
                    }
                    let status = shell.last_status();

                    // Output from a block usually needs no help; a pipe
                    // does, since the inner commands wrote into the
                    // capture buffer.
                    match io_buffer {
                        None => {
                            let job = shell.jobs.get_mut(job_id).unwrap();
                            job.processes[idx].completed = true;
                            job.processes[idx].set_exit_code(status);
                        }
                        Some(buffer) => {
                            let job = shell.jobs.get_mut(job_id).unwrap();
                            job.io.remove(buffer.id());
                            read_into_buffer(&buffer, &shell.registry);
                            let contents = buffer_contents(&buffer).unwrap();
                            let bytes = contents.borrow().clone();
                            if bytes.is_empty() {
                                let job = shell.jobs.get_mut(job_id).unwrap();
                                job.processes[idx].completed = true;
                                job.processes[idx].set_exit_code(status);
                            } else {
                                let (chain, job_fg, pgid) = {
                                    let job = shell.jobs.get(job_id).unwrap();
                                    (job.io.duplicate(), job.fg, job.pgid)
                                };
                                let setup = ChildSetup {
                                    plan: install_plan(&chain),
                                    close_fds: child_close_list(shell, &chain),
                                    pgid,
                                    fg: job_fg,
                                    job_control,
                                };
                                match fork_writer(&setup, &bytes, &[], status) {
                                    Ok(pid) => {
                                        shell
                                            .jobs
                                            .get_mut(job_id)
                                            .unwrap()
                                            .processes[idx]
                                            .pid = pid;
                                        handle_new_child(shell, job_id, pid, job_control);
                                    }
                                    Err(err) => {
                                        eprintln!(
                                            "reef: could not create child process: {err}"
                                        );
                                        exec_error = true;
                                    }
                                }
                            }
                            destroy_buffer(&buffer, &shell.registry);
                            if exec_error {
                                break;
                            }
                        }
                    }
                }
            }

            ProcessType::Builtin => {
                let (input_fd, close_input) = if idx == 0 {
                    let job = shell.jobs.get(job_id).unwrap();
                    builtin_input_fd(&job.io)
                } else {
                    (upstream.as_ref().map(|fd| fd.raw()).unwrap_or(-1), false)
                };
                if input_fd == -1 {
                    exec_error = true;
                    break;
                }

                shell.push_builtin_io(input_fd);

                // A builtin may run another foreground job (fg does);
                // pretend this one is suspended so it does not confuse
                // the job-control builtins.
                let was_fg = {
                    let job = shell.jobs.get_mut(job_id).unwrap();
                    std::mem::replace(&mut job.fg, false)
                };
                let code = {
                    let _lift = SignalLift::new();
                    builtins::run(shell, &argv)
                };
                shell.jobs.get_mut(job_id).unwrap().fg = was_fg;

                if close_input {
                    unsafe {
                        libc::close(input_fd);
                    }
                }

                let frame = shell.pop_builtin_io().expect("builtin frame");

                // Route each captured stream by the actual redirection
                // mode of its fd: buffer-destined output is appended
                // directly, unredirected output of a pipeline-final
                // builtin is written straight to the inherited fd, and
                // only what remains needs a child to carry it.
                let (out_buffer, err_buffer, out_redirected, err_redirected) = {
                    let job = shell.jobs.get(job_id).unwrap();
                    let out_entry = job.io.lookup(1);
                    let err_entry = job.io.lookup(2);
                    (
                        out_entry.and_then(buffer_contents),
                        err_entry.and_then(buffer_contents),
                        out_entry.is_some(),
                        err_entry.is_some(),
                    )
                };
                let mut out_bytes: &[u8] = &frame.out;
                let mut err_bytes: &[u8] = &frame.err;
                if let Some(buffer) = out_buffer {
                    buffer.borrow_mut().extend_from_slice(out_bytes);
                    out_bytes = &[];
                }
                if let Some(buffer) = err_buffer {
                    buffer.borrow_mut().extend_from_slice(err_bytes);
                    err_bytes = &[];
                }
                if is_last && !out_redirected && !out_bytes.is_empty() {
                    write_all_fd(1, out_bytes);
                    out_bytes = &[];
                }
                if is_last && !err_redirected && !err_bytes.is_empty() {
                    write_all_fd(2, err_bytes);
                    err_bytes = &[];
                }

                let skip_fork = is_last && out_bytes.is_empty() && err_bytes.is_empty();
                if skip_fork {
                    debug!("short-circuit for builtin {}", argv[0]);
                    let job = shell.jobs.get_mut(job_id).unwrap();
                    job.processes[idx].completed = true;
                    job.processes[idx].set_exit_code(code);
                } else {
                    let (chain, job_fg, pgid) = {
                        let job = shell.jobs.get(job_id).unwrap();
                        (job.io.duplicate(), job.fg, job.pgid)
                    };
                    let setup = ChildSetup {
                        plan: install_plan(&chain),
                        close_fds: child_close_list(shell, &chain),
                        pgid,
                        fg: job_fg,
                        job_control,
                    };
                    match fork_writer(&setup, out_bytes, err_bytes, code) {
                        Ok(pid) => {
                            shell.jobs.get_mut(job_id).unwrap().processes[idx].pid = pid;
                            handle_new_child(shell, job_id, pid, job_control);
                        }
                        Err(err) => {
                            eprintln!("reef: could not create child process: {err}");
                            exec_error = true;
                            break;
                        }
                    }
                }
            }

            ProcessType::External => {
                let resolved = {
                    let job = shell.jobs.get(job_id).unwrap();
                    job.processes[idx].actual_cmd.clone()
                }
                .or_else(|| {
                    builtins::find_in_path(shell, &argv[0])
                        .map(|p| p.to_string_lossy().into_owned())
                });
                let Some(path) = resolved else {
                    eprintln!("reef: command not found: {}", argv[0]);
                    let job = shell.jobs.get_mut(job_id).unwrap();
                    job.processes[idx].completed = true;
                    job.processes[idx].set_exit_code(127);
                    // Fall through to the pipe bookkeeping so downstream
                    // readers still see EOF.
                    upstream = None;
                    if let Some((read, write)) = downstream {
                        upstream = Some(read);
                        drop(write);
                    }
                    continue;
                };

                let (chain, job_fg, pgid) = {
                    let job = shell.jobs.get(job_id).unwrap();
                    (job.io.duplicate(), job.fg, job.pgid)
                };
                let setup = ChildSetup {
                    plan: install_plan(&chain),
                    close_fds: child_close_list(shell, &chain),
                    pgid,
                    fg: job_fg,
                    job_control,
                };

                let mut command = Command::new(&path);
                command.arg0(&argv[0]);
                command.args(&argv[1..]);
                command.env_clear();
                if let Some(pairs) = exported_env.as_ref() {
                    for (key, value) in pairs {
                        command.env(key, value);
                    }
                }
                unsafe {
                    command.pre_exec(move || {
                        setup_child_process(&setup);
                        Ok(())
                    });
                }

                match command.spawn() {
                    Ok(child) => {
                        let pid = child.id() as libc::pid_t;
                        shell.jobs.get_mut(job_id).unwrap().processes[idx].pid = pid;
                        handle_new_child(shell, job_id, pid, job_control);
                        // The reaper owns the child's lifetime from here.
                        drop(child);
                    }
                    Err(err) => {
                        let code = command_error(&argv[0], &err);
                        let job = shell.jobs.get_mut(job_id).unwrap();
                        job.processes[idx].completed = true;
                        job.processes[idx].set_exit_code(code);
                    }
                }
            }

            ProcessType::Exec => {
                eprintln!("reef: exec is only valid as the sole command of a job");
                exec_error = true;
                break;
            }
        }

        // Close our copy of the pipe the current process read from, then
        // advance: the next process reads from the pipe just created, and
        // the child already holds its own copy of the write end.
        upstream = None;
        if let Some((read, write)) = downstream {
            upstream = Some(read);
            drop(write);
        }
    }

    drop(upstream);

    {
        let job = shell.jobs.get_mut(job_id).unwrap();
        if let Some(id) = pipe_read_id {
            job.io.remove(id);
        }
        job.io.remove(pipe_write_id);
        for id in block_io_ids {
            job.io.remove(id);
        }
        job.constructed = true;
        if exec_error {
            // Abandon the stages that never started; already-forked
            // children are reaped normally.
            for process in job.processes.iter_mut() {
                if process.pid == 0 && !process.completed {
                    process.completed = true;
                    process.set_exit_code(1);
                }
            }
        }
        if !fg {
            shell.last_bg_pgid = job.pgid;
        }
    }

    debug!("job {job_id} is constructed");
    drop(gate);

    // An in-process completion (short-circuited builtin, function with no
    // helper child) must be visible to the very next expansion.
    let done_status = {
        let job = shell.jobs.get(job_id).unwrap();
        job.is_completed().then(|| job.last_status())
    };
    if let Some(code) = done_status {
        shell.set_last_status(code);
    }

    if exec_error {
        shell.set_last_status(1);
        return;
    }
    job_continue(shell, job_id, false);
}

/// Evaluate a command substitution: capture its output through a buffer
/// redirection and split it into lines. `$status` is restored afterwards;
/// the substitution's own status is returned.
pub fn exec_subshell(shell: &mut Shell, command: &str) -> (i32, Vec<String>) {
    let buffer = match buffer_redirect(1, &shell.registry) {
        Ok(buffer) => buffer,
        Err(err) => {
            eprintln!("reef: failed to create substitution buffer: {err}");
            return (1, Vec::new());
        }
    };
    let mut chain = IoChain::new();
    chain.append(buffer.clone());

    let previous_status = shell.last_status();
    let was_subshell = shell.in_subshell;
    shell.in_subshell = true;
    let status = (shell.evaluator)(shell, command, &chain);
    shell.in_subshell = was_subshell;

    read_into_buffer(&buffer, &shell.registry);
    let contents = buffer_contents(&buffer).unwrap();
    let bytes = contents.borrow().clone();
    destroy_buffer(&buffer, &shell.registry);
    shell.set_last_status(previous_status);

    let mut lines: Vec<String> = String::from_utf8_lossy(&bytes)
        .split('\n')
        .map(str::to_string)
        .collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    (status, lines)
}
