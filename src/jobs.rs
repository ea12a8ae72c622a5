//! The process and job model, the reaper, and the foreground controller.
//!
//! A `Job` is one pipeline sharing a process group; a `Process` is one
//! execution step inside it. The job list is ordered most-recently-used
//! first, and its first constructed entry is the default target for `fg`
//! and `bg` without arguments.

use std::io::{self, Write};
use std::os::unix::io::RawFd;

use log::debug;

use crate::event::Event;
use crate::io::IoChain;
use crate::job_control::{self, ForegroundTerminalGuard, WaitResult};
use crate::shell::Shell;
use crate::signals::{self, SignalBlock};
use crate::status::{self, WaitState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessType {
    /// An external command, forked and exec'd.
    External,
    /// A builtin, run inside the shell against a builtin IO frame.
    Builtin,
    /// A shell function body, evaluated recursively.
    Function,
    /// A `begin`/`end` style block, evaluated recursively.
    Block,
    /// A whole-shell replacement: exec without fork.
    Exec,
}

/// One execution step within a pipeline.
#[derive(Debug)]
pub struct Process {
    pub ptype: ProcessType,
    /// Owned argument vector; `argv[0]` is the command word (for a Block,
    /// the block source).
    pub argv: Vec<String>,
    /// Resolved absolute path, External/Exec only.
    pub actual_cmd: Option<String>,
    /// 0 until forked.
    pub pid: libc::pid_t,
    /// The input fd this process expects its stdin wired to.
    pub pipe_fd: RawFd,
    pub completed: bool,
    pub stopped: bool,
    /// Raw status word as returned by `waitpid`; for in-process builtins,
    /// a synthesised exit status word.
    pub raw_status: libc::c_int,
}

impl Process {
    pub fn new(ptype: ProcessType, argv: Vec<String>) -> Self {
        Process {
            ptype,
            argv,
            actual_cmd: None,
            pid: 0,
            pipe_fd: 0,
            completed: false,
            stopped: false,
            raw_status: 0,
        }
    }

    /// Record a builtin's return code as if it had been waited for.
    pub fn set_exit_code(&mut self, code: i32) {
        self.raw_status = (code & 0xff) << 8;
    }

    pub fn exit_code(&self) -> i32 {
        status::exit_code_from_wait_status(self.raw_status).unwrap_or(0)
    }
}

/// One pipeline.
pub struct Job {
    pub job_id: i32,
    /// 0 until the first child is forked; then the pid of that child.
    pub pgid: libc::pid_t,
    pub processes: Vec<Process>,
    pub fg: bool,
    /// All children forked and parent-side pipe ends closed.
    pub constructed: bool,
    /// The user has been told about the last state change.
    pub notified: bool,
    pub skip_notification: bool,
    /// `not`-prefixed: invert the final exit code.
    pub negate: bool,
    /// Display string for notifications and `jobs`.
    pub command: String,
    /// External redirections applied on top of every process.
    pub io: IoChain,
    /// Terminal modes captured when the job stopped, restored on `fg`.
    pub tmodes: Option<libc::termios>,
    /// Exit/job events have been queued for this job's completion.
    pub exit_events_fired: bool,
}

impl Job {
    /// At least one process stopped and none running.
    pub fn is_stopped(&self) -> bool {
        self.processes.iter().all(|p| p.completed || p.stopped)
    }

    pub fn is_completed(&self) -> bool {
        self.processes.iter().all(|p| p.completed)
    }

    pub fn has_stopped_process(&self) -> bool {
        self.processes.iter().any(|p| p.stopped && !p.completed)
    }

    /// The job's exit code: the last process's, negated for `not` jobs.
    pub fn last_status(&self) -> i32 {
        let code = self
            .processes
            .last()
            .map(|p| p.exit_code())
            .unwrap_or(0);
        if self.negate {
            if code == 0 { 1 } else { 0 }
        } else {
            code
        }
    }

    /// Display state for `jobs` output.
    pub fn state_name(&self) -> &'static str {
        if self.is_completed() {
            "ended"
        } else if self.is_stopped() {
            "stopped"
        } else {
            "running"
        }
    }
}

/// All jobs, most-recently-used first.
#[derive(Default)]
pub struct JobList {
    jobs: Vec<Job>,
    next_job_id: i32,
}

impl JobList {
    pub fn new() -> Self {
        JobList {
            jobs: Vec::new(),
            next_job_id: 1,
        }
    }

    /// Build an empty job. The caller fills in processes and hands it back
    /// via [`JobList::add`].
    pub fn create(&mut self, command: &str, fg: bool) -> Job {
        let job_id = self.next_job_id;
        self.next_job_id += 1;
        Job {
            job_id,
            pgid: 0,
            processes: Vec::new(),
            fg,
            constructed: false,
            notified: false,
            skip_notification: false,
            negate: false,
            command: command.to_string(),
            io: IoChain::new(),
            tmodes: None,
            exit_events_fired: false,
        }
    }

    /// Insert at the front (most recent).
    pub fn add(&mut self, job: Job) {
        self.jobs.insert(0, job);
    }

    /// Move a job to the front. Promoting the head is a no-op, and
    /// promoting twice is the same as promoting once.
    pub fn promote(&mut self, job_id: i32) {
        let Some(pos) = self.jobs.iter().position(|j| j.job_id == job_id) else {
            return;
        };
        if pos == 0 {
            return;
        }
        let job = self.jobs.remove(pos);
        self.jobs.insert(0, job);
    }

    pub fn get(&self, job_id: i32) -> Option<&Job> {
        self.jobs.iter().find(|j| j.job_id == job_id)
    }

    pub fn get_mut(&mut self, job_id: i32) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.job_id == job_id)
    }

    pub fn remove(&mut self, job_id: i32) -> Option<Job> {
        let pos = self.jobs.iter().position(|j| j.job_id == job_id)?;
        Some(self.jobs.remove(pos))
    }

    /// Linear scan across every process of every job.
    pub fn find_by_pid(&self, pid: libc::pid_t) -> Option<(i32, usize)> {
        for job in &self.jobs {
            for (idx, process) in job.processes.iter().enumerate() {
                if process.pid == pid {
                    return Some((job.job_id, idx));
                }
            }
        }
        None
    }

    /// MRU order.
    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Job> {
        self.jobs.iter_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Default target for `fg`/`bg` without arguments: the most recent
    /// constructed job that could still be brought to the foreground.
    pub fn default_job_id(&self) -> Option<i32> {
        self.jobs
            .iter()
            .find(|j| j.constructed && !j.is_completed() && (j.is_stopped() || !j.fg))
            .map(|j| j.job_id)
    }

    /// Most recent constructed, stopped job; the `bg` default.
    pub fn default_stopped_job_id(&self) -> Option<i32> {
        self.jobs
            .iter()
            .find(|j| j.constructed && !j.is_completed() && j.is_stopped())
            .map(|j| j.job_id)
    }

    fn remove_finished(&mut self) {
        self.jobs
            .retain(|j| !(j.is_completed() && j.notified && j.exit_events_fired));
    }
}

/// Reflect one decoded wait status into the owning job's process.
fn apply_wait_state(shell: &mut Shell, pid: libc::pid_t, state: WaitState, raw: libc::c_int) {
    let Some((job_id, proc_idx)) = shell.jobs.find_by_pid(pid) else {
        // Probably a grandchild inherited from a substitution; not ours.
        debug!("reaped unknown pid {pid}");
        return;
    };
    let job = shell.jobs.get_mut(job_id).unwrap();
    let process = &mut job.processes[proc_idx];
    match state {
        WaitState::Exited(_) | WaitState::Signalled { .. } => {
            process.completed = true;
            process.raw_status = raw;
        }
        WaitState::Stopped(_) => {
            process.stopped = true;
            process.raw_status = raw;
            job.notified = false;
        }
        WaitState::Continued => {
            process.stopped = false;
        }
    }
    if let WaitState::Signalled { signal, core_dumped } = state {
        if signal != libc::SIGPIPE && shell.interactive {
            let mut stderr = io::stderr();
            let what = if core_dumped {
                "terminated (core dumped)"
            } else {
                "terminated"
            };
            let _ = writeln!(
                stderr,
                "reef: process {pid} '{}' {what} by signal {signal}",
                job.command
            );
        }
    }
}

/// Reap every child that has changed state and publish the consequences:
/// process flags, `$status`, exit events, and user notifications.
///
/// Called from the top of the eval loop, at every prompt (with
/// `interactive` set so notifications print), and — in the blocking
/// variant — from inside [`job_continue`] for the foreground job.
///
/// Returns whether any child status was collected, so blocking callers
/// can tell progress from an empty nursery.
pub fn reap(shell: &mut Shell, block: bool, interactive: bool) -> bool {
    let _gate = SignalBlock::new();
    signals::take_sigchld();
    shell.events.begin_cycle();

    // In the blocking variant only the first wait blocks; the rest of the
    // backlog is drained without blocking.
    let mut block_next = block;
    let mut reaped_order: Vec<libc::pid_t> = Vec::new();
    loop {
        match job_control::wait_any(block_next) {
            WaitResult::Reaped(pid, raw) => {
                block_next = false;
                let Some(state) = status::decode_wait_status(raw) else {
                    continue;
                };
                debug!("reaped pid {pid}: {state:?}");
                apply_wait_state(shell, pid, state, raw);
                reaped_order.push(pid);
            }
            WaitResult::None => break,
            WaitResult::Interrupted => return false,
        }
    }
    let progressed = !reaped_order.is_empty();

    // Per-process exit events, in completion order within this call.
    for pid in reaped_order {
        let Some((job_id, proc_idx)) = shell.jobs.find_by_pid(pid) else {
            continue;
        };
        let job = shell.jobs.get(job_id).unwrap();
        let process = &job.processes[proc_idx];
        if process.completed {
            let status = process.exit_code();
            shell.events.fire(
                &Event::ProcessExit {
                    pid: pid as i32,
                    status,
                },
                &["PROCESS_EXIT".to_string(), pid.to_string(), status.to_string()],
            );
        }
    }

    publish_and_notify(shell, interactive);
    progressed
}

/// Walk the job list: post `$status` and fire job events for newly
/// completed jobs, notify the user about background state changes, and
/// drop jobs that are finished and fully reported.
fn publish_and_notify(shell: &mut Shell, interactive: bool) {
    let mut completed_jobs: Vec<i32> = Vec::new();
    let mut status_to_post: Option<i32> = None;
    for job in shell.jobs.iter_mut() {
        if !job.constructed || !job.is_completed() || job.exit_events_fired {
            continue;
        }
        job.exit_events_fired = true;
        completed_jobs.push(job.job_id);
        status_to_post = Some(job.last_status());
    }

    if let Some(code) = status_to_post {
        shell.set_last_status(code);
    }

    for job_id in completed_jobs {
        shell
            .events
            .fire(&Event::JobExit { job_id }, &["JOB_EXIT".to_string(), job_id.to_string()]);
    }

    notify_state_changes(shell, interactive);
    shell.jobs.remove_finished();
}

/// Tell the user about background jobs that ended or stopped. The format is
/// fixed; presence and content are the contract, not layout.
fn notify_state_changes(shell: &mut Shell, interactive: bool) {
    let mut stderr = io::stderr();
    for job in shell.jobs.iter_mut() {
        if !job.constructed || job.notified {
            continue;
        }
        if job.is_completed() {
            if job.fg || job.skip_notification {
                job.notified = true;
                continue;
            }
            if interactive {
                let _ = writeln!(stderr, "Job {}, '{}' has ended", job.job_id, job.command);
                job.notified = true;
            }
        } else if job.is_stopped() {
            if job.skip_notification {
                job.notified = true;
                continue;
            }
            if interactive && !job.fg {
                let _ = writeln!(stderr, "Job {}, '{}' has stopped", job.job_id, job.command);
                job.notified = true;
            }
        }
    }
}

/// Put a job in the foreground (or resume it in the background).
///
/// `resume` sends SIGCONT to the group first, for `fg`/`bg` on a stopped
/// job. Foreground jobs get the terminal for the duration of the wait; the
/// shell takes it back afterwards and restores its own terminal modes.
/// SIGINT aborts the wait without killing the job — the tty driver already
/// delivered the signal to the job's group.
pub fn job_continue(shell: &mut Shell, job_id: i32, resume: bool) {
    shell.jobs.promote(job_id);
    let Some(job) = shell.jobs.get_mut(job_id) else {
        return;
    };
    job.notified = false;
    let pgid = job.pgid;
    let fg = job.fg;
    let tmodes = job.tmodes;
    debug!("continue job {job_id} (pgid {pgid}, fg {fg}, resume {resume})");

    if resume && pgid > 0 {
        for process in &mut job.processes {
            process.stopped = false;
        }
        if let Err(err) = job_control::send_continue_to_group(pgid) {
            eprintln!("reef: failed to continue job {job_id}: {err}");
        }
    }

    if !fg {
        return;
    }

    let terminal_guard = if shell.interactive && pgid > 0 {
        match ForegroundTerminalGuard::new(pgid) {
            Ok(guard) => Some(guard),
            Err(err) => {
                eprintln!("reef: failed to move terminal to job {job_id}: {err}");
                None
            }
        }
    } else {
        None
    };

    if resume {
        if let Some(modes) = tmodes.as_ref() {
            job_control::restore_termios(libc::STDIN_FILENO, modes);
        }
    }

    loop {
        match shell.jobs.get(job_id) {
            // Completed and already cleaned up by the reaper.
            None => break,
            Some(job) if job.is_completed() || job.is_stopped() => break,
            Some(_) => {}
        }
        let progressed = reap(shell, true, false);
        if signals::take_interrupt() {
            // The tty delivered the interrupt to the job too; just stop
            // waiting and let the reader discard its line.
            break;
        }
        if !progressed {
            // No children left to wait for; whatever state the job is in
            // is as final as it gets.
            break;
        }
    }

    drop(terminal_guard);

    if let Some(job) = shell.jobs.get_mut(job_id) {
        if job.has_stopped_process() {
            job.tmodes = job_control::save_termios(libc::STDIN_FILENO);
        }
    }
    if shell.interactive {
        if let Some(modes) = shell.saved_termios {
            job_control::restore_termios(libc::STDIN_FILENO, &modes);
        }
    }
}
