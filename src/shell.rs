//! The shell context: every piece of process-wide state the core mutates,
//! gathered into one owner that is passed to each operation.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use log::debug;

use crate::env::{EnvStack, Scope};
use crate::event::{Event, EventDispatcher};
use crate::io::IoChain;
use crate::job_control;
use crate::jobs::JobList;
use crate::pipes::PipeRegistry;
use crate::universal::{UniversalClient, UvarUpdate};

/// Evaluator callback, injected at startup so the executor can re-enter
/// evaluation for functions and blocks without a hard module dependency.
pub type Evaluator = fn(&mut Shell, &str, &IoChain) -> i32;

/// A stored shell function.
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub body: String,
}

/// Scoped IO for a running builtin: stdin is a real fd, stdout and stderr
/// are in-memory buffers the executor routes afterwards.
pub struct BuiltinIo {
    pub stdin_fd: RawFd,
    pub out: Vec<u8>,
    pub err: Vec<u8>,
}

pub struct Shell {
    pub jobs: JobList,
    pub registry: Rc<PipeRegistry>,
    pub env: EnvStack,
    pub events: EventDispatcher,
    pub universal: UniversalClient,
    pub functions: HashMap<String, FunctionDef>,
    /// Stack of builtin IO frames; a builtin may run another job which runs
    /// another builtin.
    pub builtin_io: Vec<BuiltinIo>,
    pub interactive: bool,
    /// Inside a block/function evaluation: jobs reuse the shell's group.
    pub in_block: bool,
    /// Inside a command substitution.
    pub in_subshell: bool,
    pub shell_pgid: libc::pid_t,
    pub saved_termios: Option<libc::termios>,
    /// pgid of the most recently backgrounded job (`$last_pid` feed).
    pub last_bg_pgid: libc::pid_t,
    /// Set by the `exit` builtin; the reader loop honours it.
    pub exit_requested: Option<i32>,
    pub evaluator: Evaluator,
    last_status: i32,
    export_cache: Option<Vec<(String, String)>>,
}

impl Shell {
    pub fn new(evaluator: Evaluator, universal: UniversalClient) -> Self {
        let interactive = unsafe { libc::isatty(libc::STDIN_FILENO) } == 1;
        let mut env = EnvStack::new();
        env.import_environ();
        Shell {
            jobs: JobList::new(),
            registry: PipeRegistry::new(),
            env,
            events: EventDispatcher::new(),
            universal,
            functions: HashMap::new(),
            builtin_io: Vec::new(),
            interactive,
            in_block: false,
            in_subshell: false,
            shell_pgid: unsafe { libc::getpgrp() },
            saved_termios: if interactive {
                job_control::save_termios(libc::STDIN_FILENO)
            } else {
                None
            },
            last_bg_pgid: 0,
            exit_requested: None,
            evaluator,
            last_status: 0,
            export_cache: None,
        }
    }

    pub fn last_status(&self) -> i32 {
        self.last_status
    }

    /// Post `$status` and let listeners know. `$status` is never exported,
    /// so the export cache stays valid.
    pub fn set_last_status(&mut self, code: i32) {
        self.last_status = code;
        self.events
            .fire(&Event::Variable("status".into()), &["VARIABLE".into(), "SET".into(), "status".into()]);
    }

    /// Visible value of a variable: scopes, then the universal store.
    pub fn var(&self, name: &str) -> Option<String> {
        if name == "status" {
            return Some(self.last_status.to_string());
        }
        if let Some(entry) = self.env.get(name) {
            return Some(entry.value.clone());
        }
        self.universal.get(name).map(|(value, _)| value.clone())
    }

    /// Set a variable in the scope stack and fire its change event.
    pub fn set_var(&mut self, name: &str, value: &str, scope: Scope, export: Option<bool>) {
        self.env.set(name, value, scope, export);
        self.fire_variable_event(name);
    }

    /// Set a universal variable; the write is durable (barriered) by the
    /// time this returns.
    pub fn set_universal(&mut self, name: &str, value: &str, export: bool) {
        self.universal.set(name, value, export);
        self.fire_variable_event(name);
    }

    pub fn erase_universal(&mut self, name: &str) {
        self.universal.erase(name);
        self.fire_variable_event(name);
    }

    pub fn fire_variable_event(&mut self, name: &str) {
        self.events.fire(
            &Event::Variable(name.to_string()),
            &["VARIABLE".into(), "SET".into(), name.to_string()],
        );
    }

    /// Apply store changes pushed by the universal server, firing variable
    /// events for each.
    pub fn pump_universal(&mut self) {
        self.universal.read_all();
        for update in self.universal.take_updates() {
            let name = match update {
                UvarUpdate::Set { name, .. } => name,
                UvarUpdate::Erase { name } => name,
            };
            debug!("universal update for {name}");
            self.fire_variable_event(&name);
        }
    }

    /// The merged exported view (scopes over the universal store) as
    /// `KEY=VALUE` material for exec. Rebuilt only when an exported
    /// variable changed.
    pub fn export_array(&mut self) -> Vec<(String, String)> {
        let env_changed = self.env.take_changed();
        let universal_changed = self.universal.take_export_changed();
        if self.export_cache.is_none() || env_changed || universal_changed {
            debug!("rebuilding exported environment");
            let mut pairs = self.env.export_pairs();
            for (name, value) in self.universal.exported_pairs() {
                if pairs.iter().all(|(existing, _)| *existing != name) {
                    pairs.push((name, value));
                }
            }
            self.export_cache = Some(pairs);
        }
        self.export_cache.clone().unwrap()
    }

    // ── Builtin IO frames ──

    pub fn push_builtin_io(&mut self, stdin_fd: RawFd) {
        self.builtin_io.push(BuiltinIo {
            stdin_fd,
            out: Vec::new(),
            err: Vec::new(),
        });
    }

    pub fn pop_builtin_io(&mut self) -> Option<BuiltinIo> {
        self.builtin_io.pop()
    }

    pub fn builtin_out(&mut self) -> &mut Vec<u8> {
        &mut self
            .builtin_io
            .last_mut()
            .expect("builtin IO frame missing")
            .out
    }

    pub fn builtin_err(&mut self) -> &mut Vec<u8> {
        &mut self
            .builtin_io
            .last_mut()
            .expect("builtin IO frame missing")
            .err
    }

    pub fn builtin_stdin(&self) -> RawFd {
        self.builtin_io
            .last()
            .map(|frame| frame.stdin_fd)
            .unwrap_or(libc::STDIN_FILENO)
    }

    /// Define or replace a function. Replacing drops any event
    /// registrations pointing at the old definition.
    pub fn define_function(&mut self, name: &str, body: &str) {
        self.events.remove_function(name);
        self.functions.insert(
            name.to_string(),
            FunctionDef {
                body: body.to_string(),
            },
        );
    }

    /// Run queued event handler invocations. Handlers are ordinary shell
    /// functions evaluated with `$argv` bound to the event arguments.
    pub fn service_events(&mut self) {
        // A handler can fire more events; bound the cascade.
        for _ in 0..64 {
            if !self.events.has_pending() {
                return;
            }
            for invocation in self.events.take_pending() {
                let Some(def) = self.functions.get(&invocation.function).cloned() else {
                    continue;
                };
                self.env.push(true);
                self.env.set(
                    "argv",
                    &crate::env::join_array(&invocation.args),
                    Scope::Local,
                    Some(false),
                );
                let body = def.body;
                (self.evaluator)(self, &body, &IoChain::new());
                self.env.pop();
            }
        }
    }
}
