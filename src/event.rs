//! Event handlers: shell functions invoked on signals, variable changes,
//! and process/job exits.
//!
//! Firing never calls back into the evaluator directly. Matching handlers
//! are queued as invocations; the shell services the queue at its next
//! cooperative step, with the event arguments bound to `$argv`.

use std::collections::HashSet;

use log::debug;

/// Pid wildcard for process-exit registrations.
pub const ANY_PID: i32 = 0;

/// What a registration listens for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPattern {
    Signal(i32),
    AnySignal,
    Variable(String),
    /// `ANY_PID` matches every process exit.
    ProcessExit(i32),
    JobExit(i32),
    Any,
}

/// A concrete event to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Signal(i32),
    Variable(String),
    ProcessExit { pid: i32, status: i32 },
    JobExit { job_id: i32 },
}

impl EventPattern {
    fn matches(&self, event: &Event) -> bool {
        match (self, event) {
            (EventPattern::Any, _) => true,
            (EventPattern::Signal(want), Event::Signal(got)) => want == got,
            (EventPattern::AnySignal, Event::Signal(_)) => true,
            (EventPattern::Variable(want), Event::Variable(got)) => want == got,
            (EventPattern::ProcessExit(want), Event::ProcessExit { pid, .. }) => {
                *want == ANY_PID || want == pid
            }
            (EventPattern::JobExit(want), Event::JobExit { job_id }) => want == job_id,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
struct EventHandler {
    pattern: EventPattern,
    function: String,
}

/// A queued handler invocation, ready for the evaluator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub function: String,
    pub args: Vec<String>,
}

#[derive(Default)]
pub struct EventDispatcher {
    /// Registration order is invocation order.
    handlers: Vec<EventHandler>,
    pending: Vec<Invocation>,
    /// Handlers that already fired for a signal in the current reap cycle;
    /// repeated signals coalesce into one invocation.
    signalled_this_cycle: HashSet<usize>,
    /// Variables currently mid-fire, to stop handler output from firing the
    /// same variable event recursively (notably `status`).
    firing_variables: HashSet<String>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pattern: EventPattern, function: &str) {
        debug!("register event handler {function} for {pattern:?}");
        self.handlers.push(EventHandler {
            pattern,
            function: function.to_string(),
        });
    }

    /// Drop every registration invoking `function`. Called when the
    /// function is redefined or erased.
    pub fn remove_function(&mut self, function: &str) {
        self.handlers.retain(|h| h.function != function);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Start a new coalescing window. The reaper calls this once per pass.
    pub fn begin_cycle(&mut self) {
        self.signalled_this_cycle.clear();
    }

    /// Queue invocations for every handler matching `event`, in
    /// registration order.
    pub fn fire(&mut self, event: &Event, args: &[String]) {
        if let Event::Variable(name) = event {
            if self.firing_variables.contains(name) {
                return;
            }
            self.firing_variables.insert(name.clone());
        }

        for (idx, handler) in self.handlers.iter().enumerate() {
            if !handler.pattern.matches(event) {
                continue;
            }
            if matches!(event, Event::Signal(_)) {
                if self.signalled_this_cycle.contains(&idx) {
                    continue;
                }
                self.signalled_this_cycle.insert(idx);
            }
            self.pending.push(Invocation {
                function: handler.function.clone(),
                args: args.to_vec(),
            });
        }

        if let Event::Variable(name) = event {
            self.firing_variables.remove(name);
        }
    }

    /// Whether a variable event is currently being dispatched for `name`.
    pub fn variable_fire_in_progress(&self, name: &str) -> bool {
        self.firing_variables.contains(name)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drain the queued invocations, oldest first.
    pub fn take_pending(&mut self) -> Vec<Invocation> {
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handlers_fire_in_registration_order() {
        let mut events = EventDispatcher::new();
        events.register(EventPattern::Variable("x".into()), "first");
        events.register(EventPattern::Any, "second");
        events.register(EventPattern::Variable("y".into()), "never");
        events.fire(&Event::Variable("x".into()), &["x".into()]);
        let pending = events.take_pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].function, "first");
        assert_eq!(pending[1].function, "second");
        assert!(!events.has_pending());
    }

    #[test]
    fn process_exit_wildcard_matches_every_pid() {
        let mut events = EventDispatcher::new();
        events.register(EventPattern::ProcessExit(ANY_PID), "watcher");
        events.register(EventPattern::ProcessExit(42), "specific");
        events.fire(&Event::ProcessExit { pid: 41, status: 0 }, &[]);
        let pending = events.take_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].function, "watcher");
    }

    #[test]
    fn job_exit_matches_on_job_id() {
        let mut events = EventDispatcher::new();
        events.register(EventPattern::JobExit(3), "on_job");
        events.fire(&Event::JobExit { job_id: 2 }, &[]);
        assert!(!events.has_pending());
        events.fire(&Event::JobExit { job_id: 3 }, &[]);
        assert_eq!(events.take_pending().len(), 1);
    }

    #[test]
    fn signals_coalesce_within_a_cycle() {
        let mut events = EventDispatcher::new();
        events.register(EventPattern::Signal(libc::SIGUSR1), "trap");
        events.begin_cycle();
        events.fire(&Event::Signal(libc::SIGUSR1), &[]);
        events.fire(&Event::Signal(libc::SIGUSR1), &[]);
        assert_eq!(events.take_pending().len(), 1);
        events.begin_cycle();
        events.fire(&Event::Signal(libc::SIGUSR1), &[]);
        assert_eq!(events.take_pending().len(), 1);
    }

    #[test]
    fn recursive_variable_fire_is_suppressed() {
        let mut events = EventDispatcher::new();
        events.register(EventPattern::Variable("status".into()), "on_status");
        events.firing_variables.insert("status".into());
        events.fire(&Event::Variable("status".into()), &[]);
        assert!(!events.has_pending());
        events.firing_variables.clear();
        events.fire(&Event::Variable("status".into()), &[]);
        assert_eq!(events.take_pending().len(), 1);
    }

    #[test]
    fn remove_function_drops_all_its_registrations() {
        let mut events = EventDispatcher::new();
        events.register(EventPattern::AnySignal, "gone");
        events.register(EventPattern::Variable("v".into()), "gone");
        events.register(EventPattern::Variable("v".into()), "kept");
        events.remove_function("gone");
        assert_eq!(events.handler_count(), 1);
        events.fire(&Event::Variable("v".into()), &[]);
        assert_eq!(events.take_pending()[0].function, "kept");
    }
}
