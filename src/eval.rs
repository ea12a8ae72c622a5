//! The evaluator: turn parsed statements into jobs and run them.
//!
//! This is the function installed as the shell's evaluator callback at
//! startup, so the executor (and event servicing, and `source`) can
//! re-enter evaluation without depending on this module directly.

use log::debug;

use crate::builtins;
use crate::event::EventPattern;
use crate::executor;
use crate::expander;
use crate::io::IoChain;
use crate::jobs::{Process, ProcessType};
use crate::parser::{self, word_text, Pipeline, Segment, Statement};
use crate::redirect;
use crate::shell::Shell;

/// Evaluate a source string against the given block-level io chain.
/// Returns the resulting `$status`.
pub fn eval_source(shell: &mut Shell, source: &str, block_io: &IoChain) -> i32 {
    let statements = match parser::parse_source(source) {
        Ok(statements) => statements,
        Err(msg) => {
            eprintln!("reef: {msg}");
            shell.set_last_status(1);
            return 1;
        }
    };

    for statement in statements {
        if shell.exit_requested.is_some() {
            break;
        }
        match statement {
            Statement::FunctionDef { header, body } => {
                define_function(shell, &header, &body);
            }
            Statement::Pipeline(pipeline) => {
                run_pipeline(shell, pipeline, block_io);
            }
        }
        shell.service_events();
    }

    shell.last_status()
}

fn signal_by_name(name: &str) -> Option<i32> {
    if let Ok(number) = name.parse::<i32>() {
        return Some(number);
    }
    let trimmed = name.strip_prefix("SIG").unwrap_or(name);
    let sig = match trimmed {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "TERM" => libc::SIGTERM,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        "WINCH" => libc::SIGWINCH,
        "CHLD" => libc::SIGCHLD,
        "ALRM" => libc::SIGALRM,
        _ => return None,
    };
    Some(sig)
}

/// Handle a `function name [--on-… arg]…; body; end` definition: store the
/// body and push any event registrations into the dispatcher.
fn define_function(shell: &mut Shell, header: &[parser::Word], body: &str) {
    let args = match expander::expand_words(shell, header) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("reef: {msg}");
            shell.set_last_status(1);
            return;
        }
    };
    let Some(name) = args.first().cloned() else {
        eprintln!("reef: function: missing name");
        shell.set_last_status(1);
        return;
    };

    shell.define_function(&name, body);

    let mut idx = 1;
    while idx < args.len() {
        let option = args[idx].as_str();
        let needs_value = matches!(
            option,
            "--on-variable" | "--on-signal" | "--on-process-exit" | "--on-job-exit"
                | "--description" | "-d"
        );
        if !needs_value {
            eprintln!("reef: function: unknown option {option}");
            shell.set_last_status(1);
            return;
        }
        let Some(value) = args.get(idx + 1) else {
            eprintln!("reef: function: {option} requires an argument");
            shell.set_last_status(1);
            return;
        };
        match option {
            "--on-variable" => shell
                .events
                .register(EventPattern::Variable(value.clone()), &name),
            "--on-signal" => match signal_by_name(value) {
                Some(sig) => shell.events.register(EventPattern::Signal(sig), &name),
                None => {
                    eprintln!("reef: function: unknown signal {value}");
                    shell.set_last_status(1);
                    return;
                }
            },
            "--on-process-exit" => match value.parse::<i32>() {
                Ok(pid) => shell.events.register(EventPattern::ProcessExit(pid), &name),
                Err(_) => {
                    eprintln!("reef: function: invalid process id {value}");
                    shell.set_last_status(1);
                    return;
                }
            },
            "--on-job-exit" => match value.parse::<i32>() {
                Ok(id) => shell.events.register(EventPattern::JobExit(id), &name),
                Err(_) => {
                    eprintln!("reef: function: invalid job id {value}");
                    shell.set_last_status(1);
                    return;
                }
            },
            // Descriptions are accepted and dropped.
            _ => {}
        }
        idx += 2;
    }

    shell.set_last_status(0);
}

/// Display text for a pipeline, used by `jobs` and notifications.
fn render_command(pipeline: &Pipeline) -> String {
    let mut parts: Vec<String> = Vec::new();
    for segment in &pipeline.segments {
        match segment {
            Segment::Simple(words) => {
                parts.push(
                    words
                        .iter()
                        .map(word_text)
                        .collect::<Vec<String>>()
                        .join(" "),
                );
            }
            Segment::Block { .. } => parts.push("begin ... end".to_string()),
        }
    }
    let mut text = parts.join(" | ");
    if pipeline.negate {
        text = format!("not {text}");
    }
    text
}

fn run_pipeline(shell: &mut Shell, pipeline: Pipeline, block_io: &IoChain) {
    let command_text = render_command(&pipeline);
    let mut job = shell.jobs.create(&command_text, !pipeline.background);
    job.negate = pipeline.negate;

    for segment in &pipeline.segments {
        match segment {
            Segment::Simple(words) => {
                let expanded = match expander::expand_words(shell, words) {
                    Ok(expanded) => expanded,
                    Err(msg) => {
                        eprintln!("reef: {msg}");
                        shell.set_last_status(1);
                        return;
                    }
                };
                let (args, chain) = match redirect::extract_redirections(&expanded) {
                    Ok(result) => result,
                    Err(msg) => {
                        eprintln!("{msg}");
                        shell.set_last_status(1);
                        return;
                    }
                };
                if args.is_empty() {
                    eprintln!("reef: expansion produced an empty command");
                    shell.set_last_status(1);
                    return;
                }
                job.io.extend_from(&chain);

                let mut process = if args[0] == "exec" {
                    if args.len() == 1 {
                        eprintln!("reef: exec: missing command");
                        shell.set_last_status(1);
                        return;
                    }
                    let mut process =
                        Process::new(ProcessType::Exec, args[1..].to_vec());
                    process.actual_cmd = builtins::find_in_path(shell, &args[1])
                        .map(|p| p.to_string_lossy().into_owned());
                    process
                } else if shell.functions.contains_key(&args[0]) {
                    Process::new(ProcessType::Function, args)
                } else if builtins::is_builtin(&args[0]) {
                    Process::new(ProcessType::Builtin, args)
                } else {
                    let mut process = Process::new(ProcessType::External, args);
                    process.actual_cmd = builtins::find_in_path(shell, &process.argv[0])
                        .map(|p| p.to_string_lossy().into_owned());
                    process
                };
                process.pipe_fd = 1;
                job.processes.push(process);
            }
            Segment::Block {
                body,
                redirect_words,
            } => {
                let expanded = match expander::expand_words(shell, redirect_words) {
                    Ok(expanded) => expanded,
                    Err(msg) => {
                        eprintln!("reef: {msg}");
                        shell.set_last_status(1);
                        return;
                    }
                };
                let (leftover, chain) = match redirect::extract_redirections(&expanded) {
                    Ok(result) => result,
                    Err(msg) => {
                        eprintln!("{msg}");
                        shell.set_last_status(1);
                        return;
                    }
                };
                if !leftover.is_empty() {
                    eprintln!("reef: unexpected arguments after 'end'");
                    shell.set_last_status(1);
                    return;
                }
                job.io.extend_from(&chain);
                let mut process = Process::new(ProcessType::Block, vec![body.clone()]);
                process.pipe_fd = 1;
                job.processes.push(process);
            }
        }
    }

    if job.processes.is_empty() {
        return;
    }
    if job.processes.len() > 1
        && job
            .processes
            .iter()
            .any(|p| p.ptype == ProcessType::Exec)
    {
        eprintln!("reef: exec is only valid as the sole command of a job");
        shell.set_last_status(1);
        return;
    }

    debug!("eval pipeline '{command_text}'");
    executor::exec_job(shell, job, block_io);
}
