//! Builtin commands.
//!
//! Every builtin is `(shell, argv) -> status`, executed with stdin bound to
//! an fd and stdout/stderr bound to the in-memory buffers of the current
//! builtin IO frame; the executor decides afterwards where those bytes go.
//! Job-control builtins (`fg`, `bg`, `jobs`, `wait`) work on the job list
//! directly.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::env::{join_array, split_array, Scope};
use crate::io::IoChain;
use crate::jobs::{self, job_continue};
use crate::shell::Shell;

/// The list of all builtin command names.
const BUILTINS: &[&str] = &[
    "cd", "pwd", "exit", "echo", "set", "jobs", "fg", "bg", "wait", "type", "source",
    "functions",
];

/// Returns true if the command name is a shell builtin.
pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

/// Execute a builtin against the current builtin IO frame. Returns the
/// exit code.
pub fn run(shell: &mut Shell, argv: &[String]) -> i32 {
    let Some(program) = argv.first() else {
        return 1;
    };
    let args = &argv[1..];
    match program.as_str() {
        "cd" => builtin_cd(shell, args),
        "pwd" => builtin_pwd(shell),
        "exit" => builtin_exit(shell, args),
        "echo" => builtin_echo(shell, args),
        "set" => builtin_set(shell, args),
        "jobs" => builtin_jobs(shell),
        "fg" => builtin_fg(shell, args),
        "bg" => builtin_bg(shell, args),
        "wait" => builtin_wait(shell, args),
        "type" => builtin_type(shell, args),
        "source" => builtin_source(shell, args),
        "functions" => builtin_functions(shell, args),
        _ => {
            let _ = writeln!(shell.builtin_err(), "reef: unknown builtin: {program}");
            1
        }
    }
}

fn builtin_cd(shell: &mut Shell, args: &[String]) -> i32 {
    let target = match args.first() {
        Some(dir) if dir == "-" => match shell.var("OLDPWD") {
            Some(prev) => prev,
            None => {
                let _ = writeln!(shell.builtin_err(), "cd: OLDPWD not set");
                return 1;
            }
        },
        Some(dir) => dir.clone(),
        None => match shell.var("HOME") {
            Some(home) => home,
            None => {
                let _ = writeln!(shell.builtin_err(), "cd: HOME not set");
                return 1;
            }
        },
    };

    let previous = std::env::current_dir().ok();

    if let Err(err) = std::env::set_current_dir(&target) {
        let _ = writeln!(shell.builtin_err(), "cd: {target}: {err}");
        return 1;
    }

    if let Some(prev) = previous {
        shell.set_var(
            "OLDPWD",
            &prev.to_string_lossy(),
            Scope::Global,
            Some(true),
        );
    }
    if let Ok(cwd) = std::env::current_dir() {
        shell.set_var("PWD", &cwd.to_string_lossy(), Scope::Global, Some(true));
    }

    0
}

fn builtin_pwd(shell: &mut Shell) -> i32 {
    match std::env::current_dir() {
        Ok(path) => {
            let _ = writeln!(shell.builtin_out(), "{}", path.display());
            0
        }
        Err(err) => {
            let _ = writeln!(shell.builtin_err(), "pwd: {err}");
            1
        }
    }
}

fn builtin_exit(shell: &mut Shell, args: &[String]) -> i32 {
    let code = match args.first() {
        None => shell.last_status(),
        Some(s) => match s.parse::<i32>() {
            Ok(code) => code,
            Err(_) => {
                let _ = writeln!(shell.builtin_err(), "exit: {s}: numeric argument required");
                2
            }
        },
    };
    shell.exit_requested = Some(code);
    code
}

fn builtin_echo(shell: &mut Shell, args: &[String]) -> i32 {
    let (newline, rest) = match args.first().map(String::as_str) {
        Some("-n") => (false, &args[1..]),
        _ => (true, args),
    };
    let text = rest.join(" ");
    let out = shell.builtin_out();
    let _ = if newline {
        writeln!(out, "{text}")
    } else {
        write!(out, "{text}")
    };
    0
}

#[derive(Default)]
struct SetOptions {
    local: bool,
    global: bool,
    universal: bool,
    export: Option<bool>,
    erase: bool,
    query: bool,
}

fn parse_set_options(shell: &mut Shell, args: &[String]) -> Option<(SetOptions, usize)> {
    let mut opts = SetOptions::default();
    let mut idx = 0;
    while idx < args.len() {
        let arg = args[idx].as_str();
        if !arg.starts_with('-') || arg == "--" {
            if arg == "--" {
                idx += 1;
            }
            break;
        }
        for flag in arg.chars().skip(1) {
            match flag {
                'l' => opts.local = true,
                'g' => opts.global = true,
                'U' => opts.universal = true,
                'x' => opts.export = Some(true),
                'u' => opts.export = Some(false),
                'e' => opts.erase = true,
                'q' => opts.query = true,
                _ => {
                    let _ = writeln!(shell.builtin_err(), "set: unknown option -{flag}");
                    return None;
                }
            }
        }
        idx += 1;
    }
    Some((opts, idx))
}

fn builtin_set(shell: &mut Shell, args: &[String]) -> i32 {
    let Some((opts, idx)) = parse_set_options(shell, args) else {
        return 1;
    };
    let rest = &args[idx..];

    if opts.query {
        let missing = rest
            .iter()
            .filter(|name| shell.var(name).is_none())
            .count();
        return missing as i32;
    }

    if opts.erase {
        let mut failed = 0;
        for name in rest {
            if opts.universal {
                shell.erase_universal(name);
            } else if shell.env.get(name).is_some() {
                shell.env.remove(name);
                shell.fire_variable_event(name);
            } else if shell.universal.get(name).is_some() {
                shell.erase_universal(name);
            } else {
                failed += 1;
            }
        }
        return failed;
    }

    if rest.is_empty() {
        // List visible variables, one per line, array elements space-joined.
        let mut lines: Vec<String> = Vec::new();
        for name in shell.env.names() {
            if let Some(value) = shell.var(&name) {
                lines.push(format!("{name} {}", split_array(&value).join(" ")));
            }
        }
        for name in shell.universal.names() {
            if shell.env.get(&name).is_none() {
                if let Some((value, _)) = shell.universal.get(&name) {
                    let rendered = split_array(value).join(" ");
                    lines.push(format!("{name} {rendered}"));
                }
            }
        }
        lines.sort();
        let out = shell.builtin_out();
        for line in lines {
            let _ = writeln!(out, "{line}");
        }
        return 0;
    }

    let name = &rest[0];
    let value = join_array(&rest[1..]);

    if opts.universal {
        shell.set_universal(name, &value, opts.export.unwrap_or(false));
        return 0;
    }

    let scope = if opts.local {
        Scope::Local
    } else if opts.global {
        Scope::Global
    } else {
        Scope::Default
    };
    shell.set_var(name, &value, scope, opts.export);
    0
}

fn builtin_jobs(shell: &mut Shell) -> i32 {
    let mut rows: Vec<(i32, libc::pid_t, &'static str, String)> = Vec::new();
    for job in shell.jobs.iter() {
        if !job.constructed || job.is_completed() {
            continue;
        }
        rows.push((job.job_id, job.pgid, job.state_name(), job.command.clone()));
    }
    rows.sort_by_key(|(id, ..)| *id);

    let out = shell.builtin_out();
    if rows.is_empty() {
        let _ = writeln!(out, "jobs: there are no jobs");
        return 1;
    }
    let _ = writeln!(out, "Job\tGroup\tState\tCommand");
    for (id, pgid, state, command) in rows {
        let _ = writeln!(out, "{id}\t{pgid}\t{state}\t{command}");
    }
    0
}

/// Resolve a `%N`/`N` job designator, or the default job.
fn resolve_job_id(shell: &mut Shell, args: &[String], stopped_only: bool) -> Option<i32> {
    match args.first() {
        None => {
            if stopped_only {
                shell.jobs.default_stopped_job_id()
            } else {
                shell.jobs.default_job_id()
            }
        }
        Some(spec) => {
            let digits = spec.strip_prefix('%').unwrap_or(spec);
            let id = digits.parse::<i32>().ok()?;
            shell.jobs.get(id).map(|j| j.job_id)
        }
    }
}

fn builtin_fg(shell: &mut Shell, args: &[String]) -> i32 {
    let Some(job_id) = resolve_job_id(shell, args, false) else {
        let _ = writeln!(shell.builtin_err(), "fg: no suitable job");
        return 1;
    };
    {
        let job = shell.jobs.get_mut(job_id).unwrap();
        job.fg = true;
        let line = format!("Send job {job_id}, '{}' to foreground", job.command);
        let _ = writeln!(shell.builtin_err(), "{line}");
    }
    job_continue(shell, job_id, true);
    shell.last_status()
}

fn builtin_bg(shell: &mut Shell, args: &[String]) -> i32 {
    let Some(job_id) = resolve_job_id(shell, args, true) else {
        let _ = writeln!(shell.builtin_err(), "bg: no suitable job");
        return 1;
    };
    {
        let job = shell.jobs.get_mut(job_id).unwrap();
        job.fg = false;
        let line = format!("Send job {job_id}, '{}' to background", job.command);
        let _ = writeln!(shell.builtin_err(), "{line}");
    }
    job_continue(shell, job_id, true);
    0
}

fn builtin_wait(shell: &mut Shell, args: &[String]) -> i32 {
    let target = match args.first() {
        Some(spec) => {
            let digits = spec.strip_prefix('%').unwrap_or(spec);
            match digits.parse::<i32>().ok().and_then(|id| shell.jobs.get(id)) {
                Some(job) => Some(job.job_id),
                None => {
                    let _ = writeln!(shell.builtin_err(), "wait: no such job: {spec}");
                    return 1;
                }
            }
        }
        None => None,
    };

    loop {
        let waiting = match target {
            Some(id) => shell
                .jobs
                .get(id)
                .map(|j| !j.is_completed())
                .unwrap_or(false),
            None => shell
                .jobs
                .iter()
                .any(|j| j.constructed && !j.fg && !j.is_completed() && !j.is_stopped()),
        };
        if !waiting {
            break;
        }
        let progressed = jobs::reap(shell, true, false);
        if crate::signals::take_interrupt() {
            return 128 + libc::SIGINT;
        }
        if !progressed {
            break;
        }
    }
    shell.last_status()
}

fn builtin_type(shell: &mut Shell, args: &[String]) -> i32 {
    let mut exit_code = 0;
    for arg in args {
        if shell.functions.contains_key(arg) {
            let _ = writeln!(shell.builtin_out(), "{arg} is a function");
        } else if is_builtin(arg) {
            let _ = writeln!(shell.builtin_out(), "{arg} is a shell builtin");
        } else {
            match find_in_path(shell, arg) {
                Some(path) => {
                    let _ = writeln!(shell.builtin_out(), "{arg} is {}", path.display());
                }
                None => {
                    let _ = writeln!(shell.builtin_err(), "type: {arg}: not found");
                    exit_code = 1;
                }
            }
        }
    }
    exit_code
}

fn builtin_source(shell: &mut Shell, args: &[String]) -> i32 {
    let Some(path) = args.first() else {
        let _ = writeln!(shell.builtin_err(), "source: usage: source FILE");
        return 1;
    };
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            let _ = writeln!(shell.builtin_err(), "source: {path}: {err}");
            return 1;
        }
    };
    shell.env.push(false);
    let status = (shell.evaluator)(shell, &text, &IoChain::new());
    shell.env.pop();
    status
}

fn builtin_functions(shell: &mut Shell, args: &[String]) -> i32 {
    if args.is_empty() {
        let mut names: Vec<&String> = shell.functions.keys().collect();
        names.sort();
        let rendered: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let out = shell.builtin_out();
        for name in rendered {
            let _ = writeln!(out, "{name}");
        }
        return 0;
    }
    let mut exit_code = 0;
    for name in args {
        match shell.functions.get(name).map(|def| def.body.clone()) {
            Some(body) => {
                let _ = writeln!(shell.builtin_out(), "function {name}\n{body}end");
            }
            None => {
                let _ = writeln!(shell.builtin_err(), "functions: {name}: not found");
                exit_code = 1;
            }
        }
    }
    exit_code
}

/// Check if a path points to an executable file.
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    let Ok(meta) = path.metadata() else {
        return false;
    };
    meta.is_file() && meta.permissions().mode() & 0o111 != 0
}

/// Search `$PATH` for an executable with the given name. Names containing a
/// slash resolve relative to the working directory instead.
pub fn find_in_path(shell: &Shell, cmd: &str) -> Option<PathBuf> {
    if cmd.contains('/') {
        let path = PathBuf::from(cmd);
        return is_executable(&path).then_some(path);
    }
    let path_var = shell.var("PATH")?;
    for dir in split_array(&path_var) {
        let full_path = Path::new(&dir).join(cmd);
        if is_executable(&full_path) {
            return Some(full_path);
        }
    }
    None
}
