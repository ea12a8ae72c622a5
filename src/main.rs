use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::Stdio;

use log::{debug, warn};

use reef::event::Event;
use reef::io::IoChain;
use reef::shell::Shell;
use reef::universal::UniversalClient;
use reef::{eval, job_control, jobs, parser, signals};

/// Start the universal variable daemon next to this binary. The daemon
/// outlives the shell; our reaper quietly discards it if it exits early.
fn spawn_daemon() {
    let Some(path) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("reefd")))
    else {
        return;
    };
    match std::process::Command::new(&path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(_child) => debug!("started universal variable daemon"),
        Err(err) => warn!("could not start {}: {err}", path.display()),
    }
}

/// Take a process group of our own and grab the terminal, so job-control
/// signals target our jobs rather than whatever launched us.
fn claim_terminal() {
    unsafe {
        let pid = libc::getpid();
        libc::setpgid(pid, pid);
        let _ = libc::signal(libc::SIGTTOU, libc::SIG_IGN);
        libc::tcsetpgrp(libc::STDIN_FILENO, pid);
        let _ = libc::signal(libc::SIGTTOU, libc::SIG_DFL);
    }
}

fn shutdown(shell: &mut Shell) {
    if shell.interactive {
        if let Some(modes) = shell.saved_termios {
            job_control::restore_termios(libc::STDIN_FILENO, &modes);
        }
    }
    shell.universal.destroy();
}

fn main() {
    env_logger::init();

    let interactive = unsafe { libc::isatty(libc::STDIN_FILENO) } == 1;
    if interactive {
        claim_terminal();
    }

    let socket_dir = std::env::var_os("REEF_SOCKET_DIR").map(PathBuf::from);
    let user = std::env::var("USER").unwrap_or_else(|_| "nobody".to_string());
    // Scripts join an existing server but should not fork one of their own.
    let spawner: Option<reef::universal::SpawnDaemon> = if interactive {
        Some(Box::new(spawn_daemon))
    } else {
        None
    };
    let universal = UniversalClient::init(socket_dir.as_deref(), &user, spawner);

    let mut shell = Shell::new(eval::eval_source, universal);
    if let Err(err) = signals::install_handlers(shell.interactive) {
        eprintln!("reef: failed to install signal handlers: {err}");
    }

    // reef -c 'commands…'
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        if args[1] == "-c" {
            let command = args[2..].join(" ");
            let code = eval::eval_source(&mut shell, &command, &IoChain::new());
            jobs::reap(&mut shell, false, false);
            shutdown(&mut shell);
            std::process::exit(shell.exit_requested.unwrap_or(code));
        }
        eprintln!("reef: unknown argument: {}", args[1]);
        std::process::exit(2);
    }

    let stdin = std::io::stdin();
    let mut pending = String::new();

    loop {
        if let Some(code) = shell.exit_requested {
            shutdown(&mut shell);
            std::process::exit(code);
        }

        // Prompt-time housekeeping: reap with notifications, pull
        // universal updates, dispatch pending signals, run queued event
        // handlers.
        jobs::reap(&mut shell, false, true);
        shell.pump_universal();
        if signals::take_interrupt() {
            shell.events.fire(
                &Event::Signal(libc::SIGINT),
                &["SIGNAL".to_string(), libc::SIGINT.to_string()],
            );
        }
        if signals::take_winch() {
            shell.events.fire(
                &Event::Signal(libc::SIGWINCH),
                &["SIGNAL".to_string(), libc::SIGWINCH.to_string()],
            );
        }
        shell.service_events();

        if shell.interactive {
            let prompt = if pending.is_empty() { "reef> " } else { "      " };
            print!("{prompt}");
            if std::io::stdout().flush().is_err() {
                break;
            }
        }

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                if !pending.is_empty() {
                    eprintln!("reef: missing 'end'");
                }
                break;
            }
            Ok(_) => {
                pending.push_str(&line);
                if pending.trim().is_empty() {
                    pending.clear();
                    continue;
                }
                // Multi-line constructs: keep reading until the block
                // structure balances.
                match parser::parse_source(&pending) {
                    Err(msg) if msg == "missing 'end'" => continue,
                    _ => {}
                }
                let source = std::mem::take(&mut pending);
                eval::eval_source(&mut shell, &source, &IoChain::new());
            }
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {
                // The reader discards its in-progress line on SIGINT.
                pending.clear();
                if shell.interactive {
                    println!();
                }
            }
            Err(error) => {
                eprintln!("reef: error reading input: {error}");
                break;
            }
        }
    }

    let code = shell.exit_requested.unwrap_or(shell.last_status());
    shutdown(&mut shell);
    std::process::exit(code);
}
