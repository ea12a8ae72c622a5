//! Separating redirection operators from command arguments.
//!
//! Operates on expanded argument strings and produces io-chain entries in
//! the order written, which is what makes `3>&1 1>log` mean what POSIX says
//! it means.
//!
//! Handles: `>`, `>>`, `<`, `2>`, `2>>`, `N>&M`, `N>&-`, `2>&1`, `1>&2`,
//! and the stderr shorthands `^` and `^^`.

use crate::io::{IoChain, IoMode, IoRedirect};

fn write_flags(append: bool) -> libc::c_int {
    if append {
        libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND
    } else {
        libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC
    }
}

/// What one token asked for, before its target is known.
enum Op {
    ReadFile(i32),
    WriteFile { fd: i32, append: bool },
    DupFd { fd: i32, src: i32 },
    CloseFd(i32),
}

/// Try to read a redirection operator from the start of a token. Returns
/// the operation and the rest of the token (an attached target, possibly
/// empty).
fn parse_operator(token: &str) -> Option<(Op, &str)> {
    let (fd, rest) = match token.chars().next() {
        Some(c) if c.is_ascii_digit() && token[1..].starts_with(['>', '<']) => {
            (Some(c.to_digit(10).unwrap() as i32), &token[1..])
        }
        _ => (None, token),
    };

    if let Some(rest) = rest.strip_prefix(">&") {
        let fd = fd.unwrap_or(1);
        if rest == "-" {
            return Some((Op::CloseFd(fd), ""));
        }
        if let Ok(src) = rest.parse::<i32>() {
            return Some((Op::DupFd { fd, src }, ""));
        }
        return None;
    }
    if let Some(rest) = rest.strip_prefix(">>") {
        return Some((
            Op::WriteFile {
                fd: fd.unwrap_or(1),
                append: true,
            },
            rest,
        ));
    }
    if let Some(rest) = rest.strip_prefix('>') {
        return Some((
            Op::WriteFile {
                fd: fd.unwrap_or(1),
                append: false,
            },
            rest,
        ));
    }
    if fd.is_none() {
        if let Some(rest) = token.strip_prefix("^^") {
            return Some((Op::WriteFile { fd: 2, append: true }, rest));
        }
        if let Some(rest) = token.strip_prefix('^') {
            return Some((Op::WriteFile { fd: 2, append: false }, rest));
        }
    }
    if let Some(rest) = rest.strip_prefix('<') {
        return Some((Op::ReadFile(fd.unwrap_or(0)), rest));
    }

    None
}

/// Separate redirections from regular arguments. Returns
/// `(args, io_chain)` or an error message for syntax errors.
pub fn extract_redirections(tokens: &[String]) -> Result<(Vec<String>, IoChain), String> {
    let mut args = Vec::new();
    let mut chain = IoChain::new();
    let mut i = 0;

    while i < tokens.len() {
        let token = &tokens[i];
        let Some((op, attached)) = parse_operator(token) else {
            args.push(token.clone());
            i += 1;
            continue;
        };

        match op {
            Op::DupFd { fd, src } => {
                chain.append(IoRedirect::new(
                    fd,
                    IoMode::Fd {
                        src,
                        close_src: false,
                    },
                ));
            }
            Op::CloseFd(fd) => {
                chain.append(IoRedirect::new(fd, IoMode::Close));
            }
            Op::ReadFile(fd) => {
                let path = take_target(attached, tokens, &mut i, token)?;
                chain.append(IoRedirect::new(
                    fd,
                    IoMode::File {
                        path,
                        flags: libc::O_RDONLY,
                    },
                ));
            }
            Op::WriteFile { fd, append } => {
                let path = take_target(attached, tokens, &mut i, token)?;
                chain.append(IoRedirect::new(
                    fd,
                    IoMode::File {
                        path,
                        flags: write_flags(append),
                    },
                ));
            }
        }
        i += 1;
    }

    Ok((args, chain))
}

fn take_target(
    attached: &str,
    tokens: &[String],
    i: &mut usize,
    operator: &str,
) -> Result<String, String> {
    if !attached.is_empty() {
        return Ok(attached.to_string());
    }
    *i += 1;
    if *i < tokens.len() {
        Ok(tokens[*i].clone())
    } else {
        Err(format!(
            "reef: syntax error: expected a file name after '{operator}'"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(tokens: &[&str]) -> (Vec<String>, IoChain) {
        let owned: Vec<String> = tokens.iter().map(|s| s.to_string()).collect();
        extract_redirections(&owned).unwrap()
    }

    #[test]
    fn simple_stdout_redirect() {
        let (args, chain) = run(&["echo", "hello", ">", "out.txt"]);
        assert_eq!(args, vec!["echo", "hello"]);
        assert_eq!(chain.len(), 1);
        let entry = chain.lookup(1).unwrap();
        assert!(matches!(&entry.mode, IoMode::File { path, .. } if path == "out.txt"));
    }

    #[test]
    fn append_redirect_sets_append_flag() {
        let (_, chain) = run(&["echo", "hello", ">>", "out.txt"]);
        let entry = chain.lookup(1).unwrap();
        let IoMode::File { flags, .. } = entry.mode else {
            panic!("expected file entry");
        };
        assert_ne!(flags & libc::O_APPEND, 0);
    }

    #[test]
    fn stdin_redirect() {
        let (args, chain) = run(&["sort", "<", "data.txt"]);
        assert_eq!(args, vec!["sort"]);
        let entry = chain.lookup(0).unwrap();
        assert!(matches!(&entry.mode, IoMode::File { path, .. } if path == "data.txt"));
    }

    #[test]
    fn stderr_redirect_with_attached_path() {
        let (args, chain) = run(&["ls", "/bad", "2>err.txt"]);
        assert_eq!(args, vec!["ls", "/bad"]);
        let entry = chain.lookup(2).unwrap();
        assert!(matches!(&entry.mode, IoMode::File { path, .. } if path == "err.txt"));
    }

    #[test]
    fn caret_is_stderr_shorthand() {
        let (_, chain) = run(&["cmd", "^", "err.txt"]);
        assert!(chain.lookup(2).is_some());
        let (_, chain) = run(&["cmd", "^^trace.log"]);
        let IoMode::File { flags, .. } = chain.lookup(2).unwrap().mode else {
            panic!();
        };
        assert_ne!(flags & libc::O_APPEND, 0);
    }

    #[test]
    fn stderr_to_stdout_dup() {
        let (args, chain) = run(&["ls", "2>&1"]);
        assert_eq!(args, vec!["ls"]);
        let entry = chain.lookup(2).unwrap();
        assert!(matches!(entry.mode, IoMode::Fd { src: 1, .. }));
    }

    #[test]
    fn fd_close_operator() {
        let (_, chain) = run(&["cmd", "2>&-"]);
        assert!(matches!(chain.lookup(2).unwrap().mode, IoMode::Close));
    }

    #[test]
    fn later_entries_override_earlier_for_same_fd() {
        let (_, chain) = run(&["cmd", "3>&1", "1>", "log"]);
        assert_eq!(chain.len(), 2);
        assert!(matches!(chain.lookup(3).unwrap().mode, IoMode::Fd { src: 1, .. }));
        assert!(matches!(chain.lookup(1).unwrap().mode, IoMode::File { .. }));
        // Order preserved: the fd-3 dup comes first.
        let order: Vec<i32> = chain.iter().map(|e| e.fd).collect();
        assert_eq!(order, vec![3, 1]);
    }

    #[test]
    fn missing_filename_is_error() {
        let tokens: Vec<String> = vec!["echo".into(), ">".into()];
        assert!(extract_redirections(&tokens).is_err());
    }

    #[test]
    fn plain_words_pass_through() {
        let (args, chain) = run(&["grep", "a>b", "file"]);
        assert_eq!(args, vec!["grep", "a>b", "file"]);
        assert!(chain.is_empty());
    }
}
