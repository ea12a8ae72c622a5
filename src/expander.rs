//! Word expansion: tilde, variables, arrays, command substitution, glob.
//!
//! Expansion decisions follow the quoting context recorded by the parser:
//! single quotes are literal, double quotes expand variables but never
//! glob, and unquoted text gets the full pipeline. Array variables expand
//! to one argument per element when they stand alone unquoted, and join
//! with spaces inside double quotes.

use crate::env::{split_array, ARRAY_SEP};
use crate::executor;
use crate::parser::{Word, WordSegment};
use crate::shell::Shell;

/// Expand a list of parsed words into final argument strings.
pub fn expand_words(shell: &mut Shell, words: &[Word]) -> Result<Vec<String>, String> {
    let mut result = Vec::new();
    for word in words {
        result.extend(expand_word(shell, word)?);
    }
    Ok(result)
}

/// Expand a single word (which may have mixed quoting) into one or more
/// arguments.
fn expand_word(shell: &mut Shell, segments: &Word) -> Result<Vec<String>, String> {
    // A lone unquoted `$var` expands to one argument per array element.
    if let [WordSegment::Unquoted(text)] = segments.as_slice() {
        if let Some(name) = text.strip_prefix('$') {
            if is_var_name(name) {
                return Ok(lookup_elements(shell, name));
            }
        }
    }

    let mut combined = String::new();
    let mut is_globbable = false;

    for segment in segments {
        match segment {
            WordSegment::SingleQuoted(text) => {
                // No expansion — everything literal
                combined.push_str(text);
            }
            WordSegment::DoubleQuoted(text) => {
                // Variable expansion only — no tilde, no glob
                combined.push_str(&expand_variables(shell, text, " "));
            }
            WordSegment::Unquoted(text) => {
                // Full pipeline: substitution → tilde → variable → glob
                let substituted = expand_substitutions(shell, text)?;
                let expanded = expand_tilde(shell, &substituted);
                let expanded = expand_variables(shell, &expanded, " ");
                if contains_glob_chars(&expanded) {
                    is_globbable = true;
                }
                combined.push_str(&expanded);
            }
        }
    }

    // A standalone substitution left one piece per output line, separated
    // the same way arrays are.
    let pieces = combined.split(ARRAY_SEP).map(str::to_string);
    if is_globbable {
        Ok(pieces.flat_map(|piece| expand_globs(&piece)).collect())
    } else {
        Ok(pieces.collect())
    }
}

fn is_var_name(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !s.starts_with(|c: char| c.is_ascii_digit())
}

fn lookup_elements(shell: &Shell, name: &str) -> Vec<String> {
    match shell.var(name) {
        Some(value) if value.is_empty() => vec![String::new()],
        Some(value) => split_array(&value),
        None => Vec::new(),
    }
}

// ── Command substitution ──

/// Replace `(command)` spans with the command's captured output. The output
/// is split on newlines; elements re-join with the array separator so a
/// standalone substitution expands to one argument per line.
fn expand_substitutions(shell: &mut Shell, input: &str) -> Result<String, String> {
    let Some(open) = input.find('(') else {
        return Ok(input.to_string());
    };
    let mut depth = 0;
    let mut close = None;
    for (offset, ch) in input[open..].char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(open + offset);
                    break;
                }
            }
            _ => {}
        }
    }
    let Some(close) = close else {
        return Err("unbalanced parenthesis in command substitution".to_string());
    };

    let inner = &input[open + 1..close];
    let (status, lines) = executor::exec_subshell(shell, inner);
    let _ = status;
    let replacement = if open == 0 && close == input.len() - 1 {
        lines.join(&ARRAY_SEP.to_string())
    } else {
        lines.join(" ")
    };

    let mut out = String::new();
    out.push_str(&input[..open]);
    out.push_str(&replacement);
    let tail = expand_substitutions(shell, &input[close + 1..])?;
    out.push_str(&tail);
    Ok(out)
}

// ── Tilde Expansion ──

fn expand_tilde(shell: &Shell, token: &str) -> String {
    if !token.starts_with('~') {
        return token.to_string();
    }

    let home = shell.var("HOME").unwrap_or_else(|| "~".to_string());

    if token == "~" {
        return home;
    }

    if let Some(rest) = token.strip_prefix("~/") {
        return format!("{home}/{rest}");
    }

    // ~username not supported — return as-is
    token.to_string()
}

// ── Variable Expansion ──

/// Expand `$name` occurrences. Array values join with `joiner`.
fn expand_variables(shell: &Shell, input: &str, joiner: &str) -> String {
    let mut result = String::new();
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }

        match chars.peek() {
            Some(&c) if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::new();
                name.push(chars.next().unwrap());
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(chars.next().unwrap());
                    } else {
                        break;
                    }
                }
                if let Some(value) = shell.var(&name) {
                    let joined = value
                        .split(ARRAY_SEP)
                        .collect::<Vec<&str>>()
                        .join(joiner);
                    result.push_str(&joined);
                }
            }
            _ => {
                // $ followed by something that's not a variable start — literal
                result.push('$');
            }
        }
    }

    result
}

// ── Glob Expansion ──

fn contains_glob_chars(s: &str) -> bool {
    s.contains('*') || s.contains('?') || s.contains('[')
}

fn expand_globs(pattern: &str) -> Vec<String> {
    match glob::glob(pattern) {
        Ok(paths) => {
            let mut matches: Vec<String> = paths
                .filter_map(|entry| entry.ok())
                .map(|path| path.to_string_lossy().into_owned())
                .collect();

            if matches.is_empty() {
                // No matches — keep the pattern literal
                vec![pattern.to_string()]
            } else {
                matches.sort();
                matches
            }
        }
        Err(_) => vec![pattern.to_string()],
    }
}
