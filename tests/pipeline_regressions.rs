use std::io::Write;
use std::process::{Command, Stdio};

fn run_shell(lines: &[&str]) -> std::process::Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_reef"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("REEF_SOCKET_DIR", std::env::temp_dir())
        .env("USER", format!("reef-test-absent-{}", std::process::id()))
        .spawn()
        .expect("spawn reef");

    {
        let stdin = child.stdin.as_mut().expect("stdin");
        for line in lines {
            writeln!(stdin, "{line}").expect("write line");
        }
        writeln!(stdin, "exit").expect("write exit");
    }

    child.wait_with_output().expect("wait output")
}

#[test]
fn builtin_to_external_pipeline_outputs() {
    let output = run_shell(&["echo hi | cat"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("hi"), "stdout was: {stdout}");
}

#[test]
fn pipeline_status_comes_from_last_process() {
    let output = run_shell(&["echo hi | cat", "echo STATUS:$status"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("STATUS:0"), "stdout was: {stdout}");
}

#[test]
fn failed_command_sets_status_and_echo_resets_it() {
    let output = run_shell(&["false", "echo $status", "echo $status"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    // First echo sees 1; the echo itself succeeds, so the second sees 0.
    assert!(stdout.contains("1\n"), "stdout was: {stdout}");
    assert!(stdout.contains("0\n"), "stdout was: {stdout}");
}

#[test]
fn signal_death_maps_to_128_plus_signal() {
    let output = run_shell(&["sh -c 'kill -TERM $$'", "echo STATUS:$status"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("STATUS:143"), "stdout was: {stdout}");
}

#[test]
fn not_prefix_negates_the_result() {
    let output = run_shell(&["not false", "echo FIRST:$status", "not true", "echo SECOND:$status"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("FIRST:0"), "stdout was: {stdout}");
    assert!(stdout.contains("SECOND:1"), "stdout was: {stdout}");
}

#[test]
fn stdout_redirection_writes_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    let cmd = format!("echo captured > {}", path.display());
    let output = run_shell(&[cmd.as_str(), "echo DONE:$status"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("DONE:0"), "stdout was: {stdout}");
    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents, "captured\n");
}

#[test]
fn append_redirection_accumulates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.txt");
    let first = format!("echo one > {}", path.display());
    let second = format!("echo two >> {}", path.display());
    run_shell(&[first.as_str(), second.as_str()]);
    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents, "one\ntwo\n");
}

#[test]
fn stdin_redirection_feeds_the_command() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("input.txt");
    std::fs::write(&path, "from the file\n").unwrap();
    let cmd = format!("cat < {}", path.display());
    let output = run_shell(&[cmd.as_str()]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("from the file"), "stdout was: {stdout}");
}

#[test]
fn stderr_pipes_into_next_command_via_dup() {
    let output = run_shell(&["sh -c 'echo oops 1>&2' 2>&1 | cat"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stdout.contains("oops"), "stdout was: {stdout}");
    assert!(!stderr.contains("oops"), "stderr was: {stderr}");
}

#[test]
fn later_redirections_override_earlier_ones() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.txt");
    let second = dir.path().join("second.txt");
    let cmd = format!(
        "echo routed > {} > {}",
        first.display(),
        second.display()
    );
    run_shell(&[cmd.as_str()]);
    assert_eq!(std::fs::read_to_string(&second).unwrap(), "routed\n");
    assert_eq!(std::fs::read_to_string(&first).unwrap(), "");
}

#[test]
fn function_definition_and_call() {
    let output = run_shell(&["function greet; echo \"hi $argv\"; end; greet world"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("hi world"), "stdout was: {stdout}");
    let output = run_shell(&["function greet; echo \"hi $argv\"; end", "greet world", "echo STATUS:$status"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("hi world"), "stdout was: {stdout}");
    assert!(stdout.contains("STATUS:0"), "stdout was: {stdout}");
}

#[test]
fn multi_line_function_definition() {
    let output = run_shell(&[
        "function count",
        "echo one",
        "echo two",
        "end",
        "count",
    ]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("one\ntwo"), "stdout was: {stdout}");
}

#[test]
fn function_arguments_are_scoped() {
    let output = run_shell(&[
        "set -g argv outer",
        "function show; echo inner:$argv; end",
        "show a b",
        "echo outer:$argv",
    ]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("inner:a b"), "stdout was: {stdout}");
    assert!(stdout.contains("outer:outer"), "stdout was: {stdout}");
}

#[test]
fn function_in_pipeline_feeds_downstream() {
    let output = run_shell(&[
        "function shout; echo loud; end",
        "shout | tr a-z A-Z",
    ]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("LOUD"), "stdout was: {stdout}");
}

#[test]
fn begin_block_shares_one_redirection() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("block.txt");
    let cmd = format!("begin; echo first; echo second; end > {}", path.display());
    run_shell(&[cmd.as_str()]);
    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents, "first\nsecond\n");
}

#[test]
fn begin_block_pipes_into_command() {
    let output = run_shell(&["begin; echo b; echo a; end | sort"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("a\nb"), "stdout was: {stdout}");
}

#[test]
fn command_substitution_expands_output() {
    let output = run_shell(&["echo prefix-(echo inner)-suffix"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("prefix-inner-suffix"), "stdout was: {stdout}");
}

#[test]
fn command_substitution_preserves_outer_status() {
    let output = run_shell(&["true", "echo (false)visible", "echo STATUS:$status"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("visible"), "stdout was: {stdout}");
    // $status reflects the outer echo, not the substitution.
    assert!(stdout.contains("STATUS:0"), "stdout was: {stdout}");
}

#[test]
fn unknown_command_reports_127() {
    let output = run_shell(&["definitely-not-a-command-xyz", "echo STATUS:$status"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stdout.contains("STATUS:127"), "stdout was: {stdout}");
    assert!(stderr.contains("command not found"), "stderr was: {stderr}");
}

#[test]
fn redirection_open_failure_is_childs_exit_code() {
    let output = run_shell(&[
        "sh -c 'echo should-not-appear' < /definitely/not/here",
        "echo STATUS:$status",
    ]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("should-not-appear"), "stdout was: {stdout}");
    assert!(stdout.contains("STATUS:1"), "stdout was: {stdout}");
}

#[test]
fn set_and_expand_variables() {
    let output = run_shell(&["set color teal", "echo picked:$color"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("picked:teal"), "stdout was: {stdout}");
}

#[test]
fn set_array_variables_expand_per_element() {
    let output = run_shell(&[
        "set items one two three",
        "echo $items",
        "sh -c 'echo argc:$#' ignored $items",
    ]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("one two three"), "stdout was: {stdout}");
    // Each element became its own argument to sh.
    assert!(stdout.contains("argc:3"), "stdout was: {stdout}");
}

#[test]
fn exported_variables_reach_children() {
    let output = run_shell(&["set -x REEF_PROBE deep", "sh -c 'echo probe:$REEF_PROBE'"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("probe:deep"), "stdout was: {stdout}");
}

#[test]
fn unexported_variables_do_not_reach_children() {
    let output = run_shell(&["set REEF_LOCAL shallow", "sh -c 'echo probe:[$REEF_LOCAL]'"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("probe:[]"), "stdout was: {stdout}");
}

#[test]
fn sigpipe_downstream_close_completes_job() {
    let output = run_shell(&["sh -c 'yes 2>/dev/null' | head -n 1", "echo STATUS:$status"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("y"), "stdout was: {stdout}");
    assert!(stdout.contains("STATUS:0"), "stdout was: {stdout}");
}

#[test]
fn exit_reports_requested_code() {
    let mut child = Command::new(env!("CARGO_BIN_EXE_reef"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("REEF_SOCKET_DIR", std::env::temp_dir())
        .env("USER", format!("reef-test-exit-{}", std::process::id()))
        .spawn()
        .expect("spawn reef");
    {
        let stdin = child.stdin.as_mut().unwrap();
        writeln!(stdin, "exit 3").unwrap();
    }
    let output = child.wait_with_output().unwrap();
    assert_eq!(output.status.code(), Some(3));
}
