use std::io::Write;
use std::process::{Command, Stdio};

fn run_shell(lines: &[&str]) -> std::process::Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_reef"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("REEF_SOCKET_DIR", std::env::temp_dir())
        .env("USER", format!("reef-test-jobs-{}", std::process::id()))
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
fn background_job_returns_immediately_and_lists() {
    let output = run_shell(&["sleep 1 &", "echo STATUS:$status", "jobs"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("STATUS:0"), "stdout was: {stdout}");
    // One job, id 1, still running, with its command text.
    let job_line = stdout
        .lines()
        .find(|line| line.contains("sleep 1"))
        .unwrap_or_else(|| panic!("no jobs line in: {stdout}"));
    assert!(job_line.starts_with('1'), "jobs line was: {job_line}");
    assert!(job_line.contains("running"), "jobs line was: {job_line}");
}

#[test]
fn background_completion_is_notified_at_the_prompt() {
    let output = run_shell(&["sh -c 'exit 0' &", "sleep 0.3", "echo marker"]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("has ended"),
        "stderr was: {stderr}"
    );
}

#[test]
fn wait_returns_background_job_exit_status() {
    let output = run_shell(&["sh -c 'sleep 0.2; exit 7' &", "wait", "echo WAIT:$status"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("WAIT:7"), "stdout was: {stdout}");
}

#[test]
fn wait_invalid_job_id_sets_nonzero_status() {
    let output = run_shell(&["wait %99999", "echo WAIT:$status"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("WAIT:1"), "stdout was: {stdout}");
}

#[test]
fn completed_jobs_leave_the_list() {
    let output = run_shell(&["sh -c 'exit 0' &", "sleep 0.3", "echo marker", "jobs"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("no jobs"),
        "stdout was: {stdout}"
    );
}

#[test]
fn two_background_jobs_get_distinct_ids() {
    let output = run_shell(&["sleep 1 &", "sleep 1 &", "jobs"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let ids: Vec<&str> = stdout
        .lines()
        .filter(|line| line.contains("sleep 1"))
        .filter_map(|line| line.split('\t').next())
        .collect();
    assert_eq!(ids, vec!["1", "2"], "stdout was: {stdout}");
}

#[test]
fn background_job_survives_foreground_work() {
    let output = run_shell(&[
        "sh -c 'sleep 0.2; echo background-done' &",
        "echo foreground",
        "wait",
    ]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("foreground"), "stdout was: {stdout}");
    assert!(stdout.contains("background-done"), "stdout was: {stdout}");
}

#[test]
fn event_handler_fires_on_variable_change() {
    let output = run_shell(&[
        "function on_color --on-variable color; echo color-changed; end",
        "set color blue",
        "echo done",
    ]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("color-changed"), "stdout was: {stdout}");
}

#[test]
fn job_exit_event_carries_the_job_id() {
    let output = run_shell(&[
        "function on_job --on-job-exit 1; echo job-ended:$argv; end",
        "sh -c 'exit 0' &",
        "sleep 0.3",
        "echo marker",
    ]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("job-ended:JOB_EXIT 1"),
        "stdout was: {stdout}"
    );
}
