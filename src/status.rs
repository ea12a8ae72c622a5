/// Decoded form of a raw `waitpid` status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    Exited(i32),
    Signalled { signal: i32, core_dumped: bool },
    Stopped(i32),
    Continued,
}

/// Decode a raw status word from `waitpid`.
pub fn decode_wait_status(raw: libc::c_int) -> Option<WaitState> {
    unsafe {
        if libc::WIFEXITED(raw) {
            Some(WaitState::Exited(libc::WEXITSTATUS(raw)))
        } else if libc::WIFSIGNALED(raw) {
            Some(WaitState::Signalled {
                signal: libc::WTERMSIG(raw),
                core_dumped: libc::WCOREDUMP(raw),
            })
        } else if libc::WIFSTOPPED(raw) {
            Some(WaitState::Stopped(libc::WSTOPSIG(raw)))
        } else if libc::WIFCONTINUED(raw) {
            Some(WaitState::Continued)
        } else {
            None
        }
    }
}

/// Convert a raw status word into shell-style exit code semantics.
///
/// Processes terminated by signal map to `128 + signal`. Stop and continue
/// statuses have no exit code.
pub fn exit_code_from_wait_status(raw: libc::c_int) -> Option<i32> {
    match decode_wait_status(raw) {
        Some(WaitState::Exited(code)) => Some(code),
        Some(WaitState::Signalled { signal, .. }) => Some(128 + signal),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Raw status words as the kernel packs them: exit code in the second
    // byte, terminating signal in the low 7 bits, 0x7f marks a stop.
    fn raw_exit(code: i32) -> libc::c_int {
        (code & 0xff) << 8
    }

    fn raw_signal(sig: i32) -> libc::c_int {
        sig & 0x7f
    }

    fn raw_stop(sig: i32) -> libc::c_int {
        ((sig & 0xff) << 8) | 0x7f
    }

    #[test]
    fn exit_status_decodes_to_code() {
        assert_eq!(decode_wait_status(raw_exit(0)), Some(WaitState::Exited(0)));
        assert_eq!(decode_wait_status(raw_exit(7)), Some(WaitState::Exited(7)));
        assert_eq!(exit_code_from_wait_status(raw_exit(7)), Some(7));
    }

    #[test]
    fn signal_death_maps_to_128_plus_signal() {
        let raw = raw_signal(libc::SIGINT);
        assert!(matches!(
            decode_wait_status(raw),
            Some(WaitState::Signalled { signal, .. }) if signal == libc::SIGINT
        ));
        assert_eq!(exit_code_from_wait_status(raw), Some(128 + libc::SIGINT));
    }

    #[test]
    fn stopped_status_has_no_exit_code() {
        let raw = raw_stop(libc::SIGTSTP);
        assert_eq!(
            decode_wait_status(raw),
            Some(WaitState::Stopped(libc::SIGTSTP))
        );
        assert_eq!(exit_code_from_wait_status(raw), None);
    }
}
