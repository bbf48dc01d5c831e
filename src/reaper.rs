//! Wait/aggregate (spec §4.G): after the parser returns, reap every
//! direct child of the root interpreter process and fold their exit
//! statuses into a single worst-of exit code.
//!
//! The `waitpid`/`WaitStatus` match and the `128 + signal` shell
//! convention are reused nearly verbatim from `conmon-rs`'s
//! `child_reaper.rs`, narrowed from its "watch one registered
//! grandchild forever in a background thread" loop to "block on a
//! known, finite set of pids once, at interpreter exit."

use crate::error::Result;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

/// A child's contribution to the worst-exit tally (spec §4.G):
/// `exit_status` on a normal exit, `128 + signal_number` on a signal
/// termination — the common shell convention.
fn exit_code_of(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        // Stopped/Continued/PtraceEvent etc. never arise here: we pass
        // no WaitPidFlag that would report them, so a caller only ever
        // observes a terminal status for each waited-on pid.
        _ => 0,
    }
}

/// Blocks on every pid in `pids`, folding each into the running
/// maximum exit code. Pids are waited on in the order given; since
/// `waitpid` with an explicit pid blocks until *that* process
/// terminates, the overall wait completes once every listed child has
/// exited, regardless of the order they actually finish in.
pub fn reap_all(pids: &[i32]) -> Result<i32> {
    let mut worst = 0;
    for &pid in pids {
        let status = waitpid(Pid::from_raw(pid), None)?;
        worst = worst.max(exit_code_of(status));
    }
    Ok(worst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::launch_client;

    fn argv(words: &[&str]) -> Vec<Vec<u8>> {
        words.iter().map(|w| w.as_bytes().to_vec()).collect()
    }

    #[test]
    fn worst_exit_wins_over_success() {
        let ok = launch_client(&argv(&["/bin/true"])).unwrap();
        let bad = launch_client(&argv(&["/bin/false"])).unwrap();
        let code = reap_all(&[ok.pid, bad.pid]).unwrap();
        assert_eq!(code, 1);
    }

    #[test]
    fn signaled_child_contributes_128_plus_signo() {
        let killed = launch_client(&argv(&[
            "/bin/sh",
            "-c",
            "kill -TERM $$",
        ]))
        .unwrap();
        let code = reap_all(&[killed.pid]).unwrap();
        assert_eq!(code, 128 + 15);
    }
}
