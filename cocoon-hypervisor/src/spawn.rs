//! Detached launch of the `cloud-hypervisor` binary (spec §4.6 Start step 6,
//! §9 "Ownership of subprocess lifetime").
//!
//! The spec's own wording describes entering the VM's network namespace by
//! pinning an OS thread, switching that thread's netns, spawning, then
//! restoring it — a dance that only makes sense in a runtime without a
//! pre-fork hook. Rust's `pre_exec` already runs in the forked child after
//! `fork()` and before `exec()`, where the process is single-threaded by
//! construction, so `setns` there needs no thread pinning or restore at all:
//! the parent's threads and their namespaces are untouched.

use std::os::unix::process::CommandExt as _;
use std::path::Path;

use cocoon_core::error::{Error, Result};
use nix::sched::{CloneFlags, setns};
use nix::unistd::{Pid, setpgid};
use tokio::process::{Child, Command};

/// Launches `hypervisor_bin args` detached from the caller: stdout/stderr
/// redirected to `log_path`, stdin nulled, and the [`Child`] handle dropped
/// without waiting so the process survives this invocation exiting (tokio's
/// default `kill_on_drop(false)` leaves it running).
///
/// `netns_path`, when `Some`, is entered via `setns(CLONE_NEWNET)` inside the
/// forked child before exec, so the spawned VM's taps are visible only
/// inside that namespace. `None` spawns directly in the caller's namespace
/// (a VM configured with no NICs).
pub async fn spawn_detached(hypervisor_bin: &str, args: &[String], log_path: &Path, netns_path: Option<&Path>) -> Result<i32> {
    let log_file = std::fs::OpenOptions::new().create(true).append(true).open(log_path)?;
    let log_file_err = log_file.try_clone()?;

    let mut command = Command::new(hypervisor_bin);
    command.args(args).stdin(std::process::Stdio::null()).stdout(log_file).stderr(log_file_err);

    let netns_file = match netns_path {
        Some(path) => Some(std::fs::File::open(path)?),
        None => None,
    };

    // SAFETY: setns/setpgid are both async-signal-safe syscalls, called here
    // before any other pre_exec hook (harden's FD cleanup) runs.
    unsafe {
        command.as_std_mut().pre_exec(move || {
            if let Some(ref file) = netns_file {
                setns(file, CloneFlags::CLONE_NEWNET).map_err(std::io::Error::from)?;
            }
            setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(std::io::Error::from)?;
            Ok(())
        });
    }
    cocoon_core::process::harden(command.as_std_mut(), None);

    let mut child: Child = command.spawn().map_err(|e| Error::Subprocess {
        bin: hypervisor_bin.to_owned(),
        detail: e.to_string(),
    })?;
    let pid = child.id().ok_or_else(|| Error::Subprocess {
        bin: hypervisor_bin.to_owned(),
        detail: "spawned child has no pid".to_owned(),
    })?;

    // Detach: tokio only reaps on drop if kill_on_drop is set, which it
    // isn't here, so dropping `child` simply releases our handle.
    drop(child);

    #[allow(clippy::cast_possible_wrap)]
    Ok(pid as i32)
}

/// `true` if the process named by `pid` has already exited, used by Start
/// step 7's socket-poll loop to fail fast instead of waiting out the full
/// timeout when the hypervisor died immediately after fork.
#[must_use]
pub fn has_exited(pid: i32) -> bool {
    use nix::sys::signal::kill;
    kill(Pid::from_raw(pid), None).is_err()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_without_netns_writes_log_and_returns_a_live_pid() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("ch.log");
        let pid = spawn_detached("/bin/sh", &["-c".to_owned(), "echo hi; sleep 5".to_owned()], &log_path, None)
            .await
            .unwrap();
        assert!(pid > 0);
        assert!(!has_exited(pid));
        let _ = nix::sys::signal::kill(Pid::from_raw(pid), nix::sys::signal::Signal::SIGKILL);
    }

    #[test]
    fn has_exited_is_true_for_an_unused_high_pid() {
        assert!(has_exited(i32::MAX - 1));
    }
}
