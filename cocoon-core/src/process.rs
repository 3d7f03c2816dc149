//! Process hardening, liveness checks, and the generic poll primitive.
//!
//! The detached-spawn and FD-cleanup logic below is carried over from this
//! workspace's micro-VM jail hardening: applied after `fork()` but before
//! `exec()`, so the Cloud Hypervisor child cannot outlive a dead parent in a
//! state where it still inherits the parent's file descriptors.

use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Install pre-exec hooks on the command about to become the detached
/// hypervisor process.
///
/// `preserve_fd` — an FD that must survive into the exec'd process. Pass
/// `None` to close everything above stderr.
///
/// On non-Unix platforms this is a no-op.
#[cfg(not(unix))]
pub fn harden(_cmd: &mut Command, _preserve_fd: Option<i32>) {}

/// Install pre-exec hooks on the command about to become the detached
/// hypervisor process: die-with-parent and inherited-FD cleanup.
#[cfg(unix)]
pub fn harden(cmd: &mut Command, preserve_fd: Option<i32>) {
    use std::os::unix::process::CommandExt;

    // SAFETY: every operation inside is an async-signal-safe syscall.
    unsafe {
        cmd.pre_exec(move || {
            // Die when the parent exits — prevents orphaned hypervisor
            // processes outliving a killed CLI invocation.
            #[cfg(target_os = "linux")]
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);

            close_inherited_fds(preserve_fd);

            Ok(())
        });
    }
}

/// Close all file descriptors >= 3, optionally preserving one.
#[cfg(unix)]
fn close_inherited_fds(preserve: Option<i32>) {
    match preserve {
        Some(keep) => close_fds_preserving(keep),
        None => close_all_fds(),
    }
}

/// Close all FDs >= 3 unconditionally.
#[cfg(unix)]
fn close_all_fds() {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: close_range is async-signal-safe; available on Linux 5.9+.
        let ret = unsafe { libc::syscall(libc::SYS_close_range, 3_u32, u32::MAX, 0_u32) };
        if ret == 0 {
            return;
        }
    }
    close_fd_range(3, max_fd());
}

/// Close all FDs >= 3 except `keep`.
#[cfg(unix)]
fn close_fds_preserving(keep: i32) {
    #[cfg(target_os = "linux")]
    {
        #[allow(clippy::cast_sign_loss)]
        let keep_u = keep as u32;
        // SAFETY: close_range is async-signal-safe.
        unsafe {
            if keep > 3 {
                libc::syscall(libc::SYS_close_range, 3_u32, keep_u - 1, 0_u32);
            }
            libc::syscall(libc::SYS_close_range, keep_u + 1, u32::MAX, 0_u32);
        }
        return;
    }

    #[allow(unreachable_code)]
    {
        let end = max_fd();
        for fd in 3..end {
            if fd != keep {
                unsafe { libc::close(fd) };
            }
        }
    }
}

/// Upper bound on FD numbers from `sysconf(_SC_OPEN_MAX)`.
#[cfg(unix)]
fn max_fd() -> i32 {
    // SAFETY: sysconf is async-signal-safe.
    let n = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    #[allow(clippy::cast_possible_truncation)]
    if n > 0 {
        n as i32
    } else {
        1024
    }
}

/// Close FDs in `[start, end)` via iterative `close()`.
#[cfg(unix)]
fn close_fd_range(start: i32, end: i32) {
    for fd in start..end {
        unsafe { libc::close(fd) };
    }
}

/// Returns `true` if `pid` names a live process whose `/proc/<pid>/exe`
/// basename equals `expected_basename`.
///
/// This is the sole test for "is the hypervisor still running" (spec §9,
/// I3): a retained process handle is never trusted, only signal-0 liveness
/// plus basename equality, which defeats PID reuse by an unrelated process.
#[cfg(target_os = "linux")]
#[must_use]
pub fn pid_matches_binary(pid: i32, expected_basename: &str) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if kill(Pid::from_raw(pid), None).is_err() {
        return false;
    }
    let exe_link = format!("/proc/{pid}/exe");
    match std::fs::read_link(exe_link) {
        Ok(target) => target
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n == expected_basename),
        Err(_) => false,
    }
}

/// Non-Linux fallback: only checks liveness via signal 0, since `/proc` is
/// unavailable. Acceptable because Cocoon's supported deployment target is
/// Linux (KVM + CNI + netns are Linux-only concepts throughout this spec).
#[cfg(all(unix, not(target_os = "linux")))]
#[must_use]
pub fn pid_matches_binary(pid: i32, _expected_basename: &str) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid), None).is_ok()
}

/// Reads a PID file and reports whether the process it names is alive and
/// matches `expected_basename`. Missing file is not an error — it just
/// means "not running".
pub fn pid_file_alive(pid_path: &Path, expected_basename: &str) -> bool {
    let Ok(contents) = std::fs::read_to_string(pid_path) else {
        return false;
    };
    let Ok(pid) = contents.trim().parse::<i32>() else {
        return false;
    };
    pid_matches_binary(pid, expected_basename)
}

/// Generic polling primitive: calls `check` every `interval` until its
/// returned future resolves `true`, or `timeout` elapses, honoring spec §5's
/// "common polling primitive" (socket-ready wait, ACPI-off wait,
/// SIGTERM→SIGKILL wait all build on this). `check` is async-capable so a
/// tick can attempt a real connection rather than only checking a path's
/// existence.
pub async fn poll_until<F>(what: &str, timeout: Duration, interval: Duration, mut check: impl FnMut() -> F) -> Result<()>
where
    F: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout(what.to_owned()));
        }
        tokio::time::sleep(interval).await;
    }
}

/// Sends SIGTERM, waits up to `grace` for the process to disappear, then
/// escalates to SIGKILL. Used by the Stop termination fallback (spec §4.6).
#[cfg(unix)]
pub async fn terminate_or_kill(pid: i32, grace: Duration) -> Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let raw = Pid::from_raw(pid);
    let _ = kill(raw, Signal::SIGTERM);

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if kill(raw, None).is_err() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    if kill(raw, Signal::SIGKILL).is_err() {
        // Already gone between the last liveness check and this signal.
        return Ok(());
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}
