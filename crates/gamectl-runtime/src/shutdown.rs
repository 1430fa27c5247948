//! Signal delivery for graceful and forced termination.
//!
//! The exit-watch task owns the `Child` and is the only place that reaps.
//! `stop()` therefore signals by PID and waits for the exit notification
//! instead of calling `Child::kill` itself.

use std::io;

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// Ask a process to terminate gracefully.
///
/// Unix sends SIGTERM; a process that already exited is not an error.
pub fn terminate(pid: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        send_signal(pid, Signal::SIGTERM)
    }

    #[cfg(not(unix))]
    {
        // No graceful signal on Windows; the grace-period timeout will
        // escalate to force_kill.
        let _ = pid;
        Ok(())
    }
}

/// Forcibly kill a process.
pub fn force_kill(pid: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        send_signal(pid, Signal::SIGKILL)
    }

    #[cfg(not(unix))]
    {
        taskkill(pid)
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, sig: Signal) -> io::Result<()> {
    #[allow(clippy::cast_possible_wrap)]
    match signal::kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::other(e)),
    }
}

#[cfg(not(unix))]
fn taskkill(pid: u32) -> io::Result<()> {
    std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output()
        .map(|_| ())
}
