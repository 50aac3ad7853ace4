//! Signal delivery and liveness checks.

use std::time::{Duration, Instant};

use super::EXIT_POLL_INTERVAL;
use crate::error::{AppError, Result};

/// Check if a process is alive by PID. Zombies count as exited.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;

    let Some(target) = to_pid(pid) else {
        return false;
    };
    match kill(target, None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    false
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| super::scan::parse_stat(&stat))
        .is_some_and(|stat| stat.state == 'Z')
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn to_pid(pid: u32) -> Option<nix::unistd::Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(nix::unistd::Pid::from_raw)
}

/// Send `signal` to the process group when `pid` leads one (every editor we spawn
/// does), otherwise to the pid alone. A vanished process is not an error.
#[cfg(unix)]
fn signal_process(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg};
    use nix::unistd::getpgid;

    let target = to_pid(pid).ok_or_else(|| AppError::process(format!("Invalid PID {}", pid)))?;
    let result = match getpgid(Some(target)) {
        Ok(pgid) if pgid == target => killpg(pgid, signal),
        Ok(_) => kill(target, signal),
        Err(Errno::ESRCH) => return Ok(()),
        Err(_) => kill(target, signal),
    };
    match result {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(AppError::process(format!(
            "Failed to send {} to PID {}: {}",
            signal.as_str(),
            pid,
            e
        ))),
    }
}

/// Send a graceful shutdown signal to a process.
#[cfg(unix)]
pub(super) fn graceful_signal(pid: u32) -> Result<()> {
    signal_process(pid, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(not(unix))]
pub(super) fn graceful_signal(pid: u32) -> Result<()> {
    Err(AppError::process(format!(
        "Cannot signal PID {} on this platform",
        pid
    )))
}

#[cfg(unix)]
pub fn force_kill(pid: u32) -> Result<()> {
    signal_process(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(not(unix))]
pub fn force_kill(pid: u32) -> Result<()> {
    Err(AppError::process(format!(
        "Cannot kill PID {} on this platform",
        pid
    )))
}

/// Send graceful signal to each PID, wait up to `timeout` for all to exit,
/// then force kill any that remain. Blocking. Returns the PIDs still alive afterwards.
pub fn graceful_shutdown(pids: &[u32], timeout: Duration) -> Vec<u32> {
    let mut failed_signal_pids = Vec::new();

    for &pid in pids {
        if is_process_alive(pid) {
            if let Err(e) = graceful_signal(pid) {
                log::warn!(
                    "Graceful signal failed for PID {pid}: {e}, will force kill immediately"
                );
                failed_signal_pids.push(pid);
            }
        }
    }

    for &pid in &failed_signal_pids {
        if is_process_alive(pid) {
            if let Err(e) = force_kill(pid) {
                log::error!("Failed to force kill PID {pid}: {e}");
            }
        }
    }

    let successful_pids: Vec<u32> = pids
        .iter()
        .copied()
        .filter(|pid| !failed_signal_pids.contains(pid))
        .collect();

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if successful_pids.iter().all(|&pid| !is_process_alive(pid)) {
            break;
        }
        std::thread::sleep(EXIT_POLL_INTERVAL);
    }

    for &pid in &successful_pids {
        if is_process_alive(pid) {
            log::warn!(
                "PID {pid} did not exit within {}s, force killing",
                timeout.as_secs()
            );
            if let Err(e) = force_kill(pid) {
                log::error!("Failed to force kill PID {pid}: {e}");
            }
        }
    }

    // SIGKILL is asynchronous; give the kernel a moment before reporting survivors.
    let settle = Instant::now() + Duration::from_secs(2);
    loop {
        let survivors: Vec<u32> = pids
            .iter()
            .copied()
            .filter(|&pid| is_process_alive(pid))
            .collect();
        if survivors.is_empty() || Instant::now() >= settle {
            return survivors;
        }
        std::thread::sleep(EXIT_POLL_INTERVAL);
    }
}

/// Fails when something else is already bound to `port` on the loopback interface.
pub fn check_port_available(port: u16) -> Result<()> {
    std::net::TcpListener::bind(("127.0.0.1", port)).map_err(|_| {
        AppError::spawn_failure(format!(
            "port {} is already bound by another process",
            port
        ))
    })?;
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn missing_pid_is_not_alive() {
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(u32::MAX));
    }

    #[test]
    fn own_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn killing_a_vanished_pid_succeeds() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(force_kill(pid).is_ok());
    }

    #[test]
    fn graceful_shutdown_terminates_children() {
        use std::os::unix::process::CommandExt as _;

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();

        let reaper = std::thread::spawn(move || child.wait());
        let survivors = graceful_shutdown(&[pid], Duration::from_secs(5));
        reaper.join().unwrap().unwrap();

        assert!(survivors.is_empty());
        assert!(!is_process_alive(pid));
    }

    #[test]
    fn bound_port_is_reported() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let err = check_port_available(port).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SpawnFailure);
    }
}
