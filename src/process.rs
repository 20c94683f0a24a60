//! OS process and port introspection used for stale-process cleanup
//!
//! Unix uses `kill(2)` and `lsof`; Windows shells out to `tasklist`,
//! `taskkill` and `netstat`.

use std::future::Future;
use std::io;
use tokio::process::Command;
use tracing::debug;

/// Liveness checks, termination and listener lookup
pub trait ProcessControl: Send + Sync {
    /// Whether `pid` names a running process. Unknown counts as dead.
    fn is_alive(&self, pid: u32) -> impl Future<Output = bool> + Send;

    /// Forcefully terminate `pid`.
    fn terminate(&self, pid: u32) -> impl Future<Output = io::Result<()>> + Send;

    /// Pids with a TCP listener bound to `port`.
    fn listeners_on(&self, port: u16) -> impl Future<Output = Vec<u32>> + Send;
}

/// The real operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcesses;

impl ProcessControl for SystemProcesses {
    fn is_alive(&self, pid: u32) -> impl Future<Output = bool> + Send {
        is_process_alive(pid)
    }

    async fn terminate(&self, pid: u32) -> io::Result<()> {
        if pid == 0 || pid == std::process::id() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to terminate pid {pid}"),
            ));
        }
        terminate_process(pid).await
    }

    fn listeners_on(&self, port: u16) -> impl Future<Output = Vec<u32>> + Send {
        listeners_on_port(port)
    }
}

#[cfg(unix)]
async fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks existence; EPERM means it exists under another user.
    let result = unsafe { libc::kill(pid, 0) };
    result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
async fn is_process_alive(pid: u32) -> bool {
    Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .output()
        .await
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

#[cfg(not(any(unix, windows)))]
async fn is_process_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
async fn terminate_process(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    if unsafe { libc::kill(pid, libc::SIGKILL) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
async fn terminate_process(pid: u32) -> io::Result<()> {
    let status = Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!("taskkill exited with {status}")))
    }
}

#[cfg(not(any(unix, windows)))]
async fn terminate_process(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process termination is not supported on this platform",
    ))
}

#[cfg(not(windows))]
async fn listeners_on_port(port: u16) -> Vec<u32> {
    let output = Command::new("lsof")
        .arg("-nP")
        .arg("-t")
        .arg(format!("-iTCP:{port}"))
        .arg("-sTCP:LISTEN")
        .output()
        .await;
    match output {
        Ok(output) => parse_lsof_pids(&String::from_utf8_lossy(&output.stdout)),
        Err(e) => {
            debug!("lsof unavailable for port {}: {}", port, e);
            Vec::new()
        }
    }
}

#[cfg(windows)]
async fn listeners_on_port(port: u16) -> Vec<u32> {
    let output = Command::new("netstat").args(["-ano", "-p", "TCP"]).output().await;
    match output {
        Ok(output) => parse_netstat_listeners(&String::from_utf8_lossy(&output.stdout), port),
        Err(e) => {
            debug!("netstat unavailable for port {}: {}", port, e);
            Vec::new()
        }
    }
}

/// Parse `lsof -t` output: one pid per line.
pub fn parse_lsof_pids(stdout: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = stdout
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.dedup();
    pids
}

/// Parse `netstat -ano` output for listeners whose local address ends in `:port`.
pub fn parse_netstat_listeners(stdout: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{port}");
    let mut pids = Vec::new();
    for line in stdout.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        // Proto  Local  Foreign  State  PID
        if parts.len() < 5 || !parts[3].eq_ignore_ascii_case("LISTENING") {
            continue;
        }
        if !parts[1].ends_with(&suffix) {
            continue;
        }
        if let Ok(pid) = parts[4].parse::<u32>() {
            if !pids.contains(&pid) {
                pids.push(pid);
            }
        }
    }
    pids
}
