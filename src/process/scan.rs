//! Enumerate editor-server processes from the OS process table.

use std::path::Path;

use super::OsProcess;
use crate::error::Result;

/// Fields of `/proc/<pid>/stat` the orchestrator cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct ProcStat {
    pub state: char,
    pub ppid: u32,
    pub pgid: u32,
}

/// Parse `/proc/<pid>/stat`. The command name is parenthesised and may itself
/// contain spaces or parentheses, so fields are read after the last `)`.
pub(super) fn parse_stat(stat: &str) -> Option<ProcStat> {
    let end = stat.rfind(')')?;
    let mut fields = stat.get(end + 1..)?.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    let pgid = fields.next()?.parse().ok()?;
    Some(ProcStat { state, ppid, pgid })
}

/// A command line matches when the executable itself carries the signature, or when
/// a `node` runtime executes a script whose path carries it. Matching on argv
/// position keeps `grep code-server` or `tail -f code-server-9000.log` out.
pub fn matches_signature(args: &[String], signature: &str) -> bool {
    let Some(program) = args.first() else {
        return false;
    };
    if program.contains(signature) {
        return true;
    }
    let program_name = Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program);
    program_name.starts_with("node") && args.get(1).is_some_and(|a| a.contains(signature))
}

/// Port from `--bind-addr host:port`, `--bind-addr=host:port` or `--port N`.
pub fn parse_bind_port(args: &[String]) -> Option<u16> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--bind-addr=") {
            return port_of_addr(value);
        }
        if arg == "--bind-addr" {
            return iter.next().and_then(|v| port_of_addr(v));
        }
        if let Some(value) = arg.strip_prefix("--port=") {
            return value.parse().ok();
        }
        if arg == "--port" {
            return iter.next().and_then(|v| v.parse().ok());
        }
    }
    None
}

fn port_of_addr(addr: &str) -> Option<u16> {
    addr.rsplit_once(':')?.1.parse().ok()
}

/// Every live process (zombies excluded, this process excluded) matching `signature`.
pub fn list_matching_processes(signature: &str) -> Result<Vec<OsProcess>> {
    let own_pid = std::process::id();
    let mut matches: Vec<OsProcess> = scan_process_table()?
        .into_iter()
        .filter(|entry| entry.pid != own_pid && entry.state != 'Z')
        .filter(|entry| matches_signature(&entry.args, signature))
        .map(|entry| OsProcess {
            pid: entry.pid,
            ppid: entry.ppid,
            pgid: entry.pgid,
            port: parse_bind_port(&entry.args),
            command: entry.args.join(" "),
        })
        .collect();
    matches.sort_by_key(|p| p.pid);
    Ok(matches)
}

struct RawEntry {
    pid: u32,
    ppid: Option<u32>,
    pgid: Option<u32>,
    state: char,
    args: Vec<String>,
}

#[cfg(target_os = "linux")]
fn scan_process_table() -> Result<Vec<RawEntry>> {
    let mut entries = Vec::new();
    for dir in std::fs::read_dir("/proc")? {
        let Ok(dir) = dir else { continue };
        let Some(pid) = dir.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        // Processes can vanish between listing and reading; skip them quietly.
        let Ok(cmdline) = std::fs::read(dir.path().join("cmdline")) else {
            continue;
        };
        if cmdline.is_empty() {
            continue;
        }
        let args: Vec<String> = cmdline
            .split(|b| *b == 0)
            .filter(|a| !a.is_empty())
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect();
        let stat = std::fs::read_to_string(dir.path().join("stat"))
            .ok()
            .and_then(|s| parse_stat(&s));
        entries.push(RawEntry {
            pid,
            ppid: stat.map(|s| s.ppid),
            pgid: stat.map(|s| s.pgid),
            state: stat.map_or('?', |s| s.state),
            args,
        });
    }
    Ok(entries)
}

#[cfg(not(target_os = "linux"))]
fn scan_process_table() -> Result<Vec<RawEntry>> {
    use crate::error::AppError;

    let output = std::process::Command::new("ps")
        .args(["-axo", "pid=,ppid=,pgid=,stat=,command="])
        .output()
        .map_err(|e| AppError::process(format!("Failed to run ps: {e}")))?;
    if !output.status.success() {
        return Err(AppError::process(format!(
            "ps exited with {}",
            output.status
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let entries = stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse().ok()?;
            let ppid = fields.next()?.parse().ok();
            let pgid = fields.next()?.parse().ok();
            let state = fields.next()?.chars().next()?;
            let args: Vec<String> = fields.map(str::to_string).collect();
            Some(RawEntry {
                pid,
                ppid,
                pgid,
                state,
                args,
            })
        })
        .collect();
    Ok(entries)
}
