//! code-server launcher.

use std::fs::{self, File};
use std::io::{Read as _, Seek as _, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::process::Command;

use super::control::{check_port_available, force_kill, graceful_shutdown, is_process_alive};
use super::health::wait_for_startup;
use super::scan::list_matching_processes;
use super::{OsProcess, ProcessControl, LOG_TAIL_LINES};
use crate::config::EditorSettings;
use crate::error::{AppError, Result};
use crate::paths::DataPaths;

/// Bytes read from the end of a log file when building a failure tail.
const LOG_TAIL_BYTES: u64 = 16 * 1024;

/// Spawns one code-server per port, detached in its own process group, with
/// telemetry, update checks and authentication switched off.
pub struct CodeServerLauncher {
    settings: EditorSettings,
    paths: DataPaths,
    http_client: Client,
}

impl CodeServerLauncher {
    pub fn new(settings: EditorSettings, paths: DataPaths) -> Result<Self> {
        let http_client = Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| AppError::other(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            settings,
            paths,
            http_client,
        })
    }

    fn resolve_binary(&self) -> Option<PathBuf> {
        resolve_in_path(&self.settings.binary)
    }

    fn build_command(&self, binary: &Path, name: &str, working_dir: &Path, port: u16) -> Command {
        let mut cmd = Command::new(binary);
        cmd.arg("--bind-addr")
            .arg(format!("127.0.0.1:{}", port))
            .args(["--auth", "none", "--disable-telemetry", "--disable-update-check"])
            .arg("--user-data-dir")
            .arg(self.paths.instance_dir(port))
            .arg("--extensions-dir")
            .arg(self.paths.extensions_dir())
            .args(&self.settings.extra_args)
            .arg(working_dir)
            .current_dir(working_dir)
            .env("CODEDOCK_INSTANCE", name)
            .env_remove("PASSWORD")
            .env_remove("HASHED_PASSWORD")
            .stdin(Stdio::null())
            .kill_on_drop(false);

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        cmd
    }
}

#[async_trait]
impl ProcessControl for CodeServerLauncher {
    fn is_installed(&self) -> bool {
        self.resolve_binary().is_some()
    }

    async fn start(&self, name: &str, working_dir: &Path, port: u16) -> Result<u32> {
        let binary = self
            .resolve_binary()
            .ok_or_else(|| AppError::editor_not_installed(&self.settings.binary))?;

        if !working_dir.is_dir() {
            return Err(AppError::spawn_failure(format!(
                "Working directory {} does not exist",
                working_dir.display()
            )));
        }
        check_port_available(port)?;

        fs::create_dir_all(self.paths.instance_dir(port))
            .map_err(|e| AppError::spawn_failure(format!("Failed to create user data dir: {}", e)))?;
        fs::create_dir_all(self.paths.extensions_dir())
            .map_err(|e| AppError::spawn_failure(format!("Failed to create extensions dir: {}", e)))?;
        fs::create_dir_all(self.paths.logs_dir())
            .map_err(|e| AppError::spawn_failure(format!("Failed to create log dir: {}", e)))?;

        let log_path = self.paths.log_path(port);
        let stdout_log = File::create(&log_path).map_err(|e| {
            AppError::spawn_failure(format!("Failed to open {}: {}", log_path.display(), e))
        })?;
        let stderr_log = stdout_log
            .try_clone()
            .map_err(|e| AppError::spawn_failure(format!("Failed to clone log handle: {}", e)))?;

        let mut cmd = self.build_command(&binary, name, working_dir, port);
        cmd.stdout(Stdio::from(stdout_log))
            .stderr(Stdio::from(stderr_log));

        let mut child = cmd.spawn().map_err(|e| {
            AppError::spawn_failure(format!("Failed to start {}: {}", binary.display(), e))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| AppError::spawn_failure("Failed to get process ID"))?;

        log::info!(
            "Spawned editor for {} (pid: {}, port: {}, log: {})",
            name,
            pid,
            port,
            log_path.display()
        );

        // Reap the child in the background so an exited editor never lingers as a zombie.
        let name_wait = name.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => log::info!("Editor {} (pid {}) exited: {}", name_wait, pid, status),
                Err(e) => log::warn!("Failed to wait on editor {} (pid {}): {}", name_wait, pid, e),
            }
        });

        match wait_for_startup(&self.http_client, pid, port, self.settings.startup_timeout()).await
        {
            Ok(()) => {
                log::info!("Editor for {} is listening on port {}", name, port);
                Ok(pid)
            }
            Err(reason) => {
                if let Err(kill_err) = force_kill(pid) {
                    log::warn!(
                        "Failed to kill editor {} after failed startup: {}",
                        name,
                        kill_err
                    );
                }
                log::error!("Editor for {} failed to start: {}", name, reason);
                Err(AppError::spawn_failure_with_log(
                    reason,
                    read_log_tail(&log_path, LOG_TAIL_LINES),
                ))
            }
        }
    }

    fn is_running(&self, pid: u32) -> bool {
        is_process_alive(pid)
    }

    async fn stop(&self, name: &str, pid: u32) -> Result<()> {
        if !is_process_alive(pid) {
            log::info!("Editor {} (pid {}) already stopped", name, pid);
            return Ok(());
        }
        log::info!("Stopping editor {} (pid {})", name, pid);
        let timeout = self.settings.stop_timeout();
        let survivors = tokio::task::spawn_blocking(move || graceful_shutdown(&[pid], timeout))
            .await
            .map_err(|e| AppError::process(format!("Failed to wait for shutdown: {}", e)))?;
        if survivors.is_empty() {
            Ok(())
        } else {
            Err(AppError::process(format!(
                "Editor {} (pid {}) is still running after SIGKILL",
                name, pid
            )))
        }
    }

    fn list_processes(&self) -> Result<Vec<OsProcess>> {
        list_matching_processes(&self.settings.signature)
    }
}

/// Resolve `binary` the way a shell would: as a path when it contains a separator,
/// otherwise by searching `PATH` for an executable file.
fn resolve_in_path(binary: &str) -> Option<PathBuf> {
    let candidate = Path::new(binary);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|path| is_executable(path))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt as _;

    fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Last `lines` lines of a log file, read from at most [`LOG_TAIL_BYTES`] at its end.
fn read_log_tail(path: &Path, lines: usize) -> String {
    let Ok(mut file) = File::open(path) else {
        return String::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if file
        .seek(SeekFrom::Start(len.saturating_sub(LOG_TAIL_BYTES)))
        .is_err()
    {
        return String::new();
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    let text = String::from_utf8_lossy(&buf);
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt as _;

    use super::*;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn launcher(binary: &Path, data_dir: &Path, startup_timeout_secs: u64) -> CodeServerLauncher {
        let settings = EditorSettings {
            binary: binary.display().to_string(),
            startup_timeout_secs,
            stop_timeout_secs: 2,
            ..EditorSettings::default()
        };
        CodeServerLauncher::new(settings, DataPaths::new(data_dir)).unwrap()
    }

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn resolves_binaries() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "fake-editor", "exit 0");
        assert_eq!(resolve_in_path(&script.display().to_string()), Some(script));
        assert!(resolve_in_path("sh").is_some());
        assert!(resolve_in_path("definitely-not-a-real-binary-xyz").is_none());

        let plain = dir.path().join("not-executable");
        fs::write(&plain, "data").unwrap();
        assert!(resolve_in_path(&plain.display().to_string()).is_none());
    }

    #[test]
    fn log_tail_keeps_last_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.log");
        let content: Vec<String> = (0..50).map(|i| format!("line {i}")).collect();
        fs::write(&path, content.join("\n")).unwrap();

        let tail = read_log_tail(&path, 3);
        assert_eq!(tail, "line 47\nline 48\nline 49");
        assert_eq!(read_log_tail(&dir.path().join("missing.log"), 3), "");
    }

    #[tokio::test]
    async fn missing_binary_is_not_installed() {
        let dir = tempdir().unwrap();
        let launcher = launcher(&dir.path().join("nope"), dir.path(), 1);
        assert!(!launcher.is_installed());
        let err = launcher.start("a", dir.path(), unused_port()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EditorNotInstalled);
    }

    #[tokio::test]
    async fn editor_that_never_binds_is_killed_with_log_tail() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "code-server", "echo booting\nexec sleep 30");
        let launcher = launcher(&script, &dir.path().join("data"), 1);
        let port = unused_port();

        let err = launcher.start("a", dir.path(), port).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SpawnFailure);
        assert!(err.payload()["log_tail"].contains("booting"));
        assert!(dir.path().join("data/logs").join(format!("code-server-{port}.log")).exists());
    }

    #[tokio::test]
    async fn missing_working_directory_is_a_spawn_failure() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "code-server", "exec sleep 30");
        let launcher = launcher(&script, dir.path(), 1);
        let err = launcher
            .start("a", &dir.path().join("missing"), unused_port())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SpawnFailure);
    }

    #[tokio::test]
    async fn stopping_a_dead_pid_succeeds() {
        let dir = tempdir().unwrap();
        let launcher = launcher(&dir.path().join("nope"), dir.path(), 1);
        launcher.stop("a", u32::MAX).await.unwrap();
    }
}
