//! nginx-backed proxy configurator.

use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;

use super::render::{fragment_file_name, render_fragment, route_from_file_name};
use super::{ProxyControl, ProxyRoute};
use crate::config::ProxySettings;
use crate::error::{AppError, Result};
use crate::store::write_atomic;
use crate::validation::route_name;

/// Writes one fragment per repository into the include directory and reloads
/// nginx through the configured test and reload commands.
pub struct NginxProxy {
    settings: ProxySettings,
    reload_lock: Mutex<()>,
}

impl NginxProxy {
    pub fn new(settings: ProxySettings) -> Self {
        Self {
            settings,
            reload_lock: Mutex::new(()),
        }
    }

    fn fragment_path(&self, route: &str) -> PathBuf {
        self.settings.include_dir.join(fragment_file_name(route))
    }

    fn delete_fragment(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => {
                log::info!("Removed proxy fragment {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::config_write_failure(format!(
                "Failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

#[async_trait]
impl ProxyControl for NginxProxy {
    fn write_config(&self, repo_id: &str, port: u16, working_dir: &Path) -> Result<ProxyRoute> {
        let route = route_name(repo_id);
        let file = self.fragment_path(&route);
        let content = render_fragment(
            &self.settings.namespace,
            repo_id,
            &self.settings.upstream_host,
            port,
            working_dir,
        );

        fs::create_dir_all(&self.settings.include_dir).map_err(|e| {
            AppError::config_write_failure(format!(
                "Failed to create {}: {}",
                self.settings.include_dir.display(),
                e
            ))
        })?;
        write_atomic(&file, content.as_bytes())
            .map_err(|e| AppError::config_write_failure(e.to_string()))?;

        log::info!(
            "Wrote proxy fragment {} ({} -> port {})",
            file.display(),
            repo_id,
            port
        );
        Ok(ProxyRoute {
            repo_id: repo_id.to_string(),
            route_name: route,
            port,
            working_directory: working_dir.to_path_buf(),
            file,
        })
    }

    fn remove_config(&self, repo_id: &str) -> Result<()> {
        self.delete_fragment(&self.fragment_path(&route_name(repo_id)))
    }

    async fn reload(&self) -> Result<()> {
        let _guard = self.reload_lock.lock().await;
        let timeout = self.settings.reload_timeout();

        run_command(&self.settings.test_command, timeout)
            .await
            .map_err(|detail| {
                log::error!("Proxy configuration rejected, keeping active config: {}", detail);
                AppError::reload_failure(format!("configuration test failed: {}", detail))
            })?;
        run_command(&self.settings.reload_command, timeout)
            .await
            .map_err(|detail| {
                log::error!("Proxy reload failed: {}", detail);
                AppError::reload_failure(format!("reload failed: {}", detail))
            })?;

        log::info!("Proxy configuration reloaded");
        Ok(())
    }

    fn list_routes(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.settings.include_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut routes: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                route_from_file_name(name.to_str()?).map(str::to_string)
            })
            .collect();
        routes.sort();
        Ok(routes)
    }

    fn remove_route(&self, route: &str) -> Result<()> {
        self.delete_fragment(&self.fragment_path(route))
    }
}

/// Run `argv` to completion within `timeout`; the error carries the command's output.
async fn run_command(argv: &[String], timeout: Duration) -> std::result::Result<(), String> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| "empty command".to_string())?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Err(_) => {
            return Err(format!(
                "{} timed out after {}s",
                argv.join(" "),
                timeout.as_secs()
            ))
        }
        Ok(Err(e)) => return Err(format!("failed to run {}: {}", program, e)),
        Ok(Ok(output)) => output,
    };

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let detail = if stderr.trim().is_empty() {
        stdout.trim()
    } else {
        stderr.trim()
    };
    Err(format!(
        "{} exited with {}: {}",
        argv.join(" "),
        output.status,
        if detail.is_empty() { "(no output)" } else { detail }
    ))
}
