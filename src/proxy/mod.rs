//! Reverse proxy routing for running instances.

mod nginx;
mod render;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

pub use nginx::NginxProxy;
pub use render::{fragment_file_name, public_path, render_fragment, route_from_file_name};

/// A routing fragment on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyRoute {
    pub repo_id: String,
    pub route_name: String,
    pub port: u16,
    pub working_directory: PathBuf,
    pub file: PathBuf,
}

/// Narrow interface over the shared reverse proxy.
#[async_trait]
pub trait ProxyControl: Send + Sync {
    /// Render and write the fragment routing `repo_id` to `port`.
    fn write_config(&self, repo_id: &str, port: u16, working_dir: &Path) -> Result<ProxyRoute>;

    /// Delete the fragment for `repo_id`; absent fragments are not an error.
    fn remove_config(&self, repo_id: &str) -> Result<()>;

    /// Validate the complete proxy configuration and apply it only if valid.
    /// On error the previously active configuration is still serving.
    async fn reload(&self) -> Result<()>;

    /// Route names of every fragment currently on disk.
    fn list_routes(&self) -> Result<Vec<String>>;

    /// Delete the fragment with the given route name; used for fragments no
    /// repository owns any more.
    fn remove_route(&self, route_name: &str) -> Result<()>;
}
