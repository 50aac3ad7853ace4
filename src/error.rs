//! Application error types.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Application error that can be serialized for the control surface.
#[derive(Debug)]
pub struct AppError {
    payload: HashMap<String, String>,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No instance is recorded for the repository
    InstanceNotFound,
    /// Repository is not registered
    RepositoryNotFound,
    /// Repository id is empty or not route-safe
    InvalidRepositoryId,
    /// Another running repository already owns the same route
    RouteConflict,
    /// PID does not belong to an editor-server process
    ProcessNotManaged,
    /// Repository still has a running instance
    InstanceRunning,
    /// Configuration error
    Config,
    /// File system error
    Io,
    /// Persisted state could not be read or written
    Store,
    /// Another codedock process owns the data directory
    DataDirBusy,
    /// Every port in the pool is allocated
    PortExhausted,
    /// Editor server did not start or did not bind in time
    SpawnFailure,
    /// Editor server binary cannot be resolved
    EditorNotInstalled,
    /// Proxy fragment could not be written
    ConfigWriteFailure,
    /// Proxy validation or reload failed
    ReloadFailure,
    /// Signal delivery or process inspection error
    Process,
    /// General error
    Other,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::InstanceNotFound => 1001,
            Self::RepositoryNotFound => 1002,
            Self::InvalidRepositoryId => 1003,
            Self::RouteConflict => 1004,
            Self::ProcessNotManaged => 1005,
            Self::InstanceRunning => 1006,
            Self::Config => 2001,
            Self::Io => 2002,
            Self::Store => 2003,
            Self::DataDirBusy => 2004,
            Self::PortExhausted => 3001,
            Self::SpawnFailure => 3002,
            Self::EditorNotInstalled => 3003,
            Self::ConfigWriteFailure => 3004,
            Self::ReloadFailure => 3005,
            Self::Process => 3006,
            Self::Other => 9999,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InstanceNotFound | Self::RepositoryNotFound => StatusCode::NOT_FOUND,
            Self::InvalidRepositoryId | Self::ProcessNotManaged => StatusCode::BAD_REQUEST,
            Self::RouteConflict | Self::InstanceRunning | Self::DataDirBusy => {
                StatusCode::CONFLICT
            }
            Self::PortExhausted => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl AppError {
    pub fn new(kind: ErrorKind, payload: HashMap<String, String>) -> Self {
        Self { payload, kind }
    }

    /// Create an error with a single "detail" key from a non-empty string,
    /// or an empty payload if the string is empty.
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let payload = if detail.is_empty() {
            HashMap::new()
        } else {
            HashMap::from([("detail".to_string(), detail)])
        };
        Self::new(kind, payload)
    }

    pub fn instance_not_found(repo_id: &str) -> Self {
        Self::new(
            ErrorKind::InstanceNotFound,
            HashMap::from([
                ("repo_id".to_string(), repo_id.to_string()),
                ("detail".to_string(), "instance already stopped".to_string()),
            ]),
        )
    }

    pub fn repository_not_found(repo_id: &str) -> Self {
        Self::new(
            ErrorKind::RepositoryNotFound,
            HashMap::from([("repo_id".to_string(), repo_id.to_string())]),
        )
    }

    pub fn invalid_repository_id(repo_id: &str) -> Self {
        Self::new(
            ErrorKind::InvalidRepositoryId,
            HashMap::from([("repo_id".to_string(), repo_id.to_string())]),
        )
    }

    pub fn route_conflict(route: &str, owner: &str) -> Self {
        Self::new(
            ErrorKind::RouteConflict,
            HashMap::from([
                ("route".to_string(), route.to_string()),
                ("owner".to_string(), owner.to_string()),
            ]),
        )
    }

    pub fn process_not_managed(pid: u32) -> Self {
        Self::new(
            ErrorKind::ProcessNotManaged,
            HashMap::from([("pid".to_string(), pid.to_string())]),
        )
    }

    pub fn instance_running(repo_id: &str) -> Self {
        Self::new(
            ErrorKind::InstanceRunning,
            HashMap::from([("repo_id".to_string(), repo_id.to_string())]),
        )
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Config, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Io, message)
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Store, message)
    }

    pub fn data_dir_busy(data_dir: &Path, owner: Option<u32>) -> Self {
        let mut payload = HashMap::from([
            ("data_dir".to_string(), data_dir.display().to_string()),
            (
                "hint".to_string(),
                "a codedock server already manages this directory; use its HTTP API".to_string(),
            ),
        ]);
        if let Some(pid) = owner {
            payload.insert("owner_pid".to_string(), pid.to_string());
        }
        Self::new(ErrorKind::DataDirBusy, payload)
    }

    pub fn port_exhausted(capacity: usize) -> Self {
        Self::new(
            ErrorKind::PortExhausted,
            HashMap::from([
                ("capacity".to_string(), capacity.to_string()),
                (
                    "hint".to_string(),
                    "stop an existing instance to free a port".to_string(),
                ),
            ]),
        )
    }

    pub fn spawn_failure(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::SpawnFailure, message)
    }

    /// Spawn failure carrying the last lines the editor wrote to its log.
    pub fn spawn_failure_with_log(message: impl Into<String>, log_tail: String) -> Self {
        let mut err = Self::spawn_failure(message);
        if !log_tail.is_empty() {
            err.payload.insert("log_tail".to_string(), log_tail);
        }
        err
    }

    pub fn editor_not_installed(binary: &str) -> Self {
        Self::new(
            ErrorKind::EditorNotInstalled,
            HashMap::from([("binary".to_string(), binary.to_string())]),
        )
    }

    pub fn config_write_failure(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::ConfigWriteFailure, message)
    }

    pub fn reload_failure(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::ReloadFailure, message)
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Process, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Other, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn payload(&self) -> &HashMap<String, String> {
        &self.payload
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            let mut pairs: Vec<String> = self
                .payload
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            pairs.sort();
            write!(f, "{:?}: {}", self.kind, pairs.join(", "))
        }
    }
}

impl std::error::Error for AppError {}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct as _;
        let mut s = serializer.serialize_struct("AppError", 3)?;
        s.serialize_field("code", &self.kind.code())?;
        s.serialize_field("kind", &self.kind)?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.kind.status(), Json(self)).into_response()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::store(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::other(err.to_string())
    }
}

impl From<walkdir::Error> for AppError {
    fn from(err: walkdir::Error) -> Self {
        Self::io(err.to_string())
    }
}

#[cfg(unix)]
impl From<nix::Error> for AppError {
    fn from(err: nix::Error) -> Self {
        Self::process(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;
