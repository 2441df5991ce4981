//! Error taxonomy shared by every gkeship crate.

use serde::{Deserialize, Serialize};

/// Failure kinds surfaced by reconciliation and rollout.
///
/// `NotFound` is the only recoverable kind: it drives create-if-absent and
/// "nothing to delete" decisions. Everything else propagates to the
/// per-cluster or per-script boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("operation {operation} did not complete successfully (status {status})")]
    OperationFailed { operation: String, status: String },
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("configuration: {0}")]
    ConfigurationInvalid(String),
    #[error("failed to execute cmd ({}): {command}", code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()))]
    ExternalToolFailure { command: String, code: Option<i32>, stderr: String },
    #[error("cloud api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self { Error::ConfigurationInvalid(msg.into()) }

    pub fn not_found(what: impl Into<String>) -> Self { Error::NotFound(what.into()) }

    pub fn is_not_found(&self) -> bool { matches!(self, Error::NotFound(_)) }

    /// Coarse classification used in failure reports.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::OperationFailed { .. } => ErrorKind::OperationFailed,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::ConfigurationInvalid(_) | Error::Json(_) | Error::Yaml(_) => ErrorKind::ConfigurationInvalid,
            Error::ExternalToolFailure { .. } => ErrorKind::ExternalToolFailure,
            Error::Api { .. } | Error::Io(_) => ErrorKind::Transport,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    OperationFailed,
    Timeout,
    ConfigurationInvalid,
    ExternalToolFailure,
    Transport,
}

pub type Result<T> = std::result::Result<T, Error>;
