//! Error taxonomy surfaced to command callers.
//!
//! Component errors stay close to the code that raises them; this module folds
//! them into the small set of kinds a UI or CLI needs to react to.

use serde::{Serialize, Serializer};

use crate::core::content::pipeline::PipelineError;
use crate::core::feed::fetcher::FetchFailure;
use crate::core::feed::parser::FeedParseError;
use crate::core::importer::ImportError;
use crate::core::llm::client::LlmError;
use crate::core::storage::repository::StorageError;
use crate::core::sync::scheduler::SchedulerError;
use crate::core::sync::worker::WorkerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseErrorKind {
    UnsupportedFormat,
    MalformedXml,
    MalformedJson,
}

#[derive(Debug, thiserror::Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Failure saving or loading a persisted setting.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("network error: {0}")]
    Network(String),
    #[error("http error: status {0}")]
    Http(u16),
    #[error("parse error ({kind:?}): {message}")]
    Parse { kind: ParseErrorKind, message: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("authentication rejected by provider (status {0})")]
    Auth(u16),
    #[error("rate limited by provider")]
    RateLimited,
    #[error("provider server error (status {0})")]
    Server(u16),
    #[error("request timed out")]
    Timeout,
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

impl CommandError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network_error",
            Self::Http(_) => "http_error",
            Self::Parse { .. } => "parse_error",
            Self::Validation(_) => "validation_error",
            Self::Auth(_) => "auth_error",
            Self::RateLimited => "rate_limited",
            Self::Server(_) => "server_error",
            Self::Timeout => "timeout",
            Self::InvalidResponse(_) => "invalid_response",
            Self::Storage(_) => "storage_error",
            Self::NotFound(_) => "not_found",
            Self::UnknownCommand(_) => "unknown_command",
        }
    }
}

impl Serialize for CommandError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("CommandError", 2)?;
        state.serialize_field("kind", self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

impl From<ValidationError> for CommandError {
    fn from(error: ValidationError) -> Self {
        Self::Validation(error.to_string())
    }
}

impl From<StorageError> for CommandError {
    fn from(error: StorageError) -> Self {
        Self::Storage(error.to_string())
    }
}

impl From<SettingsError> for CommandError {
    fn from(error: SettingsError) -> Self {
        match error {
            SettingsError::Validation(inner) => inner.into(),
            SettingsError::Storage(inner) => inner.into(),
        }
    }
}

impl From<FeedParseError> for CommandError {
    fn from(error: FeedParseError) -> Self {
        Self::Parse {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl From<FetchFailure> for CommandError {
    fn from(error: FetchFailure) -> Self {
        match error {
            FetchFailure::Network(message) => Self::Network(message),
            FetchFailure::Http(status) => Self::Http(status),
        }
    }
}

impl From<ImportError> for CommandError {
    fn from(error: ImportError) -> Self {
        match error {
            ImportError::Opml(message) => Self::Parse {
                kind: ParseErrorKind::MalformedXml,
                message,
            },
            ImportError::Json(inner) => Self::Parse {
                kind: ParseErrorKind::MalformedJson,
                message: inner.to_string(),
            },
            ImportError::UnsupportedFormat(format) => Self::Validation(format!(
                "unsupported import format: {format}"
            )),
            ImportError::Storage(inner) => inner.into(),
        }
    }
}

impl From<LlmError> for CommandError {
    fn from(error: LlmError) -> Self {
        match error {
            LlmError::InvalidConfig(inner) => inner.into(),
            LlmError::Auth(status) => Self::Auth(status),
            LlmError::RateLimited => Self::RateLimited,
            LlmError::Server(status) => Self::Server(status),
            LlmError::Http(status) => Self::Http(status),
            LlmError::Timeout => Self::Timeout,
            LlmError::Network(message) => Self::Network(message),
            LlmError::InvalidResponse(message) => Self::InvalidResponse(message),
        }
    }
}

impl From<PipelineError> for CommandError {
    fn from(error: PipelineError) -> Self {
        match error {
            PipelineError::EntryNotFound(id) => Self::NotFound(format!("entry {id}")),
            PipelineError::Llm(inner) => inner.into(),
            PipelineError::Storage(inner) => inner.into(),
        }
    }
}

impl From<WorkerError> for CommandError {
    fn from(error: WorkerError) -> Self {
        match error {
            WorkerError::SourceNotFound(id) => Self::NotFound(format!("source {id}")),
            WorkerError::Storage(inner) => inner.into(),
        }
    }
}

impl From<SchedulerError> for CommandError {
    fn from(error: SchedulerError) -> Self {
        match error {
            SchedulerError::Storage(inner) => inner.into(),
            SchedulerError::Worker(inner) => inner.into(),
            SchedulerError::AlreadyRunning => {
                Self::Validation("a sync batch is already running".to_string())
            }
        }
    }
}
