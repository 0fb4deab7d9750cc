//!
//! wikipath error model
//! --------------------
//! Common error enum shared by the search engine, the upstream client and the
//! HTTP surface, along with mapping helpers. Every failure a client can see is
//! one of these variants; the `kind` tag is what goes over the event stream.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AppError {
    InvalidInput { message: String },
    TitleUnknown { message: String },
    UpstreamUnavailable { message: String },
    NoPath { message: String },
    TimedOut { message: String },
    Internal { message: String },
}

impl AppError {
    pub fn kind_str(&self) -> &'static str {
        match self {
            AppError::InvalidInput { .. } => "invalid_input",
            AppError::TitleUnknown { .. } => "title_unknown",
            AppError::UpstreamUnavailable { .. } => "upstream_unavailable",
            AppError::NoPath { .. } => "no_path",
            AppError::TimedOut { .. } => "timed_out",
            AppError::Internal { .. } => "internal",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::InvalidInput { message }
            | AppError::TitleUnknown { message }
            | AppError::UpstreamUnavailable { message }
            | AppError::NoPath { message }
            | AppError::TimedOut { message }
            | AppError::Internal { message } => message.as_str(),
        }
    }

    pub fn invalid_input<S: Into<String>>(msg: S) -> Self { AppError::InvalidInput { message: msg.into() } }
    pub fn title_unknown<S: Into<String>>(msg: S) -> Self { AppError::TitleUnknown { message: msg.into() } }
    pub fn upstream_unavailable<S: Into<String>>(msg: S) -> Self { AppError::UpstreamUnavailable { message: msg.into() } }
    pub fn no_path<S: Into<String>>(msg: S) -> Self { AppError::NoPath { message: msg.into() } }
    pub fn timed_out<S: Into<String>>(msg: S) -> Self { AppError::TimedOut { message: msg.into() } }
    pub fn internal<S: Into<String>>(msg: S) -> Self { AppError::Internal { message: msg.into() } }

    /// Map to HTTP status code for the non-streaming endpoints.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::InvalidInput { .. } => 400,
            AppError::TitleUnknown { .. } => 404,
            AppError::UpstreamUnavailable { .. } => 503,
            AppError::NoPath { .. } => 404,
            AppError::TimedOut { .. } => 504,
            AppError::Internal { .. } => 500,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind_str(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal { message: err.to_string() }
    }
}
