//! Structured results for the host UI boundary.
//!
//! Failures are reported as `{ "ok": false, "error": "..." }` instead of
//! propagating, so a caller can show a message without crashing.

use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CommandResult<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when the failure should render as a placeholder rather than
    /// an error dialog (missing asset).
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub not_found: bool,
}

impl<T> CommandResult<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            not_found: false,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
            not_found: false,
        }
    }
}

impl<T> From<crate::error::Result<T>> for CommandResult<T> {
    fn from(result: crate::error::Result<T>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(e) => Self {
                not_found: e.is_not_found(),
                ..Self::failure(e.to_string())
            },
        }
    }
}

impl<T> From<anyhow::Result<T>> for CommandResult<T> {
    fn from(result: anyhow::Result<T>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(e) => Self::failure(format!("{e:#}")),
        }
    }
}
