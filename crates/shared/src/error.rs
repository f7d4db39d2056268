//! Shared error types including RFC7807 Problem Details.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// RFC7807 Problem Details (application/problem+json)
///
/// The broadcasting auth endpoint answers refusals with this envelope. The
/// client only reads it to put something meaningful in the logs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProblemDetails {
    #[serde(rename = "type", default)]
    pub type_url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Laravel-style `{ "message": "..." }` bodies land here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Attempt to parse an RFC7807 (or RFC7807-ish) JSON body into a user-facing message.
/// Prefers `detail`, then `message`, then `title`.
pub fn try_problem_detail(body: &str) -> Option<String> {
    let parsed = serde_json::from_str::<ProblemDetails>(body).ok()?;
    [parsed.detail, parsed.message, Some(parsed.title)]
        .into_iter()
        .flatten()
        .find(|s| !s.trim().is_empty())
}

/// HTTP-level failure talking to the REST side (the broadcasting auth endpoint).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request timed out")]
    Timeout,
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Deserialization error: {0}")]
    Deserialize(String),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Http { status: 401, .. })
    }

    /// Short description for logs; unwraps problem+json bodies.
    pub fn summary(&self) -> String {
        match self {
            ApiError::Http { status, body } => match try_problem_detail(body) {
                Some(detail) => format!("HTTP {status}: {detail}"),
                None => format!("HTTP {status}"),
            },
            other => other.to_string(),
        }
    }
}

/// Frames or payloads that do not follow the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("frame has no event name")]
    MissingEvent,
    #[error("auth response missing `auth`: {0}")]
    InvalidAuthResponse(String),
    #[error("auth endpoint rejected the channel")]
    Rejected,
}
