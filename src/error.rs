//! Custom error types for puw.

use thiserror::Error;

/// Errors that can occur while fetching or interpreting upgrade status.
#[derive(Error, Debug)]
pub enum PuwError {
    #[error("status request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("status endpoint returned HTTP {status}: {details}")]
    Endpoint { status: u16, details: String },

    #[error("malformed status response: {0}")]
    Malformed(String),

    #[error("step '{0}' missing from status response")]
    MissingStep(String),

    #[error("unknown upgrade step '{0}'")]
    UnknownStep(String),
}

impl PuwError {
    /// Build an `Endpoint` error from a non-success response body.
    ///
    /// The admin server reports failures as `{ "errors": ... }`; when that
    /// shape is present the errors value is carried verbatim, otherwise the
    /// raw body (truncated) is used so the operator still sees something.
    pub fn endpoint(status: u16, body: &str) -> Self {
        Self::Endpoint {
            status,
            details: extract_error_details(body),
        }
    }
}

/// Extract a meaningful detail string from an error response body.
fn extract_error_details(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body)
        && let Some(errors) = value.get("errors")
        && !errors.is_null()
    {
        return errors.to_string();
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "no error details provided".to_string();
    }

    // Keep log lines bounded even if the server returns an HTML error page.
    const MAX_DETAIL_LEN: usize = 200;
    if trimmed.len() > MAX_DETAIL_LEN {
        let mut end = MAX_DETAIL_LEN;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &trimmed[..end])
    } else {
        trimmed.to_string()
    }
}
