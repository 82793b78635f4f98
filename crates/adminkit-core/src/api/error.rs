use serde::Deserialize;
use thiserror::Error;

/// Failure taxonomy for API calls.
///
/// Every outcome the backend can produce lands in exactly one class:
/// `Rejected` is a business-level refusal (the server understood the
/// request and an application rule denied it - wrong captcha, duplicate
/// username), `Unauthorized` is an authentication-level rejection of the
/// access token, and `SessionExpired` is terminal - the refresh protocol
/// failed and the caller must sign in again. The remaining variants are
/// transport-level: no usable response was obtained, and a caller may
/// retry with backoff. Only `Unauthorized` ever triggers a refresh.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{message}")]
    Rejected { code: i64, message: String },

    #[error("Unauthorized - access token rejected")]
    Unauthorized,

    #[error("Session expired - please sign in again")]
    SessionExpired,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Credential store error: {0}")]
    Storage(#[from] crate::auth::StoreError),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Error envelope the backend attaches to business rejections.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<i64>,
    message: Option<String>,
    title: Option<String>,
}

impl ApiError {
    /// Truncate a response body to avoid carrying excessive data around
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            // Back off to a char boundary; error bodies are often
            // multibyte text.
            let mut cut = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            format!(
                "{}... (truncated, {} total bytes)",
                &body[..cut],
                body.len()
            )
        }
    }

    /// Classify a non-success response by status code and body.
    ///
    /// Total over anything the server can send back: a 4xx without a
    /// readable error envelope and any 5xx both count as transport-level,
    /// since no usable answer was obtained.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            400..=499 => match serde_json::from_str::<ErrorBody>(body) {
                Ok(parsed) => {
                    let message = parsed
                        .message
                        .or(parsed.title)
                        .unwrap_or_else(|| Self::truncate_body(body));
                    let code = parsed.code.unwrap_or_else(|| i64::from(status.as_u16()));
                    ApiError::Rejected { code, message }
                }
                Err(_) => ApiError::InvalidResponse(format!(
                    "Status {}: {}",
                    status,
                    Self::truncate_body(body)
                )),
            },
            500..=599 => ApiError::ServerError(Self::truncate_body(body)),
            _ => ApiError::InvalidResponse(format!(
                "Status {}: {}",
                status,
                Self::truncate_body(body)
            )),
        }
    }

    /// Transport-level failures may be retried by the caller; nothing
    /// else should be.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ApiError::ServerError(_) | ApiError::Network(_) | ApiError::InvalidResponse(_)
        )
    }
}
