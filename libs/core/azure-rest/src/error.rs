use http::StatusCode;
use thiserror::Error;

/// Error type shared by every Azure REST call.
#[derive(Error, Debug)]
pub enum RestError {
    /// Any HTTP response with status >= 300, promoted so the retry policy
    /// can classify it.
    #[error("HTTP status {status}: {body}")]
    Status {
        status: StatusCode,
        body: String,
        /// Parsed `retry-after` header (seconds), when the service sent one.
        retry_after: Option<u64>,
    },

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A wait loop was cancelled by the user.
    #[error("Operation interrupted")]
    Interrupted,
}

pub type RestResult<T> = Result<T, RestError>;

impl RestError {
    /// Whether a retry may succeed.
    ///
    /// Retryable: HTTP 409/429/500, connect and timeout failures (covers DNS
    /// resolution), and truncated reads (unexpected EOF surfaces as an I/O or
    /// request error).
    pub fn is_retryable(&self) -> bool {
        match self {
            RestError::Status { status, .. } => {
                matches!(status.as_u16(), 409 | 429 | 500)
            }
            RestError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            RestError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// The `retry-after` value to honor, present only on throttling (429).
    pub fn throttle_retry_after(&self) -> Option<u64> {
        match self {
            RestError::Status {
                status,
                retry_after,
                ..
            } if status.as_u16() == 429 => *retry_after,
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RestError::Status { status, .. } if *status == StatusCode::NOT_FOUND)
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            RestError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_err(code: u16, retry_after: Option<u64>) -> RestError {
        RestError::Status {
            status: StatusCode::from_u16(code).unwrap(),
            body: String::new(),
            retry_after,
        }
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(status_err(409, None).is_retryable());
        assert!(status_err(429, None).is_retryable());
        assert!(status_err(500, None).is_retryable());

        assert!(!status_err(400, None).is_retryable());
        assert!(!status_err(403, None).is_retryable());
        assert!(!status_err(404, None).is_retryable());
        assert!(!status_err(502, None).is_retryable());
    }

    #[test]
    fn test_retryable_io_kinds() {
        let eof = RestError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "eof",
        ));
        assert!(eof.is_retryable());

        let denied = RestError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert!(!denied.is_retryable());
    }

    #[test]
    fn test_interrupted_is_not_retryable() {
        assert!(!RestError::Interrupted.is_retryable());
    }

    #[test]
    fn test_throttle_retry_after_only_on_429() {
        assert_eq!(status_err(429, Some(3)).throttle_retry_after(), Some(3));
        assert_eq!(status_err(500, Some(3)).throttle_retry_after(), None);
        assert_eq!(status_err(429, None).throttle_retry_after(), None);
    }

    #[test]
    fn test_is_not_found() {
        assert!(status_err(404, None).is_not_found());
        assert!(!status_err(410, None).is_not_found());
    }
}
