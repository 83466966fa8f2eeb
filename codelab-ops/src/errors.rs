use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Backing errors for all credential, KMS, storage and envelope operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed API ({message})")]
    API { message: String, is_retryable: bool },
    #[error("failed for other reasons ({message})")]
    Other { message: String, is_retryable: bool },
}

impl Error {
    /// Returns the error message in "String".
    #[inline]
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Error::API { message, .. } | Error::Other { message, .. } => message.clone(),
        }
    }

    /// Returns if the error is retryable.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::API { is_retryable, .. } | Error::Other { is_retryable, .. } => *is_retryable,
        }
    }

    pub(crate) fn other(message: impl Into<String>) -> Self {
        Error::Other {
            message: message.into(),
            is_retryable: false,
        }
    }

    /// Maps a failed HTTP exchange. Timeouts, connection failures, throttling
    /// and server-side errors are worth another attempt.
    pub(crate) fn from_reqwest(op: &str, e: reqwest::Error) -> Self {
        let is_retryable = e.is_timeout()
            || e.is_connect()
            || e
                .status()
                .map(|s| s.is_server_error() || s.as_u16() == 429)
                .unwrap_or(false);
        Error::API {
            message: format!("failed {op} ({e})"),
            is_retryable,
        }
    }

    pub(crate) fn from_status(op: &str, status: reqwest::StatusCode, body: &str) -> Self {
        Error::API {
            message: format!("failed {op} (status {status}, body '{}')", body.trim()),
            is_retryable: status.is_server_error() || status.as_u16() == 429,
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
    }
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- errors::test_error --exact --show-output
#[test]
fn test_error() {
    let e = Error::API {
        message: String::from("failed decrypt"),
        is_retryable: true,
    };
    assert_eq!(e.message(), "failed decrypt");
    assert!(e.is_retryable());
    assert_eq!(e.to_string(), "failed API (failed decrypt)");

    let e = Error::other("bad nonce");
    assert!(!e.is_retryable());

    let io_err: std::io::Error = e.into();
    assert_eq!(io_err.kind(), std::io::ErrorKind::Other);
    assert!(io_err.to_string().contains("bad nonce"));

    let e = Error::from_status("encrypt", reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down\n");
    assert!(e.is_retryable());
    assert!(e.message().ends_with("body 'slow down')"));
    let e = Error::from_status("encrypt", reqwest::StatusCode::FORBIDDEN, "");
    assert!(!e.is_retryable());
}
