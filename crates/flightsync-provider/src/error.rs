use std::time::Duration;

use flightsync_core::{ErrorCode, SyncError};
use reqwest::StatusCode;
use thiserror::Error;

/// Every provider failure is classified into the closed [`ErrorCode`] taxonomy.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("{code}: {message}")]
    Classified {
        code: ErrorCode,
        message: String,
        status: Option<u16>,
        retry_after: Option<Duration>,
    },
    #[error("provider request cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Classified {
            code,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn with_status(self, status: u16) -> Self {
        match self {
            Self::Classified {
                code,
                message,
                retry_after,
                ..
            } => Self::Classified {
                code,
                message,
                status: Some(status),
                retry_after,
            },
            other => other,
        }
    }

    pub fn with_retry_after(self, hint: Option<Duration>) -> Self {
        match self {
            Self::Classified {
                code,
                message,
                status,
                ..
            } => Self::Classified {
                code,
                message,
                status,
                retry_after: hint,
            },
            other => other,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Classified { code, .. } => *code,
            Self::Cancelled => ErrorCode::NetworkError,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Classified { status, .. } => *status,
            Self::Cancelled => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Classified { retry_after, .. } => *retry_after,
            Self::Cancelled => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Classified { code, .. } => code.is_transient(),
            Self::Cancelled => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn to_sync_error(&self) -> SyncError {
        let mut err = SyncError::new(self.code(), self.to_string());
        if let Some(status) = self.status() {
            err = err.with_detail("http_status", status);
        }
        if self.is_cancelled() {
            err = err.with_detail("cancelled", true);
        }
        err
    }
}

/// What a request was addressed to, which decides how 403/404 are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestScope<'a> {
    Base,
    Table(&'a str),
}

pub fn classify_status(
    status: StatusCode,
    scope: RequestScope<'_>,
    error_type: Option<&str>,
) -> ErrorCode {
    match (status.as_u16(), error_type) {
        (401, _) => ErrorCode::InvalidApiKey,
        (403, _) => match scope {
            RequestScope::Base => ErrorCode::AuthenticationFailed,
            RequestScope::Table(_) => ErrorCode::TableAccessDenied,
        },
        (404, Some("TABLE_NOT_FOUND")) => ErrorCode::TableNotFound,
        (404, _) => match scope {
            RequestScope::Base => ErrorCode::InvalidBaseId,
            RequestScope::Table(_) => ErrorCode::TableNotFound,
        },
        (408, _) => ErrorCode::RequestTimeout,
        (422, Some("UNKNOWN_FIELD_NAME")) => ErrorCode::FieldNotFound,
        (422, _) => ErrorCode::InvalidFormat,
        (429, _) => ErrorCode::RateLimited,
        (code, _) if (500..600).contains(&code) => ErrorCode::NetworkError,
        _ => ErrorCode::Unknown,
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> ErrorCode {
    if err.is_timeout() {
        ErrorCode::RequestTimeout
    } else if err.is_decode() {
        ErrorCode::InvalidFormat
    } else {
        ErrorCode::NetworkError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_depends_on_scope() {
        let table = RequestScope::Table("Pilots");
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, RequestScope::Base, None),
            ErrorCode::InvalidApiKey
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, RequestScope::Base, Some("NOT_FOUND")),
            ErrorCode::InvalidBaseId
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, table, None),
            ErrorCode::TableNotFound
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, RequestScope::Base, None),
            ErrorCode::AuthenticationFailed
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, table, None),
            ErrorCode::TableAccessDenied
        );
        assert_eq!(
            classify_status(
                StatusCode::UNPROCESSABLE_ENTITY,
                table,
                Some("UNKNOWN_FIELD_NAME")
            ),
            ErrorCode::FieldNotFound
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, table, None),
            ErrorCode::RateLimited
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, table, None),
            ErrorCode::NetworkError
        );
        assert_eq!(
            classify_status(StatusCode::IM_A_TEAPOT, table, None),
            ErrorCode::Unknown
        );
    }

    #[test]
    fn builder_keeps_classification() {
        let err = ProviderError::new(ErrorCode::RateLimited, "slow down")
            .with_status(429)
            .with_retry_after(Some(Duration::from_secs(30)));
        assert!(err.is_transient());
        assert_eq!(err.status(), Some(429));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));

        let structured = err.to_sync_error();
        assert_eq!(structured.code, ErrorCode::RateLimited);
        assert_eq!(structured.details["http_status"], 429);
    }

    #[test]
    fn cancellation_is_not_retried() {
        assert!(!ProviderError::Cancelled.is_transient());
        assert!(ProviderError::Cancelled.is_cancelled());
    }
}
