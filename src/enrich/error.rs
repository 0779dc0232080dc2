use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContactOutError {
    /// 400: the request body or parameters were rejected.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// 401: the token is missing or invalid.
    #[error("bad credentials: {0}")]
    BadCredentials(String),

    /// 403 mentioning credits, or no token with enough quota left.
    #[error("out of credits: {0}")]
    OutOfCredits(String),

    /// 403 for an endpoint the token may not use.
    #[error("no access: {0}")]
    NoAccess(String),

    /// 429 still returned after the allowed retries.
    #[error("rate limited (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    #[error("remote server error {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// The lookup does not name enough of the person to be searched.
    #[error("invalid enrich request: {0}")]
    InvalidRequest(&'static str),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ContactOutError {
    /// Error for a non-success status other than 429.
    pub fn from_status(status: StatusCode, body: String) -> Self {
        match status.as_u16() {
            400 => Self::BadRequest(body),
            401 => Self::BadCredentials(body),
            403 => {
                let low = body.to_lowercase();
                if low.contains("credit") || low.contains("out of") {
                    Self::OutOfCredits(body)
                } else {
                    Self::NoAccess(body)
                }
            }
            s @ 500..=599 => Self::Remote { status: s, body },
            s => Self::Status { status: s, body },
        }
    }

    /// Errors after which another token may still succeed.
    pub fn is_token_exhausted(&self) -> bool {
        matches!(self, Self::OutOfCredits(_) | Self::NoAccess(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let e = |code: u16, body: &str| {
            ContactOutError::from_status(StatusCode::from_u16(code).unwrap(), body.to_string())
        };
        assert!(matches!(e(400, "missing name"), ContactOutError::BadRequest(_)));
        assert!(matches!(e(401, ""), ContactOutError::BadCredentials(_)));
        assert!(matches!(e(403, "You are out of credits"), ContactOutError::OutOfCredits(_)));
        assert!(matches!(e(403, "Forbidden"), ContactOutError::NoAccess(_)));
        assert!(matches!(e(503, ""), ContactOutError::Remote { status: 503, .. }));
        assert!(matches!(e(404, ""), ContactOutError::Status { status: 404, .. }));
        assert!(e(403, "Credit limit").is_token_exhausted());
        assert!(!e(500, "").is_token_exhausted());
    }
}
