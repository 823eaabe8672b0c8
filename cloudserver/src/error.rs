use std::borrow::Cow;

use object_gateway::GatewayError;

/// Error taxonomy surfaced to the transport layer. Every variant maps to an
/// HTTP-style status code; anything unexpected lands in `Internal` with its
/// full anyhow chain preserved for the logs.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(Cow<'static, str>),

    #[error("{0}")]
    Forbidden(Cow<'static, str>),

    #[error("{0}")]
    Conflict(Cow<'static, str>),

    #[error("{0}")]
    BadRequest(Cow<'static, str>),

    #[error("service unavailable: {0}")]
    Unavailable(Cow<'static, str>),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::NotFound(_) => 404,
            ApiError::Forbidden(_) => 403,
            ApiError::Conflict(_) => 409,
            ApiError::BadRequest(_) => 400,
            ApiError::Unavailable(_) => 503,
            ApiError::Internal(_) => 500,
        }
    }

    pub fn file_not_found() -> Self {
        ApiError::NotFound("file not found".into())
    }

    pub fn directory_not_found() -> Self {
        ApiError::NotFound("directory not found".into())
    }
}

/// A missing object stays `NotFound`; timeouts and cancellations are not the
/// caller's fault and bubble up as internal.
impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::NotFound => ApiError::file_not_found(),
            other => ApiError::Internal(anyhow::Error::new(other)),
        }
    }
}

impl From<kv_store::KvError> for ApiError {
    fn from(err: kv_store::KvError) -> Self {
        ApiError::Internal(anyhow::Error::new(err))
    }
}
