use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Service-wide error type.
///
/// Background tasks never propagate these to callers; they are logged and
/// dropped. Metadata failures on the read path degrade the cache to a miss
/// instead of failing the request.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("unknown transformation: {0}")]
    UnknownPreset(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("max file size exceeded")]
    OversizeUpload,

    #[error("cannot decode image: {0}")]
    Decode(String),

    #[error("cannot encode image: {0}")]
    Encode(String),

    #[error("storage error: {0}")]
    StorageIo(String),

    #[error("metadata store error: {0}")]
    MetadataIo(String),

    #[error("text rendering error: {0}")]
    TextRender(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::StorageIo(err.to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::MetadataIo(err.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match self {
            Error::InvalidParameter(_)
            | Error::UnknownPreset(_)
            | Error::OversizeUpload
            | Error::Decode(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Encode(_)
            | Error::StorageIo(_)
            | Error::MetadataIo(_)
            | Error::TextRender(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
