//! Error types for the library service

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote store returned {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("EPUB error: {0}")]
    Epub(String),

    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    #[error("Book not found: {0}")]
    BookNotFound(u64),

    #[error("Chapter {index} not found in book {book_id}")]
    ChapterNotFound { book_id: u64, index: usize },

    #[error("failed to load library: {0}")]
    LibraryLoad(String),

    #[error("failed to save library: {0}")]
    LibrarySave(String),

    #[error("Generation service error: {0}")]
    Generation(String),
}

impl Error {
    fn status(&self) -> StatusCode {
        match self {
            Error::InvalidUpload(_) | Error::Epub(_) => StatusCode::BAD_REQUEST,
            Error::BookNotFound(_) | Error::ChapterNotFound { .. } => StatusCode::NOT_FOUND,
            Error::Remote { .. }
            | Error::Http(_)
            | Error::Generation(_)
            | Error::LibraryLoad(_)
            | Error::LibrarySave(_) => StatusCode::BAD_GATEWAY,
            Error::Config(_) | Error::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{}", self);
        }
        let body = Json(serde_json::json!({
            "success": false,
            "error": self.to_string(),
        }));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::BookNotFound(3).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            Error::InvalidUpload("empty".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Remote {
                status: 500,
                message: "boom".into()
            }
            .status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_load_error_message_is_human_readable() {
        let err = Error::LibraryLoad("Remote store returned 401: Bad credentials".into());
        assert_eq!(
            err.to_string(),
            "failed to load library: Remote store returned 401: Bad credentials"
        );
    }
}
