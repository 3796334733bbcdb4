//! 上传流水线的错误分类与 HTTP 状态映射。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::paths::PathError;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("the uploaded file is too big, limit is {limit} bytes")]
    SizeLimitExceeded { limit: u64 },
    #[error("error retrieving the file: {0}")]
    FileRetrieval(String),
    #[error("invalid destination: {0}")]
    PathResolution(#[from] PathError),
    #[error("failed to create directory {path:?}: {source}")]
    DirectoryCreation { path: PathBuf, source: io::Error },
    #[error("failed to write {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("response template unavailable: {0}")]
    Template(String),
}

impl UploadError {
    pub fn status(&self) -> StatusCode {
        match self {
            UploadError::SizeLimitExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::FileRetrieval(_)
            | UploadError::PathResolution(_)
            | UploadError::DirectoryCreation { .. }
            | UploadError::Write { .. }
            | UploadError::Template(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
