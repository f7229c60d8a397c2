use axum::response::IntoResponse;
use axum::Json;
use hyper::StatusCode;
use serde_json::json;
use thiserror::Error;

use crate::{anchor, database, ipfs};

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid stream id")]
    InvalidStreamId,
    #[error("invalid cid")]
    InvalidCid,
    #[error("request not found")]
    RequestNotFound,
    #[error("invalid JSON request: {0}")]
    InvalidSerialization(#[from] serde_json::Error),
    #[error(transparent)]
    Database(#[from] database::Error),
    #[error(transparent)]
    Anchor(#[from] anchor::Error),
    #[error(transparent)]
    Store(#[from] ipfs::Error),
    #[error(transparent)]
    Elapsed(#[from] tokio::time::error::Elapsed),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    fn to_status_code(&self) -> StatusCode {
        match self {
            Self::InvalidStreamId | Self::InvalidCid | Self::InvalidSerialization(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::RequestNotFound => StatusCode::NOT_FOUND,
            Self::Elapsed(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status_code = self.to_status_code();

        // Internal detail stays in the logs; clients get the message only.
        let body = if status_code == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = ?self, "request failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };

        (status_code, Json(json!({ "error": body }))).into_response()
    }
}
