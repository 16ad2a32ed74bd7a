use rocket::http::Status;
use rocket::request::Request;
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use thiserror::Error;

use crate::types::ErrorResponse;

/// Everything that can go wrong while turning one upload into one caption.
#[derive(Debug, Error)]
pub enum CaptionError {
    #[error("No image uploaded")]
    MissingImage,

    #[error("cannot identify image file: {0}")]
    InvalidImage(#[from] image::ImageError),

    #[error("uploaded image exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    #[error("failed to read upload: {0}")]
    Upload(#[from] std::io::Error),

    #[error("inference failed: {0}")]
    Inference(#[from] candle_core::Error),

    #[error("failed to decode tokens: {0}")]
    Detokenize(String),

    #[error("inference worker failed: {0}")]
    Worker(String),
}

impl CaptionError {
    /// HTTP status each error kind is reported with.
    pub fn status(&self) -> Status {
        match self {
            CaptionError::MissingImage => Status::BadRequest,
            CaptionError::InvalidImage(_)
            | CaptionError::TooLarge { .. }
            | CaptionError::Upload(_)
            | CaptionError::Inference(_)
            | CaptionError::Detokenize(_)
            | CaptionError::Worker(_) => Status::InternalServerError,
        }
    }
}

impl<'r> Responder<'r, 'static> for CaptionError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        if status == Status::InternalServerError {
            tracing::error!(error = %self, "caption request failed");
        } else {
            tracing::warn!(error = %self, "caption request rejected");
        }

        let body = ErrorResponse {
            error: self.to_string(),
        };
        (status, Json(body)).respond_to(req)
    }
}
