use std::collections::BTreeMap;
use std::sync::Arc;

use rocket::form::error::ErrorKind;
use rocket::form::{self, Errors, Form};
use rocket::fs::TempFile;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::tokio::io::AsyncReadExt;
use rocket::{catch, get, post, FromForm, Request, State};

use crate::app_state::AppState;
use crate::error::CaptionError;
use crate::types::{CaptionResponse, ErrorResponse, HealthResponse, IndexResponse};

#[derive(FromForm)]
pub struct CaptionUpload<'r> {
    image: form::Result<'r, TempFile<'r>>,
}

#[get("/")]
pub async fn index(state: &State<Arc<AppState>>) -> Json<IndexResponse> {
    let mut endpoints = BTreeMap::new();
    endpoints.insert(
        "POST /caption".to_string(),
        "Upload an image to receive a caption.".to_string(),
    );
    endpoints.insert("GET /health".to_string(), "Liveness check.".to_string());

    Json(IndexResponse {
        message: "🖼️ Image Captioning API is running.".to_string(),
        model: state.model_id().to_string(),
        endpoints,
    })
}

#[get("/health")]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[post("/caption", data = "<upload>")]
pub async fn caption<'r>(
    state: &State<Arc<AppState>>,
    upload: Result<Form<CaptionUpload<'r>>, Errors<'r>>,
) -> Result<Json<CaptionResponse>, CaptionError> {
    let image = match upload.and_then(|form| form.into_inner().image) {
        // Plain text parts carry no filename and are not uploads.
        Ok(file) if file.raw_name().is_some() => file,
        Ok(_) => return Err(CaptionError::MissingImage),
        Err(errors) => return Err(upload_error(&errors)),
    };

    let bytes = read_upload(&image).await?;
    tracing::info!(
        bytes = bytes.len(),
        content_type = ?image.content_type(),
        "captioning upload"
    );

    let caption = state.engine.caption(bytes).await?;
    Ok(Json(CaptionResponse { caption }))
}

/// Bodies that are not forms at all never reach [`caption`].
#[post("/caption", rank = 2)]
pub fn caption_without_form() -> CaptionError {
    CaptionError::MissingImage
}

#[catch(default)]
pub fn default_catcher(status: Status, req: &Request<'_>) -> (Status, Json<ErrorResponse>) {
    tracing::debug!(%status, uri = %req.uri(), "request caught");
    (
        status,
        Json(ErrorResponse {
            error: status.reason_lossy().to_string(),
        }),
    )
}

/// An over-limit `image` was sent, so it is not reported as missing.
fn upload_error(errors: &Errors<'_>) -> CaptionError {
    let limit = errors.iter().find_map(|e| match e.kind {
        ErrorKind::InvalidLength { max: Some(max), .. } => Some(max),
        _ => None,
    });

    match limit {
        Some(limit) => CaptionError::TooLarge { limit },
        None => {
            tracing::debug!(%errors, "no usable image field");
            CaptionError::MissingImage
        }
    }
}

async fn read_upload(file: &TempFile<'_>) -> std::io::Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(file.len() as usize);
    let reader = file.open().await?;
    rocket::tokio::pin!(reader);
    reader.read_to_end(&mut bytes).await?;
    Ok(bytes)
}
