use actix_multipart::{Field, Multipart};
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError, web};
use chrono::Utc;
use futures::TryStreamExt;
use log::{error, info, warn};
use shared::{ErrorResponse, HealthResponse};
use std::path::Path;

use crate::model::ModelError;
use crate::pipeline::{Pipeline, PipelineError};
use crate::preprocess::{PreprocessError, RawImage};

const ACCEPTED_MIME: [&str; 2] = ["image/png", "image/jpeg"];
const MAX_FLAG_BYTES: usize = 16;

/// Upload size cap in bytes, registered as app data.
#[derive(Debug, Clone, Copy)]
pub struct UploadLimit(pub usize);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("Image exceeds the {0} byte upload limit")]
    PayloadTooLarge(usize),
    #[error("Unsupported upload type '{0}', expected png, jpg or jpeg")]
    UnsupportedMedia(String),
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Preprocess(e) => ApiError::Preprocess(e),
            PipelineError::Model(e) => ApiError::Model(e),
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_)
            | ApiError::PayloadTooLarge(_)
            | ApiError::UnsupportedMedia(_)
            | ApiError::Preprocess(_) => StatusCode::BAD_REQUEST,
            ApiError::Model(ModelError::Unavailable) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Model(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
        })
    }
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/api/predict").route(web::post().to(predict)))
        .service(web::resource("/api/health").route(web::get().to(health)))
        .service(web::resource("/api/model/info").route(web::get().to(model_info)));
}

struct Upload {
    image: RawImage,
    want_heatmap: bool,
}

async fn predict(
    pipeline: web::Data<Pipeline>,
    limit: web::Data<UploadLimit>,
    mut payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let upload = read_upload(&mut payload, limit.0).await.inspect_err(|e| {
        warn!("Rejected upload: {}", e);
    })?;
    info!(
        "Predict request: {} bytes ({}), heatmap={}",
        upload.image.len(),
        upload.image.mime_type(),
        upload.want_heatmap
    );

    let pipeline = pipeline.get_ref().clone();
    let result = web::block(move || pipeline.handle_predict(&upload.image, upload.want_heatmap))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| {
            error!("Prediction failed: {}", e);
            ApiError::from(e)
        })?;
    Ok(HttpResponse::Ok().json(result.to_response()))
}

async fn health(pipeline: web::Data<Pipeline>) -> HttpResponse {
    let model_loaded = pipeline.engine().is_ready();
    HttpResponse::Ok().json(HealthResponse {
        status: if model_loaded { "healthy" } else { "degraded" }.to_string(),
        model_loaded,
        timestamp: Utc::now().to_rfc3339(),
    })
}

async fn model_info(pipeline: web::Data<Pipeline>) -> Result<HttpResponse, ApiError> {
    let model = pipeline.engine().model()?;
    Ok(HttpResponse::Ok().json(model.metadata().to_response()))
}

async fn read_upload(payload: &mut Multipart, max_bytes: usize) -> Result<Upload, ApiError> {
    let bad = |e: actix_multipart::MultipartError| ApiError::BadRequest(e.to_string());
    let mut image = None;
    let mut want_heatmap = false;

    while let Some(mut field) = payload.try_next().await.map_err(bad)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                let mime = upload_mime(&field)?;
                let mut bytes = Vec::new();
                while let Some(chunk) = field.try_next().await.map_err(bad)? {
                    if bytes.len() + chunk.len() > max_bytes {
                        return Err(ApiError::PayloadTooLarge(max_bytes));
                    }
                    bytes.extend_from_slice(&chunk);
                }
                image = Some(RawImage::new(bytes, mime));
            }
            "generate_heatmap" => {
                let mut text = Vec::new();
                while let Some(chunk) = field.try_next().await.map_err(bad)? {
                    if text.len() + chunk.len() > MAX_FLAG_BYTES {
                        return Err(ApiError::BadRequest("generate_heatmap value too long".to_string()));
                    }
                    text.extend_from_slice(&chunk);
                }
                want_heatmap = parse_flag(&String::from_utf8_lossy(&text))?;
            }
            _ => while field.try_next().await.map_err(bad)?.is_some() {},
        }
    }

    let image = image.ok_or_else(|| ApiError::BadRequest("missing 'image' field".to_string()))?;
    if image.is_empty() {
        return Err(ApiError::BadRequest("uploaded image is empty".to_string()));
    }
    Ok(Upload { image, want_heatmap })
}

/// The part's own content type when it is an accepted image type,
/// otherwise the type implied by the filename extension.
fn upload_mime(field: &Field) -> Result<String, ApiError> {
    let declared = field.content_type().map(|m| m.essence_str().to_string());
    if let Some(mime) = declared.as_deref().filter(|m| ACCEPTED_MIME.contains(m)) {
        return Ok(mime.to_string());
    }
    let filename = field
        .content_disposition()
        .and_then(|cd| cd.get_filename())
        .unwrap_or_default();
    let extension = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match extension.as_deref() {
        Some("png") => Ok("image/png".to_string()),
        Some("jpg" | "jpeg") => Ok("image/jpeg".to_string()),
        _ => Err(ApiError::UnsupportedMedia(
            declared.unwrap_or_else(|| filename.to_string()),
        )),
    }
}

fn parse_flag(value: &str) -> Result<bool, ApiError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        other => Err(ApiError::BadRequest(format!(
            "generate_heatmap must be true or false, got '{other}'"
        ))),
    }
}
