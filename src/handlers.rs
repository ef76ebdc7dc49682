//! HTTP handlers for the photo service API

use crate::database::Photo;
use crate::encoder::{EncodedBuffer, OutputFormat};
use crate::error::ApiError;
use crate::pipeline::TransformRequest;
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Path, Query, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{de, Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const PICSUM_ID: HeaderName = HeaderName::from_static("picsum-id");

const CACHE_RANDOM: &str = "no-cache, no-store, must-revalidate";
const CACHE_STABLE: &str = "public, max-age=2592000";

const DEFAULT_LIST_LIMIT: usize = 30;
const MAX_LIST_LIMIT: usize = 100;

/// Blur applied for a bare `?blur`.
const DEFAULT_BLUR: u8 = 5;
const MAX_BLUR: u8 = 10;

/// Photo metadata as returned by the API.
#[derive(Debug, Serialize, Deserialize)]
pub struct PhotoInfo {
    pub id: String,
    pub author: String,
    pub width: u32,
    pub height: u32,
    pub url: String,
    pub download_url: String,
}

impl PhotoInfo {
    fn new(photo: Photo, base_url: &str) -> Self {
        let download_url = format!(
            "{base_url}/id/{}/{}/{}",
            photo.id, photo.width, photo.height
        );
        Self {
            id: photo.id,
            author: photo.author,
            width: photo.width,
            height: photo.height,
            url: photo.url,
            download_url,
        }
    }
}

/// Health check endpoint
///
/// 200 while the metadata store answers and the engine is ready, 503 otherwise.
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let status = state.health.status();
    let engine = state.engine.state();
    let healthy = status.healthy && engine == crate::engine::EngineState::Ready;

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(serde_json::json!({
            "healthy": healthy,
            "database": status,
            "engine": engine.to_string(),
        })),
    )
        .into_response()
}

/// Service limits and current capacity
pub async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "endpoint": "/api/transform",
        "method": "POST",
        "description": "Resize, grayscale, blur and re-encode an uploaded image",
        "query": {
            "width": "Target width (optional, requires height)",
            "height": "Target height (optional, requires width)",
            "grayscale": "Flag, bare or true/false, to drop colour (optional)",
            "blur": format!("Gaussian sigma, greater than 0 and at most {} (optional)", crate::pipeline::MAX_BLUR_SIGMA),
            "format": "jpeg or webp (optional, default jpeg)"
        },
        "limits": {
            "max_file_size": format!("{}MB", state.config.max_file_size / 1024 / 1024),
            "max_resolution": format!("{}x{}", state.config.max_resolution, state.config.max_resolution),
            "max_output_dimension": state.config.max_output_dimension,
        },
        "workers": {
            "available": state.worker_pool.available_permits(),
            "in_flight": state.worker_pool.in_flight(),
        }
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    page: Option<usize>,
    limit: Option<usize>,
}

/// `GET /v2/list`
pub async fn list_photos(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<PhotoInfo>>, ApiError> {
    let Query(query) = query.map_err(bad_query)?;
    let page = query.page.unwrap_or(1).max(1);
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let photos = state.database.list(page, limit)?;
    let base_url = &state.config.image_service_url;

    Ok(Json(
        photos
            .into_iter()
            .map(|photo| PhotoInfo::new(photo, base_url))
            .collect(),
    ))
}

/// `GET /id/{id}/info`
pub async fn photo_info(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<PhotoInfo>, ApiError> {
    let photo = state.database.get(&id)?;
    Ok(Json(PhotoInfo::new(photo, &state.config.image_service_url)))
}

/// `GET /{width}/{height}`
#[instrument(skip(state, query))]
pub async fn random_image(
    State(state): State<Arc<AppState>>,
    Path((width, height)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let size = parse_size(&width, &height, state.config.max_output_dimension)?;
    let effects = Effects::from_query(&query)?;

    let seed = Uuid::new_v4().as_u64_pair().0;
    let photo = state.database.random(seed)?;

    serve_image(&state, photo, size, effects, CACHE_RANDOM).await
}

/// `GET /seed/{seed}/{width}/{height}`
#[instrument(skip(state, query))]
pub async fn seeded_image(
    State(state): State<Arc<AppState>>,
    Path((seed, width, height)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let size = parse_size(&width, &height, state.config.max_output_dimension)?;
    let effects = Effects::from_query(&query)?;

    let photo = state.database.random(seed_hash(&seed))?;

    serve_image(&state, photo, size, effects, CACHE_STABLE).await
}

/// `GET /id/{id}/{width}/{height}`
#[instrument(skip(state, query))]
pub async fn image_by_id(
    State(state): State<Arc<AppState>>,
    Path((id, width, height)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let size = parse_size(&width, &height, state.config.max_output_dimension)?;
    let effects = Effects::from_query(&query)?;

    let photo = state.database.get(&id)?;

    serve_image(&state, photo, size, effects, CACHE_STABLE).await
}

#[derive(Debug, Deserialize)]
pub struct TransformQuery {
    width: Option<u32>,
    height: Option<u32>,
    #[serde(default, deserialize_with = "flag")]
    grayscale: bool,
    blur: Option<f32>,
    #[serde(default)]
    format: OutputFormat,
}

/// A query flag: bare (`?grayscale`), `true`/`1` or `false`/`0`.
fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    match value.as_str() {
        "" | "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(de::Error::custom(format!("invalid flag value `{other}`"))),
    }
}

fn bad_query(rejection: QueryRejection) -> ApiError {
    ApiError::BadRequest(rejection.body_text())
}

impl TryFrom<TransformQuery> for TransformRequest {
    type Error = ApiError;

    fn try_from(query: TransformQuery) -> Result<Self, Self::Error> {
        let resize = match (query.width, query.height) {
            (Some(width), Some(height)) => Some((width, height)),
            (None, None) => None,
            _ => {
                return Err(ApiError::BadRequest(
                    "width and height must be given together".to_string(),
                ))
            }
        };

        Ok(TransformRequest {
            resize,
            grayscale: query.grayscale,
            blur: query.blur,
            format: query.format,
        })
    }
}

/// Transform an uploaded image
///
/// The raw request body is the source image (JPEG, PNG or WebP).
#[instrument(skip(state, body))]
pub async fn transform_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<TransformQuery>, QueryRejection>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(bad_query)?;
    let request = TransformRequest::try_from(query)?;

    info!(
        size = body.len(),
        format = %request.format,
        "Processing transform request"
    );

    let encoded = state.worker_pool.process(body, request, None).await?;

    // Millisecond timestamp: numeric, unique enough and ordered.
    let output_name = format!(
        "{}.{}",
        Utc::now().timestamp_millis(),
        encoded.format().extension()
    );

    info!(output_name = %output_name, size = encoded.len(), "Transform complete");

    let disposition = format!("attachment; filename=\"{}\"", output_name);

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, encoded.format().content_type()),
            (header::CONTENT_DISPOSITION, disposition.as_str()),
        ],
        encoded.into_bytes(),
    )
        .into_response())
}

/// Grayscale and blur options shared by the image routes.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct Effects {
    grayscale: bool,
    blur: Option<f32>,
}

impl Effects {
    fn from_query(query: &HashMap<String, String>) -> Result<Self, ApiError> {
        let blur = match query.get("blur").map(String::as_str) {
            None => None,
            Some("") => Some(DEFAULT_BLUR),
            Some(value) => match value.parse::<u8>() {
                Ok(amount) if (1..=MAX_BLUR).contains(&amount) => Some(amount),
                _ => return Err(ApiError::BadRequest("Invalid blur amount".to_string())),
            },
        };

        Ok(Self {
            grayscale: query.contains_key("grayscale"),
            blur: blur.map(f32::from),
        })
    }
}

/// Requested output size and format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Size {
    width: u32,
    height: u32,
    format: OutputFormat,
}

/// Parse `{width}/{height}[.ext]`.
fn parse_size(width: &str, height: &str, max_dimension: u32) -> Result<Size, ApiError> {
    let (height, format) = match height.split_once('.') {
        Some((height, ext)) => {
            let format = OutputFormat::from_extension(ext)
                .ok_or_else(|| ApiError::BadRequest("Invalid file extension".to_string()))?;
            (height, format)
        }
        None => (height, OutputFormat::Jpeg),
    };

    let parse = |value: &str| {
        value
            .parse::<u32>()
            .ok()
            .filter(|n| (1..=max_dimension).contains(n))
            .ok_or_else(|| ApiError::BadRequest("Invalid size".to_string()))
    };

    Ok(Size {
        width: parse(width)?,
        height: parse(height)?,
        format,
    })
}

/// FNV-1a, stable across processes and releases.
fn seed_hash(seed: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    seed.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(PRIME)
    })
}

async fn serve_image(
    state: &AppState,
    photo: Photo,
    size: Size,
    effects: Effects,
    cache_control: &'static str,
) -> Result<Response, ApiError> {
    let source = state.storage.get(&photo.id).await?;

    let request = TransformRequest {
        resize: Some((size.width, size.height)),
        grayscale: effects.grayscale,
        blur: effects.blur,
        format: size.format,
    };
    let comment = format!("Picsum ID: {}", photo.id);

    let encoded = state
        .worker_pool
        .process(source, request, Some(comment))
        .await?;

    debug!(
        id = %photo.id,
        width = size.width,
        height = size.height,
        format = %size.format,
        bytes = encoded.len(),
        "Serving image"
    );

    image_response(&photo.id, size, encoded, cache_control)
}

fn image_response(
    id: &str,
    size: Size,
    encoded: EncodedBuffer,
    cache_control: &'static str,
) -> Result<Response, ApiError> {
    let disposition = format!(
        "inline; filename=\"{id}-{}x{}.{}\"",
        size.width,
        size.height,
        size.format.extension()
    );
    let disposition = HeaderValue::from_str(&disposition)
        .map_err(|_| ApiError::BadRequest("Invalid image id".to_string()))?;
    let picsum_id = HeaderValue::from_str(id)
        .map_err(|_| ApiError::BadRequest("Invalid image id".to_string()))?;

    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static(encoded.format().content_type()),
            ),
            (header::CONTENT_DISPOSITION, disposition),
            (PICSUM_ID, picsum_id),
            (header::CACHE_CONTROL, HeaderValue::from_static(cache_control)),
        ],
        encoded.into_bytes(),
    )
        .into_response())
}
