use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    request_id::MakeRequestUuid,
    services::ServeDir,
    set_header::SetResponseHeaderLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
    ServiceBuilderExt,
};

use crate::handlers::{
    health, image_by_id, info, list_photos, photo_info, random_image, seeded_image,
    transform_handler,
};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([header::CONTENT_DISPOSITION]);

    // Security Headers
    // - X-Content-Type-Options: nosniff
    // - X-Frame-Options: DENY
    let security_headers = ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ));

    let static_files =
        ServeDir::new(&state.config.static_dir).append_index_html_on_directories(true);

    Router::new()
        // API routes
        .route("/health", get(health))
        .route("/api/info", get(info))
        .route("/api/transform", post(transform_handler))
        .route("/v2/list", get(list_photos))
        // Image routes
        .route("/{width}/{height}", get(random_image))
        .route("/seed/{seed}/{width}/{height}", get(seeded_image))
        .route("/id/{id}/info", get(photo_info))
        .route("/id/{id}/{width}/{height}", get(image_by_id))
        // Static files (frontend)
        .fallback_service(static_files)
        // Uploads are bounded by MAX_FILE_SIZE instead of axum's 2MB default
        .layer(DefaultBodyLimit::disable())
        // Middleware
        .layer(
            ServiceBuilder::new()
                .set_x_request_id(MakeRequestUuid)
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(state.config.max_file_size))
                .layer(TimeoutLayer::new(state.config.write_timeout()))
                .layer(CompressionLayer::new()) // GZIP compression
                .layer(cors)
                .layer(security_headers),
        )
        // Shared state
        .with_state(state)
}
