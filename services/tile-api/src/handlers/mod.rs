//! HTTP handlers.
//!
//! The handlers are the only place where errors become client-visible
//! status codes and bodies: mutation endpoints answer with the resource or
//! a JSON `{error, error_code}` envelope, tile endpoints always answer 200
//! with a payload (placeholder tiles on failure).

mod cubes;
mod query;
mod render_jobs;
mod tiles;

pub use cubes::{
    add_datasets_handler, create_cube_handler, cube_tile_handler, delete_cube_handler,
    get_cube_handler, get_mask_handler, mask_handler, remove_datasets_handler,
    replace_datasets_handler, unmask_handler, update_cube_handler, update_mask_handler,
};
pub use query::cube_query_handler;
pub use render_jobs::{render_estimate_handler, render_start_handler, render_status_handler};
pub use tiles::{create_layer_handler, get_layer_handler, layer_tile_handler, vectorize_handler};

use axum::{
    extract::Extension,
    http::{header, StatusCode},
    response::Response,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

use tiles_common::TileError;

/// JSON error envelope: `{error, error_code}` with the error's status.
pub(crate) fn error_envelope(err: &TileError) -> Response {
    let body = serde_json::json!({
        "error": err.to_string(),
        "error_code": err.error_code(),
    });

    Response::builder()
        .status(StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::BAD_REQUEST))
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.to_string().into())
        .unwrap()
}

/// 200 JSON response.
pub(crate) fn json_response<T: Serialize>(value: &T) -> Response {
    match serde_json::to_string(value) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap(),
        Err(e) => error_envelope(&TileError::Internal(e.to_string())),
    }
}

/// Health check.
pub async fn health_handler() -> Response {
    json_response(&serde_json::json!({ "status": "ok" }))
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}
