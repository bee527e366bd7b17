//! Masked spatial query endpoint.

use axum::{extract::Extension, response::Response, Json};
use std::sync::Arc;

use tiles_common::TileError;

use super::{error_envelope, json_response};
use crate::scf::CubeQueryRequest;
use crate::state::AppState;

/// `POST /v2/cubes/query`: dispatch by query type.
pub async fn cube_query_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<CubeQueryRequest>,
) -> Response {
    let result = match request.query_type.as_deref() {
        // Snow-cover fraction against a raster-backed mask.
        Some("scf") => state.queries.raster_mask_query(&request).await,
        // Snow-cover fraction against vector mask geometry.
        Some("scf-geojson") => {
            let multi = request
                .mask
                .as_ref()
                .and_then(|m| m.geometries.as_ref())
                .is_some_and(|g| !g.is_empty());
            if multi {
                state.queries.multi_mask_query(&request).await
            } else {
                state.queries.single_mask_query(&request).await
            }
        }
        Some(other) => Err(TileError::Validation(format!(
            "Query type not supported: {}",
            other
        ))),
        None => Err(TileError::Validation("Please provide a query_type.".into())),
    };

    match result {
        Ok(points) => json_response(&points),
        Err(e) => error_envelope(&e),
    }
}
