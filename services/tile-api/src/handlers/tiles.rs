//! Layer endpoints: creation, vectorization and tile serving.

use axum::{
    extract::{Extension, Path, Query},
    http::{header, StatusCode},
    response::Response,
    Json,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use registry::{Layer, LayerCreateParams, UploadStatus};
use tiles_common::{TileCoord, TileError, TileFormat};

use super::{error_envelope, json_response};
use crate::orchestrator::{ServedTile, TileOutcome};
use crate::spatial::{prime_geometry_sql, vectorize_dump_sql};
use crate::state::AppState;

/// Create a postgis-backed layer from an already-processed dataset.
pub async fn create_layer_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(params): Json<LayerCreateParams>,
) -> Response {
    let Some(file_id) = params.file_id.clone() else {
        return error_envelope(&TileError::Validation("Please provide a file_id.".into()));
    };

    let upload = match state
        .upstream
        .upload_status(&file_id, params.access_token.as_deref())
        .await
    {
        Ok(upload) => upload,
        Err(e) => return error_envelope(&e),
    };

    if !upload.processing_success {
        return error_envelope(&TileError::Validation(
            "The data is not done processing yet. Please try again in a little while.".into(),
        ));
    }
    if upload.data_type.is_none() {
        return error_envelope(&TileError::Validation("Invalid data_type.".into()));
    }

    let layer = match Layer::from_upload(&upload, &params) {
        Ok(layer) => layer,
        Err(e) => return error_envelope(&e),
    };

    if let Err(e) = state.layers.save(&layer).await {
        return error_envelope(&e);
    }

    json_response(&layer)
}

/// Derive a vector layer from a raster dataset.
///
/// Responds immediately with a processing-status placeholder; the actual
/// polygon dump and column statistics run out of band.
pub async fn vectorize_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(params): Json<LayerCreateParams>,
) -> Response {
    let Some(file_id) = params.file_id.clone() else {
        return error_envelope(&TileError::Validation("Please provide a file_id.".into()));
    };
    let access_token = params.access_token.clone();

    let raster = match state
        .upstream
        .upload_status(&file_id, access_token.as_deref())
        .await
    {
        Ok(upload) => upload,
        Err(e) => return error_envelope(&e),
    };

    let placeholder = raster.vectorized_placeholder();
    if let Err(e) = state
        .upstream
        .set_upload_status(&placeholder, access_token.as_deref())
        .await
    {
        return error_envelope(&e);
    }

    let task_state = state.clone();
    let task_placeholder = placeholder.clone();
    tokio::spawn(async move {
        if let Err(e) =
            vectorize_raster(task_state, raster, task_placeholder, access_token).await
        {
            error!(error = %e, "Vectorization failed");
        }
    });

    json_response(&placeholder)
}

/// The out-of-band vectorization pipeline: dump polygons into a new table,
/// prime the projected geometry column, collect column statistics and flip
/// the placeholder record to done.
async fn vectorize_raster(
    state: Arc<AppState>,
    raster: UploadStatus,
    mut placeholder: UploadStatus,
    access_token: Option<String>,
) -> Result<(), TileError> {
    let database = raster
        .database_name
        .clone()
        .ok_or_else(|| TileError::Upstream("Raster record has no database".into()))?;
    let source_table = raster
        .table_name
        .clone()
        .ok_or_else(|| TileError::Upstream("Raster record has no table".into()))?;
    let target_table = placeholder.file_id.clone();
    let started = Instant::now();

    state
        .spatial
        .execute(&database, &vectorize_dump_sql(&source_table, &target_table))
        .await?;

    for statement in prime_geometry_sql(&target_table) {
        state.spatial.execute(&database, &statement).await?;
    }

    let stats = state.spatial.column_stats(&database, &target_table).await?;

    // Merge column stats into the metadata blob.
    let mut metadata: serde_json::Value = placeholder
        .metadata
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .filter(serde_json::Value::is_object)
        .unwrap_or_else(|| serde_json::json!({}));
    metadata["columns"] = serde_json::Value::Object(stats);

    placeholder.table_name = Some(target_table.clone());
    placeholder.status = Some("Done".to_string());
    placeholder.processing_success = true;
    placeholder.metadata = Some(metadata.to_string());
    placeholder.sql = Some(format!("(SELECT * FROM {}) as sub", target_table));
    placeholder.extra.insert(
        "processing_took_ms".to_string(),
        serde_json::json!(started.elapsed().as_millis() as u64),
    );

    state
        .upstream
        .set_upload_status(&placeholder, access_token.as_deref())
        .await?;

    info!(table = %target_table, took_ms = started.elapsed().as_millis() as u64, "Vectorization done");
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct GetLayerParams {
    #[serde(alias = "layerUuid")]
    pub layer_id: Option<String>,
}

/// Fetch a stored layer definition.
pub async fn get_layer_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<GetLayerParams>,
) -> Response {
    let Some(layer_id) = params.layer_id else {
        return error_envelope(&TileError::Validation("Please provide layerUuid.".into()));
    };

    match state.layers.get(&layer_id).await {
        Ok(layer) => json_response(&layer),
        Err(e) => error_envelope(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct TileQueryParams {
    #[serde(default)]
    pub force_render: bool,
}

/// Serve a layer tile: `GET /v2/tiles/{layer}/{z}/{x}/{y}.{type}`.
pub async fn layer_tile_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(path): Path<String>,
    Query(params): Query<TileQueryParams>,
) -> Response {
    let Some((layer_id, coord, format)) = parse_tile_path(&path) else {
        return error_envelope(&TileError::Validation(format!("Invalid tile path: {}", path)));
    };
    let started = Instant::now();

    let layer = match state.layers.get(&layer_id).await {
        Ok(layer) => layer,
        Err(e) => {
            warn!(layer_id = %layer_id, error = %e, "Layer lookup failed, serving placeholder");
            return tile_response(
                ServedTile::placeholder(format, TileOutcome::Error),
                format,
            );
        }
    };

    let served = state
        .orchestrator
        .layer_tile(&layer, &coord, format, params.force_render)
        .await;

    info!(
        layer_id = %layer_id,
        z = coord.z,
        x = coord.x,
        y = coord.y,
        format = format.extension(),
        outcome = ?served.outcome,
        render_ms = started.elapsed().as_millis() as u64,
        "Tile request"
    );

    tile_response(served, format)
}

/// Split `{layer}/{z}/{x}/{y}.{ext}`.
pub(crate) fn parse_tile_path(path: &str) -> Option<(String, TileCoord, TileFormat)> {
    let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    if parts.len() != 4 {
        return None;
    }

    let (coord, format) = parse_coord_and_format(parts[1], parts[2], parts[3])?;
    Some((parts[0].to_string(), coord, format))
}

/// Parse the trailing `{z}/{x}/{y}.{ext}` components of a tile path.
pub(crate) fn parse_coord_and_format(
    z: &str,
    x: &str,
    y_ext: &str,
) -> Option<(TileCoord, TileFormat)> {
    let z: u32 = z.parse().ok()?;
    let x: u32 = x.parse().ok()?;
    let (y_str, ext) = y_ext.rsplit_once('.')?;
    let y: u32 = y_str.parse().ok()?;
    let format: TileFormat = ext.parse().ok()?;
    Some((TileCoord::new(z, x, y), format))
}

/// Build the HTTP response for a served tile. Vector tiles go out gzipped
/// with a cache header for downstream caches.
pub(crate) fn tile_response(served: ServedTile, format: TileFormat) -> Response {
    let degraded = matches!(served.outcome, TileOutcome::Empty | TileOutcome::Error);

    if format == TileFormat::Pbf && !degraded {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        if encoder.write_all(&served.bytes).is_ok() {
            if let Ok(zipped) = encoder.finish() {
                return Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, served.content_type)
                    .header(header::CONTENT_ENCODING, "gzip")
                    .header(header::CACHE_CONTROL, "private, max-age=3600")
                    .body(zipped.into())
                    .unwrap();
            }
        }
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, served.content_type)
        .body(served.bytes.into())
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_layer_tile_path() {
        let (id, coord, format) = parse_tile_path("layer_id-abc/9/268/148.png").unwrap();
        assert_eq!(id, "layer_id-abc");
        assert_eq!(coord, TileCoord::new(9, 268, 148));
        assert_eq!(format, TileFormat::Png);
    }

    #[test]
    fn test_parse_rejects_malformed_paths() {
        assert!(parse_tile_path("layer/9/268").is_none());
        assert!(parse_tile_path("layer/9/268/148").is_none());
        assert!(parse_tile_path("layer/9/268/148.jpeg").is_none());
        assert!(parse_tile_path("layer/nine/268/148.png").is_none());
    }
}
