//! Cube and mask endpoints, plus cube tile serving.

use axum::{
    extract::{Extension, Path, Query},
    response::Response,
    Json,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use registry::mask::{
    topology_from_collection, validate_mask_dataset_id, FEATURE_ID_PROPERTY,
};
use registry::{DatasetRef, Mask, MaskKind};
use tiles_common::{TileError, TileFormat};

use super::tiles::{parse_coord_and_format, tile_response};
use super::{error_envelope, json_response};
use crate::orchestrator::{ServedTile, TileOutcome};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CubeCreateRequest {
    pub created_by: Option<String>,
    pub style: Option<String>,
    pub quality: Option<String>,
    pub datasets: Option<Vec<DatasetRef>>,
    /// Remaining fields become the cube's free-form option bag.
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

/// `POST /v2/cubes/create`
pub async fn create_cube_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<CubeCreateRequest>,
) -> Response {
    let mut options = request.options;
    options.remove("access_token");

    match state
        .cubes
        .create(
            request.created_by,
            request.style,
            request.quality,
            request.datasets.unwrap_or_default(),
            options,
        )
        .await
    {
        Ok(cube) => json_response(&cube),
        Err(e) => error_envelope(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CubeIdRequest {
    pub cube_id: Option<String>,
    /// Older clients send the cube id as `layer_id`.
    pub layer_id: Option<String>,
}

impl CubeIdRequest {
    fn cube_id(&self) -> Result<&str, TileError> {
        self.cube_id
            .as_deref()
            .or(self.layer_id.as_deref())
            .ok_or_else(|| TileError::Validation("Please provide a cube_id.".into()))
    }
}

/// `GET /v2/cubes/get`
pub async fn get_cube_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(request): Query<CubeIdRequest>,
) -> Response {
    let cube_id = match request.cube_id() {
        Ok(id) => id,
        Err(e) => return error_envelope(&e),
    };

    match state.cubes.get(cube_id).await {
        Ok(cube) => json_response(&cube),
        Err(e) => error_envelope(&e),
    }
}

/// `POST /v2/cubes/deleteCube`
pub async fn delete_cube_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<CubeIdRequest>,
) -> Response {
    let cube_id = match request.cube_id() {
        Ok(id) => id.to_string(),
        Err(e) => return error_envelope(&e),
    };

    match state.cubes.delete(&cube_id).await {
        Ok(()) => json_response(&serde_json::json!({
            "deleteCube": cube_id,
            "success": true,
            "error": null,
        })),
        Err(e) => error_envelope(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct DatasetsRequest {
    pub cube_id: Option<String>,
    #[serde(default)]
    pub datasets: Vec<DatasetRef>,
}

/// `POST /v2/cubes/add`
pub async fn add_datasets_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<DatasetsRequest>,
) -> Response {
    let Some(cube_id) = request.cube_id else {
        return error_envelope(&TileError::Validation("Please provide a cube_id.".into()));
    };

    match state.cubes.add_datasets(&cube_id, request.datasets).await {
        Ok(cube) => json_response(&cube),
        Err(e) => error_envelope(&e),
    }
}

/// A dataset to remove: a bare id or a ref-shaped object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum DatasetSelector {
    Id(String),
    Ref { id: String },
}

impl DatasetSelector {
    fn id(&self) -> String {
        match self {
            DatasetSelector::Id(id) => id.clone(),
            DatasetSelector::Ref { id } => id.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RemoveDatasetsRequest {
    pub cube_id: Option<String>,
    #[serde(default)]
    pub datasets: Vec<DatasetSelector>,
}

/// `POST /v2/cubes/remove`
pub async fn remove_datasets_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<RemoveDatasetsRequest>,
) -> Response {
    let Some(cube_id) = request.cube_id else {
        return error_envelope(&TileError::Validation("Please provide a cube_id.".into()));
    };

    let ids: Vec<String> = request.datasets.iter().map(DatasetSelector::id).collect();
    match state.cubes.remove_datasets(&cube_id, ids).await {
        Ok(cube) => json_response(&cube),
        Err(e) => error_envelope(&e),
    }
}

/// `POST /v2/cubes/replace`
pub async fn replace_datasets_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<DatasetsRequest>,
) -> Response {
    let Some(cube_id) = request.cube_id else {
        return error_envelope(&TileError::Validation("Please provide a cube_id.".into()));
    };

    match state.cubes.replace_datasets(&cube_id, request.datasets).await {
        Ok(cube) => json_response(&cube),
        Err(e) => error_envelope(&e),
    }
}

/// `POST /v2/cubes/update`: shallow-merge the remaining body fields onto
/// the cube record.
pub async fn update_cube_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(mut fields): Json<Map<String, Value>>,
) -> Response {
    let Some(cube_id) = fields
        .remove("cube_id")
        .and_then(|v| v.as_str().map(str::to_string))
    else {
        return error_envelope(&TileError::Validation("Please provide a cube_id.".into()));
    };

    match state.cubes.update(&cube_id, &fields).await {
        Ok(cube) => json_response(&cube),
        Err(e) => error_envelope(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct MaskRequest {
    pub cube_id: Option<String>,
    pub mask: Option<Value>,
    pub access_token: Option<String>,
}

/// `POST /v2/cubes/mask`: attach a mask, type-dispatched construction.
pub async fn mask_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<MaskRequest>,
) -> Response {
    let Some(cube_id) = request.cube_id else {
        return error_envelope(&TileError::Validation("Please provide a cube_id.".into()));
    };
    let Some(mask_input) = request.mask else {
        return error_envelope(&TileError::Validation("Please provide a mask object.".into()));
    };

    let kind = match build_mask(&state, &mask_input, request.access_token.as_deref()).await {
        Ok(kind) => kind,
        Err(e) => return error_envelope(&e),
    };

    let mask = Mask::with_fresh_id(kind);
    info!(cube_id = %cube_id, mask_id = %mask.id, "Attaching mask");

    match state
        .cubes
        .attach_mask(&cube_id, mask, state.config.active_mask_index)
        .await
    {
        Ok(cube) => json_response(&cube),
        Err(e) => error_envelope(&e),
    }
}

/// Type-dispatched mask construction pipeline.
async fn build_mask(
    state: &AppState,
    input: &Value,
    access_token: Option<&str>,
) -> Result<MaskKind, TileError> {
    let mask_type = input
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| TileError::Validation("Please provide a mask type.".into()))?;

    match mask_type {
        "geojson" => serde_json::from_value(input.clone())
            .map_err(|e| TileError::Validation(format!("Invalid mask: {}", e))),
        "topojson" => {
            if input.get("geometry").map_or(true, Value::is_null) {
                return Err(TileError::Validation("Invalid topology.".into()));
            }
            serde_json::from_value(input.clone())
                .map_err(|e| TileError::Validation(format!("Invalid mask: {}", e)))
        }
        "postgis-vector" => {
            let dataset_id = input
                .get("dataset_id")
                .and_then(Value::as_str)
                .ok_or_else(|| TileError::Validation("Invalid dataset_id".into()))?;
            validate_mask_dataset_id(dataset_id)?;

            let collection = state
                .upstream
                .dataset_geojson(dataset_id, access_token)
                .await?;
            let topology = topology_from_collection(&collection, FEATURE_ID_PROPERTY)?;

            Ok(MaskKind::Topojson {
                geometry: topology,
                meta: input.get("meta").cloned(),
                data: input.get("data").cloned(),
            })
        }
        "postgis-raster" => serde_json::from_value(input.clone())
            .map_err(|e| TileError::Validation(format!("Invalid mask: {}", e))),
        other => Err(TileError::Validation(format!(
            "Mask type {} is not supported!",
            other
        ))),
    }
}

#[derive(Debug, Deserialize)]
pub struct MaskIdRequest {
    pub cube_id: Option<String>,
    pub mask_id: Option<String>,
}

/// `POST /v2/cubes/unmask`
pub async fn unmask_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<MaskIdRequest>,
) -> Response {
    let (Some(cube_id), Some(mask_id)) = (request.cube_id, request.mask_id) else {
        return error_envelope(&TileError::Validation(
            "Please provide a cube_id and mask_id.".into(),
        ));
    };

    match state.cubes.remove_mask(&cube_id, &mask_id).await {
        Ok(cube) => json_response(&cube),
        Err(e) => error_envelope(&e),
    }
}

/// `POST /v2/cubes/getMask`
pub async fn get_mask_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<MaskIdRequest>,
) -> Response {
    let (Some(cube_id), Some(mask_id)) = (request.cube_id, request.mask_id) else {
        return error_envelope(&TileError::Validation(
            "Please provide a cube_id and mask_id.".into(),
        ));
    };

    match state.cubes.get_mask(&cube_id, &mask_id).await {
        Ok(mask) => json_response(&mask),
        Err(e) => error_envelope(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateMaskRequest {
    pub cube_id: Option<String>,
    pub mask: Option<Map<String, Value>>,
}

/// `POST /v2/cubes/updateMask`: partial-field mask update.
pub async fn update_mask_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<UpdateMaskRequest>,
) -> Response {
    let Some(cube_id) = request.cube_id else {
        return error_envelope(&TileError::Validation("Please provide a cube_id.".into()));
    };
    let Some(fields) = request.mask else {
        return error_envelope(&TileError::Validation("Please provide a mask.".into()));
    };
    let Some(mask_id) = fields.get("id").and_then(Value::as_str).map(str::to_string) else {
        return error_envelope(&TileError::Validation("Please provide a mask.id.".into()));
    };

    match state.cubes.update_mask(&cube_id, &mask_id, &fields).await {
        Ok(mask) => json_response(&mask),
        Err(e) => error_envelope(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CubeTileParams {
    pub mask_id: Option<String>,
    #[serde(default)]
    pub force_render: bool,
    /// Mask filtering is optional per request; skipping it is faster for
    /// full-extent pre-rendering.
    pub mask_filter: Option<bool>,
    pub access_token: Option<String>,
}

/// Serve a cube tile:
/// `GET /v2/cubes/{cube}/{dataset}/{z}/{x}/{y}.{type}?mask_id=...`.
pub async fn cube_tile_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(path): Path<String>,
    Query(params): Query<CubeTileParams>,
) -> Response {
    let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    if parts.len() != 5 {
        return error_envelope(&TileError::Validation(format!("Invalid tile path: {}", path)));
    }
    let Some((coord, format)) = parse_coord_and_format(parts[2], parts[3], parts[4]) else {
        return error_envelope(&TileError::Validation(format!("Invalid tile path: {}", path)));
    };

    // Cube tiles are rendered as rasters only; other formats degrade.
    if format != TileFormat::Png {
        return tile_response(ServedTile::placeholder(format, TileOutcome::Error), format);
    }

    let cube_id = parts[0];
    let dataset_id = parts[1];
    let started = Instant::now();

    let (cube, dataset) = tokio::join!(
        state.cubes.get(cube_id),
        state
            .upstream
            .upload_status(dataset_id, params.access_token.as_deref()),
    );

    let (cube, dataset) = match (cube, dataset) {
        (Ok(cube), Ok(dataset)) => (cube, dataset),
        (cube, dataset) => {
            if let Err(e) = cube.as_ref() {
                warn!(cube_id = %cube_id, error = %e, "Cube lookup failed");
            }
            if let Err(e) = dataset.as_ref() {
                warn!(dataset_id = %dataset_id, error = %e, "Dataset lookup failed");
            }
            return tile_response(ServedTile::placeholder(format, TileOutcome::Error), format);
        }
    };

    let served = state
        .orchestrator
        .cube_tile(
            &cube,
            &dataset,
            &coord,
            params.mask_id.as_deref(),
            params.force_render,
            params.mask_filter.unwrap_or(true),
        )
        .await;

    info!(
        cube_id = %cube_id,
        dataset_id = %dataset_id,
        z = coord.z,
        x = coord.x,
        y = coord.y,
        outcome = ?served.outcome,
        render_ms = started.elapsed().as_millis() as u64,
        "Cube tile request"
    );

    tile_response(served, format)
}
