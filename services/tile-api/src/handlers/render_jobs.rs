//! Pre-render job endpoints: estimate, start, status.

use axum::{extract::Extension, response::Response, Json};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use tiles_common::TileError;

use super::{error_envelope, json_response};
use crate::prerender::{DirectTileFetcher, HttpTileFetcher, TileFetcher};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RenderStartRequest {
    pub cube_id: Option<String>,
    pub max_zoom: Option<u32>,
    pub max_tiles: Option<usize>,
    #[serde(default)]
    pub dry_run: bool,
    /// `http` (default) fans out against the public tile endpoint; `direct`
    /// calls the orchestrator in-process.
    pub fetch_mode: Option<String>,
    /// Concurrent in-flight requests; tunable per job.
    pub concurrency: Option<usize>,
    /// Whether direct-mode renders apply mask geometry filtering.
    pub mask_filter: Option<bool>,
    pub access_token: Option<String>,
}

const DEFAULT_MAX_ZOOM: u32 = 11;
const DEFAULT_MAX_TILES: usize = 10_000;

/// `POST /v2/cubes/render/start`
pub async fn render_start_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<RenderStartRequest>,
) -> Response {
    let Some(cube_id) = request.cube_id else {
        return error_envelope(&TileError::Validation("Please provide a cube_id.".into()));
    };

    let cube = match state.cubes.get(&cube_id).await {
        Ok(cube) => cube,
        Err(e) => return error_envelope(&e),
    };

    let fetcher: Arc<dyn TileFetcher> = match request.fetch_mode.as_deref() {
        Some("direct") => Arc::new(DirectTileFetcher::new(
            state.orchestrator.clone(),
            state.cubes.clone(),
            state.upstream.clone(),
            request.access_token.clone(),
            request.mask_filter.unwrap_or(true),
        )),
        _ => {
            let timeout = Duration::from_secs(state.config.request_timeout_secs);
            match HttpTileFetcher::new(
                &state.config.tile_base_url,
                request.access_token.clone(),
                timeout,
            ) {
                Ok(fetcher) => Arc::new(fetcher),
                Err(e) => return error_envelope(&e),
            }
        }
    };

    let concurrency = request
        .concurrency
        .unwrap_or(state.config.prerender_concurrency);

    info!(
        cube_id = %cube_id,
        dry_run = request.dry_run,
        concurrency,
        "Pre-render start requested"
    );

    match state
        .prerender
        .start(
            &cube,
            request.max_zoom.unwrap_or(DEFAULT_MAX_ZOOM),
            request.max_tiles.unwrap_or(DEFAULT_MAX_TILES),
            request.dry_run,
            fetcher,
            concurrency,
            request.access_token.as_deref(),
        )
        .await
    {
        Ok(response) => json_response(&response),
        Err(e) => error_envelope(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct RenderStatusRequest {
    pub render_job_id: Option<String>,
}

/// `POST /v2/cubes/render/status`
pub async fn render_status_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<RenderStatusRequest>,
) -> Response {
    let Some(job_id) = request.render_job_id else {
        return error_envelope(&TileError::Validation(
            "Please provide a render_job_id.".into(),
        ));
    };

    match state.prerender.status(&job_id).await {
        Ok(status) => json_response(&status),
        Err(e) => error_envelope(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct RenderEstimateRequest {
    pub cube_id: Option<String>,
    pub max_zoom: Option<u32>,
    pub max_tiles: Option<usize>,
    pub access_token: Option<String>,
}

/// `POST /v2/cubes/render/estimate`
pub async fn render_estimate_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<RenderEstimateRequest>,
) -> Response {
    let Some(cube_id) = request.cube_id else {
        return error_envelope(&TileError::Validation("Please provide a cube_id.".into()));
    };

    let cube = match state.cubes.get(&cube_id).await {
        Ok(cube) => cube,
        Err(e) => return error_envelope(&e),
    };

    match state
        .prerender
        .estimate(
            &cube,
            request.max_zoom.unwrap_or(DEFAULT_MAX_ZOOM),
            request.max_tiles.unwrap_or(DEFAULT_MAX_TILES),
            request.access_token.as_deref(),
        )
        .await
    {
        Ok(estimate) => {
            let response = serde_json::json!({
                "success": true,
                "error": null,
                "num_tiles": estimate.num_tiles,
                "estimated_seconds": estimate.estimated_seconds,
                "processed_zoom": estimate.processed_zoom,
                "max_tiles": estimate.max_tiles,
            });
            json_response(&response)
        }
        Err(e) => error_envelope(&e),
    }
}
