//! Pre-render job engine.
//!
//! Enumerates every tile covering a cube's extent up to a zoom level,
//! halving the zoom until the tile count fits the budget, then fans the
//! renders out with bounded concurrency and tracks progress in the key/value
//! store. The fan-out unit of work is one full tile request: by default over
//! HTTP against this service's own public tile endpoint (exercising the
//! exact cache/render path a real client hits), or in-process for
//! single-process deployments. Individual tile failures are counted, not
//! retried, and never abort the batch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use registry::{Cube, CubeRegistry};
use storage::{get_json, keys, set_json, KeyValueStore};
use tiles_common::mercator::{lat_to_tile_y, lon_to_tile_x};
use tiles_common::{BoundingBox, TileCoord, TileError, TileResult};

use crate::metrics;
use crate::orchestrator::{TileOrchestrator, TileOutcome};
use crate::upstream::DatasetService;

/// Hard floor for the zoom-downscale loop.
const MIN_PRERENDER_ZOOM: u32 = 2;

/// One planned tile render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedTile {
    pub cube_id: String,
    pub dataset_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_id: Option<String>,
    pub coord: TileCoord,
}

/// Result of tile enumeration, before any side effects.
#[derive(Debug, Clone)]
pub struct Estimate {
    pub num_tiles: usize,
    pub estimated_seconds: f64,
    pub processed_zoom: u32,
    pub max_tiles: usize,
    pub tiles: Vec<PlannedTile>,
}

/// Persisted render-job status, polled by clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderJobStatus {
    pub render_job_id: String,
    pub num_tiles: usize,
    pub tiles_processed: i64,
    pub tiles_failed: i64,
    pub estimated_seconds: f64,
    pub processed_zoom: u32,
    pub finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tiles_per_second_avg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response to estimate/start calls; the tile list is never echoed back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimateResponse {
    pub success: bool,
    pub error: Option<String>,
    pub num_tiles: usize,
    pub estimated_seconds: f64,
    pub processed_zoom: u32,
    pub max_tiles: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_job_id: Option<String>,
}

impl EstimateResponse {
    fn from_estimate(estimate: &Estimate) -> Self {
        Self {
            success: true,
            error: None,
            num_tiles: estimate.num_tiles,
            estimated_seconds: estimate.estimated_seconds,
            processed_zoom: estimate.processed_zoom,
            max_tiles: estimate.max_tiles,
            dry_run: None,
            render_job_id: None,
        }
    }
}

/// One unit of fan-out work: fetch a single tile end to end.
#[async_trait]
pub trait TileFetcher: Send + Sync {
    async fn fetch(&self, tile: &PlannedTile) -> TileResult<()>;
}

/// Fetcher issuing requests against the public tile endpoint.
pub struct HttpTileFetcher {
    client: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
}

impl HttpTileFetcher {
    pub fn new(
        base_url: &str,
        access_token: Option<String>,
        timeout: Duration,
    ) -> TileResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TileError::Internal(format!("HTTP client build failed: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token,
        })
    }
}

#[async_trait]
impl TileFetcher for HttpTileFetcher {
    async fn fetch(&self, tile: &PlannedTile) -> TileResult<()> {
        let mut url = format!(
            "{}/v2/cubes/{}/{}/{}/{}/{}.png",
            self.base_url, tile.cube_id, tile.dataset_id, tile.coord.z, tile.coord.x, tile.coord.y
        );

        let mut params: Vec<String> = Vec::new();
        if let Some(mask_id) = &tile.mask_id {
            params.push(format!("mask_id={}", mask_id));
        }
        if let Some(token) = &self.access_token {
            params.push(format!("access_token={}", token));
        }
        if !params.is_empty() {
            url = format!("{}?{}", url, params.join("&"));
        }

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                TileError::Timeout
            } else {
                TileError::Upstream(format!("Tile fetch failed: {}", e))
            }
        })?;

        if !response.status().is_success() {
            return Err(TileError::Upstream(format!(
                "Tile fetch returned {}",
                response.status()
            )));
        }

        Ok(())
    }
}

/// Fetcher calling the orchestrator in-process, skipping the network hop.
pub struct DirectTileFetcher {
    orchestrator: Arc<TileOrchestrator>,
    cubes: Arc<CubeRegistry>,
    upstream: Arc<dyn DatasetService>,
    access_token: Option<String>,
    apply_mask_filter: bool,
}

impl DirectTileFetcher {
    pub fn new(
        orchestrator: Arc<TileOrchestrator>,
        cubes: Arc<CubeRegistry>,
        upstream: Arc<dyn DatasetService>,
        access_token: Option<String>,
        apply_mask_filter: bool,
    ) -> Self {
        Self {
            orchestrator,
            cubes,
            upstream,
            access_token,
            apply_mask_filter,
        }
    }
}

#[async_trait]
impl TileFetcher for DirectTileFetcher {
    async fn fetch(&self, tile: &PlannedTile) -> TileResult<()> {
        let cube = self.cubes.get(&tile.cube_id).await?;
        let dataset = self
            .upstream
            .upload_status(&tile.dataset_id, self.access_token.as_deref())
            .await?;

        let served = self
            .orchestrator
            .cube_tile(
                &cube,
                &dataset,
                &tile.coord,
                tile.mask_id.as_deref(),
                false,
                self.apply_mask_filter,
            )
            .await;

        match served.outcome {
            TileOutcome::Error => Err(TileError::Render("Tile render failed".into())),
            _ => Ok(()),
        }
    }
}

/// Enumerate tiles for every dataset and zoom level within the extent,
/// iteratively lowering the zoom until the budget fits.
///
/// Zoom levels run from 1 to the chosen maximum; a budget that cannot be
/// met above the floor yields an empty set at zoom 0.
pub fn plan_tiles(
    cube: &Cube,
    extent: &BoundingBox,
    mask_id: Option<&str>,
    max_zoom: u32,
    max_tiles: usize,
) -> (Vec<PlannedTile>, u32) {
    let mut zoom = max_zoom;

    while zoom >= MIN_PRERENDER_ZOOM {
        // Count arithmetically before materializing anything; rejected zoom
        // levels can cover millions of tiles.
        if count_tiles(cube, extent, zoom) <= max_tiles {
            return (enumerate_tiles(cube, extent, mask_id, zoom), zoom);
        }
        zoom -= 1;
    }

    (Vec::new(), 0)
}

fn count_tiles(cube: &Cube, extent: &BoundingBox, max_zoom: u32) -> usize {
    let mut per_dataset = 0usize;
    for z in 1..=max_zoom {
        let cols = (lon_to_tile_x(extent.max_x, z) - lon_to_tile_x(extent.min_x, z) + 1) as usize;
        let rows = (lat_to_tile_y(extent.min_y, z) - lat_to_tile_y(extent.max_y, z) + 1) as usize;
        per_dataset = per_dataset.saturating_add(cols.saturating_mul(rows));
    }
    per_dataset.saturating_mul(cube.datasets.len())
}

fn enumerate_tiles(
    cube: &Cube,
    extent: &BoundingBox,
    mask_id: Option<&str>,
    max_zoom: u32,
) -> Vec<PlannedTile> {
    let mut tiles = Vec::new();

    for dataset in &cube.datasets {
        for z in 1..=max_zoom {
            let x_min = lon_to_tile_x(extent.min_x, z);
            let x_max = lon_to_tile_x(extent.max_x, z);
            let y_min = lat_to_tile_y(extent.max_y, z);
            let y_max = lat_to_tile_y(extent.min_y, z);

            for x in x_min..=x_max {
                for y in y_min..=y_max {
                    tiles.push(PlannedTile {
                        cube_id: cube.cube_id.clone(),
                        dataset_id: dataset.id.clone(),
                        mask_id: mask_id.map(str::to_string),
                        coord: TileCoord::new(z, x, y),
                    });
                }
            }
        }
    }

    tiles
}

/// Drives estimates and pre-render jobs.
pub struct PreRenderEngine {
    kv: Arc<dyn KeyValueStore>,
    upstream: Arc<dyn DatasetService>,
    active_mask_index: usize,
}

impl PreRenderEngine {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        upstream: Arc<dyn DatasetService>,
        active_mask_index: usize,
    ) -> Self {
        Self {
            kv,
            upstream,
            active_mask_index,
        }
    }

    /// Enumerate the tile set for a cube without side effects.
    pub async fn estimate(
        &self,
        cube: &Cube,
        max_zoom: u32,
        max_tiles: usize,
        access_token: Option<&str>,
    ) -> TileResult<Estimate> {
        if cube.datasets.is_empty() {
            return Ok(Estimate {
                num_tiles: 0,
                estimated_seconds: 0.0,
                processed_zoom: 0,
                max_tiles,
                tiles: Vec::new(),
            });
        }

        let mask = cube.active_mask(self.active_mask_index);
        let mask_id = mask.map(|m| m.id.clone());

        let extent = match mask.and_then(|m| m.geometry_extent()) {
            Some(extent) => extent,
            None => self.dataset_union_extent(cube, access_token).await?,
        };

        let (tiles, processed_zoom) =
            plan_tiles(cube, &extent, mask_id.as_deref(), max_zoom, max_tiles);

        Ok(Estimate {
            num_tiles: tiles.len(),
            estimated_seconds: tiles.len() as f64 / 10.0,
            processed_zoom,
            max_tiles,
            tiles,
        })
    }

    /// Union extent over the cube's datasets, from upstream metadata.
    async fn dataset_union_extent(
        &self,
        cube: &Cube,
        access_token: Option<&str>,
    ) -> TileResult<BoundingBox> {
        let details = self
            .upstream
            .dataset_details(&cube.datasets, access_token)
            .await?;

        let mut union: Option<BoundingBox> = None;
        for dataset in &details {
            if let Some(extent) = dataset.extent_bbox() {
                match &mut union {
                    Some(u) => u.extend(&extent),
                    None => union = Some(extent),
                }
            }
        }

        union.ok_or_else(|| {
            TileError::Upstream("Could not resolve an extent for any dataset".into())
        })
    }

    /// Start a pre-render job.
    ///
    /// Returns the estimate immediately (tile list omitted); the fan-out
    /// runs in the background and is observable via [`Self::status`]. With
    /// `dry_run` the estimate is returned annotated and nothing is fetched.
    pub async fn start(
        &self,
        cube: &Cube,
        max_zoom: u32,
        max_tiles: usize,
        dry_run: bool,
        fetcher: Arc<dyn TileFetcher>,
        concurrency: usize,
        access_token: Option<&str>,
    ) -> TileResult<EstimateResponse> {
        let estimate = self.estimate(cube, max_zoom, max_tiles, access_token).await?;
        let mut response = EstimateResponse::from_estimate(&estimate);

        if dry_run {
            response.dry_run = Some(true);
            return Ok(response);
        }

        let job_id = {
            let suffix = Uuid::new_v4().simple().to_string();
            format!("render-job-{}", &suffix[..7])
        };

        let status = RenderJobStatus {
            render_job_id: job_id.clone(),
            num_tiles: estimate.num_tiles,
            tiles_processed: 0,
            tiles_failed: 0,
            estimated_seconds: estimate.estimated_seconds,
            processed_zoom: estimate.processed_zoom,
            finished: false,
            processing_seconds: None,
            tiles_per_second_avg: None,
            error: None,
        };
        set_json(self.kv.as_ref(), &keys::render_job(&job_id), &status).await?;

        let kv = self.kv.clone();
        tokio::spawn(run_job(kv, fetcher, estimate.tiles, status, concurrency));

        response.render_job_id = Some(job_id);
        Ok(response)
    }

    /// Current status of a job: the stored record patched with live
    /// counters.
    pub async fn status(&self, job_id: &str) -> TileResult<RenderJobStatus> {
        let mut status: RenderJobStatus =
            get_json(self.kv.as_ref(), &keys::render_job(job_id))
                .await?
                .ok_or_else(|| TileError::NotFound(format!("No such render job: {}", job_id)))?;

        let processed = self
            .kv
            .get(&keys::render_job_processed(job_id))
            .await?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        let failed = self
            .kv
            .get(&keys::render_job_failed(job_id))
            .await?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);

        status.tiles_processed = processed;
        status.tiles_failed = failed;
        if status.num_tiles > 0 && processed + failed >= status.num_tiles as i64 {
            status.finished = true;
        }

        Ok(status)
    }
}

/// Bounded-concurrency fan-out over the planned tiles.
async fn run_job(
    kv: Arc<dyn KeyValueStore>,
    fetcher: Arc<dyn TileFetcher>,
    tiles: Vec<PlannedTile>,
    mut status: RenderJobStatus,
    concurrency: usize,
) {
    let job_id = status.render_job_id.clone();
    let total = tiles.len();
    info!(job_id = %job_id, tiles = total, concurrency, "Pre-rendering tiles");

    let started = Instant::now();
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut handles = Vec::with_capacity(total);

    for tile in tiles {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let fetcher = fetcher.clone();
        let kv = kv.clone();
        let job_id = job_id.clone();

        handles.push(tokio::spawn(async move {
            let result = fetcher.fetch(&tile).await;
            drop(permit);

            let counter_key = match &result {
                Ok(()) => keys::render_job_processed(&job_id),
                Err(e) => {
                    warn!(job_id = %job_id, tile = %tile.coord, error = %e, "Pre-render tile failed");
                    keys::render_job_failed(&job_id)
                }
            };
            metrics::record_prerender_tile(result.is_ok());
            if let Err(e) = kv.incr(&counter_key).await {
                warn!(job_id = %job_id, error = %e, "Progress counter update failed");
            }

            result.is_ok()
        }));
    }

    let mut processed: i64 = 0;
    let mut failed: i64 = 0;
    for handle in handles {
        match handle.await {
            Ok(true) => processed += 1,
            Ok(false) => failed += 1,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Pre-render task panicked");
                failed += 1;
            }
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    status.tiles_processed = processed;
    status.tiles_failed = failed;
    status.finished = processed + failed == total as i64;
    status.processing_seconds = Some(elapsed);
    status.tiles_per_second_avg = if elapsed > 0.0 {
        Some(total as f64 / elapsed)
    } else {
        None
    };

    if let Err(e) = set_json(kv.as_ref(), &keys::render_job(&job_id), &status).await {
        warn!(job_id = %job_id, error = %e, "Failed to store final job status");
    }

    info!(
        job_id = %job_id,
        processed,
        failed,
        seconds = elapsed,
        "Pre-rendering done"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry::{DatasetRef, Mask, MaskKind, UploadStatus};
    use serde_json::{json, Map};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use storage::MemoryStore;

    struct CountingFetcher {
        calls: AtomicUsize,
        fail_every: Option<usize>,
    }

    impl CountingFetcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_every: None,
            })
        }

        fn failing_every(n: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_every: Some(n),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TileFetcher for CountingFetcher {
        async fn fetch(&self, _tile: &PlannedTile) -> TileResult<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(every) = self.fail_every {
                if n % every == 0 {
                    return Err(TileError::Render("synthetic failure".into()));
                }
            }
            Ok(())
        }
    }

    struct StubUpstream;

    #[async_trait]
    impl DatasetService for StubUpstream {
        async fn upload_status(
            &self,
            file_id: &str,
            _access_token: Option<&str>,
        ) -> TileResult<UploadStatus> {
            Ok(stub_dataset(file_id))
        }

        async fn set_upload_status(
            &self,
            _status: &UploadStatus,
            _access_token: Option<&str>,
        ) -> TileResult<()> {
            Ok(())
        }

        async fn dataset_details(
            &self,
            datasets: &[DatasetRef],
            _access_token: Option<&str>,
        ) -> TileResult<Vec<UploadStatus>> {
            Ok(datasets.iter().map(|d| stub_dataset(&d.id)).collect())
        }

        async fn dataset_geojson(
            &self,
            _dataset_id: &str,
            _access_token: Option<&str>,
        ) -> TileResult<serde_json::Value> {
            Err(TileError::Upstream("not available".into()))
        }
    }

    fn stub_dataset(file_id: &str) -> UploadStatus {
        UploadStatus {
            file_id: file_id.to_string(),
            table_name: Some(file_id.to_string()),
            database_name: Some("db1".into()),
            data_type: None,
            processing_success: true,
            status: Some("Done".into()),
            timestamp: None,
            metadata: Some(
                json!({
                    "extent_geojson": {
                        "type": "Polygon",
                        "coordinates": [[[5.0, 58.0], [12.0, 58.0], [12.0, 63.0], [5.0, 63.0], [5.0, 58.0]]]
                    }
                })
                .to_string(),
            ),
            rows_count: None,
            sql: None,
            extra: Map::new(),
        }
    }

    fn cube_with_datasets(n: usize) -> Cube {
        let mut cube = Cube::new(None, None, None, Vec::new(), Map::new());
        for i in 0..n {
            cube.datasets.push(DatasetRef {
                id: format!("file_{}", i),
                description: None,
                timestamp: "2016-05-20T00:00:00Z".parse().unwrap(),
                granularity: None,
                last_modified: None,
            });
        }
        cube
    }

    fn engine() -> PreRenderEngine {
        PreRenderEngine::new(Arc::new(MemoryStore::new()), Arc::new(StubUpstream), 0)
    }

    fn wide_mask() -> Mask {
        Mask {
            id: "mask-wide".into(),
            kind: MaskKind::Geojson {
                geometry: json!({
                    "type": "Polygon",
                    "coordinates": [[[-20.0, 30.0], [40.0, 30.0], [40.0, 70.0], [-20.0, 70.0], [-20.0, 30.0]]]
                }),
                meta: None,
                data: None,
            },
        }
    }

    #[tokio::test]
    async fn test_estimate_empty_cube_is_zero_tiles() {
        let engine = engine();
        let cube = cube_with_datasets(0);

        let estimate = engine.estimate(&cube, 14, 10_000, None).await.unwrap();
        assert_eq!(estimate.num_tiles, 0);
        assert!(estimate.tiles.is_empty());
    }

    #[tokio::test]
    async fn test_estimate_downscales_zoom_to_budget() {
        let engine = engine();
        let mut cube = cube_with_datasets(1);
        cube.masks.push(wide_mask());

        let estimate = engine.estimate(&cube, 14, 10, None).await.unwrap();
        assert!(estimate.num_tiles <= 10);
        assert!(estimate.processed_zoom < 14);
    }

    #[tokio::test]
    async fn test_estimate_exhausted_budget_is_empty_at_zoom_zero() {
        let engine = engine();
        let mut cube = cube_with_datasets(50);
        cube.masks.push(wide_mask());

        // Even zoom 2 yields more than one tile per dataset here.
        let estimate = engine.estimate(&cube, 14, 1, None).await.unwrap();
        assert_eq!(estimate.num_tiles, 0);
        assert_eq!(estimate.processed_zoom, 0);
    }

    #[tokio::test]
    async fn test_estimate_falls_back_to_dataset_union_extent() {
        let engine = engine();
        let cube = cube_with_datasets(1);

        // No mask attached; the upstream metadata extent drives the plan.
        let estimate = engine.estimate(&cube, 3, 10_000, None).await.unwrap();
        assert!(estimate.num_tiles > 0);
        assert_eq!(estimate.processed_zoom, 3);
    }

    #[tokio::test]
    async fn test_dry_run_issues_zero_fetches() {
        let engine = engine();
        let mut cube = cube_with_datasets(1);
        cube.masks.push(wide_mask());
        let fetcher = CountingFetcher::new();

        let response = engine
            .start(&cube, 4, 10_000, true, fetcher.clone(), 5, None)
            .await
            .unwrap();

        assert_eq!(response.dry_run, Some(true));
        assert!(response.render_job_id.is_none());
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_job_runs_to_completion_with_failures_counted() {
        let engine = engine();
        let mut cube = cube_with_datasets(1);
        cube.masks.push(wide_mask());
        let fetcher = CountingFetcher::failing_every(3);

        let response = engine
            .start(&cube, 3, 10_000, false, fetcher.clone(), 4, None)
            .await
            .unwrap();
        let job_id = response.render_job_id.unwrap();
        assert!(response.num_tiles > 0);

        // Poll until the driver writes the final status.
        let mut status = engine.status(&job_id).await.unwrap();
        for _ in 0..100 {
            if status.finished {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = engine.status(&job_id).await.unwrap();
        }

        assert!(status.finished);
        assert_eq!(
            status.tiles_processed + status.tiles_failed,
            response.num_tiles as i64
        );
        assert!(status.tiles_failed > 0);
        assert!(status.processing_seconds.is_some());
        assert_eq!(fetcher.calls(), response.num_tiles);
    }

    #[tokio::test]
    async fn test_status_of_unknown_job_is_not_found() {
        let engine = engine();
        let err = engine.status("render-job-missing").await.unwrap_err();
        assert!(matches!(err, TileError::NotFound(_)));
    }

    #[test]
    fn test_plan_tiles_covers_all_datasets() {
        let cube = cube_with_datasets(2);
        let extent = BoundingBox::new(5.0, 58.0, 12.0, 63.0);

        let (tiles, zoom) = plan_tiles(&cube, &extent, Some("mask-1"), 3, 10_000);
        assert_eq!(zoom, 3);
        assert!(!tiles.is_empty());
        // Every dataset contributes the same tile set.
        let per_dataset = tiles.len() / 2;
        assert_eq!(
            tiles.iter().filter(|t| t.dataset_id == "file_0").count(),
            per_dataset
        );
        assert!(tiles.iter().all(|t| t.mask_id.as_deref() == Some("mask-1")));
        assert!(tiles.iter().all(|t| t.coord.z >= 1 && t.coord.z <= 3));
    }
}
