//! Application state and shared resources.
//!
//! Every component receives its collaborators through this struct; there is
//! no package-level mutable state. The key/value client is a single shared
//! handle reused across requests; spatial database connections are opened
//! per query call inside the executor.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use registry::{CubeRegistry, LayerRegistry};
use storage::{KeyValueStore, RedisStore, TileStore};

use crate::config::Config;
use crate::orchestrator::TileOrchestrator;
use crate::prerender::PreRenderEngine;
use crate::render_backend::{HttpRenderBackend, RenderBackend};
use crate::scf::QueryEngine;
use crate::spatial::{PostgisExecutor, SpatialExecutor};
use crate::upstream::{DatasetService, HttpDatasetService};

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub kv: Arc<dyn KeyValueStore>,
    pub tiles: Arc<TileStore>,
    pub cubes: Arc<CubeRegistry>,
    pub layers: Arc<LayerRegistry>,
    pub upstream: Arc<dyn DatasetService>,
    pub spatial: Arc<dyn SpatialExecutor>,
    pub orchestrator: Arc<TileOrchestrator>,
    pub prerender: PreRenderEngine,
    pub queries: QueryEngine,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        let timeout = Duration::from_secs(config.request_timeout_secs);

        let kv: Arc<dyn KeyValueStore> = Arc::new(RedisStore::connect(&config.redis_url).await?);
        let tiles = Arc::new(TileStore::new(&config.tile_store)?);
        let cubes = Arc::new(CubeRegistry::new(kv.clone()));
        let layers = Arc::new(LayerRegistry::new(kv.clone()));

        let upstream: Arc<dyn DatasetService> =
            Arc::new(HttpDatasetService::new(&config.upstream_base_url, timeout)?);
        let spatial: Arc<dyn SpatialExecutor> =
            Arc::new(PostgisExecutor::new(config.postgis.clone()));
        let renderer: Arc<dyn RenderBackend> =
            Arc::new(HttpRenderBackend::new(&config.renderer_base_url, timeout)?);

        let orchestrator = Arc::new(TileOrchestrator::new(
            tiles.clone(),
            renderer,
            config.postgis.clone(),
        ));
        let prerender = PreRenderEngine::new(kv.clone(), upstream.clone(), config.active_mask_index);
        let queries = QueryEngine::new(
            kv.clone(),
            cubes.clone(),
            upstream.clone(),
            spatial.clone(),
            config.active_mask_index,
        );

        Ok(Self {
            config,
            kv,
            tiles,
            cubes,
            layers,
            upstream,
            spatial,
            orchestrator,
            prerender,
            queries,
        })
    }
}
