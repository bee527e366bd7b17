//! Per-tile render orchestration.
//!
//! For a single tile request: resolve the cache key, serve a cache hit,
//! check extent applicability, otherwise invoke the render backend and write
//! the result through to the tile store. Failures never propagate to the
//! client as errors; raster requests degrade to a placeholder PNG and
//! vector/grid requests to an empty JSON body.
//!
//! Concurrent misses on the same key are not deduplicated: both render and
//! both write through. Renders are idempotent for a fixed key, so the cost
//! is duplicated work, not incorrect bytes.

use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};

use registry::{Cube, DataType, Layer, Mask, UploadStatus};
use storage::{keys, TileKind, TileStore};
use tiles_common::mercator::{bbox_to_meters, tile_to_envelope};
use tiles_common::{BoundingBox, TileCoord, TileFormat};

use crate::config::PostgisConfig;
use crate::metrics;
use crate::placeholder;
use crate::render_backend::{
    DatasourceKind, DatasourceParams, RenderBackend, RenderOutput, RenderRequest,
};
use crate::spatial::mask_clip_subquery;

/// Padding in degrees applied to mask extents before the overlap test;
/// GeoJSON-derived bboxes cut slightly short of rendered edges.
const MASK_EXTENT_PADDING_DEG: f64 = 0.5;

/// How a served tile was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileOutcome {
    /// Served from the tile store.
    CacheHit,
    /// Rendered by the backend and written through.
    Rendered,
    /// Outside the dataset or mask extent; placeholder payload.
    Empty,
    /// Render or metadata failure; placeholder payload.
    Error,
}

/// A complete tile response: payload plus content type.
#[derive(Debug, Clone)]
pub struct ServedTile {
    pub bytes: Bytes,
    pub content_type: &'static str,
    pub outcome: TileOutcome,
}

impl ServedTile {
    fn hit(bytes: Bytes, format: TileFormat) -> Self {
        Self {
            bytes,
            content_type: format.content_type(),
            outcome: TileOutcome::CacheHit,
        }
    }

    fn rendered(bytes: Bytes, format: TileFormat) -> Self {
        Self {
            bytes,
            content_type: format.content_type(),
            outcome: TileOutcome::Rendered,
        }
    }

    /// Placeholder response for an out-of-extent or failed tile.
    pub fn placeholder(format: TileFormat, outcome: TileOutcome) -> Self {
        match format {
            TileFormat::Png => Self {
                bytes: if outcome == TileOutcome::Error {
                    placeholder::error_tile()
                } else {
                    placeholder::empty_tile()
                },
                content_type: TileFormat::Png.content_type(),
                outcome,
            },
            // Vector and grid requests degrade to an empty JSON object.
            TileFormat::Pbf | TileFormat::Grid => Self {
                bytes: placeholder::empty_json(),
                content_type: "application/json",
                outcome,
            },
        }
    }
}

/// Orchestrates cache, extent checks and the render backend for one tile.
pub struct TileOrchestrator {
    tiles: Arc<TileStore>,
    renderer: Arc<dyn RenderBackend>,
    postgis: PostgisConfig,
}

impl TileOrchestrator {
    pub fn new(
        tiles: Arc<TileStore>,
        renderer: Arc<dyn RenderBackend>,
        postgis: PostgisConfig,
    ) -> Self {
        Self {
            tiles,
            renderer,
            postgis,
        }
    }

    /// Serve a tile for a stored layer.
    pub async fn layer_tile(
        &self,
        layer: &Layer,
        coord: &TileCoord,
        format: TileFormat,
        force_render: bool,
    ) -> ServedTile {
        let kind = TileKind::from_format(format);
        let key = keys::layer_tile(kind, &layer.layer_id, coord);

        if !force_render {
            if let Ok(Some(bytes)) = self.tiles.get(&key).await {
                metrics::record_tile(kind.prefix(), "cache_hit");
                return ServedTile::hit(bytes, format);
            }
        }

        if self.outside_extent(layer.extent_bbox(), None, coord) {
            metrics::record_tile(kind.prefix(), "empty");
            return ServedTile::placeholder(format, TileOutcome::Empty);
        }

        let request = self.layer_render_request(layer, coord, format);
        self.render_and_store(request, &key, format, kind.prefix())
            .await
    }

    /// Serve a raster tile for a cube dataset, optionally masked.
    ///
    /// `apply_mask_filter` narrows the data source to a clip subquery
    /// against the mask geometry. Skipping the filter is faster and used for
    /// full-extent pre-rendering; the extent short-circuit still applies.
    pub async fn cube_tile(
        &self,
        cube: &Cube,
        dataset: &UploadStatus,
        coord: &TileCoord,
        mask_id: Option<&str>,
        force_render: bool,
        apply_mask_filter: bool,
    ) -> ServedTile {
        let format = TileFormat::Png;

        if self.outside_extent(dataset.extent_bbox(), dataset.row_count(), coord) {
            metrics::record_tile("cube_tile", "empty");
            return ServedTile::placeholder(format, TileOutcome::Empty);
        }

        let mask = mask_id.and_then(|id| cube.mask_by_id(id));
        if let Some(mask) = mask {
            if self.outside_mask_extent(mask, coord) {
                metrics::record_tile("cube_tile", "empty");
                return ServedTile::placeholder(format, TileOutcome::Empty);
            }
        }

        let fingerprint = cube.style_fingerprint();
        let key = keys::cube_tile(&cube.cube_id, &dataset.file_id, &fingerprint, mask_id, coord);

        if !force_render {
            if let Ok(Some(bytes)) = self.tiles.get(&key).await {
                metrics::record_tile("cube_tile", "cache_hit");
                return ServedTile::hit(bytes, format);
            }
        }

        let request = match self.cube_render_request(cube, dataset, coord, mask, apply_mask_filter)
        {
            Some(request) => request,
            None => {
                warn!(cube_id = %cube.cube_id, dataset = %dataset.file_id, "Dataset has no table reference");
                metrics::record_tile("cube_tile", "error");
                return ServedTile::placeholder(format, TileOutcome::Error);
            }
        };

        self.render_and_store(request, &key, format, "cube_tile")
            .await
    }

    /// True when the tile's envelope cannot intersect the extent.
    ///
    /// Fails open: a missing or unparseable extent never blocks serving, and
    /// a single-row dataset collapses to a point extent that is always
    /// treated as inside.
    fn outside_extent(
        &self,
        extent: Option<BoundingBox>,
        row_count: Option<i64>,
        coord: &TileCoord,
    ) -> bool {
        if row_count == Some(1) {
            return false;
        }

        let Some(extent) = extent else {
            return false;
        };
        if extent.is_degenerate() {
            return false;
        }

        let data_bounds = bbox_to_meters(&extent);
        let tile_bounds = tile_to_envelope(coord);
        !tile_bounds.overlaps(&data_bounds)
    }

    fn outside_mask_extent(&self, mask: &Mask, coord: &TileCoord) -> bool {
        let Some(extent) = mask.geometry_extent() else {
            return false;
        };

        let padded = extent.padded(MASK_EXTENT_PADDING_DEG);
        let mask_bounds = bbox_to_meters(&padded);
        let tile_bounds = tile_to_envelope(coord);
        !tile_bounds.overlaps(&mask_bounds)
    }

    fn layer_render_request(
        &self,
        layer: &Layer,
        coord: &TileCoord,
        format: TileFormat,
    ) -> RenderRequest {
        let options = &layer.options;

        let datasource = match options.data_type {
            DataType::Raster => DatasourceParams {
                host: self.postgis.host.clone(),
                user: self.postgis.user.clone(),
                password: self.postgis.password.clone(),
                dbname: options.database_name.clone(),
                kind: DatasourceKind::Pgraster,
                table: options.file_id.clone(),
                geometry_field: "rast".to_string(),
                srid: options.srid,
                band: Some(options.raster_band.max(1)),
            },
            DataType::Vector => DatasourceParams {
                host: self.postgis.host.clone(),
                user: self.postgis.user.clone(),
                password: self.postgis.password.clone(),
                dbname: options.database_name.clone(),
                kind: DatasourceKind::Postgis,
                table: options.sql.clone(),
                geometry_field: options.geom_column.clone(),
                srid: options.srid,
                band: None,
            },
        };

        let output = match format {
            TileFormat::Png => RenderOutput::Raster {
                quality: "png8".to_string(),
            },
            TileFormat::Pbf => RenderOutput::Vector,
            TileFormat::Grid => RenderOutput::Grid {
                fields: vec!["gid".to_string()],
            },
        };

        RenderRequest {
            datasource,
            style: options.cartocss.clone(),
            style_version: options.cartocss_version.clone(),
            bbox: tile_to_envelope(coord),
            zoom: coord.z,
            output,
        }
    }

    fn cube_render_request(
        &self,
        cube: &Cube,
        dataset: &UploadStatus,
        coord: &TileCoord,
        mask: Option<&Mask>,
        apply_mask_filter: bool,
    ) -> Option<RenderRequest> {
        let database = dataset.database_name.clone()?;
        let table_name = dataset.table_name.clone()?;

        let table = match (apply_mask_filter, mask) {
            (true, Some(mask)) => match mask.filter_geometry_json() {
                Some(geojson) => {
                    debug!(mask_id = %mask.id, "Filtering data source with mask geometry");
                    mask_clip_subquery(&table_name, &geojson)
                }
                None => table_name,
            },
            _ => table_name,
        };

        let quality = if cube.quality.is_empty() {
            "png8".to_string()
        } else {
            cube.quality.clone()
        };

        Some(RenderRequest {
            datasource: DatasourceParams {
                host: self.postgis.host.clone(),
                user: self.postgis.user.clone(),
                password: self.postgis.password.clone(),
                dbname: database,
                kind: DatasourceKind::Pgraster,
                table,
                geometry_field: "rast".to_string(),
                srid: 3857,
                band: Some(1),
            },
            style: cube.style.clone(),
            style_version: "2.0.1".to_string(),
            bbox: tile_to_envelope(coord),
            zoom: coord.z,
            output: RenderOutput::Raster { quality },
        })
    }

    async fn render_and_store(
        &self,
        request: RenderRequest,
        key: &str,
        format: TileFormat,
        metric_kind: &'static str,
    ) -> ServedTile {
        let rendered = match self.renderer.render(&request).await {
            Ok(bytes) => {
                metrics::record_render(true);
                bytes
            }
            Err(e) => {
                metrics::record_render(false);
                metrics::record_tile(metric_kind, "error");
                info!(error = %e, key = %key, "Render failed, serving placeholder");
                return ServedTile::placeholder(format, TileOutcome::Error);
            }
        };

        // A write-through failure must not fail the response; the rendered
        // bytes are still returned.
        if let Err(e) = self.tiles.put(key, rendered.clone()).await {
            warn!(error = %e, key = %key, "Tile write-through failed");
        }

        metrics::record_tile(metric_kind, "rendered");
        ServedTile::rendered(rendered, format)
    }
}
