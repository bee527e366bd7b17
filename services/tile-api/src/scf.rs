//! Masked spatial aggregation queries over cubes.
//!
//! Computes a snow-cover-fraction-style statistic per dataset date: a
//! pixel-value histogram restricted to the valid 100–200 value range (an
//! encoded percentage scale; everything outside is noise or nodata),
//! averaged and shifted to percent. Results are cached per
//! (query type, cube, year, mask); individual dataset failures are skipped
//! rather than failing the whole query.

use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use registry::{Cube, CubeRegistry, DatasetRef, UploadStatus};
use storage::{keys, KeyValueStore};
use tiles_common::geo::{feature_collection_from_geometry, primary_geometry_json};
use tiles_common::{TileError, TileResult};

use crate::metrics;
use crate::spatial::{SpatialExecutor, ValueCount};
use crate::upstream::DatasetService;

/// Lower bound of the valid encoded pixel-value range.
const VALUE_RANGE_MIN: f64 = 100.0;
/// Upper bound of the valid encoded pixel-value range.
const VALUE_RANGE_MAX: f64 = 200.0;
/// In-flight dataset queries per request.
const QUERY_CONCURRENCY: usize = 4;

/// Mask selector supplied with a query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryMask {
    pub mask_id: Option<String>,
    /// Single mask geometry, or the string `"all"` for the stored mask.
    pub geometry: Option<Value>,
    /// Multiple geometries; counts are summed across them per date.
    pub geometries: Option<Vec<Value>>,
}

/// Body of a cube query request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CubeQueryRequest {
    pub cube_id: Option<String>,
    pub query_type: Option<String>,
    pub year: Option<i32>,
    pub mask_id: Option<String>,
    pub mask: Option<QueryMask>,
    #[serde(default)]
    pub force_query: bool,
    pub access_token: Option<String>,
}

/// One dated statistic in a query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScfPoint {
    pub date: String,
    #[serde(rename = "SCF")]
    pub scf: f64,
}

/// Average valid pixel value of a histogram, shifted to percent.
pub fn scf_from_counts(rows: &[ValueCount]) -> Option<f64> {
    let mut total = 0.0;
    let mut weighted = 0.0;

    for row in rows {
        if row.value >= VALUE_RANGE_MIN && row.value <= VALUE_RANGE_MAX {
            total += row.count as f64;
            weighted += row.count as f64 * row.value;
        }
    }

    if total == 0.0 {
        return None;
    }
    Some(weighted / total - VALUE_RANGE_MIN)
}

/// Combine per-date value histograms (already summed across masks) into
/// dated statistics.
pub fn combine_date_histograms(dates: &BTreeMap<String, BTreeMap<i64, i64>>) -> Vec<ScfPoint> {
    let mut points = Vec::with_capacity(dates.len());

    for (date, values) in dates {
        let mut total = 0.0;
        let mut weighted = 0.0;

        for (&value, &count) in values {
            let moved = value as f64 - VALUE_RANGE_MIN;
            if (0.0..=100.0).contains(&moved) {
                total += count as f64;
                weighted += count as f64 * moved;
            }
        }

        if total > 0.0 {
            points.push(ScfPoint {
                date: date.clone(),
                scf: weighted / total,
            });
        }
    }

    points
}

/// Dataset refs whose timestamp falls within a calendar year.
pub fn refs_in_year(refs: &[DatasetRef], year: i32) -> Vec<DatasetRef> {
    use chrono::Datelike;
    refs.iter()
        .filter(|r| r.timestamp.year() == year)
        .cloned()
        .collect()
}

/// Runs masked aggregation queries and caches their results.
pub struct QueryEngine {
    kv: Arc<dyn KeyValueStore>,
    cubes: Arc<CubeRegistry>,
    upstream: Arc<dyn DatasetService>,
    spatial: Arc<dyn SpatialExecutor>,
    active_mask_index: usize,
}

impl QueryEngine {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        cubes: Arc<CubeRegistry>,
        upstream: Arc<dyn DatasetService>,
        spatial: Arc<dyn SpatialExecutor>,
        active_mask_index: usize,
    ) -> Self {
        Self {
            kv,
            cubes,
            upstream,
            spatial,
            active_mask_index,
        }
    }

    /// Raster-mask query (`scf`): the cube's active mask references a
    /// raster table; histograms come from intersecting each dataset's
    /// raster against it.
    pub async fn raster_mask_query(&self, request: &CubeQueryRequest) -> TileResult<Vec<ScfPoint>> {
        let cube_id = required(&request.cube_id, "Need to provide cube_id.")?;
        let year = request
            .year
            .ok_or_else(|| TileError::Validation("Need to provide a year.".into()))?;

        let cube = self.cubes.get(cube_id).await?;
        let mask_table = cube
            .active_mask(self.active_mask_index)
            .and_then(|m| m.raster_dataset_id())
            .ok_or_else(|| TileError::Validation("Mask type not supported.".into()))?
            .to_string();

        let cache_key = keys::query_result("scf", cube_id, year, &mask_table);
        if let Some(cached) = self.cached(&cache_key, request.force_query).await? {
            return Ok(cached);
        }
        metrics::record_query("scf");

        let details = self.year_details(&cube, year, request).await?;

        // Bounded fan-out; a failed dataset is dropped, not fatal.
        let mut points: Vec<ScfPoint> = stream::iter(details)
            .map(|dataset| {
                let mask_table = mask_table.clone();
                let cube = &cube;
                async move {
                    let (database, table) = dataset_tables(&dataset)?;
                    let date = ref_date(cube, &dataset)?;

                    match self
                        .spatial
                        .value_counts_raster_mask(&database, &table, &mask_table)
                        .await
                    {
                        Ok(rows) => scf_from_counts(&rows).map(|scf| ScfPoint { date, scf }),
                        Err(e) => {
                            warn!(dataset = %dataset.file_id, error = %e, "Dataset query failed, skipping");
                            None
                        }
                    }
                }
            })
            .buffer_unordered(QUERY_CONCURRENCY)
            .filter_map(|point| async move { point })
            .collect()
            .await;
        points.sort_by(|a, b| a.date.cmp(&b.date));

        self.persist(&cache_key, &points).await;
        Ok(points)
    }

    /// Vector-mask query (`scf-geojson`) with a single geometry, the stored
    /// mask, or no filter at all.
    pub async fn single_mask_query(&self, request: &CubeQueryRequest) -> TileResult<Vec<ScfPoint>> {
        let cube_id = required(&request.cube_id, "Need to provide cube_id.")?;
        let year = request
            .year
            .ok_or_else(|| TileError::Validation("Need to provide a year.".into()))?;

        let mask_key = request
            .mask_id
            .clone()
            .or_else(|| request.mask.as_ref().and_then(|m| m.mask_id.clone()))
            .ok_or_else(|| TileError::Validation("Need a mask to query.".into()))?;

        let cache_key = keys::query_result("scf-geojson", cube_id, year, &mask_key);
        if let Some(cached) = self.cached(&cache_key, request.force_query).await? {
            return Ok(cached);
        }
        metrics::record_query("scf-geojson");

        let cube = self.cubes.get(cube_id).await?;
        let filter_geojson = self.resolve_filter_geometry(&cube, request);

        let details = self.year_details(&cube, year, request).await?;

        let mut points: Vec<ScfPoint> = stream::iter(details)
            .map(|dataset| {
                let filter = filter_geojson.clone();
                let cube = &cube;
                async move {
                    let (database, table) = dataset_tables(&dataset)?;
                    let date = ref_date(cube, &dataset)?;

                    match self
                        .spatial
                        .value_counts_geojson(&database, &table, filter.as_deref())
                        .await
                    {
                        Ok(rows) => scf_from_counts(&rows).map(|scf| ScfPoint { date, scf }),
                        Err(e) => {
                            warn!(dataset = %dataset.file_id, error = %e, "Dataset query failed, skipping");
                            None
                        }
                    }
                }
            })
            .buffer_unordered(QUERY_CONCURRENCY)
            .filter_map(|point| async move { point })
            .collect()
            .await;
        points.sort_by(|a, b| a.date.cmp(&b.date));

        self.persist(&cache_key, &points).await;
        Ok(points)
    }

    /// Vector-mask query across several geometries: per-value counts are
    /// summed across all masks sharing a date before the ratio is computed.
    pub async fn multi_mask_query(&self, request: &CubeQueryRequest) -> TileResult<Vec<ScfPoint>> {
        let cube_id = required(&request.cube_id, "Need to provide cube_id.")?;
        let year = request
            .year
            .ok_or_else(|| TileError::Validation("Need to provide a year.".into()))?;

        let mask = request.mask.clone().unwrap_or_default();
        let geometries = mask
            .geometries
            .filter(|g| !g.is_empty())
            .ok_or_else(|| TileError::Validation("Need mask geometries to query.".into()))?;
        let mask_key = mask.mask_id.unwrap_or_else(|| "multi".to_string());

        let cache_key = keys::query_result("scf-multi", cube_id, year, &mask_key);
        if let Some(cached) = self.cached(&cache_key, request.force_query).await? {
            return Ok(cached);
        }
        metrics::record_query("scf-multi");

        let cube = self.cubes.get(cube_id).await?;
        let details = self.year_details(&cube, year, request).await?;

        let mut dates: BTreeMap<String, BTreeMap<i64, i64>> = BTreeMap::new();

        for geometry in &geometries {
            let collection = feature_collection_from_geometry(geometry.clone());
            let filter = primary_geometry_json(&collection);

            for dataset in &details {
                let Some((database, table)) = dataset_tables(dataset) else {
                    continue;
                };
                let Some(date) = ref_date(&cube, dataset) else {
                    continue;
                };

                match self
                    .spatial
                    .value_counts_geojson(&database, &table, filter.as_deref())
                    .await
                {
                    Ok(rows) => {
                        let histogram = dates.entry(date).or_default();
                        for row in rows {
                            *histogram.entry(row.value as i64).or_insert(0) += row.count;
                        }
                    }
                    Err(e) => {
                        warn!(dataset = %dataset.file_id, error = %e, "Dataset query failed, skipping")
                    }
                }
            }
        }

        let points = combine_date_histograms(&dates);
        self.persist(&cache_key, &points).await;
        Ok(points)
    }

    async fn cached(&self, cache_key: &str, force: bool) -> TileResult<Option<Vec<ScfPoint>>> {
        if force {
            return Ok(None);
        }
        match self.kv.get(cache_key).await? {
            Some(raw) => {
                debug!(key = %cache_key, "Serving cached query result");
                Ok(serde_json::from_str(&raw).ok())
            }
            None => Ok(None),
        }
    }

    async fn persist(&self, cache_key: &str, points: &[ScfPoint]) {
        match serde_json::to_string(points) {
            Ok(raw) => {
                if let Err(e) = self.kv.set(cache_key, &raw).await {
                    warn!(key = %cache_key, error = %e, "Failed to cache query result");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize query result"),
        }
        info!(key = %cache_key, points = points.len(), "Query complete");
    }

    /// Details for the cube's datasets within the requested year.
    async fn year_details(
        &self,
        cube: &Cube,
        year: i32,
        request: &CubeQueryRequest,
    ) -> TileResult<Vec<UploadStatus>> {
        let refs = refs_in_year(&cube.datasets, year);
        if refs.is_empty() {
            return Ok(Vec::new());
        }
        self.upstream
            .dataset_details(&refs, request.access_token.as_deref())
            .await
    }

    /// Filter geometry for single-mask queries: an explicit geometry wins,
    /// `"all"` (or nothing) falls back to the stored active mask.
    fn resolve_filter_geometry(&self, cube: &Cube, request: &CubeQueryRequest) -> Option<String> {
        let geometry = request.mask.as_ref().and_then(|m| m.geometry.clone());

        match geometry {
            Some(Value::String(s)) if s == "all" => cube
                .active_mask(self.active_mask_index)
                .and_then(|m| m.filter_geometry_json()),
            Some(geometry) => {
                primary_geometry_json(&feature_collection_from_geometry(geometry))
            }
            None => cube
                .active_mask(self.active_mask_index)
                .and_then(|m| m.filter_geometry_json()),
        }
    }
}

fn required<'a>(field: &'a Option<String>, message: &str) -> TileResult<&'a str> {
    field
        .as_deref()
        .ok_or_else(|| TileError::Validation(message.to_string()))
}

fn dataset_tables(dataset: &UploadStatus) -> Option<(String, String)> {
    Some((dataset.database_name.clone()?, dataset.table_name.clone()?))
}

/// The result date comes from the cube's own dataset ref, not the
/// dataset's internal processing timestamp.
fn ref_date(cube: &Cube, dataset: &UploadStatus) -> Option<String> {
    let table = dataset.table_name.as_deref()?;
    cube.datasets
        .iter()
        .find(|r| r.id == table)
        .map(|r| r.timestamp.to_rfc3339())
}
