//! Layer records: render-ready configurations over processed datasets.
//!
//! A layer is immutable after creation; there is no update path. Creation
//! validates that the upstream dataset finished processing and fills in the
//! rendering defaults the backend expects.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use storage::{get_json, set_json, KeyValueStore};
use tiles_common::geo::geometry_bbox;
use tiles_common::{BoundingBox, TileError, TileResult};

/// Dataset/layer payload discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Vector,
    Raster,
}

/// Fallback stylesheet for raster layers created without one.
pub const DEFAULT_RASTER_STYLE: &str = "#layer { \
     raster-opacity: 1; \
     raster-colorizer-default-mode: linear; \
     raster-colorizer-default-color: transparent; \
     raster-colorizer-stops: \
       stop(20, rgba(0,0,0,0)) \
       stop(21, #dddddd) \
       stop(200, #0078ff) \
       stop(255, rgba(0,0,0,0), exact); \
     raster-comp-op: color-dodge; }";

/// Upstream dataset status record, as returned by the dataset service.
///
/// Only the fields the tile service consumes are typed; everything else is
/// carried through untouched so vectorize can clone whole records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadStatus {
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,
    #[serde(default)]
    pub processing_success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Serialized metadata blob; includes the computed extent geometry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_count: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UploadStatus {
    /// Row count as a number; the upstream service reports it as a string.
    pub fn row_count(&self) -> Option<i64> {
        match &self.rows_count {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    /// Geographic extent parsed out of the metadata blob, when present.
    pub fn extent_bbox(&self) -> Option<BoundingBox> {
        let metadata: Value = serde_json::from_str(self.metadata.as_deref()?).ok()?;
        geometry_bbox(metadata.get("extent_geojson")?)
    }

    /// Clone this record into a placeholder for an in-flight vectorization:
    /// fresh file id, vector type, processing flags reset.
    pub fn vectorized_placeholder(&self) -> UploadStatus {
        let suffix = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let mut placeholder = self.clone();
        placeholder.file_id = format!("file_{}", &suffix[..20]);
        placeholder.data_type = Some(DataType::Vector);
        placeholder.status = Some("Processing".to_string());
        placeholder.processing_success = false;
        placeholder.timestamp = Some(chrono::Utc::now().timestamp_millis());
        placeholder
    }
}

/// Parameters accepted by layer creation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LayerCreateParams {
    pub file_id: Option<String>,
    pub sql: Option<String>,
    pub cartocss: Option<String>,
    pub cartocss_version: Option<String>,
    pub geom_column: Option<String>,
    pub geom_type: Option<String>,
    pub raster_band: Option<u32>,
    pub srid: Option<u32>,
    pub data_type: Option<DataType>,
    pub access_token: Option<String>,
}

/// Rendering options of a stored layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerOptions {
    pub layer_id: String,
    pub sql: String,
    pub cartocss: String,
    pub cartocss_version: String,
    pub file_id: String,
    pub database_name: String,
    pub table_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    pub data_type: DataType,
    pub geom_column: String,
    pub geom_type: String,
    pub raster_band: u32,
    pub srid: u32,
}

/// A stored layer: id plus rendering options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    pub layer_id: String,
    pub options: LayerOptions,
}

impl Layer {
    /// Build a layer from a processed upstream dataset and the requested
    /// overrides, applying the rendering defaults.
    pub fn from_upload(upload: &UploadStatus, params: &LayerCreateParams) -> TileResult<Layer> {
        let data_type = params
            .data_type
            .or(upload.data_type)
            .unwrap_or(DataType::Vector);

        let cartocss = match (&params.cartocss, data_type) {
            (Some(css), _) if !css.is_empty() => css.clone(),
            (_, DataType::Raster) => DEFAULT_RASTER_STYLE.to_string(),
            _ => {
                return Err(TileError::Validation("Please provide CartoCSS.".into()));
            }
        };

        let sql = params
            .sql
            .clone()
            .ok_or_else(|| TileError::Validation("Please provide a SQL statement.".into()))?;

        let table_name = upload
            .table_name
            .clone()
            .ok_or_else(|| TileError::Upstream("Upload status has no table name".into()))?;
        let database_name = upload
            .database_name
            .clone()
            .ok_or_else(|| TileError::Upstream("Upload status has no database name".into()))?;

        // The client writes `table` as a placeholder for the real name;
        // only the first occurrence is the placeholder.
        let sql = sql.replacen("table", &table_name, 1);

        let layer_id = format!("layer_id-{}", Uuid::new_v4());
        Ok(Layer {
            layer_id: layer_id.clone(),
            options: LayerOptions {
                layer_id,
                sql,
                cartocss,
                cartocss_version: params
                    .cartocss_version
                    .clone()
                    .unwrap_or_else(|| "2.0.1".to_string()),
                file_id: upload.file_id.clone(),
                database_name,
                table_name,
                metadata: upload.metadata.clone(),
                data_type,
                geom_column: params
                    .geom_column
                    .clone()
                    .unwrap_or_else(|| "the_geom_3857".to_string()),
                geom_type: params
                    .geom_type
                    .clone()
                    .unwrap_or_else(|| "geometry".to_string()),
                raster_band: params.raster_band.unwrap_or(0),
                srid: params.srid.unwrap_or(3857),
            },
        })
    }

    /// Geographic extent parsed out of the metadata blob, when present.
    pub fn extent_bbox(&self) -> Option<BoundingBox> {
        let metadata: Value = serde_json::from_str(self.options.metadata.as_deref()?).ok()?;
        geometry_bbox(metadata.get("extent_geojson")?)
    }
}

/// CRUD over layer records in the key/value store.
pub struct LayerRegistry {
    kv: Arc<dyn KeyValueStore>,
}

impl LayerRegistry {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub async fn save(&self, layer: &Layer) -> TileResult<()> {
        set_json(self.kv.as_ref(), &layer.layer_id, layer).await?;
        info!(layer_id = %layer.layer_id, "Stored layer");
        Ok(())
    }

    pub async fn get(&self, layer_id: &str) -> TileResult<Layer> {
        get_json(self.kv.as_ref(), layer_id)
            .await?
            .ok_or_else(|| TileError::NotFound(format!("No such layer: {}", layer_id)))
    }
}
