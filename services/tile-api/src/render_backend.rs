//! Interface to the external cartographic render backend.
//!
//! The backend owns stylesheet compilation and rasterization; this service
//! only prepares its inputs (data source parameters, style, tile envelope,
//! output options) and consumes the returned bytes. The production
//! implementation speaks JSON over HTTP to a renderer worker.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use tiles_common::{BoundingBox, TileError, TileResult};

/// Data source kind understood by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasourceKind {
    /// Vector geometries from a table or subquery.
    Postgis,
    /// Raster coverage from a raster table.
    Pgraster,
}

/// Connection and query parameters for the renderer's data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasourceParams {
    pub host: String,
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub kind: DatasourceKind,
    /// Table name or derived subquery.
    pub table: String,
    pub geometry_field: String,
    pub srid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub band: Option<u32>,
}

/// Output-type-specific render options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output", rename_all = "lowercase")]
pub enum RenderOutput {
    /// Raster image; quality is the encoder profile (png8, png32, ...).
    Raster { quality: String },
    /// Mapbox vector tile.
    Vector,
    /// UTFGrid with the named interactivity fields.
    Grid { fields: Vec<String> },
}

/// One render invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderRequest {
    pub datasource: DatasourceParams,
    /// Cartographic stylesheet source.
    pub style: String,
    pub style_version: String,
    /// Tile envelope in EPSG:3857.
    pub bbox: BoundingBox,
    pub zoom: u32,
    #[serde(flatten)]
    pub output: RenderOutput,
}

/// The render backend contract.
#[async_trait]
pub trait RenderBackend: Send + Sync {
    /// Render one tile; the payload encoding follows `request.output`.
    async fn render(&self, request: &RenderRequest) -> TileResult<Bytes>;
}

/// HTTP client for a renderer worker.
pub struct HttpRenderBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRenderBackend {
    pub fn new(base_url: &str, timeout: Duration) -> TileResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TileError::Internal(format!("HTTP client build failed: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RenderBackend for HttpRenderBackend {
    async fn render(&self, request: &RenderRequest) -> TileResult<Bytes> {
        let url = format!("{}/render", self.base_url);
        debug!(table = %request.datasource.table, zoom = request.zoom, "Dispatching render");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TileError::Timeout
                } else {
                    TileError::Render(format!("Render backend unreachable: {}", e))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TileError::Render(format!(
                "Render backend returned {}: {}",
                status, body
            )));
        }

        response
            .bytes()
            .await
            .map_err(|e| TileError::Render(format!("Failed to read render response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_request_serialization() {
        let request = RenderRequest {
            datasource: DatasourceParams {
                host: "postgis".into(),
                user: "u".into(),
                password: "p".into(),
                dbname: "db".into(),
                kind: DatasourceKind::Pgraster,
                table: "file_abc".into(),
                geometry_field: "rast".into(),
                srid: 3857,
                band: Some(1),
            },
            style: "#layer { raster-opacity: 1; }".into(),
            style_version: "2.0.1".into(),
            bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            zoom: 7,
            output: RenderOutput::Raster {
                quality: "png8".into(),
            },
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["datasource"]["kind"], "pgraster");
        assert_eq!(json["output"], "raster");
        assert_eq!(json["quality"], "png8");

        let parsed: RenderRequest = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.output, request.output);
    }
}
