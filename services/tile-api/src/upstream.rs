//! Client for the upstream dataset-metadata service.
//!
//! Datasets are ingested and managed elsewhere; this service only looks up
//! processing status, batch dataset details and dataset GeoJSON, and writes
//! back status records for vectorization. Every call carries a bounded
//! timeout so a hung upstream cannot pin a worker slot.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use registry::{DatasetRef, UploadStatus};
use tiles_common::{TileError, TileResult};

/// Narrow contract against the dataset service.
#[async_trait]
pub trait DatasetService: Send + Sync {
    /// Fetch the processing status record for one dataset.
    async fn upload_status(
        &self,
        file_id: &str,
        access_token: Option<&str>,
    ) -> TileResult<UploadStatus>;

    /// Store a status record (used by vectorization).
    async fn set_upload_status(
        &self,
        status: &UploadStatus,
        access_token: Option<&str>,
    ) -> TileResult<()>;

    /// Resolve full details (table/database names) for a set of refs.
    async fn dataset_details(
        &self,
        datasets: &[DatasetRef],
        access_token: Option<&str>,
    ) -> TileResult<Vec<UploadStatus>>;

    /// Fetch a vector dataset as GeoJSON.
    async fn dataset_geojson(
        &self,
        dataset_id: &str,
        access_token: Option<&str>,
    ) -> TileResult<Value>;
}

/// HTTP implementation against the dataset service's v2 API.
pub struct HttpDatasetService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDatasetService {
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

    fn upstream_error(context: &str, e: reqwest::Error) -> TileError {
        if e.is_timeout() {
            TileError::Timeout
        } else {
            TileError::Upstream(format!("{}: {}", context, e))
        }
    }
}

#[async_trait]
impl DatasetService for HttpDatasetService {
    async fn upload_status(
        &self,
        file_id: &str,
        access_token: Option<&str>,
    ) -> TileResult<UploadStatus> {
        let url = format!("{}/v2/data/status", self.base_url);
        debug!(file_id = %file_id, "Fetching upload status");

        let mut query: Vec<(&str, &str)> = vec![("file_id", file_id)];
        if let Some(token) = access_token {
            query.push(("access_token", token));
        }

        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| Self::upstream_error("Status lookup failed", e))?;

        response
            .json()
            .await
            .map_err(|e| TileError::Upstream(format!("Invalid status record: {}", e)))
    }

    async fn set_upload_status(
        &self,
        status: &UploadStatus,
        access_token: Option<&str>,
    ) -> TileResult<()> {
        let url = format!("{}/v2/data/status", self.base_url);

        let body = serde_json::json!({
            "upload_status": status,
            "access_token": access_token,
        });

        self.client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::upstream_error("Status update failed", e))?
            .error_for_status()
            .map_err(|e| TileError::Upstream(format!("Status update rejected: {}", e)))?;

        Ok(())
    }

    async fn dataset_details(
        &self,
        datasets: &[DatasetRef],
        access_token: Option<&str>,
    ) -> TileResult<Vec<UploadStatus>> {
        let url = format!("{}/v2/data/several", self.base_url);

        let body = serde_json::json!({
            "datasets": datasets,
            "access_token": access_token,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::upstream_error("Dataset details failed", e))?;

        response
            .json()
            .await
            .map_err(|e| TileError::Upstream(format!("Invalid dataset details: {}", e)))
    }

    async fn dataset_geojson(
        &self,
        dataset_id: &str,
        access_token: Option<&str>,
    ) -> TileResult<Value> {
        let url = format!("{}/v2/data/geojson", self.base_url);

        let mut query: Vec<(&str, &str)> = vec![("dataset_id", dataset_id)];
        if let Some(token) = access_token {
            query.push(("access_token", token));
        }

        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|_| TileError::Upstream("Unauthorized".into()))?;

        if !response.status().is_success() {
            return Err(TileError::Upstream("Unauthorized".into()));
        }

        response
            .json()
            .await
            .map_err(|_| TileError::Upstream("Invalid GeoJSON".into()))
    }
}
