//! Environment-driven service configuration.

use serde::{Deserialize, Serialize};
use std::env;

use storage::TileStoreConfig;

/// Spatial database connection parameters.
///
/// The database name varies per dataset, so only host and credentials are
/// fixed here; connection URLs are built per query call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgisConfig {
    pub host: String,
    pub user: String,
    pub password: String,
}

impl PostgisConfig {
    /// Connection URL for one database.
    pub fn url(&self, database: &str) -> String {
        format!(
            "postgres://{}:{}@{}:5432/{}",
            self.user, self.password, self.host, database
        )
    }
}

/// Service configuration, read from the environment once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Redis connection URL for the key/value namespace.
    pub redis_url: String,
    /// Spatial database credentials.
    pub postgis: PostgisConfig,
    /// Tile byte-store backend.
    pub tile_store: TileStoreConfig,
    /// Base URL of the upstream dataset-metadata service.
    pub upstream_base_url: String,
    /// Base URL of the render backend.
    pub renderer_base_url: String,
    /// Public base URL of this service, used to build tile URLs during
    /// self-referential pre-render fan-out.
    pub tile_base_url: String,
    /// Default concurrent in-flight requests per pre-render job.
    pub prerender_concurrency: usize,
    /// Which stored mask slot is consulted for serving and estimates.
    pub active_mask_index: usize,
    /// Timeout for individual upstream HTTP calls, seconds.
    pub request_timeout_secs: u64,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Load configuration from the environment, with local-dev defaults.
    pub fn from_env() -> Self {
        let tile_store = match var_or("TILE_STORE_BACKEND", "s3").as_str() {
            "disk" => TileStoreConfig::Disk {
                root: var_or("TILE_STORE_DIR", "/data/tiles"),
            },
            "memory" => TileStoreConfig::Memory,
            _ => TileStoreConfig::S3 {
                endpoint: var_or("S3_ENDPOINT", "http://minio:9000"),
                bucket: var_or("S3_BUCKET", "tiles"),
                access_key_id: var_or("S3_ACCESS_KEY", "minioadmin"),
                secret_access_key: var_or("S3_SECRET_KEY", "minioadmin"),
                region: var_or("S3_REGION", "us-east-1"),
                allow_http: true,
            },
        };

        Self {
            redis_url: var_or("REDIS_URL", "redis://redis:6379"),
            postgis: PostgisConfig {
                host: var_or("POSTGIS_HOST", "postgis"),
                user: var_or("POSTGIS_USER", "postgres"),
                password: var_or("POSTGIS_PASSWORD", "postgres"),
            },
            tile_store,
            upstream_base_url: var_or("DATASET_SERVICE_URL", "http://engine:3001"),
            renderer_base_url: var_or("RENDERER_URL", "http://renderer:4000"),
            tile_base_url: var_or("TILE_BASE_URL", "http://localhost:8080"),
            prerender_concurrency: var_or("PRERENDER_CONCURRENCY", "5")
                .parse()
                .unwrap_or(5),
            active_mask_index: var_or("ACTIVE_MASK_INDEX", "0").parse().unwrap_or(0),
            request_timeout_secs: var_or("REQUEST_TIMEOUT_SECS", "10").parse().unwrap_or(10),
        }
    }
}
