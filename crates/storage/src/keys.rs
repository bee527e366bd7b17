//! Cache-key construction for every logical namespace.
//!
//! Namespacing is by key-string prefix, not physical partitioning: tile
//! payloads, metadata records, render-job status and query results all live
//! behind the same two dumb stores. Staleness is encoded directly into cube
//! tile keys via the style fingerprint; there is no invalidation sweep.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tiles_common::{TileCoord, TileFormat};

/// Tile namespace, one per output kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TileKind {
    Raster,
    Vector,
    Grid,
}

impl TileKind {
    /// Key prefix for this namespace.
    pub fn prefix(&self) -> &'static str {
        match self {
            TileKind::Raster => "raster_tile",
            TileKind::Vector => "vector_tile",
            TileKind::Grid => "grid_tile",
        }
    }

    pub fn from_format(format: TileFormat) -> Self {
        match format {
            TileFormat::Png => TileKind::Raster,
            TileFormat::Pbf => TileKind::Vector,
            TileFormat::Grid => TileKind::Grid,
        }
    }
}

/// Key for a plain layer tile.
///
/// Layers are immutable after creation, so the key carries no fingerprint.
pub fn layer_tile(kind: TileKind, layer_id: &str, coord: &TileCoord) -> String {
    match kind {
        TileKind::Raster => format!(
            "raster_tile:{}:{}:{}:{}.png",
            layer_id, coord.z, coord.x, coord.y
        ),
        TileKind::Vector => format!(
            "vector_tile:{}:{}:{}:{}.pbf",
            layer_id, coord.z, coord.x, coord.y
        ),
        TileKind::Grid => format!("grid_tile:{}:{}:{}:{}", layer_id, coord.z, coord.x, coord.y),
    }
}

/// Key for a cube tile.
///
/// The style fingerprint changes whenever the cube's style or last-modified
/// timestamp changes, so stale-style tiles can never be served from cache.
pub fn cube_tile(
    cube_id: &str,
    dataset_id: &str,
    fingerprint: &str,
    mask_id: Option<&str>,
    coord: &TileCoord,
) -> String {
    format!(
        "cube_tile:{}:{}:{}:{}:{}:{}:{}.png",
        cube_id,
        dataset_id,
        fingerprint,
        mask_id.unwrap_or("none"),
        coord.z,
        coord.x,
        coord.y
    )
}

/// Key for a render-job status record.
pub fn render_job(job_id: &str) -> String {
    format!("render_job:{}", job_id)
}

/// Sibling counter key for a job's processed-tile count.
pub fn render_job_processed(job_id: &str) -> String {
    format!("render_job:{}:processed", job_id)
}

/// Sibling counter key for a job's failed-tile count.
pub fn render_job_failed(job_id: &str) -> String {
    format!("render_job:{}:failed", job_id)
}

/// Key for a cached masked-query result.
pub fn query_result(query_type: &str, cube_id: &str, year: i32, mask_id: &str) -> String {
    format!("query:{}:{}:{}:{}", query_type, cube_id, year, mask_id)
}

/// Content fingerprint over a style and the owning record's last-modified
/// timestamp.
///
/// Collision resistance gates cache correctness here, so this is a real
/// hash rather than a fast checksum; 128 bits of it are plenty for a key
/// fragment.
pub fn style_fingerprint(style: &str, last_modified_ms: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(style.as_bytes());
    hasher.update(last_modified_ms.to_string().as_bytes());
    hex::encode(hasher.finalize())[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_tile_keys() {
        let coord = TileCoord::new(3, 4, 5);
        assert_eq!(
            layer_tile(TileKind::Raster, "layer-a", &coord),
            "raster_tile:layer-a:3:4:5.png"
        );
        assert_eq!(
            layer_tile(TileKind::Vector, "layer-a", &coord),
            "vector_tile:layer-a:3:4:5.pbf"
        );
        assert_eq!(
            layer_tile(TileKind::Grid, "layer-a", &coord),
            "grid_tile:layer-a:3:4:5"
        );
    }

    #[test]
    fn test_cube_tile_key_with_and_without_mask() {
        let coord = TileCoord::new(9, 268, 148);
        let with_mask = cube_tile("cube-1", "file_abc", "fp", Some("mask-x"), &coord);
        let without = cube_tile("cube-1", "file_abc", "fp", None, &coord);

        assert!(with_mask.contains(":mask-x:"));
        assert!(without.contains(":none:"));
        assert_ne!(with_mask, without);
    }

    #[test]
    fn test_fingerprint_changes_with_style_and_timestamp() {
        let a = style_fingerprint("#layer { raster-opacity: 1; }", 1000);
        let b = style_fingerprint("#layer { raster-opacity: 0.5; }", 1000);
        let c = style_fingerprint("#layer { raster-opacity: 1; }", 2000);

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, style_fingerprint("#layer { raster-opacity: 1; }", 1000));
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_job_and_query_keys() {
        assert_eq!(render_job("job-1"), "render_job:job-1");
        assert_eq!(render_job_processed("job-1"), "render_job:job-1:processed");
        assert_eq!(render_job_failed("job-1"), "render_job:job-1:failed");
        assert_eq!(
            query_result("scf", "cube-1", 2016, "mask-a"),
            "query:scf:cube-1:2016:mask-a"
        );
    }
}
