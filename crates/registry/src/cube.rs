//! Cube records: time-series layers aggregating dated datasets under one
//! style and mask configuration.
//!
//! Every mutation is a read-modify-write of the whole record against its own
//! key, with no compare-and-swap: concurrent writers to the same cube are
//! last-writer-wins at record granularity. Callers needing strict
//! serialization must serialize externally.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use storage::{get_json, set_json, KeyValueStore};
use tiles_common::{TileError, TileResult};

use crate::mask::Mask;

/// Default cartographic style for new cubes.
pub const DEFAULT_CUBE_STYLE: &str = "#layer { raster-opacity: 1; }";

/// Default output quality/encoding for new cubes.
pub const DEFAULT_CUBE_QUALITY: &str = "png32";

/// A cube: ordered dated datasets plus style, quality and masks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cube {
    pub cube_id: String,
    /// Creation time, epoch milliseconds.
    pub created: i64,
    /// Last-modified time, epoch milliseconds. Updated on every structural
    /// mutation; feeds the style fingerprint, so any change rolls every
    /// cached tile key for this cube.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    pub style: String,
    pub quality: String,
    #[serde(default)]
    pub datasets: Vec<DatasetRef>,
    #[serde(default)]
    pub masks: Vec<Mask>,
    /// Free-form option bag; round-trips untouched.
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

/// A cube's pointer to an externally-managed dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRef {
    /// Upstream dataset id (`file_...`).
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Temporal position of this dataset within the cube. Distinct from the
    /// dataset's own processing timestamp.
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granularity: Option<Granularity>,
    /// Set whenever the ref is touched, epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
}

/// Time-bucket resolution used when replacing datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[default]
    Day,
    Week,
    Month,
    Year,
}

impl Granularity {
    /// Whether two instants fall into the same bucket at this resolution.
    pub fn same_bucket(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        match self {
            Granularity::Day => a.date_naive() == b.date_naive(),
            Granularity::Week => {
                a.iso_week().year() == b.iso_week().year() && a.iso_week().week() == b.iso_week().week()
            }
            Granularity::Month => a.year() == b.year() && a.month() == b.month(),
            Granularity::Year => a.year() == b.year(),
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl Cube {
    /// Build a new cube with defaults applied.
    pub fn new(
        created_by: Option<String>,
        style: Option<String>,
        quality: Option<String>,
        datasets: Vec<DatasetRef>,
        options: Map<String, Value>,
    ) -> Self {
        let now = now_ms();
        Self {
            cube_id: format!("cube-{}", Uuid::new_v4()),
            created: now,
            timestamp: now,
            created_by,
            style: style.unwrap_or_else(|| DEFAULT_CUBE_STYLE.to_string()),
            quality: quality.unwrap_or_else(|| DEFAULT_CUBE_QUALITY.to_string()),
            datasets,
            masks: Vec::new(),
            options,
        }
    }

    /// Append datasets, stamping their last-modified and the cube's.
    pub fn append_datasets(&mut self, mut refs: Vec<DatasetRef>) {
        let now = now_ms();
        for r in &mut refs {
            r.last_modified = Some(now);
        }
        self.datasets.extend(refs);
        self.timestamp = now;
    }

    /// Remove datasets by id. Absent ids are ignored.
    pub fn remove_datasets(&mut self, ids: &[String]) {
        self.datasets.retain(|d| !ids.contains(&d.id));
        self.timestamp = now_ms();
    }

    /// Replace datasets per time bucket: an incoming ref overwrites the
    /// first existing ref whose timestamp falls in the same bucket
    /// (day granularity unless the incoming ref says otherwise), and is
    /// appended otherwise. The collection is re-sorted by timestamp
    /// ascending afterwards.
    pub fn replace_datasets(&mut self, refs: Vec<DatasetRef>) {
        let now = now_ms();

        for mut incoming in refs {
            let granularity = incoming.granularity.unwrap_or_default();
            incoming.last_modified = Some(now);

            let existing = self
                .datasets
                .iter_mut()
                .find(|d| granularity.same_bucket(d.timestamp, incoming.timestamp));

            match existing {
                Some(slot) => *slot = incoming,
                None => self.datasets.push(incoming),
            }
        }

        self.datasets.sort_by_key(|d| d.timestamp);
        self.timestamp = now;
    }

    /// Shallow-merge supplied top-level fields over this record. Nested
    /// objects are replaced wholesale. Any access credential field is
    /// stripped before merging, and the last-modified timestamp is stamped.
    pub fn merge_update(&self, fields: &Map<String, Value>) -> TileResult<Cube> {
        let mut value = serde_json::to_value(self)?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| TileError::Internal("Cube did not serialize to an object".into()))?;

        for (key, field) in fields {
            if key == "access_token" || key == "cube_id" {
                continue;
            }
            object.insert(key.clone(), field.clone());
        }

        let mut updated: Cube = serde_json::from_value(value)
            .map_err(|e| TileError::Validation(format!("Invalid cube update: {}", e)))?;
        updated.timestamp = now_ms();
        Ok(updated)
    }

    /// The mask consulted for tile serving and queries.
    ///
    /// Only one stored mask is active; which slot is configurable and
    /// defaults to 0.
    pub fn active_mask(&self, active_index: usize) -> Option<&Mask> {
        self.masks.get(active_index)
    }

    /// Look a mask up by id.
    pub fn mask_by_id(&self, mask_id: &str) -> Option<&Mask> {
        self.masks.iter().find(|m| m.id == mask_id)
    }

    /// Cache-key fingerprint for the current style and last-modified time.
    pub fn style_fingerprint(&self) -> String {
        storage::style_fingerprint(&self.style, self.timestamp)
    }
}

/// CRUD over cube records in the key/value store.
pub struct CubeRegistry {
    kv: Arc<dyn KeyValueStore>,
}

impl CubeRegistry {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Persist a cube under its own id.
    pub async fn save(&self, cube: &Cube) -> TileResult<()> {
        set_json(self.kv.as_ref(), &cube.cube_id, cube).await
    }

    /// Fetch a cube; `NotFound` when no record exists.
    pub async fn get(&self, cube_id: &str) -> TileResult<Cube> {
        get_json(self.kv.as_ref(), cube_id)
            .await?
            .ok_or_else(|| TileError::NotFound(format!("No such cube: {}", cube_id)))
    }

    /// Create and persist a new cube.
    pub async fn create(
        &self,
        created_by: Option<String>,
        style: Option<String>,
        quality: Option<String>,
        datasets: Vec<DatasetRef>,
        options: Map<String, Value>,
    ) -> TileResult<Cube> {
        let cube = Cube::new(created_by, style, quality, datasets, options);
        self.save(&cube).await?;
        info!(cube_id = %cube.cube_id, "Created cube");
        Ok(cube)
    }

    /// Delete a cube; `NotFound` when no record exists.
    pub async fn delete(&self, cube_id: &str) -> TileResult<()> {
        // Existence check first so deletes of unknown cubes are reported.
        let _ = self.get(cube_id).await?;
        self.kv.delete(cube_id).await?;
        info!(cube_id = %cube_id, "Deleted cube");
        Ok(())
    }

    /// Append datasets to a cube.
    pub async fn add_datasets(&self, cube_id: &str, refs: Vec<DatasetRef>) -> TileResult<Cube> {
        if refs.is_empty() {
            return Err(TileError::Validation("Please provide some datasets.".into()));
        }
        let mut cube = self.get(cube_id).await?;
        cube.append_datasets(refs);
        self.save(&cube).await?;
        Ok(cube)
    }

    /// Remove datasets from a cube by id.
    pub async fn remove_datasets(&self, cube_id: &str, ids: Vec<String>) -> TileResult<Cube> {
        if ids.is_empty() {
            return Err(TileError::Validation(
                "Please provide some datasets to remove.".into(),
            ));
        }
        let mut cube = self.get(cube_id).await?;
        cube.remove_datasets(&ids);
        self.save(&cube).await?;
        Ok(cube)
    }

    /// Replace datasets per time bucket.
    pub async fn replace_datasets(&self, cube_id: &str, refs: Vec<DatasetRef>) -> TileResult<Cube> {
        if refs.is_empty() {
            return Err(TileError::Validation("Please provide some datasets.".into()));
        }
        let mut cube = self.get(cube_id).await?;
        cube.replace_datasets(refs);
        self.save(&cube).await?;
        Ok(cube)
    }

    /// Shallow-merge fields over a cube record.
    pub async fn update(&self, cube_id: &str, fields: &Map<String, Value>) -> TileResult<Cube> {
        let cube = self.get(cube_id).await?;
        let updated = cube.merge_update(fields)?;
        self.save(&updated).await?;
        Ok(updated)
    }

    /// Attach a mask at the active slot, overwriting whatever held it.
    pub async fn attach_mask(
        &self,
        cube_id: &str,
        mask: Mask,
        active_index: usize,
    ) -> TileResult<Cube> {
        let mut cube = self.get(cube_id).await?;

        if cube.masks.len() <= active_index {
            cube.masks.resize(active_index + 1, mask.clone());
        }
        cube.masks[active_index] = mask;
        cube.timestamp = now_ms();

        self.save(&cube).await?;
        Ok(cube)
    }

    /// Remove a mask by id. Absent ids are ignored.
    pub async fn remove_mask(&self, cube_id: &str, mask_id: &str) -> TileResult<Cube> {
        let mut cube = self.get(cube_id).await?;
        cube.masks.retain(|m| m.id != mask_id);
        cube.timestamp = now_ms();
        self.save(&cube).await?;
        Ok(cube)
    }

    /// Fetch a mask by id.
    pub async fn get_mask(&self, cube_id: &str, mask_id: &str) -> TileResult<Mask> {
        let cube = self.get(cube_id).await?;
        cube.mask_by_id(mask_id)
            .cloned()
            .ok_or_else(|| TileError::NotFound(format!("No such mask: {}", mask_id)))
    }

    /// Partial-field update of a mask found by id.
    pub async fn update_mask(
        &self,
        cube_id: &str,
        mask_id: &str,
        fields: &Map<String, Value>,
    ) -> TileResult<Mask> {
        let mut cube = self.get(cube_id).await?;

        let index = cube
            .masks
            .iter()
            .position(|m| m.id == mask_id)
            .ok_or_else(|| TileError::NotFound(format!("No such mask: {}", mask_id)))?;

        let updated = cube.masks[index].merge_update(fields)?;
        cube.masks[index] = updated.clone();
        cube.timestamp = now_ms();

        self.save(&cube).await?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dated_ref(id: &str, date: &str) -> DatasetRef {
        DatasetRef {
            id: id.to_string(),
            description: None,
            timestamp: date.parse().unwrap(),
            granularity: None,
            last_modified: None,
        }
    }

    #[test]
    fn test_granularity_buckets() {
        let a = Utc.with_ymd_and_hms(2016, 5, 20, 8, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2016, 5, 20, 23, 0, 0).unwrap();
        let c = Utc.with_ymd_and_hms(2016, 5, 21, 1, 0, 0).unwrap();

        assert!(Granularity::Day.same_bucket(a, b));
        assert!(!Granularity::Day.same_bucket(a, c));
        assert!(Granularity::Month.same_bucket(a, c));
        assert!(Granularity::Year.same_bucket(a, c));
    }

    #[test]
    fn test_cube_defaults() {
        let cube = Cube::new(Some("user-1".into()), None, None, Vec::new(), Map::new());
        assert!(cube.cube_id.starts_with("cube-"));
        assert_eq!(cube.style, DEFAULT_CUBE_STYLE);
        assert_eq!(cube.quality, DEFAULT_CUBE_QUALITY);
        assert!(cube.datasets.is_empty());
        assert_eq!(cube.created, cube.timestamp);
    }

    #[test]
    fn test_merge_update_strips_access_token() {
        let cube = Cube::new(None, None, None, Vec::new(), Map::new());

        let mut fields = Map::new();
        fields.insert("style".into(), Value::String("#layer {}".into()));
        fields.insert("access_token".into(), Value::String("pk.secret".into()));

        let updated = cube.merge_update(&fields).unwrap();
        assert_eq!(updated.style, "#layer {}");
        assert!(!updated.options.contains_key("access_token"));
        assert!(updated.timestamp >= cube.timestamp);
    }

    #[test]
    fn test_merge_update_replaces_nested_wholesale() {
        let mut options = Map::new();
        options.insert(
            "display".into(),
            serde_json::json!({"opacity": 1.0, "visible": true}),
        );
        let cube = Cube::new(None, None, None, Vec::new(), options);

        let mut fields = Map::new();
        fields.insert("display".into(), serde_json::json!({"opacity": 0.5}));

        let updated = cube.merge_update(&fields).unwrap();
        // Shallow merge: the nested object is replaced, not deep-merged.
        assert_eq!(updated.options["display"], serde_json::json!({"opacity": 0.5}));
    }

    #[test]
    fn test_replace_same_bucket_keeps_one_ref() {
        let mut cube = Cube::new(None, None, None, Vec::new(), Map::new());
        cube.append_datasets(vec![dated_ref("d1", "2016-05-20T08:00:00Z")]);

        cube.replace_datasets(vec![dated_ref("d2", "2016-05-20T15:30:00Z")]);
        assert_eq!(cube.datasets.len(), 1);
        assert_eq!(cube.datasets[0].id, "d2");

        // Replacing the same bucket twice leaves the latest payload.
        cube.replace_datasets(vec![dated_ref("d3", "2016-05-20T23:59:00Z")]);
        assert_eq!(cube.datasets.len(), 1);
        assert_eq!(cube.datasets[0].id, "d3");
    }

    #[test]
    fn test_replace_appends_and_sorts() {
        let mut cube = Cube::new(None, None, None, Vec::new(), Map::new());
        cube.append_datasets(vec![dated_ref("mid", "2016-05-20T00:00:00Z")]);

        cube.replace_datasets(vec![
            dated_ref("late", "2016-07-01T00:00:00Z"),
            dated_ref("early", "2016-01-01T00:00:00Z"),
        ]);

        let ids: Vec<&str> = cube.datasets.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "mid", "late"]);
    }

    #[test]
    fn test_fingerprint_rolls_with_mutation() {
        let mut cube = Cube::new(None, None, None, Vec::new(), Map::new());
        let before = cube.style_fingerprint();

        cube.timestamp += 1;
        assert_ne!(before, cube.style_fingerprint());
    }
}
