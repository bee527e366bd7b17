//! Geographic masks attached to cubes.
//!
//! A mask restricts which area of a cube's datasets is rendered or queried.
//! Four kinds exist; vector masks sourced from an upstream dataset are
//! converted to a topology at attach time, so that is what ends up stored.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use tiles_common::geo::{geometry_bbox, primary_geometry_json};
use tiles_common::{BoundingBox, TileError, TileResult};

/// A stored mask: identity plus kind-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mask {
    pub id: String,
    #[serde(flatten)]
    pub kind: MaskKind,
}

/// Kind-specific mask payload, discriminated by the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MaskKind {
    /// Raw GeoJSON geometry supplied by the client.
    Geojson {
        geometry: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    /// TopoJSON topology, either supplied directly or converted from an
    /// upstream vector dataset.
    Topojson {
        geometry: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    /// Reference to an upstream vector dataset. Only appears as attach
    /// input; the attach pipeline resolves it into a `Topojson` mask.
    PostgisVector { dataset_id: String },
    /// Reference to a raster dataset whose pixels act as the mask.
    PostgisRaster {
        dataset_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        layer_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

/// Property field holding the feature id when converting vector datasets.
pub const FEATURE_ID_PROPERTY: &str = "ID";

impl Mask {
    /// Wrap a kind into a stored mask with a fresh random id.
    pub fn with_fresh_id(kind: MaskKind) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            id: format!("mask-{}", &suffix[..8]),
            kind,
        }
    }

    /// Geographic extent of the mask geometry, when it carries one.
    ///
    /// Postgis-backed masks have no materialized geometry; their extent is
    /// resolved through the referenced dataset's metadata instead.
    pub fn geometry_extent(&self) -> Option<BoundingBox> {
        match &self.kind {
            MaskKind::Geojson { geometry, .. } | MaskKind::Topojson { geometry, .. } => {
                geometry_bbox(geometry)
            }
            MaskKind::PostgisVector { .. } | MaskKind::PostgisRaster { .. } => None,
        }
    }

    /// GeoJSON geometry string for spatial clipping, when extractable.
    pub fn filter_geometry_json(&self) -> Option<String> {
        match &self.kind {
            MaskKind::Geojson { geometry, .. } => primary_geometry_json(geometry),
            MaskKind::Topojson { .. }
            | MaskKind::PostgisVector { .. }
            | MaskKind::PostgisRaster { .. } => None,
        }
    }

    /// Raster table reference for histogram joins, for raster-backed masks.
    pub fn raster_dataset_id(&self) -> Option<&str> {
        match &self.kind {
            MaskKind::PostgisRaster { dataset_id, .. } => Some(dataset_id),
            _ => None,
        }
    }

    /// Apply a partial-field update: supplied fields overwrite, everything
    /// else is kept. The id cannot be changed.
    pub fn merge_update(&self, fields: &Map<String, Value>) -> TileResult<Mask> {
        let mut value = serde_json::to_value(self)?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| TileError::Internal("Mask did not serialize to an object".into()))?;

        for (key, field) in fields {
            if key == "id" {
                continue;
            }
            object.insert(key.clone(), field.clone());
        }

        serde_json::from_value(value)
            .map_err(|e| TileError::Validation(format!("Invalid mask update: {}", e)))
    }
}

/// Validate the shape of an upstream dataset id referenced by a mask.
pub fn validate_mask_dataset_id(dataset_id: &str) -> TileResult<()> {
    let len = dataset_id.len();
    if !(20..=30).contains(&len) {
        return Err(TileError::Validation("Invalid dataset_id".into()));
    }
    Ok(())
}

/// Convert a GeoJSON FeatureCollection into a TopoJSON topology.
///
/// Produces a non-quantized topology with one arc per ring: geometries under
/// `objects.collection` reference arcs by index, feature ids are read from
/// the named property. Shared-boundary deduplication is not performed —
/// consumers here only walk arcs for extents and look features up by id.
pub fn topology_from_collection(collection: &Value, id_property: &str) -> TileResult<Value> {
    let features = collection
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| TileError::Validation("Invalid GeoJSON".into()))?;

    let mut arcs: Vec<Value> = Vec::new();
    let mut geometries: Vec<Value> = Vec::new();

    for feature in features {
        let Some(geometry) = feature.get("geometry") else {
            continue;
        };
        let Some(converted) = convert_geometry(geometry, &mut arcs) else {
            continue;
        };

        let mut object = converted;
        if let Value::Object(map) = &mut object {
            if let Some(id) = feature
                .get("properties")
                .and_then(|p| p.get(id_property))
                .cloned()
            {
                map.insert("id".to_string(), id);
            }
            if let Some(properties) = feature.get("properties").cloned() {
                map.insert("properties".to_string(), properties);
            }
        }

        geometries.push(object);
    }

    Ok(serde_json::json!({
        "type": "Topology",
        "objects": {
            "collection": {
                "type": "GeometryCollection",
                "geometries": geometries,
            }
        },
        "arcs": arcs,
    }))
}

/// Convert one GeoJSON geometry, appending its rings/lines to `arcs`.
fn convert_geometry(geometry: &Value, arcs: &mut Vec<Value>) -> Option<Value> {
    let kind = geometry.get("type")?.as_str()?;
    let coords = geometry.get("coordinates");

    let mut push_arc = |ring: &Value| -> Value {
        arcs.push(ring.clone());
        Value::from(arcs.len() - 1)
    };

    match kind {
        "Point" | "MultiPoint" => Some(serde_json::json!({
            "type": kind,
            "coordinates": coords?.clone(),
        })),
        "LineString" => {
            let arc = push_arc(coords?);
            Some(serde_json::json!({ "type": "LineString", "arcs": [arc] }))
        }
        "MultiLineString" => {
            let lines: Vec<Value> = coords?
                .as_array()?
                .iter()
                .map(|line| Value::Array(vec![push_arc(line)]))
                .collect();
            Some(serde_json::json!({ "type": "MultiLineString", "arcs": lines }))
        }
        "Polygon" => {
            let rings: Vec<Value> = coords?
                .as_array()?
                .iter()
                .map(|ring| Value::Array(vec![push_arc(ring)]))
                .collect();
            Some(serde_json::json!({ "type": "Polygon", "arcs": rings }))
        }
        "MultiPolygon" => {
            let polygons: Vec<Value> = coords?
                .as_array()?
                .iter()
                .filter_map(|polygon| {
                    let rings: Vec<Value> = polygon
                        .as_array()?
                        .iter()
                        .map(|ring| Value::Array(vec![push_arc(ring)]))
                        .collect();
                    Some(Value::Array(rings))
                })
                .collect();
            Some(serde_json::json!({ "type": "MultiPolygon", "arcs": polygons }))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn square_feature(id: u32) -> Value {
        json!({
            "type": "Feature",
            "properties": { "ID": id },
            "geometry": {
                "type": "Polygon",
                "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0], [0.0, 0.0]]]
            }
        })
    }

    #[test]
    fn test_geojson_mask_serde_roundtrip() {
        let mask = Mask {
            id: "mask-abc123".into(),
            kind: MaskKind::Geojson {
                geometry: json!({"type": "Point", "coordinates": [1.0, 2.0]}),
                meta: Some(json!({"name": "test"})),
                data: None,
            },
        };

        let raw = serde_json::to_string(&mask).unwrap();
        assert!(raw.contains("\"type\":\"geojson\""));

        let parsed: Mask = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, mask);
    }

    #[test]
    fn test_postgis_raster_mask_serde() {
        let raw = json!({
            "id": "mask-x",
            "type": "postgis-raster",
            "dataset_id": "file_abcdefghijklmnopqrst",
            "title": "lake mask"
        });
        let mask: Mask = serde_json::from_value(raw).unwrap();
        assert_eq!(mask.raster_dataset_id(), Some("file_abcdefghijklmnopqrst"));
        assert!(mask.geometry_extent().is_none());
    }

    #[test]
    fn test_unknown_mask_type_rejected() {
        let raw = json!({ "id": "mask-x", "type": "wkt", "geometry": "POINT(0 0)" });
        assert!(serde_json::from_value::<Mask>(raw).is_err());
    }

    #[test]
    fn test_dataset_id_validation() {
        assert!(validate_mask_dataset_id("file_abcdefghijklmnop").is_ok());
        assert!(validate_mask_dataset_id("short").is_err());
        assert!(validate_mask_dataset_id(&"x".repeat(31)).is_err());
    }

    #[test]
    fn test_topology_from_collection() {
        let collection = json!({
            "type": "FeatureCollection",
            "features": [square_feature(7), square_feature(9)]
        });

        let topology = topology_from_collection(&collection, FEATURE_ID_PROPERTY).unwrap();
        assert_eq!(topology["type"], "Topology");
        assert_eq!(topology["arcs"].as_array().unwrap().len(), 2);

        let geometries = topology["objects"]["collection"]["geometries"]
            .as_array()
            .unwrap();
        assert_eq!(geometries.len(), 2);
        assert_eq!(geometries[0]["id"], 7);
        assert_eq!(geometries[1]["id"], 9);

        // The topology is consumable by the extent walker.
        let mask = Mask {
            id: "mask-t".into(),
            kind: MaskKind::Topojson {
                geometry: topology,
                meta: None,
                data: None,
            },
        };
        let bbox = mask.geometry_extent().unwrap();
        assert_eq!(bbox.min_x, 0.0);
        assert_eq!(bbox.max_x, 1.0);
    }

    #[test]
    fn test_merge_update_keeps_unlisted_fields() {
        let mask = Mask {
            id: "mask-abc".into(),
            kind: MaskKind::Geojson {
                geometry: json!({"type": "Point", "coordinates": [0.0, 0.0]}),
                meta: Some(json!({"name": "before"})),
                data: Some(json!([1, 2, 3])),
            },
        };

        let mut fields = Map::new();
        fields.insert("meta".into(), json!({"name": "after"}));
        fields.insert("id".into(), json!("mask-evil"));

        let updated = mask.merge_update(&fields).unwrap();
        assert_eq!(updated.id, "mask-abc");
        match updated.kind {
            MaskKind::Geojson { meta, data, .. } => {
                assert_eq!(meta, Some(json!({"name": "after"})));
                assert_eq!(data, Some(json!([1, 2, 3])));
            }
            _ => panic!("kind changed"),
        }
    }
}
