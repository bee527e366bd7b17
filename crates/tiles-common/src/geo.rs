//! Extent and geometry helpers for GeoJSON and TopoJSON documents.
//!
//! Masks and dataset extents arrive as untyped JSON; these helpers walk the
//! coordinate structure directly instead of round-tripping through a typed
//! geometry model.

use crate::BoundingBox;
use serde_json::Value;

/// Compute the geographic bounding box of a GeoJSON or TopoJSON document.
///
/// Accepts bare geometries, Features, FeatureCollections, GeometryCollections
/// and Topology documents (quantized or not). Returns `None` when the value
/// holds no positions.
pub fn geometry_bbox(value: &Value) -> Option<BoundingBox> {
    let mut acc = BboxAccumulator::new();

    match value.get("type").and_then(Value::as_str) {
        Some("FeatureCollection") => {
            for feature in value.get("features")?.as_array()? {
                if let Some(geom) = feature.get("geometry") {
                    accumulate_geometry(geom, &mut acc);
                }
            }
        }
        Some("Feature") => accumulate_geometry(value.get("geometry")?, &mut acc),
        Some("Topology") => accumulate_topology(value, &mut acc)?,
        Some(_) => accumulate_geometry(value, &mut acc),
        None => return None,
    }

    acc.finish()
}

/// Extract the primary geometry of a GeoJSON document as a JSON string,
/// suitable for embedding in a spatial query.
///
/// FeatureCollections yield their first feature's geometry, Features their
/// own geometry, bare geometries themselves.
pub fn primary_geometry_json(value: &Value) -> Option<String> {
    match value.get("type").and_then(Value::as_str)? {
        "FeatureCollection" => {
            let geom = value.get("features")?.as_array()?.first()?.get("geometry")?;
            serde_json::to_string(geom).ok()
        }
        "Feature" => serde_json::to_string(value.get("geometry")?).ok(),
        "Topology" => None,
        _ => serde_json::to_string(value).ok(),
    }
}

/// Wrap a bare geometry into a single-feature FeatureCollection.
pub fn feature_collection_from_geometry(geometry: Value) -> Value {
    serde_json::json!({
        "type": "FeatureCollection",
        "features": [{
            "type": "Feature",
            "properties": {},
            "geometry": geometry,
        }]
    })
}

struct BboxAccumulator {
    bbox: Option<BoundingBox>,
}

impl BboxAccumulator {
    fn new() -> Self {
        Self { bbox: None }
    }

    fn push(&mut self, x: f64, y: f64) {
        match &mut self.bbox {
            Some(bbox) => bbox.extend(&BoundingBox::new(x, y, x, y)),
            None => self.bbox = Some(BoundingBox::new(x, y, x, y)),
        }
    }

    fn finish(self) -> Option<BoundingBox> {
        self.bbox
    }
}

fn accumulate_geometry(geometry: &Value, acc: &mut BboxAccumulator) {
    if let Some("GeometryCollection") = geometry.get("type").and_then(Value::as_str) {
        if let Some(geometries) = geometry.get("geometries").and_then(Value::as_array) {
            for g in geometries {
                accumulate_geometry(g, acc);
            }
        }
        return;
    }

    if let Some(coords) = geometry.get("coordinates") {
        accumulate_positions(coords, acc);
    }
}

/// Walk arbitrarily nested coordinate arrays; a leaf is any array whose
/// first element is a number.
fn accumulate_positions(coords: &Value, acc: &mut BboxAccumulator) {
    let Some(array) = coords.as_array() else {
        return;
    };

    match array.first() {
        Some(Value::Number(_)) => {
            if let (Some(x), Some(y)) = (
                array.first().and_then(Value::as_f64),
                array.get(1).and_then(Value::as_f64),
            ) {
                acc.push(x, y);
            }
        }
        Some(_) => {
            for nested in array {
                accumulate_positions(nested, acc);
            }
        }
        None => {}
    }
}

/// Walk the arcs of a Topology, applying the quantization transform when
/// present (arc positions are delta-encoded under a transform).
fn accumulate_topology(topology: &Value, acc: &mut BboxAccumulator) -> Option<()> {
    let arcs = topology.get("arcs")?.as_array()?;

    let transform = topology.get("transform");
    let scale = transform
        .and_then(|t| t.get("scale"))
        .and_then(Value::as_array)
        .and_then(|s| Some((s.first()?.as_f64()?, s.get(1)?.as_f64()?)));
    let translate = transform
        .and_then(|t| t.get("translate"))
        .and_then(Value::as_array)
        .and_then(|t| Some((t.first()?.as_f64()?, t.get(1)?.as_f64()?)));

    for arc in arcs {
        let Some(positions) = arc.as_array() else {
            continue;
        };

        match (scale, translate) {
            (Some((sx, sy)), Some((tx, ty))) => {
                let mut cx = 0.0;
                let mut cy = 0.0;
                for pos in positions {
                    if let (Some(dx), Some(dy)) = (
                        pos.get(0).and_then(Value::as_f64),
                        pos.get(1).and_then(Value::as_f64),
                    ) {
                        cx += dx;
                        cy += dy;
                        acc.push(cx * sx + tx, cy * sy + ty);
                    }
                }
            }
            _ => {
                for pos in positions {
                    if let (Some(x), Some(y)) = (
                        pos.get(0).and_then(Value::as_f64),
                        pos.get(1).and_then(Value::as_f64),
                    ) {
                        acc.push(x, y);
                    }
                }
            }
        }
    }

    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_polygon_bbox() {
        let geom = json!({
            "type": "Polygon",
            "coordinates": [[[10.0, 60.0], [11.0, 60.0], [11.0, 61.0], [10.0, 61.0], [10.0, 60.0]]]
        });
        let bbox = geometry_bbox(&geom).unwrap();
        assert_eq!(bbox.min_x, 10.0);
        assert_eq!(bbox.max_y, 61.0);
    }

    #[test]
    fn test_feature_collection_bbox() {
        let fc = json!({
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "geometry": {"type": "Point", "coordinates": [5.0, 58.0]}},
                {"type": "Feature", "geometry": {"type": "Point", "coordinates": [7.0, 63.0]}}
            ]
        });
        let bbox = geometry_bbox(&fc).unwrap();
        assert_eq!(bbox.min_x, 5.0);
        assert_eq!(bbox.max_x, 7.0);
        assert_eq!(bbox.min_y, 58.0);
        assert_eq!(bbox.max_y, 63.0);
    }

    #[test]
    fn test_topology_bbox_unquantized() {
        let topo = json!({
            "type": "Topology",
            "objects": {},
            "arcs": [[[10.0, 60.0], [11.0, 60.5]], [[12.0, 59.0]]]
        });
        let bbox = geometry_bbox(&topo).unwrap();
        assert_eq!(bbox.min_x, 10.0);
        assert_eq!(bbox.max_x, 12.0);
        assert_eq!(bbox.min_y, 59.0);
    }

    #[test]
    fn test_topology_bbox_quantized() {
        // Deltas under a transform: positions are (cumulative * scale + translate).
        let topo = json!({
            "type": "Topology",
            "transform": {"scale": [0.5, 0.5], "translate": [100.0, 10.0]},
            "objects": {},
            "arcs": [[[0, 0], [2, 4]]]
        });
        let bbox = geometry_bbox(&topo).unwrap();
        assert_eq!(bbox.min_x, 100.0);
        assert_eq!(bbox.min_y, 10.0);
        assert_eq!(bbox.max_x, 101.0);
        assert_eq!(bbox.max_y, 12.0);
    }

    #[test]
    fn test_primary_geometry_from_feature_collection() {
        let fc = json!({
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "geometry": {"type": "Point", "coordinates": [1.0, 2.0]}}
            ]
        });
        let geom = primary_geometry_json(&fc).unwrap();
        assert!(geom.contains("\"Point\""));
    }

    #[test]
    fn test_primary_geometry_rejects_topology() {
        let topo = json!({"type": "Topology", "objects": {}, "arcs": []});
        assert!(primary_geometry_json(&topo).is_none());
    }

    #[test]
    fn test_empty_geometry_has_no_bbox() {
        let geom = json!({"type": "MultiPolygon", "coordinates": []});
        assert!(geometry_bbox(&geom).is_none());
    }
}
