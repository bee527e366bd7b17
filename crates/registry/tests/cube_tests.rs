//! Registry behavior against an in-memory store.

use std::sync::Arc;

use registry::{Cube, CubeRegistry, DatasetRef, Mask, MaskKind};
use serde_json::{json, Map};
use storage::MemoryStore;
use tiles_common::TileError;

fn registry() -> CubeRegistry {
    CubeRegistry::new(Arc::new(MemoryStore::new()))
}

fn dated_ref(id: &str, date: &str) -> DatasetRef {
    DatasetRef {
        id: id.to_string(),
        description: None,
        timestamp: date.parse().unwrap(),
        granularity: None,
        last_modified: None,
    }
}

async fn empty_cube(registry: &CubeRegistry) -> Cube {
    registry
        .create(Some("user-1".into()), None, None, Vec::new(), Map::new())
        .await
        .unwrap()
}

// ============================================================================
// Dataset membership
// ============================================================================

#[tokio::test]
async fn test_add_then_remove_dataset() {
    let registry = registry();
    let cube = empty_cube(&registry).await;

    let updated = registry
        .add_datasets(&cube.cube_id, vec![dated_ref("d1", "2016-05-20T11:33:20Z")])
        .await
        .unwrap();
    assert_eq!(updated.datasets.len(), 1);
    assert_eq!(updated.datasets[0].id, "d1");
    assert!(updated.datasets[0].last_modified.is_some());

    let updated = registry
        .remove_datasets(&cube.cube_id, vec!["d1".into()])
        .await
        .unwrap();
    assert!(updated.datasets.is_empty());
}

#[tokio::test]
async fn test_remove_unknown_dataset_is_idempotent() {
    let registry = registry();
    let cube = empty_cube(&registry).await;

    let updated = registry
        .remove_datasets(&cube.cube_id, vec!["never-added".into()])
        .await
        .unwrap();
    assert!(updated.datasets.is_empty());
}

#[tokio::test]
async fn test_add_empty_dataset_list_rejected() {
    let registry = registry();
    let cube = empty_cube(&registry).await;

    let err = registry
        .add_datasets(&cube.cube_id, Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TileError::Validation(_)));
}

#[tokio::test]
async fn test_replace_is_idempotent_per_bucket() {
    let registry = registry();
    let cube = empty_cube(&registry).await;

    registry
        .replace_datasets(&cube.cube_id, vec![dated_ref("a", "2016-05-20T08:00:00Z")])
        .await
        .unwrap();
    registry
        .replace_datasets(&cube.cube_id, vec![dated_ref("b", "2016-05-20T20:00:00Z")])
        .await
        .unwrap();

    let stored = registry.get(&cube.cube_id).await.unwrap();
    assert_eq!(stored.datasets.len(), 1);
    assert_eq!(stored.datasets[0].id, "b");

    // Refs stay sorted by timestamp after mixing buckets.
    registry
        .replace_datasets(
            &cube.cube_id,
            vec![
                dated_ref("late", "2016-08-01T00:00:00Z"),
                dated_ref("early", "2016-01-01T00:00:00Z"),
            ],
        )
        .await
        .unwrap();

    let stored = registry.get(&cube.cube_id).await.unwrap();
    let ids: Vec<&str> = stored.datasets.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["early", "b", "late"]);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_get_missing_cube_is_not_found() {
    let registry = registry();
    let err = registry.get("cube-missing").await.unwrap_err();
    assert!(matches!(err, TileError::NotFound(_)));
}

#[tokio::test]
async fn test_delete_cube() {
    let registry = registry();
    let cube = empty_cube(&registry).await;

    registry.delete(&cube.cube_id).await.unwrap();
    assert!(registry.get(&cube.cube_id).await.is_err());

    // Deleting twice reports the missing record.
    let err = registry.delete(&cube.cube_id).await.unwrap_err();
    assert!(matches!(err, TileError::NotFound(_)));
}

#[tokio::test]
async fn test_update_stamps_and_merges() {
    let registry = registry();
    let cube = empty_cube(&registry).await;
    let before = cube.timestamp;

    let mut fields = Map::new();
    fields.insert("style".into(), json!("#layer { raster-opacity: 0.4; }"));
    fields.insert("custom_flag".into(), json!(true));

    let updated = registry.update(&cube.cube_id, &fields).await.unwrap();
    assert_eq!(updated.style, "#layer { raster-opacity: 0.4; }");
    assert_eq!(updated.options["custom_flag"], json!(true));
    assert!(updated.timestamp >= before);
}

// ============================================================================
// Masks
// ============================================================================

#[tokio::test]
async fn test_mask_roundtrip_preserves_type_and_geometry() {
    let registry = registry();
    let cube = empty_cube(&registry).await;

    let geometry = json!({
        "type": "Polygon",
        "coordinates": [[[10.0, 60.0], [11.0, 60.0], [11.0, 61.0], [10.0, 60.0]]]
    });
    let mask = Mask::with_fresh_id(MaskKind::Geojson {
        geometry: geometry.clone(),
        meta: None,
        data: None,
    });
    let mask_id = mask.id.clone();

    registry.attach_mask(&cube.cube_id, mask, 0).await.unwrap();

    let stored = registry.get_mask(&cube.cube_id, &mask_id).await.unwrap();
    match stored.kind {
        MaskKind::Geojson { geometry: g, .. } => assert_eq!(g, geometry),
        other => panic!("unexpected mask kind: {:?}", other),
    }
}

#[tokio::test]
async fn test_attach_mask_overwrites_active_slot() {
    let registry = registry();
    let cube = empty_cube(&registry).await;

    let first = Mask::with_fresh_id(MaskKind::PostgisRaster {
        dataset_id: "file_aaaaaaaaaaaaaaaaaaaa".into(),
        layer_id: None,
        title: None,
        description: None,
    });
    let second = Mask::with_fresh_id(MaskKind::PostgisRaster {
        dataset_id: "file_bbbbbbbbbbbbbbbbbbbb".into(),
        layer_id: None,
        title: None,
        description: None,
    });
    let second_id = second.id.clone();

    registry.attach_mask(&cube.cube_id, first, 0).await.unwrap();
    let updated = registry.attach_mask(&cube.cube_id, second, 0).await.unwrap();

    assert_eq!(updated.masks.len(), 1);
    assert_eq!(updated.masks[0].id, second_id);
}

#[tokio::test]
async fn test_unmask_and_missing_mask() {
    let registry = registry();
    let cube = empty_cube(&registry).await;

    let mask = Mask::with_fresh_id(MaskKind::Topojson {
        geometry: json!({"type": "Topology", "objects": {}, "arcs": []}),
        meta: None,
        data: None,
    });
    let mask_id = mask.id.clone();

    registry.attach_mask(&cube.cube_id, mask, 0).await.unwrap();
    let updated = registry.remove_mask(&cube.cube_id, &mask_id).await.unwrap();
    assert!(updated.masks.is_empty());

    let err = registry.get_mask(&cube.cube_id, &mask_id).await.unwrap_err();
    assert!(matches!(err, TileError::NotFound(_)));
}

#[tokio::test]
async fn test_update_mask_merges_fields() {
    let registry = registry();
    let cube = empty_cube(&registry).await;

    let mask = Mask::with_fresh_id(MaskKind::Geojson {
        geometry: json!({"type": "Point", "coordinates": [0.0, 0.0]}),
        meta: None,
        data: None,
    });
    let mask_id = mask.id.clone();
    registry.attach_mask(&cube.cube_id, mask, 0).await.unwrap();

    let mut fields = Map::new();
    fields.insert("meta".into(), json!({"title": "updated"}));

    let updated = registry
        .update_mask(&cube.cube_id, &mask_id, &fields)
        .await
        .unwrap();
    match updated.kind {
        MaskKind::Geojson { meta, .. } => assert_eq!(meta, Some(json!({"title": "updated"}))),
        other => panic!("unexpected mask kind: {:?}", other),
    }
}

// ============================================================================
// Cache coherence
// ============================================================================

#[tokio::test]
async fn test_style_update_rolls_fingerprint() {
    let registry = registry();
    let cube = empty_cube(&registry).await;
    let before = registry.get(&cube.cube_id).await.unwrap().style_fingerprint();

    let mut fields = Map::new();
    fields.insert("style".into(), json!("#layer { raster-opacity: 0.1; }"));
    registry.update(&cube.cube_id, &fields).await.unwrap();

    let after = registry.get(&cube.cube_id).await.unwrap().style_fingerprint();
    assert_ne!(before, after);
}
