//! Tests for bounding box overlap and tile envelope behavior.

use tiles_common::mercator::{bbox_to_meters, lat_to_tile_y, lon_to_tile_x, tile_to_envelope};
use tiles_common::{BoundingBox, TileCoord};

// ============================================================================
// Overlap tests
// ============================================================================

#[test]
fn test_disjoint_north() {
    let tile = BoundingBox::new(0.0, 20.0, 10.0, 30.0);
    let data = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
    assert!(!tile.overlaps(&data));
}

#[test]
fn test_disjoint_east() {
    let tile = BoundingBox::new(20.0, 0.0, 30.0, 10.0);
    let data = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
    assert!(!tile.overlaps(&data));
}

#[test]
fn test_disjoint_south() {
    let tile = BoundingBox::new(0.0, -30.0, 10.0, -20.0);
    let data = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
    assert!(!tile.overlaps(&data));
}

#[test]
fn test_disjoint_west() {
    let tile = BoundingBox::new(-30.0, 0.0, -20.0, 10.0);
    let data = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
    assert!(!tile.overlaps(&data));
}

#[test]
fn test_contained_overlaps() {
    let outer = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
    let inner = BoundingBox::new(40.0, 40.0, 60.0, 60.0);
    assert!(outer.overlaps(&inner));
    assert!(inner.overlaps(&outer));
}

// ============================================================================
// Tile envelope against projected extents
// ============================================================================

#[test]
fn test_tile_outside_projected_extent() {
    // A Scandinavian extent against a tile over South America.
    let extent = bbox_to_meters(&BoundingBox::new(4.0, 57.0, 31.0, 71.0));

    let z = 6;
    let x = lon_to_tile_x(-60.0, z);
    let y = lat_to_tile_y(-10.0, z);
    let tile_env = tile_to_envelope(&TileCoord::new(z, x, y));

    assert!(!tile_env.overlaps(&extent));
}

#[test]
fn test_tile_inside_projected_extent() {
    let extent = bbox_to_meters(&BoundingBox::new(4.0, 57.0, 31.0, 71.0));

    let z = 6;
    let x = lon_to_tile_x(10.7, z);
    let y = lat_to_tile_y(59.9, z);
    let tile_env = tile_to_envelope(&TileCoord::new(z, x, y));

    assert!(tile_env.overlaps(&extent));
}

// ============================================================================
// Degenerate extents
// ============================================================================

#[test]
fn test_degenerate_extent_detected_after_projection() {
    let point = bbox_to_meters(&BoundingBox::new(10.0, 60.0, 10.0, 60.0));
    assert!(point.is_degenerate());
}
