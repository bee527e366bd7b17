//! Web Mercator tile math for the XYZ (slippy map) scheme.
//!
//! All tiles are served in EPSG:3857. Extent checks project dataset and
//! mask extents (stored in EPSG:4326) into the same frame before comparing
//! against a tile's envelope.

use crate::{BoundingBox, TileCoord};

/// Equatorial radius, WGS84.
const EARTH_RADIUS: f64 = 6_378_137.0;

/// Half the circumference of the Web Mercator plane.
pub const MERCATOR_EXTENT: f64 = 20_037_508.342789244;

/// Compute the EPSG:3857 envelope of an XYZ tile.
pub fn tile_to_envelope(coord: &TileCoord) -> BoundingBox {
    let n = (1u64 << coord.z) as f64;
    let span = 2.0 * MERCATOR_EXTENT / n;

    let min_x = -MERCATOR_EXTENT + coord.x as f64 * span;
    let max_y = MERCATOR_EXTENT - coord.y as f64 * span;

    BoundingBox::new(min_x, max_y - span, min_x + span, max_y)
}

/// Longitude to tile column at a zoom level, floored.
pub fn lon_to_tile_x(lon: f64, zoom: u32) -> u32 {
    let n = (1u64 << zoom) as f64;
    let x = ((lon + 180.0) / 360.0 * n).floor();
    x.clamp(0.0, n - 1.0) as u32
}

/// Latitude to tile row at a zoom level, floored.
pub fn lat_to_tile_y(lat: f64, zoom: u32) -> u32 {
    let n = (1u64 << zoom) as f64;
    let rad = lat.to_radians();
    let y = ((1.0 - (rad.tan() + 1.0 / rad.cos()).ln() / std::f64::consts::PI) / 2.0 * n).floor();
    y.clamp(0.0, n - 1.0) as u32
}

/// Project a lon/lat point to Web Mercator meters.
///
/// Latitudes are clamped to ±89.5° before projection; the formula
/// diverges at the poles.
pub fn lonlat_to_meters(lon: f64, lat: f64) -> (f64, f64) {
    let lat = lat.clamp(-89.5, 89.5);
    let x = EARTH_RADIUS * lon.to_radians();
    let y = EARTH_RADIUS * ((std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0).tan()).ln();
    (x, y)
}

/// Project a geographic bounding box into Web Mercator.
pub fn bbox_to_meters(bbox: &BoundingBox) -> BoundingBox {
    let (min_x, min_y) = lonlat_to_meters(bbox.min_x, bbox.min_y);
    let (max_x, max_y) = lonlat_to_meters(bbox.max_x, bbox.max_y);
    BoundingBox::new(min_x, min_y, max_x, max_y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zoom_zero_envelope_covers_world() {
        let bbox = tile_to_envelope(&TileCoord::new(0, 0, 0));
        assert!((bbox.min_x - -MERCATOR_EXTENT).abs() < 1e-6);
        assert!((bbox.max_x - MERCATOR_EXTENT).abs() < 1e-6);
        assert!((bbox.min_y - -MERCATOR_EXTENT).abs() < 1e-6);
        assert!((bbox.max_y - MERCATOR_EXTENT).abs() < 1e-6);
    }

    #[test]
    fn test_tile_envelope_quadrants() {
        // Tile (1, 1, 0) is the north-east quadrant.
        let bbox = tile_to_envelope(&TileCoord::new(1, 1, 0));
        assert!((bbox.min_x - 0.0).abs() < 1e-6);
        assert!((bbox.min_y - 0.0).abs() < 1e-6);
        assert!((bbox.max_x - MERCATOR_EXTENT).abs() < 1e-6);
        assert!((bbox.max_y - MERCATOR_EXTENT).abs() < 1e-6);
    }

    #[test]
    fn test_lon_to_tile_x() {
        assert_eq!(lon_to_tile_x(-180.0, 1), 0);
        assert_eq!(lon_to_tile_x(0.0, 1), 1);
        assert_eq!(lon_to_tile_x(10.5, 8), ((10.5 + 180.0) / 360.0 * 256.0) as u32);
        // Right edge stays within range.
        assert_eq!(lon_to_tile_x(180.0, 1), 1);
    }

    #[test]
    fn test_lat_to_tile_y() {
        // The equator is the boundary between rows at zoom 1.
        assert_eq!(lat_to_tile_y(0.1, 1), 0);
        assert_eq!(lat_to_tile_y(-0.1, 1), 1);
        // Oslo lands in the expected zoom-6 row.
        assert_eq!(lat_to_tile_y(59.91, 6), 18);
    }

    #[test]
    fn test_lonlat_to_meters_origin() {
        let (x, y) = lonlat_to_meters(0.0, 0.0);
        assert!(x.abs() < 1e-6);
        assert!(y.abs() < 1e-6);
    }

    #[test]
    fn test_lonlat_to_meters_clamps_poles() {
        let (_, y_north) = lonlat_to_meters(0.0, 90.0);
        let (_, y_clamped) = lonlat_to_meters(0.0, 89.5);
        assert_eq!(y_north, y_clamped);
    }

    #[test]
    fn test_roundtrip_tile_envelope_vs_indices() {
        // The envelope of the tile containing a point must contain the
        // projected point.
        let (lon, lat) = (10.75, 59.91);
        let zoom = 10;
        let coord = TileCoord::new(zoom, lon_to_tile_x(lon, zoom), lat_to_tile_y(lat, zoom));
        let envelope = tile_to_envelope(&coord);
        let (x, y) = lonlat_to_meters(lon, lat);
        assert!(envelope.contains_point(x, y));
    }
}
