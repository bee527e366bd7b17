//! Tile coordinates and output formats.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A tile coordinate (z/x/y) in the XYZ scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    /// Zoom level
    pub z: u32,
    /// Column (x)
    pub x: u32,
    /// Row (y)
    pub y: u32,
}

impl TileCoord {
    pub fn new(z: u32, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Output format of a served tile, taken from the request path extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileFormat {
    /// Raster tile (PNG image)
    Png,
    /// Vector tile (Mapbox protobuf)
    Pbf,
    /// Interactivity grid (UTFGrid JSON)
    Grid,
}

impl TileFormat {
    /// HTTP content type for responses carrying this format.
    pub fn content_type(&self) -> &'static str {
        match self {
            TileFormat::Png => "image/png",
            TileFormat::Pbf => "application/x-protobuf",
            TileFormat::Grid => "application/json",
        }
    }

    /// File extension used in request paths and cache keys.
    pub fn extension(&self) -> &'static str {
        match self {
            TileFormat::Png => "png",
            TileFormat::Pbf => "pbf",
            TileFormat::Grid => "grid",
        }
    }
}

impl FromStr for TileFormat {
    type Err = UnknownTileFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "png" => Ok(TileFormat::Png),
            "pbf" => Ok(TileFormat::Pbf),
            "grid" => Ok(TileFormat::Grid),
            other => Err(UnknownTileFormat(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown tile format: {0}")]
pub struct UnknownTileFormat(pub String);
