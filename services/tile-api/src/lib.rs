//! Tile rendering service.
//!
//! HTTP server producing raster/vector/grid map tiles from stored layer and
//! cube definitions, caching rendered tiles in a content-addressed store and
//! rendering on demand through an external backend.

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod orchestrator;
pub mod placeholder;
pub mod prerender;
pub mod render_backend;
pub mod scf;
pub mod spatial;
pub mod state;
pub mod upstream;
