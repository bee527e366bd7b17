//! Layer and cube registry: the mutable metadata aggregates behind the tile
//! service, persisted as JSON records in the key/value store.

pub mod cube;
pub mod layer;
pub mod mask;

pub use cube::{Cube, CubeRegistry, DatasetRef, Granularity};
pub use layer::{DataType, Layer, LayerCreateParams, LayerOptions, LayerRegistry, UploadStatus};
pub use mask::{Mask, MaskKind};
