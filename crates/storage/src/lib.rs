//! Storage backends for the tile services.
//!
//! Two stores with distinct contracts: a key/value store (Redis in
//! production, in-memory for tests) for JSON records, job status and query
//! results, and a byte-addressed tile store (S3, local disk or in-memory via
//! `object_store`) for rendered tile payloads. Key construction lives in
//! [`keys`]; both stores are dumb maps that never treat absence as an error.

pub mod keys;
pub mod kv;
pub mod tile_store;

pub use keys::{style_fingerprint, TileKind};
pub use kv::{get_json, set_json, KeyValueStore, MemoryStore, RedisStore};
pub use tile_store::{TileStore, TileStoreConfig};
