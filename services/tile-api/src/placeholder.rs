//! Pre-baked placeholder tiles.
//!
//! Tile endpoints never surface an HTTP error for a well-formed URL: tiles
//! outside an extent and tiles whose render failed are answered with a valid
//! PNG so a broken tile cannot break the whole map view. The two payloads
//! are built once at startup (PNG chunks written by hand, deflate via
//! flate2, CRCs via crc32fast).

use bytes::Bytes;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::Write;
use std::sync::OnceLock;

const TILE_SIZE: u32 = 256;

/// Fully transparent tile: the area is legitimately outside the data extent.
pub fn empty_tile() -> Bytes {
    static EMPTY: OnceLock<Bytes> = OnceLock::new();
    EMPTY
        .get_or_init(|| Bytes::from(encode_rgba_png([0, 0, 0, 0])))
        .clone()
}

/// Faint gray tile: the render backend failed for this tile.
pub fn error_tile() -> Bytes {
    static ERROR: OnceLock<Bytes> = OnceLock::new();
    ERROR
        .get_or_init(|| Bytes::from(encode_rgba_png([128, 128, 128, 32])))
        .clone()
}

/// Empty JSON body served when vector/grid requests degrade.
pub fn empty_json() -> Bytes {
    Bytes::from_static(b"{}")
}

/// Encode a uniform-color 256x256 RGBA PNG.
fn encode_rgba_png(rgba: [u8; 4]) -> Vec<u8> {
    let mut png = Vec::new();
    png.extend_from_slice(&[0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1A, b'\n']);

    // IHDR: 8-bit RGBA.
    let mut ihdr = Vec::with_capacity(13);
    ihdr.extend_from_slice(&TILE_SIZE.to_be_bytes());
    ihdr.extend_from_slice(&TILE_SIZE.to_be_bytes());
    ihdr.extend_from_slice(&[8, 6, 0, 0, 0]);
    write_chunk(&mut png, b"IHDR", &ihdr);

    // IDAT: each scanline is a filter byte followed by the pixels.
    let mut raw = Vec::with_capacity((TILE_SIZE * (TILE_SIZE * 4 + 1)) as usize);
    for _ in 0..TILE_SIZE {
        raw.push(0);
        for _ in 0..TILE_SIZE {
            raw.extend_from_slice(&rgba);
        }
    }

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw).expect("in-memory deflate");
    let compressed = encoder.finish().expect("in-memory deflate");
    write_chunk(&mut png, b"IDAT", &compressed);

    write_chunk(&mut png, b"IEND", &[]);
    png
}

fn write_chunk(out: &mut Vec<u8>, chunk_type: &[u8; 4], data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(chunk_type);
    out.extend_from_slice(data);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(chunk_type);
    hasher.update(data);
    out.extend_from_slice(&hasher.finalize().to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_are_valid_png_containers() {
        for tile in [empty_tile(), error_tile()] {
            assert_eq!(&tile[..8], &[0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1A, b'\n']);
            // IHDR directly after the signature, IEND at the end.
            assert_eq!(&tile[12..16], b"IHDR");
            assert_eq!(&tile[tile.len() - 8..tile.len() - 4], b"IEND");
        }
    }

    #[test]
    fn test_placeholders_differ() {
        assert_ne!(empty_tile(), error_tile());
    }

    #[test]
    fn test_placeholders_are_cached() {
        // Same allocation returned on every call.
        let a = empty_tile();
        let b = empty_tile();
        assert_eq!(a.as_ptr(), b.as_ptr());
    }
}
