//! Snapshot encoding. Plain JSON by default; zstd-compressed JSON with the
//! `zstd` feature. Decoding accepts either.

use xtrack_core::Snapshot;

use crate::PersistError;

#[cfg(feature = "zstd")]
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

pub fn encode_snapshot(snap: &Snapshot) -> Result<Vec<u8>, PersistError> {
    let json = serde_json::to_vec(snap)?;
    Ok(maybe_compress(json))
}

/// Decode a stored snapshot; decompressed output is bounded by `max_bytes`.
pub fn decode_snapshot(body: &[u8], max_bytes: usize) -> Result<Snapshot, PersistError> {
    let json = maybe_decompress(body, max_bytes)?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(feature = "zstd")]
fn maybe_compress(json: Vec<u8>) -> Vec<u8> {
    let lvl: i32 = std::env::var("XTRACK_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
    let compressed = zstd::encode_all(json.as_slice(), lvl);
    plain_on_error(json, compressed)
}

/// A failed compression stores plain JSON, which decoding still accepts.
#[cfg(feature = "zstd")]
fn plain_on_error(json: Vec<u8>, compressed: std::io::Result<Vec<u8>>) -> Vec<u8> {
    match compressed {
        Ok(out) => out,
        Err(e) => {
            tracing::warn!(error = %e, bytes = json.len(), "zstd compression failed; storing uncompressed snapshot");
            json
        }
    }
}

#[cfg(not(feature = "zstd"))]
fn maybe_compress(json: Vec<u8>) -> Vec<u8> {
    json
}

#[cfg(feature = "zstd")]
fn maybe_decompress(body: &[u8], max_bytes: usize) -> Result<std::borrow::Cow<'_, [u8]>, PersistError> {
    use std::io::Read;
    if !body.starts_with(&ZSTD_MAGIC) {
        return Ok(std::borrow::Cow::Borrowed(body));
    }
    let decoder = zstd::stream::read::Decoder::new(body)?;
    let mut out = Vec::new();
    decoder.take(max_bytes as u64 + 1).read_to_end(&mut out)?;
    if out.len() > max_bytes {
        return Err(PersistError::TooLarge { size: out.len() as u64, max: max_bytes });
    }
    Ok(std::borrow::Cow::Owned(out))
}

#[cfg(not(feature = "zstd"))]
fn maybe_decompress(body: &[u8], _max_bytes: usize) -> Result<std::borrow::Cow<'_, [u8]>, PersistError> {
    Ok(std::borrow::Cow::Borrowed(body))
}
