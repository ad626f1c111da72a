//! Payload codec: gzip compression and the tombstone sentinel
//!
//! Stored payloads come in two shapes. A real payload is a gzip blob that is
//! only decompressed when the caller actually asks for the text. A rolled-back
//! ("invisible") record version instead carries exactly one reserved byte,
//! written in place of the original payload so the row itself survives and
//! surrogate-id contiguity is preserved. The sentinel never reaches the
//! decompression path.

use std::fmt;
use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{MergelineError, Result};

/// Reserved payload byte marking a record version as rolled back.
pub const TOMBSTONE_SENTINEL: u8 = 0x0F;

/// The stored payload written for a tombstoned row.
pub fn tombstone_payload() -> Bytes {
    Bytes::from_static(&[TOMBSTONE_SENTINEL])
}

/// Whether a stored payload is the tombstone sentinel: exactly one byte with
/// the reserved value. Longer payloads starting with the same byte are real.
pub fn is_tombstone(payload: &[u8]) -> bool {
    payload.len() == 1 && payload[0] == TOMBSTONE_SENTINEL
}

/// Compression seam consumed by the read path. The store only ever hands
/// whole payloads across it, lazily, when a caller materializes the text.
pub trait PayloadCodec: Send + Sync + fmt::Debug {
    fn compress(&self, text: &str) -> Result<Bytes>;
    fn decompress(&self, payload: &[u8]) -> Result<String>;
}

/// Gzip payload codec matching the backing store's on-disk format.
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipPayloadCodec;

impl PayloadCodec for GzipPayloadCodec {
    fn compress(&self, text: &str) -> Result<Bytes> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(text.as_bytes())
            .map_err(|e| MergelineError::codec_msg(format!("gzip compression failed: {e}")))?;
        let compressed = encoder
            .finish()
            .map_err(|e| MergelineError::codec_msg(format!("gzip compression failed: {e}")))?;
        Ok(Bytes::from(compressed))
    }

    fn decompress(&self, payload: &[u8]) -> Result<String> {
        let mut decoder = GzDecoder::new(payload);
        let mut text = String::new();
        decoder
            .read_to_string(&mut text)
            .map_err(|e| MergelineError::codec_msg(format!("gzip decompression failed: {e}")))?;
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_payload_round_trips() {
        let codec = GzipPayloadCodec;
        let text = r#"{"id":"inv-100","total":41.50,"lines":3}"#;
        let compressed = codec.compress(text).unwrap();
        assert_ne!(compressed.as_ref(), text.as_bytes());
        assert_eq!(codec.decompress(&compressed).unwrap(), text);
    }

    #[test]
    fn sentinel_is_exactly_one_reserved_byte() {
        assert!(is_tombstone(&[TOMBSTONE_SENTINEL]));
        assert!(is_tombstone(&tombstone_payload()));
        assert!(!is_tombstone(&[]));
        assert!(!is_tombstone(&[TOMBSTONE_SENTINEL, TOMBSTONE_SENTINEL]));
        assert!(!is_tombstone(&[0x1F]));
    }

    #[test]
    fn sentinel_is_not_a_valid_gzip_stream() {
        let codec = GzipPayloadCodec;
        let err = codec.decompress(&tombstone_payload()).unwrap_err();
        assert!(matches!(err, MergelineError::Codec(_)));
    }

    #[test]
    fn compression_shrinks_repetitive_payloads() {
        let codec = GzipPayloadCodec;
        let text = "x".repeat(10_000);
        let compressed = codec.compress(&text).unwrap();
        assert!(compressed.len() < text.len() / 10);
    }
}
