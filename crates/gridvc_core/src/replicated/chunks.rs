//! Chunked payload codec for the replicated backend.
//!
//! The shared-document substrate cannot take arbitrarily large values in a
//! single transaction, so payload JSON is gzip-compressed and split into
//! fixed-size byte chunks that the store appends across as many transactions
//! as needed. Encoding must be reproducible: same input, same chunks.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{GridvcError, Result};

/// Gzip-compress a serialized payload.
pub(crate) fn compress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .map_err(|e| GridvcError::Encoding(format!("gzip compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| GridvcError::Encoding(format!("gzip compression failed: {}", e)))
}

/// Decompress a gzip payload. Corrupt input is an [`GridvcError::Encoding`]
/// error, propagated to the caller rather than retried.
pub(crate) fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|e| GridvcError::Encoding(format!("gzip decompression failed: {}", e)))?;
    Ok(out)
}

/// Split a byte payload into fixed-size chunks. The final chunk may be
/// shorter; an empty payload yields no chunks.
pub(crate) fn split_chunks(bytes: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    bytes
        .chunks(chunk_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Serialize a payload string to its chunked wire form.
pub(crate) fn encode_chunked(payload: &str, chunk_size: usize) -> Result<Vec<Vec<u8>>> {
    Ok(split_chunks(&compress(payload.as_bytes())?, chunk_size))
}

/// Reassemble and decode a fully-written chunk list back into the payload
/// string. Callers must have verified chunk completeness first.
pub(crate) fn decode_chunked(chunks: &[Vec<u8>]) -> Result<String> {
    let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
    let bytes = decompress(&joined)?;
    String::from_utf8(bytes)
        .map_err(|e| GridvcError::Encoding(format!("payload is not valid UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_sizes_across_chunk_boundaries() {
        // 0 bytes, 1 byte, exactly one chunk of compressed output, many chunks.
        for len in [0usize, 1, 64, 4096, 100_000] {
            let payload: String = "abcdefgh".chars().cycle().take(len).collect();
            for chunk_size in [1usize, 7, 64, 64 * 1024] {
                let chunks = encode_chunked(&payload, chunk_size).unwrap();
                assert_eq!(decode_chunked(&chunks).unwrap(), payload);
            }
        }
    }

    #[test]
    fn test_compressed_stream_splits_exactly_on_boundary() {
        let payload = "x".repeat(10_000);
        let compressed = compress(payload.as_bytes()).unwrap();
        let chunks = split_chunks(&compressed, compressed.len());
        assert_eq!(chunks.len(), 1);

        let halves = split_chunks(&compressed, compressed.len().div_ceil(2));
        assert_eq!(halves.len(), 2);
        assert_eq!(decode_chunked(&halves).unwrap(), payload);
    }

    #[test]
    fn test_empty_payload_still_produces_a_valid_stream() {
        let chunks = encode_chunked("", 16).unwrap();
        assert!(!chunks.is_empty());
        assert_eq!(decode_chunked(&chunks).unwrap(), "");
    }

    #[test]
    fn test_split_chunks_zero_bytes() {
        assert!(split_chunks(&[], 16).is_empty());
    }

    #[test]
    fn test_corrupt_stream_is_an_encoding_error() {
        let err = decode_chunked(&[vec![0xde, 0xad, 0xbe, 0xef]]).unwrap_err();
        assert!(matches!(err, GridvcError::Encoding(_)));
    }

    #[test]
    fn test_truncated_stream_is_an_encoding_error() {
        let chunks = encode_chunked(&"y".repeat(50_000), 128).unwrap();
        let err = decode_chunked(&chunks[..chunks.len() - 1]).unwrap_err();
        assert!(matches!(err, GridvcError::Encoding(_)));
    }

    #[test]
    fn test_encoding_is_reproducible() {
        let payload = serde_json::json!({"cells": {"A1": 1, "B2": "two"}}).to_string();
        assert_eq!(
            encode_chunked(&payload, 32).unwrap(),
            encode_chunked(&payload, 32).unwrap()
        );
    }
}
