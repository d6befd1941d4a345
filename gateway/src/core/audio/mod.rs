//! PCM16 audio framing.
//!
//! Client binary frames arrive as raw PCM 16-bit signed little-endian
//! samples. Before they can be forwarded upstream they are segmented into
//! fixed-size chunks and base64-encoded, one `input_audio_buffer.append`
//! frame per chunk. All functions here are pure and safe for concurrent use.

use base64::prelude::*;
use thiserror::Error;

/// Chunk size for upstream audio append frames, in bytes.
///
/// 12,288 bytes = 6,144 samples = 256 ms of mono PCM16 at 24 kHz.
pub const AUDIO_CHUNK_SIZE: usize = 12_288;

/// Audio validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AudioError {
    /// Buffer is not valid PCM16: shorter than one sample or odd-length
    #[error("invalid audio: {0}")]
    InvalidAudio(String),
}

/// Quick shape check for a PCM16 buffer: at least one sample, 2-byte aligned.
pub fn looks_like_pcm16(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes.len() % 2 == 0
}

/// Segment a PCM16 buffer into contiguous chunks of at most `size` bytes.
///
/// Every chunk except possibly the last has exactly `size` bytes. An empty
/// buffer yields an empty list; a mis-aligned buffer is rejected.
pub fn chunk(bytes: &[u8], size: usize) -> Result<Vec<&[u8]>, AudioError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    if !looks_like_pcm16(bytes) {
        return Err(AudioError::InvalidAudio(format!(
            "expected non-empty PCM16 buffer with even length, got {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes.chunks(size).collect())
}

/// Segment and base64-encode a PCM16 buffer for upstream append frames.
///
/// Each chunk is encoded independently so the upstream can decode frames as
/// they arrive.
pub fn to_base64_chunks(bytes: &[u8], size: usize) -> Result<Vec<String>, AudioError> {
    Ok(chunk(bytes, size)?
        .into_iter()
        .map(|c| BASE64_STANDARD.encode(c))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_buffer_yields_no_chunks() {
        assert_eq!(chunk(&[], AUDIO_CHUNK_SIZE).unwrap().len(), 0);
        assert_eq!(to_base64_chunks(&[], AUDIO_CHUNK_SIZE).unwrap().len(), 0);
    }

    #[test]
    fn test_odd_length_rejected() {
        let err = chunk(&[0u8; 3], AUDIO_CHUNK_SIZE).unwrap_err();
        assert!(matches!(err, AudioError::InvalidAudio(_)));
        assert!(chunk(&[0u8; 1], AUDIO_CHUNK_SIZE).is_err());
    }

    #[test]
    fn test_looks_like_pcm16() {
        assert!(!looks_like_pcm16(&[]));
        assert!(!looks_like_pcm16(&[0]));
        assert!(looks_like_pcm16(&[0, 0]));
        assert!(!looks_like_pcm16(&[0, 0, 0]));
        assert!(looks_like_pcm16(&[0u8; 24_576]));
    }

    #[test]
    fn test_chunk_sizes_and_order() {
        // Two full chunks plus a 2-byte tail
        let data: Vec<u8> = (0..24_578u32).map(|i| (i % 251) as u8).collect();
        let chunks = chunk(&data, AUDIO_CHUNK_SIZE).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), AUDIO_CHUNK_SIZE);
        assert_eq!(chunks[1].len(), AUDIO_CHUNK_SIZE);
        assert_eq!(chunks[2].len(), 2);

        // Chunks are contiguous and in order
        let rejoined: Vec<u8> = chunks.concat();
        assert_eq!(rejoined, data);
    }

    #[test]
    fn test_base64_roundtrip() {
        let data: Vec<u8> = (0..30_000u32).map(|i| (i % 199) as u8).collect();
        let encoded = to_base64_chunks(&data, AUDIO_CHUNK_SIZE).unwrap();
        assert_eq!(encoded.len(), 3);

        let decoded: Vec<u8> = encoded
            .iter()
            .flat_map(|c| BASE64_STANDARD.decode(c).unwrap())
            .collect();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_exact_multiple_has_no_tail() {
        let data = vec![0u8; AUDIO_CHUNK_SIZE * 2];
        let chunks = chunk(&data, AUDIO_CHUNK_SIZE).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == AUDIO_CHUNK_SIZE));
    }
}
