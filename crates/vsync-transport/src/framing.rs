//! Checksummed, length-prefixed frames.
//!
//! Every frame on a TCP link, in a discovery datagram and in a checkpoint
//! file has the same layout:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────────────────────┐
//! │   Length     │   CRC32      │            Body                  │
//! │   (u32 BE)   │   (u32 BE)   │   (bincode, `Length` bytes)      │
//! └──────────────┴──────────────┴──────────────────────────────────┘
//! ```
//!
//! The decoder is incremental so it can be fed from non-blocking sockets a
//! few bytes at a time.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Size of the frame header in bytes (length + checksum).
pub const HEADER_SIZE: usize = 8;

/// Default maximum body size (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Bodies must carry at least one byte.
const MIN_FRAME_SIZE: u32 = 1;

// ============================================================================
// Errors
// ============================================================================

/// Errors produced while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("deserialization failed: {0}")]
    Deserialize(String),

    #[error("serialization failed: {0}")]
    Serialize(String),

    /// The stream ended in the middle of a frame.
    #[error("truncated frame: have {have} bytes, need {need} more")]
    Truncated { have: usize, need: usize },
}

impl FramingError {
    /// Returns true if the byte stream can no longer be trusted and the link
    /// (or file) carrying it should be abandoned.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FramingError::ChecksumMismatch { .. }
                | FramingError::FrameTooLarge { .. }
                | FramingError::Deserialize(_)
                | FramingError::Truncated { .. }
        )
    }
}

// ============================================================================
// Encoder
// ============================================================================

/// Encodes serializable values into frames.
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    max_size: u32,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self {
            max_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_size(max_size: u32) -> Self {
        debug_assert!(max_size >= MIN_FRAME_SIZE, "max_size must be positive");
        Self { max_size }
    }

    /// Serializes `value` and returns the complete frame.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, FramingError> {
        let body = bincode::serialize(value).map_err(|e| FramingError::Serialize(e.to_string()))?;

        if body.len() > self.max_size as usize {
            return Err(FramingError::FrameTooLarge {
                size: u32::try_from(body.len()).unwrap_or(u32::MAX),
                max: self.max_size,
            });
        }

        let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&crc32fast::hash(&body).to_be_bytes());
        frame.extend_from_slice(&body);

        debug_assert_eq!(frame.len(), HEADER_SIZE + body.len());
        Ok(frame)
    }

    /// Encodes `value` and writes the frame to `writer`.
    pub fn encode_to<T: Serialize, W: Write>(
        &self,
        value: &T,
        writer: &mut W,
    ) -> Result<(), FramingError> {
        let frame = self.encode(value)?;
        writer.write_all(&frame)?;
        Ok(())
    }
}

// ============================================================================
// Decoder
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    ReadingHeader,
    ReadingBody { length: u32, checksum: u32 },
}

/// Incrementally decodes frames from a byte stream.
///
/// Feed bytes with [`FrameDecoder::extend`] and call [`FrameDecoder::decode`]
/// until it returns `Ok(None)`.
#[derive(Debug)]
pub struct FrameDecoder {
    max_size: u32,
    buffer: Vec<u8>,
    state: DecoderState,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_size(max_size: u32) -> Self {
        debug_assert!(max_size >= MIN_FRAME_SIZE, "max_size must be positive");
        Self {
            max_size,
            buffer: Vec::with_capacity(4096),
            state: DecoderState::ReadingHeader,
        }
    }

    /// Appends raw bytes to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Attempts to decode one value from the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Consumed bytes are
    /// removed from the buffer only on success.
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FramingError> {
        loop {
            match self.state {
                DecoderState::ReadingHeader => {
                    if self.buffer.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    let length = u32::from_be_bytes([
                        self.buffer[0],
                        self.buffer[1],
                        self.buffer[2],
                        self.buffer[3],
                    ]);
                    let checksum = u32::from_be_bytes([
                        self.buffer[4],
                        self.buffer[5],
                        self.buffer[6],
                        self.buffer[7],
                    ]);

                    if length > self.max_size {
                        return Err(FramingError::FrameTooLarge {
                            size: length,
                            max: self.max_size,
                        });
                    }
                    if length < MIN_FRAME_SIZE {
                        return Err(FramingError::Deserialize("empty frame".to_string()));
                    }

                    self.state = DecoderState::ReadingBody { length, checksum };
                }

                DecoderState::ReadingBody { length, checksum } => {
                    let total = HEADER_SIZE + length as usize;
                    if self.buffer.len() < total {
                        return Ok(None);
                    }

                    let body = &self.buffer[HEADER_SIZE..total];
                    let actual = crc32fast::hash(body);
                    if actual != checksum {
                        return Err(FramingError::ChecksumMismatch {
                            expected: checksum,
                            actual,
                        });
                    }

                    let value: T = bincode::deserialize(body)
                        .map_err(|e| FramingError::Deserialize(e.to_string()))?;

                    self.buffer.drain(..total);
                    self.state = DecoderState::ReadingHeader;
                    return Ok(Some(value));
                }
            }
        }
    }

    /// Reads every frame from `reader` until end of input.
    ///
    /// Used for files, where a partial trailing frame means truncation.
    pub fn read_all<T: DeserializeOwned, R: Read>(
        &mut self,
        reader: &mut R,
    ) -> Result<Vec<T>, FramingError> {
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw)?;
        self.extend(&raw);

        let mut values = Vec::new();
        while let Some(value) = self.decode()? {
            values.push(value);
        }

        if !self.buffer.is_empty() {
            return Err(FramingError::Truncated {
                have: self.buffer.len(),
                need: self.bytes_needed(),
            });
        }
        Ok(values)
    }

    fn bytes_needed(&self) -> usize {
        match self.state {
            DecoderState::ReadingHeader => HEADER_SIZE.saturating_sub(self.buffer.len()),
            DecoderState::ReadingBody { length, .. } => {
                (HEADER_SIZE + length as usize).saturating_sub(self.buffer.len())
            }
        }
    }

    /// Discards buffered bytes and returns to the header state.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = DecoderState::ReadingHeader;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_frames_split_across_reads() {
        let encoder = FrameEncoder::new();
        let mut stream = Vec::new();
        for word in ["alpha", "beta", "gamma"] {
            stream.extend(encoder.encode(&word.to_string()).expect("encode"));
        }

        let mut decoder = FrameDecoder::new();
        let mut decoded: Vec<String> = Vec::new();
        for chunk in stream.chunks(3) {
            decoder.extend(chunk);
            while let Some(word) = decoder.decode().expect("decode") {
                decoded.push(word);
            }
        }

        assert_eq!(decoded, vec!["alpha", "beta", "gamma"]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn header_only_waits_for_body() {
        let frame = FrameEncoder::new().encode(&42u64).expect("encode");
        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame[..HEADER_SIZE]);

        assert!(decoder.decode::<u64>().expect("decode").is_none());
        assert_eq!(decoder.bytes_needed(), frame.len() - HEADER_SIZE);
    }

    #[test]
    fn corrupted_body_is_rejected() {
        let mut frame = FrameEncoder::new().encode(&"payload".to_string()).expect("encode");
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;

        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame);
        let err = decoder.decode::<String>().expect_err("checksum must fail");

        assert!(matches!(err, FramingError::ChecksumMismatch { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn oversized_frames_are_refused_both_ways() {
        let encoder = FrameEncoder::with_max_size(4);
        assert!(matches!(
            encoder.encode(&vec![0u8; 64]),
            Err(FramingError::FrameTooLarge { max: 4, .. })
        ));

        let frame = FrameEncoder::new().encode(&vec![0u8; 64]).expect("encode");
        let mut decoder = FrameDecoder::with_max_size(4);
        decoder.extend(&frame);
        assert!(matches!(
            decoder.decode::<Vec<u8>>(),
            Err(FramingError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn read_all_reports_truncated_tail() {
        let encoder = FrameEncoder::new();
        let mut file = encoder.encode(&1u32).expect("encode");
        let second = encoder.encode(&2u32).expect("encode");
        file.extend_from_slice(&second[..second.len() - 1]);

        let mut decoder = FrameDecoder::new();
        let err = decoder
            .read_all::<u32, _>(&mut file.as_slice())
            .expect_err("tail is incomplete");
        assert!(matches!(err, FramingError::Truncated { need: 1, .. }));
    }

    #[test]
    fn reset_discards_partial_frame() {
        let frame = FrameEncoder::new().encode(&7u16).expect("encode");
        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame[..5]);
        decoder.reset();
        decoder.extend(&frame);

        assert_eq!(decoder.decode::<u16>().expect("decode"), Some(7));
    }
}
