//! Shared-Tier Wire Codec
//!
//! Entries cross the process boundary as a self-describing envelope carrying
//! the value together with its fresh/stale expiry, so the stale window can be
//! re-derived by any instance after its local copy is gone.
//!
//! Layout: one header byte (algorithm) followed by the JSON envelope, LZ4
//! block-compressed (size-prefixed) when larger than the configured threshold
//! and only if that actually saves space.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::entry::CacheEntry;
use crate::error::{Error, Result};

/// Payload compression used in the envelope header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionAlgorithm {
    /// Stored as plain JSON
    None,
    /// LZ4 block compression
    Lz4,
}

impl CompressionAlgorithm {
    fn tag(self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(CompressionAlgorithm::None),
            1 => Ok(CompressionAlgorithm::Lz4),
            other => Err(Error::Codec(format!("unknown compression tag {}", other))),
        }
    }

    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Serialized form of an entry
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    value: Value,
    written_at: DateTime<Utc>,
    fresh_expiry: DateTime<Utc>,
    stale_expiry: DateTime<Utc>,
    #[serde(default)]
    tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    marked: bool,
}

/// Upper bound on a decompressed envelope unless configured otherwise
const DEFAULT_MAX_DECODED_BYTES: usize = 64 * 1024 * 1024;

/// Encoder/decoder for shared-tier payloads
#[derive(Debug, Clone)]
pub struct EntryCodec {
    /// Payloads larger than this are compressed
    compression_threshold: usize,
    /// Compressed payloads claiming a larger decoded size are rejected
    max_decoded_bytes: usize,
}

impl EntryCodec {
    /// Create a codec compressing payloads above `compression_threshold` bytes
    pub fn new(compression_threshold: usize) -> Self {
        Self {
            compression_threshold,
            max_decoded_bytes: DEFAULT_MAX_DECODED_BYTES,
        }
    }

    /// Cap the decoded size of compressed payloads
    pub fn with_max_decoded_bytes(mut self, limit: usize) -> Self {
        self.max_decoded_bytes = limit;
        self
    }

    /// Encode an entry for the shared tier
    pub fn encode(&self, entry: &CacheEntry) -> Result<Bytes> {
        let envelope = Envelope {
            value: entry.value().as_ref().clone(),
            written_at: entry.written_at(),
            fresh_expiry: entry.fresh_expiry(),
            stale_expiry: entry.stale_expiry(),
            tags: entry.tags().clone(),
            marked: entry.is_marked(),
        };
        let json = serde_json::to_vec(&envelope)?;

        let (algorithm, body) = if json.len() > self.compression_threshold {
            match lz4::block::compress(&json, None, true) {
                Ok(compressed) if compressed.len() < json.len() => {
                    (CompressionAlgorithm::Lz4, compressed)
                }
                Ok(_) => (CompressionAlgorithm::None, json),
                Err(e) => {
                    tracing::warn!(error = %e, "LZ4 compression failed, storing uncompressed");
                    (CompressionAlgorithm::None, json)
                }
            }
        } else {
            (CompressionAlgorithm::None, json)
        };

        let mut buf = BytesMut::with_capacity(body.len() + 1);
        buf.put_u8(algorithm.tag());
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Decode a shared-tier payload back into an entry
    pub fn decode(&self, payload: &[u8]) -> Result<CacheEntry> {
        let (&tag, body) = payload
            .split_first()
            .ok_or_else(|| Error::Codec("empty payload".into()))?;

        let json = match CompressionAlgorithm::from_tag(tag)? {
            CompressionAlgorithm::None => body.to_vec(),
            CompressionAlgorithm::Lz4 => {
                self.check_decoded_size(body)?;
                lz4::block::decompress(body, None)
                    .map_err(|e| Error::Codec(format!("LZ4 decompression failed: {}", e)))?
            }
        };

        let envelope: Envelope = serde_json::from_slice(&json)?;
        let size = serde_json::to_vec(&envelope.value)
            .map(|v| v.len() as u64)
            .unwrap_or(json.len() as u64);

        Ok(CacheEntry::from_parts(
            Arc::new(envelope.value),
            envelope.written_at,
            envelope.fresh_expiry,
            envelope.stale_expiry,
            size,
            envelope.tags,
        )
        .with_mark(envelope.marked))
    }

    /// The LZ4 block carries its decoded size as a little-endian i32 prefix
    fn check_decoded_size(&self, body: &[u8]) -> Result<()> {
        let prefix: [u8; 4] = body
            .get(..4)
            .and_then(|p| p.try_into().ok())
            .ok_or_else(|| Error::Codec("truncated LZ4 size prefix".into()))?;
        let claimed = i32::from_le_bytes(prefix);
        if claimed < 0 || claimed as usize > self.max_decoded_bytes {
            return Err(Error::Codec(format!(
                "decoded size {} exceeds limit of {} bytes",
                claimed, self.max_decoded_bytes
            )));
        }
        Ok(())
    }

    /// Algorithm recorded in an encoded payload
    pub fn algorithm_of(payload: &[u8]) -> Result<CompressionAlgorithm> {
        let tag = payload
            .first()
            .ok_or_else(|| Error::Codec("empty payload".into()))?;
        CompressionAlgorithm::from_tag(*tag)
    }
}

impl Default for EntryCodec {
    fn default() -> Self {
        Self::new(4 * 1024)
    }
}

// =============================================================================
// Tests
// =============================================================================
