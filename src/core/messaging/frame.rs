// src/core/messaging/frame.rs

//! Wire frames: a fixed header identifying sender and addressee, followed by
//! a bincode payload, compressed when large enough to be worth it.

use crate::core::HelmsmanError;
use crate::core::messaging::protocol::{ControlMessage, MsgClass};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

/// zstd level used for oversized payloads. Level 3 is the library default
/// and the right trade-off for latency-sensitive cluster traffic.
const COMPRESSION_LEVEL: i32 = 3;

/// Identity of the sending process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct EndpointId {
    pub node_id: u32,
    pub pid: u32,
    pub uname: String,
}

/// Addressee constraints. An unset field matches any receiver; a set field
/// must match or the frame is dropped on arrival.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[derive(bincode::Encode, bincode::Decode)]
pub struct HostSpec {
    pub node_id: Option<u32>,
    pub uname: Option<String>,
    /// Loopback marker for frames the sender also delivers to itself.
    pub local: bool,
}

impl HostSpec {
    pub fn broadcast() -> Self {
        Self::default()
    }

    pub fn to_uname(uname: &str) -> Self {
        Self {
            node_id: None,
            uname: Some(uname.to_string()),
            local: false,
        }
    }
}

/// The fixed frame prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct FrameHeader {
    pub sender: EndpointId,
    pub host: HostSpec,
    /// Per-sender sequence number; diagnostic only.
    pub seq: u64,
    pub class: MsgClass,
    /// Uncompressed payload size.
    pub size: u32,
    pub compressed_size: u32,
    pub is_compressed: bool,
}

/// A complete frame as multicast on the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct WireFrame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl WireFrame {
    /// Serializes a control message into a frame, compressing the payload if
    /// it meets the threshold and compression actually helps.
    pub fn build(
        sender: EndpointId,
        host: HostSpec,
        seq: u64,
        message: &ControlMessage,
        compression_threshold: usize,
    ) -> Result<Self, HelmsmanError> {
        let raw = bincode::encode_to_vec(message, bincode::config::standard())?;
        let size = raw.len() as u32;

        let (payload, is_compressed, compressed_size) = if raw.len() >= compression_threshold {
            match zstd::bulk::compress(&raw, COMPRESSION_LEVEL) {
                Ok(compressed) if compressed.len() < raw.len() => {
                    trace!(
                        "Compressed {} frame {} -> {} bytes",
                        message.op_name(),
                        raw.len(),
                        compressed.len()
                    );
                    let clen = compressed.len() as u32;
                    (compressed, true, clen)
                }
                Ok(_) => (raw, false, 0),
                Err(e) => {
                    warn!("Compression failed, sending {} uncompressed: {}", size, e);
                    (raw, false, 0)
                }
            }
        } else {
            (raw, false, 0)
        };

        Ok(Self {
            header: FrameHeader {
                sender,
                host,
                seq,
                class: message.class(),
                size,
                compressed_size,
                is_compressed,
            },
            payload,
        })
    }

    /// Encodes the whole frame for the transport.
    pub fn encode(&self) -> Result<Bytes, HelmsmanError> {
        let bytes = bincode::encode_to_vec(self, bincode::config::standard())?;
        Ok(Bytes::from(bytes))
    }

    /// Decodes a frame received from the transport.
    pub fn decode(data: &[u8]) -> Result<Self, HelmsmanError> {
        let (frame, consumed): (WireFrame, usize) =
            bincode::decode_from_slice(data, bincode::config::standard())?;
        if consumed != data.len() {
            return Err(HelmsmanError::Protocol(format!(
                "Trailing garbage after frame ({} of {} bytes consumed)",
                consumed,
                data.len()
            )));
        }
        Ok(frame)
    }

    /// Recovers the control message, decompressing first when flagged. The
    /// post-decompression size must match the declared uncompressed size.
    pub fn message(&self) -> Result<ControlMessage, HelmsmanError> {
        let raw: Vec<u8>;
        let bytes: &[u8] = if self.header.is_compressed {
            raw = zstd::bulk::decompress(&self.payload, self.header.size as usize)
                .map_err(|e| HelmsmanError::Protocol(format!("Frame decompression failed: {e}")))?;
            if raw.len() != self.header.size as usize {
                return Err(HelmsmanError::Protocol(format!(
                    "Decompressed size {} != declared size {}",
                    raw.len(),
                    self.header.size
                )));
            }
            &raw
        } else {
            &self.payload
        };

        let (message, _): (ControlMessage, usize) =
            bincode::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(message)
    }
}
