//! Frame decoder for captured payloads.
//!
//! Each captured TCP payload is treated as one candidate frame: a 16-bit
//! header carrying the message id (upper 14 bits) and the byte width of the
//! payload length (lower 2 bits), the length itself, then the payload.
//! Container messages wrap a zlib-compressed inner frame and are re-parsed
//! recursively. The parser holds no state across calls.

use std::fmt;
use std::io::Read;

use chrono::Utc;
use tracing::{debug, trace};

use crate::config::ProtocolConfig;
use crate::protocol::message::{ItemPriceListing, Message, ParsedFrame};
use crate::protocol::reader::{PacketReader, ReadError};

/// Containers nested deeper than this are left undecoded
const MAX_CONTAINER_DEPTH: u8 = 4;

/// Decode failures for a single frame (closed set)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Payload ended mid-field, or the header promised more than was captured
    Truncated,
    /// VarInt continuation past its width budget
    MalformedVarInt,
    /// Inflated size exceeded the configured multiple of compressed size
    DecompressionBomb { compressed: usize, cap: usize },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "frame truncated"),
            Self::MalformedVarInt => write!(f, "malformed varint in frame"),
            Self::DecompressionBomb { compressed, cap } => {
                write!(f, "inflated payload exceeded cap ({} compressed, cap {})", compressed, cap)
            }
        }
    }
}

impl std::error::Error for ParseError {}

impl From<ReadError> for ParseError {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::Truncated { .. } => Self::Truncated,
            ReadError::MalformedVarInt { .. } => Self::MalformedVarInt,
        }
    }
}

/// A failed decode, raw bytes retained for diagnostics
#[derive(Debug, Clone)]
pub struct ParseFailure {
    pub kind: ParseError,
    pub raw: Vec<u8>,
}

impl ParseFailure {
    /// First bytes of the offending frame, hex, for log lines
    pub fn hex_preview(&self) -> String {
        PacketReader::new(&self.raw).hex_preview(32)
    }
}

pub type ParseOutcome = Result<ParsedFrame, ParseFailure>;

/// Stateless frame parser; message ids come from configuration
#[derive(Debug, Clone)]
pub struct FrameParser {
    cfg: ProtocolConfig,
}

impl FrameParser {
    pub fn new(cfg: ProtocolConfig) -> Self {
        Self { cfg }
    }

    /// Decode one candidate frame
    pub fn parse(&self, raw: &[u8]) -> ParseOutcome {
        self.parse_at_depth(raw, 0).map_err(|kind| {
            debug!(
                kind = %kind,
                len = raw.len(),
                preview = %PacketReader::new(raw).hex_preview(32),
                "frame_parse_failed"
            );
            ParseFailure { kind, raw: raw.to_vec() }
        })
    }

    fn parse_at_depth(&self, raw: &[u8], depth: u8) -> Result<ParsedFrame, ParseError> {
        let mut reader = PacketReader::new(raw);

        let header = reader.read_u16()?;
        let message_id = header >> 2;
        let len_width = header & 0x3;

        let payload_len = match len_width {
            0 => 0,
            1 => reader.read_u8()? as usize,
            2 => reader.read_u16()? as usize,
            // Three-byte big-endian length
            _ => ((reader.read_u8()? as usize) << 16) | reader.read_u16()? as usize,
        };

        if payload_len > reader.remaining() {
            return Err(ParseError::Truncated);
        }
        let payload = reader.read_bytes(payload_len)?;

        let message = self.dispatch(message_id, payload, depth)?;
        trace!(message_id, payload_len, kind = message.kind(), "frame_parsed");

        Ok(ParsedFrame {
            message_id,
            raw_len: raw.len(),
            parsed_at: Utc::now(),
            message,
        })
    }

    fn dispatch(&self, message_id: u16, payload: &[u8], depth: u8) -> Result<Message, ParseError> {
        if message_id == self.cfg.price_list_id {
            self.parse_price_list(payload)
        } else if message_id == self.cfg.category_description_id {
            self.parse_category_description(payload)
        } else if message_id == self.cfg.compressed_container_id {
            self.parse_container(message_id, payload, depth)
        } else {
            Ok(Message::Unknown {
                message_id,
                payload: payload.to_vec(),
            })
        }
    }

    fn parse_price_list(&self, payload: &[u8]) -> Result<Message, ParseError> {
        let mut reader = PacketReader::new(payload);
        let count = reader.read_var_int()? as usize;

        let mut items = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let gid = reader.read_var_int()?;
            let category = reader.read_var_int()?;
            let price_count = reader.read_var_int()? as usize;
            let mut prices = Vec::with_capacity(price_count.min(8));
            for _ in 0..price_count {
                prices.push(reader.read_var_long()?);
            }
            items.push(ItemPriceListing { gid, category, prices });
        }

        Ok(Message::PriceList {
            items,
            received_at: Utc::now(),
        })
    }

    fn parse_category_description(&self, payload: &[u8]) -> Result<Message, ParseError> {
        let mut reader = PacketReader::new(payload);
        let object_type = reader.read_var_int()?;
        let description = if reader.has_remaining() {
            Some(reader.read_utf()?)
        } else {
            None
        };
        Ok(Message::CategoryDescription { object_type, description })
    }

    fn parse_container(
        &self,
        message_id: u16,
        payload: &[u8],
        depth: u8,
    ) -> Result<Message, ParseError> {
        let mut reader = PacketReader::new(payload);
        let compressed = reader.read_byte_array()?;

        if depth >= MAX_CONTAINER_DEPTH {
            return Ok(Message::Unknown {
                message_id,
                payload: compressed.to_vec(),
            });
        }

        let cap = compressed.len().saturating_mul(self.cfg.max_inflate_ratio as usize);
        let inflated = match inflate_capped(compressed, cap) {
            Ok(bytes) => bytes,
            Err(InflateError::CapExceeded) => {
                return Err(ParseError::DecompressionBomb {
                    compressed: compressed.len(),
                    cap,
                });
            }
            Err(InflateError::Corrupt) => {
                // Undecodable stream: keep the compressed bytes as-is
                return Ok(Message::CompressedContainer {
                    payload: compressed.to_vec(),
                });
            }
        };

        if inflated.is_empty() {
            return Err(ParseError::Truncated);
        }

        match self.parse_at_depth(&inflated, depth + 1) {
            Ok(inner) => Ok(inner.message),
            Err(_) => Ok(Message::Unknown {
                message_id,
                payload: compressed.to_vec(),
            }),
        }
    }
}

enum InflateError {
    CapExceeded,
    Corrupt,
}

/// zlib-inflate `data`, refusing to produce more than `cap` bytes
fn inflate_capped(data: &[u8], cap: usize) -> Result<Vec<u8>, InflateError> {
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    let mut out = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match decoder.read(&mut chunk) {
            Ok(0) => return Ok(out),
            Ok(n) => {
                if out.len() + n > cap {
                    return Err(InflateError::CapExceeded);
                }
                out.extend_from_slice(&chunk[..n]);
            }
            Err(_) => return Err(InflateError::Corrupt),
        }
    }
}
