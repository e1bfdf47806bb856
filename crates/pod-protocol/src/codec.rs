//! Tokio codec for newline-delimited protocol records
//!
//! One outbound request becomes exactly one JSON line. Inbound, a single
//! transport delivery may carry several records separated by `\n` (the
//! server coalesces its queued messages into one write), so each complete
//! line is decoded independently. A line that fails to parse is logged and
//! skipped without disturbing its siblings.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::message::{Inbound, Request};

/// Maximum length of a single record line.
///
/// Bounds buffering for a peer that never sends a line terminator. Output
/// chunks are the largest records in practice and arrive well under this.
pub const MAX_RECORD_LEN: usize = 1024 * 1024;

/// Codec for encoding requests and decoding inbound records
#[derive(Debug, Default)]
pub struct RecordCodec {
    _priv: (),
}

impl RecordCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self::default()
    }
}

fn parse_line(line: &[u8]) -> Option<Inbound> {
    let line = trim_line(line);
    if line.is_empty() {
        return None;
    }

    match serde_json::from_slice(line) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(
                error = %e,
                record = %String::from_utf8_lossy(line),
                "Dropping malformed record"
            );
            None
        }
    }
}

fn trim_line(mut line: &[u8]) -> &[u8] {
    while let [rest @ .., last] = line {
        if matches!(last, b'\r' | b'\n' | b' ' | b'\t') {
            line = rest;
        } else {
            break;
        }
    }
    line
}

impl Decoder for RecordCodec {
    type Item = Inbound;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|&b| b == b'\n') else {
                if src.len() > MAX_RECORD_LEN {
                    return Err(ProtocolError::RecordTooLarge {
                        size: src.len(),
                        max: MAX_RECORD_LEN,
                    });
                }
                return Ok(None); // Need more data
            };

            if pos > MAX_RECORD_LEN {
                return Err(ProtocolError::RecordTooLarge {
                    size: pos,
                    max: MAX_RECORD_LEN,
                });
            }

            let line = src.split_to(pos + 1);
            if let Some(record) = parse_line(&line) {
                return Ok(Some(record));
            }
            // Malformed or blank line: keep scanning the same buffer
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(record) = self.decode(src)? {
            return Ok(Some(record));
        }

        // The peer may close without terminating its last record
        if src.is_empty() {
            return Ok(None);
        }

        let line = src.split_to(src.len());
        Ok(parse_line(&line))
    }
}

impl Encoder<Request> for RecordCodec {
    type Error = ProtocolError;

    fn encode(&mut self, request: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&request)?;
        if json.len() > MAX_RECORD_LEN {
            return Err(ProtocolError::RecordTooLarge {
                size: json.len(),
                max: MAX_RECORD_LEN,
            });
        }

        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
