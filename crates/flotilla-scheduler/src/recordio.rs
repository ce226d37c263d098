//! RecordIO framing of the subscription stream.
//!
//! Each record is `<decimal length>\n<length bytes>`. Network reads carry
//! any number of whole or partial records, so the decoder buffers until a
//! record is complete.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{SchedulerError, SchedulerResult};

/// Longest accepted length header, in digits.
const MAX_HEADER_DIGITS: usize = 20;

/// Default cap on a single record.
pub const DEFAULT_MAX_RECORD: usize = 64 * 1024 * 1024;

#[derive(Debug)]
pub struct RecordIoDecoder {
    buf: BytesMut,
    /// Length of the record being assembled, once its header is read.
    pending: Option<usize>,
    max_record: usize,
}

impl Default for RecordIoDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORD)
    }
}

impl RecordIoDecoder {
    pub fn new(max_record: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            pending: None,
            max_record,
        }
    }

    /// Feed one chunk and return every record it completes, in order.
    ///
    /// After an error the stream cannot be resynchronised and the decoder
    /// should be discarded.
    pub fn feed(&mut self, chunk: &[u8]) -> SchedulerResult<Vec<Bytes>> {
        self.buf.extend_from_slice(chunk);
        let mut records = Vec::new();
        loop {
            match self.pending {
                None => {
                    let Some(newline) = self.buf.iter().position(|b| *b == b'\n') else {
                        if self.buf.len() > MAX_HEADER_DIGITS {
                            return Err(SchedulerError::Protocol(
                                "record length header too long".to_string(),
                            ));
                        }
                        break;
                    };
                    let len = parse_header(&self.buf[..newline])?;
                    if len > self.max_record {
                        return Err(SchedulerError::Protocol(format!(
                            "record of {len} bytes exceeds limit of {}",
                            self.max_record
                        )));
                    }
                    self.buf.advance(newline + 1);
                    self.pending = Some(len);
                }
                Some(len) => {
                    if self.buf.len() < len {
                        break;
                    }
                    records.push(self.buf.split_to(len).freeze());
                    self.pending = None;
                }
            }
        }
        Ok(records)
    }

    /// Bytes held for an incomplete record or header.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

fn parse_header(raw: &[u8]) -> SchedulerResult<usize> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    if raw.is_empty() || raw.len() > MAX_HEADER_DIGITS || !raw.iter().all(u8::is_ascii_digit) {
        return Err(SchedulerError::Protocol(format!(
            "invalid record length header: {:?}",
            String::from_utf8_lossy(raw)
        )));
    }
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| SchedulerError::Protocol("record length out of range".to_string()))
}

/// Frame one record (used by test masters).
pub fn encode(record: &[u8]) -> Vec<u8> {
    let mut out = format!("{}\n", record.len()).into_bytes();
    out.extend_from_slice(record);
    out
}
