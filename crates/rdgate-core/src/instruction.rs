//! Instruction framing for the backend wire protocol.
//!
//! Wire format: each element is `<length>.<value>` where `length` counts the
//! Unicode scalar values in `value`; elements are joined with `,` and the
//! instruction ends with `;`. The first element is the opcode.
//!
//! Decoding is always driven by the length prefixes, so values may contain
//! `,` and `;` freely.

use crate::error::{GatewayError, GatewayResult};
use std::fmt;
use std::ops::Range;

/// Upper bound on a single element's declared length (in characters).
pub const MAX_ELEMENT_LENGTH: usize = 1_048_576;

/// One complete protocol instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: String,
    pub args: Vec<String>,
}

impl Instruction {
    pub fn new<I, S>(opcode: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            opcode: opcode.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Encode to wire form, e.g. `4.size,4.1024,3.768,2.96;`.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        encode_element(&mut out, &self.opcode);
        for arg in &self.args {
            out.push(',');
            encode_element(&mut out, arg);
        }
        out.push(';');
        out
    }

    /// Parse exactly one complete instruction from `s`.
    pub fn parse(s: &str) -> GatewayResult<Self> {
        let mut parser = InstructionParser::new();
        parser.feed(s.as_bytes());
        let instruction = parser.next_instruction()?.ok_or_else(|| {
            GatewayError::BackendProtocol("incomplete instruction".into())
        })?;
        if parser.pending() != 0 {
            return Err(GatewayError::BackendProtocol(
                "trailing data after instruction".into(),
            ));
        }
        Ok(instruction)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn encode_element(out: &mut String, value: &str) {
    out.push_str(&value.chars().count().to_string());
    out.push('.');
    out.push_str(value);
}

/// Where the scan of the head instruction stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Reading the decimal length prefix.
    Length { len: usize, digits: usize },
    /// `remaining` characters of the current value still to come.
    Value { remaining: usize },
    /// Expecting `,` or `;`.
    Separator,
}

/// Resumable scan state for the instruction at the head of the buffer.
///
/// Offsets are relative to the start of the buffer, so bytes already
/// scanned are never looked at again when more data arrives.
#[derive(Debug)]
struct Cursor {
    pos: usize,
    phase: Phase,
    value_start: usize,
    elements: Vec<Range<usize>>,
}

impl Default for Cursor {
    fn default() -> Self {
        Self::at(0)
    }
}

impl Cursor {
    fn at(pos: usize) -> Self {
        Self {
            pos,
            phase: Phase::Length { len: 0, digits: 0 },
            value_start: pos,
            elements: Vec::new(),
        }
    }

    /// Rebase after `n` bytes were drained from the front of the buffer.
    fn shift(&mut self, n: usize) {
        self.pos -= n;
        self.value_start -= n;
        for r in &mut self.elements {
            *r = r.start - n..r.end - n;
        }
    }

    /// Continue scanning `buf`. Returns the byte offset just past the
    /// terminating `;` once the instruction is complete.
    fn advance(&mut self, buf: &[u8]) -> GatewayResult<Option<usize>> {
        loop {
            match self.phase {
                Phase::Length { len, digits } => {
                    let Some(&b) = buf.get(self.pos) else {
                        return Ok(None);
                    };
                    match b {
                        b'0'..=b'9' => {
                            let len = len
                                .checked_mul(10)
                                .and_then(|l| l.checked_add(usize::from(b - b'0')))
                                .filter(|l| *l <= MAX_ELEMENT_LENGTH)
                                .ok_or_else(|| {
                                    GatewayError::BackendProtocol(format!(
                                        "element length exceeds {MAX_ELEMENT_LENGTH}"
                                    ))
                                })?;
                            self.phase = Phase::Length {
                                len,
                                digits: digits + 1,
                            };
                            self.pos += 1;
                        }
                        b'.' if digits > 0 => {
                            self.pos += 1;
                            self.value_start = self.pos;
                            self.phase = Phase::Value { remaining: len };
                        }
                        _ => {
                            return Err(GatewayError::BackendProtocol(format!(
                                "unexpected byte 0x{b:02x} in length prefix at offset {}",
                                self.pos
                            )));
                        }
                    }
                }
                // Values may straddle reads mid-character.
                Phase::Value { remaining: 0 } => {
                    let value = &buf[self.value_start..self.pos];
                    std::str::from_utf8(value).map_err(|e| {
                        GatewayError::BackendProtocol(format!("invalid UTF-8 value: {e}"))
                    })?;
                    self.elements.push(self.value_start..self.pos);
                    self.phase = Phase::Separator;
                }
                Phase::Value { remaining } => {
                    let Some(&lead) = buf.get(self.pos) else {
                        return Ok(None);
                    };
                    let width = utf8_width(lead).ok_or_else(|| {
                        GatewayError::BackendProtocol(format!(
                            "invalid UTF-8 lead byte 0x{lead:02x} at offset {}",
                            self.pos
                        ))
                    })?;
                    if self.pos + width > buf.len() {
                        return Ok(None);
                    }
                    self.pos += width;
                    self.phase = Phase::Value {
                        remaining: remaining - 1,
                    };
                }
                Phase::Separator => {
                    let Some(&b) = buf.get(self.pos) else {
                        return Ok(None);
                    };
                    match b {
                        b',' => {
                            self.pos += 1;
                            self.phase = Phase::Length { len: 0, digits: 0 };
                        }
                        b';' => return Ok(Some(self.pos + 1)),
                        _ => {
                            return Err(GatewayError::BackendProtocol(format!(
                                "expected ',' or ';' after element, got 0x{b:02x} at offset {}",
                                self.pos
                            )));
                        }
                    }
                }
            }
        }
    }
}

/// Streaming instruction decoder: accumulates bytes across partial reads.
#[derive(Debug, Default)]
pub struct InstructionParser {
    buffer: Vec<u8>,
    cursor: Cursor,
}

impl InstructionParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes to the internal buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pop the next complete instruction, decoded into its elements.
    ///
    /// Returns `Ok(None)` while the buffered data ends mid-instruction.
    pub fn next_instruction(&mut self) -> GatewayResult<Option<Instruction>> {
        let Some(end) = self.cursor.advance(&self.buffer)? else {
            return Ok(None);
        };
        let cursor = std::mem::take(&mut self.cursor);

        let mut elements = cursor
            .elements
            .into_iter()
            .map(|r| String::from_utf8_lossy(&self.buffer[r]).into_owned());
        let opcode = elements.next().unwrap_or_default();
        let instruction = Instruction {
            opcode,
            args: elements.collect(),
        };
        self.buffer.drain(..end);
        Ok(Some(instruction))
    }

    /// Take every complete instruction currently buffered, verbatim.
    ///
    /// Returns `Ok(None)` if no instruction is complete yet. Any incomplete
    /// tail stays buffered for the next read, along with how far it has
    /// been scanned.
    pub fn take_complete(&mut self) -> GatewayResult<Option<String>> {
        let mut end = 0;
        while let Some(next) = self.cursor.advance(&self.buffer)? {
            end = next;
            self.cursor = Cursor::at(end);
        }
        if end == 0 {
            return Ok(None);
        }

        let chunk: Vec<u8> = self.buffer.drain(..end).collect();
        self.cursor.shift(end);
        String::from_utf8(chunk)
            .map(Some)
            .map_err(|e| GatewayError::BackendProtocol(format!("invalid UTF-8: {e}")))
    }

    /// Number of bytes buffered but not yet consumed.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Discard all buffered bytes.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.cursor = Cursor::default();
    }
}

fn utf8_width(lead: u8) -> Option<usize> {
    match lead {
        0x00..=0x7f => Some(1),
        0xc2..=0xdf => Some(2),
        0xe0..=0xef => Some(3),
        0xf0..=0xf4 => Some(4),
        _ => None,
    }
}
