//! Wire framing for ISO 8583 sockets.
//!
//! Every message on a FISC link travels as a length-prefixed frame:
//!
//! ```text
//! [length prefix: 1-4 bytes] [message body: MTI + bitmap + fields]
//! ```
//!
//! The prefix is configurable in width, in encoding, and in whether the
//! length value counts the prefix bytes themselves:
//!
//! - `Ascii`: decimal digit characters, e.g. width 4 → `"0123"`
//! - `Bcd`: two decimal digits per byte, high nibble first, e.g. width 2 →
//!   `0x01 0x23`
//! - `Binary`: big-endian unsigned integer
//!
//! Decoding is incremental: feed byte chunks in, pull complete bodies out.
//! A bad length (invalid digit, BCD nibble above 9, below the protocol
//! minimum or above the configured maximum) clears the entire receive
//! buffer (the only safe resync point once the prefix can no longer be
//! trusted) and surfaces an error; the caller decides whether the
//! connection survives.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_MAX_FRAME, DEFAULT_MIN_FRAME};

/// Encoding of the length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthEncoding {
    /// US-ASCII decimal digits, one digit per byte.
    Ascii,
    /// Packed BCD, two decimal digits per byte, high nibble first.
    Bcd,
    /// Big-endian unsigned binary integer.
    Binary,
}

/// Framer configuration shared by encoder and decoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramerConfig {
    /// Prefix width in bytes, 1..=4.
    pub length_width: usize,
    /// Prefix encoding.
    pub length_encoding: LengthEncoding,
    /// Whether the length value includes the prefix bytes themselves.
    pub length_inclusive: bool,
    /// Largest acceptable body, in bytes.
    pub max_frame: usize,
    /// Smallest acceptable body, in bytes (MTI + primary bitmap).
    pub min_frame: usize,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            length_width: 2,
            length_encoding: LengthEncoding::Binary,
            length_inclusive: false,
            max_frame: DEFAULT_MAX_FRAME,
            min_frame: DEFAULT_MIN_FRAME,
        }
    }
}

impl FramerConfig {
    /// Largest length value representable in the configured prefix.
    fn prefix_capacity(&self) -> usize {
        match self.length_encoding {
            LengthEncoding::Ascii => 10usize.pow(self.length_width as u32) - 1,
            LengthEncoding::Bcd => 10usize.pow(2 * self.length_width as u32) - 1,
            LengthEncoding::Binary => {
                if self.length_width >= std::mem::size_of::<usize>() {
                    usize::MAX
                } else {
                    (1usize << (8 * self.length_width)) - 1
                }
            }
        }
    }
}

/// Framing failures. Length errors poison the stream position; the decoder
/// has already dropped its buffer by the time the caller sees one.
#[derive(Debug)]
pub enum FrameError {
    /// The length prefix held a byte that is not a digit in its encoding.
    BadLengthDigit(u8),
    /// Decoded length is shorter than the prefix it claims to include.
    LengthUnderflow(usize),
    /// Decoded body length falls below the protocol minimum.
    TooShort(usize),
    /// Decoded body length exceeds the configured maximum.
    TooLong(usize),
    /// The body handed to the encoder cannot be represented in the prefix.
    Unencodable(usize),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadLengthDigit(b) => write!(f, "invalid length digit 0x{b:02x}"),
            Self::LengthUnderflow(n) => write!(f, "inclusive length {n} smaller than prefix"),
            Self::TooShort(n) => write!(f, "frame body {n} bytes below protocol minimum"),
            Self::TooLong(n) => write!(f, "frame body {n} bytes above configured maximum"),
            Self::Unencodable(n) => write!(f, "body of {n} bytes does not fit the length prefix"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Encode one frame: prefix in the configured encoding, then the body.
pub fn encode_frame(config: &FramerConfig, body: &[u8]) -> Result<Vec<u8>, FrameError> {
    if body.len() > config.max_frame {
        return Err(FrameError::Unencodable(body.len()));
    }
    let value = body.len() + if config.length_inclusive { config.length_width } else { 0 };
    if value > config.prefix_capacity() {
        return Err(FrameError::Unencodable(body.len()));
    }

    let mut out = Vec::with_capacity(config.length_width + body.len());
    match config.length_encoding {
        LengthEncoding::Ascii => {
            let digits = format!("{:0width$}", value, width = config.length_width);
            out.extend_from_slice(digits.as_bytes());
        }
        LengthEncoding::Bcd => {
            let digits = format!("{:0width$}", value, width = 2 * config.length_width);
            let bytes = digits.as_bytes();
            for pair in bytes.chunks(2) {
                out.push(((pair[0] - b'0') << 4) | (pair[1] - b'0'));
            }
        }
        LengthEncoding::Binary => {
            // Byte-by-byte shift so widths other than 1/2/4 work too
            for i in (0..config.length_width).rev() {
                out.push(((value >> (8 * i)) & 0xFF) as u8);
            }
        }
    }
    out.extend_from_slice(body);
    Ok(out)
}

/// Decode a length prefix from exactly `config.length_width` bytes.
fn decode_prefix(config: &FramerConfig, prefix: &[u8]) -> Result<usize, FrameError> {
    let mut value: usize = 0;
    match config.length_encoding {
        LengthEncoding::Ascii => {
            for &b in prefix {
                if !b.is_ascii_digit() {
                    return Err(FrameError::BadLengthDigit(b));
                }
                value = value * 10 + (b - b'0') as usize;
            }
        }
        LengthEncoding::Bcd => {
            for &b in prefix {
                let hi = b >> 4;
                let lo = b & 0x0F;
                if hi > 9 || lo > 9 {
                    return Err(FrameError::BadLengthDigit(b));
                }
                value = value * 100 + (hi as usize) * 10 + lo as usize;
            }
        }
        LengthEncoding::Binary => {
            for &b in prefix {
                value = (value << 8) | b as usize;
            }
        }
    }
    Ok(value)
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and extract complete bodies.
/// Handles TCP-style byte stream reassembly: a frame split across reads is
/// buffered until its remainder arrives.
#[derive(Debug)]
pub struct FrameDecoder {
    config: FramerConfig,
    buf: BytesMut,
}

impl FrameDecoder {
    /// Create a decoder for the given framer configuration.
    pub fn new(config: FramerConfig) -> Self {
        Self {
            config,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Feed bytes into the decoder and extract all complete frame bodies.
    ///
    /// Incomplete data is buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error on an untrustworthy length prefix. The buffer has
    /// been cleared before returning: everything up to the next read is
    /// discarded, which is the only resync point available once the length
    /// framing is lost.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        let width = self.config.length_width;

        loop {
            if self.buf.len() < width {
                break;
            }

            let body_len = match self.body_len() {
                Ok(n) => n,
                Err(e) => {
                    self.buf.clear();
                    return Err(e);
                }
            };

            let total = width + body_len;
            if self.buf.len() < total {
                break; // Incomplete frame, wait for more data
            }

            self.buf.advance(width);
            frames.push(self.buf.split_to(body_len).to_vec());
        }

        Ok(frames)
    }

    /// Decode and validate the body length of the frame at the buffer head.
    fn body_len(&self) -> Result<usize, FrameError> {
        let value = decode_prefix(&self.config, &self.buf[..self.config.length_width])?;

        let body_len = if self.config.length_inclusive {
            value
                .checked_sub(self.config.length_width)
                .ok_or(FrameError::LengthUnderflow(value))?
        } else {
            value
        };

        if body_len < self.config.min_frame {
            return Err(FrameError::TooShort(body_len));
        }
        if body_len > self.config.max_frame {
            return Err(FrameError::TooLong(body_len));
        }
        Ok(body_len)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}
