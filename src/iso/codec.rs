//! Parse and assemble ISO 8583 message bytes.
//!
//! Wire layout of a message body (the framer has already stripped the
//! length prefix):
//!
//! ```text
//! [MTI: 4 ASCII bytes or 2 BCD bytes]
//! [primary bitmap: 8 binary bytes or 16 hex-ASCII bytes]
//! [secondary bitmap, same encoding, when primary bit 1 is set]
//! [fields in ascending index order, per schema]
//! ```
//!
//! The codec is schema-driven and strict: a bitmap that claims a field the
//! body does not carry, a non-numeric variable-length header, or contents
//! violating a field's charset all fail with `Malformed`. The one
//! configurable leniency is `skip_unknown_fields`: a bitmap-claimed field
//! with no schema entry is skipped by its two-digit length header and
//! surfaced as a warning instead of an error.

use crate::error::FepError;
use crate::iso::schema::{Charset, FieldKind, Schema};
use crate::iso::{Message, Mti};

/// Wire encoding of the MTI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtiEncoding {
    /// Four ASCII digit bytes.
    Ascii,
    /// Two bytes of packed BCD.
    Bcd,
}

/// Wire encoding of the bitmaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapEncoding {
    /// Eight raw bytes per bitmap.
    Binary,
    /// Sixteen uppercase hex characters per bitmap.
    HexAscii,
}

/// Message-level codec options.
#[derive(Debug, Clone, Copy)]
pub struct CodecConfig {
    /// MTI wire encoding.
    pub mti_encoding: MtiEncoding,
    /// Bitmap wire encoding.
    pub bitmap_encoding: BitmapEncoding,
    /// Skip bitmap-claimed fields absent from the schema (with a warning)
    /// instead of failing the whole message.
    pub skip_unknown_fields: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            mti_encoding: MtiEncoding::Ascii,
            bitmap_encoding: BitmapEncoding::Binary,
            skip_unknown_fields: false,
        }
    }
}

/// Schema-driven message codec.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    schema: Schema,
    config: CodecConfig,
}

/// Read cursor over a message body.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], FepError> {
        if self.pos + n > self.data.len() {
            return Err(FepError::Malformed(format!(
                "body truncated reading {what}: need {n} bytes, have {}",
                self.data.len() - self.pos
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

impl MessageCodec {
    /// Create a codec over a schema with the given options.
    pub fn new(schema: Schema, config: CodecConfig) -> Self {
        Self { schema, config }
    }

    /// Codec over the default FISC schema with default options.
    pub fn fisc() -> Self {
        Self::new(Schema::fisc(), CodecConfig::default())
    }

    /// The schema in use.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    // ------------------------------------------------------------------
    // Assemble
    // ------------------------------------------------------------------

    /// Assemble a message into its wire body (no length prefix).
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, FepError> {
        let mut out = Vec::with_capacity(64);

        match self.config.mti_encoding {
            MtiEncoding::Ascii => out.extend_from_slice(message.mti().to_string().as_bytes()),
            MtiEncoding::Bcd => out.extend_from_slice(&message.mti().value().to_be_bytes()),
        }

        let secondary = message.fields().any(|(i, _)| i > 64);
        let mut bitmap = [0u8; 16];
        if secondary {
            set_bit(&mut bitmap, 1);
        }
        for (index, _) in message.fields() {
            set_bit(&mut bitmap, index);
        }
        let bitmap_len = if secondary { 16 } else { 8 };
        match self.config.bitmap_encoding {
            BitmapEncoding::Binary => out.extend_from_slice(&bitmap[..bitmap_len]),
            BitmapEncoding::HexAscii => {
                for b in &bitmap[..bitmap_len] {
                    out.extend_from_slice(format!("{b:02X}").as_bytes());
                }
            }
        }

        for (index, value) in message.fields() {
            self.encode_field(index, value, &mut out)?;
        }
        Ok(out)
    }

    fn encode_field(&self, index: u8, value: &[u8], out: &mut Vec<u8>) -> Result<(), FepError> {
        let spec = self.schema.get(index).ok_or_else(|| {
            FepError::Malformed(format!("no schema entry for field {index}"))
        })?;

        let units = value.len();
        match spec.kind {
            FieldKind::Fixed(n) => {
                if units != n {
                    return Err(FepError::Malformed(format!(
                        "field {index} ({}) needs {n} units, got {units}",
                        spec.name
                    )));
                }
            }
            FieldKind::LlVar(max) => {
                if units > max.min(99) {
                    return Err(FepError::Malformed(format!(
                        "field {index} ({}) over LLVAR maximum: {units} > {}",
                        spec.name,
                        max.min(99)
                    )));
                }
                self.encode_var_header(units, 2, spec.charset, out);
            }
            FieldKind::LllVar(max) => {
                if units > max.min(999) {
                    return Err(FepError::Malformed(format!(
                        "field {index} ({}) over LLLVAR maximum: {units} > {}",
                        spec.name,
                        max.min(999)
                    )));
                }
                self.encode_var_header(units, 3, spec.charset, out);
            }
        }

        match spec.charset {
            Charset::Ascii => {
                if !value.is_ascii() {
                    return Err(FepError::Malformed(format!(
                        "field {index} ({}) contains non-ASCII bytes",
                        spec.name
                    )));
                }
                out.extend_from_slice(value);
            }
            Charset::Binary => out.extend_from_slice(value),
            Charset::Bcd => {
                out.extend_from_slice(&pack_bcd(value).ok_or_else(|| {
                    FepError::Malformed(format!(
                        "field {index} ({}) holds non-digits for BCD packing",
                        spec.name
                    ))
                })?);
            }
            Charset::Ebcdic => {
                for &b in value {
                    out.push(ebcdic_from_ascii(b).ok_or_else(|| {
                        FepError::Malformed(format!(
                            "field {index} ({}) byte 0x{b:02x} has no EBCDIC mapping",
                            spec.name
                        ))
                    })?);
                }
            }
        }
        Ok(())
    }

    /// Variable-length header: digit count in the field's own charset
    /// family: packed BCD for BCD fields, EBCDIC digits for EBCDIC
    /// fields, ASCII digits otherwise.
    fn encode_var_header(&self, units: usize, digits: usize, charset: Charset, out: &mut Vec<u8>) {
        let rendered = format!("{units:0width$}", width = digits);
        match charset {
            Charset::Bcd => {
                // One byte per digit pair, left-padded to an even count
                let padded = if digits % 2 == 1 {
                    format!("0{rendered}")
                } else {
                    rendered
                };
                out.extend_from_slice(&pack_bcd(padded.as_bytes()).expect("digits"));
            }
            Charset::Ebcdic => {
                for b in rendered.bytes() {
                    out.push(ebcdic_from_ascii(b).expect("digits map to EBCDIC"));
                }
            }
            Charset::Ascii | Charset::Binary => out.extend_from_slice(rendered.as_bytes()),
        }
    }

    // ------------------------------------------------------------------
    // Parse
    // ------------------------------------------------------------------

    /// Parse a wire body into a message plus any skip warnings.
    pub fn decode(&self, body: &[u8]) -> Result<(Message, Vec<String>), FepError> {
        let mut cursor = Cursor::new(body);
        let mut warnings = Vec::new();

        let mti = match self.config.mti_encoding {
            MtiEncoding::Ascii => {
                let raw = cursor.take(4, "MTI")?;
                let text = std::str::from_utf8(raw)
                    .map_err(|_| FepError::Malformed("MTI is not ASCII".into()))?;
                Mti::parse(text)?
            }
            MtiEncoding::Bcd => {
                let raw = cursor.take(2, "MTI")?;
                Mti::new(u16::from_be_bytes([raw[0], raw[1]]))?
            }
        };

        let primary = self.decode_bitmap(&mut cursor, "primary bitmap")?;
        let mut bitmap = [0u8; 16];
        bitmap[..8].copy_from_slice(&primary);
        if bit_set(&bitmap, 1) {
            let secondary = self.decode_bitmap(&mut cursor, "secondary bitmap")?;
            bitmap[8..].copy_from_slice(&secondary);
        }

        let mut message = Message::new(mti);
        for index in 2..=Message::MAX_FIELD {
            if !bit_set(&bitmap, index) {
                continue;
            }
            match self.schema.get(index) {
                Some(spec) => {
                    let value = self.decode_field(index, *spec, &mut cursor)?;
                    message.set(index, value);
                }
                None if self.config.skip_unknown_fields => {
                    let skipped = self.skip_unknown(index, &mut cursor)?;
                    warnings.push(format!(
                        "field {index} not in schema, skipped {skipped} bytes"
                    ));
                }
                None => {
                    return Err(FepError::Malformed(format!(
                        "bitmap claims field {index} but the schema does not define it"
                    )));
                }
            }
        }

        if cursor.remaining() > 0 {
            return Err(FepError::Malformed(format!(
                "{} trailing bytes after last bitmap field",
                cursor.remaining()
            )));
        }
        Ok((message, warnings))
    }

    fn decode_bitmap(&self, cursor: &mut Cursor<'_>, what: &str) -> Result<[u8; 8], FepError> {
        let mut out = [0u8; 8];
        match self.config.bitmap_encoding {
            BitmapEncoding::Binary => out.copy_from_slice(cursor.take(8, what)?),
            BitmapEncoding::HexAscii => {
                let raw = cursor.take(16, what)?;
                for (i, pair) in raw.chunks(2).enumerate() {
                    let hi = hex_nibble(pair[0]).ok_or_else(|| {
                        FepError::Malformed(format!("{what}: invalid hex 0x{:02x}", pair[0]))
                    })?;
                    let lo = hex_nibble(pair[1]).ok_or_else(|| {
                        FepError::Malformed(format!("{what}: invalid hex 0x{:02x}", pair[1]))
                    })?;
                    out[i] = (hi << 4) | lo;
                }
            }
        }
        Ok(out)
    }

    fn decode_field(
        &self,
        index: u8,
        spec: crate::iso::schema::FieldSpec,
        cursor: &mut Cursor<'_>,
    ) -> Result<Vec<u8>, FepError> {
        let units = match spec.kind {
            FieldKind::Fixed(n) => n,
            FieldKind::LlVar(max) => {
                let n = self.decode_var_header(index, 2, spec.charset, cursor)?;
                if n > max.min(99) {
                    return Err(FepError::Malformed(format!(
                        "field {index} ({}) header {n} over maximum {}",
                        spec.name,
                        max.min(99)
                    )));
                }
                n
            }
            FieldKind::LllVar(max) => {
                let n = self.decode_var_header(index, 3, spec.charset, cursor)?;
                if n > max.min(999) {
                    return Err(FepError::Malformed(format!(
                        "field {index} ({}) header {n} over maximum {}",
                        spec.name,
                        max.min(999)
                    )));
                }
                n
            }
        };

        let what = spec.name;
        match spec.charset {
            Charset::Ascii => {
                let raw = cursor.take(units, what)?;
                if !raw.is_ascii() {
                    return Err(FepError::Malformed(format!(
                        "field {index} ({what}) contains non-ASCII bytes"
                    )));
                }
                Ok(raw.to_vec())
            }
            Charset::Binary => Ok(cursor.take(units, what)?.to_vec()),
            Charset::Bcd => {
                let raw = cursor.take(units.div_ceil(2), what)?;
                unpack_bcd(raw, units).ok_or_else(|| {
                    FepError::Malformed(format!("field {index} ({what}) has a BCD nibble above 9"))
                })
            }
            Charset::Ebcdic => {
                let raw = cursor.take(units, what)?;
                raw.iter()
                    .map(|&b| {
                        ascii_from_ebcdic(b).ok_or_else(|| {
                            FepError::Malformed(format!(
                                "field {index} ({what}) byte 0x{b:02x} is not EBCDIC text"
                            ))
                        })
                    })
                    .collect()
            }
        }
    }

    fn decode_var_header(
        &self,
        index: u8,
        digits: usize,
        charset: Charset,
        cursor: &mut Cursor<'_>,
    ) -> Result<usize, FepError> {
        let rendered: Vec<u8> = match charset {
            Charset::Bcd => {
                let bytes = cursor.take(digits.div_ceil(2), "length header")?;
                unpack_bcd(bytes, if digits % 2 == 1 { digits + 1 } else { digits })
                    .ok_or_else(|| {
                        FepError::Malformed(format!("field {index} length header bad BCD"))
                    })?
            }
            Charset::Ebcdic => cursor
                .take(digits, "length header")?
                .iter()
                .map(|&b| {
                    ascii_from_ebcdic(b).ok_or_else(|| {
                        FepError::Malformed(format!("field {index} length header not EBCDIC"))
                    })
                })
                .collect::<Result<_, _>>()?,
            Charset::Ascii | Charset::Binary => cursor.take(digits, "length header")?.to_vec(),
        };

        let mut value = 0usize;
        for &b in &rendered {
            if !b.is_ascii_digit() {
                return Err(FepError::Malformed(format!(
                    "field {index} length header byte 0x{b:02x} is not a digit"
                )));
            }
            value = value * 10 + (b - b'0') as usize;
        }
        Ok(value)
    }

    /// Skip an unknown field by its assumed two-digit ASCII length header.
    fn skip_unknown(&self, index: u8, cursor: &mut Cursor<'_>) -> Result<usize, FepError> {
        let header = cursor.take(2, "unknown field header")?;
        if !header.iter().all(u8::is_ascii_digit) {
            return Err(FepError::Malformed(format!(
                "field {index} unknown and its length header is not numeric"
            )));
        }
        let len = ((header[0] - b'0') * 10 + (header[1] - b'0')) as usize;
        cursor.take(len, "unknown field body")?;
        Ok(len)
    }
}

/// Set bit `index` (1-based, field numbering) in a bitmap.
fn set_bit(bitmap: &mut [u8; 16], index: u8) {
    let i = (index - 1) as usize;
    bitmap[i / 8] |= 0x80 >> (i % 8);
}

/// Test bit `index` (1-based) in a bitmap.
fn bit_set(bitmap: &[u8; 16], index: u8) -> bool {
    let i = (index - 1) as usize;
    bitmap[i / 8] & (0x80 >> (i % 8)) != 0
}

/// Pack ASCII digits into BCD, left-padding odd counts with a zero nibble.
/// Returns None on a non-digit byte.
fn pack_bcd(digits: &[u8]) -> Option<Vec<u8>> {
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let mut out = Vec::with_capacity(digits.len().div_ceil(2));
    let odd = digits.len() % 2 == 1;
    let mut nibbles = Vec::with_capacity(digits.len() + 1);
    if odd {
        nibbles.push(0);
    }
    nibbles.extend(digits.iter().map(|d| d - b'0'));
    for pair in nibbles.chunks(2) {
        out.push((pair[0] << 4) | pair[1]);
    }
    Some(out)
}

/// Unpack BCD into `units` ASCII digits, dropping the pad nibble of an odd
/// count. Returns None on a nibble above 9.
fn unpack_bcd(bytes: &[u8], units: usize) -> Option<Vec<u8>> {
    let mut digits = Vec::with_capacity(units);
    for &b in bytes {
        let hi = b >> 4;
        let lo = b & 0x0F;
        if hi > 9 || lo > 9 {
            return None;
        }
        digits.push(b'0' + hi);
        digits.push(b'0' + lo);
    }
    // Odd unit counts carry a leading pad nibble
    Some(digits[digits.len() - units..].to_vec())
}

fn hex_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'A'..=b'F' => Some(b - b'A' + 10),
        b'a'..=b'f' => Some(b - b'a' + 10),
        _ => None,
    }
}

/// ASCII → EBCDIC (code page 037), text subset.
fn ebcdic_from_ascii(b: u8) -> Option<u8> {
    Some(match b {
        b'0'..=b'9' => 0xF0 + (b - b'0'),
        b'A'..=b'I' => 0xC1 + (b - b'A'),
        b'J'..=b'R' => 0xD1 + (b - b'J'),
        b'S'..=b'Z' => 0xE2 + (b - b'S'),
        b'a'..=b'i' => 0x81 + (b - b'a'),
        b'j'..=b'r' => 0x91 + (b - b'j'),
        b's'..=b'z' => 0xA2 + (b - b's'),
        b' ' => 0x40,
        b'.' => 0x4B,
        b'<' => 0x4C,
        b'(' => 0x4D,
        b'+' => 0x4E,
        b'&' => 0x50,
        b'$' => 0x5B,
        b'*' => 0x5C,
        b')' => 0x5D,
        b';' => 0x5E,
        b'-' => 0x60,
        b'/' => 0x61,
        b',' => 0x6B,
        b'%' => 0x6C,
        b'_' => 0x6D,
        b'>' => 0x6E,
        b'?' => 0x6F,
        b':' => 0x7A,
        b'#' => 0x7B,
        b'@' => 0x7C,
        b'\'' => 0x7D,
        b'=' => 0x7E,
        b'"' => 0x7F,
        _ => return None,
    })
}

/// EBCDIC (code page 037) → ASCII, text subset.
fn ascii_from_ebcdic(b: u8) -> Option<u8> {
    Some(match b {
        0xF0..=0xF9 => b'0' + (b - 0xF0),
        0xC1..=0xC9 => b'A' + (b - 0xC1),
        0xD1..=0xD9 => b'J' + (b - 0xD1),
        0xE2..=0xE9 => b'S' + (b - 0xE2),
        0x81..=0x89 => b'a' + (b - 0x81),
        0x91..=0x99 => b'j' + (b - 0x91),
        0xA2..=0xA9 => b's' + (b - 0xA2),
        0x40 => b' ',
        0x4B => b'.',
        0x4C => b'<',
        0x4D => b'(',
        0x4E => b'+',
        0x50 => b'&',
        0x5B => b'$',
        0x5C => b'*',
        0x5D => b')',
        0x5E => b';',
        0x60 => b'-',
        0x61 => b'/',
        0x6B => b',',
        0x6C => b'%',
        0x6D => b'_',
        0x6E => b'>',
        0x6F => b'?',
        0x7A => b':',
        0x7B => b'#',
        0x7C => b'@',
        0x7D => b'\'',
        0x7E => b'=',
        0x7F => b'"',
        _ => return None,
    })
}
