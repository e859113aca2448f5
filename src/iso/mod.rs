//! ISO 8583 message model.
//!
//! A message is a four-digit MTI plus a sparse map from field index to
//! value. The core interprets only a handful of fields; everything else
//! passes through untouched:
//!
//! | Field | Purpose                                             |
//! |-------|-----------------------------------------------------|
//! | 3     | processing code                                     |
//! | 11    | STAN, the six-digit correlation id                  |
//! | 32    | acquiring institution id (server-side routing key)  |
//! | 37    | retrieval reference number                          |
//! | 39    | response code ("00" = approved)                     |
//! | 70    | network management code (001/002/301)               |
//!
//! In-memory values are the logical form (ASCII digits, text, or raw
//! bytes); the wire form (BCD packing, EBCDIC, length headers) is the
//! codec's business.

pub mod codec;
pub mod schema;

pub use codec::{BitmapEncoding, CodecConfig, MessageCodec, MtiEncoding};
pub use schema::{Charset, FieldKind, FieldSpec, Schema};

use std::collections::BTreeMap;

use crate::error::FepError;

/// Field indices the core reads or writes.
pub mod field {
    /// Processing code.
    pub const PROCESSING_CODE: u8 = 3;
    /// Transaction amount.
    pub const AMOUNT: u8 = 4;
    /// Transmission date and time, MMDDhhmmss.
    pub const TRANSMISSION_DATETIME: u8 = 7;
    /// System trace audit number.
    pub const STAN: u8 = 11;
    /// Acquiring institution identification code.
    pub const ACQUIRING_INSTITUTION: u8 = 32;
    /// Retrieval reference number.
    pub const RRN: u8 = 37;
    /// Response code.
    pub const RESPONSE_CODE: u8 = 39;
    /// Network management information code.
    pub const NETWORK_MANAGEMENT_CODE: u8 = 70;
    /// Original data elements (reversals).
    pub const ORIGINAL_DATA: u8 = 90;
}

/// Message type indicator: four decimal digits, one per nibble, so that
/// `0x0200` reads as "0200" and response construction is `+ 0x0010`.
///
/// Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mti(u16);

impl Mti {
    /// Authorization request.
    pub const AUTHORIZATION_REQUEST: Mti = Mti(0x0100);
    /// Financial request.
    pub const FINANCIAL_REQUEST: Mti = Mti(0x0200);
    /// Reversal request.
    pub const REVERSAL_REQUEST: Mti = Mti(0x0400);
    /// Network management request (sign-on / sign-off / echo).
    pub const NETWORK_MANAGEMENT_REQUEST: Mti = Mti(0x0800);
    /// Network management response.
    pub const NETWORK_MANAGEMENT_RESPONSE: Mti = Mti(0x0810);

    /// Build an MTI from a nibble-packed value like `0x0200`.
    ///
    /// # Errors
    ///
    /// Fails if any nibble is not a decimal digit.
    pub fn new(value: u16) -> Result<Self, FepError> {
        for shift in [12, 8, 4, 0] {
            if (value >> shift) & 0xF > 9 {
                return Err(FepError::Malformed(format!(
                    "MTI nibble above 9 in {value:#06x}"
                )));
            }
        }
        Ok(Self(value))
    }

    /// Parse a four-digit string such as "0200".
    pub fn parse(s: &str) -> Result<Self, FepError> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 || !bytes.iter().all(u8::is_ascii_digit) {
            return Err(FepError::Malformed(format!("MTI must be 4 digits, got {s:?}")));
        }
        let mut value = 0u16;
        for &b in bytes {
            value = (value << 4) | (b - b'0') as u16;
        }
        Ok(Self(value))
    }

    /// The nibble-packed value.
    pub fn value(&self) -> u16 {
        self.0
    }

    /// The four digits, most significant first.
    pub fn digits(&self) -> [u8; 4] {
        [
            ((self.0 >> 12) & 0xF) as u8,
            ((self.0 >> 8) & 0xF) as u8,
            ((self.0 >> 4) & 0xF) as u8,
            (self.0 & 0xF) as u8,
        ]
    }

    /// The matching response MTI: function digit incremented, 0200 → 0210.
    pub fn response(&self) -> Mti {
        Mti(self.0 + 0x0010)
    }

    /// True for request-class MTIs (even function digit).
    pub fn is_request(&self) -> bool {
        (self.0 >> 4) & 0x1 == 0
    }

    /// True for network-management messages (0800/0810).
    pub fn is_network_management(&self) -> bool {
        (self.0 >> 8) & 0xF == 8
    }
}

impl std::fmt::Display for Mti {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let d = self.digits();
        write!(f, "{}{}{}{}", d[0], d[1], d[2], d[3])
    }
}

impl std::str::FromStr for Mti {
    type Err = FepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mti::parse(s)
    }
}

/// An ISO 8583 message: MTI plus sparse field map.
///
/// Field indices run 2..=128; index 1 is the secondary bitmap and is
/// managed by the codec, never stored here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    mti: Mti,
    fields: BTreeMap<u8, Vec<u8>>,
}

impl Message {
    /// Smallest settable field index.
    pub const MIN_FIELD: u8 = 2;
    /// Largest settable field index (secondary bitmap range).
    pub const MAX_FIELD: u8 = 128;

    /// Create an empty message with the given MTI.
    pub fn new(mti: Mti) -> Self {
        Self {
            mti,
            fields: BTreeMap::new(),
        }
    }

    /// The message type indicator.
    pub fn mti(&self) -> Mti {
        self.mti
    }

    /// Set a field to raw bytes. Panics on an index outside 2..=128;
    /// indices are compile-time constants in practice, not user input.
    pub fn set(&mut self, index: u8, value: impl Into<Vec<u8>>) -> &mut Self {
        assert!(
            (Self::MIN_FIELD..=Self::MAX_FIELD).contains(&index),
            "field index {index} outside 2..=128"
        );
        self.fields.insert(index, value.into());
        self
    }

    /// Set a field from a string slice.
    pub fn set_str(&mut self, index: u8, value: &str) -> &mut Self {
        self.set(index, value.as_bytes().to_vec())
    }

    /// Raw bytes of a field, if present.
    pub fn get(&self, index: u8) -> Option<&[u8]> {
        self.fields.get(&index).map(Vec::as_slice)
    }

    /// String view of a field, if present and valid UTF-8.
    pub fn get_str(&self, index: u8) -> Option<&str> {
        self.get(index).and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Whether a field is present.
    pub fn has(&self, index: u8) -> bool {
        self.fields.contains_key(&index)
    }

    /// Remove a field, returning its previous value.
    pub fn remove(&mut self, index: u8) -> Option<Vec<u8>> {
        self.fields.remove(&index)
    }

    /// Iterate fields in ascending index order.
    pub fn fields(&self) -> impl Iterator<Item = (u8, &[u8])> {
        self.fields.iter().map(|(&i, v)| (i, v.as_slice()))
    }

    /// Number of fields present.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// The STAN (field 11) as its six-digit string.
    pub fn stan(&self) -> Option<&str> {
        self.get_str(field::STAN)
    }

    /// Set the STAN from a numeric value, zero-padded to six digits.
    pub fn set_stan(&mut self, stan: u32) -> &mut Self {
        self.set_str(field::STAN, &format!("{:06}", stan % crate::constants::STAN_MODULUS))
    }

    /// The response code (field 39), if present.
    pub fn response_code(&self) -> Option<&str> {
        self.get_str(field::RESPONSE_CODE)
    }

    /// Set the response code (field 39).
    pub fn set_response_code(&mut self, code: &str) -> &mut Self {
        self.set_str(field::RESPONSE_CODE, code)
    }

    /// The network management code (field 70), if present.
    pub fn network_code(&self) -> Option<&str> {
        self.get_str(field::NETWORK_MANAGEMENT_CODE)
    }

    /// The acquiring institution id (field 32), if present.
    pub fn institution_id(&self) -> Option<&str> {
        self.get_str(field::ACQUIRING_INSTITUTION)
    }

    /// Build the response skeleton for a request.
    ///
    /// MTI gains 0x0010; fields 7 (transmission datetime), 11 (STAN) and
    /// 37 (RRN) are copied verbatim when the request carries them. The
    /// response code is left unset; that is the caller's decision.
    pub fn response_to(request: &Message) -> Message {
        let mut response = Message::new(request.mti.response());
        for index in [field::TRANSMISSION_DATETIME, field::STAN, field::RRN] {
            if let Some(value) = request.get(index) {
                response.set(index, value.to_vec());
            }
        }
        response
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MTI {}", self.mti)?;
        if let Some(stan) = self.stan() {
            write!(f, " STAN {stan}")?;
        }
        write!(f, " ({} fields)", self.fields.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mti_parse_and_display() {
        let mti = Mti::parse("0200").unwrap();
        assert_eq!(mti.value(), 0x0200);
        assert_eq!(mti.to_string(), "0200");
    }

    #[test]
    fn test_mti_rejects_non_digits() {
        assert!(Mti::parse("02A0").is_err());
        assert!(Mti::parse("020").is_err());
        assert!(Mti::new(0x02A0).is_err());
    }

    #[test]
    fn test_mti_response_increments_function() {
        assert_eq!(Mti::parse("0200").unwrap().response().to_string(), "0210");
        assert_eq!(Mti::parse("0400").unwrap().response().to_string(), "0410");
        assert_eq!(Mti::parse("0800").unwrap().response().to_string(), "0810");
        assert_eq!(Mti::parse("0100").unwrap().response().to_string(), "0110");
    }

    #[test]
    fn test_mti_request_classification() {
        assert!(Mti::parse("0200").unwrap().is_request());
        assert!(!Mti::parse("0210").unwrap().is_request());
        assert!(Mti::parse("0800").unwrap().is_network_management());
        assert!(!Mti::parse("0200").unwrap().is_network_management());
    }

    #[test]
    fn test_response_copies_trace_fields() {
        let mut request = Message::new(Mti::FINANCIAL_REQUEST);
        request
            .set_str(field::TRANSMISSION_DATETIME, "0701120000")
            .set_stan(42)
            .set_str(field::RRN, "000000000042")
            .set_str(field::AMOUNT, "000000010000");

        let response = Message::response_to(&request);
        assert_eq!(response.mti().to_string(), "0210");
        assert_eq!(response.stan(), Some("000042"));
        assert_eq!(response.get_str(field::RRN), Some("000000000042"));
        assert_eq!(response.get_str(field::TRANSMISSION_DATETIME), Some("0701120000"));
        // Non-trace fields are not copied, and F39 stays unset
        assert!(!response.has(field::AMOUNT));
        assert!(response.response_code().is_none());
    }

    #[test]
    fn test_stan_wraps_to_six_digits() {
        let mut msg = Message::new(Mti::FINANCIAL_REQUEST);
        msg.set_stan(1_000_001);
        assert_eq!(msg.stan(), Some("000001"));
    }

    #[test]
    #[should_panic(expected = "outside 2..=128")]
    fn test_field_one_is_reserved() {
        Message::new(Mti::FINANCIAL_REQUEST).set(1, vec![0]);
    }

    #[test]
    fn test_fields_iterate_in_order() {
        let mut msg = Message::new(Mti::FINANCIAL_REQUEST);
        msg.set_str(70, "301").set_str(3, "000000").set_str(11, "000001");
        let indices: Vec<u8> = msg.fields().map(|(i, _)| i).collect();
        assert_eq!(indices, vec![3, 11, 70]);
    }
}
