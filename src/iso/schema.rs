//! Field schema driving the codec.
//!
//! A schema enumerates, per field index, how that field travels on the
//! wire: fixed or variable length, and in which character encoding. The
//! schema is construction-time configuration; there is no global
//! registry.

use std::collections::HashMap;

/// Length discipline of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Exactly this many units (characters, digits, or bytes).
    Fixed(usize),
    /// Two-digit length header, up to this many units.
    LlVar(usize),
    /// Three-digit length header, up to this many units.
    LllVar(usize),
}

impl FieldKind {
    /// Maximum number of units this field may carry.
    pub fn max_units(&self) -> usize {
        match *self {
            Self::Fixed(n) | Self::LlVar(n) | Self::LllVar(n) => n,
        }
    }
}

/// Character encoding of a field's wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    /// US-ASCII, one character per byte.
    Ascii,
    /// Packed BCD, two digits per byte, left-padded with a zero nibble.
    Bcd,
    /// Raw bytes, no interpretation.
    Binary,
    /// EBCDIC (code page 037), one character per byte.
    Ebcdic,
}

/// Wire description of one field.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    /// Length discipline.
    pub kind: FieldKind,
    /// Character encoding.
    pub charset: Charset,
    /// Name used in diagnostics.
    pub name: &'static str,
}

impl FieldSpec {
    /// Shorthand constructor.
    pub const fn new(kind: FieldKind, charset: Charset, name: &'static str) -> Self {
        Self { kind, charset, name }
    }
}

/// A schema: field index → wire description.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    specs: HashMap<u8, FieldSpec>,
}

impl Schema {
    /// An empty schema. Useful as a base for fully custom layouts.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The field layout this FEP speaks with the FISC switch: ASCII
    /// numerics and text, covering the fields the core consumes plus the
    /// common financial data elements.
    pub fn fisc() -> Self {
        use Charset::*;
        use FieldKind::*;

        let mut schema = Self::default();
        schema
            .define(2, FieldSpec::new(LlVar(19), Ascii, "primary account number"))
            .define(3, FieldSpec::new(Fixed(6), Ascii, "processing code"))
            .define(4, FieldSpec::new(Fixed(12), Ascii, "amount, transaction"))
            .define(7, FieldSpec::new(Fixed(10), Ascii, "transmission date and time"))
            .define(11, FieldSpec::new(Fixed(6), Ascii, "system trace audit number"))
            .define(12, FieldSpec::new(Fixed(6), Ascii, "time, local transaction"))
            .define(13, FieldSpec::new(Fixed(4), Ascii, "date, local transaction"))
            .define(15, FieldSpec::new(Fixed(4), Ascii, "date, settlement"))
            .define(18, FieldSpec::new(Fixed(4), Ascii, "merchant type"))
            .define(22, FieldSpec::new(Fixed(3), Ascii, "POS entry mode"))
            .define(25, FieldSpec::new(Fixed(2), Ascii, "POS condition code"))
            .define(32, FieldSpec::new(LlVar(11), Ascii, "acquiring institution id"))
            .define(33, FieldSpec::new(LlVar(11), Ascii, "forwarding institution id"))
            .define(37, FieldSpec::new(Fixed(12), Ascii, "retrieval reference number"))
            .define(38, FieldSpec::new(Fixed(6), Ascii, "authorization id response"))
            .define(39, FieldSpec::new(Fixed(2), Ascii, "response code"))
            .define(41, FieldSpec::new(Fixed(8), Ascii, "card acceptor terminal id"))
            .define(42, FieldSpec::new(Fixed(15), Ascii, "card acceptor id"))
            .define(44, FieldSpec::new(LlVar(25), Ascii, "additional response data"))
            .define(48, FieldSpec::new(LllVar(999), Ascii, "additional data, private"))
            .define(49, FieldSpec::new(Fixed(3), Ascii, "currency code, transaction"))
            .define(52, FieldSpec::new(Fixed(8), Binary, "PIN data"))
            .define(64, FieldSpec::new(Fixed(8), Binary, "message authentication code"))
            .define(70, FieldSpec::new(Fixed(3), Ascii, "network management code"))
            .define(90, FieldSpec::new(Fixed(42), Ascii, "original data elements"))
            .define(128, FieldSpec::new(Fixed(8), Binary, "message authentication code"));
        schema
    }

    /// Define or replace a field. Builder-style, chainable.
    pub fn define(&mut self, index: u8, spec: FieldSpec) -> &mut Self {
        self.specs.insert(index, spec);
        self
    }

    /// Look up a field's wire description.
    pub fn get(&self, index: u8) -> Option<&FieldSpec> {
        self.specs.get(&index)
    }

    /// Number of defined fields.
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// True when no fields are defined.
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fisc_schema_covers_core_fields() {
        let schema = Schema::fisc();
        for index in [3, 11, 32, 37, 39, 70, 90] {
            assert!(schema.get(index).is_some(), "field {index} missing");
        }
    }

    #[test]
    fn test_stan_is_fixed_six() {
        let schema = Schema::fisc();
        let spec = schema.get(11).unwrap();
        assert_eq!(spec.kind, FieldKind::Fixed(6));
        assert_eq!(spec.charset, Charset::Ascii);
    }

    #[test]
    fn test_define_replaces() {
        let mut schema = Schema::fisc();
        schema.define(11, FieldSpec::new(FieldKind::Fixed(6), Charset::Bcd, "stan"));
        assert_eq!(schema.get(11).unwrap().charset, Charset::Bcd);
    }
}
