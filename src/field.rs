//! Field schemas and the field decoder.
//!
//! A [`FieldSchema`] describes where a field lives inside an event payload.
//! [`decode`] turns the payload bytes at that location into a [`Value`],
//! correcting for the capture's byte order. [`encode`] is the inverse for the
//! fixed-layout kinds.

use std::fmt;

use serde::Serialize;

use crate::endian::Endianness;
use crate::error::DecodeError;

/// How a field's bytes are laid out and interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// A 1, 2, 4 or 8 byte integer.
    Integer,
    /// `char name[N]`: NUL-terminated text inside a fixed-size slot.
    FixedString,
    /// Any other fixed-size array or opaque blob.
    FixedBytes,
    /// `__data_loc char[]` / `__rel_loc char[]`: text stored elsewhere in the
    /// record, addressed by a 32-bit (length << 16 | offset) descriptor.
    DynamicString { relative: bool },
    /// Dynamic array of non-char elements.
    DynamicBytes { relative: bool },
}

impl FieldKind {
    /// Classify a field from its declared C type.
    ///
    /// `array` is true when the declaration carried a `[N]` suffix.
    pub fn classify(type_name: &str, array: bool, size: usize) -> Self {
        let is_char = type_name.split_whitespace().any(|t| t == "char" || t == "char[]");
        if type_name.starts_with("__data_loc") {
            return if is_char {
                FieldKind::DynamicString { relative: false }
            } else {
                FieldKind::DynamicBytes { relative: false }
            };
        }
        if type_name.starts_with("__rel_loc") {
            return if is_char {
                FieldKind::DynamicString { relative: true }
            } else {
                FieldKind::DynamicBytes { relative: true }
            };
        }
        if array {
            return if is_char {
                FieldKind::FixedString
            } else {
                FieldKind::FixedBytes
            };
        }
        match size {
            1 | 2 | 4 | 8 => FieldKind::Integer,
            _ => FieldKind::FixedBytes,
        }
    }

    pub fn is_string(self) -> bool {
        matches!(
            self,
            FieldKind::FixedString | FieldKind::DynamicString { .. }
        )
    }

    pub fn is_dynamic(self) -> bool {
        matches!(
            self,
            FieldKind::DynamicString { .. } | FieldKind::DynamicBytes { .. }
        )
    }
}

/// One field of an event's payload layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldSchema {
    pub name: String,
    /// Declared C type, e.g. `unsigned short` or `__data_loc char[]`.
    pub type_name: String,
    pub offset: usize,
    pub size: usize,
    pub signed: bool,
    pub kind: FieldKind,
}

impl FieldSchema {
    /// Fields shared by every event (`common_type`, `common_pid`, ...).
    pub fn is_common(&self) -> bool {
        self.name.starts_with("common_")
    }

    /// End of the field's slot within the payload.
    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    /// A zero-sized array such as `char buf[]` holds the rest of the record.
    pub fn is_trailing(&self) -> bool {
        self.size == 0 && matches!(self.kind, FieldKind::FixedString | FieldKind::FixedBytes)
    }

    fn slot<'a>(&self, payload: &'a [u8]) -> Result<&'a [u8], DecodeError> {
        let end = if self.is_trailing() {
            payload.len().max(self.offset)
        } else {
            self.end()
        };
        payload
            .get(self.offset..end)
            .ok_or_else(|| DecodeError::Truncated {
                field: self.name.clone(),
                start: self.offset,
                end,
                len: payload.len(),
            })
    }

    fn slot_mut<'a>(&self, payload: &'a mut [u8]) -> Result<&'a mut [u8], DecodeError> {
        let len = payload.len();
        let end = self.end();
        payload
            .get_mut(self.offset..end)
            .ok_or_else(|| DecodeError::Truncated {
                field: self.name.clone(),
                start: self.offset,
                end,
                len,
            })
    }
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Signed(i64),
    Unsigned(u64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Signed(_) | Value::Unsigned(_))
    }

    /// Integer view of a numeric value; `None` for strings and byte arrays.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Signed(v) => Some(v),
            Value::Unsigned(v) => Some(v as i64),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::Signed(v) => Some(v as u64),
            Value::Unsigned(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Signed(v) => Some(v as f64),
            Value::Unsigned(v) => Some(v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Signed(v) => write!(f, "{v}"),
            Value::Unsigned(v) => write!(f, "{v}"),
            Value::Str(s) => f.write_str(s),
            Value::Bytes(b) => {
                f.write_str("[")?;
                for (i, byte) in b.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{byte:02x}")?;
                }
                f.write_str("]")
            }
        }
    }
}

fn text_until_nul(field: &FieldSchema, bytes: &[u8]) -> Result<String, DecodeError> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end])
        .map(str::to_string)
        .map_err(|_| DecodeError::InvalidText {
            field: field.name.clone(),
        })
}

/// Return the bytes a field refers to.
///
/// For fixed kinds this is the field's slot; for dynamic kinds the
/// descriptor is resolved and the referenced bytes returned instead.
pub fn field_data<'a>(
    field: &FieldSchema,
    payload: &'a [u8],
    endian: Endianness,
) -> Result<&'a [u8], DecodeError> {
    let slot = field.slot(payload)?;
    let relative = match field.kind {
        FieldKind::DynamicString { relative } | FieldKind::DynamicBytes { relative } => relative,
        _ => return Ok(slot),
    };

    let descriptor = endian
        .read_uint(slot)
        .ok_or_else(|| DecodeError::TypeMismatch {
            field: field.name.clone(),
        })?;
    let mut start = (descriptor & 0xffff) as usize;
    let len = ((descriptor >> 16) & 0xffff) as usize;
    if relative {
        start += field.end();
    }
    payload
        .get(start..start + len)
        .ok_or_else(|| DecodeError::Truncated {
            field: field.name.clone(),
            start,
            end: start + len,
            len: payload.len(),
        })
}

/// Decode one field of `payload`.
pub fn decode(
    field: &FieldSchema,
    payload: &[u8],
    endian: Endianness,
) -> Result<Value, DecodeError> {
    match field.kind {
        FieldKind::Integer => {
            let slot = field.slot(payload)?;
            let raw = endian
                .read_uint(slot)
                .ok_or_else(|| DecodeError::TypeMismatch {
                    field: field.name.clone(),
                })?;
            if field.signed {
                let shift = 64 - (field.size as u32 * 8);
                Ok(Value::Signed(((raw << shift) as i64) >> shift))
            } else {
                Ok(Value::Unsigned(raw))
            }
        }
        FieldKind::FixedString | FieldKind::DynamicString { .. } => {
            let bytes = field_data(field, payload, endian)?;
            text_until_nul(field, bytes).map(Value::Str)
        }
        FieldKind::FixedBytes | FieldKind::DynamicBytes { .. } => {
            field_data(field, payload, endian).map(|b| Value::Bytes(b.to_vec()))
        }
    }
}

/// Write `value` into the field's slot of `payload`.
///
/// Only fixed-layout kinds can be encoded; dynamic fields would need the
/// record to be re-laid out.
pub fn encode(
    field: &FieldSchema,
    value: &Value,
    payload: &mut [u8],
    endian: Endianness,
) -> Result<(), DecodeError> {
    let mismatch = || DecodeError::TypeMismatch {
        field: field.name.clone(),
    };
    if field.is_trailing() {
        return Err(DecodeError::NotEncodable {
            field: field.name.clone(),
        });
    }
    match (field.kind, value) {
        (FieldKind::Integer, Value::Signed(_) | Value::Unsigned(_)) => {
            let raw = value.as_u64().ok_or_else(mismatch)?;
            let slot = field.slot_mut(payload)?;
            if endian.write_uint(raw, slot) {
                Ok(())
            } else {
                Err(mismatch())
            }
        }
        (FieldKind::FixedString, Value::Str(s)) => {
            if s.len() > field.size {
                return Err(mismatch());
            }
            let slot = field.slot_mut(payload)?;
            slot.fill(0);
            slot[..s.len()].copy_from_slice(s.as_bytes());
            Ok(())
        }
        (FieldKind::FixedBytes, Value::Bytes(b)) => {
            if b.len() != field.size {
                return Err(mismatch());
            }
            field.slot_mut(payload)?.copy_from_slice(b);
            Ok(())
        }
        (FieldKind::DynamicString { .. } | FieldKind::DynamicBytes { .. }, _) => {
            Err(DecodeError::NotEncodable {
                field: field.name.clone(),
            })
        }
        _ => Err(mismatch()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, type_name: &str, offset: usize, size: usize, signed: bool) -> FieldSchema {
        // Tests only declare char arrays.
        let array = type_name == "char" && size > 1;
        FieldSchema {
            name: name.to_string(),
            type_name: type_name.to_string(),
            offset,
            size,
            signed,
            kind: FieldKind::classify(type_name, array, size),
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(FieldKind::classify("int", false, 4), FieldKind::Integer);
        assert_eq!(FieldKind::classify("char", true, 16), FieldKind::FixedString);
        assert_eq!(
            FieldKind::classify("unsigned long", true, 48),
            FieldKind::FixedBytes
        );
        assert_eq!(
            FieldKind::classify("__data_loc char[]", false, 4),
            FieldKind::DynamicString { relative: false }
        );
        assert_eq!(
            FieldKind::classify("__rel_loc char[]", false, 4),
            FieldKind::DynamicString { relative: true }
        );
        assert_eq!(
            FieldKind::classify("__data_loc u8[]", false, 4),
            FieldKind::DynamicBytes { relative: false }
        );
        assert_eq!(
            FieldKind::classify("struct foo", false, 12),
            FieldKind::FixedBytes
        );
    }

    #[test]
    fn test_decode_integers_both_orders() {
        let payload = [0xff, 0xfe, 0x00, 0x01];
        let short = field("value", "short", 0, 2, true);
        assert_eq!(
            decode(&short, &payload, Endianness::Little).unwrap(),
            Value::Signed(-257)
        );
        assert_eq!(
            decode(&short, &payload, Endianness::Big).unwrap(),
            Value::Signed(-2)
        );

        let word = field("word", "unsigned int", 0, 4, false);
        assert_eq!(
            decode(&word, &payload, Endianness::Big).unwrap(),
            Value::Unsigned(0xfffe_0001)
        );
    }

    #[test]
    fn test_decode_out_of_bounds_is_truncated() {
        let payload = [0u8; 6];
        let f = field("pid", "int", 4, 4, true);
        let err = decode(&f, &payload, Endianness::Little).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                field: "pid".to_string(),
                start: 4,
                end: 8,
                len: 6,
            }
        );
    }

    #[test]
    fn test_decode_fixed_string_stops_at_nul() {
        let mut payload = vec![0u8; 16];
        payload[..4].copy_from_slice(b"bash");
        payload[5] = b'x';
        let f = field("comm", "char", 0, 16, false);
        assert_eq!(
            decode(&f, &payload, Endianness::Little).unwrap(),
            Value::Str("bash".to_string())
        );
    }

    #[test]
    fn test_decode_invalid_text() {
        let payload = [0xc3, 0x28, 0, 0];
        let f = field("comm", "char", 0, 4, false);
        assert!(matches!(
            decode(&f, &payload, Endianness::Little),
            Err(DecodeError::InvalidText { .. })
        ));
    }

    #[test]
    fn test_decode_dynamic_string() {
        // Descriptor at offset 0: len 6 << 16 | offset 8.
        let mut payload = vec![0u8; 16];
        payload[..4].copy_from_slice(&((6u32 << 16) | 8).to_le_bytes());
        payload[8..14].copy_from_slice(b"hello\0");
        let f = field("msg", "__data_loc char[]", 0, 4, false);

        let first = decode(&f, &payload, Endianness::Little).unwrap();
        let second = decode(&f, &payload, Endianness::Little).unwrap();
        assert_eq!(first, Value::Str("hello".to_string()));
        assert_eq!(first, second);
    }

    #[test]
    fn test_decode_relative_dynamic_string() {
        // __rel_loc offsets are counted from the end of the descriptor field.
        let mut payload = vec![0u8; 12];
        payload[..4].copy_from_slice(&((3u32 << 16) | 2).to_be_bytes());
        payload[6..9].copy_from_slice(b"abc");
        let f = field("name", "__rel_loc char[]", 0, 4, false);
        assert_eq!(
            decode(&f, &payload, Endianness::Big).unwrap(),
            Value::Str("abc".to_string())
        );
    }

    #[test]
    fn test_decode_dynamic_out_of_bounds() {
        let mut payload = vec![0u8; 8];
        payload[..4].copy_from_slice(&((16u32 << 16) | 4).to_le_bytes());
        let f = field("msg", "__data_loc char[]", 0, 4, false);
        assert!(matches!(
            decode(&f, &payload, Endianness::Little),
            Err(DecodeError::Truncated { start: 4, end: 20, .. })
        ));
    }

    fn flexible(name: &str, type_name: &str, offset: usize) -> FieldSchema {
        FieldSchema {
            name: name.to_string(),
            type_name: type_name.to_string(),
            offset,
            size: 0,
            signed: false,
            kind: FieldKind::classify(type_name, true, 0),
        }
    }

    #[test]
    fn test_decode_flexible_char_array_reads_rest_of_record() {
        let mut payload = vec![0u8; 16];
        payload.extend_from_slice(b"hello world\n\0\0\0");
        let buf = flexible("buf", "char", 16);
        assert!(buf.is_trailing());
        assert_eq!(
            decode(&buf, &payload, Endianness::Little).unwrap(),
            Value::Str("hello world\n".to_string())
        );
    }

    #[test]
    fn test_decode_flexible_byte_array() {
        let payload = [0u8, 0, 0, 0, 0, 0, 0, 0, 1, 2, 3];
        let buf = flexible("buf", "u32", 8);
        assert_eq!(
            decode(&buf, &payload, Endianness::Little).unwrap(),
            Value::Bytes(vec![1, 2, 3])
        );
        // Nothing after the fixed part is an empty array, not an error.
        assert_eq!(
            decode(&buf, &payload[..8], Endianness::Little).unwrap(),
            Value::Bytes(Vec::new())
        );
        assert!(matches!(
            decode(&buf, &payload[..4], Endianness::Little),
            Err(DecodeError::Truncated { start: 8, .. })
        ));
    }

    #[test]
    fn test_encode_rejects_flexible_array() {
        let mut payload = vec![0u8; 24];
        let buf = flexible("buf", "char", 16);
        assert!(matches!(
            encode(&buf, &Value::Str(String::new()), &mut payload, Endianness::Little),
            Err(DecodeError::NotEncodable { .. })
        ));
    }

    #[test]
    fn test_value_coercions() {
        assert_eq!(Value::Signed(-1).as_i64(), Some(-1));
        assert_eq!(Value::Unsigned(7).as_f64(), Some(7.0));
        assert_eq!(Value::Str("x".to_string()).as_i64(), None);
        assert_eq!(Value::Bytes(vec![1]).as_u64(), None);
        assert_eq!(Value::Bytes(vec![1, 0xab]).to_string(), "[01,ab]");
    }

    #[test]
    fn test_encode_roundtrip_fixed_fields() {
        let fields = [
            field("common_type", "unsigned short", 0, 2, false),
            field("common_pid", "int", 4, 4, true),
            field("comm", "char", 8, 8, false),
            field("delta", "long", 16, 8, true),
        ];
        let mut original = vec![0u8; 24];
        original[..2].copy_from_slice(&0x1234u16.to_be_bytes());
        original[4..8].copy_from_slice(&(-5i32).to_be_bytes());
        original[8..12].copy_from_slice(b"init");
        original[16..24].copy_from_slice(&(-1_000_000i64).to_be_bytes());

        let mut rebuilt = vec![0u8; original.len()];
        for f in &fields {
            let value = decode(f, &original, Endianness::Big).unwrap();
            encode(f, &value, &mut rebuilt, Endianness::Big).unwrap();
        }
        assert_eq!(rebuilt, original);
    }

    #[test]
    fn test_encode_rejects_dynamic_and_mismatch() {
        let mut payload = vec![0u8; 8];
        let dynamic = field("msg", "__data_loc char[]", 0, 4, false);
        assert!(matches!(
            encode(&dynamic, &Value::Str("x".into()), &mut payload, Endianness::Little),
            Err(DecodeError::NotEncodable { .. })
        ));
        let int = field("pid", "int", 0, 4, true);
        assert!(matches!(
            encode(&int, &Value::Str("x".into()), &mut payload, Endianness::Little),
            Err(DecodeError::TypeMismatch { .. })
        ));
    }
}
