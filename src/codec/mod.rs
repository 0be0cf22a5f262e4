//! Register map codec.
//!
//! Turns a raw controller block into scaled field values and module status
//! records, one field at a time. A field that cannot be decoded is reported
//! and left out; its siblings are still decoded.

mod status;

pub use status::*;

use crate::layout::{Encoding, FieldDescriptor};

use std::collections::BTreeMap;
use thiserror::Error;

/// Field-scoped decode errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FieldError {
    #[error("field {field}: needs bytes {offset}..{end} but block has {len}")]
    OutOfRange {
        field: String,
        offset: usize,
        end: usize,
        len: usize,
    },
    #[error("field {field}: {encoding:?} cannot be read from {width} bytes")]
    WidthMismatch {
        field: String,
        encoding: Encoding,
        width: usize,
    },
    #[error("field {field}: value is not a finite number")]
    NotFinite { field: String },
}

/// Result of decoding one device's fields from a block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedBlock {
    pub block_id: u16,
    pub fields: BTreeMap<String, f64>,
    pub status: BTreeMap<String, ModuleStatus>,
    pub errors: Vec<FieldError>,
}

/// A single decoded field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Number(f64),
    Status(ModuleStatus),
}

/// Decode every field of `layout` from `raw`.
pub fn decode(block_id: u16, raw: &[u8], layout: &[FieldDescriptor]) -> DecodedBlock {
    let mut decoded = DecodedBlock {
        block_id,
        ..Default::default()
    };

    for field in layout {
        match decode_field(raw, field) {
            Ok(FieldValue::Number(v)) => {
                decoded.fields.insert(field.name.clone(), v);
            }
            Ok(FieldValue::Status(s)) => {
                decoded.status.insert(field.name.clone(), s);
            }
            Err(e) => decoded.errors.push(e),
        }
    }

    decoded
}

/// Decode one field and apply its scale.
pub fn decode_field(raw: &[u8], field: &FieldDescriptor) -> Result<FieldValue, FieldError> {
    let bytes = slice(raw, field)?;

    let value = match field.encoding {
        Encoding::Int16 => i16::from_be_bytes([bytes[0], bytes[1]]) as f64,
        Encoding::UInt16 => u16::from_be_bytes([bytes[0], bytes[1]]) as f64,
        Encoding::Int32 => i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
        Encoding::UInt32 => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
        Encoding::Float32 => {
            let v = f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            if !v.is_finite() {
                return Err(FieldError::NotFinite {
                    field: field.name.clone(),
                });
            }
            v as f64
        }
        Encoding::StatusFlags => {
            // slice() guarantees four bytes here
            return ModuleStatus::decode(bytes)
                .map(FieldValue::Status)
                .ok_or_else(|| width_mismatch(field));
        }
    };

    Ok(FieldValue::Number(value * field.scale))
}

/// Write `value` (engineering units) into `buf` at the field's offset.
pub fn encode_field(buf: &mut [u8], field: &FieldDescriptor, value: f64) -> Result<(), FieldError> {
    let len = buf.len();
    let target = slice_mut(buf, field, len)?;
    let raw = if field.scale != 0.0 { value / field.scale } else { 0.0 };

    match field.encoding {
        Encoding::Int16 => target.copy_from_slice(&(raw.round() as i16).to_be_bytes()),
        Encoding::UInt16 => target.copy_from_slice(&(raw.round() as u16).to_be_bytes()),
        Encoding::Int32 => target.copy_from_slice(&(raw.round() as i32).to_be_bytes()),
        Encoding::UInt32 => target.copy_from_slice(&(raw.round() as u32).to_be_bytes()),
        Encoding::Float32 => target.copy_from_slice(&(raw as f32).to_be_bytes()),
        Encoding::StatusFlags => {
            let status = ModuleStatus {
                error: value != 0.0,
                status_word: 0,
            };
            target.copy_from_slice(&status.encode());
        }
    }
    Ok(())
}

/// Write a status record at the field's offset.
pub fn encode_status(
    buf: &mut [u8],
    field: &FieldDescriptor,
    status: ModuleStatus,
) -> Result<(), FieldError> {
    let len = buf.len();
    if field.encoding != Encoding::StatusFlags {
        return Err(width_mismatch(field));
    }
    slice_mut(buf, field, len)?.copy_from_slice(&status.encode());
    Ok(())
}

fn slice<'a>(raw: &'a [u8], field: &FieldDescriptor) -> Result<&'a [u8], FieldError> {
    check_width(field)?;
    raw.get(field.byte_offset..field.end())
        .ok_or_else(|| out_of_range(field, raw.len()))
}

fn slice_mut<'a>(
    buf: &'a mut [u8],
    field: &FieldDescriptor,
    len: usize,
) -> Result<&'a mut [u8], FieldError> {
    check_width(field)?;
    buf.get_mut(field.byte_offset..field.end())
        .ok_or_else(|| out_of_range(field, len))
}

fn check_width(field: &FieldDescriptor) -> Result<(), FieldError> {
    if field.width != field.encoding.width() {
        return Err(width_mismatch(field));
    }
    Ok(())
}

fn width_mismatch(field: &FieldDescriptor) -> FieldError {
    FieldError::WidthMismatch {
        field: field.name.clone(),
        encoding: field.encoding,
        width: field.width,
    }
}

fn out_of_range(field: &FieldDescriptor, len: usize) -> FieldError {
    FieldError::OutOfRange {
        field: field.name.clone(),
        offset: field.byte_offset,
        end: field.end(),
        len,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_layout() -> Vec<FieldDescriptor> {
        vec![
            FieldDescriptor::new("motor", "drive", 0, Encoding::Int16),
            FieldDescriptor::new("reserved", "drive", 2, Encoding::Int16),
            FieldDescriptor::new("power", "drive", 4, Encoding::Float32),
        ]
    }

    #[test]
    fn test_decode_mixed_block() {
        let raw = [0x00, 0x0A, 0x00, 0x00, 0x41, 0x20, 0x00, 0x00];
        let decoded = decode(8, &raw, &sample_layout());

        assert!(decoded.errors.is_empty());
        assert_eq!(decoded.fields["motor"], 10.0);
        assert_eq!(decoded.fields["reserved"], 0.0);
        assert_eq!(decoded.fields["power"], 10.0);
    }

    #[test]
    fn test_short_block_only_fails_out_of_range_fields() {
        let raw = [0x00, 0x0A, 0x00, 0x00, 0x41, 0x20];
        let decoded = decode(8, &raw, &sample_layout());

        assert_eq!(decoded.fields.len(), 2);
        assert_eq!(decoded.fields["motor"], 10.0);
        assert!(!decoded.fields.contains_key("power"));
        assert_eq!(
            decoded.errors,
            vec![FieldError::OutOfRange {
                field: "power".to_string(),
                offset: 4,
                end: 8,
                len: 6,
            }]
        );
    }

    #[test]
    fn test_signed_unsigned_and_scale() {
        let layout = vec![
            FieldDescriptor::new("t", "thermal", 0, Encoding::Int16).scale(0.1),
            FieldDescriptor::new("w", "status", 2, Encoding::UInt16),
            FieldDescriptor::new("d", "counter", 4, Encoding::Int32),
            FieldDescriptor::new("u", "counter", 8, Encoding::UInt32).scale(0.001),
        ];
        let raw = [
            0xFF, 0xF6, // -10 * 0.1
            0xFF, 0xF6, // 65526
            0xFF, 0xFF, 0xFF, 0xFE, // -2
            0x00, 0x01, 0x86, 0xA0, // 100000 * 0.001
        ];
        let decoded = decode(9, &raw, &layout);

        assert!((decoded.fields["t"] + 1.0).abs() < 1e-9);
        assert_eq!(decoded.fields["w"], 65526.0);
        assert_eq!(decoded.fields["d"], -2.0);
        assert!((decoded.fields["u"] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_width_mismatch_is_field_scoped() {
        let mut bad = FieldDescriptor::new("power", "meter", 0, Encoding::Float32);
        bad.width = 2;
        let layout = vec![bad, FieldDescriptor::new("ok", "meter", 4, Encoding::UInt16)];
        let decoded = decode(1, &[0, 0, 0, 0, 0, 7], &layout);

        assert_eq!(decoded.fields["ok"], 7.0);
        assert!(matches!(
            decoded.errors[0],
            FieldError::WidthMismatch { width: 2, .. }
        ));
    }

    #[test]
    fn test_nan_float_is_rejected() {
        let layout = vec![FieldDescriptor::new("power", "meter", 0, Encoding::Float32)];
        let decoded = decode(1, &f32::NAN.to_be_bytes(), &layout);
        assert!(decoded.fields.is_empty());
        assert_eq!(
            decoded.errors,
            vec![FieldError::NotFinite {
                field: "power".to_string()
            }]
        );
    }

    #[test]
    fn test_status_fields_go_to_status_map() {
        let layout = vec![
            FieldDescriptor::new("Pt", "meter", 0, Encoding::Float32),
            FieldDescriptor::new("meter_status", "meter", 4, Encoding::StatusFlags),
        ];
        let raw = [0x41, 0x20, 0x00, 0x00, 0x01, 0x00, 0x80, 0x04];
        let decoded = decode(10, &raw, &layout);

        assert_eq!(decoded.fields.len(), 1);
        assert_eq!(
            decoded.status["meter_status"],
            ModuleStatus {
                error: true,
                status_word: 0x8004
            }
        );
    }

    #[test]
    fn test_encode_then_decode_scaled_power() {
        let field = FieldDescriptor::new("Pt", "meter", 2, Encoding::Float32).scale(0.0001 * 20.0);
        let mut buf = [0u8; 6];
        encode_field(&mut buf, &field, 18.5).unwrap();

        match decode_field(&buf, &field).unwrap() {
            FieldValue::Number(v) => assert!((v - 18.5).abs() < 1e-3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_encode_out_of_range() {
        let field = FieldDescriptor::new("Pt", "meter", 4, Encoding::Float32);
        let mut buf = [0u8; 6];
        assert!(matches!(
            encode_field(&mut buf, &field, 1.0),
            Err(FieldError::OutOfRange { len: 6, .. })
        ));
    }
}
