//! Pack/unpack of OD-typed values against little-endian byte layouts.

use snafu::Snafu;

/// The OD data type codes defined by CiA 301
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    Boolean = 1,
    Integer8 = 2,
    Integer16 = 3,
    Integer32 = 4,
    Unsigned8 = 5,
    Unsigned16 = 6,
    Unsigned32 = 7,
    Real32 = 8,
    VisibleString = 9,
    OctetString = 10,
    UnicodeString = 11,
    Domain = 15,
    Integer24 = 16,
    Real64 = 17,
    Integer40 = 18,
    Integer48 = 19,
    Integer56 = 20,
    Integer64 = 21,
    Unsigned24 = 22,
    Unsigned40 = 24,
    Unsigned48 = 25,
    Unsigned56 = 26,
    Unsigned64 = 27,
}

impl DataType {
    /// Try to decode a data type code
    pub fn from_code(code: u8) -> Option<Self> {
        use DataType::*;
        Some(match code {
            1 => Boolean,
            2 => Integer8,
            3 => Integer16,
            4 => Integer32,
            5 => Unsigned8,
            6 => Unsigned16,
            7 => Unsigned32,
            8 => Real32,
            9 => VisibleString,
            10 => OctetString,
            11 => UnicodeString,
            15 => Domain,
            16 => Integer24,
            17 => Real64,
            18 => Integer40,
            19 => Integer48,
            20 => Integer56,
            21 => Integer64,
            22 => Unsigned24,
            24 => Unsigned40,
            25 => Unsigned48,
            26 => Unsigned56,
            27 => Unsigned64,
            _ => return None,
        })
    }

    /// The type's numeric code, as it appears on the wire and in OD descriptions
    pub fn code(self) -> u8 {
        self as u8
    }

    /// True if this type is a variable-length string/domain type rather than a fixed-width number
    pub fn is_variable_length(self) -> bool {
        matches!(
            self,
            DataType::VisibleString | DataType::OctetString | DataType::UnicodeString | DataType::Domain
        )
    }

    /// True if this is a signed integer type
    pub fn is_signed(self) -> bool {
        use DataType::*;
        matches!(
            self,
            Integer8 | Integer16 | Integer24 | Integer32 | Integer40 | Integer48 | Integer56 | Integer64
        )
    }

    /// The fixed byte width of this type, or `None` for variable-length types
    pub fn fixed_width(self) -> Option<usize> {
        use DataType::*;
        Some(match self {
            Boolean | Integer8 | Unsigned8 => 1,
            Integer16 | Unsigned16 => 2,
            Integer24 | Unsigned24 => 3,
            Integer32 | Unsigned32 | Real32 => 4,
            Integer40 | Unsigned40 => 5,
            Integer48 | Unsigned48 => 6,
            Integer56 | Unsigned56 => 7,
            Integer64 | Unsigned64 | Real64 => 8,
            VisibleString | OctetString | UnicodeString | Domain => return None,
        })
    }
}

/// Failure modes of the codec layer
#[derive(Debug, Clone, PartialEq, Snafu)]
pub enum CodecError {
    /// The byte slice didn't match the width the data type requires
    #[snafu(display("size mismatch for {data_type:?}: expected {expected}, got {actual}"))]
    SizeMismatch {
        /// The type being encoded/decoded
        data_type: DataType,
        /// The width it requires
        expected: usize,
        /// The width actually supplied
        actual: usize,
    },
    /// A description string had no matching entry in `value_descriptions`
    #[snafu(display("no value description found matching {value}"))]
    UnknownDescription {
        /// The raw integer value that had no description
        value: i64,
    },
    /// A bit-field name wasn't found in `bit_definitions`
    #[snafu(display("no bit field named {name:?}"))]
    UnknownBitField {
        /// The requested field name
        name: String,
    },
}

/// A decoded numeric or string value
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Real32(f32),
    Real64(f64),
    Bytes(Vec<u8>),
    Str(String),
}

impl Value {
    /// Interpret this value as a signed integer, for physical-value scaling and bit-field math
    pub fn as_i64(&self) -> i64 {
        match self {
            Value::Bool(b) => *b as i64,
            Value::Int(v) => *v,
            Value::Uint(v) => *v as i64,
            Value::Real32(v) => *v as i64,
            Value::Real64(v) => *v as i64,
            Value::Bytes(_) | Value::Str(_) => 0,
        }
    }

    /// Interpret this value as a float, for `encode_phys`/`decode_phys` scaling
    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Bool(b) => *b as u8 as f64,
            Value::Int(v) => *v as f64,
            Value::Uint(v) => *v as f64,
            Value::Real32(v) => *v as f64,
            Value::Real64(v) => *v,
            Value::Bytes(_) | Value::Str(_) => 0.0,
        }
    }
}

/// Sign-extend an N-byte little-endian integer (N in 3,5,6,7) to a full i64
fn sign_extend(raw: u64, width_bytes: usize) -> i64 {
    let bits = width_bytes * 8;
    let shift = 64 - bits;
    ((raw << shift) as i64) >> shift
}

/// Decode a raw little-endian byte slice into a typed [`Value`]
pub fn decode_raw(data_type: DataType, bytes: &[u8]) -> Result<Value, CodecError> {
    use DataType::*;

    if let Some(width) = data_type.fixed_width() {
        if bytes.len() != width {
            return Err(CodecError::SizeMismatch {
                data_type,
                expected: width,
                actual: bytes.len(),
            });
        }
    }

    Ok(match data_type {
        Boolean => Value::Bool(bytes[0] != 0),
        Integer8 => Value::Int(bytes[0] as i8 as i64),
        Unsigned8 => Value::Uint(bytes[0] as u64),
        Integer16 => Value::Int(i16::from_le_bytes(bytes.try_into().unwrap()) as i64),
        Unsigned16 => Value::Uint(u16::from_le_bytes(bytes.try_into().unwrap()) as u64),
        Integer32 => Value::Int(i32::from_le_bytes(bytes.try_into().unwrap()) as i64),
        Unsigned32 => Value::Uint(u32::from_le_bytes(bytes.try_into().unwrap()) as u64),
        Integer64 => Value::Int(i64::from_le_bytes(bytes.try_into().unwrap())),
        Unsigned64 => Value::Uint(u64::from_le_bytes(bytes.try_into().unwrap())),
        Real32 => Value::Real32(f32::from_le_bytes(bytes.try_into().unwrap())),
        Real64 => Value::Real64(f64::from_le_bytes(bytes.try_into().unwrap())),
        Integer24 | Integer40 | Integer48 | Integer56 => {
            let mut buf = [0u8; 8];
            buf[0..bytes.len()].copy_from_slice(bytes);
            let raw = u64::from_le_bytes(buf);
            Value::Int(sign_extend(raw, bytes.len()))
        }
        Unsigned24 | Unsigned40 | Unsigned48 | Unsigned56 => {
            let mut buf = [0u8; 8];
            buf[0..bytes.len()].copy_from_slice(bytes);
            Value::Uint(u64::from_le_bytes(buf))
        }
        VisibleString | UnicodeString => {
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            Value::Str(String::from_utf8_lossy(&bytes[..end]).into_owned())
        }
        OctetString | Domain => Value::Bytes(bytes.to_vec()),
    })
}

/// Encode a typed [`Value`] into its little-endian byte representation
pub fn encode_raw(data_type: DataType, value: &Value) -> Result<Vec<u8>, CodecError> {
    use DataType::*;

    Ok(match data_type {
        Boolean => vec![(value.as_i64() != 0) as u8],
        Integer8 => vec![value.as_i64() as i8 as u8],
        Unsigned8 => vec![value.as_i64() as u8],
        Integer16 => (value.as_i64() as i16).to_le_bytes().to_vec(),
        Unsigned16 => (value.as_i64() as u16).to_le_bytes().to_vec(),
        Integer32 => (value.as_i64() as i32).to_le_bytes().to_vec(),
        Unsigned32 => (value.as_i64() as u32).to_le_bytes().to_vec(),
        Integer64 => value.as_i64().to_le_bytes().to_vec(),
        Unsigned64 => (value.as_i64() as u64).to_le_bytes().to_vec(),
        Real32 => (value.as_f64() as f32).to_le_bytes().to_vec(),
        Real64 => value.as_f64().to_le_bytes().to_vec(),
        Integer24 | Integer40 | Integer48 | Integer56 | Unsigned24 | Unsigned40 | Unsigned48
        | Unsigned56 => {
            let width = data_type.fixed_width().unwrap();
            let raw = value.as_i64() as u64;
            raw.to_le_bytes()[0..width].to_vec()
        }
        VisibleString | UnicodeString => match value {
            Value::Str(s) => s.as_bytes().to_vec(),
            Value::Bytes(b) => b.clone(),
            _ => Vec::new(),
        },
        OctetString | Domain => match value {
            Value::Bytes(b) => b.clone(),
            Value::Str(s) => s.as_bytes().to_vec(),
            _ => Vec::new(),
        },
    })
}

/// Apply a scale factor to a physical value before storing it as a raw OD value.
///
/// If the target data type is an integer type, the scaled value is rounded to the nearest
/// integer.
pub fn encode_phys(data_type: DataType, phys_value: f64, factor: f64) -> Value {
    let raw = phys_value / factor;
    to_native_value(data_type, raw)
}

/// Apply a scale factor to a raw OD value to produce its physical representation.
pub fn decode_phys(value: &Value, factor: f64) -> f64 {
    value.as_f64() * factor
}

fn to_native_value(data_type: DataType, raw: f64) -> Value {
    match data_type {
        DataType::Real32 => Value::Real32(raw as f32),
        DataType::Real64 => Value::Real64(raw),
        dt if dt.is_signed() => Value::Int(raw.round() as i64),
        _ => Value::Uint(raw.round() as u64),
    }
}

/// A set of bit positions (0-indexed from the LSB) making up a named bit field
pub type BitPositions = Vec<u8>;

/// Read the subrange of `raw` addressed by `bits`, returning it right-justified
pub fn read_bits(raw: u64, bits: &BitPositions) -> u64 {
    let mut out = 0u64;
    for (dest_bit, &src_bit) in bits.iter().enumerate() {
        if raw & (1 << src_bit) != 0 {
            out |= 1 << dest_bit;
        }
    }
    out
}

/// Return `raw` with the subrange addressed by `bits` replaced by the low bits of `value`
pub fn write_bits(raw: u64, bits: &BitPositions, value: u64) -> u64 {
    let mut out = raw;
    for (src_bit, &dest_bit) in bits.iter().enumerate() {
        let set = (value >> src_bit) & 1 != 0;
        if set {
            out |= 1 << dest_bit;
        } else {
            out &= !(1 << dest_bit);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_u32() {
        let bytes = encode_raw(DataType::Unsigned32, &Value::Uint(4)).unwrap();
        assert_eq!(bytes, 4u32.to_le_bytes());
        assert_eq!(decode_raw(DataType::Unsigned32, &bytes).unwrap(), Value::Uint(4));
    }

    #[test]
    fn sign_extend_integer24() {
        // -2 as a 24-bit two's complement value is 0xFFFFFE
        let bytes = [0xFE, 0xFF, 0xFF];
        let decoded = decode_raw(DataType::Integer24, &bytes).unwrap();
        assert_eq!(decoded, Value::Int(-2));

        let encoded = encode_raw(DataType::Integer24, &Value::Int(-2)).unwrap();
        assert_eq!(encoded, bytes);
    }

    #[test]
    fn phys_scaling_roundtrip() {
        let raw = encode_phys(DataType::Integer32, 12.5, 0.5);
        assert_eq!(raw, Value::Int(25));
        assert_eq!(decode_phys(&raw, 0.5), 12.5);
    }

    #[test]
    fn size_mismatch_rejected() {
        let err = decode_raw(DataType::Unsigned16, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, CodecError::SizeMismatch { .. }));
    }
}
