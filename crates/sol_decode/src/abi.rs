//! ABI-level value codec.
//!
//! Static types occupy one 32-byte slot. Dynamic types (`string`, `bytes`)
//! use two-step indirection: the slot holds an offset into the argument
//! area, where a 32-byte length prefix precedes the raw content.

use ethereum_types::{H160 as Address, U256};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

const SLOT: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("expected {expected} bytes for {type_name}, got {got}")]
    Width {
        type_name: String,
        expected: usize,
        got: usize,
    },
    #[error("dynamic payload out of range at offset {offset}")]
    OutOfRange { offset: usize },
    #[error("unsupported type '{0}'")]
    Unsupported(String),
}

/// A Solidity type as far as the codec cares: static slot types, the two
/// dynamic builtins, and an opaque catch-all for everything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolType {
    Uint(usize),
    Int(usize),
    Address,
    Bool,
    FixedBytes(usize),
    Str,
    Bytes,
    Other(String),
}

impl SolType {
    /// Parse a Solidity `typeString` (data location suffixes are ignored).
    pub fn parse(type_string: &str) -> SolType {
        let base = type_string.split_whitespace().next().unwrap_or("");
        match base {
            "address" => SolType::Address,
            "bool" => SolType::Bool,
            "string" => SolType::Str,
            "bytes" => SolType::Bytes,
            _ => {
                if let Some(n) = base.strip_prefix("bytes") {
                    if let Ok(n) = n.parse::<usize>() {
                        if (1..=32).contains(&n) {
                            return SolType::FixedBytes(n);
                        }
                    }
                } else if let Some(bits) = base.strip_prefix("uint") {
                    if bits.is_empty() {
                        return SolType::Uint(256);
                    }
                    if let Ok(bits) = bits.parse::<usize>() {
                        if bits % 8 == 0 && (8..=256).contains(&bits) {
                            return SolType::Uint(bits);
                        }
                    }
                } else if let Some(bits) = base.strip_prefix("int") {
                    if bits.is_empty() {
                        return SolType::Int(256);
                    }
                    if let Ok(bits) = bits.parse::<usize>() {
                        if bits % 8 == 0 && (8..=256).contains(&bits) {
                            return SolType::Int(bits);
                        }
                    }
                }
                SolType::Other(type_string.to_string())
            }
        }
    }

    /// Encoded width of a static type; `None` for dynamic/unknown types.
    pub fn static_width(&self) -> Option<usize> {
        match self {
            SolType::Uint(_)
            | SolType::Int(_)
            | SolType::Address
            | SolType::Bool
            | SolType::FixedBytes(_) => Some(SLOT),
            SolType::Str | SolType::Bytes | SolType::Other(_) => None,
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            SolType::Uint(bits) => format!("uint{bits}"),
            SolType::Int(bits) => format!("int{bits}"),
            SolType::Address => "address".into(),
            SolType::Bool => "bool".into(),
            SolType::FixedBytes(n) => format!("bytes{n}"),
            SolType::Str => "string".into(),
            SolType::Bytes => "bytes".into(),
            SolType::Other(s) => s.clone(),
        }
    }
}

/// A decoded ABI value. Integers render in decimal, byte values as 0x-hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AbiValue {
    Uint(U256),
    /// 256-bit two's-complement representation.
    Int(U256),
    Bool(bool),
    Address(Address),
    FixedBytes(Vec<u8>),
    Str(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for AbiValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbiValue::Uint(v) => write!(f, "{v}"),
            AbiValue::Int(v) => {
                if v.bit(255) {
                    // negative: magnitude is the two's complement
                    let magnitude = (!*v).overflowing_add(U256::one()).0;
                    write!(f, "-{magnitude}")
                } else {
                    write!(f, "{v}")
                }
            }
            AbiValue::Bool(v) => write!(f, "{v}"),
            AbiValue::Address(a) => write!(f, "0x{:x}", a),
            AbiValue::FixedBytes(b) | AbiValue::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
            AbiValue::Str(s) => f.write_str(s),
        }
    }
}

/// Decode a static type from exactly one 32-byte slot.
pub fn decode_static(ty: &SolType, slot: &[u8]) -> Result<AbiValue, DecodeError> {
    let expected = ty
        .static_width()
        .ok_or_else(|| DecodeError::Unsupported(ty.type_name()))?;
    if slot.len() != expected {
        return Err(DecodeError::Width {
            type_name: ty.type_name(),
            expected,
            got: slot.len(),
        });
    }
    Ok(match ty {
        SolType::Uint(_) => AbiValue::Uint(U256::from_big_endian(slot)),
        SolType::Int(_) => AbiValue::Int(U256::from_big_endian(slot)),
        SolType::Bool => AbiValue::Bool(slot[SLOT - 1] != 0),
        SolType::Address => AbiValue::Address(Address::from_slice(&slot[12..])),
        SolType::FixedBytes(n) => AbiValue::FixedBytes(slot[..*n].to_vec()),
        _ => unreachable!("static_width filtered dynamic types"),
    })
}

fn read_dynamic(data: &[u8], slot: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let offset = U256::from_big_endian(slot);
    if offset > U256::from(data.len()) {
        return Err(DecodeError::OutOfRange {
            offset: offset.low_u64() as usize,
        });
    }
    let offset = offset.as_usize();
    let len_slot = data
        .get(offset..offset + SLOT)
        .ok_or(DecodeError::OutOfRange { offset })?;
    let length = U256::from_big_endian(len_slot);
    if length > U256::from(data.len()) {
        return Err(DecodeError::OutOfRange { offset });
    }
    let start = offset + SLOT;
    data.get(start..start + length.as_usize())
        .map(|b| b.to_vec())
        .ok_or(DecodeError::OutOfRange { offset })
}

/// Decode the `i`-th argument of `types` from an argument area `data`
/// (calldata with the 4-byte selector already stripped).
pub fn decode_argument(ty: &SolType, data: &[u8], index: usize) -> Result<AbiValue, DecodeError> {
    let slot = data
        .get(index * SLOT..(index + 1) * SLOT)
        .ok_or(DecodeError::OutOfRange { offset: index * SLOT })?;
    match ty {
        SolType::Str => Ok(AbiValue::Str(
            String::from_utf8_lossy(&read_dynamic(data, slot)?).into_owned(),
        )),
        SolType::Bytes => Ok(AbiValue::Bytes(read_dynamic(data, slot)?)),
        SolType::Other(name) => Err(DecodeError::Unsupported(name.clone())),
        _ => decode_static(ty, slot),
    }
}

/// Decode a full argument list.
pub fn decode_arguments(types: &[SolType], data: &[u8]) -> Result<Vec<AbiValue>, DecodeError> {
    types
        .iter()
        .enumerate()
        .map(|(i, ty)| decode_argument(ty, data, i))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_u64(v: u64) -> [u8; 32] {
        let mut s = [0u8; 32];
        U256::from(v).to_big_endian(&mut s);
        s
    }

    #[test]
    fn uint_decodes_in_decimal() {
        let v = decode_static(&SolType::Uint(256), &slot_u64(42)).unwrap();
        assert_eq!(v.to_string(), "42");
    }

    #[test]
    fn negative_int_renders_signed() {
        let slot = [0xff; 32]; // -1 in two's complement
        let v = decode_static(&SolType::Int(256), &slot).unwrap();
        assert_eq!(v.to_string(), "-1");
    }

    #[test]
    fn bool_and_address() {
        let mut slot = [0u8; 32];
        slot[31] = 1;
        assert_eq!(
            decode_static(&SolType::Bool, &slot).unwrap().to_string(),
            "true"
        );

        let mut slot = [0u8; 32];
        slot[12..].copy_from_slice(&[0x11; 20]);
        assert_eq!(
            decode_static(&SolType::Address, &slot).unwrap().to_string(),
            format!("0x{}", "11".repeat(20))
        );
    }

    #[test]
    fn fixed_bytes_truncate_to_width() {
        let mut slot = [0u8; 32];
        slot[0] = 0xde;
        slot[1] = 0xad;
        let v = decode_static(&SolType::FixedBytes(2), &slot).unwrap();
        assert_eq!(v.to_string(), "0xdead");
    }

    #[test]
    fn width_mismatch_is_an_error() {
        let err = decode_static(&SolType::Uint(256), &[0u8; 20]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Width {
                type_name: "uint256".into(),
                expected: 32,
                got: 20
            }
        );
    }

    #[test]
    fn dynamic_string_two_step() {
        // slot 0: offset 32; at 32: length 5; then "hello"
        let mut data = Vec::new();
        data.extend_from_slice(&slot_u64(32));
        data.extend_from_slice(&slot_u64(5));
        data.extend_from_slice(b"hello");
        let v = decode_argument(&SolType::Str, &data, 0).unwrap();
        assert_eq!(v.to_string(), "hello");
    }

    #[test]
    fn dynamic_offset_out_of_range() {
        let data = slot_u64(4096);
        assert!(matches!(
            decode_argument(&SolType::Bytes, &data, 0),
            Err(DecodeError::OutOfRange { .. })
        ));
    }

    #[test]
    fn type_string_parsing() {
        assert_eq!(SolType::parse("uint256"), SolType::Uint(256));
        assert_eq!(SolType::parse("uint"), SolType::Uint(256));
        assert_eq!(SolType::parse("int128"), SolType::Int(128));
        assert_eq!(SolType::parse("string memory"), SolType::Str);
        assert_eq!(SolType::parse("bytes32"), SolType::FixedBytes(32));
        assert_eq!(SolType::parse("bytes"), SolType::Bytes);
        assert_eq!(
            SolType::parse("struct Foo memory"),
            SolType::Other("struct Foo memory".into())
        );
    }
}
