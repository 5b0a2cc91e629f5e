//! Console log-call decoder.
//!
//! The contract template's `console` library staticcalls a fixed well-known
//! address; nothing lives there, so the calls are no-ops on-chain and are
//! recognized purely by the pre-call hook. The 4-byte selector picks the
//! argument types from a static table; unknown selectors are ignored.

use crate::abi::{self, SolType};
use ethereum_types::H160 as Address;

/// `0x000000000000000000636f6e736f6c652e6c6f67` — the trailing eleven
/// bytes spell "console.log".
pub const CONSOLE_ADDRESS: [u8; 20] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x63, 0x6f, 0x6e, 0x73, 0x6f, 0x6c,
    0x65, 0x2e, 0x6c, 0x6f, 0x67,
];

pub fn console_address() -> Address {
    Address::from_slice(&CONSOLE_ADDRESS)
}

/// Argument types for a known `log(...)` overload selector.
pub fn signature_types(selector: u32) -> Option<&'static [SolType]> {
    use SolType::*;
    Some(match selector {
        0xf82c50f1 => &[Uint(256)],
        0x4e0c1d1d => &[Int(256)],
        0x41304fac => &[Str],
        0x32458eed => &[Bool],
        0x2c2ecbc2 => &[Address],
        0x0be77f56 => &[Bytes],
        0x27b7cf85 => &[FixedBytes(32)],
        0xf666715a => &[Uint(256), Uint(256)],
        0xb60e72cc => &[Str, Uint(256)],
        0x4b5c4277 => &[Str, Str],
        0x319af333 => &[Str, Address],
        0xc3b55635 => &[Str, Bool],
        _ => return None,
    })
}

/// Decode a call to the console address into rendered argument strings.
///
/// Returns `None` for calls to other addresses, unknown selectors, and
/// malformed argument payloads — a bad log call never aborts execution.
pub fn parse_console_call(to: &Address, data: &[u8]) -> Option<Vec<String>> {
    if to.as_bytes() != CONSOLE_ADDRESS || data.len() < 4 {
        return None;
    }
    let selector = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let types = signature_types(selector)?;
    let values = abi::decode_arguments(types, &data[4..]).ok()?;
    Some(values.iter().map(|v| v.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_types::U256;

    fn slot(v: u64) -> [u8; 32] {
        let mut s = [0u8; 32];
        U256::from(v).to_big_endian(&mut s);
        s
    }

    fn call(selector: u32, args: &[u8]) -> Vec<u8> {
        let mut data = selector.to_be_bytes().to_vec();
        data.extend_from_slice(args);
        data
    }

    #[test]
    fn log_uint256_decodes_to_decimal_string() {
        let data = call(0xf82c50f1, &slot(42));
        assert_eq!(
            parse_console_call(&console_address(), &data),
            Some(vec!["42".to_string()])
        );
    }

    #[test]
    fn log_string_uint256() {
        let mut args = Vec::new();
        args.extend_from_slice(&slot(64)); // offset of the string payload
        args.extend_from_slice(&slot(7));
        args.extend_from_slice(&slot(3));
        args.extend_from_slice(b"abc");
        let data = call(0xb60e72cc, &args);
        assert_eq!(
            parse_console_call(&console_address(), &data),
            Some(vec!["abc".to_string(), "7".to_string()])
        );
    }

    #[test]
    fn other_addresses_are_ignored() {
        let data = call(0xf82c50f1, &slot(42));
        assert_eq!(parse_console_call(&Address::repeat_byte(1), &data), None);
    }

    #[test]
    fn unknown_selector_is_ignored() {
        let data = call(0xdeadbeef, &slot(42));
        assert_eq!(parse_console_call(&console_address(), &data), None);
    }

    #[test]
    fn malformed_payload_is_ignored() {
        // log(string) whose offset points outside the payload
        let data = call(0x41304fac, &slot(4096));
        assert_eq!(parse_console_call(&console_address(), &data), None);
    }

    #[test]
    fn short_data_is_ignored() {
        assert_eq!(parse_console_call(&console_address(), &[0xf8, 0x2c]), None);
    }
}
