//! Decoding leaves for the Solidity scratchpad.
//!
//! Everything here is pure: no VM, no IO. Three concerns live in this crate:
//! - opcode classification tables (`opcodes`)
//! - the delta-encoded source-map decoder (`source_map`)
//! - the ABI-level value codec and the console log-call decoder
//!   (`abi`, `console`)

pub mod abi;
pub mod console;
pub mod opcodes;
pub mod source_map;

pub use abi::{AbiValue, DecodeError, SolType};
pub use console::{console_address, parse_console_call};
pub use source_map::{
    decode_instructions, uncompress, Instruction, JumpType, Location, SourceMapEntry,
    SourceMapError,
};
