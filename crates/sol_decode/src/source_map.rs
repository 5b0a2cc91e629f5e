//! Delta-encoded source-map decoder.
//!
//! Solidity emits one `offset:length:file:jump` entry per instruction,
//! semicolon-delimited, where an empty field inherits the previous entry's
//! value for that field independently. Decoding walks the bytecode one
//! instruction at a time and consumes exactly one entry per instruction;
//! the compiler appends metadata after the mapped code, so decoding stops
//! once the entry list is exhausted.

use crate::opcodes;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SourceMapError {
    #[error("source map entry {index}: bad field '{field}'")]
    BadField { index: usize, field: String },
    #[error("bytecode ends inside instruction at pc {pc}")]
    TruncatedBytecode { pc: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JumpType {
    NotJump,
    IntoFunction,
    OutOfFunction,
    InternalJump,
}

impl JumpType {
    fn from_letter(letter: &str) -> Self {
        match letter {
            "i" => JumpType::IntoFunction,
            "o" => JumpType::OutOfFunction,
            _ => JumpType::NotJump,
        }
    }
}

/// One uncompressed source-map entry. `file` is −1 when the instruction
/// has no source association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceMapEntry {
    pub offset: i64,
    pub length: i64,
    pub file: i64,
    pub jump: JumpType,
}

/// A resolved source range within one file's text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Location {
    pub offset: usize,
    pub length: usize,
    pub content: String,
}

/// One decoded instruction. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instruction {
    pub pc: usize,
    pub opcode: u8,
    pub jump: JumpType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_data: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl Instruction {
    pub fn name(&self) -> &'static str {
        opcodes::name(self.opcode)
    }
}

fn parse_field(index: usize, field: &str) -> Result<i64, SourceMapError> {
    field.parse::<i64>().map_err(|_| SourceMapError::BadField {
        index,
        field: field.to_string(),
    })
}

/// Uncompress a delta-encoded source map into absolute entries.
///
/// An incomplete *first* entry becomes a no-location placeholder; old
/// compiler versions emit such maps for compiler-generated prologues.
pub fn uncompress(compressed: &str) -> Result<Vec<SourceMapEntry>, SourceMapError> {
    let mut entries: Vec<SourceMapEntry> = Vec::new();

    for (i, raw) in compressed.split(';').enumerate() {
        let parts: Vec<&str> = raw.split(':').collect();
        let field = |n: usize| parts.get(n).copied().filter(|p| !p.is_empty());

        let complete = field(0).is_some() && field(1).is_some() && field(2).is_some()
            && field(3).is_some();
        if i == 0 && !complete {
            entries.push(SourceMapEntry {
                offset: 0,
                length: 0,
                file: -1,
                jump: JumpType::NotJump,
            });
            continue;
        }

        // i == 0 only reaches here when every field is present, so the
        // fallback entry is never read on the first iteration.
        let prev = entries.last().copied().unwrap_or(SourceMapEntry {
            offset: 0,
            length: 0,
            file: -1,
            jump: JumpType::NotJump,
        });
        entries.push(SourceMapEntry {
            offset: match field(0) {
                Some(f) => parse_field(i, f)?,
                None => prev.offset,
            },
            length: match field(1) {
                Some(f) => parse_field(i, f)?,
                None => prev.length,
            },
            file: match field(2) {
                Some(f) => parse_field(i, f)?,
                None => prev.file,
            },
            jump: match field(3) {
                Some(f) => JumpType::from_letter(f),
                None => prev.jump,
            },
        });
    }

    Ok(entries)
}

/// Decode `bytecode` against its compressed source map and the
/// file-id → source-text table.
pub fn decode_instructions(
    bytecode: &[u8],
    compressed: &str,
    files: &BTreeMap<i64, String>,
) -> Result<Vec<Instruction>, SourceMapError> {
    let entries = uncompress(compressed)?;
    let mut instructions: Vec<Instruction> = Vec::with_capacity(entries.len());
    let mut pc = 0usize;

    while instructions.len() < entries.len() {
        let opcode = *bytecode
            .get(pc)
            .ok_or(SourceMapError::TruncatedBytecode { pc })?;
        let entry = entries[instructions.len()];

        // The compressed format omits the "internal jump" case: a jump
        // instruction whose entry claims "not a jump" is one.
        let jump = if opcodes::is_jump(opcode) && entry.jump == JumpType::NotJump {
            JumpType::InternalJump
        } else {
            entry.jump
        };

        let push_data = if opcodes::is_push(opcode) {
            let len = opcodes::push_data_len(opcode);
            let mut data = bytecode[pc + 1..bytecode.len().min(pc + 1 + len)].to_vec();
            data.resize(len, 0); // trailing push data is zero-padded
            Some(data)
        } else {
            None
        };

        let location = if entry.file >= 0 {
            files.get(&entry.file).map(|text| {
                let offset = entry.offset.max(0) as usize;
                let length = entry.length.max(0) as usize;
                let end = text.len().min(offset + length);
                let content = text.get(offset..end).unwrap_or("").to_string();
                Location {
                    offset,
                    length,
                    content,
                }
            })
        } else {
            None
        };

        instructions.push(Instruction {
            pc,
            opcode,
            jump,
            push_data,
            location,
        });

        pc += opcodes::instruction_len(opcode);
    }

    Ok(instructions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(text: &str) -> BTreeMap<i64, String> {
        let mut m = BTreeMap::new();
        m.insert(0, text.to_string());
        m
    }

    #[test]
    fn two_push_instructions() {
        let bytecode = hex::decode("60016002").unwrap();
        let instructions = decode_instructions(&bytecode, "0:1:0;1:1:0", &files("ab")).unwrap();
        assert_eq!(instructions.len(), 2);
        assert_eq!(instructions[0].pc, 0);
        assert_eq!(instructions[1].pc, 2);
        assert_eq!(instructions[0].push_data.as_deref(), Some(&[0x01][..]));
        assert_eq!(instructions[1].push_data.as_deref(), Some(&[0x02][..]));
    }

    #[test]
    fn delta_inheritance_per_field() {
        let entries = uncompress("0:1:0:-;:::i").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0],
            SourceMapEntry {
                offset: 0,
                length: 1,
                file: 0,
                jump: JumpType::NotJump
            }
        );
        assert_eq!(
            entries[1],
            SourceMapEntry {
                offset: 0,
                length: 1,
                file: 0,
                jump: JumpType::IntoFunction
            }
        );
    }

    #[test]
    fn incomplete_first_entry_is_placeholder() {
        let entries = uncompress("0:1:0;5:2:0").unwrap();
        assert_eq!(entries[0].file, -1);
        assert_eq!(entries[1].offset, 5);
        assert_eq!(entries[1].file, 0);
    }

    #[test]
    fn jump_opcode_reclassified_as_internal() {
        // PUSH1 0x04; JUMP — both entries claim "not a jump"
        let bytecode = hex::decode("600456").unwrap();
        let instructions =
            decode_instructions(&bytecode, "0:1:0:-;0:1:0:-", &files("ab")).unwrap();
        assert_eq!(instructions[0].jump, JumpType::NotJump);
        assert_eq!(instructions[1].jump, JumpType::InternalJump);
    }

    #[test]
    fn stops_at_map_entry_count() {
        // two mapped instructions followed by compiler metadata bytes
        let bytecode = hex::decode("600100fedead").unwrap();
        let instructions =
            decode_instructions(&bytecode, "0:1:0:-;2:1:0:-", &files("ab")).unwrap();
        assert_eq!(instructions.len(), 2);
        assert_eq!(instructions[1].opcode, 0x00);
    }

    #[test]
    fn location_slices_file_text() {
        let instructions = decode_instructions(&[0x00], "1:3:0:-", &files("hello")).unwrap();
        let loc = instructions[0].location.as_ref().unwrap();
        assert_eq!(loc.content, "ell");
        assert_eq!((loc.offset, loc.length), (1, 3));
    }

    #[test]
    fn file_minus_one_has_no_location() {
        let instructions = decode_instructions(&[0x00], "0:1:-1:-", &files("hello")).unwrap();
        assert!(instructions[0].location.is_none());
    }

    #[test]
    fn bad_field_is_an_error() {
        assert!(matches!(
            uncompress("0:x:0:-"),
            Err(SourceMapError::BadField { index: 0, .. })
        ));
    }

    #[test]
    fn truncated_bytecode_is_an_error() {
        assert!(matches!(
            decode_instructions(&[0x60, 0x01], "0:1:0:-;2:1:0:-", &files("")),
            Err(SourceMapError::TruncatedBytecode { pc: 2 })
        ));
    }
}
