//! Accumulated program state across fragment runs.
//!
//! A `Source` holds the three code buffers (file-level, contract-member,
//! statement) plus the artifacts of the last successful compile. Compiling a
//! new block never mutates the receiver: it returns a fresh `Source`, so any
//! previously captured value keeps describing exactly the program that
//! produced it.

use crate::compiler::{CompileFailure, Compiler, CompilerOutput};
use crate::template::{render_program, TemplateParams};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sol_decode::{
    abi, decode_instructions, AbiValue, DecodeError, Instruction, SolType, SourceMapError,
};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// Which region of the generated contract a code block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeKind {
    /// Statements inside the `run()` entry point.
    Code,
    /// Contract members: state variables, functions, modifiers.
    TopLevelCode,
    /// File-level code: imports, free functions, structs, libraries.
    GlobalCode,
}

/// How the compiled block executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileMode {
    Normal,
    /// The block ended in a bare expression; execution captures its value.
    VariableDeclaration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableMeta {
    /// Source text of the captured expression.
    pub name: String,
    /// Solidity type string reported by the compiler for the expression.
    pub type_string: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedVariable {
    pub name: String,
    pub value: AbiValue,
}

pub struct CompileOutcome {
    pub mode: CompileMode,
    pub source: Source,
    pub variable: Option<VariableMeta>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source has no compiled artifacts")]
    NotCompiled,
    #[error(transparent)]
    SourceMap(#[from] SourceMapError),
}

const CAPTURE_NAME: &str = "__sol_capture";

#[derive(Clone, Default)]
pub struct Source {
    global_code: Vec<String>,
    top_level_code: Vec<String>,
    run_code: Vec<String>,
    compiled: Option<Compiled>,
}

#[derive(Clone)]
struct Compiled {
    program: String,
    output: CompilerOutput,
}

impl Source {
    pub fn new() -> Self {
        Self::default()
    }

    /// Program text of the last successful compile.
    pub fn program(&self) -> Option<&str> {
        self.compiled.as_ref().map(|c| c.program.as_str())
    }

    pub fn bytecode(&self) -> Option<&[u8]> {
        self.compiled.as_ref().map(|c| c.output.bytecode.as_slice())
    }

    pub fn deployed_bytecode(&self) -> Option<&[u8]> {
        self.compiled
            .as_ref()
            .map(|c| c.output.deployed_bytecode.as_slice())
    }

    /// Compile the accumulated program extended with a new block.
    ///
    /// On success the returned `Source` carries the updated buffers and the
    /// fresh artifacts; `self` is left untouched either way. A block of kind
    /// `Code` whose final statement is a bare expression compiles in capture
    /// mode: the executed program materializes the expression's ABI encoding
    /// and returns it, while the persisted statement buffer keeps everything
    /// except that expression. Expressions the compiler rejects in capture
    /// position (void calls have no encodable value) fall back to running
    /// in place as a plain statement.
    pub fn try_compile_new_code(
        &self,
        lines: &[String],
        kind: CodeKind,
        compiler: &dyn Compiler,
    ) -> Result<CompileOutcome, CompileFailure> {
        if kind == CodeKind::Code {
            if let Some(last) = lines.last().filter(|l| is_bare_expression(l.as_str())) {
                let capture = strip_statement(last);
                match self.compile_block(lines, kind, Some(capture), compiler) {
                    Err(CompileFailure::Diagnostics(_)) => {}
                    other => return other,
                }
            }
        }
        self.compile_block(lines, kind, None, compiler)
    }

    fn compile_block(
        &self,
        lines: &[String],
        kind: CodeKind,
        capture: Option<String>,
        compiler: &dyn Compiler,
    ) -> Result<CompileOutcome, CompileFailure> {
        let mut next = self.clone();
        next.compiled = None;

        match kind {
            CodeKind::GlobalCode => next.global_code.extend(lines.iter().cloned()),
            CodeKind::TopLevelCode => next.top_level_code.extend(lines.iter().cloned()),
            CodeKind::Code => {
                let mut block: Vec<String> = lines.to_vec();
                if capture.is_some() {
                    block.pop();
                }
                next.run_code.extend(block);
            }
        }

        let mode = if capture.is_some() {
            CompileMode::VariableDeclaration
        } else {
            CompileMode::Normal
        };

        // The executed program: persisted statements plus, in capture mode,
        // a synthesized declaration that returns the encoded value.
        let mut run_code = next.run_code.join("\n");
        if let Some(expr) = &capture {
            run_code.push_str(&format!(
                "\nbytes memory {CAPTURE_NAME} = abi.encode({expr});\n\
                 assembly {{ return(add({CAPTURE_NAME}, 0x20), mload({CAPTURE_NAME})) }}"
            ));
        }

        let program = render_program(&TemplateParams {
            global_code: &next.global_code.join("\n"),
            top_level_code: &next.top_level_code.join("\n"),
            run_code: &run_code,
            ..TemplateParams::default()
        });
        debug!(?kind, ?mode, "compiling accumulated program");
        let output = compiler.compile(&program)?;

        let variable = match &capture {
            Some(expr) => {
                let type_string = capture_type(&output.ast).ok_or_else(|| {
                    CompileFailure::Malformed("captured expression type".into())
                })?;
                Some(VariableMeta {
                    name: expr.clone(),
                    type_string,
                })
            }
            None => None,
        };

        next.compiled = Some(Compiled { program, output });
        Ok(CompileOutcome {
            mode,
            source: next,
            variable,
        })
    }

    /// Decode a captured raw value against the recorded type.
    ///
    /// Integers and addresses render as big integers. Composite types
    /// (arrays, structs) have no slot-level decoder here; they keep the
    /// whole `abi.encode` payload as raw bytes.
    pub fn decode_variable(
        raw: &[u8],
        meta: &VariableMeta,
    ) -> Result<DecodedVariable, DecodeError> {
        let value = match SolType::parse(&meta.type_string) {
            SolType::Other(_) => AbiValue::Bytes(raw.to_vec()),
            ty => match abi::decode_argument(&ty, raw, 0)? {
                AbiValue::Address(addr) => {
                    AbiValue::Uint(ethereum_types::U256::from_big_endian(addr.as_bytes()))
                }
                other => other,
            },
        };
        Ok(DecodedVariable {
            name: meta.name.clone(),
            value,
        })
    }

    /// Decode the deployed bytecode against its source map for inspection.
    pub fn instructions(&self) -> Result<Vec<Instruction>, SourceError> {
        let compiled = self.compiled.as_ref().ok_or(SourceError::NotCompiled)?;
        let mut files = BTreeMap::new();
        files.insert(0, compiled.program.clone());
        Ok(decode_instructions(
            &compiled.output.deployed_bytecode,
            &compiled.output.source_map,
            &files,
        )?)
    }
}

/// Find the type the compiler assigned to the captured expression: the sole
/// argument of the `abi.encode` call initializing the capture declaration.
fn capture_type(ast: &Value) -> Option<String> {
    if let Value::Object(map) = ast {
        if map.get("nodeType").and_then(Value::as_str) == Some("VariableDeclarationStatement") {
            let declares_capture = map
                .get("declarations")
                .and_then(Value::as_array)
                .and_then(|d| d.first())
                .and_then(|d| d.get("name"))
                .and_then(Value::as_str)
                == Some(CAPTURE_NAME);
            if declares_capture {
                return map
                    .get("initialValue")
                    .and_then(|v| v.pointer("/arguments/0/typeDescriptions/typeString"))
                    .and_then(Value::as_str)
                    .map(normalize_type_string);
            }
        }
    }
    match ast {
        Value::Object(map) => map.values().find_map(capture_type),
        Value::Array(items) => items.iter().find_map(capture_type),
        _ => None,
    }
}

/// `typeString` carries rational literal types for constants and a storage
/// location suffix for reference types; reduce both to a decodable type.
fn normalize_type_string(raw: &str) -> String {
    let raw = raw.trim();
    if let Some(rest) = raw.strip_prefix("int_const ") {
        return if rest.starts_with('-') {
            "int256".to_string()
        } else {
            "uint256".to_string()
        };
    }
    if raw.starts_with("literal_string") {
        return "string".to_string();
    }
    raw.split_whitespace().next().unwrap_or(raw).to_string()
}

/// Statement classifier: `true` when the line is a value-producing bare
/// expression rather than a declaration, assignment, or control statement.
fn is_bare_expression(line: &str) -> bool {
    let stmt = strip_statement(line);
    if stmt.is_empty() || stmt.ends_with('{') || stmt.ends_with('}') {
        return false;
    }
    let first = stmt.split(|c: char| !c.is_alphanumeric() && c != '_').next();
    const STATEMENT_KEYWORDS: &[&str] = &[
        "if", "else", "for", "while", "do", "return", "emit", "require", "assert", "revert",
        "delete", "assembly", "unchecked", "try", "break", "continue",
    ];
    if let Some(word) = first {
        if STATEMENT_KEYWORDS.contains(&word) {
            return false;
        }
    }
    if has_top_level_assignment(&stmt) {
        return false;
    }
    !is_declaration(&stmt)
}

fn strip_statement(line: &str) -> String {
    line.trim().trim_end_matches(';').trim().to_string()
}

/// `=` outside `==`, `!=`, `<=`, `>=`, `=>` and compound assignments.
fn has_top_level_assignment(stmt: &str) -> bool {
    let bytes = stmt.as_bytes();
    let mut depth = 0i32;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' | b'[' => depth += 1,
            b')' | b']' => depth -= 1,
            b'=' if depth == 0 => {
                let prev = i.checked_sub(1).map(|p| bytes[p]);
                let next = bytes.get(i + 1).copied();
                let comparison = matches!(prev, Some(b'=') | Some(b'!') | Some(b'<') | Some(b'>'))
                    || matches!(next, Some(b'=') | Some(b'>'));
                // compound assignments (+=, -=, ...) count as assignments
                if !comparison {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

/// Two bare identifiers in a row (`uint256 x`, `Foo memory y`) read as a
/// declaration head.
fn is_declaration(stmt: &str) -> bool {
    let mut tokens = stmt.split_whitespace();
    let (first, second) = match (tokens.next(), tokens.next()) {
        (Some(a), Some(b)) => (a, b),
        _ => return false,
    };
    let head_is_type = first
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '[' || c == ']' || c == '.');
    let second_is_binding = matches!(second, "memory" | "storage" | "calldata")
        || second.chars().all(|c| c.is_alphanumeric() || c == '_');
    head_is_type && second_is_binding
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct RecordingCompiler {
        programs: Mutex<Vec<String>>,
        ast: Value,
    }

    impl RecordingCompiler {
        fn new(ast: Value) -> Self {
            Self {
                programs: Mutex::new(Vec::new()),
                ast,
            }
        }
    }

    impl Compiler for RecordingCompiler {
        fn compile(&self, program: &str) -> Result<CompilerOutput, CompileFailure> {
            self.programs.lock().unwrap().push(program.to_string());
            Ok(CompilerOutput {
                bytecode: vec![0x60, 0x01],
                deployed_bytecode: vec![0x60, 0x01, 0x60, 0x02],
                source_map: "0:1:0;1:1:0".into(),
                abi: json!([]),
                ast: self.ast.clone(),
                diagnostics: Vec::new(),
            })
        }
    }

    fn capture_ast(type_string: &str) -> Value {
        json!({
            "nodeType": "SourceUnit",
            "nodes": [{
                "nodeType": "VariableDeclarationStatement",
                "declarations": [{ "name": CAPTURE_NAME }],
                "initialValue": {
                    "arguments": [{ "typeDescriptions": { "typeString": type_string } }]
                }
            }]
        })
    }

    fn lines(block: &str) -> Vec<String> {
        block.lines().map(str::to_string).collect()
    }

    #[test]
    fn declaration_block_compiles_in_normal_mode() {
        let compiler = RecordingCompiler::new(json!({}));
        let source = Source::new();
        let outcome = source
            .try_compile_new_code(&lines("uint256 a = 1;"), CodeKind::Code, &compiler)
            .unwrap();
        assert_eq!(outcome.mode, CompileMode::Normal);
        assert!(outcome.variable.is_none());
        assert!(outcome.source.program().unwrap().contains("uint256 a = 1;"));
    }

    #[test]
    fn bare_expression_compiles_in_capture_mode() {
        let compiler = RecordingCompiler::new(capture_ast("uint256"));
        let source = Source::new();
        let outcome = source
            .try_compile_new_code(
                &lines("uint256 a = 1;\na"),
                CodeKind::Code,
                &compiler,
            )
            .unwrap();
        assert_eq!(outcome.mode, CompileMode::VariableDeclaration);
        let meta = outcome.variable.unwrap();
        assert_eq!(meta.name, "a");
        assert_eq!(meta.type_string, "uint256");

        // the executed program carries the capture, the buffers do not
        let program = compiler.programs.lock().unwrap().last().cloned().unwrap();
        assert!(program.contains(CAPTURE_NAME));
        let replay = outcome
            .source
            .try_compile_new_code(&lines("uint256 b = 2;"), CodeKind::Code, &compiler)
            .unwrap();
        let next_program = compiler.programs.lock().unwrap().last().cloned().unwrap();
        assert!(!next_program.contains(CAPTURE_NAME));
        assert!(next_program.contains("uint256 a = 1;"));
        assert_eq!(replay.mode, CompileMode::Normal);
    }

    #[test]
    fn earlier_declarations_stay_visible() {
        let compiler = RecordingCompiler::new(json!({}));
        let first = Source::new()
            .try_compile_new_code(&lines("uint256 a = 1;"), CodeKind::Code, &compiler)
            .unwrap();
        first
            .source
            .try_compile_new_code(&lines("a += 1;"), CodeKind::Code, &compiler)
            .unwrap();
        let program = compiler.programs.lock().unwrap().last().cloned().unwrap();
        assert!(program.contains("uint256 a = 1;"));
        assert!(program.contains("a += 1;"));
    }

    #[test]
    fn failed_compile_leaves_receiver_untouched() {
        struct Failing;
        impl Compiler for Failing {
            fn compile(&self, _program: &str) -> Result<CompilerOutput, CompileFailure> {
                Err(CompileFailure::Diagnostics(vec![]))
            }
        }
        let source = Source::new();
        assert!(source
            .try_compile_new_code(&lines("nonsense"), CodeKind::Code, &Failing)
            .is_err());
        assert!(source.program().is_none());
    }

    #[test]
    fn global_and_top_level_blocks_route_to_their_regions() {
        let compiler = RecordingCompiler::new(json!({}));
        let outcome = Source::new()
            .try_compile_new_code(
                &lines("function helper() pure returns (uint256) { return 7; }"),
                CodeKind::GlobalCode,
                &compiler,
            )
            .unwrap();
        assert_eq!(outcome.mode, CompileMode::Normal);
        let outcome = outcome
            .source
            .try_compile_new_code(&lines("uint256 counter;"), CodeKind::TopLevelCode, &compiler)
            .unwrap();
        let program = compiler.programs.lock().unwrap().last().cloned().unwrap();
        let global = program.find("function helper").unwrap();
        let contract = program.find("contract ").unwrap();
        let member = program.find("uint256 counter;").unwrap();
        assert!(global < contract && contract < member);
        assert_eq!(outcome.mode, CompileMode::Normal);
    }

    #[test]
    fn void_expression_falls_back_to_normal_mode() {
        /// Rejects capture programs, mimicking `abi.encode` of a void call.
        struct VoidAware;
        impl Compiler for VoidAware {
            fn compile(&self, program: &str) -> Result<CompilerOutput, CompileFailure> {
                if program.contains(CAPTURE_NAME) {
                    return Err(CompileFailure::Diagnostics(vec![]));
                }
                Ok(CompilerOutput {
                    bytecode: vec![0x00],
                    deployed_bytecode: vec![0x00],
                    source_map: "0:1:0".into(),
                    abi: json!([]),
                    ast: json!({}),
                    diagnostics: Vec::new(),
                })
            }
        }

        let outcome = Source::new()
            .try_compile_new_code(&lines("doSomething(1)"), CodeKind::Code, &VoidAware)
            .unwrap();
        assert_eq!(outcome.mode, CompileMode::Normal);
        assert!(outcome.variable.is_none());
        assert!(outcome.source.program().unwrap().contains("doSomething(1)"));
    }

    #[test]
    fn decode_variable_renders_integers_in_decimal() {
        let meta = VariableMeta {
            name: "a".into(),
            type_string: "uint256".into(),
        };
        let mut raw = [0u8; 32];
        raw[31] = 42;
        let decoded = Source::decode_variable(&raw, &meta).unwrap();
        assert_eq!(decoded.value.to_string(), "42");
    }

    #[test]
    fn decode_variable_turns_addresses_into_big_integers() {
        let meta = VariableMeta {
            name: "who".into(),
            type_string: "address".into(),
        };
        let mut raw = [0u8; 32];
        raw[31] = 0x11;
        let decoded = Source::decode_variable(&raw, &meta).unwrap();
        assert_eq!(decoded.value.to_string(), "17");
    }

    #[test]
    fn decode_variable_keeps_composite_payloads_raw() {
        let meta = VariableMeta {
            name: "xs".into(),
            type_string: "uint256[] memory".into(),
        };
        // abi.encode of a one-element uint256[]: offset, length, element
        let mut raw = Vec::new();
        for word in [32u8, 1, 7] {
            let mut slot = [0u8; 32];
            slot[31] = word;
            raw.extend_from_slice(&slot);
        }
        let decoded = Source::decode_variable(&raw, &meta).unwrap();
        assert_eq!(decoded.value, AbiValue::Bytes(raw));
    }

    #[test]
    fn capture_type_is_found_in_a_nested_block() {
        let ast = json!({
            "nodeType": "SourceUnit",
            "nodes": [{
                "nodeType": "FunctionDefinition",
                "body": {
                    "statements": [
                        { "nodeType": "ExpressionStatement" },
                        {
                            "nodeType": "VariableDeclarationStatement",
                            "declarations": [{ "name": CAPTURE_NAME }],
                            "initialValue": {
                                "arguments": [{
                                    "typeDescriptions": { "typeString": "bool" }
                                }]
                            }
                        }
                    ]
                }
            }]
        });
        assert_eq!(capture_type(&ast).as_deref(), Some("bool"));
        assert_eq!(capture_type(&json!({})), None);
    }

    #[test]
    fn instructions_decode_against_the_rendered_program() {
        let compiler = RecordingCompiler::new(json!({}));
        let outcome = Source::new()
            .try_compile_new_code(&lines("uint256 a = 1;"), CodeKind::Code, &compiler)
            .unwrap();
        let instructions = outcome.source.instructions().unwrap();
        assert_eq!(instructions.len(), 2);
        assert_eq!(instructions[1].pc, 2);
        assert!(matches!(
            Source::new().instructions(),
            Err(SourceError::NotCompiled)
        ));
    }

    #[test]
    fn bare_expression_classifier() {
        assert!(is_bare_expression("a"));
        assert!(is_bare_expression("a + b;"));
        assert!(is_bare_expression("balanceOf(msg.sender)"));
        assert!(!is_bare_expression("uint256 a = 1;"));
        assert!(!is_bare_expression("a = 2;"));
        assert!(!is_bare_expression("a += 2;"));
        assert!(!is_bare_expression("require(a > 1);"));
        assert!(!is_bare_expression("return a;"));
        assert!(!is_bare_expression("uint256 memory x"));
        assert!(is_bare_expression("a == b"));
    }

    #[test]
    fn rational_constant_types_normalize() {
        assert_eq!(normalize_type_string("int_const 42"), "uint256");
        assert_eq!(normalize_type_string("int_const -1"), "int256");
        assert_eq!(normalize_type_string("string memory"), "string");
        assert_eq!(normalize_type_string("literal_string \"hi\""), "string");
        assert_eq!(normalize_type_string("uint256"), "uint256");
    }
}
