//! External compiler driver.
//!
//! The only production implementation drives `solc --standard-json` over
//! stdin/stdout; everything downstream consumes the parsed `CompilerOutput`
//! and never talks to the toolchain directly, so tests substitute a scripted
//! implementation of the `Compiler` trait.

use crate::template::{CONTRACT_NAME, SOURCE_NAME};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::Write;
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CompileFailure {
    /// The program itself was rejected; carries the toolchain's diagnostics
    /// verbatim.
    #[error("compilation failed with {} diagnostic(s)", .0.len())]
    Diagnostics(Vec<Diagnostic>),
    #[error("compiler process: {0}")]
    Io(#[from] std::io::Error),
    #[error("compiler output: {0}")]
    Json(#[from] serde_json::Error),
    #[error("compiler output missing {0}")]
    Malformed(String),
}

/// One toolchain diagnostic, passed through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: String,
    pub message: String,
    #[serde(rename = "formattedMessage", default)]
    pub formatted_message: Option<String>,
}

impl Diagnostic {
    pub fn is_error(&self) -> bool {
        self.severity == "error"
    }
}

/// Parsed artifacts for the generated contract.
#[derive(Debug, Clone)]
pub struct CompilerOutput {
    pub bytecode: Vec<u8>,
    pub deployed_bytecode: Vec<u8>,
    pub source_map: String,
    pub abi: Value,
    pub ast: Value,
    /// Non-fatal diagnostics (warnings) that accompanied a success.
    pub diagnostics: Vec<Diagnostic>,
}

pub trait Compiler: Send + Sync {
    fn compile(&self, program: &str) -> Result<CompilerOutput, CompileFailure>;
}

/// Drives a `solc` binary in standard-JSON mode.
pub struct SolcCompiler {
    solc_path: String,
}

impl Default for SolcCompiler {
    fn default() -> Self {
        Self {
            solc_path: "solc".to_string(),
        }
    }
}

impl SolcCompiler {
    pub fn new(solc_path: impl Into<String>) -> Self {
        Self {
            solc_path: solc_path.into(),
        }
    }

    fn standard_input(program: &str) -> Value {
        json!({
            "language": "Solidity",
            "sources": {
                SOURCE_NAME: { "content": program }
            },
            "settings": {
                "outputSelection": {
                    "*": {
                        "*": ["*"],
                        "": ["ast"]
                    }
                }
            }
        })
    }
}

impl Compiler for SolcCompiler {
    fn compile(&self, program: &str) -> Result<CompilerOutput, CompileFailure> {
        debug!(bytes = program.len(), "invoking solc");
        let mut child = Command::new(&self.solc_path)
            .arg("--standard-json")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            let input = Self::standard_input(program);
            stdin.write_all(serde_json::to_string(&input)?.as_bytes())?;
        }
        let out = child.wait_with_output()?;
        let output: Value = serde_json::from_slice(&out.stdout)?;
        parse_standard_output(&output)
    }
}

/// Split a solc standard-JSON response into artifacts or diagnostics.
pub fn parse_standard_output(output: &Value) -> Result<CompilerOutput, CompileFailure> {
    let diagnostics: Vec<Diagnostic> = match output.get("errors") {
        Some(errors) => serde_json::from_value(errors.clone())?,
        None => Vec::new(),
    };
    if diagnostics.iter().any(Diagnostic::is_error) {
        return Err(CompileFailure::Diagnostics(diagnostics));
    }

    let contract = output
        .pointer(&format!("/contracts/{SOURCE_NAME}/{CONTRACT_NAME}"))
        .ok_or_else(|| CompileFailure::Malformed(format!("contract {CONTRACT_NAME}")))?;
    let bytecode = hex_field(contract, "/evm/bytecode/object")?;
    let deployed_bytecode = hex_field(contract, "/evm/deployedBytecode/object")?;
    let source_map = contract
        .pointer("/evm/deployedBytecode/sourceMap")
        .and_then(Value::as_str)
        .ok_or_else(|| CompileFailure::Malformed("sourceMap".into()))?
        .to_string();
    let abi = contract.get("abi").cloned().unwrap_or(Value::Null);
    let ast = output
        .pointer(&format!("/sources/{SOURCE_NAME}/ast"))
        .cloned()
        .ok_or_else(|| CompileFailure::Malformed("ast".into()))?;

    Ok(CompilerOutput {
        bytecode,
        deployed_bytecode,
        source_map,
        abi,
        ast,
        diagnostics,
    })
}

fn hex_field(contract: &Value, pointer: &str) -> Result<Vec<u8>, CompileFailure> {
    let text = contract
        .pointer(pointer)
        .and_then(Value::as_str)
        .ok_or_else(|| CompileFailure::Malformed(pointer.to_string()))?;
    hex::decode(text.trim_start_matches("0x"))
        .map_err(|_| CompileFailure::Malformed(pointer.to_string()))
}
