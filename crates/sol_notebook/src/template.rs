//! The contract scaffold every fragment is compiled into.
//!
//! Three user-controlled regions land in a fixed program shape: file-level
//! code above the contract, member declarations inside it, and statements in
//! the `run()` entry point. The scaffold also carries the `console` library
//! (staticcalls to the well-known log address) and the `vm` library that
//! forwards `broadcast` to the native dispatcher.

/// Default name of the generated contract.
pub const CONTRACT_NAME: &str = "Scratchpad";

/// The single synthetic source file name used for compilation.
pub const SOURCE_NAME: &str = "Compiled_Contracts";

/// 4-byte selector of `run()`.
pub const RUN_SELECTOR: [u8; 4] = [0xc0, 0x40, 0x62, 0x26];

pub struct TemplateParams<'a> {
    pub contract_name: &'a str,
    pub global_code: &'a str,
    pub top_level_code: &'a str,
    pub run_code: &'a str,
}

impl Default for TemplateParams<'_> {
    fn default() -> Self {
        Self {
            contract_name: CONTRACT_NAME,
            global_code: "",
            top_level_code: "",
            run_code: "",
        }
    }
}

// Checksummed form of the log address; the trailing bytes spell "console.log".
const CONSOLE_LIBRARY: &str = r#"library console {
    address constant CONSOLE_ADDRESS = 0x000000000000000000636F6e736F6c652e6c6f67;

    function _send(bytes memory payload) private view {
        address console_addr = CONSOLE_ADDRESS;
        assembly {
            pop(staticcall(gas(), console_addr, add(payload, 32), mload(payload), 0, 0))
        }
    }

    function log(uint256 p0) internal view { _send(abi.encodeWithSignature("log(uint256)", p0)); }
    function log(int256 p0) internal view { _send(abi.encodeWithSignature("log(int256)", p0)); }
    function log(string memory p0) internal view { _send(abi.encodeWithSignature("log(string)", p0)); }
    function log(bool p0) internal view { _send(abi.encodeWithSignature("log(bool)", p0)); }
    function log(address p0) internal view { _send(abi.encodeWithSignature("log(address)", p0)); }
    function log(bytes memory p0) internal view { _send(abi.encodeWithSignature("log(bytes)", p0)); }
    function log(bytes32 p0) internal view { _send(abi.encodeWithSignature("log(bytes32)", p0)); }
    function log(uint256 p0, uint256 p1) internal view { _send(abi.encodeWithSignature("log(uint256,uint256)", p0, p1)); }
    function log(string memory p0, uint256 p1) internal view { _send(abi.encodeWithSignature("log(string,uint256)", p0, p1)); }
    function log(string memory p0, string memory p1) internal view { _send(abi.encodeWithSignature("log(string,string)", p0, p1)); }
    function log(string memory p0, address p1) internal view { _send(abi.encodeWithSignature("log(string,address)", p0, p1)); }
    function log(string memory p0, bool p1) internal view { _send(abi.encodeWithSignature("log(string,bool)", p0, p1)); }
}"#;

const VM_LIBRARY: &str = r#"interface VM {
    function broadcast(uint256 privateKey) external returns (bool);
}

library vm {
    VM constant VM_ADDRESS = VM(address(uint160(0xf000000000000000000000000000000000000000)));

    function broadcast(uint256 privateKey) internal returns (bool) {
        return VM_ADDRESS.broadcast(privateKey);
    }
}"#;

/// Render the complete program text for a set of code regions.
pub fn render_program(params: &TemplateParams) -> String {
    format!(
        "// SPDX-License-Identifier: UNLICENSED\n\
         pragma solidity ^0.8.0;\n\
         \n\
         {console}\n\
         \n\
         {vm}\n\
         \n\
         {global}\n\
         \n\
         contract {name} {{\n\
         {top_level}\n\
         \n\
             /// @notice Script entry point\n\
             function run() public {{\n\
         {run}\n\
             }}\n\
         }}\n",
        console = CONSOLE_LIBRARY,
        vm = VM_LIBRARY,
        global = params.global_code,
        name = params.contract_name,
        top_level = indent(params.top_level_code, 4),
        run = indent(params.run_code, 8),
    )
}

fn indent(code: &str, width: usize) -> String {
    let pad = " ".repeat(width);
    code.lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("{pad}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_land_in_order() {
        let program = render_program(&TemplateParams {
            contract_name: "Demo",
            global_code: "struct Point { uint256 x; }",
            top_level_code: "uint256 counter;",
            run_code: "counter = 1;",
        });
        let global = program.find("struct Point").unwrap();
        let contract = program.find("contract Demo").unwrap();
        let member = program.find("uint256 counter;").unwrap();
        let stmt = program.find("counter = 1;").unwrap();
        assert!(global < contract && contract < member && member < stmt);
    }

    #[test]
    fn scaffold_always_carries_console_and_vm() {
        let program = render_program(&TemplateParams::default());
        assert!(program.contains("library console"));
        assert!(program.contains("function broadcast(uint256 privateKey)"));
        assert!(program.contains("function run() public"));
    }
}
