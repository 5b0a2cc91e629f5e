//! Simulated EVM for the Solidity scratchpad.
//!
//! Goals:
//! - deterministic execution of compiler output for small scripts
//! - state behind a pluggable backend so a remote fork can supply accounts
//! - copy-on-write overlays so re-run branches never alias mutable state
//! - pre-call hooks and custom precompiles as the only extension points
//!
//! Gas is a flat per-step charge against the caller's allowance; accurate
//! metering is out of scope.

pub mod interp;
pub mod state;

pub use interp::{
    CallHook, Evm, ExecError, ExecResult, Message, Precompile, PrecompileOutput, RunParams,
};
pub use state::{Account, BackendError, EmptyBackend, Overlay, StateBackend};
