//! Interactive Solidity scratchpad core.
//!
//! Editable code fragments accumulate into one generated contract; each run
//! recompiles the accumulated program, executes it in a fresh simulated EVM
//! (optionally forked from a live endpoint), and records an immutable
//! snapshot so any fragment can be re-run or rolled back safely.
//!
//! Flow: [`Notebook::run_fragment`] → [`Source::try_compile_new_code`] →
//! [`Environment::run_source`] → decode + snapshot.

pub mod broadcast;
pub mod compiler;
pub mod env;
pub mod network;
pub mod notebook;
pub mod source;
pub mod template;

pub use compiler::{CompileFailure, Compiler, CompilerOutput, Diagnostic, SolcCompiler};
pub use env::{Environment, EnvError};
pub use network::{AccountFetcher, Network, NetworkError, RemoteBackend, RpcClient};
pub use notebook::{
    Fragment, FragmentFailure, FragmentId, FragmentResult, FragmentState, Notebook, NotebookError,
    Snapshot,
};
pub use source::{
    CodeKind, CompileMode, CompileOutcome, DecodedVariable, Source, SourceError, VariableMeta,
};
pub use template::{render_program, TemplateParams, CONTRACT_NAME, RUN_SELECTOR, SOURCE_NAME};
