//! The fragment orchestrator.
//!
//! Fragments are editable blocks with an explicit region kind. Running one
//! compiles the latest snapshot's accumulated source extended with the
//! fragment's code, executes the result in a fresh environment, and — only
//! on full success — appends a new snapshot and assigns the next global run
//! index. Failures of any stage land on the fragment and leave the snapshot
//! history exactly as it was.

use crate::compiler::{CompileFailure, Compiler, Diagnostic};
use crate::env::Environment;
use crate::network::Network;
use crate::source::{CodeKind, CompileMode, DecodedVariable, Source};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub type FragmentId = u64;

#[derive(Debug, Error)]
pub enum NotebookError {
    #[error("unknown fragment {0}")]
    UnknownFragment(FragmentId),
    #[error("fragment {0} is already running")]
    AlreadyRunning(FragmentId),
    #[error("worker task failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FragmentState {
    Idle,
    Running,
    Success,
    Error,
}

/// Why a run failed: rejected by the compiler (verbatim diagnostics) or
/// aborted during execution.
#[derive(Debug, Clone, Serialize)]
pub enum FragmentFailure {
    Compile(Vec<Diagnostic>),
    Execution(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct FragmentResult {
    /// Captured expression text, when the block ended in one.
    pub variable: Option<String>,
    /// Rendered value of the captured expression.
    pub value: Option<String>,
    /// Console lines emitted during the run.
    pub logs: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Fragment {
    pub id: FragmentId,
    pub code: String,
    pub kind: CodeKind,
    pub state: FragmentState,
    pub result: Option<FragmentResult>,
    pub error: Option<FragmentFailure>,
    /// Global run index of the last successful run.
    pub run_index: Option<u64>,
}

/// Immutable record of one successful run.
pub struct Snapshot {
    pub fragment_id: FragmentId,
    pub run_index: u64,
    pub source: Source,
    pub logs: Vec<Vec<String>>,
    pub env: Arc<Environment>,
}

pub struct Notebook {
    compiler: Arc<dyn Compiler>,
    fragments: Vec<Fragment>,
    snapshots: Vec<Snapshot>,
    next_id: FragmentId,
    run_index: u64,
}

struct RunSuccess {
    source: Source,
    env: Environment,
    logs: Vec<Vec<String>>,
    variable: Option<DecodedVariable>,
}

impl Notebook {
    pub fn new(compiler: Arc<dyn Compiler>) -> Self {
        Self {
            compiler,
            fragments: Vec::new(),
            snapshots: Vec::new(),
            next_id: 0,
            run_index: 0,
        }
    }

    pub fn add_fragment(&mut self, code: impl Into<String>, kind: CodeKind) -> FragmentId {
        let id = self.next_id;
        self.next_id += 1;
        self.fragments.push(Fragment {
            id,
            code: code.into(),
            kind,
            state: FragmentState::Idle,
            result: None,
            error: None,
            run_index: None,
        });
        id
    }

    /// Replace a fragment's code. The displayed outcome no longer matches
    /// the text, so the fragment returns to `Idle` with result and error
    /// cleared; the run index from its last successful run is kept.
    pub fn set_fragment_code(
        &mut self,
        id: FragmentId,
        code: impl Into<String>,
    ) -> Result<(), NotebookError> {
        let fragment = self.fragment_mut(id)?;
        fragment.code = code.into();
        fragment.state = FragmentState::Idle;
        fragment.result = None;
        fragment.error = None;
        Ok(())
    }

    pub fn fragment(&self, id: FragmentId) -> Option<&Fragment> {
        self.fragments.iter().find(|f| f.id == id)
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    fn fragment_mut(&mut self, id: FragmentId) -> Result<&mut Fragment, NotebookError> {
        self.fragments
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or(NotebookError::UnknownFragment(id))
    }

    /// Run one fragment against `network`.
    ///
    /// The outcome lands on the fragment itself; the returned error covers
    /// orchestration problems only (unknown id, double run, worker loss).
    /// Re-running an earlier fragment branches from the latest snapshot and
    /// leaves later fragments' displayed results stale by design.
    ///
    /// Runs serialize through `&mut self`. A fragment can still be observed
    /// as `Running` when a previous `run_fragment` future was dropped at its
    /// await point (timeout, caller cancellation): the worker keeps going
    /// detached, and a new run of that fragment is rejected until the
    /// fragment is edited again (`set_fragment_code` resets it to `Idle`).
    pub async fn run_fragment(
        &mut self,
        id: FragmentId,
        network: &Network,
    ) -> Result<(), NotebookError> {
        let base = self
            .snapshots
            .last()
            .map(|s| s.source.clone())
            .unwrap_or_default();

        let fragment = self.fragment_mut(id)?;
        if fragment.state == FragmentState::Running {
            return Err(NotebookError::AlreadyRunning(id));
        }
        fragment.state = FragmentState::Running;
        fragment.result = None;
        fragment.error = None;
        let code = fragment.code.clone();
        let kind = fragment.kind;

        let compiler = self.compiler.clone();
        let network = network.clone();
        debug!(fragment = id, ?kind, "running fragment");
        let outcome = tokio::task::spawn_blocking(move || {
            execute_pipeline(&base, &code, kind, compiler.as_ref(), &network)
        })
        .await
        .map_err(|e| {
            // the worker never returns normally here; mark the fragment too
            if let Ok(f) = self.fragment_mut(id) {
                f.state = FragmentState::Error;
            }
            NotebookError::Worker(e.to_string())
        })?;

        match outcome {
            Ok(success) => {
                let run_index = self.run_index;
                self.run_index += 1;
                let fragment = self.fragment_mut(id)?;
                fragment.state = FragmentState::Success;
                fragment.run_index = Some(run_index);
                fragment.result = Some(FragmentResult {
                    variable: success.variable.as_ref().map(|v| v.name.clone()),
                    value: success.variable.as_ref().map(|v| v.value.to_string()),
                    logs: success.logs.clone(),
                });
                info!(fragment = id, run_index, "fragment succeeded");
                self.snapshots.push(Snapshot {
                    fragment_id: id,
                    run_index,
                    source: success.source,
                    logs: success.logs,
                    env: Arc::new(success.env),
                });
            }
            Err(failure) => {
                let fragment = self.fragment_mut(id)?;
                fragment.state = FragmentState::Error;
                fragment.error = Some(failure);
                debug!(fragment = id, "fragment failed");
            }
        }
        Ok(())
    }
}

fn execute_pipeline(
    base: &Source,
    code: &str,
    kind: CodeKind,
    compiler: &dyn Compiler,
    network: &Network,
) -> Result<RunSuccess, FragmentFailure> {
    let lines: Vec<String> = code.trim().lines().map(str::to_string).collect();
    let outcome = base
        .try_compile_new_code(&lines, kind, compiler)
        .map_err(|e| match e {
            CompileFailure::Diagnostics(diagnostics) => FragmentFailure::Compile(diagnostics),
            other => FragmentFailure::Execution(other.to_string()),
        })?;

    let mut env = Environment::create(network)
        .map_err(|e| FragmentFailure::Execution(e.to_string()))?;
    let with_stop = outcome.mode == CompileMode::VariableDeclaration;
    let result = env
        .run_source(&outcome.source, with_stop)
        .map_err(|e| FragmentFailure::Execution(e.to_string()))?;

    let variable = match &outcome.variable {
        Some(meta) => Some(
            Source::decode_variable(&result.return_data, meta)
                .map_err(|e| FragmentFailure::Execution(e.to_string()))?,
        ),
        None => None,
    };

    let logs = env.logs();
    Ok(RunSuccess {
        source: outcome.source,
        env,
        logs,
        variable,
    })
}
