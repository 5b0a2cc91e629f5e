//! One execution environment per fragment run.
//!
//! Creation wires the VM with exactly one precompile (the broadcast
//! dispatcher) and two pre-call hooks (console capture, broadcast observe).
//! With a remote endpoint configured, chain state is forked at the block
//! observed here and every account read falls through to it; without one,
//! the world starts empty.

use crate::broadcast::{self, BroadcastPrecompile, BroadcastState, BroadcastError};
use crate::network::{DefaultFetcher, Network, NetworkError, RemoteBackend, RpcClient};
use crate::source::Source;
use crate::template::RUN_SELECTOR;
use ethereum_types::{H160 as Address, U256};
use sol_decode::parse_console_call;
use sol_evm::{Account, Evm, ExecError, ExecResult, Overlay, RunParams};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("deployment failed: {0}")]
    Deployment(#[source] ExecError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
    #[error("source has no compiled artifacts")]
    NotCompiled,
}

/// Address script bytecode executes at.
pub const SCRIPT_ADDRESS: [u8; 20] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Pre-funded account available to scripts in local mode.
pub const FUNDED_ADDRESS: [u8; 20] = [
    0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00,
];

pub fn script_address() -> Address {
    Address::from_slice(&SCRIPT_ADDRESS)
}

type LogList = Arc<Mutex<Vec<Vec<String>>>>;

pub struct Environment {
    evm: Evm,
    network: Network,
    rpc: Option<RpcClient>,
    block: u64,
    logs: LogList,
    broadcast: Arc<Mutex<BroadcastState>>,
}

impl Environment {
    /// Build an environment for `network`, pinning remote state to the
    /// endpoint's current block when one is configured.
    pub fn create(network: &Network) -> Result<Self, EnvError> {
        let (overlay, rpc, block) = match &network.rpc {
            None => (Overlay::in_memory(), None, 0),
            Some(url) => {
                let rpc = RpcClient::new(url.clone());
                let block = rpc.block_number()?;
                debug!(network = %network.name, block, "forking remote state");
                let fetcher = network
                    .account_fetcher
                    .clone()
                    .unwrap_or_else(|| Arc::new(DefaultFetcher));
                let backend = RemoteBackend::new(rpc.clone(), block, fetcher);
                (Overlay::new(Arc::new(backend)), Some(rpc), block)
            }
        };
        Ok(Self::assemble(overlay, network.clone(), rpc, block))
    }

    fn assemble(overlay: Overlay, network: Network, rpc: Option<RpcClient>, block: u64) -> Self {
        let mut evm = Evm::new(overlay);
        evm.chain_id = network.chain_id;
        evm.block_number = block;

        let logs: LogList = Arc::new(Mutex::new(Vec::new()));
        let console_logs = logs.clone();
        evm.add_call_hook(Box::new(move |msg, _state| {
            if let Some(entry) = parse_console_call(&msg.to, &msg.data) {
                if let Ok(mut list) = console_logs.lock() {
                    list.push(entry);
                }
            }
        }));

        let broadcast = BroadcastState::shared();
        evm.add_call_hook(broadcast::broadcast_hook(broadcast.clone()));
        evm.set_precompile(
            broadcast::vm_address(),
            Box::new(BroadcastPrecompile::new(broadcast.clone())),
        );

        let mut env = Self {
            evm,
            network,
            rpc,
            block,
            logs,
            broadcast,
        };
        env.fund_default_account();
        env
    }

    fn fund_default_account(&mut self) {
        self.evm.state_mut().put_account(
            Address::from_slice(&FUNDED_ADDRESS),
            Account {
                balance: U256::exp10(18),
                ..Default::default()
            },
        );
    }

    /// Independent branch sharing the historical chain data: the state
    /// overlay is copied, the log list and broadcast flag start fresh.
    pub fn shadow_clone(&self) -> Self {
        Self::assemble(
            self.evm.state().shadow_clone(),
            self.network.clone(),
            self.rpc.clone(),
            self.block,
        )
    }

    /// Run init code and install the returned runtime code at `address`.
    pub fn deploy_contract(
        &mut self,
        init_code: &[u8],
        address: Address,
    ) -> Result<Address, EnvError> {
        let result = self
            .evm
            .run_code(RunParams {
                code: init_code.to_vec(),
                data: Vec::new(),
                value: U256::zero(),
                caller: Address::zero(),
                address,
                gas_limit: u64::MAX,
            })
            .map_err(EnvError::Deployment)?;
        self.evm
            .state_mut()
            .set_code(address, result.return_data)
            .map_err(ExecError::from)?;
        Ok(address)
    }

    /// Execute a compiled source's deployed bytecode through `run()`.
    ///
    /// `with_stop` appends a STOP so a capture-mode program halts cleanly
    /// after its synthetic return. VM exceptions (including top-level
    /// reverts) propagate untranslated; queued broadcast jobs are submitted
    /// after the run.
    pub fn run_source(&mut self, source: &Source, with_stop: bool) -> Result<ExecResult, EnvError> {
        let mut code = source
            .deployed_bytecode()
            .ok_or(EnvError::NotCompiled)?
            .to_vec();
        if with_stop {
            code.push(0x00);
        }
        debug!(bytes = code.len(), with_stop, "executing script");
        let result = self.evm.run_code(RunParams {
            code,
            data: RUN_SELECTOR.to_vec(),
            value: U256::zero(),
            caller: Address::from_slice(&FUNDED_ADDRESS),
            address: script_address(),
            gas_limit: u64::MAX,
        })?;
        self.submit_broadcasts()?;
        Ok(result)
    }

    /// Drain queued broadcast jobs. Without an endpoint the state effects
    /// stand but nothing is submitted.
    fn submit_broadcasts(&mut self) -> Result<(), EnvError> {
        let jobs = match self.broadcast.lock() {
            Ok(mut state) => state.drain(),
            Err(_) => Vec::new(),
        };
        if jobs.is_empty() {
            return Ok(());
        }
        let Some(rpc) = &self.rpc else {
            debug!(count = jobs.len(), "no endpoint; dropping broadcast jobs");
            return Ok(());
        };
        for job in &jobs {
            match broadcast::submit(job, rpc, self.network.chain_id) {
                Ok(hash) => {
                    if let Ok(mut list) = self.logs.lock() {
                        list.push(vec![
                            "broadcast transaction:".to_string(),
                            format!("{hash:?}"),
                        ]);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "broadcast submission failed");
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Snapshot of the console lines captured so far, in call order.
    pub fn logs(&self) -> Vec<Vec<String>> {
        self.logs.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn block(&self) -> u64 {
        self.block
    }

    pub fn evm_mut(&mut self) -> &mut Evm {
        &mut self.evm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Network;

    fn local_env() -> Environment {
        Environment::create(&Network::local("dev")).unwrap()
    }

    #[test]
    fn local_creation_needs_no_endpoint() {
        let env = local_env();
        assert_eq!(env.block(), 0);
        assert!(env.logs().is_empty());
    }

    #[test]
    fn deploy_installs_runtime_code() {
        let mut env = local_env();
        // init code returning one byte of runtime code (0x00)
        let init = [
            0x60, 0x00, 0x60, 0x00, 0x53, // MSTORE8 0 at 0
            0x60, 0x01, 0x60, 0x00, 0xf3, // RETURN mem[0..1]
        ];
        let target = Address::repeat_byte(0x77);
        env.deploy_contract(&init, target).unwrap();
        assert_eq!(env.evm_mut().state_mut().code(&target).unwrap(), vec![0x00]);
    }

    #[test]
    fn failed_deploy_is_a_deployment_error() {
        let mut env = local_env();
        let revert = [0x60, 0x00, 0x60, 0x00, 0xfd];
        assert!(matches!(
            env.deploy_contract(&revert, Address::repeat_byte(0x77)),
            Err(EnvError::Deployment(_))
        ));
    }

    #[test]
    fn shadow_clone_starts_with_fresh_logs_and_shared_history() {
        let mut env = local_env();
        env.evm_mut().state_mut().set_storage(
            Address::zero(),
            ethereum_types::H256::zero(),
            ethereum_types::H256::repeat_byte(1),
        );
        if let Ok(mut list) = env.logs.lock() {
            list.push(vec!["x".into()]);
        }
        let mut clone = env.shadow_clone();
        assert!(clone.logs().is_empty());
        assert_eq!(
            clone
                .evm_mut()
                .state_mut()
                .storage(&Address::zero(), &ethereum_types::H256::zero())
                .unwrap(),
            ethereum_types::H256::repeat_byte(1)
        );
    }
}
