//! The native broadcast dispatcher.
//!
//! `vm.broadcast(privateKey)` in the generated contract calls a reserved
//! address. The precompile behind it arms a one-shot flag; the very next
//! sub-call observed by the pre-call hook is treated as the transaction to
//! broadcast: the signer account's nonce is bumped, the message caller is
//! rewritten to the signer, and a submission job is queued. The environment
//! drains the queue after the VM returns.

use crate::network::{BlockTag, NetworkError, RpcClient};
use ethereum_types::{H160 as Address, H256, U256};
use k256::ecdsa::SigningKey;
use sha3::{Digest, Keccak256};
use sol_evm::{CallHook, ExecError, Precompile, PrecompileOutput};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

/// Reserved dispatcher address the generated `vm` library targets.
pub const VM_PRECOMPILE: [u8; 20] = [
    0xf0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00,
];

/// 4-byte selector of `broadcast(uint256)`.
pub const BROADCAST_SELECTOR: [u8; 4] = [0xf6, 0x7a, 0x96, 0x5b];

const BROADCAST_GAS_LIMIT: u64 = 1_000_000;

pub fn vm_address() -> Address {
    Address::from_slice(&VM_PRECOMPILE)
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("invalid broadcast private key")]
    InvalidKey,
    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// A signed submission waiting for the end of the VM run.
#[derive(Debug, Clone)]
pub struct BroadcastJob {
    pub private_key: [u8; 32],
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Vec<u8>,
}

#[derive(Default)]
pub struct BroadcastState {
    armed: Option<[u8; 32]>,
    queued: Vec<BroadcastJob>,
}

impl BroadcastState {
    pub fn shared() -> Arc<Mutex<BroadcastState>> {
        Arc::new(Mutex::new(BroadcastState::default()))
    }

    pub fn drain(&mut self) -> Vec<BroadcastJob> {
        self.armed = None;
        std::mem::take(&mut self.queued)
    }
}

/// The precompile side: recognizes `broadcast(uint256)` and arms the flag.
/// Unknown selectors return empty success, matching a no-op native call.
pub struct BroadcastPrecompile {
    state: Arc<Mutex<BroadcastState>>,
}

impl BroadcastPrecompile {
    pub fn new(state: Arc<Mutex<BroadcastState>>) -> Self {
        Self { state }
    }
}

impl Precompile for BroadcastPrecompile {
    fn call(&mut self, input: &[u8]) -> Result<PrecompileOutput, ExecError> {
        if input.len() >= 36 && input[..4] == BROADCAST_SELECTOR {
            let mut key = [0u8; 32];
            key.copy_from_slice(&input[4..36]);
            if let Ok(mut state) = self.state.lock() {
                state.armed = Some(key);
            }
            debug!("broadcast armed");
            let mut word = [0u8; 32];
            word[31] = 1; // ABI-encoded `true`
            return Ok(PrecompileOutput {
                return_data: word.to_vec(),
                gas_used: 1,
            });
        }
        Ok(PrecompileOutput {
            return_data: Vec::new(),
            gas_used: 1,
        })
    }
}

/// The hook side: when armed, the next sub-call (other than the dispatcher
/// itself) is rewritten to originate from the key's signer and queued.
pub fn broadcast_hook(state: Arc<Mutex<BroadcastState>>) -> CallHook {
    Box::new(move |msg, overlay| {
        if msg.to == vm_address() {
            return;
        }
        let Ok(mut st) = state.lock() else { return };
        let Some(key) = st.armed.take() else { return };
        let Some(from) = signer_address(&key) else {
            warn!("broadcast armed with an invalid key; ignoring");
            return;
        };
        if let Ok(mut account) = overlay.account(&from) {
            account.nonce += 1;
            overlay.put_account(from, account);
        }
        msg.caller = from;
        debug!(%from, to = %msg.to, "broadcast call queued");
        st.queued.push(BroadcastJob {
            private_key: key,
            from,
            to: msg.to,
            value: msg.value,
            data: msg.data.clone(),
        });
    })
}

/// Ethereum address of a secp256k1 private key: the low 20 bytes of the
/// Keccak of the uncompressed public key.
pub fn signer_address(key: &[u8; 32]) -> Option<Address> {
    let signing = SigningKey::from_bytes(key.into()).ok()?;
    let point = signing.verifying_key().to_encoded_point(false);
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    Some(Address::from_slice(&hash[12..]))
}

/// Sign and submit a queued job as an EIP-155 legacy transaction.
pub fn submit(job: &BroadcastJob, rpc: &RpcClient, chain_id: u64) -> Result<H256, BroadcastError> {
    let nonce = rpc.transaction_count(&job.from, BlockTag::Latest)?;
    let gas_price = rpc.gas_price()?;
    let raw = sign_legacy_transaction(
        &job.private_key,
        nonce,
        gas_price,
        BROADCAST_GAS_LIMIT,
        &job.to,
        job.value,
        &job.data,
        chain_id,
    )?;
    Ok(rpc.send_raw_transaction(&raw)?)
}

#[allow(clippy::too_many_arguments)]
pub fn sign_legacy_transaction(
    key: &[u8; 32],
    nonce: u64,
    gas_price: U256,
    gas_limit: u64,
    to: &Address,
    value: U256,
    data: &[u8],
    chain_id: u64,
) -> Result<Vec<u8>, BroadcastError> {
    let signing = SigningKey::from_bytes(key.into()).map_err(|_| BroadcastError::InvalidKey)?;

    let mut unsigned = rlp::RlpStream::new_list(9);
    unsigned
        .append(&nonce)
        .append(&gas_price)
        .append(&gas_limit)
        .append(to)
        .append(&value)
        .append(&data.to_vec())
        .append(&chain_id)
        .append(&0u8)
        .append(&0u8);
    let hash = Keccak256::digest(unsigned.out());

    let (signature, recovery) = signing
        .sign_prehash_recoverable(&hash)
        .map_err(|_| BroadcastError::InvalidKey)?;
    let r = U256::from_big_endian(&signature.r().to_bytes());
    let s = U256::from_big_endian(&signature.s().to_bytes());
    let v = chain_id * 2 + 35 + u64::from(recovery.to_byte());

    let mut signed = rlp::RlpStream::new_list(9);
    signed
        .append(&nonce)
        .append(&gas_price)
        .append(&gas_limit)
        .append(to)
        .append(&value)
        .append(&data.to_vec())
        .append(&v)
        .append(&r)
        .append(&s);
    Ok(signed.out().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sol_evm::{Evm, Message, Overlay};

    // the classic test key; its address is a fixed point of the derivation
    fn test_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        key[31] = 1;
        key
    }

    #[test]
    fn key_one_derives_the_known_address() {
        // keccak(G)[12..] for the generator point
        let expected: Address = "7e5f4552091a69125d5dfcb7b8c2659029395bdf"
            .parse()
            .unwrap();
        assert_eq!(signer_address(&test_key()), Some(expected));
    }

    #[test]
    fn zero_key_is_rejected() {
        assert_eq!(signer_address(&[0u8; 32]), None);
    }

    #[test]
    fn arming_then_calling_rewrites_caller_and_queues() {
        let state = BroadcastState::shared();
        let mut precompile = BroadcastPrecompile::new(state.clone());

        let mut input = BROADCAST_SELECTOR.to_vec();
        let mut word = [0u8; 32];
        word[31] = 1;
        input.extend_from_slice(&word);
        let out = precompile.call(&input).unwrap();
        assert_eq!(out.return_data[31], 1);

        let mut hook = broadcast_hook(state.clone());
        let mut overlay = Overlay::in_memory();
        let mut msg = Message {
            caller: Address::zero(),
            to: Address::repeat_byte(0x42),
            value: U256::from(5),
            data: vec![0xab],
        };
        hook(&mut msg, &mut overlay);

        let signer = signer_address(&test_key()).unwrap();
        assert_eq!(msg.caller, signer);
        assert_eq!(overlay.account(&signer).unwrap().nonce, 1);

        let jobs = state.lock().unwrap().drain();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].to, Address::repeat_byte(0x42));
        assert_eq!(jobs[0].value, U256::from(5));

        // one-shot: a second call passes through untouched
        let mut second = Message {
            caller: Address::zero(),
            to: Address::repeat_byte(0x43),
            value: U256::zero(),
            data: Vec::new(),
        };
        hook(&mut second, &mut overlay);
        assert_eq!(second.caller, Address::zero());
        assert!(state.lock().unwrap().drain().is_empty());
    }

    #[test]
    fn unknown_selector_is_a_silent_success() {
        let state = BroadcastState::shared();
        let mut precompile = BroadcastPrecompile::new(state.clone());
        let out = precompile.call(&[0xde, 0xad, 0xbe, 0xef]).unwrap();
        assert!(out.return_data.is_empty());
        assert!(state.lock().unwrap().armed.is_none());
    }

    #[test]
    fn signed_transaction_is_canonical_rlp() {
        let raw = sign_legacy_transaction(
            &test_key(),
            0,
            U256::from(1_000_000_000u64),
            21_000,
            &Address::repeat_byte(0x11),
            U256::from(1),
            &[],
            1,
        )
        .unwrap();
        let decoded = rlp::Rlp::new(&raw);
        assert!(decoded.is_list());
        assert_eq!(decoded.item_count().unwrap(), 9);
        let v: u64 = decoded.val_at(6).unwrap();
        assert!(v == 37 || v == 38, "EIP-155 v for chain 1, got {v}");
    }

    // the dispatcher wired into a real Evm instance
    #[test]
    fn evm_call_to_dispatcher_arms_the_flag() {
        let state = BroadcastState::shared();
        let mut evm = Evm::new(Overlay::in_memory());
        evm.set_precompile(vm_address(), Box::new(BroadcastPrecompile::new(state.clone())));
        evm.add_call_hook(broadcast_hook(state.clone()));

        // memory[0..36] = selector ++ key word (1); CALL dispatcher;
        // then CALL 0x42 to trigger the hook
        let mut code = vec![
            0x63, 0xf6, 0x7a, 0x96, 0x5b, // PUSH4 selector
            0x60, 0xe0, 0x1b, // PUSH1 0xe0; SHL
            0x60, 0x00, 0x52, // MSTORE at 0
            0x60, 0x01, 0x60, 0x04, 0x52, // MSTORE key=1 at 4
            0x60, 0x00, 0x60, 0x00, // out len/off
            0x60, 0x24, 0x60, 0x00, // in len 36, off 0
            0x60, 0x00, 0x73, // value 0, PUSH20
        ];
        code.extend_from_slice(&VM_PRECOMPILE);
        code.extend_from_slice(&[0x61, 0xff, 0xff, 0xf1, 0x50]); // CALL; POP
        code.extend_from_slice(&[
            0x60, 0x00, 0x60, 0x00, 0x60, 0x00, 0x60, 0x00, 0x60, 0x00, 0x73,
        ]);
        code.extend_from_slice(Address::repeat_byte(0x42).as_bytes());
        code.extend_from_slice(&[0x61, 0xff, 0xff, 0xf1, 0x50, 0x00]); // CALL; POP; STOP

        evm.run_code(sol_evm::RunParams {
            code,
            data: Vec::new(),
            value: U256::zero(),
            caller: Address::zero(),
            address: Address::repeat_byte(0xaa),
            gas_limit: u64::MAX,
        })
        .unwrap();

        let jobs = state.lock().unwrap().drain();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].to, Address::repeat_byte(0x42));
        assert_eq!(jobs[0].from, signer_address(&test_key()).unwrap());
    }
}
