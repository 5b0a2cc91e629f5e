//! The interpreter: a single dispatch loop over the EVM opcode subset that
//! compiler output for small scripts actually uses.
//!
//! Extension points are pre-call hooks (fired for every sub-call before it
//! is dispatched, with mutable access to the message and the state) and
//! custom precompiles keyed by address. A sub-call to an address with no
//! code succeeds with empty return data, which is what makes the console
//! logging address callable.

use crate::state::{BackendError, Overlay};
use ethereum_types::{H160 as Address, H256, U256};
use sha3::{Digest, Keccak256};
use sol_decode::opcodes as op;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

pub type Gas = u64;

const MAX_DEPTH: usize = 64;
const MAX_MEMORY: usize = 1 << 26;
const STACK_LIMIT: usize = 1024;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("out of gas")]
    OutOfGas,
    #[error("stack underflow in {op}")]
    StackUnderflow { op: &'static str },
    #[error("stack limit exceeded")]
    StackOverflow,
    #[error("invalid opcode 0x{0:02x}")]
    InvalidOpcode(u8),
    #[error("invalid jump destination {0}")]
    InvalidJump(usize),
    #[error("reverted: 0x{}", hex::encode(.0))]
    Revert(Vec<u8>),
    #[error("call depth limit exceeded")]
    DepthLimit,
    #[error("memory access out of range")]
    MemoryRange,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// A sub-call observed by the pre-call hooks. Hooks may rewrite the caller.
#[derive(Debug, Clone)]
pub struct Message {
    pub caller: Address,
    pub to: Address,
    pub value: U256,
    pub data: Vec<u8>,
}

pub struct PrecompileOutput {
    pub return_data: Vec<u8>,
    pub gas_used: Gas,
}

/// A native capability reachable at a fixed address from executed code.
pub trait Precompile: Send {
    fn call(&mut self, input: &[u8]) -> Result<PrecompileOutput, ExecError>;
}

pub type CallHook = Box<dyn FnMut(&mut Message, &mut Overlay) + Send>;

pub struct RunParams {
    pub code: Vec<u8>,
    pub data: Vec<u8>,
    pub value: U256,
    pub caller: Address,
    pub address: Address,
    pub gas_limit: Gas,
}

pub struct ExecResult {
    pub return_data: Vec<u8>,
    pub gas_used: Gas,
}

struct GasMeter {
    limit: Gas,
    used: Gas,
}

impl GasMeter {
    fn charge(&mut self, units: Gas) -> Result<(), ExecError> {
        self.used = self.used.saturating_add(units);
        if self.used > self.limit {
            return Err(ExecError::OutOfGas);
        }
        Ok(())
    }

    fn remaining(&self) -> Gas {
        self.limit.saturating_sub(self.used)
    }
}

pub struct Evm {
    state: Overlay,
    hooks: Vec<CallHook>,
    precompiles: BTreeMap<Address, Box<dyn Precompile>>,
    pub chain_id: u64,
    pub block_number: u64,
}

impl Evm {
    pub fn new(state: Overlay) -> Self {
        Self {
            state,
            hooks: Vec::new(),
            precompiles: BTreeMap::new(),
            chain_id: 1,
            block_number: 0,
        }
    }

    pub fn state(&self) -> &Overlay {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut Overlay {
        &mut self.state
    }

    pub fn add_call_hook(&mut self, hook: CallHook) {
        self.hooks.push(hook);
    }

    pub fn set_precompile(&mut self, address: Address, precompile: Box<dyn Precompile>) {
        self.precompiles.insert(address, precompile);
    }

    /// Execute `code` in the context of `address`. Exceptions at the top
    /// level (including REVERT) propagate untranslated.
    pub fn run_code(&mut self, params: RunParams) -> Result<ExecResult, ExecError> {
        let msg = Message {
            caller: params.caller,
            to: params.address,
            value: params.value,
            data: params.data,
        };
        let mut gas = GasMeter {
            limit: params.gas_limit,
            used: 0,
        };
        let return_data = self.execute(&params.code, &msg, &mut gas, 0)?;
        Ok(ExecResult {
            return_data,
            gas_used: gas.used,
        })
    }

    /// Dispatch a sub-call: hooks, value transfer, then precompile / code /
    /// empty-account no-op. Returns (success, return data); a revert inside
    /// the callee is a failed call, not an error.
    fn sub_call(
        &mut self,
        mut msg: Message,
        gas: &mut GasMeter,
        depth: usize,
    ) -> Result<(bool, Vec<u8>), ExecError> {
        if depth > MAX_DEPTH {
            return Err(ExecError::DepthLimit);
        }

        let mut hooks = std::mem::take(&mut self.hooks);
        for hook in hooks.iter_mut() {
            hook(&mut msg, &mut self.state);
        }
        hooks.append(&mut self.hooks);
        self.hooks = hooks;

        if !self.state.transfer(&msg.caller, &msg.to, msg.value)? {
            return Ok((false, Vec::new()));
        }

        if let Some(precompile) = self.precompiles.get_mut(&msg.to) {
            let out = precompile.call(&msg.data)?;
            gas.charge(out.gas_used)?;
            return Ok((true, out.return_data));
        }

        let code = self.state.code(&msg.to)?;
        if code.is_empty() {
            return Ok((true, Vec::new()));
        }

        match self.execute(&code, &msg, gas, depth) {
            Ok(data) => Ok((true, data)),
            Err(ExecError::Revert(data)) => Ok((false, data)),
            Err(e) => Err(e),
        }
    }

    fn execute(
        &mut self,
        code: &[u8],
        msg: &Message,
        gas: &mut GasMeter,
        depth: usize,
    ) -> Result<Vec<u8>, ExecError> {
        let jumpdests = valid_jumpdests(code);
        let mut stack: Vec<U256> = Vec::new();
        let mut memory: Vec<u8> = Vec::new();
        let mut return_buf: Vec<u8> = Vec::new();
        let mut pc = 0usize;

        loop {
            let opcode = match code.get(pc) {
                Some(b) => *b,
                None => return Ok(Vec::new()), // running off the end halts
            };
            gas.charge(1)?;

            match opcode {
                op::STOP => return Ok(Vec::new()),

                op::ADD | op::MUL | op::SUB | op::DIV | op::SDIV | op::MOD | op::SMOD
                | op::EXP => {
                    let a = pop(&mut stack, opcode)?;
                    let b = pop(&mut stack, opcode)?;
                    let r = match opcode {
                        op::ADD => a.overflowing_add(b).0,
                        op::MUL => a.overflowing_mul(b).0,
                        op::SUB => a.overflowing_sub(b).0,
                        op::DIV => {
                            if b.is_zero() {
                                U256::zero()
                            } else {
                                a / b
                            }
                        }
                        op::SDIV => sdiv(a, b),
                        op::MOD => {
                            if b.is_zero() {
                                U256::zero()
                            } else {
                                a % b
                            }
                        }
                        op::SMOD => smod(a, b),
                        _ => a.overflowing_pow(b).0,
                    };
                    push(&mut stack, r)?;
                }

                op::SIGNEXTEND => {
                    let k = pop(&mut stack, opcode)?;
                    let v = pop(&mut stack, opcode)?;
                    push(&mut stack, signextend(k, v))?;
                }

                op::LT | op::GT | op::SLT | op::SGT | op::EQ => {
                    let a = pop(&mut stack, opcode)?;
                    let b = pop(&mut stack, opcode)?;
                    let r = match opcode {
                        op::LT => a < b,
                        op::GT => a > b,
                        op::SLT => slt(a, b),
                        op::SGT => slt(b, a),
                        _ => a == b,
                    };
                    push(&mut stack, bool_word(r))?;
                }

                op::ISZERO => {
                    let a = pop(&mut stack, opcode)?;
                    push(&mut stack, bool_word(a.is_zero()))?;
                }

                op::AND | op::OR | op::XOR => {
                    let a = pop(&mut stack, opcode)?;
                    let b = pop(&mut stack, opcode)?;
                    let r = match opcode {
                        op::AND => a & b,
                        op::OR => a | b,
                        _ => a ^ b,
                    };
                    push(&mut stack, r)?;
                }

                op::NOT => {
                    let a = pop(&mut stack, opcode)?;
                    push(&mut stack, !a)?;
                }

                op::BYTE => {
                    let i = pop(&mut stack, opcode)?;
                    let x = pop(&mut stack, opcode)?;
                    let r = if i >= U256::from(32) {
                        U256::zero()
                    } else {
                        U256::from(x.byte(31 - i.as_usize()))
                    };
                    push(&mut stack, r)?;
                }

                op::SHL | op::SHR | op::SAR => {
                    let shift = pop(&mut stack, opcode)?;
                    let value = pop(&mut stack, opcode)?;
                    let r = match opcode {
                        op::SHL => {
                            if shift >= U256::from(256) {
                                U256::zero()
                            } else {
                                value << shift.as_usize()
                            }
                        }
                        op::SHR => {
                            if shift >= U256::from(256) {
                                U256::zero()
                            } else {
                                value >> shift.as_usize()
                            }
                        }
                        _ => sar(shift, value),
                    };
                    push(&mut stack, r)?;
                }

                op::KECCAK256 => {
                    let offset = word_to_usize(pop(&mut stack, opcode)?)?;
                    let len = word_to_usize(pop(&mut stack, opcode)?)?;
                    let data = mem_read(&mut memory, offset, len)?;
                    let hash = Keccak256::digest(&data);
                    push(&mut stack, U256::from_big_endian(&hash))?;
                }

                op::ADDRESS => push(&mut stack, address_word(&msg.to))?,
                op::CALLER | op::ORIGIN => push(&mut stack, address_word(&msg.caller))?,
                op::CALLVALUE => push(&mut stack, msg.value)?,

                op::BALANCE => {
                    let addr = word_to_address(pop(&mut stack, opcode)?);
                    let balance = self.state.balance(&addr)?;
                    push(&mut stack, balance)?;
                }
                op::SELFBALANCE => {
                    let balance = self.state.balance(&msg.to)?;
                    push(&mut stack, balance)?;
                }
                op::EXTCODESIZE => {
                    let addr = word_to_address(pop(&mut stack, opcode)?);
                    let size = self.state.code(&addr)?.len();
                    push(&mut stack, U256::from(size))?;
                }

                op::CALLDATALOAD => {
                    let offset = word_to_usize(pop(&mut stack, opcode)?)?;
                    let mut word = [0u8; 32];
                    copy_padded(&mut word, &msg.data, offset);
                    push(&mut stack, U256::from_big_endian(&word))?;
                }
                op::CALLDATASIZE => push(&mut stack, U256::from(msg.data.len()))?,
                op::CODESIZE => push(&mut stack, U256::from(code.len()))?,
                op::RETURNDATASIZE => push(&mut stack, U256::from(return_buf.len()))?,

                op::CALLDATACOPY | op::CODECOPY | op::RETURNDATACOPY => {
                    let dest = word_to_usize(pop(&mut stack, opcode)?)?;
                    let src_off = word_to_usize(pop(&mut stack, opcode)?)?;
                    let len = word_to_usize(pop(&mut stack, opcode)?)?;
                    mem_expand(&mut memory, dest, len)?;
                    let src = match opcode {
                        op::CALLDATACOPY => msg.data.as_slice(),
                        op::CODECOPY => code,
                        _ => return_buf.as_slice(),
                    };
                    if len > 0 {
                        copy_padded(&mut memory[dest..dest + len], src, src_off);
                    }
                }

                op::GASPRICE | op::TIMESTAMP | op::BASEFEE => push(&mut stack, U256::zero())?,
                op::NUMBER => push(&mut stack, U256::from(self.block_number))?,
                op::CHAINID => push(&mut stack, U256::from(self.chain_id))?,

                op::POP => {
                    pop(&mut stack, opcode)?;
                }

                op::MLOAD => {
                    let offset = word_to_usize(pop(&mut stack, opcode)?)?;
                    let word = mem_read(&mut memory, offset, 32)?;
                    push(&mut stack, U256::from_big_endian(&word))?;
                }
                op::MSTORE => {
                    let offset = word_to_usize(pop(&mut stack, opcode)?)?;
                    let value = pop(&mut stack, opcode)?;
                    let mut word = [0u8; 32];
                    value.to_big_endian(&mut word);
                    mem_write(&mut memory, offset, &word)?;
                }
                op::MSTORE8 => {
                    let offset = word_to_usize(pop(&mut stack, opcode)?)?;
                    let value = pop(&mut stack, opcode)?;
                    mem_write(&mut memory, offset, &[value.byte(0)])?;
                }
                op::MSIZE => push(&mut stack, U256::from(memory.len()))?,

                op::SLOAD => {
                    let key = word_to_h256(pop(&mut stack, opcode)?);
                    let value = self.state.storage(&msg.to, &key)?;
                    push(&mut stack, U256::from_big_endian(value.as_bytes()))?;
                }
                op::SSTORE => {
                    let key = word_to_h256(pop(&mut stack, opcode)?);
                    let value = word_to_h256(pop(&mut stack, opcode)?);
                    self.state.set_storage(msg.to, key, value);
                }

                op::JUMP => {
                    let dest = word_to_usize(pop(&mut stack, opcode)?)?;
                    if !jumpdests.contains(&dest) {
                        return Err(ExecError::InvalidJump(dest));
                    }
                    pc = dest;
                    continue;
                }
                op::JUMPI => {
                    let dest = word_to_usize(pop(&mut stack, opcode)?)?;
                    let cond = pop(&mut stack, opcode)?;
                    if !cond.is_zero() {
                        if !jumpdests.contains(&dest) {
                            return Err(ExecError::InvalidJump(dest));
                        }
                        pc = dest;
                        continue;
                    }
                }
                op::JUMPDEST => {}
                op::PC => push(&mut stack, U256::from(pc))?,
                op::GAS => push(&mut stack, U256::from(gas.remaining()))?,

                op::PUSH0 => push(&mut stack, U256::zero())?,
                _ if (op::PUSH1..=op::PUSH32).contains(&opcode) => {
                    let len = op::push_data_len(opcode);
                    let mut word = [0u8; 32];
                    copy_padded(&mut word[32 - len..], code, pc + 1);
                    push(&mut stack, U256::from_big_endian(&word))?;
                }

                _ if (op::DUP1..=op::DUP16).contains(&opcode) => {
                    let n = (opcode - op::DUP1) as usize + 1;
                    if stack.len() < n {
                        return Err(underflow(opcode));
                    }
                    let value = stack[stack.len() - n];
                    push(&mut stack, value)?;
                }
                _ if (op::SWAP1..=op::SWAP16).contains(&opcode) => {
                    let n = (opcode - op::SWAP1) as usize + 1;
                    if stack.len() < n + 1 {
                        return Err(underflow(opcode));
                    }
                    let top = stack.len() - 1;
                    stack.swap(top, top - n);
                }

                _ if (op::LOG0..=op::LOG4).contains(&opcode) => {
                    // events are dropped by the simulator
                    let topics = (opcode - op::LOG0) as usize;
                    for _ in 0..2 + topics {
                        pop(&mut stack, opcode)?;
                    }
                }

                op::CALL | op::STATICCALL => {
                    let _gas_arg = pop(&mut stack, opcode)?;
                    let to = word_to_address(pop(&mut stack, opcode)?);
                    let value = if opcode == op::CALL {
                        pop(&mut stack, opcode)?
                    } else {
                        U256::zero()
                    };
                    let in_off = word_to_usize(pop(&mut stack, opcode)?)?;
                    let in_len = word_to_usize(pop(&mut stack, opcode)?)?;
                    let out_off = word_to_usize(pop(&mut stack, opcode)?)?;
                    let out_len = word_to_usize(pop(&mut stack, opcode)?)?;

                    let data = mem_read(&mut memory, in_off, in_len)?;
                    let sub = Message {
                        caller: msg.to,
                        to,
                        value,
                        data,
                    };
                    let (ok, ret) = self.sub_call(sub, gas, depth + 1)?;
                    return_buf = ret;
                    mem_expand(&mut memory, out_off, out_len)?;
                    let n = out_len.min(return_buf.len());
                    memory[out_off..out_off + n].copy_from_slice(&return_buf[..n]);
                    push(&mut stack, bool_word(ok))?;
                }

                op::RETURN => {
                    let offset = word_to_usize(pop(&mut stack, opcode)?)?;
                    let len = word_to_usize(pop(&mut stack, opcode)?)?;
                    return mem_read(&mut memory, offset, len);
                }
                op::REVERT => {
                    let offset = word_to_usize(pop(&mut stack, opcode)?)?;
                    let len = word_to_usize(pop(&mut stack, opcode)?)?;
                    return Err(ExecError::Revert(mem_read(&mut memory, offset, len)?));
                }

                other => return Err(ExecError::InvalidOpcode(other)),
            }

            pc += op::instruction_len(opcode);
        }
    }
}

// ── word/stack/memory helpers ────────────────────────────────────

fn underflow(opcode: u8) -> ExecError {
    ExecError::StackUnderflow {
        op: op::name(opcode),
    }
}

fn pop(stack: &mut Vec<U256>, opcode: u8) -> Result<U256, ExecError> {
    stack.pop().ok_or_else(|| underflow(opcode))
}

fn push(stack: &mut Vec<U256>, value: U256) -> Result<(), ExecError> {
    if stack.len() >= STACK_LIMIT {
        return Err(ExecError::StackOverflow);
    }
    stack.push(value);
    Ok(())
}

fn bool_word(b: bool) -> U256 {
    if b {
        U256::one()
    } else {
        U256::zero()
    }
}

fn word_to_usize(value: U256) -> Result<usize, ExecError> {
    if value > U256::from(u32::MAX) {
        return Err(ExecError::MemoryRange);
    }
    Ok(value.as_usize())
}

fn word_to_address(value: U256) -> Address {
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    Address::from_slice(&word[12..])
}

fn address_word(address: &Address) -> U256 {
    U256::from_big_endian(address.as_bytes())
}

fn word_to_h256(value: U256) -> H256 {
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    H256(word)
}

/// Copy `dst.len()` bytes from `src[src_off..]`, zero-padding past the end.
fn copy_padded(dst: &mut [u8], src: &[u8], src_off: usize) {
    for (i, byte) in dst.iter_mut().enumerate() {
        *byte = src.get(src_off + i).copied().unwrap_or(0);
    }
}

fn mem_expand(memory: &mut Vec<u8>, offset: usize, len: usize) -> Result<(), ExecError> {
    if len == 0 {
        return Ok(());
    }
    let end = offset.checked_add(len).ok_or(ExecError::MemoryRange)?;
    if end > MAX_MEMORY {
        return Err(ExecError::MemoryRange);
    }
    if memory.len() < end {
        memory.resize(end.next_multiple_of(32), 0);
    }
    Ok(())
}

fn mem_read(memory: &mut Vec<u8>, offset: usize, len: usize) -> Result<Vec<u8>, ExecError> {
    if len == 0 {
        return Ok(Vec::new());
    }
    mem_expand(memory, offset, len)?;
    Ok(memory[offset..offset + len].to_vec())
}

fn mem_write(memory: &mut Vec<u8>, offset: usize, data: &[u8]) -> Result<(), ExecError> {
    if data.is_empty() {
        return Ok(());
    }
    mem_expand(memory, offset, data.len())?;
    memory[offset..offset + data.len()].copy_from_slice(data);
    Ok(())
}

fn valid_jumpdests(code: &[u8]) -> HashSet<usize> {
    let mut dests = HashSet::new();
    let mut i = 0;
    while i < code.len() {
        if code[i] == op::JUMPDEST {
            dests.insert(i);
        }
        i += op::instruction_len(code[i]);
    }
    dests
}

// ── signed arithmetic ────────────────────────────────────────────

fn is_neg(value: U256) -> bool {
    value.bit(255)
}

fn twos_neg(value: U256) -> U256 {
    (!value).overflowing_add(U256::one()).0
}

fn abs(value: U256) -> U256 {
    if is_neg(value) {
        twos_neg(value)
    } else {
        value
    }
}

fn sdiv(a: U256, b: U256) -> U256 {
    if b.is_zero() {
        return U256::zero();
    }
    let q = abs(a) / abs(b);
    if is_neg(a) != is_neg(b) {
        twos_neg(q)
    } else {
        q
    }
}

fn smod(a: U256, b: U256) -> U256 {
    if b.is_zero() {
        return U256::zero();
    }
    let r = abs(a) % abs(b);
    if is_neg(a) {
        twos_neg(r)
    } else {
        r
    }
}

fn slt(a: U256, b: U256) -> bool {
    match (is_neg(a), is_neg(b)) {
        (true, false) => true,
        (false, true) => false,
        _ => a < b,
    }
}

fn sar(shift: U256, value: U256) -> U256 {
    if shift >= U256::from(256) {
        return if is_neg(value) { !U256::zero() } else { U256::zero() };
    }
    let shift = shift.as_usize();
    let shifted = value >> shift;
    if is_neg(value) && shift > 0 {
        shifted | (!U256::zero() << (256 - shift))
    } else {
        shifted
    }
}

fn signextend(k: U256, value: U256) -> U256 {
    if k >= U256::from(31) {
        return value;
    }
    let bit = k.as_usize() * 8 + 7;
    let mask = (U256::one() << (bit + 1)) - U256::one();
    if value.bit(bit) {
        value | !mask
    } else {
        value & mask
    }
}
