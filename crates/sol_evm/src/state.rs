//! Account state: a copy-on-write overlay over a pluggable backend.
//!
//! The backend is the source of "historical" data — either nothing (local
//! mode) or a block-pinned remote fork. All mutation lands in the overlay;
//! `shadow_clone` copies the overlay and shares the backend, so branches
//! derived from the same history never alias mutable state.

use ethereum_types::{H160 as Address, H256, U256};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("state backend: {0}")]
pub struct BackendError(pub String);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Account {
    pub nonce: u64,
    pub balance: U256,
    pub code: Vec<u8>,
}

/// Read-only source of historical chain data.
pub trait StateBackend: Send + Sync {
    fn account(&self, address: &Address) -> Result<Option<Account>, BackendError>;
    fn storage(&self, address: &Address, key: &H256) -> Result<H256, BackendError>;
}

/// Backend with no accounts at all — purely local execution.
#[derive(Debug, Default)]
pub struct EmptyBackend;

impl StateBackend for EmptyBackend {
    fn account(&self, _address: &Address) -> Result<Option<Account>, BackendError> {
        Ok(None)
    }
    fn storage(&self, _address: &Address, _key: &H256) -> Result<H256, BackendError> {
        Ok(H256::zero())
    }
}

#[derive(Clone)]
pub struct Overlay {
    backend: Arc<dyn StateBackend>,
    accounts: HashMap<Address, Account>,
    storage: HashMap<(Address, H256), H256>,
}

impl Overlay {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self {
            backend,
            accounts: HashMap::new(),
            storage: HashMap::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(EmptyBackend))
    }

    /// Independent copy-on-write branch sharing the same historical data.
    pub fn shadow_clone(&self) -> Self {
        self.clone()
    }

    /// Load an account, falling through to the backend once and caching.
    /// Unknown accounts materialize as empty.
    pub fn account(&mut self, address: &Address) -> Result<Account, BackendError> {
        if let Some(acct) = self.accounts.get(address) {
            return Ok(acct.clone());
        }
        let acct = self.backend.account(address)?.unwrap_or_default();
        self.accounts.insert(*address, acct.clone());
        Ok(acct)
    }

    pub fn put_account(&mut self, address: Address, account: Account) {
        self.accounts.insert(address, account);
    }

    pub fn code(&mut self, address: &Address) -> Result<Vec<u8>, BackendError> {
        Ok(self.account(address)?.code)
    }

    pub fn set_code(&mut self, address: Address, code: Vec<u8>) -> Result<(), BackendError> {
        let mut acct = self.account(&address)?;
        acct.code = code;
        self.accounts.insert(address, acct);
        Ok(())
    }

    pub fn balance(&mut self, address: &Address) -> Result<U256, BackendError> {
        Ok(self.account(address)?.balance)
    }

    pub fn storage(&mut self, address: &Address, key: &H256) -> Result<H256, BackendError> {
        if let Some(value) = self.storage.get(&(*address, *key)) {
            return Ok(*value);
        }
        let value = self.backend.storage(address, key)?;
        self.storage.insert((*address, *key), value);
        Ok(value)
    }

    pub fn set_storage(&mut self, address: Address, key: H256, value: H256) {
        self.storage.insert((address, key), value);
    }

    /// Move `value` between accounts; `false` when the sender can't cover it.
    pub fn transfer(
        &mut self,
        from: &Address,
        to: &Address,
        value: U256,
    ) -> Result<bool, BackendError> {
        if value.is_zero() {
            return Ok(true);
        }
        let mut sender = self.account(from)?;
        if sender.balance < value {
            return Ok(false);
        }
        sender.balance -= value;
        self.put_account(*from, sender);
        let mut receiver = self.account(to)?;
        receiver.balance += value;
        self.put_account(*to, receiver);
        Ok(true)
    }
}
