//! Chain selection and the JSON-RPC plumbing behind remote forks.
//!
//! `Network` is what the embedder hands in per run: a name, an optional
//! endpoint, and an optional account-fetching strategy. When an endpoint is
//! present, `RemoteBackend` adapts the RPC surface to the VM's state-backend
//! trait, pinned to the block observed at environment creation.

use ethereum_types::{H160 as Address, H256, U256};
use serde_json::{json, Value};
use sol_evm::{Account, BackendError, StateBackend};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("rpc transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed rpc response: {0}")]
    Malformed(String),
}

/// Strategy for loading a remote account. The default issues the three
/// standard queries; embedders override it to stub balances or inject code.
pub trait AccountFetcher: Send + Sync {
    fn fetch(
        &self,
        rpc: &RpcClient,
        address: &Address,
        block: u64,
    ) -> Result<Account, NetworkError>;
}

pub struct DefaultFetcher;

impl AccountFetcher for DefaultFetcher {
    fn fetch(
        &self,
        rpc: &RpcClient,
        address: &Address,
        block: u64,
    ) -> Result<Account, NetworkError> {
        debug!(%address, block, "fetching remote account");
        Ok(Account {
            nonce: rpc.transaction_count(address, BlockTag::Number(block))?,
            balance: rpc.balance(address, BlockTag::Number(block))?,
            code: rpc.code(address, BlockTag::Number(block))?,
        })
    }
}

#[derive(Clone)]
pub struct Network {
    pub name: String,
    pub rpc: Option<String>,
    pub chain_id: u64,
    pub account_fetcher: Option<Arc<dyn AccountFetcher>>,
}

impl Network {
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rpc: None,
            chain_id: 1,
            account_fetcher: None,
        }
    }

    pub fn remote(name: impl Into<String>, rpc: impl Into<String>, chain_id: u64) -> Self {
        Self {
            name: name.into(),
            rpc: Some(rpc.into()),
            chain_id,
            account_fetcher: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum BlockTag {
    Number(u64),
    Latest,
}

impl BlockTag {
    fn to_value(self) -> Value {
        match self {
            BlockTag::Number(n) => json!(format!("0x{n:x}")),
            BlockTag::Latest => json!("latest"),
        }
    }
}

/// Minimal blocking JSON-RPC 2.0 client.
#[derive(Clone)]
pub struct RpcClient {
    url: String,
    http: reqwest::blocking::Client,
}

impl RpcClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http: reqwest::blocking::Client::new(),
        }
    }

    fn call(&self, method: &str, params: Value) -> Result<Value, NetworkError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response: Value = self.http.post(&self.url).json(&body).send()?.json()?;
        if let Some(err) = response.get("error") {
            return Err(NetworkError::Rpc {
                code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            });
        }
        response
            .get("result")
            .cloned()
            .ok_or_else(|| NetworkError::Malformed(format!("{method}: missing result")))
    }

    pub fn block_number(&self) -> Result<u64, NetworkError> {
        parse_u64(&self.call("eth_blockNumber", json!([]))?)
    }

    pub fn transaction_count(
        &self,
        address: &Address,
        block: BlockTag,
    ) -> Result<u64, NetworkError> {
        parse_u64(&self.call(
            "eth_getTransactionCount",
            json!([format!("{address:?}"), block.to_value()]),
        )?)
    }

    pub fn balance(&self, address: &Address, block: BlockTag) -> Result<U256, NetworkError> {
        parse_quantity(&self.call(
            "eth_getBalance",
            json!([format!("{address:?}"), block.to_value()]),
        )?)
    }

    pub fn code(&self, address: &Address, block: BlockTag) -> Result<Vec<u8>, NetworkError> {
        parse_bytes(&self.call(
            "eth_getCode",
            json!([format!("{address:?}"), block.to_value()]),
        )?)
    }

    pub fn storage_at(
        &self,
        address: &Address,
        key: &H256,
        block: BlockTag,
    ) -> Result<H256, NetworkError> {
        let word = parse_quantity(&self.call(
            "eth_getStorageAt",
            json!([format!("{address:?}"), format!("{key:?}"), block.to_value()]),
        )?)?;
        let mut out = [0u8; 32];
        word.to_big_endian(&mut out);
        Ok(H256(out))
    }

    pub fn gas_price(&self) -> Result<U256, NetworkError> {
        parse_quantity(&self.call("eth_gasPrice", json!([]))?)
    }

    pub fn send_raw_transaction(&self, raw: &[u8]) -> Result<H256, NetworkError> {
        let result = self.call(
            "eth_sendRawTransaction",
            json!([format!("0x{}", hex::encode(raw))]),
        )?;
        let bytes = parse_bytes(&result)?;
        if bytes.len() != 32 {
            return Err(NetworkError::Malformed("transaction hash width".into()));
        }
        Ok(H256::from_slice(&bytes))
    }
}

fn hex_str(value: &Value) -> Result<&str, NetworkError> {
    value
        .as_str()
        .ok_or_else(|| NetworkError::Malformed("expected hex string".into()))
}

fn parse_quantity(value: &Value) -> Result<U256, NetworkError> {
    let text = hex_str(value)?;
    U256::from_str_radix(text.trim_start_matches("0x"), 16)
        .map_err(|_| NetworkError::Malformed(format!("bad quantity {text}")))
}

fn parse_u64(value: &Value) -> Result<u64, NetworkError> {
    let quantity = parse_quantity(value)?;
    if quantity > U256::from(u64::MAX) {
        return Err(NetworkError::Malformed("quantity exceeds u64".into()));
    }
    Ok(quantity.as_u64())
}

fn parse_bytes(value: &Value) -> Result<Vec<u8>, NetworkError> {
    let text = hex_str(value)?;
    hex::decode(text.trim_start_matches("0x"))
        .map_err(|_| NetworkError::Malformed(format!("bad hex {text}")))
}

/// Remote chain state pinned to one block, adapted to the VM.
pub struct RemoteBackend {
    rpc: RpcClient,
    block: u64,
    fetcher: Arc<dyn AccountFetcher>,
}

impl RemoteBackend {
    pub fn new(rpc: RpcClient, block: u64, fetcher: Arc<dyn AccountFetcher>) -> Self {
        Self {
            rpc,
            block,
            fetcher,
        }
    }

    pub fn block(&self) -> u64 {
        self.block
    }
}

impl StateBackend for RemoteBackend {
    fn account(&self, address: &Address) -> Result<Option<Account>, BackendError> {
        let account = self
            .fetcher
            .fetch(&self.rpc, address, self.block)
            .map_err(|e| BackendError(e.to_string()))?;
        Ok(Some(account))
    }

    fn storage(&self, address: &Address, key: &H256) -> Result<H256, BackendError> {
        self.rpc
            .storage_at(address, key, BlockTag::Number(self.block))
            .map_err(|e| BackendError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantities_parse_from_hex() {
        assert_eq!(parse_u64(&json!("0x10")).unwrap(), 16);
        assert_eq!(parse_quantity(&json!("0x0")).unwrap(), U256::zero());
        assert!(parse_quantity(&json!(7)).is_err());
        assert!(parse_u64(&json!("0xzz")).is_err());
    }

    #[test]
    fn bytes_parse_with_prefix() {
        assert_eq!(parse_bytes(&json!("0x6001")).unwrap(), vec![0x60, 0x01]);
        assert_eq!(parse_bytes(&json!("0x")).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn block_tags_render_as_rpc_expects() {
        assert_eq!(BlockTag::Number(255).to_value(), json!("0xff"));
        assert_eq!(BlockTag::Latest.to_value(), json!("latest"));
    }

    #[test]
    fn local_network_has_no_endpoint() {
        let net = Network::local("dev");
        assert!(net.rpc.is_none());
        assert_eq!(net.chain_id, 1);
    }
}
