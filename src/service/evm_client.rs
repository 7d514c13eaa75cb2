// EVM 链客户端 - ERC20 USDT（ETH / BSC / Polygon）
// RPC 节点按链轮询；交易在本地构建、签名后以 raw transaction 广播

use std::{
    collections::HashMap,
    future::Future,
    str::FromStr,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use ethers::{
    abi::{encode, Token},
    providers::{Http, Middleware, Provider},
    signers::{LocalWallet, Signer},
    types::{
        transaction::eip2718::TypedTransaction, Address, BlockNumber, Bytes,
        Eip1559TransactionRequest, TransactionRequest, U256,
    },
    utils::id,
};
use rust_decimal::Decimal;

use crate::{
    config::ChainsConfig,
    domain::chain_config::{ChainConfig, ChainRegistry},
    error::{GatewayError, GatewayResult},
    infrastructure::key_store::SigningKeyMaterial,
    service::{
        chain_client::ChainClient,
        gas_estimator::{pad_gas_limit, FeeSuggestion, GasOptimizer},
    },
    utils::amount::{from_minor_units, to_minor_units},
};

pub struct EvmClient {
    timeout: Duration,
    gas: GasOptimizer,
    cursors: HashMap<String, AtomicUsize>,
}

impl EvmClient {
    pub fn new(registry: &ChainRegistry, cfg: &ChainsConfig) -> Self {
        let cursors = registry
            .all()
            .filter(|c| c.is_evm())
            .map(|c| (c.name.clone(), AtomicUsize::new(0)))
            .collect();
        Self {
            timeout: Duration::from_secs(cfg.rpc_timeout_secs),
            gas: GasOptimizer::new(cfg.gas_optimize_enabled),
            cursors,
        }
    }

    /// 轮询选择节点
    fn provider(&self, chain: &ChainConfig) -> GatewayResult<Provider<Http>> {
        if chain.rpc_urls.is_empty() {
            return Err(GatewayError::UnsupportedChain(format!(
                "{} has no rpc endpoint",
                chain.name
            )));
        }
        let index = self
            .cursors
            .get(&chain.name)
            .map(|c| c.fetch_add(1, Ordering::Relaxed))
            .unwrap_or(0)
            % chain.rpc_urls.len();
        let url = &chain.rpc_urls[index];
        Provider::<Http>::try_from(url.as_str())
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("invalid rpc url {}: {}", url, e)))
    }

    async fn timed<T, E, F>(&self, what: &str, fut: F) -> Result<T, String>
    where
        E: std::fmt::Display,
        F: Future<Output = Result<T, E>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(format!("{}: {}", what, e)),
            Err(_) => Err(format!("{}: timed out after {:?}", what, self.timeout)),
        }
    }

    /// 构建、签名并广播一笔对 USDT 合约的调用
    async fn send_contract_call(
        &self,
        chain: &ChainConfig,
        wallet: &LocalWallet,
        calldata: Vec<u8>,
    ) -> GatewayResult<String> {
        let chain_id = chain
            .chain_id
            .ok_or_else(|| GatewayError::UnsupportedChain(chain.name.clone()))?;
        let contract = parse_address(&chain.token_contract)?;
        let provider = self.provider(chain)?;
        let from = wallet.address();

        let nonce = self
            .timed(
                "get nonce",
                provider.get_transaction_count(from, Some(BlockNumber::Pending.into())),
            )
            .await
            .map_err(GatewayError::ChainBroadcastFailed)?;

        let fee = match tokio::time::timeout(self.timeout, self.gas.suggest(&provider)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(GatewayError::ChainBroadcastFailed(
                    "fee estimation timed out".into(),
                ))
            }
        };

        let mut tx = build_transaction(from, contract, calldata, nonce, chain_id, &fee);

        let estimate = self
            .timed("estimate gas", provider.estimate_gas(&tx, None))
            .await
            .map_err(GatewayError::ChainBroadcastFailed)?;
        tx.set_gas(pad_gas_limit(estimate));

        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| GatewayError::ChainBroadcastFailed(format!("signing failed: {}", e)))?;
        let raw: Bytes = tx.rlp_signed(&signature);

        let pending = self
            .timed("send raw transaction", provider.send_raw_transaction(raw))
            .await
            .map_err(GatewayError::ChainBroadcastFailed)?;
        let tx_hash = format!("{:?}", pending.tx_hash());

        tracing::info!(
            chain = %chain.name,
            from = ?from,
            nonce = %nonce,
            eip1559 = fee.is_eip1559(),
            tx_hash = %tx_hash,
            "evm transaction broadcast"
        );
        Ok(tx_hash)
    }
}

fn parse_address(address: &str) -> GatewayResult<Address> {
    Address::from_str(address.trim()).map_err(|_| GatewayError::InvalidAddress(address.to_string()))
}

fn with_selector(signature: &str, tokens: &[Token]) -> Vec<u8> {
    let mut data = id(signature).to_vec();
    data.extend(encode(tokens));
    data
}

pub fn encode_allowance(owner: Address, spender: Address) -> Vec<u8> {
    with_selector(
        "allowance(address,address)",
        &[Token::Address(owner), Token::Address(spender)],
    )
}

pub fn encode_transfer_from(from: Address, to: Address, amount: U256) -> Vec<u8> {
    with_selector(
        "transferFrom(address,address,uint256)",
        &[Token::Address(from), Token::Address(to), Token::Uint(amount)],
    )
}

pub fn encode_transfer(to: Address, amount: U256) -> Vec<u8> {
    with_selector(
        "transfer(address,uint256)",
        &[Token::Address(to), Token::Uint(amount)],
    )
}

/// 有 maxFee 时构建 EIP-1559 交易，否则构建 legacy 交易
pub fn build_transaction(
    from: Address,
    contract: Address,
    calldata: Vec<u8>,
    nonce: U256,
    chain_id: u64,
    fee: &FeeSuggestion,
) -> TypedTransaction {
    match (fee.max_fee_per_gas, fee.max_priority_fee) {
        (Some(max_fee), Some(tip)) => Eip1559TransactionRequest::new()
            .from(from)
            .to(contract)
            .data(calldata)
            .nonce(nonce)
            .max_fee_per_gas(max_fee)
            .max_priority_fee_per_gas(tip)
            .chain_id(chain_id)
            .into(),
        _ => {
            let mut request = TransactionRequest::new()
                .from(from)
                .to(contract)
                .data(calldata)
                .nonce(nonce)
                .chain_id(chain_id);
            if let Some(price) = fee.gas_price {
                request = request.gas_price(price);
            }
            request.into()
        }
    }
}

#[async_trait]
impl ChainClient for EvmClient {
    async fn query_allowance(
        &self,
        chain: &ChainConfig,
        owner: &str,
        spender: &str,
    ) -> GatewayResult<Decimal> {
        let contract = parse_address(&chain.token_contract)?;
        let calldata = encode_allowance(parse_address(owner)?, parse_address(spender)?);
        let provider = self.provider(chain)?;

        let call: TypedTransaction = TransactionRequest::new().to(contract).data(calldata).into();
        let output = self
            .timed("eth_call allowance", provider.call(&call, None))
            .await
            .map_err(GatewayError::ChainQueryFailed)?;

        if output.len() < 32 {
            return Err(GatewayError::ChainQueryFailed(format!(
                "allowance returned {} bytes",
                output.len()
            )));
        }
        let raw = U256::from_big_endian(&output[..32]);
        Ok(from_minor_units(raw, chain.token_decimals))
    }

    async fn transfer_from(
        &self,
        chain: &ChainConfig,
        spender: &str,
        key: &SigningKeyMaterial,
        from: &str,
        to: &str,
        amount: Decimal,
    ) -> GatewayResult<String> {
        let chain_id = chain
            .chain_id
            .ok_or_else(|| GatewayError::UnsupportedChain(chain.name.clone()))?;
        let wallet = key.to_local_wallet(chain_id)?;
        let spender_addr = parse_address(spender)?;
        if wallet.address() != spender_addr {
            return Err(GatewayError::KeyMismatch(format!(
                "key controls {:?}, expected {:?}",
                wallet.address(),
                spender_addr
            )));
        }

        let calldata = encode_transfer_from(
            parse_address(from)?,
            parse_address(to)?,
            to_minor_units(amount, chain.token_decimals)?,
        );
        self.send_contract_call(chain, &wallet, calldata).await
    }

    async fn transfer(
        &self,
        chain: &ChainConfig,
        key: &SigningKeyMaterial,
        to: &str,
        amount: Decimal,
    ) -> GatewayResult<String> {
        let chain_id = chain
            .chain_id
            .ok_or_else(|| GatewayError::UnsupportedChain(chain.name.clone()))?;
        let wallet = key.to_local_wallet(chain_id)?;
        let calldata = encode_transfer(
            parse_address(to)?,
            to_minor_units(amount, chain.token_decimals)?,
        );
        self.send_contract_call(chain, &wallet, calldata).await
    }
}
