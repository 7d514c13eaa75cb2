// TRON 链客户端 - TRC20 USDT
// 节点构建未签名交易 → 本地对 txID 签名 → 广播，私钥不离开进程

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use ethers::types::U256;
use rust_decimal::Decimal;
use serde_json::{json, Value};

use crate::{
    config::ChainsConfig,
    domain::chain_config::ChainConfig,
    error::{GatewayError, GatewayResult},
    infrastructure::key_store::SigningKeyMaterial,
    service::chain_client::ChainClient,
    utils::{
        address_validator::{tron_address_from_verifying_key, tron_address_to_abi_hex},
        amount::{from_minor_units, to_minor_units},
    },
};

const TRANSFER_FROM_SELECTOR: &str = "transferFrom(address,address,uint256)";
const TRANSFER_SELECTOR: &str = "transfer(address,uint256)";
const ALLOWANCE_SELECTOR: &str = "allowance(address,address)";

pub struct TronClient {
    http: reqwest::Client,
    api_key: Option<String>,
    fee_limit_sun: i64,
    cursor: AtomicUsize,
}

impl TronClient {
    pub fn new(cfg: &ChainsConfig) -> GatewayResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.rpc_timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build tron http client: {}", e))?;
        Ok(Self {
            http,
            api_key: cfg.trongrid_api_key.clone().filter(|k| !k.is_empty()),
            fee_limit_sun: cfg.tron_fee_limit_sun,
            cursor: AtomicUsize::new(0),
        })
    }

    /// 轮询选择节点
    fn endpoint(&self, chain: &ChainConfig, path: &str) -> GatewayResult<String> {
        if chain.rpc_urls.is_empty() {
            return Err(GatewayError::UnsupportedChain(format!(
                "{} has no api url",
                chain.name
            )));
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % chain.rpc_urls.len();
        let base = &chain.rpc_urls[index];
        Ok(format!("{}{}", base.trim_end_matches('/'), path))
    }

    async fn post(&self, url: &str, body: &Value) -> Result<Value, String> {
        let mut request = self.http.post(url).json(body);
        if let Some(key) = &self.api_key {
            request = request.header("TRON-PRO-API-KEY", key);
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("http status {}", status));
        }
        response.json::<Value>().await.map_err(|e| e.to_string())
    }

    /// 调用 triggersmartcontract，节点返回的内嵌失败标记视为错误
    async fn trigger(
        &self,
        chain: &ChainConfig,
        owner: &str,
        selector: &str,
        parameter: String,
        fee_limit: Option<i64>,
    ) -> Result<Value, String> {
        let mut body = json!({
            "owner_address": owner,
            "contract_address": chain.token_contract,
            "function_selector": selector,
            "parameter": parameter,
            "call_value": 0,
            "visible": true,
        });
        if let Some(limit) = fee_limit {
            body["fee_limit"] = json!(limit);
        }

        let url = self.endpoint(chain, "/wallet/triggersmartcontract").map_err(|e| e.to_string())?;
        let resp = self.post(&url, &body).await?;

        if resp["result"]["result"] == json!(false) {
            return Err(node_message(&resp["result"]["message"])
                .unwrap_or_else(|| "trigger failed".to_string()));
        }
        if let Some(err) = resp["Error"].as_str() {
            return Err(err.to_string());
        }
        Ok(resp)
    }

    /// 校验私钥对应地址与声明的发起地址一致
    fn ensure_key_controls(key: &SigningKeyMaterial, address: &str) -> GatewayResult<k256::ecdsa::SigningKey> {
        let signing_key = key.to_k256()?;
        let derived = tron_address_from_verifying_key(signing_key.verifying_key());
        if derived != address {
            return Err(GatewayError::KeyMismatch(format!(
                "key controls {}, expected {}",
                derived, address
            )));
        }
        Ok(signing_key)
    }

    async fn sign_and_broadcast(
        &self,
        chain: &ChainConfig,
        trigger_resp: Value,
        signing_key: &k256::ecdsa::SigningKey,
    ) -> GatewayResult<String> {
        let mut transaction = trigger_resp
            .get("transaction")
            .cloned()
            .filter(|t| t.is_object())
            .ok_or_else(|| GatewayError::ChainBroadcastFailed("node returned no transaction".into()))?;
        let tx_id = transaction["txID"]
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GatewayError::ChainBroadcastFailed("transaction has no txID".into()))?
            .to_string();

        let signature = sign_tx_id(&tx_id, signing_key)?;
        transaction["signature"] = json!([signature]);

        let url = self.endpoint(chain, "/wallet/broadcasttransaction")?;
        let resp = self
            .post(&url, &transaction)
            .await
            .map_err(GatewayError::ChainBroadcastFailed)?;

        if resp["result"] != json!(true) {
            let msg = node_message(&resp["message"])
                .or_else(|| resp["code"].as_str().map(str::to_string))
                .unwrap_or_else(|| "broadcast rejected".to_string());
            return Err(GatewayError::ChainBroadcastFailed(msg));
        }

        tracing::info!(tx_id = %tx_id, "tron transaction broadcast");
        Ok(tx_id)
    }
}

/// 对 txID（节点返回的 raw_data SHA256）做 secp256k1 签名，输出 r||s||v 的 hex
pub fn sign_tx_id(tx_id: &str, signing_key: &k256::ecdsa::SigningKey) -> GatewayResult<String> {
    let digest = hex::decode(tx_id)
        .map_err(|_| GatewayError::ChainBroadcastFailed("txID is not valid hex".into()))?;
    if digest.len() != 32 {
        return Err(GatewayError::ChainBroadcastFailed("txID must be 32 bytes".into()));
    }
    let (signature, recovery_id) = signing_key
        .sign_prehash_recoverable(&digest)
        .map_err(|e| GatewayError::ChainBroadcastFailed(format!("signing failed: {}", e)))?;

    let mut bytes = Vec::with_capacity(65);
    bytes.extend_from_slice(&signature.to_bytes());
    bytes.push(recovery_id.to_byte());
    Ok(hex::encode(bytes))
}

/// 节点消息可能是 hex 编码的文本
fn node_message(value: &Value) -> Option<String> {
    let raw = value.as_str()?;
    match hex::decode(raw).ok().and_then(|b| String::from_utf8(b).ok()) {
        Some(decoded) if !decoded.is_empty() => Some(decoded),
        _ => Some(raw.to_string()),
    }
}

/// 解析 constant_result[0]（uint256 hex）
fn parse_constant_uint(resp: &Value) -> Result<U256, String> {
    let raw = resp["constant_result"][0]
        .as_str()
        .ok_or_else(|| "missing constant_result".to_string())?;
    if raw.is_empty() {
        return Ok(U256::zero());
    }
    U256::from_str_radix(raw, 16).map_err(|e| format!("invalid uint256 {}: {}", raw, e))
}

fn encode_amount(amount: Decimal, decimals: u32) -> GatewayResult<String> {
    Ok(format!("{:064x}", to_minor_units(amount, decimals)?))
}

#[async_trait]
impl ChainClient for TronClient {
    async fn query_allowance(
        &self,
        chain: &ChainConfig,
        owner: &str,
        spender: &str,
    ) -> GatewayResult<Decimal> {
        let parameter = format!(
            "{}{}",
            tron_address_to_abi_hex(owner)?,
            tron_address_to_abi_hex(spender)?
        );
        let resp = self
            .trigger(chain, owner, ALLOWANCE_SELECTOR, parameter, None)
            .await
            .map_err(GatewayError::ChainQueryFailed)?;
        let raw = parse_constant_uint(&resp).map_err(GatewayError::ChainQueryFailed)?;
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
        let signing_key = Self::ensure_key_controls(key, spender)?;
        let parameter = format!(
            "{}{}{}",
            tron_address_to_abi_hex(from)?,
            tron_address_to_abi_hex(to)?,
            encode_amount(amount, chain.token_decimals)?
        );

        let resp = self
            .trigger(
                chain,
                spender,
                TRANSFER_FROM_SELECTOR,
                parameter,
                Some(self.fee_limit_sun),
            )
            .await
            .map_err(GatewayError::ChainBroadcastFailed)?;

        self.sign_and_broadcast(chain, resp, &signing_key).await
    }

    async fn transfer(
        &self,
        chain: &ChainConfig,
        key: &SigningKeyMaterial,
        to: &str,
        amount: Decimal,
    ) -> GatewayResult<String> {
        let signing_key = key.to_k256()?;
        let owner = tron_address_from_verifying_key(signing_key.verifying_key());
        let parameter = format!(
            "{}{}",
            tron_address_to_abi_hex(to)?,
            encode_amount(amount, chain.token_decimals)?
        );

        let resp = self
            .trigger(
                chain,
                &owner,
                TRANSFER_SELECTOR,
                parameter,
                Some(self.fee_limit_sun),
            )
            .await
            .map_err(GatewayError::ChainBroadcastFailed)?;

        self.sign_and_broadcast(chain, resp, &signing_key).await
    }
}
