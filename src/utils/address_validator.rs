//! 地址验证与编码模块
//!
//! - TRON：Base58Check（21字节载荷，首字节 0x41，4字节双SHA256校验和）
//! - EVM：0x + 40位hex，大小写混合时校验 EIP-55

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use sha3::Keccak256;

use crate::{
    domain::chain_config::ChainFamily,
    error::{GatewayError, GatewayResult},
};

/// TRON 主网地址版本字节
pub const TRON_ADDRESS_PREFIX: u8 = 0x41;

static EVM_ADDRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("static regex"));

/// 地址验证器
pub struct AddressValidator;

impl AddressValidator {
    /// 按链族验证地址格式
    pub fn validate(family: ChainFamily, address: &str) -> bool {
        match family {
            ChainFamily::Tron => Self::validate_tron_address(address),
            ChainFamily::Evm => Self::validate_evm_address(address),
        }
    }

    /// 同 `validate`，失败时返回 `InvalidAddress`
    pub fn ensure(family: ChainFamily, address: &str) -> GatewayResult<()> {
        if Self::validate(family, address) {
            Ok(())
        } else {
            Err(GatewayError::InvalidAddress(address.to_string()))
        }
    }

    /// 验证EVM地址（支持EIP-55 Checksum）
    pub fn validate_evm_address(address: &str) -> bool {
        if !EVM_ADDRESS_RE.is_match(address) {
            return false;
        }

        let hex_part = &address[2..];
        let has_upper = hex_part.chars().any(|c| c.is_ascii_uppercase());
        let has_lower = hex_part.chars().any(|c| c.is_ascii_lowercase());
        if has_upper && has_lower {
            return to_eip55_checksum(hex_part) == hex_part;
        }

        true
    }

    /// 验证TRON地址
    pub fn validate_tron_address(address: &str) -> bool {
        decode_tron_address(address).is_ok()
    }
}

/// EIP-55 校验和编码（输入为40位hex，不含0x）
fn to_eip55_checksum(hex_part: &str) -> String {
    let lower = hex_part.to_lowercase();
    let hash = Keccak256::digest(lower.as_bytes());

    lower
        .chars()
        .enumerate()
        .map(|(i, ch)| {
            let nibble = if i % 2 == 0 {
                hash[i / 2] >> 4
            } else {
                hash[i / 2] & 0x0f
            };
            if ch.is_ascii_alphabetic() && nibble >= 8 {
                ch.to_ascii_uppercase()
            } else {
                ch
            }
        })
        .collect()
}

fn tron_checksum(payload: &[u8]) -> [u8; 4] {
    let first = Sha256::digest(payload);
    let second = Sha256::digest(first);
    let mut out = [0u8; 4];
    out.copy_from_slice(&second[..4]);
    out
}

/// 解码 TRON Base58Check 地址，返回21字节载荷（含 0x41 前缀）
pub fn decode_tron_address(address: &str) -> GatewayResult<[u8; 21]> {
    let invalid = || GatewayError::InvalidAddress(address.to_string());

    if address.len() < 26 || address.len() > 35 || !address.starts_with('T') {
        return Err(invalid());
    }

    let decoded = bs58::decode(address).into_vec().map_err(|_| invalid())?;
    if decoded.len() != 25 || decoded[0] != TRON_ADDRESS_PREFIX {
        return Err(invalid());
    }

    if tron_checksum(&decoded[..21]) != decoded[21..] {
        return Err(invalid());
    }

    let mut payload = [0u8; 21];
    payload.copy_from_slice(&decoded[..21]);
    Ok(payload)
}

/// 由21字节载荷编码 TRON 地址
pub fn encode_tron_address(payload: &[u8; 21]) -> String {
    let mut raw = payload.to_vec();
    raw.extend_from_slice(&tron_checksum(payload));
    bs58::encode(raw).into_string()
}

/// TRON 地址转合约参数格式：去掉 0x41 后的20字节，左补零到32字节（64位hex）
pub fn tron_address_to_abi_hex(address: &str) -> GatewayResult<String> {
    let payload = decode_tron_address(address)?;
    Ok(format!("{:0>64}", hex::encode(&payload[1..])))
}

/// 合约参数格式（64位 / 42位带41 / 40位hex）转回 TRON 地址
pub fn tron_address_from_hex(hex_str: &str) -> GatewayResult<String> {
    let invalid = || GatewayError::InvalidAddress(hex_str.to_string());
    let trimmed = hex_str.trim_start_matches("0x");

    let body = match trimmed.len() {
        64 => &trimmed[24..],
        42 if trimmed.starts_with("41") => &trimmed[2..],
        40 => trimmed,
        _ => return Err(invalid()),
    };

    let bytes = hex::decode(body).map_err(|_| invalid())?;
    let mut payload = [0u8; 21];
    payload[0] = TRON_ADDRESS_PREFIX;
    payload[1..].copy_from_slice(&bytes);
    Ok(encode_tron_address(&payload))
}

/// 由 secp256k1 公钥推导 TRON 地址（keccak256(未压缩公钥[1..]) 的后20字节）
pub fn tron_address_from_verifying_key(key: &k256::ecdsa::VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    let hash = Keccak256::digest(&point.as_bytes()[1..]);

    let mut payload = [0u8; 21];
    payload[0] = TRON_ADDRESS_PREFIX;
    payload[1..].copy_from_slice(&hash[12..]);
    encode_tron_address(&payload)
}
