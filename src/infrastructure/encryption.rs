//! 凭证保险库：Argon2id 派生密钥 + AES-256-GCM 加密
//!
//! 密钥派生输入为 `主密钥 ‖ 绑定上下文（客户钱包地址）`，每次加密使用新的
//! 16字节盐和12字节 nonce，同一明文在不同钱包下得到不可关联的密文。

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::{rngs::OsRng, RngCore};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::{
    domain::authorization::SealedPassword,
    error::{GatewayError, GatewayResult},
};

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;

const ARGON2_TIME_COST: u32 = 1;
const ARGON2_MEMORY_KIB: u32 = 64 * 1024;
const ARGON2_PARALLELISM: u32 = 4;

/// 凭证保险库（持有主密钥，释放时清零）
pub struct CredentialVault {
    master_key: Zeroizing<[u8; KEY_LEN]>,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialVault(***)")
    }
}

impl CredentialVault {
    pub fn new(master_key: Zeroizing<[u8; KEY_LEN]>) -> Self {
        Self { master_key }
    }

    /// 由64位hex主密钥构建
    pub fn from_hex(hex_key: &str) -> GatewayResult<Self> {
        Ok(Self::new(crate::config::parse_master_key(hex_key)?))
    }

    fn derive_key(&self, binding: &str, salt: &[u8]) -> GatewayResult<Zeroizing<[u8; KEY_LEN]>> {
        let params = Params::new(
            ARGON2_MEMORY_KIB,
            ARGON2_TIME_COST,
            ARGON2_PARALLELISM,
            Some(KEY_LEN),
        )
        .map_err(|e| anyhow::anyhow!("invalid argon2 params: {}", e))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut input = Zeroizing::new(Vec::with_capacity(KEY_LEN + binding.len()));
        input.extend_from_slice(self.master_key.as_slice());
        input.extend_from_slice(binding.as_bytes());

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        argon2
            .hash_password_into(&input, salt, key.as_mut_slice())
            .map_err(|e| anyhow::anyhow!("argon2 derivation failed: {}", e))?;
        Ok(key)
    }

    /// 加密 secret 并绑定到 binding（客户钱包地址）
    pub fn seal(&self, secret: &str, binding: &str) -> GatewayResult<SealedPassword> {
        if secret.is_empty() {
            return Err(GatewayError::InvalidInput("secret must not be empty".into()));
        }
        if binding.is_empty() {
            return Err(GatewayError::InvalidInput(
                "binding context must not be empty".into(),
            ));
        }

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let key = self.derive_key(binding, &salt)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| anyhow::anyhow!("invalid key: {}", e))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), secret.as_bytes())
            .map_err(|e| anyhow::anyhow!("encryption failed: {}", e))?;

        Ok(SealedPassword {
            ciphertext,
            nonce: nonce.to_vec(),
            salt: salt.to_vec(),
        })
    }

    /// 解密，任何篡改或密钥/绑定不匹配都返回 `DecryptionFailed`
    pub fn open(&self, sealed: &SealedPassword, binding: &str) -> GatewayResult<Zeroizing<String>> {
        if sealed.salt.len() != SALT_LEN || sealed.nonce.len() != NONCE_LEN {
            return Err(GatewayError::DecryptionFailed);
        }
        if sealed.ciphertext.is_empty() || binding.is_empty() {
            return Err(GatewayError::DecryptionFailed);
        }

        let key = self.derive_key(binding, &sealed.salt)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|_| GatewayError::DecryptionFailed)?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
                .map_err(|_| GatewayError::DecryptionFailed)?,
        );

        let text = std::str::from_utf8(&plaintext).map_err(|_| GatewayError::DecryptionFailed)?;
        Ok(Zeroizing::new(text.to_string()))
    }

    /// 解密后与候选值做常量时间比较
    pub fn verify(&self, sealed: &SealedPassword, binding: &str, candidate: &str) -> bool {
        match self.open(sealed, binding) {
            Ok(plain) => constant_time_eq(plain.as_bytes(), candidate.as_bytes()),
            Err(_) => false,
        }
    }
}

/// 常量时间比较（长度不同直接返回 false）
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
