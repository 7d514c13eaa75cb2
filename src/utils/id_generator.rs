//! 单号与访问密码生成

use chrono::Utc;
use rand::{rngs::OsRng, Rng};

/// 访问密码字符集（去掉易混淆的 I 和 O）
pub const PASSWORD_ALPHABET: &[u8] = b"0123456789ABCDEFGHJKLMNPQRSTUVWXYZ";
pub const PASSWORD_LEN: usize = 8;

/// 前缀 + 秒级时间戳 + 6位随机数，如 A20240101120000123456
fn numbered(prefix: char) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{}{}{:06}", prefix, Utc::now().format("%Y%m%d%H%M%S"), suffix)
}

pub fn generate_auth_no() -> String {
    numbered('A')
}

pub fn generate_deduct_no() -> String {
    numbered('D')
}

pub fn generate_withdraw_no() -> String {
    numbered('W')
}

/// 8位访问密码，使用系统随机源
pub fn generate_access_password() -> String {
    let mut rng = OsRng;
    (0..PASSWORD_LEN)
        .map(|_| PASSWORD_ALPHABET[rng.gen_range(0..PASSWORD_ALPHABET.len())] as char)
        .collect()
}
