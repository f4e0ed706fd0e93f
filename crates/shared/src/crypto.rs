//! 凭证加密模块
//!
//! 基于 AES-256-GCM 实现字段级加密，用于保护提供商凭证
//! （AWS access key 等）在数据库中的存储。
//!
//! ## 设计决策
//!
//! - **AES-256-GCM**：AEAD 算法同时提供加密和完整性验证，防止密文被篡改
//! - **随机 Nonce**：每次加密生成独立的 12 字节 nonce，相同明文产生不同密文
//! - **Passthrough 模式**：未配置密钥时不加密，方便开发环境使用
//!
//! 输出格式: `base64(nonce[12] || ciphertext || tag[16])`

use aes_gcm::{AeadCore, Aes256Gcm, KeyInit, aead::Aead};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use thiserror::Error;

/// 加密模块错误类型
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("加密失败: {0}")]
    EncryptionFailed(String),

    #[error("解密失败: {0}")]
    DecryptionFailed(String),

    #[error("无效的密钥长度: 预期 32 字节, 实际 {0} 字节")]
    InvalidKeyLength(usize),

    #[error("无效的密文格式: {0}")]
    InvalidCiphertext(String),

    #[error("JSON 序列化失败: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// AES-256-GCM Nonce 长度（12 字节，GCM 标准推荐值）
const NONCE_SIZE: usize = 12;

/// 字段级加密器
///
/// 支持两种运行模式：
/// - **加密模式**：持有 AES-256-GCM 密钥，对数据进行真实加密
/// - **Passthrough 模式**：未配置密钥时，encrypt/decrypt 直接透传原文，
///   确保开发环境无需配置密钥即可运行
#[derive(Clone)]
pub struct FieldEncryptor {
    /// None 表示 passthrough 模式（开发环境不加密）
    cipher: Option<Aes256Gcm>,
}

impl FieldEncryptor {
    /// 从 32 字节密钥创建加密器
    ///
    /// 密钥长度必须恰好 32 字节（256 位），不接受其他长度以避免
    /// 意外使用弱密钥。
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != 32 {
            return Err(CryptoError::InvalidKeyLength(key.len()));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        Ok(Self {
            cipher: Some(cipher),
        })
    }

    /// 创建 passthrough 模式的加密器（不执行加密）
    ///
    /// 用于开发环境——未配置 encryption.key_hex 时自动降级为此模式，
    /// 启动日志中会输出警告提示。
    pub fn passthrough() -> Self {
        Self { cipher: None }
    }

    /// 从 hex 编码的密钥字符串创建加密器
    ///
    /// 生产环境通过 `COURIER_ENCRYPTION_KEY_HEX` 传入 64 字符的 hex 字符串。
    pub fn from_hex(hex_key: &str) -> Result<Self, CryptoError> {
        let bytes = hex_decode(hex_key).map_err(|_| CryptoError::InvalidKeyLength(0))?;
        Self::new(&bytes)
    }

    /// 是否处于加密模式（非 passthrough）
    pub fn is_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    /// 加密字符串
    ///
    /// 返回 `base64(nonce || ciphertext || tag)` 格式的密文。
    /// Passthrough 模式下直接返回原文。
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let Some(ref cipher) = self.cipher else {
            return Ok(plaintext.to_string());
        };

        let nonce = Aes256Gcm::generate_nonce(&mut aes_gcm::aead::OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        // 将 nonce 和密文拼接后统一 base64 编码，解密时按固定偏移拆分
        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(&combined))
    }

    /// 解密字符串
    ///
    /// 输入为 `encrypt()` 返回的 base64 编码密文。
    /// Passthrough 模式下直接返回原文。
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError> {
        let Some(ref cipher) = self.cipher else {
            return Ok(ciphertext.to_string());
        };

        let combined = BASE64
            .decode(ciphertext)
            .map_err(|e| CryptoError::InvalidCiphertext(format!("base64 解码失败: {e}")))?;

        if combined.len() < NONCE_SIZE {
            return Err(CryptoError::InvalidCiphertext(format!(
                "密文过短: 至少需要 {NONCE_SIZE} 字节 nonce，实际 {} 字节",
                combined.len()
            )));
        }

        let (nonce_bytes, ciphertext_bytes) = combined.split_at(NONCE_SIZE);
        let nonce = aes_gcm::Nonce::from_slice(nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext_bytes)
            .map_err(|_| CryptoError::DecryptionFailed("密文损坏或密钥不匹配".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| CryptoError::DecryptionFailed(format!("解密结果非 UTF-8: {e}")))
    }

    /// 加密 JSON Value
    ///
    /// API 面写入凭证时使用：先将 JSON 序列化为字符串，再加密。
    pub fn encrypt_json(&self, value: &serde_json::Value) -> Result<String, CryptoError> {
        let json_str = serde_json::to_string(value)?;
        self.encrypt(&json_str)
    }

    /// 解密为 JSON Value
    ///
    /// 提供商适配器读取凭证时使用：解密后反序列化为 JSON Value。
    pub fn decrypt_json(&self, ciphertext: &str) -> Result<serde_json::Value, CryptoError> {
        let json_str = self.decrypt(ciphertext)?;
        let value = serde_json::from_str(&json_str)?;
        Ok(value)
    }
}

/// 将 hex 字符串解码为字节数组
///
/// 不依赖外部 crate，手动实现避免引入额外依赖。
fn hex_decode(hex: &str) -> Result<Vec<u8>, String> {
    if hex.len() % 2 != 0 {
        return Err(format!("hex 字符串长度必须为偶数，实际 {}", hex.len()));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|e| format!("位置 {i} 处无效的 hex 字符: {e}"))
        })
        .collect()
}

// ============================================================
// 脱敏辅助函数
// ============================================================

/// 邮箱脱敏：保留首字符和 @ 后域名
///
/// 示例: `kevin@example.com` -> `k***@example.com`
/// 日志中的收件人地址必须经过脱敏后输出。
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            if local.is_empty() {
                return format!("***@{domain}");
            }
            let first_char: String = local.chars().next().unwrap().to_string();
            format!("{first_char}***@{domain}")
        }
        // 格式不合法时全部遮蔽
        None => "***".to_string(),
    }
}

/// 手机号脱敏：保留前 3 位和后 4 位
///
/// 示例: `13812345678` -> `138****5678`
/// 不足 7 位的短号码全部遮蔽，防止反推原始号码。
pub fn mask_phone(phone: &str) -> String {
    let digits: Vec<char> = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 7 {
        return "****".to_string();
    }
    let prefix: String = digits[..3].iter().collect();
    let suffix: String = digits[digits.len() - 4..].iter().collect();
    format!("{prefix}****{suffix}")
}

/// 按渠道选择脱敏方式
pub fn mask_recipient(channel: crate::models::Channel, recipient: &str) -> String {
    match channel {
        crate::models::Channel::Email => mask_email(recipient),
        crate::models::Channel::Sms => mask_phone(recipient),
    }
}
