//! 提供商适配器
//!
//! 通过 `ProviderAdapter` trait 抽象厂商调用，各（渠道, 厂商）组合
//! 提供独立实现：邮件走 AWS SES，短信走 AWS SNS。适配器负责
//! 凭证解密、凭证/配置/载荷的形状校验、厂商 HTTP 调用，
//! 以及瞬时错误的指数退避重试。
//!
//! 错误语义统一为 `ProviderError`：结构性错误与厂商拒绝不重试，
//! 仅限流与 5xx 类瞬时错误进入重试循环。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use courier_shared::models::{Channel, ProviderCredential};
use courier_shared::retry::{DispatchRetryPolicy, RetryError, send_with_retry};

pub mod ses;
pub mod sigv4;
pub mod sns;

pub use ses::SesAdapter;
pub use sns::SnsAdapter;

// ---------------------------------------------------------------------------
// SendOutcome / ProviderError
// ---------------------------------------------------------------------------

/// 厂商调用成功的结果
///
/// 返回即代表厂商已接收；"成功标志为 false"的形态统一收敛为
/// `Err(ProviderError)`，调用方只需模式匹配 Result。
#[derive(Debug, Clone)]
pub struct SendOutcome {
    /// 厂商分配的消息标识，用于追踪投递状态
    pub provider_message_id: String,
    /// 厂商原始响应的结构化摘要，写入 sent 事件
    pub details: Value,
}

/// 提供商适配器错误分类
#[derive(Debug, Error)]
pub enum ProviderError {
    /// 凭证/配置/载荷形状不符或解密失败；不重试
    #[error("结构性错误: {0}")]
    Structural(String),

    /// 厂商明确拒绝（验证/鉴权类错误）；不重试
    #[error("厂商拒绝请求: {0}")]
    Vendor(String),

    /// 限流或 5xx 类瞬时错误；可重试
    #[error("厂商瞬时错误: {0}")]
    Transient(String),

    /// 重试耗尽，包装最后一次的底层错误供诊断
    #[error("尝试 {attempts} 次后仍失败: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

// ---------------------------------------------------------------------------
// ProviderAdapter trait / ProviderRegistry
// ---------------------------------------------------------------------------

/// 提供商适配器 trait，各（渠道, 厂商）组合实现具体的发送逻辑
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// 该适配器负责的渠道
    fn channel(&self) -> Channel;

    /// 将凭证 + 配置 + 载荷 + 收件人转化为一次厂商调用
    async fn send(
        &self,
        credential: &ProviderCredential,
        payload: &Value,
        config: &Value,
        recipient: &str,
    ) -> Result<SendOutcome, ProviderError>;
}

/// 提供商注册表
///
/// 按渠道名解析适配器，进程启动时装配一次，替代逐次调用的
/// 运行时类型分支。
#[derive(Default)]
pub struct ProviderRegistry {
    adapters: HashMap<Channel, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册适配器；同渠道重复注册时后注册者生效
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.channel(), adapter);
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&channel).cloned()
    }
}

// ---------------------------------------------------------------------------
// AWS 凭证
// ---------------------------------------------------------------------------

/// SES/SNS 共用的 AWS 凭证形状
///
/// 由 `ProviderCredential.encrypted_secrets` 解密后的 JSON 反序列化而来。
#[derive(Debug, serde::Deserialize)]
pub(crate) struct AwsCredential {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
}

/// 解密并校验 AWS 凭证形状
///
/// 解密失败与形状不符都是结构性错误，不进入重试。
pub(crate) fn decrypt_aws_credential(
    encryptor: &courier_shared::crypto::FieldEncryptor,
    credential: &ProviderCredential,
) -> Result<AwsCredential, ProviderError> {
    let secrets = encryptor
        .decrypt_json(&credential.encrypted_secrets)
        .map_err(|e| ProviderError::Structural(format!("凭证解密失败: {e}")))?;

    let parsed: AwsCredential = serde_json::from_value(secrets)
        .map_err(|e| ProviderError::Structural(format!("凭证形状不符: {e}")))?;

    if parsed.access_key_id.is_empty() || parsed.secret_access_key.is_empty() {
        return Err(ProviderError::Structural("凭证密钥为空".to_string()));
    }
    if parsed.region.is_empty() {
        return Err(ProviderError::Structural("凭证缺少 region".to_string()));
    }

    Ok(parsed)
}

// ---------------------------------------------------------------------------
// 重试执行
// ---------------------------------------------------------------------------

/// 对单次厂商调用应用重试策略
///
/// 仅 `Transient` 错误重试；重试耗尽后聚合为 `Exhausted`，
/// 携带最后一次的底层错误。
pub(crate) async fn call_with_retry<F, Fut>(
    policy: &DispatchRetryPolicy,
    operation_name: &str,
    operation: F,
) -> Result<SendOutcome, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<SendOutcome, ProviderError>>,
{
    send_with_retry(policy, operation_name, ProviderError::is_transient, operation)
        .await
        .map_err(|e| match e {
            RetryError::Aborted(err) => err,
            RetryError::Exhausted { attempts, last } => ProviderError::Exhausted {
                attempts,
                last: last.to_string(),
            },
        })
}
