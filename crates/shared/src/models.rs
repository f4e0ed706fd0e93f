//! 投递域实体定义
//!
//! 包含消息、消息事件、提供商关联等核心实体。
//! 所有枚举都支持数据库（sqlx）和 JSON（serde）序列化。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// 消息状态
///
/// 状态机：queued -> processing -> {sent, failed, malformed}，
/// sent 可被外部回调路径推进为 delivered。
/// failed 与 malformed 对投递核心而言是终态。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum MessageStatus {
    /// 初始状态 - API 入队时设置
    #[default]
    Queued,
    /// 处理中 - worker 已接手，厂商调用进行中
    Processing,
    /// 已发送 - 厂商接口确认接收
    Sent,
    /// 发送失败 - 厂商拒绝或瞬时错误重试耗尽
    Failed,
    /// 结构缺失 - 关联/凭证/配置/载荷/收件人任一缺失，不重试
    Malformed,
    /// 已送达 - 由提供商回调路径（本核心之外）推进
    Delivered,
}

impl MessageStatus {
    /// 是否为成功终态
    ///
    /// 幂等守卫依据此判断：重复投递的条目遇到成功终态直接跳过。
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, Self::Sent | Self::Delivered)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Malformed => "malformed",
            Self::Delivered => "delivered",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 投递渠道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 消息来源
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum MessageSource {
    /// 原始内容直接通过 API 提交
    #[default]
    Api,
    /// 由模板渲染组件产出
    Template,
}

/// 提供商类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum ProviderKind {
    /// AWS SES（邮件）
    Ses,
    /// AWS SNS（短信）
    Sns,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ses => "ses",
            Self::Sns => "sns",
        }
    }
}

/// 通知消息
///
/// 一条通知请求的持久化记录。payload 与 recipient 创建后不可变；
/// status/status_reason/updated_at 仅由消息处理器在事务内修改。
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    /// 发起投递的项目/应用 ID（多租户隔离边界）
    pub app_id: Uuid,
    /// 投递渠道
    pub channel: Channel,
    /// 当前状态
    pub status: MessageStatus,
    /// 失败或结构缺失时的人类可读原因
    #[sqlx(default)]
    pub status_reason: Option<String>,
    /// 渠道特定内容，如邮件的 {subject, html, text}
    #[sqlx(default)]
    pub payload: Option<Value>,
    /// 目标地址（邮箱/手机号）
    #[sqlx(default)]
    pub recipient: Option<String>,
    /// 消息来源
    pub source: MessageSource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 消息生命周期事件
///
/// 只追加的审计轨迹，每次状态转换一行，仅由消息处理器写入。
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub id: i64,
    pub message_id: Uuid,
    pub status: MessageStatus,
    /// 结构化详情（厂商响应、错误信息等）
    #[sqlx(default)]
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// 提供商凭证
///
/// encrypted_secrets 为 AES-256-GCM 加密后的厂商密钥 JSON，
/// 解密与使用仅发生在提供商适配器内部。
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProviderCredential {
    pub id: Uuid,
    pub encrypted_secrets: String,
}

/// 已解析的提供商关联
///
/// 按（app_id, channel）在启用的关联中选取 priority 最小者；
/// priority 相同时按 id 升序取第一条（任意但稳定）。
#[derive(Debug, Clone)]
pub struct ResolvedAssociation {
    pub id: Uuid,
    pub provider_kind: ProviderKind,
    pub priority: i32,
    /// 关联的凭证；缺失时消息判定为 malformed
    pub credential: Option<ProviderCredential>,
    /// 项目级提供商配置（发件人身份、厂商特定选项）
    pub config: Option<Value>,
}

/// 消息及其解析出的提供商关联
///
/// `fetch_message_details` 的返回形态；association 为 None 表示
/// 该消息没有任何可用的提供商关联（结构缺失的一种）。
#[derive(Debug, Clone)]
pub struct MessageDetails {
    pub message: Message,
    pub association: Option<ResolvedAssociation>,
}
