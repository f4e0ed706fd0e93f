//! 投递队列基础设施封装
//!
//! 将 Redis Streams 的底层命令封装为业务友好的队列抽象，
//! 统一消费组创建、批量读取和确认语义，避免 worker 与 API 面
//! 重复编写样板代码。
//!
//! 队列语义：条目由 API 面 XADD 写入，消费组内每条条目同一时刻
//! 只会交给一个消费者；条目只有被 XACK 后才会离开消费组的
//! 待处理列表（PEL），未确认的条目在消费者崩溃后可被重新投递——
//! 这是至少一次语义的来源，也是处理器必须幂等的原因。

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{CourierError, Result};

/// 队列条目中承载内部消息 ID 的字段名
pub const MESSAGE_ID_FIELD: &str = "message_id";

// ---------------------------------------------------------------------------
// QueueEntry
// ---------------------------------------------------------------------------

/// 消费到的队列条目的统一表示
///
/// 将 Redis Stream 条目（字段为 redis::Value）转换为拥有所有权的
/// 字符串映射，使条目可以安全地跨 await 点传递给异步处理函数。
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Stream 条目 ID（如 "1700000000000-0"），确认时使用
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl QueueEntry {
    /// 提取内部消息 ID
    ///
    /// 字段缺失或非 UUID 均视为传输层格式错误，调用方应直接确认
    /// 该条目而不进入处理器——没有可处理的内容。
    pub fn message_id(&self) -> Result<Uuid> {
        let raw = self.fields.get(MESSAGE_ID_FIELD).ok_or_else(|| {
            CourierError::MalformedEntry(format!("条目 {} 缺少 {MESSAGE_ID_FIELD} 字段", self.id))
        })?;

        Uuid::parse_str(raw).map_err(|e| {
            CourierError::MalformedEntry(format!(
                "条目 {} 的 {MESSAGE_ID_FIELD} 不是有效 UUID: {e}",
                self.id
            ))
        })
    }
}

// ---------------------------------------------------------------------------
// DeliveryQueue trait
// ---------------------------------------------------------------------------

/// 投递队列抽象
///
/// 消费循环与处理器只依赖此 trait，便于在测试中用内存实现替换
/// Redis 后端。
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// 确保消费组存在
    ///
    /// 组已存在视为成功；流不存在时自动创建并将组锚定在流起点。
    async fn ensure_group(&self) -> Result<()>;

    /// 以消费组身份阻塞读取最多 count 条新条目（">" 游标）
    ///
    /// 超时/无新条目返回空列表，不是错误。
    async fn read_batch(&self, count: usize, block_ms: u64) -> Result<Vec<QueueEntry>>;

    /// 确认条目，将其从消费组的待处理列表移除
    async fn ack(&self, entry_id: &str) -> Result<()>;

    /// 入队一条投递请求，返回流条目 ID（API 面与集成测试使用）
    async fn enqueue(&self, message_id: Uuid) -> Result<String>;

    /// 队列后端连通性检查
    async fn health_check(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// StreamQueue — Redis Streams 实现
// ---------------------------------------------------------------------------

/// 基于 Redis Streams 的投递队列
#[derive(Clone)]
pub struct StreamQueue {
    client: Client,
    stream: String,
    group: String,
    consumer: String,
}

impl StreamQueue {
    /// 创建 Redis 客户端
    pub fn new(config: &QueueConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        info!(
            stream = %config.stream,
            group = %config.group,
            consumer = %config.consumer,
            "队列客户端已创建"
        );
        Ok(Self {
            client,
            stream: config.stream.clone(),
            group: config.group.clone(),
            consumer: config.consumer.clone(),
        })
    }

    /// 获取连接
    ///
    /// 每次操作独立建连，阻塞读不会饿死并发的 XACK 调用。
    async fn get_conn(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(CourierError::from)
    }

    /// 将 Stream 条目的字段表转换为字符串映射
    ///
    /// 非 UTF-8 的字段值直接丢弃——本系统的队列条目只写入字符串字段，
    /// 出现二进制值说明写入方有缺陷，留给 message_id() 判定为格式错误。
    fn convert_fields(map: HashMap<String, redis::Value>) -> HashMap<String, String> {
        map.into_iter()
            .filter_map(|(k, v)| {
                redis::from_redis_value::<String>(v)
                    .ok()
                    .map(|value| (k, value))
            })
            .collect()
    }
}

/// 判断 XGROUP CREATE 的错误是否为"组已存在"
///
/// Redis 对重复创建返回 BUSYGROUP 错误，对本系统而言等价于成功。
fn is_group_exists_error(err: &redis::RedisError) -> bool {
    err.to_string().contains("BUSYGROUP")
}

#[async_trait]
impl DeliveryQueue for StreamQueue {
    async fn ensure_group(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;

        // "0" 将组锚定在流起点，MKSTREAM 在流不存在时自动创建
        let created: std::result::Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(&self.stream, &self.group, "0")
            .await;

        match created {
            Ok(()) => {
                info!(stream = %self.stream, group = %self.group, "消费组已创建");
                Ok(())
            }
            Err(e) if is_group_exists_error(&e) => {
                debug!(stream = %self.stream, group = %self.group, "消费组已存在");
                Ok(())
            }
            Err(e) => Err(CourierError::from(e)),
        }
    }

    async fn read_batch(&self, count: usize, block_ms: u64) -> Result<Vec<QueueEntry>> {
        let mut conn = self.get_conn().await?;

        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(count)
            .block(block_ms as usize);

        // ">" 游标：只读取尚未投递给组内任何消费者的新条目
        let reply: StreamReadReply = conn
            .xread_options(&[&self.stream], &[">"], &options)
            .await?;

        let entries: Vec<QueueEntry> = reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .map(|entry| QueueEntry {
                id: entry.id,
                fields: Self::convert_fields(entry.map),
            })
            .collect();

        if !entries.is_empty() {
            debug!(count = entries.len(), "读取到新队列条目");
        }

        Ok(entries)
    }

    async fn ack(&self, entry_id: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let _: i64 = conn.xack(&self.stream, &self.group, &[entry_id]).await?;
        debug!(entry_id, "队列条目已确认");
        Ok(())
    }

    async fn enqueue(&self, message_id: Uuid) -> Result<String> {
        let mut conn = self.get_conn().await?;
        let entry_id: String = conn
            .xadd(
                &self.stream,
                "*",
                &[(MESSAGE_ID_FIELD, message_id.to_string())],
            )
            .await?;
        debug!(%message_id, entry_id, "投递请求已入队");
        Ok(entry_id)
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(CourierError::from)
    }
}
