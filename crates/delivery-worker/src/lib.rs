//! 投递 worker 服务
//!
//! 从 Redis Streams 消费投递请求，经幂等与结构校验后分发到
//! 渠道对应的提供商适配器（邮件/SES、短信/SNS）执行发送，
//! 在事务内完成状态机转换并追加审计事件。
//!
//! 语义为至少一次：条目未确认即可能被重新投递，处理器通过
//! 事务内的幂等守卫保证重复投递不产生副作用。

pub mod consumer;
pub mod error;
pub mod processor;
pub mod providers;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
