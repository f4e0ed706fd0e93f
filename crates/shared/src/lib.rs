//! 共享库
//!
//! 包含投递 worker 与 API 面共用的配置、错误处理、数据库连接、
//! 队列（Redis Streams）、凭证加密和重试策略等基础设施代码。

pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod models;
pub mod queue;
pub mod retry;
