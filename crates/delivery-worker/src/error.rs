//! 投递 worker 错误类型
//!
//! 区分提供商调用失败与存储/基础设施失败，便于处理器决定
//! 将消息置为 failed 还是走兜底标记路径。

use thiserror::Error;

use crate::providers::ProviderError;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("提供商调用失败: {0}")]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Shared(#[from] courier_shared::error::CourierError),
}
