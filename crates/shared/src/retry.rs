//! 厂商调用重试策略与执行器
//!
//! 提供指数退避重试机制，用于厂商接口瞬时故障（限流、5xx）的自动恢复。
//! 结构性错误（凭证/配置形状不符、参数无效）不应被重试——
//! 由调用方通过 `is_transient` 闭包控制。

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

/// 重试执行的失败结果
///
/// 区分"遇到不可重试错误立即中止"和"重试次数耗尽"两种失败路径，
/// 便于上层在失败原因中说明尝试次数。
#[derive(Debug)]
pub enum RetryError<E> {
    /// 遇到非瞬时错误，剩余尝试次数未消耗
    Aborted(E),
    /// 所有尝试均失败，携带最后一次的底层错误
    Exhausted { attempts: u32, last: E },
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aborted(e) => write!(f, "不可重试错误: {e}"),
            Self::Exhausted { attempts, last } => {
                write!(f, "重试 {attempts} 次后仍失败: {last}")
            }
        }
    }
}

/// 厂商调用重试策略
///
/// `max_attempts` 含首次调用。第 n 次重试前（n 从 1 开始）
/// 等待 `base_delay * 2^(n-1)`：首次重试等 1 倍基准，第 2 次等 2 倍，
/// 第 3 次等 4 倍，以此类推。首次调用前不等待。
#[derive(Debug, Clone)]
pub struct DispatchRetryPolicy {
    /// 最大尝试次数（含首次调用），至少为 1
    pub max_attempts: u32,
    /// 指数退避基准间隔
    pub base_delay: Duration,
}

impl Default for DispatchRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl DispatchRetryPolicy {
    /// 第 attempt 次调用前的等待时间（attempt 从 1 开始计数）
    ///
    /// 首次调用不等待；之后按 base_delay * 2^(retry-1) 递增。
    pub fn delay_before_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt <= 1 {
            return None;
        }
        let retry = attempt - 1;
        let multiplier = 2u32.saturating_pow(retry - 1);
        Some(self.base_delay.saturating_mul(multiplier))
    }
}

/// 带重试的异步执行器
///
/// 对任意异步操作应用重试策略。仅在 `is_transient` 判定错误为瞬时时
/// 才重试；其他错误立即中止，不消耗剩余尝试次数。
pub async fn send_with_retry<F, Fut, T, E>(
    policy: &DispatchRetryPolicy,
    operation_name: &str,
    is_transient: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 1;

    loop {
        if let Some(delay) = policy.delay_before_attempt(attempt) {
            tokio::time::sleep(delay).await;
        }

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation = operation_name, attempt, "操作在重试后成功");
                }
                return Ok(value);
            }
            Err(err) => {
                // 非瞬时错误不重试，直接返回
                if !is_transient(&err) {
                    warn!(
                        operation = operation_name,
                        error = %err,
                        "操作失败且不可重试，直接返回错误"
                    );
                    return Err(RetryError::Aborted(err));
                }

                // 已用尽尝试次数
                if attempt >= max_attempts {
                    warn!(
                        operation = operation_name,
                        attempts = attempt,
                        error = %err,
                        "已达最大尝试次数，放弃重试"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }

                warn!(
                    operation = operation_name,
                    attempt,
                    error = %err,
                    "操作失败，将在退避后重试"
                );
                attempt += 1;
            }
        }
    }
}
