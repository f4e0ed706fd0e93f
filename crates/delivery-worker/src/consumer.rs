//! 队列消费循环
//!
//! 以消费组身份阻塞读取投递请求，批内条目并发分发给处理器，
//! 等待整批结算后再读下一批。单条失败被隔离在各自的任务内，
//! 循环本身只会因关闭信号退出。

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{error, info, warn};

use courier_shared::config::WorkerConfig;
use courier_shared::queue::{DeliveryQueue, QueueEntry};

use crate::processor::MessageProcessor;

/// 队列读取失败后的退避间隔
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// 投递消费者
pub struct DeliveryConsumer {
    queue: Arc<dyn DeliveryQueue>,
    processor: Arc<MessageProcessor>,
    read_count: usize,
    block_timeout_ms: u64,
}

impl DeliveryConsumer {
    pub fn new(
        queue: Arc<dyn DeliveryQueue>,
        processor: Arc<MessageProcessor>,
        worker: &WorkerConfig,
    ) -> Self {
        Self {
            queue,
            processor,
            read_count: worker.read_count,
            block_timeout_ms: worker.block_timeout_ms,
        }
    }

    /// 运行消费循环直到收到关闭信号
    ///
    /// 关闭时停止读取新条目，已进入处理的条目在各自任务内
    /// 完成收尾（处理器的无条件确认保证不留悬挂状态）。
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            read_count = self.read_count,
            block_timeout_ms = self.block_timeout_ms,
            "消费循环启动"
        );

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("收到关闭信号，消费循环退出");
                        break;
                    }
                }

                batch = self.queue.read_batch(self.read_count, self.block_timeout_ms) => {
                    match batch {
                        Ok(entries) if entries.is_empty() => {}
                        Ok(entries) => self.process_batch(entries).await,
                        // 队列后端抖动不致命，退避后继续
                        Err(e) => {
                            error!(error = %e, "读取队列失败，退避后重试");
                            tokio::time::sleep(READ_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }

    /// 并发处理一批条目并等待全部结算
    ///
    /// 每条条目独立 spawn，panic 被任务边界吸收，不影响批内
    /// 其余条目，也不影响消费循环。
    async fn process_batch(&self, entries: Vec<QueueEntry>) {
        let mut handles = Vec::with_capacity(entries.len());

        for entry in entries {
            let message_id = match entry.message_id() {
                Ok(id) => id,
                // 传输层格式错误：没有可处理的内容，直接确认丢弃
                Err(e) => {
                    warn!(entry_id = %entry.id, error = %e, "条目格式错误，直接确认");
                    if let Err(ack_err) = self.queue.ack(&entry.id).await {
                        error!(entry_id = %entry.id, error = %ack_err, "格式错误条目确认失败");
                    }
                    continue;
                }
            };

            let processor = self.processor.clone();
            handles.push(tokio::spawn(async move {
                processor.process(message_id, &entry.id).await;
            }));
        }

        for settled in join_all(handles).await {
            if let Err(e) = settled {
                error!(error = %e, "投递任务异常终止");
            }
        }
    }
}
