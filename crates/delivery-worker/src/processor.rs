//! 消息处理器
//!
//! 单条投递请求的完整生命周期：读取详情、幂等守卫、结构校验、
//! 状态机转换、提供商分发、事件追加，最后无条件确认队列条目。
//!
//! 处理器对外不返回错误——任何意外失败都收敛为兜底的 failed
//! 标记加日志，绝不让单条消息拖垮消费循环。

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{error, info, warn};
use uuid::Uuid;

use courier_shared::crypto::mask_recipient;
use courier_shared::models::{Channel, MessageDetails, MessageStatus, ProviderCredential};
use courier_shared::queue::DeliveryQueue;

use crate::error::WorkerError;
use crate::providers::ProviderRegistry;
use crate::store::MessageStore;

/// 通过结构校验的投递要素
///
/// 借用自 `MessageDetails`，校验通过即保证各字段存在。
struct ValidatedDelivery<'a> {
    channel: Channel,
    credential: &'a ProviderCredential,
    config: &'a Value,
    payload: &'a Value,
    recipient: &'a str,
}

/// 结构校验
///
/// 按固定顺序检查投递要素：关联 -> 凭证 -> 配置 -> 载荷 -> 收件人。
/// 首个缺失项即判定 malformed，返回人类可读的原因。
fn validate_structure(details: &MessageDetails) -> Result<ValidatedDelivery<'_>, String> {
    let message = &details.message;

    let association = details
        .association
        .as_ref()
        .ok_or_else(|| format!("应用在 {} 渠道没有启用的提供商关联", message.channel))?;

    let credential = association
        .credential
        .as_ref()
        .ok_or_else(|| format!("提供商关联 {} 未绑定凭证", association.id))?;

    let config = association
        .config
        .as_ref()
        .ok_or_else(|| format!("提供商关联 {} 缺少配置", association.id))?;

    let payload = message.payload.as_ref().ok_or("消息缺少载荷")?;

    let recipient = message
        .recipient
        .as_deref()
        .filter(|r| !r.is_empty())
        .ok_or("消息缺少收件人")?;

    Ok(ValidatedDelivery {
        channel: message.channel,
        credential,
        config,
        payload,
        recipient,
    })
}

/// 消息处理器
pub struct MessageProcessor {
    store: Arc<dyn MessageStore>,
    queue: Arc<dyn DeliveryQueue>,
    providers: Arc<ProviderRegistry>,
}

impl MessageProcessor {
    pub fn new(
        store: Arc<dyn MessageStore>,
        queue: Arc<dyn DeliveryQueue>,
        providers: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            store,
            queue,
            providers,
        }
    }

    /// 处理一条投递请求并确认队列条目
    ///
    /// 确认是无条件的：至少一次语义下，不确认只会换来一次注定
    /// 同样结局的重投。确认失败记录 critical 日志但不会 panic。
    pub async fn process(&self, message_id: Uuid, entry_id: &str) {
        if let Err(e) = self.try_process(message_id).await {
            error!(%message_id, entry_id, error = %e, "投递处理意外失败，尝试兜底标记");
            let reason = format!("投递处理意外失败: {e}");
            if let Err(mark_err) = self
                .store
                .mark_failed_best_effort(message_id, &reason)
                .await
            {
                error!(
                    %message_id,
                    error = %mark_err,
                    "兜底标记失败，消息状态可能滞留在 processing"
                );
            }
        }

        if let Err(e) = self.queue.ack(entry_id).await {
            error!(%message_id, entry_id, error = %e, "队列条目确认失败，条目将被重投");
        }
    }

    /// 核心处理流程；返回 Err 表示存储层意外失败，由外层兜底
    async fn try_process(&self, message_id: Uuid) -> Result<(), WorkerError> {
        let details = match self.store.fetch_message_details(message_id).await {
            Ok(Some(details)) => details,
            // 消息不存在：条目指向已不存在的行，确认后丢弃
            Ok(None) => {
                warn!(%message_id, "队列条目指向不存在的消息");
                return Ok(());
            }
            // 读取失败：不标记 failed（消息本身可能完好），留待重投
            Err(e) => {
                error!(%message_id, error = %e, "读取消息详情失败");
                return Ok(());
            }
        };

        let mut tx = self.store.begin().await?;

        // 幂等守卫：重复投递的条目遇到成功终态直接跳过
        let current = tx.current_status(message_id).await?;
        if current.is_terminal_success() {
            info!(%message_id, status = %current, "消息已是成功终态，跳过重复投递");
            tx.commit().await?;
            return Ok(());
        }

        let delivery = match validate_structure(&details) {
            Ok(delivery) => delivery,
            // 结构缺失是终态：重试不会让缺失的要素出现
            Err(reason) => {
                warn!(%message_id, reason, "消息结构缺失，判定 malformed");
                tx.update_status(message_id, MessageStatus::Malformed, Some(&reason))
                    .await?;
                tx.log_event(
                    message_id,
                    MessageStatus::Malformed,
                    Some(&json!({"error": reason})),
                )
                .await?;
                tx.commit().await?;
                return Ok(());
            }
        };

        tx.update_status(message_id, MessageStatus::Processing, None)
            .await?;
        tx.log_event(message_id, MessageStatus::Processing, None)
            .await?;

        let Some(adapter) = self.providers.get(delivery.channel) else {
            let reason = format!("渠道 {} 没有注册提供商适配器", delivery.channel);
            error!(%message_id, reason, "无法分发");
            tx.update_status(message_id, MessageStatus::Failed, Some(&reason))
                .await?;
            tx.log_event(
                message_id,
                MessageStatus::Failed,
                Some(&json!({"error": reason})),
            )
            .await?;
            tx.commit().await?;
            return Ok(());
        };

        info!(
            %message_id,
            channel = %delivery.channel,
            recipient = %mask_recipient(delivery.channel, delivery.recipient),
            "开始分发"
        );

        match adapter
            .send(
                delivery.credential,
                delivery.payload,
                delivery.config,
                delivery.recipient,
            )
            .await
        {
            Ok(outcome) => {
                info!(
                    %message_id,
                    provider_message_id = %outcome.provider_message_id,
                    "厂商已接收"
                );
                tx.update_status(message_id, MessageStatus::Sent, None)
                    .await?;
                tx.log_event(message_id, MessageStatus::Sent, Some(&outcome.details))
                    .await?;
            }
            Err(e) => {
                let reason = WorkerError::from(e).to_string();
                warn!(%message_id, error = %reason, "厂商调用失败");
                tx.update_status(message_id, MessageStatus::Failed, Some(&reason))
                    .await?;
                tx.log_event(
                    message_id,
                    MessageStatus::Failed,
                    Some(&json!({"error": reason})),
                )
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{MockProviderAdapter, ProviderError, SendOutcome};
    use crate::testing::{FakeQueue, FakeStore, association, details, message};
    use courier_shared::models::MessageDetails;

    fn sent_outcome() -> SendOutcome {
        SendOutcome {
            provider_message_id: "ses-abc".to_string(),
            details: json!({"provider": "ses", "messageId": "ses-abc"}),
        }
    }

    fn registry_with(adapter: MockProviderAdapter) -> Arc<ProviderRegistry> {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(adapter));
        Arc::new(registry)
    }

    /// 永不应被调用的适配器
    fn never_called(channel: Channel) -> Arc<ProviderRegistry> {
        let mut adapter = MockProviderAdapter::new();
        adapter.expect_channel().return_const(channel);
        adapter.expect_send().times(0);
        registry_with(adapter)
    }

    fn processor(
        store: &FakeStore,
        queue: &FakeQueue,
        providers: Arc<ProviderRegistry>,
    ) -> MessageProcessor {
        MessageProcessor::new(Arc::new(store.clone()), Arc::new(queue.clone()), providers)
    }

    /// queued 消息 + 有效关联 + 成功的适配器 => sent，
    /// 事件序列 processing、sent，条目被确认
    #[tokio::test]
    async fn test_happy_path_email_delivery() {
        let details = details(MessageStatus::Queued, Channel::Email);
        let id = details.message.id;

        let mut adapter = MockProviderAdapter::new();
        adapter.expect_channel().return_const(Channel::Email);
        adapter
            .expect_send()
            .times(1)
            .returning(|_, _, _, _| Ok(sent_outcome()));

        let store = FakeStore::with_message(details);
        let queue = FakeQueue::default();

        processor(&store, &queue, registry_with(adapter))
            .process(id, "1-0")
            .await;

        assert_eq!(store.status_of(id), Some(MessageStatus::Sent));
        assert_eq!(
            store.events_of(id),
            vec![MessageStatus::Processing, MessageStatus::Sent]
        );
        // sent 事件携带厂商响应详情
        let event_details = store.event_details_of(id);
        assert_eq!(event_details[1].as_ref().unwrap()["messageId"], "ses-abc");
        assert_eq!(queue.acked(), vec!["1-0"]);
    }

    /// 载荷为空 => malformed，恰好一条事件，适配器从未被调用，仍确认
    #[tokio::test]
    async fn test_null_payload_is_malformed() {
        let mut details = details(MessageStatus::Queued, Channel::Email);
        details.message.payload = None;
        let id = details.message.id;

        let store = FakeStore::with_message(details);
        let queue = FakeQueue::default();

        processor(&store, &queue, never_called(Channel::Email))
            .process(id, "1-0")
            .await;

        assert_eq!(store.status_of(id), Some(MessageStatus::Malformed));
        assert_eq!(store.events_of(id), vec![MessageStatus::Malformed]);
        assert!(store.reason_of(id).unwrap().contains("载荷"));
        assert_eq!(queue.acked(), vec!["1-0"]);
    }

    /// 幂等守卫：已 sent 的消息重复投递不产生任何副作用，仍确认
    #[tokio::test]
    async fn test_idempotency_guard_skips_sent_message() {
        let details = details(MessageStatus::Sent, Channel::Email);
        let id = details.message.id;

        let store = FakeStore::with_message(details);
        let queue = FakeQueue::default();

        processor(&store, &queue, never_called(Channel::Email))
            .process(id, "2-0")
            .await;

        assert_eq!(store.status_of(id), Some(MessageStatus::Sent));
        assert!(store.events_of(id).is_empty());
        assert_eq!(queue.acked(), vec!["2-0"]);
    }

    /// delivered 同样受幂等守卫保护
    #[tokio::test]
    async fn test_idempotency_guard_skips_delivered_message() {
        let details = details(MessageStatus::Delivered, Channel::Sms);
        let id = details.message.id;

        let store = FakeStore::with_message(details);
        let queue = FakeQueue::default();

        processor(&store, &queue, never_called(Channel::Sms))
            .process(id, "3-0")
            .await;

        assert_eq!(store.status_of(id), Some(MessageStatus::Delivered));
        assert!(store.events_of(id).is_empty());
    }

    /// 结构校验各缺失项逐一触发 malformed，原因可区分
    #[tokio::test]
    async fn test_each_missing_piece_is_malformed() {
        let cases: Vec<(Box<dyn Fn(&mut MessageDetails)>, &str)> = vec![
            (Box::new(|d| d.association = None), "关联"),
            (
                Box::new(|d| d.association.as_mut().unwrap().credential = None),
                "凭证",
            ),
            (
                Box::new(|d| d.association.as_mut().unwrap().config = None),
                "配置",
            ),
            (Box::new(|d| d.message.payload = None), "载荷"),
            (Box::new(|d| d.message.recipient = None), "收件人"),
            (
                Box::new(|d| d.message.recipient = Some(String::new())),
                "收件人",
            ),
        ];

        for (mutate, expected) in cases {
            let mut details = details(MessageStatus::Queued, Channel::Email);
            mutate(&mut details);
            let id = details.message.id;

            let store = FakeStore::with_message(details);
            let queue = FakeQueue::default();

            processor(&store, &queue, never_called(Channel::Email))
                .process(id, "4-0")
                .await;

            assert_eq!(
                store.status_of(id),
                Some(MessageStatus::Malformed),
                "缺失项: {expected}"
            );
            assert_eq!(store.events_of(id), vec![MessageStatus::Malformed]);
            assert!(
                store.reason_of(id).unwrap().contains(expected),
                "原因应包含 {expected}"
            );
            assert_eq!(queue.acked(), vec!["4-0"]);
        }
    }

    /// 适配器重试耗尽 => failed，原因携带最后一次底层错误
    #[tokio::test]
    async fn test_adapter_exhaustion_marks_failed() {
        let details = details(MessageStatus::Queued, Channel::Sms);
        let id = details.message.id;

        let mut adapter = MockProviderAdapter::new();
        adapter.expect_channel().return_const(Channel::Sms);
        adapter.expect_send().times(1).returning(|_, _, _, _| {
            Err(ProviderError::Exhausted {
                attempts: 3,
                last: "厂商瞬时错误: SNS 返回 503".to_string(),
            })
        });

        let store = FakeStore::with_message(details);
        let queue = FakeQueue::default();

        processor(&store, &queue, registry_with(adapter))
            .process(id, "5-0")
            .await;

        assert_eq!(store.status_of(id), Some(MessageStatus::Failed));
        assert_eq!(
            store.events_of(id),
            vec![MessageStatus::Processing, MessageStatus::Failed]
        );
        let reason = store.reason_of(id).unwrap();
        assert!(reason.contains("3 次"));
        assert!(reason.contains("503"));
        assert_eq!(queue.acked(), vec!["5-0"]);
    }

    /// 厂商拒绝（不可重试）同样落入 failed
    #[tokio::test]
    async fn test_vendor_rejection_marks_failed() {
        let details = details(MessageStatus::Queued, Channel::Email);
        let id = details.message.id;

        let mut adapter = MockProviderAdapter::new();
        adapter.expect_channel().return_const(Channel::Email);
        adapter
            .expect_send()
            .times(1)
            .returning(|_, _, _, _| Err(ProviderError::Vendor("邮箱被抑制".to_string())));

        let store = FakeStore::with_message(details);
        let queue = FakeQueue::default();

        processor(&store, &queue, registry_with(adapter))
            .process(id, "6-0")
            .await;

        assert_eq!(store.status_of(id), Some(MessageStatus::Failed));
        assert!(store.reason_of(id).unwrap().contains("邮箱被抑制"));
    }

    /// 渠道没有注册适配器 => failed（终态，不重试），仍确认
    #[tokio::test]
    async fn test_unregistered_channel_marks_failed() {
        let details = details(MessageStatus::Queued, Channel::Sms);
        let id = details.message.id;

        let store = FakeStore::with_message(details);
        let queue = FakeQueue::default();

        // 注册表只有邮件适配器
        processor(&store, &queue, never_called(Channel::Email))
            .process(id, "7-0")
            .await;

        assert_eq!(store.status_of(id), Some(MessageStatus::Failed));
        assert!(store.reason_of(id).unwrap().contains("sms"));
        assert_eq!(queue.acked(), vec!["7-0"]);
    }

    /// 消息不存在：只确认，不写任何状态或事件
    #[tokio::test]
    async fn test_missing_message_is_acked_only() {
        let store = FakeStore::default();
        let queue = FakeQueue::default();
        let id = Uuid::new_v4();

        processor(&store, &queue, never_called(Channel::Email))
            .process(id, "8-0")
            .await;

        assert!(store.events_of(id).is_empty());
        assert_eq!(queue.acked(), vec!["8-0"]);
    }

    /// 读取失败：不做兜底 failed 标记（消息可能完好），仍确认
    #[tokio::test]
    async fn test_fetch_error_is_acked_without_failed_mark() {
        let details = details(MessageStatus::Queued, Channel::Email);
        let id = details.message.id;

        let store = FakeStore::with_message(details);
        store.set_fail_fetch();
        let queue = FakeQueue::default();

        processor(&store, &queue, never_called(Channel::Email))
            .process(id, "9-0")
            .await;

        assert_eq!(store.status_of(id), Some(MessageStatus::Queued));
        assert!(store.events_of(id).is_empty());
        assert_eq!(queue.acked(), vec!["9-0"]);
    }

    /// processing 更新失败走外层兜底：全新事务标记 failed，仍确认
    #[tokio::test]
    async fn test_store_failure_triggers_best_effort_failed() {
        let details = details(MessageStatus::Queued, Channel::Email);
        let id = details.message.id;

        let store = FakeStore::with_message(details);
        store.set_fail_update_to(MessageStatus::Processing);
        let queue = FakeQueue::default();

        processor(&store, &queue, never_called(Channel::Email))
            .process(id, "10-0")
            .await;

        assert_eq!(store.status_of(id), Some(MessageStatus::Failed));
        assert!(store.reason_of(id).unwrap().contains("意外失败"));
        assert_eq!(queue.acked(), vec!["10-0"]);
    }

    /// 兜底标记也失败时只记日志，不 panic，仍尝试确认
    #[tokio::test]
    async fn test_best_effort_failure_does_not_panic() {
        let details = details(MessageStatus::Queued, Channel::Email);
        let id = details.message.id;

        let store = FakeStore::with_message(details);
        store.set_fail_update_to(MessageStatus::Processing);
        store.set_fail_mark_failed();
        let queue = FakeQueue::default();

        processor(&store, &queue, never_called(Channel::Email))
            .process(id, "11-0")
            .await;

        assert_eq!(queue.acked(), vec!["11-0"]);
    }

    /// 确认失败不 panic；状态机写入已提交不受影响
    #[tokio::test]
    async fn test_ack_failure_does_not_panic() {
        let details = details(MessageStatus::Queued, Channel::Email);
        let id = details.message.id;

        let mut adapter = MockProviderAdapter::new();
        adapter.expect_channel().return_const(Channel::Email);
        adapter
            .expect_send()
            .returning(|_, _, _, _| Ok(sent_outcome()));

        let store = FakeStore::with_message(details);
        let queue = FakeQueue::default();
        queue.set_fail_ack();

        processor(&store, &queue, registry_with(adapter))
            .process(id, "12-0")
            .await;

        assert_eq!(store.status_of(id), Some(MessageStatus::Sent));
        assert!(queue.acked().is_empty());
    }

    /// 结构校验顺序：关联缺失优先于载荷缺失被报告
    #[test]
    fn test_validation_order() {
        let mut d = details(MessageStatus::Queued, Channel::Email);
        d.association = None;
        d.message.payload = None;

        let reason = validate_structure(&d).err().unwrap();
        assert!(reason.contains("关联"));
    }

    /// 有效详情通过校验并借出全部要素
    #[test]
    fn test_validation_passes_for_complete_details() {
        let d = MessageDetails {
            message: message(MessageStatus::Queued, Channel::Sms),
            association: Some(association(Channel::Sms)),
        };

        let delivery = validate_structure(&d).unwrap();
        assert_eq!(delivery.channel, Channel::Sms);
        assert_eq!(delivery.recipient, "+14155552671");
    }
}
