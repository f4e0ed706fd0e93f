//! 测试用内存实现
//!
//! 管道测试共用的存储/队列假实现与实体构造辅助。
//! 支持注入失败点（读取失败、特定状态更新失败、确认失败）
//! 以覆盖处理器的兜底路径。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

use courier_shared::error::{CourierError, Result};
use courier_shared::models::{
    Channel, Message, MessageDetails, MessageSource, MessageStatus, ProviderCredential,
    ProviderKind, ResolvedAssociation,
};
use courier_shared::queue::{DeliveryQueue, MESSAGE_ID_FIELD, QueueEntry};

use crate::store::{MessageStore, MessageTx};

// ---------------------------------------------------------------------------
// FakeStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct StoreState {
    pub details: HashMap<Uuid, MessageDetails>,
    /// 已提交的状态与原因（覆盖 details 中的初始状态）
    pub statuses: HashMap<Uuid, (MessageStatus, Option<String>)>,
    pub events: Vec<(Uuid, MessageStatus, Option<Value>)>,
    /// 注入：fetch_message_details 直接失败
    pub fail_fetch: bool,
    /// 注入：更新到指定状态时失败
    pub fail_update_to: Option<MessageStatus>,
    /// 注入：兜底标记失败也失败
    pub fail_mark_failed: bool,
}

#[derive(Clone, Default)]
pub(crate) struct FakeStore {
    state: Arc<Mutex<StoreState>>,
}

impl FakeStore {
    pub fn with_message(details: MessageDetails) -> Self {
        let store = Self::default();
        store.insert(details);
        store
    }

    pub fn insert(&self, details: MessageDetails) {
        let mut state = self.state.lock().unwrap();
        state.details.insert(details.message.id, details);
    }

    pub fn set_fail_fetch(&self) {
        self.state.lock().unwrap().fail_fetch = true;
    }

    pub fn set_fail_update_to(&self, status: MessageStatus) {
        self.state.lock().unwrap().fail_update_to = Some(status);
    }

    pub fn set_fail_mark_failed(&self) {
        self.state.lock().unwrap().fail_mark_failed = true;
    }

    /// 已提交的当前状态
    pub fn status_of(&self, id: Uuid) -> Option<MessageStatus> {
        let state = self.state.lock().unwrap();
        state
            .statuses
            .get(&id)
            .map(|(status, _)| *status)
            .or_else(|| state.details.get(&id).map(|d| d.message.status))
    }

    pub fn reason_of(&self, id: Uuid) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.statuses.get(&id).and_then(|(_, reason)| reason.clone())
    }

    /// 已提交的事件状态序列
    pub fn events_of(&self, id: Uuid) -> Vec<MessageStatus> {
        let state = self.state.lock().unwrap();
        state
            .events
            .iter()
            .filter(|(event_id, _, _)| *event_id == id)
            .map(|(_, status, _)| *status)
            .collect()
    }

    pub fn event_details_of(&self, id: Uuid) -> Vec<Option<Value>> {
        let state = self.state.lock().unwrap();
        state
            .events
            .iter()
            .filter(|(event_id, _, _)| *event_id == id)
            .map(|(_, _, details)| details.clone())
            .collect()
    }
}

#[async_trait]
impl MessageStore for FakeStore {
    async fn fetch_message_details(&self, id: Uuid) -> Result<Option<MessageDetails>> {
        let state = self.state.lock().unwrap();
        if state.fail_fetch {
            return Err(CourierError::Internal("注入的读取失败".to_string()));
        }
        Ok(state.details.get(&id).cloned())
    }

    async fn begin(&self) -> Result<Box<dyn MessageTx>> {
        Ok(Box::new(FakeTx {
            state: self.state.clone(),
            pending: Vec::new(),
        }))
    }

    async fn mark_failed_best_effort(&self, id: Uuid, reason: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_mark_failed {
            return Err(CourierError::Internal("注入的兜底失败".to_string()));
        }
        state
            .statuses
            .insert(id, (MessageStatus::Failed, Some(reason.to_string())));
        state
            .events
            .push((id, MessageStatus::Failed, Some(json!({"error": reason}))));
        Ok(())
    }
}

enum PendingOp {
    Status(Uuid, MessageStatus, Option<String>),
    Event(Uuid, MessageStatus, Option<Value>),
}

/// 缓冲写入，commit 时一次性应用；未 commit 即丢弃等价于回滚
struct FakeTx {
    state: Arc<Mutex<StoreState>>,
    pending: Vec<PendingOp>,
}

#[async_trait]
impl MessageTx for FakeTx {
    async fn current_status(&mut self, id: Uuid) -> Result<MessageStatus> {
        let state = self.state.lock().unwrap();
        state
            .statuses
            .get(&id)
            .map(|(status, _)| *status)
            .or_else(|| state.details.get(&id).map(|d| d.message.status))
            .ok_or_else(|| CourierError::NotFound {
                entity: "message".to_string(),
                id: id.to_string(),
            })
    }

    async fn update_status(
        &mut self,
        id: Uuid,
        status: MessageStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        if self.state.lock().unwrap().fail_update_to == Some(status) {
            return Err(CourierError::Internal(format!("注入的 {status} 更新失败")));
        }
        self.pending
            .push(PendingOp::Status(id, status, reason.map(String::from)));
        Ok(())
    }

    async fn log_event(
        &mut self,
        id: Uuid,
        status: MessageStatus,
        details: Option<&Value>,
    ) -> Result<()> {
        self.pending
            .push(PendingOp::Event(id, status, details.cloned()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for op in self.pending {
            match op {
                PendingOp::Status(id, status, reason) => {
                    state.statuses.insert(id, (status, reason));
                }
                PendingOp::Event(id, status, details) => {
                    state.events.push((id, status, details));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeQueue
// ---------------------------------------------------------------------------

pub(crate) enum BatchOutcome {
    Entries(Vec<QueueEntry>),
    ReadError,
}

#[derive(Default)]
struct QueueState {
    batches: VecDeque<BatchOutcome>,
    acked: Vec<String>,
    fail_ack: bool,
}

#[derive(Clone, Default)]
pub(crate) struct FakeQueue {
    state: Arc<Mutex<QueueState>>,
}

impl FakeQueue {
    pub fn push_batch(&self, entries: Vec<QueueEntry>) {
        self.state
            .lock()
            .unwrap()
            .batches
            .push_back(BatchOutcome::Entries(entries));
    }

    pub fn push_read_error(&self) {
        self.state
            .lock()
            .unwrap()
            .batches
            .push_back(BatchOutcome::ReadError);
    }

    pub fn set_fail_ack(&self) {
        self.state.lock().unwrap().fail_ack = true;
    }

    pub fn acked(&self) -> Vec<String> {
        self.state.lock().unwrap().acked.clone()
    }
}

#[async_trait]
impl DeliveryQueue for FakeQueue {
    async fn ensure_group(&self) -> Result<()> {
        Ok(())
    }

    async fn read_batch(&self, _count: usize, block_ms: u64) -> Result<Vec<QueueEntry>> {
        let next = self.state.lock().unwrap().batches.pop_front();
        match next {
            Some(BatchOutcome::Entries(entries)) => Ok(entries),
            Some(BatchOutcome::ReadError) => {
                Err(CourierError::Internal("注入的队列读取失败".to_string()))
            }
            // 模拟阻塞读超时
            None => {
                tokio::time::sleep(std::time::Duration::from_millis(block_ms)).await;
                Ok(Vec::new())
            }
        }
    }

    async fn ack(&self, entry_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_ack {
            return Err(CourierError::Internal("注入的确认失败".to_string()));
        }
        state.acked.push(entry_id.to_string());
        Ok(())
    }

    async fn enqueue(&self, message_id: Uuid) -> Result<String> {
        let entry_id = format!("0-{message_id}");
        self.push_batch(vec![queue_entry(&entry_id, &message_id.to_string())]);
        Ok(entry_id)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 实体构造辅助
// ---------------------------------------------------------------------------

pub(crate) fn queue_entry(entry_id: &str, message_id: &str) -> QueueEntry {
    QueueEntry {
        id: entry_id.to_string(),
        fields: [(MESSAGE_ID_FIELD.to_string(), message_id.to_string())]
            .into_iter()
            .collect(),
    }
}

pub(crate) fn message(status: MessageStatus, channel: Channel) -> Message {
    let (payload, recipient) = match channel {
        Channel::Email => (
            json!({"subject": "hello", "text": "world"}),
            "user@example.com",
        ),
        Channel::Sms => (json!({"text": "验证码 123456"}), "+14155552671"),
    };
    Message {
        id: Uuid::new_v4(),
        app_id: Uuid::new_v4(),
        channel,
        status,
        status_reason: None,
        payload: Some(payload),
        recipient: Some(recipient.to_string()),
        source: MessageSource::Api,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub(crate) fn association(channel: Channel) -> ResolvedAssociation {
    let provider_kind = match channel {
        Channel::Email => ProviderKind::Ses,
        Channel::Sms => ProviderKind::Sns,
    };
    ResolvedAssociation {
        id: Uuid::new_v4(),
        provider_kind,
        priority: 10,
        credential: Some(ProviderCredential {
            id: Uuid::new_v4(),
            encrypted_secrets:
                r#"{"access_key_id":"AK","secret_access_key":"SK","region":"us-east-1"}"#
                    .to_string(),
        }),
        config: Some(json!({"from_address": "noreply@example.com"})),
    }
}

pub(crate) fn details(status: MessageStatus, channel: Channel) -> MessageDetails {
    MessageDetails {
        message: message(status, channel),
        association: Some(association(channel)),
    }
}
