//! 死信（Dead Letter）
//!
//! 超过最大投递次数的消息被原样（按字节）复制到死信存储，并带上消息类型名，
//! 以便按类型取出：
//! - [`DeadLetterStore`]：底层队列协议，按消息类型 FIFO，取出时从不阻塞；
//! - [`DeadLetterQueue`]：某一消息种类的死信队列，`pop::<T>()` 直接还原为消息类型；
//! - [`DeadLetterQueues`]：命令、请求、事件三个死信队列的集合。
//!
use crate::error::BusResult;
use crate::message::{BusMessage, MessageId, MessageKind};
use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// 死信条目
#[derive(Clone, Debug, Builder, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// 原消息标识
    message_id: MessageId,
    /// 消息类型名（`BusMessage::NAME`）
    #[builder(into)]
    message_type: String,
    kind: MessageKind,
    /// 原始消息字节，逐字节保留
    payload: Vec<u8>,
    /// 进入死信前的投递次数
    attempts: u32,
    /// 最后一次失败的原因
    reason: Option<String>,
    #[builder(default = Utc::now())]
    dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn dead_lettered_at(&self) -> DateTime<Utc> {
        self.dead_lettered_at
    }

    /// 将原始字节还原为消息
    pub fn decode<T: BusMessage>(&self) -> BusResult<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// 死信存储协议（由外部队列实现）
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn push(&self, entry: DeadLetterEntry) -> BusResult<()>;

    /// 取出该类型最早的一条死信；为空时返回 `None`，不阻塞
    async fn pop(&self, message_type: &str) -> BusResult<Option<DeadLetterEntry>>;

    async fn len(&self, message_type: &str) -> BusResult<usize>;
}

/// 内存版死信存储
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    queues: DashMap<String, VecDeque<DeadLetterEntry>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn push(&self, entry: DeadLetterEntry) -> BusResult<()> {
        self.queues
            .entry(entry.message_type.clone())
            .or_default()
            .push_back(entry);
        Ok(())
    }

    async fn pop(&self, message_type: &str) -> BusResult<Option<DeadLetterEntry>> {
        Ok(self
            .queues
            .get_mut(message_type)
            .and_then(|mut queue| queue.pop_front()))
    }

    async fn len(&self, message_type: &str) -> BusResult<usize> {
        Ok(self.queues.get(message_type).map_or(0, |queue| queue.len()))
    }
}

/// 某一消息种类的死信队列
#[derive(Clone)]
pub struct DeadLetterQueue {
    kind: MessageKind,
    store: Arc<dyn DeadLetterStore>,
}

impl DeadLetterQueue {
    pub fn new(kind: MessageKind, store: Arc<dyn DeadLetterStore>) -> Self {
        Self { kind, store }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub async fn push(&self, entry: DeadLetterEntry) -> BusResult<()> {
        self.store.push(entry).await
    }

    /// 取出一条 `T` 类型的死信并还原为消息；队列为空时返回 `None`
    ///
    /// 条目一经取出即从存储中移除，即便还原失败也不会放回。
    pub async fn pop<T: BusMessage>(&self) -> BusResult<Option<T>> {
        match self.store.pop(T::NAME).await? {
            Some(entry) => entry.decode().map(Some),
            None => Ok(None),
        }
    }

    /// 取出一条原始死信条目
    pub async fn pop_entry(&self, message_type: &str) -> BusResult<Option<DeadLetterEntry>> {
        self.store.pop(message_type).await
    }

    pub async fn len<T: BusMessage>(&self) -> BusResult<usize> {
        self.store.len(T::NAME).await
    }
}

/// 命令、请求、事件三个死信队列
#[derive(Clone)]
pub struct DeadLetterQueues {
    command_queue: DeadLetterQueue,
    request_queue: DeadLetterQueue,
    event_queue: DeadLetterQueue,
}

impl DeadLetterQueues {
    pub fn new(
        commands: Arc<dyn DeadLetterStore>,
        requests: Arc<dyn DeadLetterStore>,
        events: Arc<dyn DeadLetterStore>,
    ) -> Self {
        Self {
            command_queue: DeadLetterQueue::new(MessageKind::Command, commands),
            request_queue: DeadLetterQueue::new(MessageKind::Request, requests),
            event_queue: DeadLetterQueue::new(MessageKind::Event, events),
        }
    }

    /// 三个种类各自使用独立的内存存储
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryDeadLetterStore::new()),
            Arc::new(InMemoryDeadLetterStore::new()),
            Arc::new(InMemoryDeadLetterStore::new()),
        )
    }

    pub fn command_queue(&self) -> &DeadLetterQueue {
        &self.command_queue
    }

    pub fn request_queue(&self) -> &DeadLetterQueue {
        &self.request_queue
    }

    pub fn event_queue(&self) -> &DeadLetterQueue {
        &self.event_queue
    }

    pub fn for_kind(&self, kind: MessageKind) -> &DeadLetterQueue {
        match kind {
            MessageKind::Command => &self.command_queue,
            MessageKind::Request => &self.request_queue,
            MessageKind::Event => &self.event_queue,
        }
    }
}

impl Default for DeadLetterQueues {
    fn default() -> Self {
        Self::in_memory()
    }
}
