//! 进程内消息总线（InMemoryBus）
//!
//! 以无界内存通道充当传输层，完整演示“发送 → 调度 → 重投 → 死信 → 取出”的闭环：
//! - `send`/`publish` 将消息序列化为信封后入队即返回；
//! - 接收循环为每条投递单独起一个任务，互不相关的消息并发调度；
//! - 成功：丢弃投递计数，请求的应答按消息标识回送给等待方；
//! - 配置错误：记录日志，不计数、不重投，等待中的请求方收到该错误；
//! - 执行失败：计数，未达上限则以同一消息标识立即重投，达到上限则原样转入对应种类的死信队列，
//!   等待中的请求方随即收到 `BusError::DeadLettered`；
//! - 关闭后无法重投的消息直接转入死信，不会丢失。
//!
//! 仅用于测试、示例与本地开发：不持久化、不做退避。
//!
use crate::bus::Bus;
use crate::envelope::Delivery;
use async_trait::async_trait;
use courier_core::broker::{DefaultMessageBroker, MessageBroker};
use courier_core::config::BusConfig;
use courier_core::dead_letter::{DeadLetterEntry, DeadLetterQueues};
use courier_core::delivery::{DeliveryOutcome, DeliveryTracker};
use courier_core::error::{BusError, BusResult};
use courier_core::factory::HandlerFactory;
use courier_core::message::{BusCommand, BusEvent, BusRequest, MessageContext, MessageId};
use courier_core::registry::HandlerRegistry;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

type ReplySender = oneshot::Sender<BusResult<Vec<u8>>>;

struct Inner<B> {
    broker: Arc<B>,
    config: BusConfig,
    tracker: DeliveryTracker,
    dead_letters: DeadLetterQueues,
    replies: DashMap<MessageId, ReplySender>,
    tx: mpsc::UnboundedSender<Delivery<B>>,
}

/// 基于内存通道的 Bus 实现
pub struct InMemoryBus<B = DefaultMessageBroker> {
    inner: Arc<Inner<B>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Delivery<B>>>>,
}

impl InMemoryBus<DefaultMessageBroker> {
    /// 以注册表构建默认调度器（仅支持无参构造的处理器）
    pub fn from_registry(config: BusConfig, registry: HandlerRegistry) -> BusResult<Self> {
        let broker = DefaultMessageBroker::builder()
            .registry(registry)
            .handler_concurrency(config.handler_concurrency)
            .build();
        Self::new(config, broker)
    }

    /// 以注册表与自定义工厂构建默认调度器
    pub fn from_registry_and_factory(
        config: BusConfig,
        registry: HandlerRegistry,
        factory: Arc<dyn HandlerFactory>,
    ) -> BusResult<Self> {
        let broker = DefaultMessageBroker::builder()
            .registry(registry)
            .factory(factory)
            .handler_concurrency(config.handler_concurrency)
            .build();
        Self::new(config, broker)
    }
}

impl<B: MessageBroker> InMemoryBus<B> {
    pub fn new(config: BusConfig, broker: B) -> BusResult<Self> {
        Self::with_dead_letter_queues(config, broker, DeadLetterQueues::in_memory())
    }

    pub fn with_dead_letter_queues(
        config: BusConfig,
        broker: B,
        dead_letters: DeadLetterQueues,
    ) -> BusResult<Self> {
        config.validate()?;
        let tracker = DeliveryTracker::new(config.max_delivery_attempts)?;
        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(Inner {
                broker: Arc::new(broker),
                config,
                tracker,
                dead_letters,
                replies: DashMap::new(),
                tx,
            }),
            rx: Mutex::new(Some(rx)),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn broker(&self) -> &B {
        &self.inner.broker
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.inner.tracker
    }

    /// 启动接收循环，返回可用于关闭/等待的句柄
    ///
    /// 启动前发送的消息会在通道中等待。每个总线只能启动一次。
    pub fn start(&self) -> BusResult<BusHandle> {
        let rx = self
            .rx
            .lock()
            .map_err(|_| BusError::transport("receiver lock poisoned"))?
            .take()
            .ok_or_else(|| BusError::transport("bus already started"))?;

        let token = CancellationToken::new();
        let in_flight = TaskTracker::new();
        let task = tokio::spawn(Inner::receive_loop(
            self.inner.clone(),
            rx,
            token.clone(),
            in_flight.clone(),
        ));
        tracing::info!(
            max_delivery_attempts = self.inner.config.max_delivery_attempts,
            "消息总线已启动"
        );

        Ok(BusHandle {
            token,
            tasks: vec![task],
            in_flight,
        })
    }

    fn enqueue(&self, delivery: Delivery<B>) -> BusResult<()> {
        tracing::debug!(
            message_type = delivery.message_type,
            message_id = %delivery.id,
            kind = %delivery.kind,
            "消息入队"
        );
        self.inner
            .tx
            .send(delivery)
            .map_err(|_| BusError::transport("transport channel closed"))
    }
}

impl<B: MessageBroker> Inner<B> {
    async fn receive_loop(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<Delivery<B>>,
        token: CancellationToken,
        in_flight: TaskTracker,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    break;
                }
                maybe_delivery = rx.recv() => {
                    match maybe_delivery {
                        Some(delivery) => {
                            let inner = self.clone();
                            in_flight.spawn(async move { inner.process(delivery).await });
                        }
                        None => {
                            break;
                        }
                    }
                }
            }
        }

        in_flight.close();
        tracing::info!("消息总线接收循环已停止");
    }

    async fn process(&self, delivery: Delivery<B>) {
        match delivery.dispatch(&self.broker).await {
            Ok(reply) => {
                self.tracker.record_success(delivery.id);
                if let Some(bytes) = reply {
                    self.reply(delivery.id, Ok(bytes));
                }
            }
            Err(err) if err.is_configuration_error() => {
                tracing::error!(
                    message_type = delivery.message_type,
                    message_id = %delivery.id,
                    error = %err,
                    "配置错误，消息不重试"
                );
                self.reply(delivery.id, Err(err));
            }
            Err(err) => match self.tracker.record_failure(delivery.id) {
                DeliveryOutcome::Retry { attempts } => {
                    tracing::warn!(
                        message_type = delivery.message_type,
                        message_id = %delivery.id,
                        attempts,
                        max_delivery_attempts = self.tracker.max_delivery_attempts(),
                        error = %err,
                        "消息处理失败，等待重投"
                    );
                    if let Err(delivery) = self.redeliver(delivery.redelivery()) {
                        self.tracker.discard(delivery.id);
                        self.dead_letter(delivery, attempts, &err).await;
                    }
                }
                DeliveryOutcome::DeadLetter { attempts } => {
                    tracing::warn!(
                        message_type = delivery.message_type,
                        message_id = %delivery.id,
                        attempts,
                        error = %err,
                        "超过最大投递次数，消息转入死信"
                    );
                    self.dead_letter(delivery, attempts, &err).await;
                }
            },
        }
    }

    fn reply(&self, id: MessageId, result: BusResult<Vec<u8>>) {
        // 请求方已超时离开时应答被丢弃
        if let Some((_, tx)) = self.replies.remove(&id) {
            let _ = tx.send(result);
        }
    }

    // 接收端已关闭时交还投递
    fn redeliver(&self, delivery: Delivery<B>) -> Result<(), Delivery<B>> {
        self.tx.send(delivery).map_err(|rejected| {
            let delivery = rejected.0;
            tracing::warn!(
                message_type = delivery.message_type,
                message_id = %delivery.id,
                "传输通道已关闭，无法重投，消息转入死信"
            );
            delivery
        })
    }

    async fn dead_letter(&self, delivery: Delivery<B>, attempts: u32, err: &BusError) {
        let entry = DeadLetterEntry::builder()
            .message_id(delivery.id)
            .message_type(delivery.message_type)
            .kind(delivery.kind)
            .payload(delivery.payload.to_vec())
            .attempts(attempts)
            .reason(err.to_string())
            .build();

        if let Err(e) = self.dead_letters.for_kind(delivery.kind).push(entry).await {
            tracing::error!(
                message_type = delivery.message_type,
                message_id = %delivery.id,
                error = %e,
                "写入死信队列失败"
            );
        }

        self.reply(
            delivery.id,
            Err(BusError::DeadLettered {
                message: delivery.message_type,
                attempts,
            }),
        );
    }
}

#[async_trait]
impl<B: MessageBroker> Bus for InMemoryBus<B> {
    async fn send<C>(&self, cmd: C) -> BusResult<()>
    where
        C: BusCommand,
    {
        self.enqueue(Delivery::command(&cmd)?)
    }

    async fn request<R>(&self, req: R) -> BusResult<R::Response>
    where
        R: BusRequest,
    {
        let timeout = self.inner.config.default_request_timeout;
        self.request_with_timeout(req, timeout).await
    }

    async fn request_with_timeout<R>(&self, req: R, timeout: Duration) -> BusResult<R::Response>
    where
        R: BusRequest,
    {
        let delivery = Delivery::<B>::request(&req)?;
        let id = delivery.id;
        let (tx, rx) = oneshot::channel();
        self.inner.replies.insert(id, tx);
        let _slot = ReplySlot {
            replies: &self.inner.replies,
            id,
        };

        self.enqueue(delivery)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(bytes))) => Ok(serde_json::from_slice(&bytes)?),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(BusError::transport("reply channel closed")),
            Err(_) => Err(BusError::RequestTimeout {
                message: R::NAME,
                timeout,
            }),
        }
    }

    async fn multicast_request<R>(&self, req: R, timeout: Duration) -> BusResult<Vec<R::Response>>
    where
        R: BusRequest,
    {
        self.inner
            .broker
            .handle_multicast_request(&MessageContext::default(), req, timeout)
            .await
    }

    async fn publish<E>(&self, event: E) -> BusResult<()>
    where
        E: BusEvent,
    {
        let multicast = Delivery::<B>::multicast_event(&event)?;
        let correlation_id = multicast.id.to_string();
        let competing =
            Delivery::<B>::competing_event(&event)?.with_correlation_id(&correlation_id);

        self.enqueue(multicast.with_correlation_id(correlation_id))?;
        self.enqueue(competing)
    }

    fn dead_letter_queues(&self) -> &DeadLetterQueues {
        &self.inner.dead_letters
    }
}

// 请求方离开（收到应答、超时或被取消）时移除应答槽位
struct ReplySlot<'a> {
    replies: &'a DashMap<MessageId, ReplySender>,
    id: MessageId,
}

impl Drop for ReplySlot<'_> {
    fn drop(&mut self) {
        self.replies.remove(&self.id);
    }
}

/// 总线运行句柄：用于优雅关闭与等待任务结束
///
/// `join` 在接收循环停止后继续等待已接收消息的调度全部结束。
pub struct BusHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    in_flight: TaskTracker,
}

impl BusHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn join(mut self) {
        let tasks = std::mem::take(&mut self.tasks);

        for t in tasks {
            let _ = t.await;
        }
        self.in_flight.wait().await;
    }
}

impl Drop for BusHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
