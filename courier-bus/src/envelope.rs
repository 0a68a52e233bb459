//! 传输信封（Delivery）
//!
//! 进程内传输搬运的是序列化后的字节，信封同时携带一个按消息类型单态化的调度函数，
//! 接收端据此把字节还原为具体消息并交给调度器。重投时复用同一消息标识，
//! 投递次数加一。
//!
use courier_core::broker::MessageBroker;
use courier_core::error::BusResult;
use courier_core::message::{
    BusCommand, BusEvent, BusMessage, BusRequest, MessageContext, MessageId, MessageKind,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub(crate) type DispatchFuture<'a> =
    Pin<Box<dyn Future<Output = BusResult<Option<Vec<u8>>>> + Send + 'a>>;

/// 成功时返回请求的应答字节；命令与事件返回 `None`
pub(crate) type DispatchFn<B> =
    for<'a> fn(&'a B, &'a MessageContext, &'a [u8]) -> DispatchFuture<'a>;

pub(crate) struct Delivery<B> {
    pub(crate) id: MessageId,
    pub(crate) message_type: &'static str,
    pub(crate) kind: MessageKind,
    pub(crate) payload: Arc<[u8]>,
    pub(crate) delivery_count: u32,
    pub(crate) correlation_id: Option<String>,
    dispatch: DispatchFn<B>,
}

impl<B: MessageBroker> Delivery<B> {
    pub(crate) fn command<C: BusCommand>(cmd: &C) -> BusResult<Self> {
        Self::encode(cmd, MessageKind::Command, dispatch_command::<B, C>)
    }

    pub(crate) fn request<R: BusRequest>(req: &R) -> BusResult<Self> {
        Self::encode(req, MessageKind::Request, handle_request::<B, R>)
    }

    pub(crate) fn multicast_event<E: BusEvent>(event: &E) -> BusResult<Self> {
        Self::encode(event, MessageKind::Event, publish_multicast_event::<B, E>)
    }

    pub(crate) fn competing_event<E: BusEvent>(event: &E) -> BusResult<Self> {
        Self::encode(event, MessageKind::Event, publish_competing_event::<B, E>)
    }

    pub(crate) fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub(crate) fn context(&self) -> MessageContext {
        MessageContext {
            message_id: self.id,
            delivery_count: self.delivery_count,
            correlation_id: self.correlation_id.clone(),
        }
    }

    pub(crate) async fn dispatch(&self, broker: &B) -> BusResult<Option<Vec<u8>>> {
        let ctx = self.context();
        (self.dispatch)(broker, &ctx, &self.payload).await
    }

    /// 重投：同一消息标识，投递次数加一
    pub(crate) fn redelivery(self) -> Self {
        Self {
            delivery_count: self.delivery_count + 1,
            ..self
        }
    }

    fn encode<M: BusMessage>(
        message: &M,
        kind: MessageKind,
        dispatch: DispatchFn<B>,
    ) -> BusResult<Self> {
        Ok(Self {
            id: MessageId::new(),
            message_type: M::NAME,
            kind,
            payload: serde_json::to_vec(message)?.into(),
            delivery_count: 1,
            correlation_id: None,
            dispatch,
        })
    }
}

fn dispatch_command<'a, B, C>(
    broker: &'a B,
    ctx: &'a MessageContext,
    payload: &'a [u8],
) -> DispatchFuture<'a>
where
    B: MessageBroker,
    C: BusCommand,
{
    Box::pin(async move {
        let cmd: C = serde_json::from_slice(payload)?;
        broker.dispatch_command(ctx, cmd).await?;
        Ok(None)
    })
}

fn handle_request<'a, B, R>(
    broker: &'a B,
    ctx: &'a MessageContext,
    payload: &'a [u8],
) -> DispatchFuture<'a>
where
    B: MessageBroker,
    R: BusRequest,
{
    Box::pin(async move {
        let req: R = serde_json::from_slice(payload)?;
        let response = broker.handle_request(ctx, req).await?;
        Ok(Some(serde_json::to_vec(&response)?))
    })
}

fn publish_multicast_event<'a, B, E>(
    broker: &'a B,
    ctx: &'a MessageContext,
    payload: &'a [u8],
) -> DispatchFuture<'a>
where
    B: MessageBroker,
    E: BusEvent,
{
    Box::pin(async move {
        let event: E = serde_json::from_slice(payload)?;
        broker.publish_multicast_event(ctx, event).await?;
        Ok(None)
    })
}

fn publish_competing_event<'a, B, E>(
    broker: &'a B,
    ctx: &'a MessageContext,
    payload: &'a [u8],
) -> DispatchFuture<'a>
where
    B: MessageBroker,
    E: BusEvent,
{
    Box::pin(async move {
        let event: E = serde_json::from_slice(payload)?;
        broker.publish_competing_event(ctx, event).await?;
        Ok(None)
    })
}
