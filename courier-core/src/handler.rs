//! 处理器能力契约
//!
//! 每种角色一个 trait，消息按值传入；处理失败以 `anyhow::Error` 返回，
//! 由调度边界包装为 [`BusError::Handler`](crate::error::BusError::Handler)。
//!
use crate::message::{BusCommand, BusEvent, BusRequest, MessageContext};
use async_trait::async_trait;

#[async_trait]
pub trait CommandHandler<C>: Send + Sync
where
    C: BusCommand,
{
    async fn handle(&self, ctx: &MessageContext, cmd: C) -> anyhow::Result<()>;
}

#[async_trait]
pub trait RequestHandler<R>: Send + Sync
where
    R: BusRequest,
{
    async fn handle(&self, ctx: &MessageContext, req: R) -> anyhow::Result<R::Response>;
}

/// 广播事件处理器：每个注册的处理器都会收到事件
#[async_trait]
pub trait MulticastEventHandler<E>: Send + Sync
where
    E: BusEvent,
{
    async fn handle(&self, ctx: &MessageContext, event: E) -> anyhow::Result<()>;
}

/// 竞争事件处理器：传输层只把事件投递给众多消费进程中的一个
#[async_trait]
pub trait CompetingEventHandler<E>: Send + Sync
where
    E: BusEvent,
{
    async fn handle(&self, ctx: &MessageContext, event: E) -> anyhow::Result<()>;
}
