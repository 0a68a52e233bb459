use async_trait::async_trait;
use courier_core::dead_letter::DeadLetterQueues;
use courier_core::error::BusResult;
use courier_core::message::{BusCommand, BusEvent, BusRequest};
use std::time::Duration;

/// 消息总线（Bus）
///
/// - 应用代码使用的公共入口：发送命令、发起请求、广播请求、发布事件；
/// - 命令与事件交给传输层后即返回，实际调度异步进行，发送方看不到处理器的失败；
/// - 持续失败的消息只能通过死信队列观察到；
/// - 该 trait 带有泛型方法，通常以具体实现类型注入使用。
#[async_trait]
pub trait Bus: Send + Sync {
    /// 发送命令，命令进入传输层后返回
    async fn send<C>(&self, cmd: C) -> BusResult<()>
    where
        C: BusCommand;

    /// 发起请求并等待唯一的应答（使用默认超时）
    async fn request<R>(&self, req: R) -> BusResult<R::Response>
    where
        R: BusRequest;

    /// 发起请求并等待唯一的应答，超时返回 `BusError::RequestTimeout`
    async fn request_with_timeout<R>(&self, req: R, timeout: Duration) -> BusResult<R::Response>
    where
        R: BusRequest;

    /// 广播请求，返回截止时间前收到的全部应答
    async fn multicast_request<R>(&self, req: R, timeout: Duration) -> BusResult<Vec<R::Response>>
    where
        R: BusRequest;

    /// 发布事件：广播订阅与竞争订阅各投递一份
    async fn publish<E>(&self, event: E) -> BusResult<()>
    where
        E: BusEvent;

    fn dead_letter_queues(&self) -> &DeadLetterQueues;
}
