//! 消息契约（Message Contracts）
//!
//! 总线上流转的消息分为三类：
//! - 命令（`BusCommand`）：只交给一个处理器，不期望返回值；
//! - 请求（`BusRequest`）：与一个响应类型（`BusResponse`）配对，由处理器产出应答；
//! - 事件（`BusEvent`）：广播给所有订阅者，或在竞争消费者之间投递给其中之一。
//!
//! 所有消息都必须可序列化，传输层以字节形式搬运，死信存储也按原始字节保存。
//!
use bon::Builder;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use uuid::Uuid;

/// 总线消息的公共约束
///
/// 关联常量：
/// - `NAME`：消息类型的稳定名称，用于路由、日志与死信分类。避免依赖 `type_name::<T>()`。
pub trait BusMessage: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// 消息类型的稳定名称（建议常量字符串，不随重构变化）
    const NAME: &'static str;
}

/// 命令：表达意图，交给唯一的处理器执行
pub trait BusCommand: BusMessage {}

/// 请求的响应
pub trait BusResponse: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// 请求：与响应类型配对
pub trait BusRequest: BusMessage {
    type Response: BusResponse;
}

/// 事件：已经发生的事实
pub trait BusEvent: BusMessage {}

/// 消息种类，决定消息进入哪一个死信队列
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Command,
    Request,
    Event,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Command => f.write_str("command"),
            MessageKind::Request => f.write_str("request"),
            MessageKind::Event => f.write_str("event"),
        }
    }
}

/// 物理投递的消息标识，由传输层分配
///
/// 投递计数以此为键，与消息的业务内容无关：内容相同的两次发送是两条不同的消息。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MessageId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// 处理上下文：一次投递交给处理器时附带的元信息
///
/// ```rust
/// use courier_core::message::{MessageContext, MessageId};
///
/// let ctx = MessageContext::builder()
///     .message_id(MessageId::new())
///     .delivery_count(1)
///     .maybe_correlation_id(Some("cor-123".into()))
///     .build();
/// assert_eq!(ctx.delivery_count, 1);
/// ```
#[derive(Clone, Debug, Builder)]
pub struct MessageContext {
    /// 本次投递的消息标识
    #[builder(default)]
    pub message_id: MessageId,
    /// 第几次投递（从 1 开始）
    #[builder(default = 1)]
    pub delivery_count: u32,
    /// 关联 ID，用于将多条消息串到同一个业务操作
    pub correlation_id: Option<String>,
}

impl Default for MessageContext {
    fn default() -> Self {
        Self::for_delivery(MessageId::new(), 1)
    }
}

impl MessageContext {
    pub fn for_delivery(message_id: MessageId, delivery_count: u32) -> Self {
        Self {
            message_id,
            delivery_count,
            correlation_id: None,
        }
    }
}
