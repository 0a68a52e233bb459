//! 消息总线调度核心（courier-core）
//!
//! 收到一条命令、请求或事件后，找到已注册的处理器并按约定的并发与失败策略调用，
//! 返回明确的结果：单个应答、截止时间内聚合的应答集合，或者什么都不返回。
//! 同时按消息统计失败的投递次数，把持续失败的消息转入死信，而不是无限重试。
//!
//! - `message`：消息契约（命令/请求/响应/事件）、消息标识与处理上下文；
//! - `handler`：各角色的处理器能力契约；
//! - `registry` / `factory`：显式的处理器注册表与可插拔的实例工厂；
//! - `broker`：四种调度模式；
//! - `aggregator`：广播请求的机会式聚合；
//! - `delivery`：投递计数与死信判定；
//! - `dead_letter`：死信存储与按类型取出；
//! - `config` / `error`：配置与统一错误。
//!
//! 本 crate 不包含传输实现，物理搬运消息、重投与退避由外部传输负责，
//! 进程内传输见 `courier-bus`。
//!
pub mod aggregator;
pub mod broker;
pub mod config;
pub mod dead_letter;
pub mod delivery;
pub mod error;
pub mod factory;
pub mod handler;
pub mod message;
pub mod registry;

pub use broker::{DefaultMessageBroker, MessageBroker};
pub use config::BusConfig;
pub use dead_letter::{DeadLetterQueue, DeadLetterQueues};
pub use delivery::{DeliveryOutcome, DeliveryTracker};
pub use error::{BusError, BusResult};
pub use registry::HandlerRegistry;
