//! 消息总线门面与进程内传输（courier-bus）
//!
pub mod bus;
mod envelope;
pub mod inmemory_bus;

pub use bus::Bus;
pub use inmemory_bus::{BusHandle, InMemoryBus};
