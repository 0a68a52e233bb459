//! 总线配置
//!
use crate::error::{BusError, BusResult};
use bon::Builder;
use serde::Deserialize;
use std::time::Duration;

/// 总线配置
///
/// 既可以通过 `BusConfig::builder()` 在代码中构造，也可以从任意 serde 数据源反序列化，
/// 缺省字段取 [`Default`] 中的值。
#[derive(Clone, Copy, Debug, Builder, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// 单条消息的最大投递次数，达到后进入死信
    #[builder(default = 5)]
    pub max_delivery_attempts: u32,
    /// 单条事件广播给多个处理器时的并发上限
    #[builder(default = 8)]
    pub handler_concurrency: usize,
    /// `request` 未显式指定超时时使用的超时
    #[builder(default = Duration::from_secs(30))]
    pub default_request_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_delivery_attempts: 5,
            handler_concurrency: 8,
            default_request_timeout: Duration::from_secs(30),
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> BusResult<()> {
        if self.max_delivery_attempts == 0 {
            return Err(BusError::InvalidConfig {
                reason: "max_delivery_attempts must be at least 1".into(),
            });
        }
        if self.handler_concurrency == 0 {
            return Err(BusError::InvalidConfig {
                reason: "handler_concurrency must be at least 1".into(),
            });
        }
        if self.default_request_timeout.is_zero() {
            return Err(BusError::InvalidConfig {
                reason: "default_request_timeout must be greater than zero".into(),
            });
        }
        Ok(())
    }
}
