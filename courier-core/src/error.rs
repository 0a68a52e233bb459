//! 消息总线统一错误定义
//!
//! 按照处理策略将错误分为三类：
//! - 配置错误（处理器未注册、无法构造、重复注册等）：致命，立即返回给调用方，
//!   不重试，也不计入投递次数；
//! - 处理器执行失败：计入投递次数，由传输层重投，直至成功或进入死信；
//! - 传输错误：序列化失败、通道关闭、请求超时、请求已转入死信等。
//!
use std::time::Duration;
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BusError {
    // --- 配置错误 ---
    #[error("handler not found: message={message}")]
    HandlerNotFound { message: &'static str },

    #[error(
        "handler construction failed: handler={handler}, reason={reason}; \
         only handlers with a no-argument constructor can be activated by default, \
         register a provider on a handler factory to wire dependencies"
    )]
    Construction {
        handler: &'static str,
        reason: String,
    },

    #[error("handler already registered: message={message}, handler={handler}")]
    AlreadyRegistered {
        message: &'static str,
        handler: &'static str,
    },

    #[error("type mismatch: expected={expected}, found={found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid config: {reason}")]
    InvalidConfig { reason: String },

    // --- 处理器执行失败 ---
    #[error("handler failed: handler={handler}, reason={source}")]
    Handler {
        handler: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("{} of the handlers for {message} failed", failures.len())]
    HandlerFailures {
        message: &'static str,
        failures: Vec<HandlerFailure>,
    },

    // --- 传输 ---
    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("transport error: {reason}")]
    Transport { reason: String },

    #[error("message dead-lettered: message={message}, attempts={attempts}")]
    DeadLettered { message: &'static str, attempts: u32 },

    #[error("request timed out: message={message}, timeout={timeout:?}")]
    RequestTimeout {
        message: &'static str,
        timeout: Duration,
    },
}

/// 广播处理中单个处理器的失败记录
#[derive(Debug)]
pub struct HandlerFailure {
    pub handler: &'static str,
    pub reason: String,
}

impl BusError {
    pub fn transport(reason: impl Into<String>) -> Self {
        BusError::Transport {
            reason: reason.into(),
        }
    }

    /// 是否为配置错误：此类错误表示部署/注册缺陷而非消息本身的问题，
    /// 不计入投递次数，也不会触发重投。
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            BusError::HandlerNotFound { .. }
                | BusError::Construction { .. }
                | BusError::AlreadyRegistered { .. }
                | BusError::TypeMismatch { .. }
                | BusError::InvalidConfig { .. }
        )
    }

    /// 是否为处理器执行失败（计入投递次数）
    pub fn is_handler_failure(&self) -> bool {
        matches!(
            self,
            BusError::Handler { .. } | BusError::HandlerFailures { .. }
        )
    }
}

/// 统一 Result 类型别名
pub type BusResult<T> = Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_configuration_errors() {
        let err = BusError::Construction {
            handler: "NeedsDependency",
            reason: "no activator".into(),
        };
        assert!(err.is_configuration_error());
        assert!(!err.is_handler_failure());

        let err = BusError::HandlerNotFound { message: "Ping" };
        assert!(err.is_configuration_error());
    }

    #[test]
    fn classifies_handler_failures() {
        let err = BusError::Handler {
            handler: "Flaky",
            source: anyhow::anyhow!("boom"),
        };
        assert!(err.is_handler_failure());
        assert!(!err.is_configuration_error());
        assert!(err.to_string().contains("boom"));

        let err = BusError::HandlerFailures {
            message: "OrderPlaced",
            failures: vec![HandlerFailure {
                handler: "Mailer",
                reason: "smtp down".into(),
            }],
        };
        assert!(err.is_handler_failure());
        assert_eq!(err.to_string(), "1 of the handlers for OrderPlaced failed");
    }

    #[test]
    fn dead_lettered_is_neither_configuration_nor_handler_failure() {
        let err = BusError::DeadLettered {
            message: "QuotePrice",
            attempts: 3,
        };
        assert!(!err.is_configuration_error());
        assert!(!err.is_handler_failure());
        assert_eq!(
            err.to_string(),
            "message dead-lettered: message=QuotePrice, attempts=3"
        );
    }
}
