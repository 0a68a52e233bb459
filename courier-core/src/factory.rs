//! 处理器工厂（HandlerFactory）
//!
//! 根据注册表中的 [`HandlerType`] 生成处理器实例。调度器并不关心实例如何产生：
//! - [`DefaultHandlerFactory`]：只使用无参构造器；
//! - [`ContainerHandlerFactory`]：按处理器类型登记构造闭包，用于注入依赖，
//!   未登记时回退到无参构造器。
//!
//! 无论哪种实现，构造失败都必须返回 [`BusError::Construction`]，该错误是致命的、不重试。
//!
use crate::error::{BusError, BusResult};
use crate::registry::{ErasedHandler, HandlerType};
use dashmap::DashMap;
use std::any::TypeId;
use std::sync::Arc;

pub trait HandlerFactory: Send + Sync {
    /// 生成处理器的具体实例（类型擦除）
    fn create(&self, handler_type: &HandlerType) -> BusResult<ErasedHandler>;
}

/// 默认工厂：仅支持无参构造的处理器
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultHandlerFactory;

impl HandlerFactory for DefaultHandlerFactory {
    fn create(&self, handler_type: &HandlerType) -> BusResult<ErasedHandler> {
        handler_type.activate().ok_or_else(|| BusError::Construction {
            handler: handler_type.name(),
            reason: "handler type has no no-argument constructor".into(),
        })
    }
}

type Provider = Arc<dyn Fn() -> anyhow::Result<ErasedHandler> + Send + Sync>;

/// 容器式工厂：为需要依赖的处理器登记构造闭包
///
/// ```rust
/// use courier_core::factory::ContainerHandlerFactory;
/// use std::sync::Arc;
///
/// struct Mailer { smtp: Arc<String> }
///
/// let smtp = Arc::new("smtp://localhost".to_string());
/// let factory = ContainerHandlerFactory::new();
/// factory.provide::<Mailer, _>(move || Mailer { smtp: smtp.clone() });
/// assert!(factory.provides::<Mailer>());
/// ```
#[derive(Clone, Default)]
pub struct ContainerHandlerFactory {
    providers: DashMap<TypeId, Provider>,
}

impl ContainerHandlerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记处理器 `H` 的构造闭包（覆盖已有登记）
    pub fn provide<H, F>(&self, provider: F)
    where
        H: Send + Sync + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.try_provide::<H, _>(move || Ok(provider()));
    }

    /// 登记可能失败的构造闭包，失败时转换为 `BusError::Construction`
    pub fn try_provide<H, F>(&self, provider: F)
    where
        H: Send + Sync + 'static,
        F: Fn() -> anyhow::Result<H> + Send + Sync + 'static,
    {
        let f: Provider = Arc::new(move || provider().map(|h| Box::new(h) as ErasedHandler));
        self.providers.insert(TypeId::of::<H>(), f);
    }

    pub fn provides<H: 'static>(&self) -> bool {
        self.providers.contains_key(&TypeId::of::<H>())
    }
}

impl HandlerFactory for ContainerHandlerFactory {
    fn create(&self, handler_type: &HandlerType) -> BusResult<ErasedHandler> {
        let provider = self
            .providers
            .get(&handler_type.type_id())
            .map(|p| p.clone());

        match provider {
            Some(provider) => provider().map_err(|e| BusError::Construction {
                handler: handler_type.name(),
                reason: e.to_string(),
            }),
            None => DefaultHandlerFactory.create(handler_type),
        }
    }
}
