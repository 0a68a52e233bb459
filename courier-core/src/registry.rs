//! 处理器注册表（HandlerRegistry）
//!
//! 启动时显式登记“消息类型 → 处理器类型”的映射，调度时只做一次 map 查找：
//! - 键为 `(HandlerRole, TypeId)`，同一键下的处理器按注册顺序保存；
//! - 单处理器调度（命令、请求）取注册顺序中的第一个；
//! - 命令只允许登记一个处理器，重复登记在启动期即报错；
//! - 同一处理器类型不能对同一消息、同一角色重复登记。
//!
//! 注册表只记录“类型”，实例由 [`HandlerFactory`](crate::factory::HandlerFactory) 在调度时生成。
//!
use crate::error::{BusError, BusResult};
use crate::handler::{
    CommandHandler, CompetingEventHandler, MulticastEventHandler, RequestHandler,
};
use crate::message::{BusCommand, BusEvent, BusMessage, BusRequest};
use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// 类型擦除后的处理器实例
pub type ErasedHandler = Box<dyn Any + Send + Sync>;

/// 无参构造器：仅当处理器实现了 `Default` 时存在
pub type Activator = Arc<dyn Fn() -> ErasedHandler + Send + Sync>;

// 将具体处理器实例转换为角色 trait 对象（仍以 Any 形式承载）
type Binder = Arc<dyn Fn(ErasedHandler) -> Option<ErasedHandler> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandlerRole {
    Command,
    Request,
    MulticastEvent,
    CompetingEvent,
}

impl HandlerRole {
    pub fn dispatch_mode(&self) -> DispatchMode {
        match self {
            HandlerRole::Command | HandlerRole::Request => DispatchMode::Single,
            HandlerRole::MulticastEvent => DispatchMode::Multicast,
            HandlerRole::CompetingEvent => DispatchMode::Competing,
        }
    }
}

/// 调度模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DispatchMode {
    /// 单处理器：命令与请求
    Single,
    /// 广播：所有注册的处理器都会被调用
    Multicast,
    /// 竞争：传输层只投递给一个消费进程，进程内仍调用所有本地注册的处理器
    Competing,
}

/// 处理器类型条目
#[derive(Clone)]
pub struct HandlerType {
    name: &'static str,
    type_id: TypeId,
    message: &'static str,
    role: HandlerRole,
    activator: Option<Activator>,
    binder: Binder,
}

impl HandlerType {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// 处理的消息类型名称
    pub fn message(&self) -> &'static str {
        self.message
    }

    pub fn role(&self) -> HandlerRole {
        self.role
    }

    pub fn dispatch_mode(&self) -> DispatchMode {
        self.role.dispatch_mode()
    }

    pub fn has_activator(&self) -> bool {
        self.activator.is_some()
    }

    /// 通过无参构造器生成实例；未登记构造器时返回 `None`
    pub fn activate(&self) -> Option<ErasedHandler> {
        self.activator.as_ref().map(|activate| activate())
    }

    /// 将工厂产出的具体实例转换为角色 trait 对象
    pub(crate) fn bind<T>(&self, instance: ErasedHandler) -> BusResult<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let bound = (self.binder)(instance).ok_or(BusError::TypeMismatch {
            expected: self.name,
            found: "instance produced by handler factory",
        })?;

        bound
            .downcast::<Arc<T>>()
            .map(|handler| *handler)
            .map_err(|_| BusError::TypeMismatch {
                expected: type_name::<T>(),
                found: self.name,
            })
    }
}

impl fmt::Debug for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerType")
            .field("name", &self.name)
            .field("message", &self.message)
            .field("role", &self.role)
            .field("has_activator", &self.activator.is_some())
            .finish()
    }
}

/// 处理器注册表
///
/// 启动时构建，之后以 `Arc<HandlerRegistry>` 只读共享。
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    entries: HashMap<(HandlerRole, TypeId), Vec<HandlerType>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册命令处理器（通过 `Default` 无参构造）
    pub fn register_command<C, H>(&mut self) -> BusResult<()>
    where
        C: BusCommand,
        H: CommandHandler<C> + Default + 'static,
    {
        self.insert::<C>(Self::entry::<C, H>(
            HandlerRole::Command,
            Some(Self::activator::<H>()),
            Self::binder::<H, dyn CommandHandler<C>>(|h| {
                Arc::new(h) as Arc<dyn CommandHandler<C>>
            }),
        ))
    }

    /// 注册命令处理器类型，但不提供无参构造器；实例须由工厂提供
    pub fn register_command_type<C, H>(&mut self) -> BusResult<()>
    where
        C: BusCommand,
        H: CommandHandler<C> + 'static,
    {
        self.insert::<C>(Self::entry::<C, H>(
            HandlerRole::Command,
            None,
            Self::binder::<H, dyn CommandHandler<C>>(|h| {
                Arc::new(h) as Arc<dyn CommandHandler<C>>
            }),
        ))
    }

    /// 注册请求处理器（通过 `Default` 无参构造）
    pub fn register_request<R, H>(&mut self) -> BusResult<()>
    where
        R: BusRequest,
        H: RequestHandler<R> + Default + 'static,
    {
        self.insert::<R>(Self::entry::<R, H>(
            HandlerRole::Request,
            Some(Self::activator::<H>()),
            Self::binder::<H, dyn RequestHandler<R>>(|h| {
                Arc::new(h) as Arc<dyn RequestHandler<R>>
            }),
        ))
    }

    pub fn register_request_type<R, H>(&mut self) -> BusResult<()>
    where
        R: BusRequest,
        H: RequestHandler<R> + 'static,
    {
        self.insert::<R>(Self::entry::<R, H>(
            HandlerRole::Request,
            None,
            Self::binder::<H, dyn RequestHandler<R>>(|h| {
                Arc::new(h) as Arc<dyn RequestHandler<R>>
            }),
        ))
    }

    /// 注册广播事件处理器（通过 `Default` 无参构造）
    pub fn register_multicast_event<E, H>(&mut self) -> BusResult<()>
    where
        E: BusEvent,
        H: MulticastEventHandler<E> + Default + 'static,
    {
        self.insert::<E>(Self::entry::<E, H>(
            HandlerRole::MulticastEvent,
            Some(Self::activator::<H>()),
            Self::binder::<H, dyn MulticastEventHandler<E>>(|h| {
                Arc::new(h) as Arc<dyn MulticastEventHandler<E>>
            }),
        ))
    }

    pub fn register_multicast_event_type<E, H>(&mut self) -> BusResult<()>
    where
        E: BusEvent,
        H: MulticastEventHandler<E> + 'static,
    {
        self.insert::<E>(Self::entry::<E, H>(
            HandlerRole::MulticastEvent,
            None,
            Self::binder::<H, dyn MulticastEventHandler<E>>(|h| {
                Arc::new(h) as Arc<dyn MulticastEventHandler<E>>
            }),
        ))
    }

    /// 注册竞争事件处理器（通过 `Default` 无参构造）
    pub fn register_competing_event<E, H>(&mut self) -> BusResult<()>
    where
        E: BusEvent,
        H: CompetingEventHandler<E> + Default + 'static,
    {
        self.insert::<E>(Self::entry::<E, H>(
            HandlerRole::CompetingEvent,
            Some(Self::activator::<H>()),
            Self::binder::<H, dyn CompetingEventHandler<E>>(|h| {
                Arc::new(h) as Arc<dyn CompetingEventHandler<E>>
            }),
        ))
    }

    pub fn register_competing_event_type<E, H>(&mut self) -> BusResult<()>
    where
        E: BusEvent,
        H: CompetingEventHandler<E> + 'static,
    {
        self.insert::<E>(Self::entry::<E, H>(
            HandlerRole::CompetingEvent,
            None,
            Self::binder::<H, dyn CompetingEventHandler<E>>(|h| {
                Arc::new(h) as Arc<dyn CompetingEventHandler<E>>
            }),
        ))
    }

    /// 单处理器查找：按注册顺序取第一个
    pub fn single(&self, role: HandlerRole, message_type: TypeId) -> Option<&HandlerType> {
        self.all(role, message_type).first()
    }

    /// 多处理器查找：按注册顺序返回全部
    pub fn all(&self, role: HandlerRole, message_type: TypeId) -> &[HandlerType] {
        self.entries
            .get(&(role, message_type))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// 已注册的处理器类型（只读视图）
    pub fn registered(&self) -> impl Iterator<Item = &HandlerType> {
        self.entries.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert<M: BusMessage>(&mut self, handler_type: HandlerType) -> BusResult<()> {
        let role = handler_type.role;
        let entries = self.entries.entry((role, TypeId::of::<M>())).or_default();

        let duplicate = entries.iter().any(|e| e.type_id == handler_type.type_id);
        if duplicate || (role == HandlerRole::Command && !entries.is_empty()) {
            return Err(BusError::AlreadyRegistered {
                message: M::NAME,
                handler: handler_type.name,
            });
        }

        tracing::debug!(
            message_type = M::NAME,
            handler = handler_type.name,
            ?role,
            "注册处理器"
        );
        entries.push(handler_type);

        Ok(())
    }

    fn entry<M, H>(role: HandlerRole, activator: Option<Activator>, binder: Binder) -> HandlerType
    where
        M: BusMessage,
        H: 'static,
    {
        HandlerType {
            name: type_name::<H>(),
            type_id: TypeId::of::<H>(),
            message: M::NAME,
            role,
            activator,
            binder,
        }
    }

    fn activator<H>() -> Activator
    where
        H: Default + Send + Sync + 'static,
    {
        Arc::new(|| Box::new(H::default()) as ErasedHandler)
    }

    fn binder<H, T>(to_trait_object: fn(H) -> Arc<T>) -> Binder
    where
        H: Send + Sync + 'static,
        T: ?Sized + Send + Sync + 'static,
    {
        Arc::new(move |instance: ErasedHandler| {
            instance
                .downcast::<H>()
                .ok()
                .map(|h| Box::new(to_trait_object(*h)) as ErasedHandler)
        })
    }
}
