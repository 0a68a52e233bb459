//! 消息调度器（Message Broker）
//!
//! 根据注册表找到处理器类型，经由工厂生成实例并调用：
//! - 命令、请求：单处理器，按注册顺序取第一个；
//! - 广播请求：所有请求处理器并发执行，由 [`return_opportunistically`] 在截止时间内聚合；
//! - 广播事件、竞争事件：进程内所有本地处理器各自独立执行，单个失败不影响其他处理器。
//!
//! 调度器不吞掉处理器错误：执行失败以 [`BusError::Handler`] /
//! [`BusError::HandlerFailures`] 返回，由调度边界（投递计数）解释；
//! 找不到处理器或无法构造实例属于配置错误，立即返回且不应重试。
//!
use crate::aggregator::return_opportunistically;
use crate::config::BusConfig;
use crate::error::{BusError, BusResult, HandlerFailure};
use crate::factory::{DefaultHandlerFactory, HandlerFactory};
use crate::handler::{
    CommandHandler, CompetingEventHandler, MulticastEventHandler, RequestHandler,
};
use crate::message::{BusCommand, BusEvent, BusMessage, BusRequest, MessageContext};
use crate::registry::{HandlerRegistry, HandlerRole, HandlerType};
use async_trait::async_trait;
use bon::Builder;
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use std::any::{Any, TypeId};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait CommandBroker: Send + Sync {
    async fn dispatch_command<C>(&self, ctx: &MessageContext, cmd: C) -> BusResult<()>
    where
        C: BusCommand;
}

#[async_trait]
pub trait RequestBroker: Send + Sync {
    async fn handle_request<R>(&self, ctx: &MessageContext, req: R) -> BusResult<R::Response>
    where
        R: BusRequest;
}

#[async_trait]
pub trait MulticastRequestBroker: Send + Sync {
    /// 返回截止时间前完成的响应（按完成顺序）
    async fn handle_multicast_request<R>(
        &self,
        ctx: &MessageContext,
        req: R,
        timeout: Duration,
    ) -> BusResult<Vec<R::Response>>
    where
        R: BusRequest;
}

#[async_trait]
pub trait MulticastEventBroker: Send + Sync {
    async fn publish_multicast_event<E>(&self, ctx: &MessageContext, event: E) -> BusResult<()>
    where
        E: BusEvent;
}

#[async_trait]
pub trait CompetingEventBroker: Send + Sync {
    async fn publish_competing_event<E>(&self, ctx: &MessageContext, event: E) -> BusResult<()>
    where
        E: BusEvent;
}

/// 四种调度模式的合集，总线门面以此为依赖
pub trait MessageBroker:
    CommandBroker
    + RequestBroker
    + MulticastRequestBroker
    + MulticastEventBroker
    + CompetingEventBroker
    + 'static
{
}

impl<T> MessageBroker for T where
    T: CommandBroker
        + RequestBroker
        + MulticastRequestBroker
        + MulticastEventBroker
        + CompetingEventBroker
        + 'static
{
}

/// 基于注册表与工厂的默认调度器
#[derive(Builder)]
pub struct DefaultMessageBroker {
    #[builder(into)]
    registry: Arc<HandlerRegistry>,
    #[builder(default = Arc::new(DefaultHandlerFactory) as Arc<dyn HandlerFactory>)]
    factory: Arc<dyn HandlerFactory>,
    /// 单个事件广播给多个处理器时的并发上限
    #[builder(default = BusConfig::default().handler_concurrency)]
    handler_concurrency: usize,
}

impl DefaultMessageBroker {
    /// 使用默认工厂（仅支持无参构造）
    pub fn new(registry: impl Into<Arc<HandlerRegistry>>) -> Self {
        Self::builder().registry(registry).build()
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    fn instantiate<T>(&self, handler_type: &HandlerType) -> BusResult<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let instance = self
            .factory
            .create(handler_type)
            .and_then(|instance| handler_type.bind::<T>(instance));

        if let Err(err) = &instance {
            tracing::error!(
                message_type = handler_type.message(),
                handler = handler_type.name(),
                error = %err,
                "无法构造处理器实例"
            );
        }

        instance
    }

    fn single<M, T>(&self, role: HandlerRole) -> BusResult<(&'static str, Arc<T>)>
    where
        M: BusMessage,
        T: ?Sized + Send + Sync + 'static,
    {
        let handler_type = self
            .registry
            .single(role, TypeId::of::<M>())
            .ok_or(BusError::HandlerNotFound { message: M::NAME })?;

        Ok((handler_type.name(), self.instantiate::<T>(handler_type)?))
    }

    // 先全部构造再调用，配置缺陷在产生任何副作用之前暴露
    fn all<M, T>(&self, role: HandlerRole) -> BusResult<Vec<(&'static str, Arc<T>)>>
    where
        M: BusMessage,
        T: ?Sized + Send + Sync + 'static,
    {
        self.registry
            .all(role, TypeId::of::<M>())
            .iter()
            .map(|handler_type| {
                self.instantiate::<T>(handler_type)
                    .map(|handler| (handler_type.name(), handler))
            })
            .collect()
    }

    // 最多同时运行 `handler_concurrency` 个调用，其余排队
    async fn run_isolated(
        &self,
        message: &'static str,
        invocations: Vec<Invocation<'_>>,
    ) -> BusResult<()> {
        let limit = self.handler_concurrency.max(1);
        let mut queued = invocations.into_iter();
        let mut running: FuturesUnordered<BoxFuture<'_, Option<HandlerFailure>>> =
            FuturesUnordered::new();
        let mut failures = Vec::new();

        loop {
            while running.len() < limit {
                let Some((handler, invocation)) = queued.next() else {
                    break;
                };
                running.push(isolate(message, handler, invocation).boxed());
            }

            match running.next().await {
                Some(Some(failure)) => failures.push(failure),
                Some(None) => {}
                None => break,
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BusError::HandlerFailures { message, failures })
        }
    }
}

#[async_trait]
impl CommandBroker for DefaultMessageBroker {
    async fn dispatch_command<C>(&self, ctx: &MessageContext, cmd: C) -> BusResult<()>
    where
        C: BusCommand,
    {
        let (name, handler) = self.single::<C, dyn CommandHandler<C>>(HandlerRole::Command)?;
        tracing::debug!(
            message_type = C::NAME,
            message_id = %ctx.message_id,
            handler = name,
            "分发命令"
        );

        invoke(name, handler.handle(ctx, cmd)).await
    }
}

#[async_trait]
impl RequestBroker for DefaultMessageBroker {
    async fn handle_request<R>(&self, ctx: &MessageContext, req: R) -> BusResult<R::Response>
    where
        R: BusRequest,
    {
        let (name, handler) = self.single::<R, dyn RequestHandler<R>>(HandlerRole::Request)?;
        tracing::debug!(
            message_type = R::NAME,
            message_id = %ctx.message_id,
            handler = name,
            "处理请求"
        );

        invoke(name, handler.handle(ctx, req)).await
    }
}

#[async_trait]
impl MulticastRequestBroker for DefaultMessageBroker {
    async fn handle_multicast_request<R>(
        &self,
        ctx: &MessageContext,
        req: R,
        timeout: Duration,
    ) -> BusResult<Vec<R::Response>>
    where
        R: BusRequest,
    {
        let handlers = self.all::<R, dyn RequestHandler<R>>(HandlerRole::Request)?;
        let expected = handlers.len();

        let invocations = handlers.into_iter().map(|(name, handler)| {
            let ctx = ctx.clone();
            let req = req.clone();
            async move {
                invoke(name, handler.handle(&ctx, req))
                    .await
                    .map_err(anyhow::Error::from)
            }
        });
        let responses = return_opportunistically(invocations, timeout).await;

        tracing::debug!(
            message_type = R::NAME,
            message_id = %ctx.message_id,
            expected,
            received = responses.len(),
            "广播请求完成"
        );

        Ok(responses)
    }
}

#[async_trait]
impl MulticastEventBroker for DefaultMessageBroker {
    async fn publish_multicast_event<E>(&self, ctx: &MessageContext, event: E) -> BusResult<()>
    where
        E: BusEvent,
    {
        let handlers =
            self.all::<E, dyn MulticastEventHandler<E>>(HandlerRole::MulticastEvent)?;
        tracing::debug!(
            message_type = E::NAME,
            message_id = %ctx.message_id,
            handlers = handlers.len(),
            "广播事件"
        );

        let invocations = handlers
            .into_iter()
            .map(|(name, handler)| {
                let event = event.clone();
                let invocation = async move { handler.handle(ctx, event).await }.boxed();
                (name, invocation)
            })
            .collect::<Vec<Invocation<'_>>>();

        self.run_isolated(E::NAME, invocations).await
    }
}

#[async_trait]
impl CompetingEventBroker for DefaultMessageBroker {
    async fn publish_competing_event<E>(&self, ctx: &MessageContext, event: E) -> BusResult<()>
    where
        E: BusEvent,
    {
        let handlers =
            self.all::<E, dyn CompetingEventHandler<E>>(HandlerRole::CompetingEvent)?;
        tracing::debug!(
            message_type = E::NAME,
            message_id = %ctx.message_id,
            handlers = handlers.len(),
            "投递竞争事件"
        );

        let invocations = handlers
            .into_iter()
            .map(|(name, handler)| {
                let event = event.clone();
                let invocation = async move { handler.handle(ctx, event).await }.boxed();
                (name, invocation)
            })
            .collect::<Vec<Invocation<'_>>>();

        self.run_isolated(E::NAME, invocations).await
    }
}

/// 单个事件处理器调用：处理器名称与已装箱的执行 future
type Invocation<'a> = (&'static str, BoxFuture<'a, anyhow::Result<()>>);

async fn isolate(
    message: &'static str,
    handler: &'static str,
    invocation: BoxFuture<'_, anyhow::Result<()>>,
) -> Option<HandlerFailure> {
    let err = invoke(handler, invocation).await.err()?;
    tracing::warn!(
        message_type = message,
        handler,
        error = %err,
        "事件处理器执行失败"
    );
    Some(HandlerFailure {
        handler,
        reason: failure_reason(err),
    })
}

/// 调用处理器，将失败与 panic 统一转换为 `BusError::Handler`
async fn invoke<T, Fut>(handler: &'static str, invocation: Fut) -> BusResult<T>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    match AssertUnwindSafe(invocation).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(BusError::Handler { handler, source }),
        Err(panic) => Err(BusError::Handler {
            handler,
            source: anyhow::anyhow!("handler panicked: {}", panic_message(panic.as_ref())),
        }),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn failure_reason(err: BusError) -> String {
    match err {
        BusError::Handler { source, .. } => format!("{source:#}"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::ContainerHandlerFactory;
    use serde::{Deserialize, Serialize};
    use std::future::pending;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    // ---- 消息契约 ----

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct ChargeCard {
        amount: u64,
    }
    impl BusMessage for ChargeCard {
        const NAME: &'static str = "ChargeCard";
    }
    impl BusCommand for ChargeCard {}

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Unrouted;
    impl BusMessage for Unrouted {
        const NAME: &'static str = "Unrouted";
    }
    impl BusCommand for Unrouted {}

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct BlackBallRequest {
        candidate: String,
    }
    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct BlackBallResponse {
        voter: String,
        approved: bool,
    }
    impl BusMessage for BlackBallRequest {
        const NAME: &'static str = "BlackBallRequest";
    }
    impl BusRequest for BlackBallRequest {
        type Response = BlackBallResponse;
    }
    impl crate::message::BusResponse for BlackBallResponse {}

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct MemberJoined;
    impl BusMessage for MemberJoined {
        const NAME: &'static str = "MemberJoined";
    }
    impl BusEvent for MemberJoined {}

    // ---- 处理器 ----

    struct CountingCharge {
        calls: Arc<AtomicUsize>,
    }
    #[async_trait]
    impl CommandHandler<ChargeCard> for CountingCharge {
        async fn handle(&self, _ctx: &MessageContext, cmd: ChargeCard) -> anyhow::Result<()> {
            anyhow::ensure!(cmd.amount > 0, "amount must be positive");
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct PanickingCharge;
    #[async_trait]
    impl CommandHandler<ChargeCard> for PanickingCharge {
        async fn handle(&self, _ctx: &MessageContext, _cmd: ChargeCard) -> anyhow::Result<()> {
            panic!("card reader on fire")
        }
    }

    macro_rules! voter {
        ($name:ident, $approved:expr) => {
            #[derive(Default)]
            struct $name;
            #[async_trait]
            impl RequestHandler<BlackBallRequest> for $name {
                async fn handle(
                    &self,
                    _ctx: &MessageContext,
                    _req: BlackBallRequest,
                ) -> anyhow::Result<BlackBallResponse> {
                    Ok(BlackBallResponse {
                        voter: stringify!($name).into(),
                        approved: $approved,
                    })
                }
            }
        };
    }

    voter!(Fred, true);
    voter!(Barney, true);
    voter!(Wilma, false);

    #[derive(Default)]
    struct NeverAnswers;
    #[async_trait]
    impl RequestHandler<BlackBallRequest> for NeverAnswers {
        async fn handle(
            &self,
            _ctx: &MessageContext,
            _req: BlackBallRequest,
        ) -> anyhow::Result<BlackBallResponse> {
            pending().await
        }
    }

    #[derive(Default)]
    struct Abstains;
    #[async_trait]
    impl RequestHandler<BlackBallRequest> for Abstains {
        async fn handle(
            &self,
            _ctx: &MessageContext,
            req: BlackBallRequest,
        ) -> anyhow::Result<BlackBallResponse> {
            anyhow::bail!("refuses to vote on {}", req.candidate)
        }
    }

    struct Greeter {
        seen: Arc<AtomicUsize>,
    }
    #[async_trait]
    impl MulticastEventHandler<MemberJoined> for Greeter {
        async fn handle(&self, _ctx: &MessageContext, _event: MemberJoined) -> anyhow::Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
    #[async_trait]
    impl CompetingEventHandler<MemberJoined> for Greeter {
        async fn handle(&self, _ctx: &MessageContext, _event: MemberJoined) -> anyhow::Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct BrokenMailer;
    #[async_trait]
    impl MulticastEventHandler<MemberJoined> for BrokenMailer {
        async fn handle(&self, _ctx: &MessageContext, _event: MemberJoined) -> anyhow::Result<()> {
            anyhow::bail!("smtp unreachable")
        }
    }

    struct Auditor {
        seen: Arc<AtomicUsize>,
    }
    #[async_trait]
    impl CompetingEventHandler<MemberJoined> for Auditor {
        async fn handle(&self, _ctx: &MessageContext, _event: MemberJoined) -> anyhow::Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    // 记录同时运行的处理器数量
    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
        done: AtomicUsize,
    }
    impl Gauge {
        async fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.done.fetch_add(1, Ordering::SeqCst);
        }
    }

    macro_rules! gauged {
        ($name:ident) => {
            struct $name(Arc<Gauge>);
            #[async_trait]
            impl MulticastEventHandler<MemberJoined> for $name {
                async fn handle(
                    &self,
                    _ctx: &MessageContext,
                    _event: MemberJoined,
                ) -> anyhow::Result<()> {
                    self.0.enter().await;
                    Ok(())
                }
            }
        };
    }

    gauged!(Porter);
    gauged!(Steward);
    gauged!(Usher);

    fn gauged_broker(gauge: &Arc<Gauge>, concurrency: usize) -> DefaultMessageBroker {
        let mut registry = HandlerRegistry::new();
        registry
            .register_multicast_event_type::<MemberJoined, Porter>()
            .unwrap();
        registry
            .register_multicast_event_type::<MemberJoined, Steward>()
            .unwrap();
        registry
            .register_multicast_event_type::<MemberJoined, Usher>()
            .unwrap();

        let factory = ContainerHandlerFactory::new();
        let g = gauge.clone();
        factory.provide::<Porter, _>(move || Porter(g.clone()));
        let g = gauge.clone();
        factory.provide::<Steward, _>(move || Steward(g.clone()));
        let g = gauge.clone();
        factory.provide::<Usher, _>(move || Usher(g.clone()));

        DefaultMessageBroker::builder()
            .registry(registry)
            .factory(Arc::new(factory))
            .handler_concurrency(concurrency)
            .build()
    }

    fn charge_broker(calls: Arc<AtomicUsize>) -> DefaultMessageBroker {
        let mut registry = HandlerRegistry::new();
        registry
            .register_command_type::<ChargeCard, CountingCharge>()
            .unwrap();

        let factory = ContainerHandlerFactory::new();
        factory.provide::<CountingCharge, _>(move || CountingCharge {
            calls: calls.clone(),
        });

        DefaultMessageBroker::builder()
            .registry(registry)
            .factory(Arc::new(factory))
            .build()
    }

    fn voters(handlers: &[fn(&mut HandlerRegistry)]) -> DefaultMessageBroker {
        let mut registry = HandlerRegistry::new();
        for register in handlers {
            register(&mut registry);
        }
        DefaultMessageBroker::new(registry)
    }

    fn fred(r: &mut HandlerRegistry) {
        r.register_request::<BlackBallRequest, Fred>().unwrap();
    }
    fn barney(r: &mut HandlerRegistry) {
        r.register_request::<BlackBallRequest, Barney>().unwrap();
    }
    fn wilma(r: &mut HandlerRegistry) {
        r.register_request::<BlackBallRequest, Wilma>().unwrap();
    }
    fn never(r: &mut HandlerRegistry) {
        r.register_request::<BlackBallRequest, NeverAnswers>().unwrap();
    }
    fn abstains(r: &mut HandlerRegistry) {
        r.register_request::<BlackBallRequest, Abstains>().unwrap();
    }

    fn fred_flintstone() -> BlackBallRequest {
        BlackBallRequest {
            candidate: "Fred Flintstone".into(),
        }
    }

    // ---- 命令 ----

    #[tokio::test]
    async fn command_is_handled_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let broker = charge_broker(calls.clone());

        broker
            .dispatch_command(&MessageContext::default(), ChargeCard { amount: 10 })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn command_handler_failure_is_propagated() {
        let broker = charge_broker(Arc::new(AtomicUsize::new(0)));

        let err = broker
            .dispatch_command(&MessageContext::default(), ChargeCard { amount: 0 })
            .await
            .unwrap_err();
        match err {
            BusError::Handler { handler, source } => {
                assert!(handler.contains("CountingCharge"));
                assert!(source.to_string().contains("amount must be positive"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unregistered_command_is_configuration_error() {
        let broker = DefaultMessageBroker::new(HandlerRegistry::new());
        let err = broker
            .dispatch_command(&MessageContext::default(), Unrouted)
            .await
            .unwrap_err();

        assert!(matches!(err, BusError::HandlerNotFound { message: "Unrouted" }));
        assert!(err.is_configuration_error());
    }

    #[tokio::test]
    async fn handler_without_no_argument_constructor_is_configuration_error() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_command_type::<ChargeCard, CountingCharge>()
            .unwrap();
        // 默认工厂只会使用无参构造器
        let broker = DefaultMessageBroker::new(registry);

        let err = broker
            .dispatch_command(&MessageContext::default(), ChargeCard { amount: 1 })
            .await
            .unwrap_err();

        assert!(matches!(err, BusError::Construction { .. }));
        assert!(err.is_configuration_error());
        assert!(!err.is_handler_failure());
    }

    #[tokio::test]
    async fn panicking_handler_becomes_handler_failure() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_command::<ChargeCard, PanickingCharge>()
            .unwrap();
        let broker = DefaultMessageBroker::new(registry);

        let err = broker
            .dispatch_command(&MessageContext::default(), ChargeCard { amount: 1 })
            .await
            .unwrap_err();
        assert!(err.is_handler_failure());
        assert!(err.to_string().contains("card reader on fire"));
    }

    // ---- 请求 ----

    #[tokio::test]
    async fn request_uses_first_registered_handler() {
        let broker = voters(&[wilma, fred]);

        let response = broker
            .handle_request(&MessageContext::default(), fred_flintstone())
            .await
            .unwrap();
        assert_eq!(
            response,
            BlackBallResponse {
                voter: "Wilma".into(),
                approved: false,
            }
        );
    }

    #[tokio::test]
    async fn request_failure_is_propagated() {
        let broker = voters(&[abstains]);
        let err = broker
            .handle_request(&MessageContext::default(), fred_flintstone())
            .await
            .unwrap_err();
        assert!(err.is_handler_failure());
    }

    // ---- 广播请求 ----

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn multicast_request_gathers_every_response() {
        let broker = voters(&[fred, barney, wilma]);

        let responses = broker
            .handle_multicast_request(
                &MessageContext::default(),
                fred_flintstone(),
                Duration::from_secs(6),
            )
            .await
            .unwrap();

        assert_eq!(responses.len(), 3);
        let mut voters: Vec<_> = responses.into_iter().map(|r| r.voter).collect();
        voters.sort();
        assert_eq!(voters, vec!["Barney", "Fred", "Wilma"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn multicast_request_returns_partial_results_at_deadline() {
        let broker = voters(&[fred, never, barney, abstains]);
        let started = Instant::now();

        let responses = broker
            .handle_multicast_request(
                &MessageContext::default(),
                fred_flintstone(),
                Duration::from_millis(300),
            )
            .await
            .unwrap();

        let elapsed = started.elapsed();
        assert_eq!(responses.len(), 2);
        assert!(elapsed < Duration::from_secs(2), "returned too late: {elapsed:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn multicast_request_without_handlers_returns_immediately() {
        let broker = voters(&[]);
        let started = Instant::now();

        let responses = broker
            .handle_multicast_request(
                &MessageContext::default(),
                fred_flintstone(),
                Duration::from_secs(30),
            )
            .await
            .unwrap();

        assert!(responses.is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    // ---- 事件 ----

    #[tokio::test]
    async fn multicast_event_without_handlers_completes() {
        let broker = DefaultMessageBroker::new(HandlerRegistry::new());
        let started = Instant::now();

        broker
            .publish_multicast_event(&MessageContext::default(), MemberJoined)
            .await
            .unwrap();
        broker
            .publish_competing_event(&MessageContext::default(), MemberJoined)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn multicast_event_failures_are_isolated() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry
            .register_multicast_event::<MemberJoined, BrokenMailer>()
            .unwrap();
        registry
            .register_multicast_event_type::<MemberJoined, Greeter>()
            .unwrap();

        let factory = ContainerHandlerFactory::new();
        let counter = seen.clone();
        factory.provide::<Greeter, _>(move || Greeter {
            seen: counter.clone(),
        });
        let broker = DefaultMessageBroker::builder()
            .registry(registry)
            .factory(Arc::new(factory))
            .handler_concurrency(1)
            .build();

        let err = broker
            .publish_multicast_event(&MessageContext::default(), MemberJoined)
            .await
            .unwrap_err();

        // 失败的处理器不影响其他处理器
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        match err {
            BusError::HandlerFailures { message, failures } => {
                assert_eq!(message, "MemberJoined");
                assert_eq!(failures.len(), 1);
                assert!(failures[0].handler.contains("BrokenMailer"));
                assert!(failures[0].reason.contains("smtp unreachable"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn competing_event_invokes_every_local_handler() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry
            .register_competing_event_type::<MemberJoined, Greeter>()
            .unwrap();
        registry
            .register_competing_event_type::<MemberJoined, Auditor>()
            .unwrap();

        let factory = ContainerHandlerFactory::new();
        let counter = seen.clone();
        factory.provide::<Greeter, _>(move || Greeter {
            seen: counter.clone(),
        });
        let counter = seen.clone();
        factory.provide::<Auditor, _>(move || Auditor {
            seen: counter.clone(),
        });
        let broker = DefaultMessageBroker::builder()
            .registry(registry)
            .factory(Arc::new(factory))
            .build();

        broker
            .publish_competing_event(&MessageContext::default(), MemberJoined)
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        // 竞争订阅不会触发广播订阅
        broker
            .publish_multicast_event(&MessageContext::default(), MemberJoined)
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn construction_failure_happens_before_any_event_handler_runs() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry
            .register_competing_event_type::<MemberJoined, Greeter>()
            .unwrap();
        registry
            .register_competing_event_type::<MemberJoined, Auditor>()
            .unwrap();

        // 只为 Greeter 提供构造闭包，Auditor 无法构造
        let factory = ContainerHandlerFactory::new();
        let counter = seen.clone();
        factory.provide::<Greeter, _>(move || Greeter {
            seen: counter.clone(),
        });
        let broker = DefaultMessageBroker::builder()
            .registry(registry)
            .factory(Arc::new(factory))
            .build();

        let err = broker
            .publish_competing_event(&MessageContext::default(), MemberJoined)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Construction { .. }));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn event_fan_out_respects_handler_concurrency() {
        let gauge = Arc::new(Gauge::default());
        gauged_broker(&gauge, 2)
            .publish_multicast_event(&MessageContext::default(), MemberJoined)
            .await
            .unwrap();

        assert_eq!(gauge.done.load(Ordering::SeqCst), 3);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn event_fan_out_runs_handlers_concurrently() {
        let gauge = Arc::new(Gauge::default());
        gauged_broker(&gauge, 8)
            .publish_multicast_event(&MessageContext::default(), MemberJoined)
            .await
            .unwrap();

        assert_eq!(gauge.done.load(Ordering::SeqCst), 3);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 3);
    }
}
