use async_trait::async_trait;
use courier_bus::{Bus, InMemoryBus};
use courier_core::factory::ContainerHandlerFactory;
use courier_core::handler::{CompetingEventHandler, MulticastEventHandler};
use courier_core::message::{BusEvent, BusMessage, MessageContext, MessageKind};
use courier_core::{BusConfig, HandlerRegistry};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: u64,
}

impl BusMessage for OrderPlaced {
    const NAME: &'static str = "OrderPlaced";
}
impl BusEvent for OrderPlaced {}

#[derive(Clone, Default)]
struct Journal {
    entries: Arc<Mutex<Vec<(&'static str, Option<String>)>>>,
}

impl Journal {
    fn record(&self, who: &'static str, ctx: &MessageContext) {
        self.entries
            .lock()
            .unwrap()
            .push((who, ctx.correlation_id.clone()));
    }

    fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.entries.lock().unwrap().iter().map(|e| e.0).collect();
        names.sort();
        names
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

struct SendReceipt(Journal);

#[async_trait]
impl MulticastEventHandler<OrderPlaced> for SendReceipt {
    async fn handle(&self, ctx: &MessageContext, _event: OrderPlaced) -> anyhow::Result<()> {
        self.0.record("receipt", ctx);
        Ok(())
    }
}

struct UpdateReport(Journal);

#[async_trait]
impl MulticastEventHandler<OrderPlaced> for UpdateReport {
    async fn handle(&self, ctx: &MessageContext, _event: OrderPlaced) -> anyhow::Result<()> {
        self.0.record("report", ctx);
        Ok(())
    }
}

struct ReserveStock(Journal);

#[async_trait]
impl CompetingEventHandler<OrderPlaced> for ReserveStock {
    async fn handle(&self, ctx: &MessageContext, _event: OrderPlaced) -> anyhow::Result<()> {
        self.0.record("stock", ctx);
        Ok(())
    }
}

struct NotifyWarehouse {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl MulticastEventHandler<OrderPlaced> for NotifyWarehouse {
    async fn handle(&self, _ctx: &MessageContext, _event: OrderPlaced) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("warehouse gateway refused connection")
    }
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publish_reaches_multicast_and_competing_handlers() {
    let journal = Journal::default();
    let factory = ContainerHandlerFactory::new();
    let j = journal.clone();
    factory.provide::<SendReceipt, _>(move || SendReceipt(j.clone()));
    let j = journal.clone();
    factory.provide::<UpdateReport, _>(move || UpdateReport(j.clone()));
    let j = journal.clone();
    factory.provide::<ReserveStock, _>(move || ReserveStock(j.clone()));

    let mut registry = HandlerRegistry::new();
    registry
        .register_multicast_event_type::<OrderPlaced, SendReceipt>()
        .unwrap();
    registry
        .register_multicast_event_type::<OrderPlaced, UpdateReport>()
        .unwrap();
    registry
        .register_competing_event_type::<OrderPlaced, ReserveStock>()
        .unwrap();

    let bus = InMemoryBus::from_registry_and_factory(
        BusConfig::default(),
        registry,
        Arc::new(factory),
    )
    .unwrap();
    let handle = bus.start().unwrap();

    bus.publish(OrderPlaced { order_id: 9 }).await.unwrap();
    wait_until(|| journal.len() >= 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(journal.names(), vec!["receipt", "report", "stock"]);

    // 两份投递共享同一个关联标识
    let entries = journal.entries.lock().unwrap().clone();
    let correlation = entries[0].1.clone();
    assert!(correlation.is_some());
    assert!(entries.iter().all(|(_, c)| *c == correlation));

    handle.shutdown();
    handle.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_subscriber_dead_letters_the_event() {
    let journal = Journal::default();
    let calls = Arc::new(AtomicU32::new(0));
    let factory = ContainerHandlerFactory::new();
    let j = journal.clone();
    factory.provide::<SendReceipt, _>(move || SendReceipt(j.clone()));
    let c = calls.clone();
    factory.provide::<NotifyWarehouse, _>(move || NotifyWarehouse { calls: c.clone() });

    let mut registry = HandlerRegistry::new();
    registry
        .register_multicast_event_type::<OrderPlaced, SendReceipt>()
        .unwrap();
    registry
        .register_multicast_event_type::<OrderPlaced, NotifyWarehouse>()
        .unwrap();

    let config = BusConfig::builder().max_delivery_attempts(3).build();
    let bus = InMemoryBus::from_registry_and_factory(config, registry, Arc::new(factory)).unwrap();
    let handle = bus.start().unwrap();

    bus.publish(OrderPlaced { order_id: 11 }).await.unwrap();

    let dead_letters = bus.dead_letter_queues().event_queue();
    let entry = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(entry) = dead_letters.pop_entry(OrderPlaced::NAME).await.unwrap() {
                return entry;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("event should be dead-lettered");

    assert_eq!(entry.kind(), MessageKind::Event);
    assert_eq!(entry.attempts(), 3);
    assert_eq!(entry.decode::<OrderPlaced>().unwrap(), OrderPlaced { order_id: 11 });
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // 同一次投递内其他订阅者不受影响
    assert_eq!(journal.len(), 3);

    // 命令与请求的死信队列保持为空
    assert!(bus
        .dead_letter_queues()
        .command_queue()
        .pop_entry(OrderPlaced::NAME)
        .await
        .unwrap()
        .is_none());
    assert!(dead_letters.pop::<OrderPlaced>().await.unwrap().is_none());

    handle.shutdown();
    handle.join().await;
}
