use async_trait::async_trait;
use courier_bus::{Bus, InMemoryBus};
use courier_core::handler::{CommandHandler, MulticastEventHandler, RequestHandler};
use courier_core::message::{
    BusCommand, BusEvent, BusMessage, BusRequest, BusResponse, MessageContext,
};
use courier_core::{BusConfig, HandlerRegistry};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RegisterUser {
    name: String,
}
impl BusMessage for RegisterUser {
    const NAME: &'static str = "RegisterUser";
}
impl BusCommand for RegisterUser {}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ChargeCard {
    cents: u64,
}
impl BusMessage for ChargeCard {
    const NAME: &'static str = "ChargeCard";
}
impl BusCommand for ChargeCard {}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct GetGreeting {
    name: String,
}
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Greeting(String);
impl BusMessage for GetGreeting {
    const NAME: &'static str = "GetGreeting";
}
impl BusRequest for GetGreeting {
    type Response = Greeting;
}
impl BusResponse for Greeting {}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct UserRegistered {
    name: String,
}
impl BusMessage for UserRegistered {
    const NAME: &'static str = "UserRegistered";
}
impl BusEvent for UserRegistered {}

#[derive(Default)]
struct RegisterUserHandler;

#[async_trait]
impl CommandHandler<RegisterUser> for RegisterUserHandler {
    async fn handle(&self, ctx: &MessageContext, cmd: RegisterUser) -> anyhow::Result<()> {
        println!("RegisterUser: name={} id={}", cmd.name, ctx.message_id);
        Ok(())
    }
}

// 支付网关始终不可用 -> 最终进入死信
#[derive(Default)]
struct ChargeCardHandler;

#[async_trait]
impl CommandHandler<ChargeCard> for ChargeCardHandler {
    async fn handle(&self, ctx: &MessageContext, _cmd: ChargeCard) -> anyhow::Result<()> {
        anyhow::bail!("payment gateway down (delivery {})", ctx.delivery_count)
    }
}

#[derive(Default)]
struct EnglishGreeter;

#[async_trait]
impl RequestHandler<GetGreeting> for EnglishGreeter {
    async fn handle(&self, _ctx: &MessageContext, req: GetGreeting) -> anyhow::Result<Greeting> {
        Ok(Greeting(format!("Hello, {}", req.name)))
    }
}

#[derive(Default)]
struct GermanGreeter;

#[async_trait]
impl RequestHandler<GetGreeting> for GermanGreeter {
    async fn handle(&self, _ctx: &MessageContext, req: GetGreeting) -> anyhow::Result<Greeting> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(Greeting(format!("Hallo, {}", req.name)))
    }
}

#[derive(Default)]
struct WelcomeMailer;

#[async_trait]
impl MulticastEventHandler<UserRegistered> for WelcomeMailer {
    async fn handle(&self, _ctx: &MessageContext, event: UserRegistered) -> anyhow::Result<()> {
        println!("UserRegistered: mail sent to {}", event.name);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut registry = HandlerRegistry::new();
    registry.register_command::<RegisterUser, RegisterUserHandler>()?;
    registry.register_command::<ChargeCard, ChargeCardHandler>()?;
    registry.register_request::<GetGreeting, EnglishGreeter>()?;
    registry.register_request::<GetGreeting, GermanGreeter>()?;
    registry.register_multicast_event::<UserRegistered, WelcomeMailer>()?;

    let config = BusConfig::builder().max_delivery_attempts(3).build();
    let bus = InMemoryBus::from_registry(config, registry)?;
    let handle = bus.start()?;

    bus.send(RegisterUser {
        name: "Alice".into(),
    })
    .await?;
    bus.publish(UserRegistered {
        name: "Alice".into(),
    })
    .await?;

    // 单播请求：取首个注册的处理器
    let greeting = bus
        .request(GetGreeting {
            name: "Alice".into(),
        })
        .await?;
    println!("request -> {}", greeting.0);

    // 广播请求：截止时间内收到的全部应答
    let greetings = bus
        .multicast_request(
            GetGreeting {
                name: "Bob".into(),
            },
            Duration::from_secs(1),
        )
        .await?;
    println!("multicast_request -> {} responses", greetings.len());

    bus.send(ChargeCard { cents: 1999 }).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let dead_letters = bus.dead_letter_queues().command_queue();
    while let Some(cmd) = dead_letters.pop::<ChargeCard>().await? {
        println!("dead letter: ChargeCard {{ cents: {} }}", cmd.cents);
    }

    handle.shutdown();
    handle.join().await;
    Ok(())
}
