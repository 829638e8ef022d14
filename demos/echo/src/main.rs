//! Echo bridge: one shared worker, two clients.
//!
//! Run with: cargo run -p echo-demo
//!
//! Each client subscribes to echoes, then sends a message; both see both
//! messages, prefixed with the sender's id.

use std::time::Duration;

use anyhow::Context as _;
use futures::StreamExt;
use portlink_client::{Client, ClientOptions};
use portlink_core::{
    Call, Contract, Operation, OperationDescriptor, OperationKind, Subject, Subscription,
};
use portlink_worker::{Worker, WorkerOptions};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct EchoContract;

struct Echo;

struct SubscribeEcho;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct EchoOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<bool>,
}

impl Contract for EchoContract {
    const NAME: &'static str = "echo";

    fn operations() -> Vec<OperationDescriptor> {
        vec![
            OperationDescriptor::call::<Echo>(),
            OperationDescriptor::subscription::<SubscribeEcho>(),
        ]
    }
}

impl Operation for Echo {
    type Contract = EchoContract;
    type Input = String;
    const NAME: &'static str = "echo";
}

impl Call for Echo {
    type Output = String;
    const KIND: OperationKind = OperationKind::Mutation;
}

impl Operation for SubscribeEcho {
    type Contract = EchoContract;
    type Input = EchoOptions;
    const NAME: &'static str = "subscribeEcho";
}

impl Subscription for SubscribeEcho {
    type Update = String;
}

fn echo_worker() -> anyhow::Result<Worker> {
    let echoes = Subject::<String>::new();

    let worker = Worker::builder()
        .options(WorkerOptions {
            name: "echo".to_string(),
        })
        .call::<Echo, _, _>({
            let echoes = echoes.clone();
            move |ctx, client_id, msg| {
                let echoed = ctx.notify(&echoes, format!("[{client_id}] {msg}"));
                async move { Ok(echoed) }
            }
        })
        .subscription::<SubscribeEcho, _, _>(move |ctx, client_id, observer, _options| {
            let disposer = ctx.subscribe(&echoes, &client_id, observer);
            async move { disposer }
        })
        .build()?;

    Ok(worker)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let worker = echo_worker()?;
    let shared = worker.clone().into_shared();

    let alice = Client::<EchoContract>::connect(
        &shared,
        ClientOptions {
            client_id: Some("alice".to_string()),
        },
    )
    .await?;
    let bob = Client::<EchoContract>::connect(&shared, ClientOptions::default()).await?;
    info!(alice = %alice.id(), bob = %bob.id(), "clients connected");

    let alice_echoes = alice.subscribe::<SubscribeEcho>(EchoOptions::default());
    let mut stream = alice_echoes.stream();

    let reply = alice.call::<Echo>("hello".to_string()).await?;
    info!(%reply, "alice got a reply");
    bob.call::<Echo>("hi alice".to_string()).await?;

    for _ in 0..2 {
        let update = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .context("no echo within a second")?
            .context("echo stream ended")??;
        info!(%update, "alice saw an echo");
    }

    drop(stream);
    bob.disconnect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    info!(
        clients = worker.clients().len(),
        subscriptions = worker.clients().subscription_count(alice.id()),
        "after teardown"
    );

    Ok(())
}
