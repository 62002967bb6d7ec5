use std::time::Duration;

use outbox_relay::{
    Dispatcher, EventHeaders, LogicalDatabase, Outbox, OutboxConfig, OutboxEvent,
    outbox::inmemory::InMemoryOutboxStore,
    transport::{InMemory, RawPayload, Transport, layers::JsonLayer},
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Serialize)]
struct AccountCreated {
    account_id: u64,
    email: String,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let config = OutboxConfig::from_env().expect("invalid OUTBOX_* configuration");

    let outbox = LogicalDatabase::ALL
        .into_iter()
        .fold(Outbox::new(), |outbox, database| {
            outbox.with_database(database, InMemoryOutboxStore::new())
        })
        .with_policy(config.retry_policy());

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    let cancel_handle = tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    // Business writes: one event per tick, rotating over the databases.
    let writer = outbox.clone();
    let cancel_writer = cancel.clone();
    let writer_handle = tokio::spawn(async move {
        let mut account_id = 0;
        while !cancel_writer.is_cancelled() {
            let database = LogicalDatabase::ALL[account_id as usize % 3];
            let event = OutboxEvent::from_payload(
                "ACCOUNT",
                account_id.to_string(),
                format!("{database}.account.created"),
                &AccountCreated {
                    account_id,
                    email: format!("user{account_id}@example.com"),
                },
            )
            .expect("Failed to encode event");

            writer
                .publish_batch_atomic(database, [event])
                .await
                .expect("Failed to insert event");
            account_id += 1;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });

    let bus: InMemory<EventHeaders, RawPayload> = InMemory::default();
    // The first deliveries fail to show requeueing.
    bus.fail_next(2, "simulated broker outage").await;
    let transport = Transport::new(bus.clone()).layer(JsonLayer);

    let dispatcher =
        Dispatcher::new(outbox.clone(), transport).with_settings(config.dispatch_settings());
    let dispatcher_handle = tokio::spawn(dispatcher.run(cancel.clone()));

    let janitor_handle = tokio::spawn(config.janitor(outbox.clone()).run(cancel.clone()));

    let (_, _, dispatched, _) =
        tokio::try_join!(cancel_handle, writer_handle, dispatcher_handle, janitor_handle).unwrap();
    dispatched.expect("Dispatcher failed");

    for database in LogicalDatabase::ALL {
        let stats = outbox.stats(database).await.expect("Failed to read stats");
        tracing::info!(%database, ?stats, "Final outbox stats");
    }
    tracing::info!(delivered = bus.published().await.len(), "Relay stopped");
}
