//! esclient-load: load a JSON event file into a stream and subscribe to it
//!
//! ```text
//! esclient-load <events.json> [--follow]
//! ```
//!
//! 1. Deletes stream `jsontest` (a missing stream is fine)
//! 2. Appends the file's events to it
//! 3. Prints the events whose type contains `delete`, then the whole stream
//! 4. Recreates subscription group `jsontest`/`local` and subscribes,
//!    printing each delivered event
//!
//! With `--follow` the subscriber keeps running until Ctrl-C.
//!
//! ## Configuration
//! - ESCLIENT_CONFIG: YAML config file (see `esclient::config`)
//! - ESCLIENT_CONNECTION__TRANSPORT / __HOST / __PORT: store location
//! - ESCLIENT_LOG: tracing filter (default: info)

use std::time::Duration;

use tracing::info;

use esclient::codec::{encode, encode_event, load_file};
use esclient::config::ClientConfig;
use esclient::utils::bootstrap::init_tracing;
use esclient::{
    auto_ack, Client, ConsumerStrategy, DeliveryContext, ExpectedVersion, SubscriptionSettings,
};

const STREAM: &str = "jsontest";
const GROUP: &str = "local";
const FILTER: &str = "delete";

fn group_settings() -> SubscriptionSettings {
    SubscriptionSettings::default()
        .with_resolve_link_tos(false)
        .with_history_buffer_size(20)
        .with_live_buffer_size(10)
        .with_checkpoint_counts(10, 1000)
        .with_checkpoint_after(Duration::from_secs(2))
        .with_max_retry_count(500)
        .with_max_subscriber_count(5)
        .with_message_timeout(Duration::from_secs(30))
        .with_read_batch_size(500)
        .start_from_current()
        .with_consumer_strategy(ConsumerStrategy::RoundRobin)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        eprintln!("usage: esclient-load <events.json> [--follow]");
        std::process::exit(2);
    };
    let follow = args.any(|arg| arg == "--follow");

    init_tracing();

    let events = load_file(&path, Some(STREAM))?;
    info!(path = %path, count = events.len(), "Loaded events");

    let config = ClientConfig::load(None)?;
    let client = Client::connect(config.client_settings()).await?;

    client.delete_stream(STREAM, ExpectedVersion::Any).await?;
    client.append(STREAM, events, ExpectedVersion::Any).await?;

    let filtered = client.read_filtered(STREAM, FILTER).await?;
    let all = client
        .read_forward(STREAM, 0, &client.settings().read_options())
        .await?;
    println!("{}", encode(&filtered)?);
    println!("{}", encode(&all)?);

    client.delete_subscription(STREAM, GROUP).await?;
    client
        .create_subscription(STREAM, GROUP, group_settings())
        .await?;
    let subscription = client
        .subscribe(
            STREAM,
            GROUP,
            auto_ack(|ctx: &DeliveryContext| match encode_event(&ctx.event) {
                Ok(envelope) => println!("{}", envelope),
                Err(e) => eprintln!("failed to encode event {}: {}", ctx.event.event_id, e),
            }),
        )
        .await?;
    info!(subscription_id = %subscription.subscription_id(), "Subscribed");

    if follow {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            reason = subscription.wait_detached() => info!(reason = %reason, "Subscription detached"),
        }
    }

    subscription.close().await?;
    println!("Load finished");
    Ok(())
}
