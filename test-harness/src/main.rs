// Load driver: publishes through the batching pipeline and consumes through a
// streaming subscriber, both wired to the in-memory service.
use anyhow::{Context, Result};
use clap::Parser;
use pubsub_client::wire::PubsubMessage;
use pubsub_client::{
    PublishFuture, Publisher, PublisherConfig, Scheduler, Subscriber, SubscriberConfig,
    receiver_fn,
};
use pubsub_memory::{MemoryPubsub, SubscriptionOptions};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "pubsub-harness")]
#[command(about = "Drive the publish/subscribe runtime against an in-memory service")]
struct Args {
    /// Topic name
    #[arg(long, default_value = "harness-topic")]
    topic: String,

    /// Subscription name
    #[arg(long, default_value = "harness-sub")]
    subscription: String,

    /// Message payload size in bytes
    #[arg(long, default_value = "1024")]
    payload_size: usize,

    /// Messages per second rate (0 = unlimited)
    #[arg(long, default_value = "0")]
    rate: u64,

    /// Total number of messages to publish
    #[arg(long, default_value = "10000")]
    count: u64,

    /// Spread messages over this many ordering keys (0 = unordered)
    #[arg(long, default_value = "0")]
    ordering_keys: usize,

    /// Create the subscription with exactly-once delivery
    #[arg(long)]
    exactly_once: bool,

    /// Optional YAML file with `publisher:` / `subscriber:` overrides
    #[arg(long)]
    config: Option<String>,

    /// Seconds to wait for the subscriber to drain after publishing
    #[arg(long, default_value = "30")]
    drain_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(
        topic = %args.topic,
        subscription = %args.subscription,
        payload_size = args.payload_size,
        rate = args.rate,
        count = args.count,
        ordering_keys = args.ordering_keys,
        exactly_once = args.exactly_once,
        "Starting harness"
    );

    let mut publisher_config = PublisherConfig::from_env_or_yaml(args.config.as_deref())
        .context("load publisher config")?;
    if args.ordering_keys > 0 {
        publisher_config.enable_message_ordering = true;
    }
    let subscriber_config = SubscriberConfig::from_env_or_yaml(args.config.as_deref())
        .context("load subscriber config")?;

    let service = MemoryPubsub::new();
    service.create_topic(&args.topic)?;
    service.create_subscription(
        &args.subscription,
        &args.topic,
        SubscriptionOptions {
            exactly_once_delivery: args.exactly_once,
            message_ordering: args.ordering_keys > 0,
            ..SubscriptionOptions::default()
        },
    )?;

    let scheduler = Scheduler::current()?;
    let received = Arc::new(AtomicU64::new(0));
    let drained = Arc::new(Notify::new());
    let receiver = {
        let received = Arc::clone(&received);
        let drained = Arc::clone(&drained);
        receiver_fn(move |_message, ack| {
            let received = Arc::clone(&received);
            let drained = Arc::clone(&drained);
            async move {
                ack.ack();
                received.fetch_add(1, Ordering::Relaxed);
                drained.notify_one();
                Ok::<(), anyhow::Error>(())
            }
        })
    };
    let subscriber = Subscriber::new(
        args.subscription.clone(),
        subscriber_config,
        Arc::new(service.clone()),
        receiver,
        scheduler.clone(),
    )?;
    subscriber.start()?;

    let publisher = Publisher::new(
        args.topic.clone(),
        publisher_config,
        Arc::new(service.clone()),
        scheduler,
    )?;

    let payload = vec![b'x'; args.payload_size];
    let delay = (args.rate > 0).then(|| Duration::from_micros(1_000_000 / args.rate));
    let start_time = Instant::now();
    let mut pending: Vec<PublishFuture> = Vec::new();
    let mut published = 0u64;
    let mut errors = 0u64;

    for i in 0..args.count {
        let mut message = PubsubMessage::new(payload.clone());
        if args.ordering_keys > 0 {
            message = message.with_ordering_key(format!("key-{}", i as usize % args.ordering_keys));
        }
        pending.push(publisher.publish(message).await);

        if pending.len() >= 1000 {
            settle(&mut pending, &mut published, &mut errors).await;
            let rate = published as f64 / start_time.elapsed().as_secs_f64();
            info!(
                published = published,
                errors = errors,
                rate = format!("{:.2}", rate),
                "Publishing progress"
            );
        }
        if let Some(delay) = delay {
            sleep(delay).await;
        }
    }
    publisher.flush().await;
    settle(&mut pending, &mut published, &mut errors).await;
    publisher.shutdown().await?;

    let publish_elapsed = start_time.elapsed();
    info!(
        published = published,
        errors = errors,
        batches = publisher.stats().batches_sent,
        elapsed = format!("{:.2}s", publish_elapsed.as_secs_f64()),
        rate = format!("{:.2} msg/s", published as f64 / publish_elapsed.as_secs_f64()),
        "Publisher completed"
    );

    let drain = timeout(Duration::from_secs(args.drain_timeout), async {
        while received.load(Ordering::Relaxed) < published {
            drained.notified().await;
        }
    })
    .await;
    if drain.is_err() {
        warn!(
            received = received.load(Ordering::Relaxed),
            published = published,
            "Timeout waiting for subscriber to drain"
        );
    }

    subscriber.stop().await?;
    let stats = subscriber.stats();
    let elapsed = start_time.elapsed();
    info!(
        received = received.load(Ordering::Relaxed),
        acked = stats.acked,
        nacked = stats.nacked,
        expired = stats.expired,
        backlog = service.backlog_len(&args.subscription),
        elapsed = format!("{:.2}s", elapsed.as_secs_f64()),
        rate = format!(
            "{:.2} msg/s",
            received.load(Ordering::Relaxed) as f64 / elapsed.as_secs_f64()
        ),
        "Subscriber completed"
    );

    Ok(())
}

async fn settle(pending: &mut Vec<PublishFuture>, published: &mut u64, errors: &mut u64) {
    for future in pending.drain(..) {
        match future.await {
            Ok(_) => *published += 1,
            Err(e) => {
                *errors += 1;
                if *errors % 100 == 1 {
                    error!(error = %e, errors = *errors, "Publish error");
                }
            }
        }
    }
}
