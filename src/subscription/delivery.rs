//! Handler-side delivery: the callback contract and the thread that runs it.
//!
//! Handlers run on a dedicated OS thread per subscription, never on the
//! client's worker pool. A handler may therefore call blocking client
//! operations without starving the pool.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::connection::Delivery;
use crate::error::Result;
use crate::event::Event;

/// What the handler decided about one delivered event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Processed. The group records it as handled.
    Ack,
    /// Failed. Redeliver, counting toward the group's retry limit.
    Retry(String),
    /// Failed permanently. Park without further retries.
    Park(String),
    /// Not relevant. Record as handled without processing.
    Skip,
}

/// Everything a handler knows about one delivery.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    /// The event to process. The link target when links are resolved.
    pub event: Event,
    /// The link through which `event` was reached, if any.
    pub link: Option<Event>,
    /// 1 on first delivery, incremented on each redelivery.
    pub attempt_count: u32,
    /// When the store will redeliver if no disposition arrives.
    pub deadline: Option<Instant>,
    pub stream: String,
    pub group: String,
}

impl DeliveryContext {
    pub(crate) fn new(delivery: Delivery, stream: &str, group: &str) -> Self {
        Self {
            event: delivery.event,
            link: delivery.link,
            attempt_count: delivery.retry_count.saturating_add(1),
            deadline: delivery.deadline,
            stream: stream.to_string(),
            group: group.to_string(),
        }
    }

    /// True on the first delivery attempt.
    pub fn is_first_attempt(&self) -> bool {
        self.attempt_count == 1
    }

    /// Time left before the ack deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// The event as stored in the subscribed stream.
    pub fn original_event(&self) -> &Event {
        self.link.as_ref().unwrap_or(&self.event)
    }

    fn ack_id(&self) -> Uuid {
        self.original_event().event_id
    }
}

/// Callback invoked once per delivered event.
pub trait DeliveryHandler: Send + 'static {
    fn on_event(&mut self, ctx: &DeliveryContext) -> Disposition;
}

impl<F> DeliveryHandler for F
where
    F: FnMut(&DeliveryContext) -> Disposition + Send + 'static,
{
    fn on_event(&mut self, ctx: &DeliveryContext) -> Disposition {
        self(ctx)
    }
}

/// Wrap a callback that has no failure path: every event it returns from
/// is acknowledged. A panic still leads to redelivery.
pub fn auto_ack<F>(mut f: F) -> impl DeliveryHandler
where
    F: FnMut(&DeliveryContext) + Send + 'static,
{
    move |ctx: &DeliveryContext| -> Disposition {
        f(ctx);
        Disposition::Ack
    }
}

/// Channels wiring a delivery thread to its subscription driver.
pub(crate) struct DeliveryWiring {
    pub deliveries: mpsc::Receiver<Delivery>,
    pub dispositions: mpsc::UnboundedSender<(Uuid, Disposition)>,
    pub stop: Arc<AtomicBool>,
}

/// Start the handler thread for one subscription.
///
/// The thread exits when the delivery channel closes, when the stop flag is
/// set, or when the driver stops listening for dispositions.
pub(crate) fn spawn_delivery_thread<H: DeliveryHandler>(
    stream: &str,
    group: &str,
    mut handler: H,
    wiring: DeliveryWiring,
) -> Result<thread::JoinHandle<()>> {
    let DeliveryWiring {
        mut deliveries,
        dispositions,
        stop,
    } = wiring;
    let stream = stream.to_string();
    let group = group.to_string();

    let handle = thread::Builder::new()
        .name(format!("esclient-delivery-{}-{}", stream, group))
        .spawn(move || {
            while let Some(delivery) = deliveries.blocking_recv() {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                let ctx = DeliveryContext::new(delivery, &stream, &group);
                let disposition = catch_unwind(AssertUnwindSafe(|| handler.on_event(&ctx)))
                    .unwrap_or_else(|_| {
                        error!(
                            stream = %stream,
                            group = %group,
                            event_id = %ctx.event.event_id,
                            "Handler panicked"
                        );
                        Disposition::Retry("handler panicked".to_string())
                    });
                if dispositions.send((ctx.ack_id(), disposition)).is_err() {
                    break;
                }
            }
            debug!(stream = %stream, group = %group, "Delivery thread exiting");
        })?;
    Ok(handle)
}
