//! Async driver for a [`Collector`].
//!
//! One task per collection serializes everything that can touch the state
//! machine: envelopes from the response subscription, the master deadline,
//! the ack-grace timer and control requests from the handle. The master
//! deadline is a single owned `Sleep` that is reset whenever an ack pushes
//! the deadline later.

use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};

use meshbus_transport::Subscription;

use crate::collector::{AcceptFn, Collector, CollectorEvent, CollectorPhase};
use crate::config::CollectorConfig;

/// Sink for collector notifications.
pub type EventSender = mpsc::UnboundedSender<CollectorEvent>;

#[derive(Debug, Clone, Copy)]
enum Control {
    End,
    Cancel,
}

/// Builds and starts a collection on a response topic.
pub struct ResponseCollector {
    collector: Collector,
}

impl ResponseCollector {
    /// Configure a collection. Its clock starts now.
    pub fn new(config: &CollectorConfig) -> Self {
        Self {
            collector: Collector::new(config, Instant::now()),
        }
    }

    /// Attach to `subscription` and start collecting in a background task.
    ///
    /// Notifications are sent on `observer`. Nobody reading them means a
    /// publish error would vanish, so that case is logged loudly.
    pub fn listen_for_responses(
        mut self,
        subscription: Subscription,
        accept: Option<Arc<AcceptFn>>,
        observer: EventSender,
    ) -> CollectorHandle {
        if observer.is_closed() {
            tracing::warn!(
                topic = %subscription.topic(),
                "Collector has no event observer; errors will be lost"
            );
        }

        self.collector.begin_listening(Instant::now());
        tracing::debug!(
            topic = %subscription.topic(),
            deadline_ms = self.collector.current_timeout().as_millis() as u64,
            "Collector listening for responses"
        );

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(self.collector, Some(subscription), accept, observer, control_rx));
        CollectorHandle { control: control_tx, task: Some(task) }
    }
}

/// Owner-side handle of a running collection.
pub struct CollectorHandle {
    control: mpsc::UnboundedSender<Control>,
    task: Option<JoinHandle<CollectorPhase>>,
}

impl CollectorHandle {
    /// Abandon the collection without emitting a final aggregate.
    pub fn cancel(&self) {
        let _ = self.control.send(Control::Cancel);
    }

    /// Conclude now and emit whatever has been gathered.
    pub fn end(&self) {
        let _ = self.control.send(Control::End);
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the collection task and report how it terminated.
    pub async fn join(mut self) -> Option<CollectorPhase> {
        match self.task.take() {
            Some(task) => task.await.ok(),
            None => None,
        }
    }
}

async fn run(
    mut collector: Collector,
    mut subscription: Option<Subscription>,
    accept: Option<Arc<AcceptFn>>,
    observer: EventSender,
    mut control: mpsc::UnboundedReceiver<Control>,
) -> CollectorPhase {
    let mut scheduled = collector.deadline();
    let master = tokio::time::sleep_until(scheduled);
    tokio::pin!(master);
    let mut ack_timer: Option<Pin<Box<Sleep>>> = None;
    let mut control_open = true;

    loop {
        for event in collector.drain_events() {
            let _ = observer.send(event);
        }
        if collector.is_terminated() {
            break;
        }

        if collector.deadline() > scheduled {
            scheduled = collector.deadline();
            master.as_mut().reset(scheduled);
        }
        sync_ack_timer(&mut ack_timer, collector.ack_timer_deadline());

        tokio::select! {
            msg = control.recv(), if control_open => match msg {
                Some(Control::Cancel) => {
                    collector.cancel();
                }
                Some(Control::End) => {
                    collector.end();
                }
                None => control_open = false,
            },
            envelope = next_envelope(&mut subscription) => match envelope {
                Some(envelope) => {
                    collector.on_response_message(accept.as_deref(), envelope, Instant::now());
                }
                None => {
                    tracing::debug!("Response topic closed; waiting for deadline");
                    remove_listeners(&mut subscription);
                }
            },
            _ = &mut master => collector.on_deadline(Instant::now()),
            _ = wait_ack_timer(&mut ack_timer) => collector.on_ack_timeout(Instant::now()),
        }
    }

    remove_listeners(&mut subscription);
    tracing::debug!(
        cancelled = collector.is_cancelled(),
        payloads = collector.payload_messages().len(),
        acks = collector.ack_messages().len(),
        "Collector finished"
    );
    collector.phase()
}

/// Detach from the response topic. Safe to call repeatedly.
fn remove_listeners(subscription: &mut Option<Subscription>) {
    subscription.take();
}

fn sync_ack_timer(timer: &mut Option<Pin<Box<Sleep>>>, wanted: Option<Instant>) {
    let Some(at) = wanted else {
        *timer = None;
        return;
    };
    match timer {
        Some(sleep) => {
            if sleep.deadline() != at {
                sleep.as_mut().reset(at);
            }
        }
        None => *timer = Some(Box::pin(tokio::time::sleep_until(at))),
    }
}

async fn next_envelope(subscription: &mut Option<Subscription>) -> Option<meshbus_protocol::Envelope> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_ack_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
