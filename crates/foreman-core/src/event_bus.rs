use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use foreman_types::{EventKind, WorkflowEvent};

/// In-process publish/subscribe with a bounded replay ring.
///
/// `publish` never blocks and never fails; slow subscribers observe
/// `RecvError::Lagged` on their bounded queue (the drop-after-overflow
/// policy) and can resynchronize through [`EventBus::replay_since`]. The
/// ring keeps the last `ring_capacity` events for late joiners. Sequence
/// numbers are monotonic per bus, i.e. per project.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkflowEvent>,
    ring: Arc<RwLock<VecDeque<WorkflowEvent>>>,
    ring_capacity: usize,
    seq: Arc<AtomicU64>,
}

pub const DEFAULT_RING_CAPACITY: usize = 1000;

impl EventBus {
    pub fn new() -> Self {
        Self::with_start_seq(DEFAULT_RING_CAPACITY, 0)
    }

    /// `start_seq` is the last sequence already persisted, so a restarted
    /// project continues its numbering instead of reusing it.
    pub fn with_start_seq(ring_capacity: usize, start_seq: u64) -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self {
            tx,
            ring: Arc::new(RwLock::new(VecDeque::with_capacity(ring_capacity))),
            ring_capacity,
            seq: Arc::new(AtomicU64::new(start_seq)),
        }
    }

    /// Stamp the event with the next sequence number, retain it in the
    /// ring, and fan out. Returns the stamped event.
    pub fn publish(&self, mut event: WorkflowEvent) -> WorkflowEvent {
        event.seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut ring = self.ring.write().expect("event ring poisoned");
            if ring.len() == self.ring_capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }
        let _ = self.tx.send(event.clone());
        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }

    /// Subscription that only yields events matching the predicate.
    pub fn subscribe_where<F>(&self, predicate: F) -> FilteredSubscription<F>
    where
        F: Fn(&WorkflowEvent) -> bool,
    {
        FilteredSubscription {
            rx: self.tx.subscribe(),
            predicate,
        }
    }

    /// Retained events with `seq > since`, in publication order.
    pub fn replay_since(&self, since: u64) -> Vec<WorkflowEvent> {
        self.ring
            .read()
            .expect("event ring poisoned")
            .iter()
            .filter(|event| event.seq > since)
            .cloned()
            .collect()
    }

    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumable stream of matched events. Lag behaves like the underlying
/// broadcast receiver: the subscriber observes the loss and can replay.
pub struct FilteredSubscription<F> {
    rx: broadcast::Receiver<WorkflowEvent>,
    predicate: F,
}

impl<F> FilteredSubscription<F>
where
    F: Fn(&WorkflowEvent) -> bool,
{
    pub async fn recv(&mut self) -> Result<WorkflowEvent, broadcast::error::RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if (self.predicate)(&event) {
                return Ok(event);
            }
        }
    }
}

/// Persist every published event as an audit row. Runs until the bus is
/// dropped; a lagged receiver records the loss as a `subscriber_lagged`
/// event instead of blocking publishers.
pub fn spawn_audit_writer(
    bus: EventBus,
    store: std::sync::Arc<foreman_store::ProjectStore>,
    project_id: String,
) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(err) = store.append_event(&event).await {
                        tracing::warn!(?err, "failed to persist audit event");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "audit writer lagged; events dropped from queue");
                    bus.publish(WorkflowEvent::new(
                        EventKind::SubscriberLagged,
                        project_id.clone(),
                        serde_json::json!({"subscriber": "audit", "missed": missed}),
                    ));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
