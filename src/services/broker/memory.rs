use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use tokio::sync::Mutex;

use super::{BrokerChannel, BrokerError, Delivery, PublishOptions};
use crate::models::task::MAX_PRIORITY;

#[derive(Debug, Clone)]
struct Queued {
    seq: u64,
    priority: u8,
    body: String,
    persistent: bool,
    redelivered: bool,
}

// Max-heap order: higher priority first, then oldest sequence number.
impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Queued {}

#[derive(Debug, Default)]
struct State {
    connected: bool,
    refuse_connections: bool,
    prefetch: usize,
    next_seq: u64,
    ready: BinaryHeap<Queued>,
    unacked: HashMap<String, Queued>,
    dead_letters: Vec<String>,
    connects: u64,
}

/// In-process broker with the same delivery semantics as [`super::RedisBroker`].
///
/// [`InMemoryBroker::sever`] drops the connection so transport failures and
/// reconnection can be exercised without a live broker.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<State>,
}

impl InMemoryBroker {
    /// A broker that is already connected.
    pub fn new() -> Self {
        let state = State {
            connected: true,
            ..State::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    /// Drop the connection and refuse new ones until [`InMemoryBroker::restore`].
    pub async fn sever(&self) {
        let mut state = self.state.lock().await;
        state.connected = false;
        state.refuse_connections = true;
    }

    /// Accept connections again. Publishing and depth queries pick the
    /// connection back up on their own; the consumer still has to call
    /// `connect` to get its unacked messages redelivered.
    pub async fn restore(&self) {
        self.state.lock().await.refuse_connections = false;
    }

    /// Bodies rejected without requeue, oldest first.
    pub async fn dead_letters(&self) -> Vec<String> {
        self.state.lock().await.dead_letters.clone()
    }

    /// Number of successful `connect` calls.
    pub async fn connect_count(&self) -> u64 {
        self.state.lock().await.connects
    }

    /// Whether every waiting message was published with the persistence flag.
    pub async fn all_persistent(&self) -> bool {
        self.state.lock().await.ready.iter().all(|q| q.persistent)
    }
}

fn ensure_connected(state: &State) -> Result<(), BrokerError> {
    if state.connected {
        Ok(())
    } else {
        Err(BrokerError::Disconnected)
    }
}

// Producer-side operations re-establish a dropped connection the way a
// self-healing client would, without touching deliveries in flight.
fn redial(state: &mut State) -> Result<(), BrokerError> {
    if !state.connected && !state.refuse_connections {
        state.connected = true;
    }
    ensure_connected(state)
}

#[async_trait]
impl BrokerChannel for InMemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        if state.refuse_connections {
            return Err(BrokerError::Disconnected);
        }
        let orphaned: Vec<Queued> = state.unacked.drain().map(|(_, q)| q).collect();
        for mut q in orphaned {
            q.redelivered = true;
            state.ready.push(q);
        }
        state.connected = true;
        state.connects += 1;
        Ok(())
    }

    async fn qos(&self, prefetch: usize) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        ensure_connected(&state)?;
        state.prefetch = prefetch;
        Ok(())
    }

    async fn publish(&self, body: &str, options: PublishOptions) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        redial(&mut state)?;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.ready.push(Queued {
            seq,
            priority: options.priority.min(MAX_PRIORITY),
            body: body.to_string(),
            persistent: options.persistent,
            redelivered: false,
        });
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, BrokerError> {
        let mut state = self.state.lock().await;
        ensure_connected(&state)?;
        if state.prefetch > 0 && state.unacked.len() >= state.prefetch {
            return Err(BrokerError::PrefetchExhausted(state.prefetch));
        }
        let Some(q) = state.ready.pop() else {
            return Ok(None);
        };
        let delivery = Delivery {
            tag: q.seq.to_string(),
            body: q.body.clone(),
            priority: q.priority,
            redelivered: q.redelivered,
        };
        state.unacked.insert(delivery.tag.clone(), q);
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        ensure_connected(&state)?;
        state
            .unacked
            .remove(&delivery.tag)
            .map(|_| ())
            .ok_or_else(|| BrokerError::UnknownDelivery(delivery.tag.clone()))
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        ensure_connected(&state)?;
        let q = state
            .unacked
            .remove(&delivery.tag)
            .ok_or_else(|| BrokerError::UnknownDelivery(delivery.tag.clone()))?;
        if requeue {
            state.ready.push(Queued {
                redelivered: true,
                ..q
            });
        } else {
            state.dead_letters.push(q.body);
        }
        Ok(())
    }

    async fn depth(&self) -> Result<u64, BrokerError> {
        let mut state = self.state.lock().await;
        redial(&mut state)?;
        Ok(state.ready.len() as u64)
    }

    async fn unacked(&self) -> Result<u64, BrokerError> {
        let mut state = self.state.lock().await;
        redial(&mut state)?;
        Ok(state.unacked.len() as u64)
    }
}
