use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{BrokerChannel, BrokerError, Delivery, PublishOptions};
use crate::models::task::MAX_PRIORITY;

/// Wrapper stored in the Redis lists. Carries the priority so a recovered
/// delivery can be put back on the right list.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    id: Uuid,
    priority: u8,
    persistent: bool,
    #[serde(default)]
    redelivered: bool,
    body: String,
}

/// Redis-backed durable priority queue.
///
/// Layout, for a task queue named `q`:
/// - `q:p0` .. `q:p9`: one list per priority level, pushed on the left and
///   popped from the right.
/// - `q:processing`: deliveries awaiting ack, moved there atomically on
///   receive.
/// - `q:dead`: messages rejected without requeue.
///
/// The connection is a [`ConnectionManager`], so a dropped link is re-dialed
/// on the next command whether or not a consumer is running. The consumer
/// still calls `connect` after a failure to recover its processing list.
///
/// Durability across a Redis restart depends on the server's AOF/RDB
/// configuration; the persistence flag is recorded in the envelope.
pub struct RedisBroker {
    client: redis::Client,
    task_queue: String,
    result_queue: String,
    conn: RwLock<Option<ConnectionManager>>,
    prefetch: AtomicUsize,
    outstanding: AtomicUsize,
}

impl RedisBroker {
    pub fn new(redis_url: &str, task_queue: &str, result_queue: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url).map_err(BrokerError::Redis)?;
        Ok(Self {
            client,
            task_queue: task_queue.to_string(),
            result_queue: result_queue.to_string(),
            conn: RwLock::new(None),
            prefetch: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
        })
    }

    fn priority_key(&self, priority: u8) -> String {
        format!("{}:p{}", self.task_queue, priority.min(MAX_PRIORITY))
    }

    fn processing_key(&self) -> String {
        format!("{}:processing", self.task_queue)
    }

    fn dead_letter_key(&self) -> String {
        format!("{}:dead", self.task_queue)
    }

    async fn conn(&self) -> Result<ConnectionManager, BrokerError> {
        self.conn.read().await.clone().ok_or(BrokerError::Disconnected)
    }

    /// Move deliveries orphaned by a previous connection back onto their
    /// priority lists.
    async fn recover_processing(&self, conn: &mut ConnectionManager) -> Result<usize, BrokerError> {
        let processing = self.processing_key();
        let orphaned: Vec<String> = conn.lrange(&processing, 0, -1).await?;

        for raw in &orphaned {
            let mut pipe = redis::pipe();
            pipe.atomic().lrem(&processing, 1, raw).ignore();
            match serde_json::from_str::<Envelope>(raw) {
                Ok(mut envelope) => {
                    envelope.redelivered = true;
                    let requeued = serde_json::to_string(&envelope)?;
                    pipe.rpush(self.priority_key(envelope.priority), requeued).ignore();
                }
                Err(_) => {
                    pipe.lpush(self.dead_letter_key(), raw).ignore();
                }
            }
            pipe.query_async::<()>(conn).await?;
        }
        Ok(orphaned.len())
    }

    fn release_outstanding(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }
}

#[async_trait]
impl BrokerChannel for RedisBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        let mut conn = ConnectionManager::new(self.client.clone()).await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;

        // Redis lists need no declaration; recovering the processing list is
        // what makes unacknowledged work visible again.
        let recovered = self.recover_processing(&mut conn).await?;
        self.outstanding.store(0, Ordering::SeqCst);
        *self.conn.write().await = Some(conn);

        tracing::info!(
            task_queue = %self.task_queue,
            result_queue = %self.result_queue,
            recovered,
            "Connected to Redis broker"
        );
        Ok(())
    }

    async fn qos(&self, prefetch: usize) -> Result<(), BrokerError> {
        self.prefetch.store(prefetch, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, body: &str, options: PublishOptions) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let envelope = Envelope {
            id: Uuid::new_v4(),
            priority: options.priority.min(MAX_PRIORITY),
            persistent: options.persistent,
            redelivered: false,
            body: body.to_string(),
        };
        let payload = serde_json::to_string(&envelope)?;
        conn.lpush::<_, _, ()>(self.priority_key(envelope.priority), &payload)
            .await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, BrokerError> {
        let prefetch = self.prefetch.load(Ordering::SeqCst);
        if prefetch > 0 && self.outstanding.load(Ordering::SeqCst) >= prefetch {
            return Err(BrokerError::PrefetchExhausted(prefetch));
        }

        let mut conn = self.conn().await?;
        let processing = self.processing_key();
        for priority in (0..=MAX_PRIORITY).rev() {
            let raw: Option<String> = conn
                .rpoplpush(self.priority_key(priority), &processing)
                .await?;
            let Some(raw) = raw else {
                continue;
            };
            self.outstanding.fetch_add(1, Ordering::SeqCst);

            // Anything pushed onto the list without an envelope is still
            // handed out so the consumer can reject it.
            let delivery = match serde_json::from_str::<Envelope>(&raw) {
                Ok(envelope) => Delivery {
                    body: envelope.body,
                    priority: envelope.priority,
                    redelivered: envelope.redelivered,
                    tag: raw,
                },
                Err(_) => Delivery {
                    body: raw.clone(),
                    priority,
                    redelivered: false,
                    tag: raw,
                },
            };
            return Ok(Some(delivery));
        }
        Ok(None)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.lrem(self.processing_key(), 1, &delivery.tag).await?;
        self.release_outstanding();
        if removed == 0 {
            return Err(BrokerError::UnknownDelivery(delivery.tag.clone()));
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let processing = self.processing_key();
        let removed: i64 = conn.lrem(&processing, 1, &delivery.tag).await?;
        self.release_outstanding();
        if removed == 0 {
            return Err(BrokerError::UnknownDelivery(delivery.tag.clone()));
        }

        if requeue {
            let requeued = match serde_json::from_str::<Envelope>(&delivery.tag) {
                Ok(mut envelope) => {
                    envelope.redelivered = true;
                    serde_json::to_string(&envelope)?
                }
                Err(_) => delivery.tag.clone(),
            };
            conn.rpush::<_, _, ()>(self.priority_key(delivery.priority), requeued)
                .await?;
        } else {
            conn.lpush::<_, _, ()>(self.dead_letter_key(), &delivery.body)
                .await?;
        }
        Ok(())
    }

    async fn depth(&self) -> Result<u64, BrokerError> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        for priority in 0..=MAX_PRIORITY {
            pipe.llen(self.priority_key(priority));
        }
        let lengths: Vec<u64> = pipe.query_async(&mut conn).await?;
        Ok(lengths.iter().sum())
    }

    async fn unacked(&self) -> Result<u64, BrokerError> {
        let mut conn = self.conn().await?;
        let len: u64 = conn.llen(self.processing_key()).await?;
        Ok(len)
    }
}
