use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use akashi_common::AppError;
use akashi_models::NewRunEvent;
use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Error)]
pub enum BufferError {
    #[error("event buffer at capacity")]
    AtCapacity,

    #[error("event buffer is draining")]
    Draining,

    #[error("event buffer closed before the batch was flushed")]
    Closed,

    #[error("flush failed: {0}")]
    Store(String),
}

impl From<BufferError> for AppError {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::AtCapacity => {
                AppError::Unavailable("event buffer at capacity; retry shortly".to_string())
            }
            BufferError::Draining => AppError::Unavailable(
                "instance is draining; retry on another instance".to_string(),
            ),
            BufferError::Closed | BufferError::Store(_) => {
                AppError::Internal(format!("event flush failed: {}", err))
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("run {0} not found")]
    RunNotFound(Uuid),
}

/// One appended batch as the sink sees it.
#[derive(Debug, Clone)]
pub struct FlushBatch {
    pub run_id: Uuid,
    pub org_id: Uuid,
    pub agent_id: String,
    pub events: Vec<NewRunEvent>,
}

struct PendingBatch {
    batch: FlushBatch,
    reply: oneshot::Sender<Result<Vec<Uuid>, BufferError>>,
}

/// Durable write target for the flusher. Batches of one cycle are written in
/// a single transaction, in queue order, returning assigned event ids per
/// batch.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn persist(&self, batches: Vec<FlushBatch>) -> Result<Vec<Vec<Uuid>>, SinkError>;
}

struct BufferInner {
    queue: Mutex<VecDeque<PendingBatch>>,
    queued_items: AtomicUsize,
    capacity: usize,
    high_water: usize,
    draining: AtomicBool,
    wake: Notify,
}

/// Receipt for an appended batch; redeemed by [`EventBuffer::flush_now`].
#[derive(Debug)]
pub struct FlushTicket {
    rx: oneshot::Receiver<Result<Vec<Uuid>, BufferError>>,
}

/// Bounded in-memory ingestion queue with a single background flusher.
/// Append is durable only once `flush_now` resolves successfully.
#[derive(Clone)]
pub struct EventBuffer {
    inner: Arc<BufferInner>,
}

impl EventBuffer {
    pub fn new(capacity: usize, high_water: usize) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                queue: Mutex::new(VecDeque::new()),
                queued_items: AtomicUsize::new(0),
                capacity,
                high_water,
                draining: AtomicBool::new(false),
                wake: Notify::new(),
            }),
        }
    }

    pub fn queued(&self) -> usize {
        self.inner.queued_items.load(Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }

    /// Enqueue a batch, failing fast when full or draining. Per-run order is
    /// the order of `append` calls.
    pub fn append(
        &self,
        run_id: Uuid,
        org_id: Uuid,
        agent_id: String,
        events: Vec<NewRunEvent>,
    ) -> Result<FlushTicket, BufferError> {
        if self.is_draining() {
            return Err(BufferError::Draining);
        }

        let count = events.len();
        let queued = self.inner.queued_items.load(Ordering::SeqCst);
        if queued + count > self.inner.capacity {
            return Err(BufferError::AtCapacity);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut queue = self
                .inner
                .queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            queue.push_back(PendingBatch {
                batch: FlushBatch {
                    run_id,
                    org_id,
                    agent_id,
                    events,
                },
                reply: tx,
            });
        }
        let queued = self.inner.queued_items.fetch_add(count, Ordering::SeqCst) + count;
        if queued >= self.inner.high_water {
            self.inner.wake.notify_one();
        }

        Ok(FlushTicket { rx })
    }

    /// Nudge the flusher and wait for the ticket's batch to hit the store.
    pub async fn flush_now(&self, ticket: FlushTicket) -> Result<Vec<Uuid>, BufferError> {
        self.inner.wake.notify_one();
        ticket.rx.await.map_err(|_| BufferError::Closed)?
    }

    /// Stop intake and wait until the queue is empty or the deadline passes.
    /// Returns whether the queue fully drained.
    pub async fn drain(&self, max_wait: Duration) -> bool {
        self.inner.draining.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + max_wait;
        loop {
            if self.queued() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.inner.wake.notify_one();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Start the background flusher. It wakes on the interval, on the
    /// high-water mark, on `flush_now`, and on shutdown, then drains what is
    /// queued in one sink transaction per cycle.
    pub fn spawn_flusher(
        &self,
        sink: Arc<dyn EventSink>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("event buffer flusher started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = inner.wake.notified() => {}
                    changed = shutdown.changed() => {
                        let stopping = changed.is_err() || *shutdown.borrow();
                        if stopping {
                            inner.draining.store(true, Ordering::SeqCst);
                            flush_pending(&inner, sink.as_ref()).await;
                            info!("event buffer flusher stopped");
                            return;
                        }
                    }
                }
                flush_pending(&inner, sink.as_ref()).await;
            }
        })
    }
}

async fn flush_pending(inner: &BufferInner, sink: &dyn EventSink) {
    let pending: Vec<PendingBatch> = {
        let mut queue = inner
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        queue.drain(..).collect()
    };
    if pending.is_empty() {
        return;
    }

    let taken: usize = pending.iter().map(|p| p.batch.events.len()).sum();
    let batches: Vec<FlushBatch> = pending.iter().map(|p| p.batch.clone()).collect();

    match sink.persist(batches).await {
        Ok(ids) => {
            for (entry, batch_ids) in pending.into_iter().zip(ids) {
                let _ = entry.reply.send(Ok(batch_ids));
            }
        }
        Err(e) => {
            error!(error = %e, "event buffer flush failed");
            let message = e.to_string();
            for entry in pending {
                let _ = entry.reply.send(Err(BufferError::Store(message.clone())));
            }
        }
    }

    inner.queued_items.fetch_sub(taken, Ordering::SeqCst);
}

/// Postgres-backed sink. Appends of one cycle share a transaction; per-run
/// sequences are assigned under a row lock on the run so order is stable
/// under concurrent flushes.
pub struct PgEventSink {
    pool: PgPool,
}

impl PgEventSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventSink for PgEventSink {
    async fn persist(&self, batches: Vec<FlushBatch>) -> Result<Vec<Vec<Uuid>>, SinkError> {
        let mut tx = self.pool.begin().await?;
        let mut out = Vec::with_capacity(batches.len());

        for batch in &batches {
            let locked: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM runs WHERE id = $1 FOR UPDATE")
                .bind(batch.run_id)
                .fetch_optional(&mut *tx)
                .await?;
            if locked.is_none() {
                return Err(SinkError::RunNotFound(batch.run_id));
            }

            let (mut next_seq,): (i64,) = sqlx::query_as(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM run_events WHERE run_id = $1",
            )
            .bind(batch.run_id)
            .fetch_one(&mut *tx)
            .await?;

            let mut ids = Vec::with_capacity(batch.events.len());
            for event in &batch.events {
                let (id,): (Uuid,) = sqlx::query_as(
                    r#"
                    INSERT INTO run_events (id, run_id, event_type, payload, sequence, created_at)
                    VALUES (gen_random_uuid(), $1, $2, $3, $4, NOW())
                    RETURNING id
                    "#,
                )
                .bind(batch.run_id)
                .bind(&event.event_type)
                .bind(&event.payload)
                .bind(next_seq)
                .fetch_one(&mut *tx)
                .await?;
                ids.push(id);
                next_seq += 1;
            }
            out.push(ids);
        }

        tx.commit().await?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory sink recording events in arrival order.
    struct MemorySink {
        written: Mutex<Vec<(Uuid, String)>>,
        fail: AtomicBool,
    }

    impl MemorySink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                written: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            })
        }

        fn event_types_for(&self, run_id: Uuid) -> Vec<String> {
            self.written
                .lock()
                .unwrap()
                .iter()
                .filter(|(r, _)| *r == run_id)
                .map(|(_, t)| t.clone())
                .collect()
        }
    }

    #[async_trait]
    impl EventSink for MemorySink {
        async fn persist(&self, batches: Vec<FlushBatch>) -> Result<Vec<Vec<Uuid>>, SinkError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SinkError::RunNotFound(Uuid::nil()));
            }
            let mut written = self.written.lock().unwrap();
            let mut out = Vec::new();
            for batch in &batches {
                let mut ids = Vec::new();
                for event in &batch.events {
                    written.push((batch.run_id, event.event_type.clone()));
                    ids.push(Uuid::new_v4());
                }
                out.push(ids);
            }
            Ok(out)
        }
    }

    fn events(types: &[&str]) -> Vec<NewRunEvent> {
        types
            .iter()
            .map(|t| NewRunEvent {
                event_type: t.to_string(),
                payload: serde_json::json!({}),
            })
            .collect()
    }

    fn shutdown_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn flush_now_returns_one_id_per_event() {
        let buffer = EventBuffer::new(100, 50);
        let sink = MemorySink::new();
        let (_tx, rx) = shutdown_pair();
        buffer.spawn_flusher(sink.clone(), Duration::from_millis(20), rx);

        let run = Uuid::new_v4();
        let ticket = buffer
            .append(run, Uuid::nil(), "alice".to_string(), events(&["a", "b", "c"]))
            .unwrap();
        let ids = buffer.flush_now(ticket).await.unwrap();

        assert_eq!(ids.len(), 3);
        assert_eq!(sink.event_types_for(run), vec!["a", "b", "c"]);
        assert_eq!(buffer.queued(), 0);
    }

    #[tokio::test]
    async fn per_run_order_is_preserved_across_appends() {
        let buffer = EventBuffer::new(100, 50);
        let sink = MemorySink::new();
        let (_tx, rx) = shutdown_pair();
        buffer.spawn_flusher(sink.clone(), Duration::from_millis(20), rx);

        let run = Uuid::new_v4();
        let t1 = buffer
            .append(run, Uuid::nil(), "alice".to_string(), events(&["first", "second"]))
            .unwrap();
        let t2 = buffer
            .append(run, Uuid::nil(), "alice".to_string(), events(&["third"]))
            .unwrap();

        buffer.flush_now(t1).await.unwrap();
        buffer.flush_now(t2).await.unwrap();

        assert_eq!(sink.event_types_for(run), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn append_fails_fast_at_capacity() {
        let buffer = EventBuffer::new(2, 100);
        let run = Uuid::new_v4();

        buffer
            .append(run, Uuid::nil(), "alice".to_string(), events(&["a", "b"]))
            .unwrap();
        let err = buffer
            .append(run, Uuid::nil(), "alice".to_string(), events(&["c"]))
            .unwrap_err();
        assert!(matches!(err, BufferError::AtCapacity));
    }

    #[tokio::test]
    async fn drain_empties_queue_and_rejects_new_appends() {
        let buffer = EventBuffer::new(100, 50);
        let sink = MemorySink::new();
        let (_tx, rx) = shutdown_pair();
        buffer.spawn_flusher(sink.clone(), Duration::from_millis(20), rx);

        let run = Uuid::new_v4();
        buffer
            .append(run, Uuid::nil(), "alice".to_string(), events(&["a"]))
            .unwrap();

        assert!(buffer.drain(Duration::from_secs(2)).await);
        assert_eq!(buffer.queued(), 0);

        let err = buffer
            .append(run, Uuid::nil(), "alice".to_string(), events(&["b"]))
            .unwrap_err();
        assert!(matches!(err, BufferError::Draining));
    }

    #[tokio::test]
    async fn sink_failure_propagates_to_the_ticket() {
        let buffer = EventBuffer::new(100, 50);
        let sink = MemorySink::new();
        sink.fail.store(true, Ordering::SeqCst);
        let (_tx, rx) = shutdown_pair();
        buffer.spawn_flusher(sink.clone(), Duration::from_millis(20), rx);

        let ticket = buffer
            .append(Uuid::new_v4(), Uuid::nil(), "alice".to_string(), events(&["a"]))
            .unwrap();
        let err = buffer.flush_now(ticket).await.unwrap_err();
        assert!(matches!(err, BufferError::Store(_)));
    }

    #[tokio::test]
    async fn shutdown_signal_flushes_and_stops() {
        let buffer = EventBuffer::new(100, 1000);
        let sink = MemorySink::new();
        let (tx, rx) = shutdown_pair();
        // Long interval so only the shutdown path can flush.
        let handle = buffer.spawn_flusher(sink.clone(), Duration::from_secs(3600), rx);

        // Let the flusher pass its initial immediate tick before queueing.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let run = Uuid::new_v4();
        buffer
            .append(run, Uuid::nil(), "alice".to_string(), events(&["late"]))
            .unwrap();

        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(sink.event_types_for(run), vec!["late"]);
        assert!(buffer.is_draining());
    }
}
