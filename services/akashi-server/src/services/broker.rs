use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use serde::Deserialize;
use sqlx::postgres::PgListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Channels the broker listens on.
pub const DECISIONS_CHANNEL: &str = "akashi_decisions";
pub const CONFLICTS_CHANNEL: &str = "akashi_conflicts";

/// Per-subscriber buffer depth. A subscriber that falls this far behind
/// loses events rather than stalling the fan-out loop.
const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct BrokerEvent {
    pub channel: String,
    pub payload: String,
}

struct Subscriber {
    id: Uuid,
    tx: mpsc::Sender<BrokerEvent>,
}

#[derive(Debug, Deserialize)]
struct OrgEnvelope {
    org_id: Uuid,
}

/// Bridges Postgres LISTEN/NOTIFY to per-organization subscriber channels.
/// Fan-out happens under the read lock; register/unregister take the write
/// lock.
pub struct NotificationBroker {
    subscribers: RwLock<HashMap<Uuid, Vec<Subscriber>>>,
}

impl NotificationBroker {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a subscriber for one organization. The zero UUID is a
    /// legitimate org in single-tenant deployments.
    pub fn subscribe(&self, org_id: Uuid) -> (Uuid, mpsc::Receiver<BrokerEvent>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = Uuid::new_v4();
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers
            .entry(org_id)
            .or_default()
            .push(Subscriber { id, tx });
        debug!(%org_id, subscriber = %id, "subscriber registered");
        (id, rx)
    }

    pub fn unsubscribe(&self, org_id: Uuid, subscriber_id: Uuid) {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(list) = subscribers.get_mut(&org_id) {
            list.retain(|s| s.id != subscriber_id);
            if list.is_empty() {
                subscribers.remove(&org_id);
            }
        }
        debug!(%org_id, subscriber = %subscriber_id, "subscriber removed");
    }

    pub fn subscriber_count(&self, org_id: Uuid) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&org_id)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Route one notification payload. Payloads whose org cannot be parsed
    /// are dropped so they can never leak to another tenant; full subscriber
    /// buffers lose the event.
    pub fn publish(&self, channel: &str, payload: &str) {
        let org_id = match serde_json::from_str::<OrgEnvelope>(payload) {
            Ok(envelope) => envelope.org_id,
            Err(e) => {
                warn!(channel, error = %e, "dropping notification without parseable org_id");
                return;
            }
        };

        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(list) = subscribers.get(&org_id) else {
            return;
        };
        for subscriber in list {
            let event = BrokerEvent {
                channel: channel.to_string(),
                payload: payload.to_string(),
            };
            if let Err(e) = subscriber.tx.try_send(event) {
                debug!(%org_id, subscriber = %subscriber.id, error = %e, "subscriber lost event");
            }
        }
    }

    /// Background loop: LISTEN on both channels and fan incoming payloads
    /// out to subscribers until shutdown.
    pub async fn run(
        &self,
        database_url: String,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let mut listener = match PgListener::connect(&database_url).await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(error = %e, "broker failed to connect; retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            if let Err(e) = listener
                .listen_all([DECISIONS_CHANNEL, CONFLICTS_CHANNEL])
                .await
            {
                warn!(error = %e, "broker failed to LISTEN; retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            info!("notification broker listening");

            loop {
                tokio::select! {
                    notification = listener.recv() => {
                        match notification {
                            Ok(n) => self.publish(n.channel(), n.payload()),
                            Err(e) => {
                                warn!(error = %e, "broker connection lost; reconnecting");
                                break;
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("notification broker stopped");
                            return;
                        }
                    }
                }
            }
        }
    }
}

impl Default for NotificationBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame a broker event for the wire per the SSE spec: every payload line
/// gets its own `data: ` prefix and the event ends with a blank line.
pub fn format_sse(event: &BrokerEvent) -> String {
    let mut out = format!("event: {}\n", event.channel);
    for line in event.payload.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(org: Uuid) -> String {
        format!(r#"{{"org_id":"{}","decision_id":"{}"}}"#, org, Uuid::new_v4())
    }

    #[tokio::test]
    async fn events_reach_only_matching_org() {
        let broker = NotificationBroker::new();
        let org_a = Uuid::new_v4();
        let org_b = Uuid::new_v4();
        let (_id_a, mut rx_a) = broker.subscribe(org_a);
        let (_id_b, mut rx_b) = broker.subscribe(org_b);

        broker.publish(DECISIONS_CHANNEL, &payload(org_a));

        let event = rx_a.try_recv().unwrap();
        assert_eq!(event.channel, DECISIONS_CHANNEL);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped_for_everyone() {
        let broker = NotificationBroker::new();
        let org = Uuid::new_v4();
        let (_id, mut rx) = broker.subscribe(org);

        broker.publish(DECISIONS_CHANNEL, "not json at all");
        broker.publish(DECISIONS_CHANNEL, r#"{"no_org":"here"}"#);

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn zero_uuid_org_receives_events() {
        let broker = NotificationBroker::new();
        let (_id, mut rx) = broker.subscribe(Uuid::nil());

        broker.publish(CONFLICTS_CHANNEL, &payload(Uuid::nil()));

        assert_eq!(rx.try_recv().unwrap().channel, CONFLICTS_CHANNEL);
    }

    #[tokio::test]
    async fn slow_subscriber_loses_events_without_blocking() {
        let broker = NotificationBroker::new();
        let org = Uuid::new_v4();
        let (_id, mut rx) = broker.subscribe(org);

        for _ in 0..(SUBSCRIBER_BUFFER + 10) {
            broker.publish(DECISIONS_CHANNEL, &payload(org));
        }

        // The buffer holds exactly its depth; the overflow was dropped.
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);
    }

    #[tokio::test]
    async fn unsubscribe_closes_the_channel() {
        let broker = NotificationBroker::new();
        let org = Uuid::new_v4();
        let (id, mut rx) = broker.subscribe(org);
        assert_eq!(broker.subscriber_count(org), 1);

        broker.unsubscribe(org, id);
        assert_eq!(broker.subscriber_count(org), 0);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn sse_framing_prefixes_every_line() {
        let event = BrokerEvent {
            channel: DECISIONS_CHANNEL.to_string(),
            payload: "{\"org_id\":\"x\",\n\"note\":\"multi\nline\"}".to_string(),
        };
        let framed = format_sse(&event);
        assert_eq!(
            framed,
            "event: akashi_decisions\ndata: {\"org_id\":\"x\",\ndata: \"note\":\"multi\ndata: line\"}\n\n"
        );
    }
}
