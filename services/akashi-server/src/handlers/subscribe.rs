use std::sync::Arc;

use actix_web::{get, web, HttpResponse};
use akashi_common::HttpError;
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::middleware::Identity;
use crate::services::broker::{format_sse, NotificationBroker};

/// Removes the subscriber when the SSE stream is dropped, however the client
/// disconnects.
struct SubscriptionGuard {
    broker: Arc<NotificationBroker>,
    org_id: Uuid,
    subscriber_id: Uuid,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.broker.unsubscribe(self.org_id, self.subscriber_id);
    }
}

/// Live per-org decision and conflict events as `text/event-stream`.
#[get("/v1/subscribe")]
pub async fn subscribe(
    identity: Identity,
    broker: web::Data<NotificationBroker>,
) -> Result<HttpResponse, HttpError> {
    let claims = identity.0;
    let org_id = claims.org_id;
    let (subscriber_id, rx) = broker.subscribe(org_id);
    let guard = SubscriptionGuard {
        broker: broker.clone().into_inner(),
        org_id,
        subscriber_id,
    };

    let events = ReceiverStream::new(rx).map(move |event| {
        let _ = &guard;
        Ok::<web::Bytes, actix_web::Error>(web::Bytes::from(format_sse(&event)))
    });
    // Leading comment line lets clients observe the stream is open.
    let opening = futures::stream::once(async {
        Ok::<web::Bytes, actix_web::Error>(web::Bytes::from_static(b": subscribed\n\n"))
    });

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .streaming(opening.chain(events)))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(subscribe);
}
