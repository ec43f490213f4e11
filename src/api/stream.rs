//! Server-Sent Events feed of payment status changes.

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Extension,
};
use futures::{stream, Stream};
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::{api::AppState, auth::CallerIdentity, events::PaymentEvent};

/// Customers see their own payments; admins see every payment.
pub async fn payment_events(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let owner = if caller.is_admin() { None } else { Some(caller.scope()) };
    tracing::debug!(subscriber = %caller.name, "Payment event stream opened");
    Sse::new(event_stream(state.bank.events().subscribe(), owner)).keep_alive(KeepAlive::default())
}

fn event_stream(
    receiver: broadcast::Receiver<PaymentEvent>,
    owner: Option<Uuid>,
) -> impl Stream<Item = Result<Event, axum::Error>> {
    stream::unfold(receiver, move |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) if owner.map_or(true, |id| id == event.user_id) => {
                    let item = Event::default()
                        .event("payment")
                        .id(event.payment_id.to_string())
                        .json_data(&event)
                        .map_err(axum::Error::new);
                    return Some((item, receiver));
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Payment event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PaymentEvents;
    use bankd_core::PaymentStatus;
    use futures::StreamExt;
    use rust_decimal_macros::dec;
    use time::OffsetDateTime;

    fn event(user_id: Uuid) -> PaymentEvent {
        PaymentEvent {
            payment_id: Uuid::new_v4(),
            user_id,
            status: PaymentStatus::Success,
            amount: dec!(10),
            payee: "utility co".to_string(),
            failure_reason: None,
            at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn test_stream_filters_by_owner() {
        let events = PaymentEvents::new();
        let alice = Uuid::new_v4();
        let stream = event_stream(events.subscribe(), Some(alice));
        futures::pin_mut!(stream);

        events.publish(event(Uuid::new_v4()));
        events.publish(event(alice));
        drop(events);

        assert!(stream.next().await.unwrap().is_ok());
        // the sender is gone, so the stream ends after alice's event
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_admin_stream_sees_everything() {
        let events = PaymentEvents::new();
        let stream = event_stream(events.subscribe(), None);
        futures::pin_mut!(stream);

        events.publish(event(Uuid::new_v4()));
        events.publish(event(Uuid::new_v4()));
        drop(events);

        assert_eq!(stream.count().await, 2);
    }
}
