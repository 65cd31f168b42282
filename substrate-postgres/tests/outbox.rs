mod setup;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use substrate_core::event::{Event, Message};
use substrate_core::outbox::{FailedOutboxEvent, Outbox};
use substrate_core::JsonCodec;
use substrate_postgres::PgOutboxRepository;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderShipped {
    order_id: u64,
}

impl Message for OrderShipped {
    fn name(&self) -> &'static str {
        "OrderShipped"
    }
}

fn new_outbox(pool: sqlx::PgPool) -> Outbox<OrderShipped, PgOutboxRepository, JsonCodec<OrderShipped>> {
    Outbox::new(PgOutboxRepository::new(pool), JsonCodec::new())
}

#[tokio::test]
async fn enqueue_then_dequeue_then_complete_drains_the_queue() {
    let Some(pool) = setup::connect_to_database().await else {
        return;
    };

    let outbox = new_outbox(pool);
    let cancel = CancellationToken::new();

    let ids = outbox
        .enqueue(
            vec![
                Event::Integration(OrderShipped { order_id: 1 }.into()),
                Event::Integration(OrderShipped { order_id: 2 }.into()),
            ],
            &cancel,
        )
        .await
        .expect("enqueue should succeed");
    assert_eq!(ids.len(), 2);

    let claimed = outbox
        .dequeue(10, Duration::minutes(5), &cancel)
        .await
        .expect("dequeue should succeed");
    assert_eq!(claimed.len(), 2);

    outbox
        .complete(claimed.iter().map(|c| c.event_id).collect(), &cancel)
        .await
        .expect("complete should succeed");

    let second_dequeue = outbox
        .dequeue(10, Duration::minutes(5), &cancel)
        .await
        .expect("second dequeue should succeed");
    assert!(second_dequeue.is_empty());
}

#[tokio::test]
async fn failed_events_are_not_redequeued_before_their_backoff_elapses() {
    let Some(pool) = setup::connect_to_database().await else {
        return;
    };

    let outbox = new_outbox(pool);
    let cancel = CancellationToken::new();

    outbox
        .enqueue(
            vec![Event::Integration(OrderShipped { order_id: 42 }.into())],
            &cancel,
        )
        .await
        .expect("enqueue should succeed");

    let claimed = outbox
        .dequeue(10, Duration::minutes(5), &cancel)
        .await
        .expect("dequeue should succeed");
    assert_eq!(claimed.len(), 1);

    outbox
        .fail(
            vec![FailedOutboxEvent {
                event_id: claimed[0].event_id,
                error_message: "boom".to_string(),
            }],
            &cancel,
        )
        .await
        .expect("fail should succeed");

    let immediate_retry = outbox
        .dequeue(10, Duration::minutes(5), &cancel)
        .await
        .expect("dequeue should succeed");
    assert!(
        immediate_retry.is_empty(),
        "the first backoff window has not elapsed yet"
    );
}
