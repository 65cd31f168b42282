mod setup;

use chrono::Duration;
use substrate_core::inbox::{Inbox, ReceiveResult};
use substrate_postgres::PgInboxRepository;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn new_inbox(pool: sqlx::PgPool) -> Inbox<PgInboxRepository> {
    Inbox::new(PgInboxRepository::new(pool))
}

#[tokio::test]
async fn receive_is_idempotent_per_consumer() {
    let Some(pool) = setup::connect_to_database().await else {
        return;
    };

    let inbox = new_inbox(pool);
    let cancel = CancellationToken::new();
    let event_id = Uuid::new_v4();

    let first = inbox
        .receive(
            event_id,
            "svc-a",
            "OrderShipped",
            b"{}".to_vec(),
            None,
            None,
            Duration::minutes(5),
            &cancel,
        )
        .await
        .expect("first receive should succeed");
    assert_eq!(first, ReceiveResult::Accepted);

    inbox
        .complete(vec![(event_id, "svc-a".to_string())], &cancel)
        .await
        .expect("complete should succeed");

    let duplicate = inbox
        .receive(
            event_id,
            "svc-a",
            "OrderShipped",
            b"{}".to_vec(),
            None,
            None,
            Duration::minutes(5),
            &cancel,
        )
        .await
        .expect("second receive should succeed");
    assert_eq!(duplicate, ReceiveResult::Duplicate);

    let other_consumer = inbox
        .receive(
            event_id,
            "svc-b",
            "OrderShipped",
            b"{}".to_vec(),
            None,
            None,
            Duration::minutes(5),
            &cancel,
        )
        .await
        .expect("receive for a different consumer should succeed");
    assert_eq!(other_consumer, ReceiveResult::Accepted);
}

#[tokio::test]
async fn receive_while_leased_is_held_as_processing() {
    let Some(pool) = setup::connect_to_database().await else {
        return;
    };

    let inbox = new_inbox(pool);
    let cancel = CancellationToken::new();
    let event_id = Uuid::new_v4();

    inbox
        .receive(
            event_id,
            "svc-a",
            "OrderShipped",
            b"{}".to_vec(),
            None,
            None,
            Duration::minutes(5),
            &cancel,
        )
        .await
        .expect("first receive should succeed");

    let held = inbox
        .receive(
            event_id,
            "svc-a",
            "OrderShipped",
            b"{}".to_vec(),
            None,
            None,
            Duration::minutes(5),
            &cancel,
        )
        .await
        .expect("second receive should succeed");
    assert_eq!(held, ReceiveResult::Processing);
}
