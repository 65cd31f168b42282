mod setup;

use serde::{Deserialize, Serialize};
use substrate_core::event::{Event, Message, VersionSelect};
use substrate_core::{EventStore, JsonCodec};
use substrate_postgres::{PgDomainEventRepository, PgSnapshotRepository};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum AccountEvent {
    Opened { balance: i64 },
    Deposited { amount: i64 },
}

impl Message for AccountEvent {
    fn name(&self) -> &'static str {
        match self {
            AccountEvent::Opened { .. } => "AccountOpened",
            AccountEvent::Deposited { .. } => "AccountDeposited",
        }
    }
}

fn new_store(
    pool: sqlx::PgPool,
) -> EventStore<AccountEvent, PgDomainEventRepository, PgSnapshotRepository, JsonCodec<AccountEvent>> {
    EventStore::new(
        PgDomainEventRepository::new(pool.clone()),
        PgSnapshotRepository::new(pool),
        JsonCodec::new(),
    )
}

#[tokio::test]
async fn append_then_read_round_trips() {
    let Some(pool) = setup::connect_to_database().await else {
        return;
    };

    let store = new_store(pool);
    let cancel = CancellationToken::new();
    let stream_id = Uuid::new_v4();

    let events = vec![
        Event::Domain(AccountEvent::Opened { balance: 100 }.into()),
        Event::Domain(AccountEvent::Deposited { amount: 50 }.into()),
    ];

    let result = store
        .append_to_stream(stream_id, "account".to_string(), events, None, &cancel)
        .await
        .expect("append should succeed on a fresh stream");

    assert_eq!(result.prior_version, -1);
    assert_eq!(result.next_version, 1);

    let read = store
        .read_stream(stream_id, VersionSelect::All, &cancel)
        .await
        .expect("read should succeed");

    assert_eq!(read.len(), 2);
    assert_eq!(read[0].stream_version, 0);
    assert_eq!(read[1].stream_version, 1);
    assert_eq!(read[0].payload, AccountEvent::Opened { balance: 100 });

    assert_eq!(
        store
            .stream_version(stream_id, &cancel)
            .await
            .expect("stream_version should succeed"),
        1
    );
}

#[tokio::test]
async fn concurrent_appends_with_the_same_expected_version_yield_one_winner() {
    let Some(pool) = setup::connect_to_database().await else {
        return;
    };

    let store = new_store(pool);
    let cancel = CancellationToken::new();
    let stream_id = Uuid::new_v4();

    store
        .append_to_stream(
            stream_id,
            "account".to_string(),
            vec![Event::Domain(AccountEvent::Opened { balance: 0 }.into())],
            None,
            &cancel,
        )
        .await
        .expect("seed append should succeed");

    let racer = |store: &EventStore<_, _, _, _>| {
        let store = store.clone();
        let cancel = cancel.clone();
        async move {
            store
                .append_to_stream(
                    stream_id,
                    "account".to_string(),
                    vec![Event::Domain(AccountEvent::Deposited { amount: 1 }.into())],
                    Some(0),
                    &cancel,
                )
                .await
        }
    };

    let (first, second) = tokio::join!(racer(&store), racer(&store));

    let successes = [&first, &second].into_iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one racing append should win");
}
