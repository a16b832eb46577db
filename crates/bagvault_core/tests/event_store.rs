use bagvault_core::db::open_db_in_memory;
use bagvault_core::model::event::NewEvent;
use bagvault_core::repo::event_store::{EventQuery, EventStore, SqliteEventStore};
use bagvault_core::EventType;
use serde_json::json;
use uuid::Uuid;

fn event(event_type: EventType, aggregate: Uuid) -> NewEvent {
    NewEvent::new(event_type, aggregate, json!({ "source": "test" }))
}

#[test]
fn aggregate_sequences_are_independent_and_gap_free() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteEventStore::new(&conn);
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();

    store.append(&event(EventType::ProjectCreated, first)).unwrap();
    store.append(&event(EventType::ProjectCreated, second)).unwrap();
    store.append(&event(EventType::PackagingStarted, first)).unwrap();
    let last = store.append(&event(EventType::PackagingStarted, second)).unwrap();

    assert_eq!(last.seq, 4);
    assert_eq!(last.aggregate_seq, 2);
    assert_eq!(store.latest_seq().unwrap(), 4);

    let history = store.history(first).unwrap();
    let sequences: Vec<i64> = history.iter().map(|event| event.aggregate_seq).collect();
    let globals: Vec<i64> = history.iter().map(|event| event.seq).collect();
    assert_eq!(sequences, vec![1, 2]);
    assert_eq!(globals, vec![1, 3]);
    assert_eq!(history[0].payload["source"], "test");
}

#[test]
fn created_at_never_moves_backwards_within_an_aggregate() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteEventStore::new(&conn);
    let aggregate = Uuid::new_v4();

    let early = store
        .append_at(&event(EventType::ProjectCreated, aggregate), 10_000)
        .unwrap();
    let skewed = store
        .append_at(&event(EventType::PackagingStarted, aggregate), 5_000)
        .unwrap();

    assert_eq!(early.created_at, 10_000);
    assert_eq!(skewed.created_at, 10_000);
}

#[test]
fn stored_events_reject_update_and_delete() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteEventStore::new(&conn);
    let stored = store
        .append(&event(EventType::ProjectCreated, Uuid::new_v4()))
        .unwrap();

    let update = conn.execute(
        "UPDATE events SET payload = '{}' WHERE seq = ?1;",
        [stored.seq],
    );
    let delete = conn.execute("DELETE FROM events WHERE seq = ?1;", [stored.seq]);

    assert!(update.unwrap_err().to_string().contains("append-only"));
    assert!(delete.unwrap_err().to_string().contains("append-only"));
    assert_eq!(store.history(stored.aggregate_uuid).unwrap(), vec![stored]);
}

#[test]
fn list_pages_with_cursor_and_filters() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteEventStore::new(&conn);
    let project = Uuid::new_v4();
    let snapshot = Uuid::new_v4();
    for _ in 0..3 {
        store.append(&event(EventType::PackageValidated, project)).unwrap();
    }
    store.append(&event(EventType::AnomalyDetected, snapshot)).unwrap();
    store.append(&event(EventType::PackageValidated, project)).unwrap();

    let page = store
        .list(&EventQuery {
            after_seq: Some(1),
            limit: Some(2),
            ..EventQuery::default()
        })
        .unwrap();
    let seqs: Vec<i64> = page.iter().map(|event| event.seq).collect();
    assert_eq!(seqs, vec![2, 3]);

    let validated = store
        .list(&EventQuery {
            event_type: Some(EventType::PackageValidated),
            after_seq: Some(3),
            ..EventQuery::default()
        })
        .unwrap();
    assert_eq!(validated.len(), 1);
    assert_eq!(validated[0].seq, 5);

    let anomalies = store
        .list(&EventQuery {
            aggregate_uuid: Some(snapshot),
            ..EventQuery::default()
        })
        .unwrap();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].event_type, EventType::AnomalyDetected);
}

#[test]
fn batch_append_is_all_or_nothing() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteEventStore::new(&conn);
    let accepted = Uuid::new_v4();
    let rejected = Uuid::new_v4();
    conn.execute_batch(&format!(
        "CREATE TEMP TRIGGER reject_aggregate
         BEFORE INSERT ON events
         WHEN NEW.aggregate_uuid = '{rejected}'
         BEGIN
             SELECT RAISE(ABORT, 'rejected aggregate');
         END;"
    ))
    .unwrap();

    let result = store.append_batch(&[
        event(EventType::ProjectCreated, accepted),
        event(EventType::PackagingStarted, accepted),
        event(EventType::ProjectCreated, rejected),
    ]);

    assert!(result.is_err());
    assert_eq!(store.latest_seq().unwrap(), 0);
    assert!(store.history(accepted).unwrap().is_empty());

    let stored = store
        .append_batch(&[
            event(EventType::ProjectCreated, accepted),
            event(EventType::PackagingStarted, accepted),
        ])
        .unwrap();
    let types: Vec<EventType> = stored.iter().map(|event| event.event_type).collect();
    assert_eq!(types, vec![EventType::ProjectCreated, EventType::PackagingStarted]);
    assert_eq!(stored[1].aggregate_seq, 2);
}
