//! Client facade integration tests.
//!
//! Run with: cargo test --test client
//!
//! Drives the public API against the in-memory store; no external
//! dependencies required.

mod common;

use std::io::Write;

use common::{alternating, events_of, memory_client};
use esclient::codec::{encode, load_file};
use esclient::reader::{collect, MAX_BATCH_SIZE};
use esclient::{
    ClientError, Event, ExpectedVersion, Position, ReadOptions, Removal, StreamPosition,
};
use serde_json::json;

fn types(events: &[Event]) -> Vec<&str> {
    events.iter().map(|e| e.event_type.as_str()).collect()
}

#[test]
fn test_jsontest_scenario() {
    let (client, _store) = memory_client();
    let events = vec![
        Event::new("A", json!({ "v": 1 })),
        Event::new("B", json!({ "v": 2 })),
    ];
    client
        .append_blocking("jsontest", events, ExpectedVersion::Any)
        .unwrap();

    let read = client
        .read_forward_blocking("jsontest", 0, &ReadOptions::default().with_max_count(10))
        .unwrap();
    assert_eq!(types(&read), vec!["A", "B"]);
    assert_eq!(read[0].payload, json!({ "v": 1 }));
    assert_eq!(read[1].payload, json!({ "v": 2 }));
    assert_eq!(read[0].revision, Some(0));
    assert_eq!(read[1].revision, Some(1));
    assert!(read.iter().all(|e| e.stream_id.as_deref() == Some("jsontest")));
}

#[tokio::test]
async fn test_write_then_read_both_directions() {
    let (client, _store) = memory_client();
    let written = events_of(&["a", "b", "c", "d", "e", "f", "g"]);
    let ids: Vec<_> = written.iter().map(|e| e.event_id).collect();

    let result = client
        .append("orders", written, ExpectedVersion::NoStream)
        .await
        .unwrap();
    assert_eq!(result.next_expected_version, 6);

    let options = ReadOptions::default().with_batch_size(3);
    let forward = client.read_forward("orders", 0, &options).await.unwrap();
    assert_eq!(forward.iter().map(|e| e.event_id).collect::<Vec<_>>(), ids);

    let backward = client
        .read_backward("orders", StreamPosition::End, &options)
        .await
        .unwrap();
    let mut reversed = ids.clone();
    reversed.reverse();
    assert_eq!(backward.iter().map(|e| e.event_id).collect::<Vec<_>>(), reversed);
}

#[test]
fn test_batch_size_bounds_for_every_read_mode() {
    let (client, _store) = memory_client();
    client
        .append_blocking("s", events_of(&["a"]), ExpectedVersion::Any)
        .unwrap();

    for batch_size in [0, MAX_BATCH_SIZE + 1] {
        let options = ReadOptions::default().with_batch_size(batch_size);
        let results = [
            client.read_forward_blocking("s", 0, &options),
            client.read_backward_blocking("s", StreamPosition::End, &options),
            client.read_all_forward_blocking(Position::START, &options),
            client.read_all_backward_blocking(Position::END, &options),
        ];
        for result in results {
            assert!(result.unwrap_err().is_invalid_argument());
        }
    }

    for batch_size in [1, MAX_BATCH_SIZE] {
        let options = ReadOptions::default().with_batch_size(batch_size);
        assert_eq!(client.read_forward_blocking("s", 0, &options).unwrap().len(), 1);
        assert_eq!(
            client
                .read_backward_blocking("s", StreamPosition::End, &options)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            client
                .read_all_forward_blocking(Position::START, &options)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            client
                .read_all_backward_blocking(Position::END, &options)
                .unwrap()
                .len(),
            1
        );
    }
}

#[tokio::test]
async fn test_filtered_read_counts() {
    let (client, _store) = memory_client();
    client
        .append("parity", alternating(101), ExpectedVersion::Any)
        .await
        .unwrap();

    let even = client.read_filtered("parity", "even").await.unwrap();
    let odd = client.read_filtered("parity", "odd").await.unwrap();
    assert_eq!(even.len(), 51);
    assert_eq!(odd.len(), 50);
    assert!(even.iter().all(|e| e.event_type == "even"));
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let (client, _store) = memory_client();
    let removal = client
        .delete_stream("never-written", ExpectedVersion::Any)
        .await
        .unwrap();
    assert_eq!(removal, Removal::NotFound);

    client
        .append("doomed", events_of(&["a", "b"]), ExpectedVersion::Any)
        .await
        .unwrap();
    let removal = client
        .delete_stream("doomed", ExpectedVersion::Any)
        .await
        .unwrap();
    assert!(removal.is_removed());
    assert!(client
        .read_forward("doomed", 0, &ReadOptions::default())
        .await
        .unwrap()
        .is_empty());

    let again = client
        .delete_stream("doomed", ExpectedVersion::Any)
        .await
        .unwrap();
    assert!(again.is_not_found());
}

#[tokio::test]
async fn test_soft_deleted_stream_can_be_recreated() {
    let (client, _store) = memory_client();
    client
        .append("cart", events_of(&["a", "b"]), ExpectedVersion::Any)
        .await
        .unwrap();
    client
        .delete_stream("cart", ExpectedVersion::Any)
        .await
        .unwrap();

    let result = client
        .append("cart", events_of(&["c"]), ExpectedVersion::Any)
        .await
        .unwrap();
    assert_eq!(result.next_expected_version, 2);

    let events = client
        .read_forward("cart", 0, &ReadOptions::default())
        .await
        .unwrap();
    assert_eq!(types(&events), vec!["c"]);
}

#[tokio::test]
async fn test_tombstoned_stream_rejects_appends() {
    let (client, _store) = memory_client();
    client
        .append("gone", events_of(&["a"]), ExpectedVersion::Any)
        .await
        .unwrap();
    assert!(client
        .tombstone_stream("gone", ExpectedVersion::Any)
        .await
        .unwrap()
        .is_removed());

    let err = client
        .append("gone", events_of(&["b"]), ExpectedVersion::Any)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::StreamDeleted(_)));
}

#[tokio::test]
async fn test_expected_version_conflict() {
    let (client, _store) = memory_client();
    client
        .append("acct", events_of(&["opened"]), ExpectedVersion::NoStream)
        .await
        .unwrap();

    let err = client
        .append("acct", events_of(&["credited"]), ExpectedVersion::Exact(5))
        .await
        .unwrap_err();
    match err {
        ClientError::ConcurrencyConflict {
            stream, current, ..
        } => {
            assert_eq!(stream, "acct");
            assert_eq!(current, Some(0));
        }
        other => panic!("expected conflict, got {:?}", other),
    }

    client
        .append("acct", events_of(&["credited"]), ExpectedVersion::Exact(0))
        .await
        .unwrap();
    client
        .append("acct", events_of(&["debited"]), ExpectedVersion::StreamExists)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_global_log_interleaves_streams() {
    let (client, _store) = memory_client();
    client
        .append("left", events_of(&["l0"]), ExpectedVersion::Any)
        .await
        .unwrap();
    client
        .append("right", events_of(&["r0"]), ExpectedVersion::Any)
        .await
        .unwrap();
    client
        .append("left", events_of(&["l1"]), ExpectedVersion::Any)
        .await
        .unwrap();

    let forward = client
        .read_all_forward(Position::START, &ReadOptions::default())
        .await
        .unwrap();
    assert_eq!(types(&forward), vec!["l0", "r0", "l1"]);

    let backward = client
        .read_all_backward(Position::END, &ReadOptions::default().with_max_count(2))
        .await
        .unwrap();
    assert_eq!(types(&backward), vec!["l1", "r0"]);

    let nothing = client
        .read_all_backward(Position::START, &ReadOptions::default())
        .await
        .unwrap();
    assert!(nothing.is_empty());
}

#[tokio::test]
async fn test_link_events_resolve_on_request() {
    let (client, _store) = memory_client();
    client
        .append("source", events_of(&["target"]), ExpectedVersion::Any)
        .await
        .unwrap();
    client
        .append(
            "index",
            vec![Event::link_to("source", 0), Event::link_to("source", 9)],
            ExpectedVersion::Any,
        )
        .await
        .unwrap();

    let raw = client
        .read_forward("index", 0, &ReadOptions::default())
        .await
        .unwrap();
    assert_eq!(raw.len(), 2);
    assert!(raw.iter().all(Event::is_link));

    let resolved = client
        .read_forward("index", 0, &ReadOptions::default().with_resolve_links(true))
        .await
        .unwrap();
    assert_eq!(types(&resolved), vec!["target"]);
    assert_eq!(resolved[0].stream_id.as_deref(), Some("source"));
}

#[tokio::test]
async fn test_lazy_reader_stream_from_accessor() {
    let (client, _store) = memory_client();
    client
        .append("lazy", alternating(10), ExpectedVersion::Any)
        .await
        .unwrap();

    let stream = client
        .reader()
        .read_forward("lazy", 4, &ReadOptions::default().with_batch_size(2).with_max_count(3))
        .unwrap();
    let events = collect(stream).await.unwrap();
    let revisions: Vec<_> = events.iter().filter_map(|e| e.revision).collect();
    assert_eq!(revisions, vec![4, 5, 6]);
}

#[tokio::test]
async fn test_unavailable_store_surfaces_connection_error() {
    let (client, store) = memory_client();
    store.set_unavailable(true).await;

    let err = client
        .append("s", events_of(&["a"]), ExpectedVersion::Any)
        .await
        .unwrap_err();
    assert!(err.is_connection_error());
    assert!(err.is_retryable());

    let err = client
        .read_forward("s", 0, &ReadOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_connection_error());
}

#[test]
fn test_blocking_call_from_worker_fails_fast() {
    let (client, _store) = memory_client();
    let inner = client.clone();
    let outcome = client
        .spawn(async move {
            Ok(inner.append_blocking("s", events_of(&["a"]), ExpectedVersion::Any))
        })
        .wait("spawn")
        .unwrap();
    assert!(matches!(outcome, Err(ClientError::BlockingInWorker("append"))));

    // Nothing was submitted on the worker's behalf.
    assert!(client
        .read_forward_blocking("s", 0, &ReadOptions::default())
        .unwrap()
        .is_empty());
}

#[test]
fn test_empty_append_rejected_synchronously() {
    let (client, _store) = memory_client();
    let err = client
        .append_blocking("s", Vec::new(), ExpectedVersion::Any)
        .unwrap_err();
    assert!(err.is_invalid_argument());
}

#[test]
fn test_loaded_file_round_trips_through_store() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"events":[
            {{"type":"created","data":{{"id":1}}}},
            {{"stream":"jsontest","type":"deleted","data":{{"id":1}}}}
        ]}}"#
    )
    .unwrap();

    let events = load_file(file.path(), Some("jsontest")).unwrap();
    let (client, _store) = memory_client();
    client
        .append_blocking("jsontest", events, ExpectedVersion::Any)
        .unwrap();

    let filtered = client.read_filtered_blocking("jsontest", "delete").unwrap();
    assert_eq!(types(&filtered), vec!["deleted"]);

    let all = client
        .read_forward_blocking("jsontest", 0, &ReadOptions::default())
        .unwrap();
    let text = encode(&all).unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(
        value,
        json!({ "events": [
            { "stream": "jsontest", "type": "created", "data": { "id": 1 } },
            { "stream": "jsontest", "type": "deleted", "data": { "id": 1 } }
        ]})
    );
}

#[test]
fn test_missing_file_is_io_error() {
    let err = load_file("/nonexistent/events.json", None).unwrap_err();
    assert!(matches!(err, ClientError::Io(_)));
}
