// Copyright (c) the TimeVault project authors.
// Licensed under the MIT License.

//! Multi-stream recovery: decomposition shapes, commutativity under
//! stream reordering, and the raw stream-buffer handle.

mod mock_platform;

use std::sync::Arc;
use std::time::Duration;

use mock_platform::{clocked_i32, service_over, Fault, MockArchive};
use pretty_assertions::assert_eq;
use timevault_client_engine::query::{DataTable, QueryRequest, TimeRange};
use timevault_client_engine::ErrorKind;

fn request(sources: &[&str], begin: i64, end: i64) -> QueryRequest {
    QueryRequest::new(TimeRange::new(begin, end), sources.iter().copied())
}

fn eight_source_records() -> Vec<timevault_client_engine::query::RawRecord> {
    ["A", "B", "C", "D", "E", "F", "G", "H"]
        .iter()
        .enumerate()
        .map(|(i, source)| {
            let base = i as i32 * 10;
            clocked_i32(
                source,
                0,
                100_000_000,
                vec![base, base + 1, base + 2, base + 3],
            )
        })
        .collect()
}

fn assert_tables_equal(left: &DataTable, right: &DataTable) {
    assert_eq!(left.row_count(), right.row_count());
    assert_eq!(left.column_names(), right.column_names());
    assert_eq!(left.timestamps(), right.timestamps());
    for row in 0..left.row_count() {
        for column in 0..left.column_count() {
            assert_eq!(
                left.value(row, column).unwrap(),
                right.value(row, column).unwrap(),
                "cell ({row}, {column}) differs"
            );
        }
    }
}

#[test]
fn eight_sources_fan_out_over_four_streams() {
    let archive = Arc::new(MockArchive::new().with_records(eight_source_records()));
    let service = service_over(
        Arc::clone(&archive),
        r#"{ "stream": { "concurrency": { "pivot_size": 1, "max_streams": 4 } } }"#,
    );

    let sources = ["A", "B", "C", "D", "E", "F", "G", "H"];
    let outcome = service
        .query_data(request(&sources, 0, 1_000_000_000))
        .unwrap();

    // Decomposer output: four horizontal slices over the full range.
    let expected_groups: Vec<Vec<String>> = vec![
        vec!["A".into(), "B".into()],
        vec!["C".into(), "D".into()],
        vec!["E".into(), "F".into()],
        vec!["G".into(), "H".into()],
    ];
    assert_eq!(outcome.sub_requests.len(), 4);
    for (sub, expected) in outcome.sub_requests.iter().zip(&expected_groups) {
        assert_eq!(&sub.sources, expected);
        assert_eq!(sub.range, TimeRange::new(0, 1_000_000_000));
    }

    // All four streams were actually opened.
    let mut opened: Vec<Vec<String>> = archive
        .opened_requests()
        .into_iter()
        .map(|sub| sub.sources)
        .collect();
    opened.sort();
    assert_eq!(opened, expected_groups);

    assert_eq!(outcome.records_received, 8);
    assert_eq!(outcome.table.row_count(), 4);
    assert_eq!(outcome.table.column_count(), 8);
}

#[test]
fn multi_stream_recovery_matches_single_stream() {
    let multi = service_over(
        Arc::new(MockArchive::new().with_records(eight_source_records())),
        r#"{ "stream": { "concurrency": { "pivot_size": 1, "max_streams": 4 } } }"#,
    );
    let single = service_over(
        Arc::new(MockArchive::new().with_records(eight_source_records())),
        r#"{ "stream": { "concurrency": { "active": false } } }"#,
    );

    let sources = ["A", "B", "C", "D", "E", "F", "G", "H"];
    let multi_outcome = multi.query_data(request(&sources, 0, 1_000_000_000)).unwrap();
    let single_outcome = single
        .query_data(request(&sources, 0, 1_000_000_000))
        .unwrap();

    assert_eq!(single_outcome.sub_requests.len(), 1);
    assert_tables_equal(&multi_outcome.table, &single_outcome.table);
    assert_eq!(
        multi_outcome.records_received,
        single_outcome.records_received
    );
    assert_eq!(multi_outcome.bytes_processed, single_outcome.bytes_processed);
}

#[test]
fn vertical_decomposition_reassembles_across_time_slices() {
    // Two sources over eight streams: too few sources for the horizontal
    // and grid strategies, so the range splits into eight time slices and
    // the two disjoint clocks land in different sub-requests.
    let records = vec![
        clocked_i32("A", 0, 50, vec![1, 2]),
        clocked_i32("B", 0, 50, vec![5, 6]),
        clocked_i32("A", 2_000_000_000, 50, vec![3, 4]),
        clocked_i32("B", 2_000_000_000, 50, vec![7, 8]),
    ];
    let multi = service_over(
        Arc::new(MockArchive::new().with_records(records.clone())),
        r#"{ "stream": { "concurrency": { "pivot_size": 1, "max_streams": 8 } } }"#,
    );
    let single = service_over(
        Arc::new(MockArchive::new().with_records(records)),
        r#"{ "stream": { "concurrency": { "active": false } } }"#,
    );

    let multi_outcome = multi
        .query_data(request(&["A", "B"], 0, 4_000_000_000))
        .unwrap();
    let single_outcome = single
        .query_data(request(&["A", "B"], 0, 4_000_000_000))
        .unwrap();

    assert_eq!(multi_outcome.sub_requests.len(), 8);
    assert!(multi_outcome
        .sub_requests
        .windows(2)
        .all(|pair| pair[0].range.end == pair[1].range.begin));
    assert_eq!(multi_outcome.table.row_count(), 4);
    assert_tables_equal(&multi_outcome.table, &single_outcome.table);
}

#[test]
fn max_streams_of_one_never_decomposes() {
    let archive = Arc::new(MockArchive::new().with_records(eight_source_records()));
    let service = service_over(
        Arc::clone(&archive),
        r#"{ "stream": { "concurrency": { "pivot_size": 1, "max_streams": 1 } } }"#,
    );

    let sources = ["A", "B", "C", "D", "E", "F", "G", "H"];
    let outcome = service
        .query_data(request(&sources, 0, 1_000_000_000))
        .unwrap();
    assert_eq!(outcome.sub_requests.len(), 1);
    assert_eq!(archive.opened_requests().len(), 1);
    assert_eq!(outcome.table.row_count(), 4);
}

#[test]
fn stream_buffer_hands_out_raw_records() {
    let archive = Arc::new(MockArchive::new().with_records(vec![
        clocked_i32("A", 0, 50, vec![1, 2]),
        clocked_i32("B", 0, 50, vec![5, 6]),
        clocked_i32("A", 200, 50, vec![3, 4]),
    ]));
    let service = service_over(Arc::clone(&archive), "");

    let stream = service
        .query_data_stream(request(&["A", "B"], 0, 300))
        .unwrap();
    assert!(!stream.is_started());

    let stats = stream.start_and_await(Duration::from_secs(5)).unwrap();
    assert_eq!(stats.records, 3);

    let records: Vec<_> = stream.records().collect();
    assert_eq!(records.len(), 3);
    let mut sources: Vec<_> = records.iter().map(|r| r.source.clone()).collect();
    sources.sort();
    assert_eq!(sources, vec!["A", "A", "B"]);
}

#[test]
fn stream_buffer_close_cancels_recovery() {
    let archive = Arc::new(
        MockArchive::new()
            .with_records(vec![clocked_i32("A", 0, 50, vec![1, 2])])
            .with_fault(Fault::StallAtEnd),
    );
    let service = service_over(
        Arc::clone(&archive),
        r#"{ "timeout": { "active": false } }"#,
    );

    let stream = service.query_data_stream(request(&["A"], 0, 200)).unwrap();
    stream.start().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    stream.close();

    let err = stream.await_completion(Duration::from_secs(5)).unwrap_err();
    assert_eq!(err.kind(), &ErrorKind::Cancelled);
    // The buffer reports drained-and-done after the close.
    assert_eq!(stream.next_record(Duration::from_millis(100)).unwrap(), None);
}
