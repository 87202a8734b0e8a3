//! Value history tests: concurrency, pagination, retention, codec.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};

use pghistorian::storage::Continuation;
use pghistorian::{
    Direction, HistoryError, HistoryStorage, PgHistorian, ReadRequest, RetentionPolicy,
    ValueRecord, Variant, VariantType,
};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

pub async fn test_concurrent_writes(historian: &Arc<PgHistorian>) {
    let node_id = "ns=2;s=Concurrent.Counter";
    historian
        .new_historized_node(node_id, RetentionPolicy::unbounded())
        .await
        .expect("register should succeed");

    let base = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    let mut writers = Vec::new();
    for writer in 0..10i64 {
        let historian = Arc::clone(historian);
        writers.push(tokio::spawn(async move {
            for i in 0..50i64 {
                let n = writer * 50 + i;
                let record = ValueRecord::new(
                    base + ChronoDuration::milliseconds(n),
                    Variant::Int64(n),
                );
                historian
                    .save_node_value(node_id, &record)
                    .await
                    .expect("concurrent save should succeed");
            }
        }));
    }
    for writer in writers {
        writer.await.expect("writer task panicked");
    }

    let page = historian
        .read_node_history(
            node_id,
            &ReadRequest::new(Some(base), Some(base + ChronoDuration::seconds(1))).with_max_count(1000),
        )
        .await
        .expect("read should succeed");

    assert_eq!(page.records.len(), 500);
    assert!(page.continuation.is_none());
    let mut seen = HashSet::new();
    for pair in page.records.windows(2) {
        assert!(pair[0].source_timestamp <= pair[1].source_timestamp);
    }
    for (i, record) in page.records.iter().enumerate() {
        assert_eq!(record.value, Ok(Variant::Int64(i as i64)));
        assert!(seen.insert(record.sequence), "duplicate row {}", record.sequence);
    }
}

pub async fn test_pagination(historian: &PgHistorian) {
    let node_id = "ns=2;s=Paged.Level";
    let node = historian
        .new_historized_node(node_id, RetentionPolicy::unbounded())
        .await
        .expect("register should succeed");

    let base = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
    let records: Vec<ValueRecord> = (0..250)
        .map(|i| ValueRecord::new(base + ChronoDuration::seconds(i), Variant::Double(i as f64)))
        .collect();
    historian
        .save_node_values(node_id, &records)
        .await
        .expect("batch save should succeed");

    let range = ReadRequest::new(Some(base), Some(base + ChronoDuration::hours(1))).with_max_count(100);
    let first = historian.read_node_history(node_id, &range).await.unwrap();
    assert_eq!(first.records.len(), 100);
    let token = first.continuation.clone().expect("first page should continue");

    let second = historian
        .read_node_history(node_id, &range.clone().with_continuation(token))
        .await
        .unwrap();
    assert_eq!(second.records.len(), 100);
    let token = second.continuation.clone().expect("second page should continue");

    let third = historian
        .read_node_history(node_id, &range.clone().with_continuation(token))
        .await
        .unwrap();
    assert_eq!(third.records.len(), 50);
    assert!(third.continuation.is_none(), "last page must not continue");

    let mut values: Vec<f64> = Vec::new();
    for page in [&first, &second, &third] {
        for record in &page.records {
            match &record.value {
                Ok(Variant::Double(v)) => values.push(*v),
                other => panic!("unexpected value {other:?}"),
            }
        }
    }
    let expected: Vec<f64> = (0..250).map(|i| i as f64).collect();
    assert_eq!(values, expected, "pages overlap or leave a gap");

    // Resuming past the last row yields nothing.
    let last = third.records.last().unwrap();
    let past_end = Continuation::new(
        Direction::Forward,
        last.source_timestamp,
        node.table_name.as_str(),
        last.sequence,
    )
    .encode();
    let fourth = historian
        .read_node_history(node_id, &range.clone().with_continuation(past_end))
        .await
        .unwrap();
    assert!(fourth.records.is_empty());
    assert!(fourth.continuation.is_none());
}

pub async fn test_equal_timestamps_paginate_by_sequence(historian: &PgHistorian) {
    let node_id = "ns=2;s=Burst.Sample";
    historian
        .new_historized_node(node_id, RetentionPolicy::unbounded())
        .await
        .unwrap();
    let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let records: Vec<ValueRecord> = (0..7).map(|i| ValueRecord::new(ts, Variant::Int32(i))).collect();
    historian.save_node_values(node_id, &records).await.unwrap();

    let range = ReadRequest::new(Some(ts), Some(ts)).with_max_count(3);
    let mut collected = Vec::new();
    let mut request = range.clone();
    loop {
        let page = historian.read_node_history(node_id, &request).await.unwrap();
        collected.extend(page.records.into_iter().map(|r| r.value.unwrap()));
        match page.continuation {
            Some(token) => request = range.clone().with_continuation(token),
            None => break,
        }
    }
    assert_eq!(collected, (0..7).map(Variant::Int32).collect::<Vec<_>>());
}

pub async fn test_backward_read(historian: &PgHistorian) {
    let node_id = "ns=2;s=Reverse.Temp";
    historian
        .new_historized_node(node_id, RetentionPolicy::unbounded())
        .await
        .unwrap();
    let base = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    let records: Vec<ValueRecord> = (0..5)
        .map(|i| ValueRecord::new(base + ChronoDuration::minutes(i), Variant::Int32(i as i32)))
        .collect();
    historian.save_node_values(node_id, &records).await.unwrap();

    // No start: newest first.
    let page = historian
        .read_node_history(node_id, &ReadRequest::new(None, Some(base + ChronoDuration::hours(1))).with_max_count(2))
        .await
        .unwrap();
    let values: Vec<_> = page.records.iter().map(|r| r.value.clone().unwrap()).collect();
    assert_eq!(values, vec![Variant::Int32(4), Variant::Int32(3)]);
    assert!(page.continuation.is_some());

    // Start after end: swapped and descending.
    let page = historian
        .read_node_history(node_id, &ReadRequest::new(Some(base + ChronoDuration::minutes(3)), Some(base)))
        .await
        .unwrap();
    let values: Vec<_> = page.records.iter().map(|r| r.value.clone().unwrap()).collect();
    assert_eq!(
        values,
        vec![Variant::Int32(3), Variant::Int32(2), Variant::Int32(1), Variant::Int32(0)]
    );
}

pub async fn test_retention_period(historian: &PgHistorian) {
    let node_id = "ns=2;s=Retained.Pressure";
    historian
        .new_historized_node(node_id, RetentionPolicy::unbounded().with_period(30 * DAY))
        .await
        .unwrap();

    let now = Utc::now();
    let records = vec![
        ValueRecord::new(now - ChronoDuration::days(45), Variant::String("old".into())),
        ValueRecord::new(now - ChronoDuration::days(10), Variant::String("recent".into())),
    ];
    historian.save_node_values(node_id, &records).await.unwrap();
    historian.enforce_retention().await.unwrap();

    let page = historian
        .read_node_history(
            node_id,
            &ReadRequest::new(Some(now - ChronoDuration::days(60)), Some(now)),
        )
        .await
        .unwrap();
    assert_eq!(page.records.len(), 1);
    assert_eq!(page.records[0].value, Ok(Variant::String("recent".into())));
}

pub async fn test_retention_count(historian: &PgHistorian) {
    let node_id = "ns=2;s=Retained.Flow";
    historian
        .new_historized_node(node_id, RetentionPolicy::unbounded().with_count(3))
        .await
        .unwrap();
    let base = Utc::now() - ChronoDuration::hours(1);
    let records: Vec<ValueRecord> = (0..10)
        .map(|i| ValueRecord::new(base + ChronoDuration::seconds(i), Variant::Int32(i as i32)))
        .collect();
    historian.save_node_values(node_id, &records).await.unwrap();

    let page = historian
        .read_node_history(node_id, &ReadRequest::new(Some(base), Some(Utc::now())))
        .await
        .unwrap();
    let values: Vec<_> = page.records.iter().map(|r| r.value.clone().unwrap()).collect();
    assert_eq!(values, vec![Variant::Int32(7), Variant::Int32(8), Variant::Int32(9)]);
}

pub async fn test_variant_round_trip(historian: &PgHistorian) {
    let node_id = "ns=2;s=Mixed.Values";
    historian
        .new_historized_node(node_id, RetentionPolicy::unbounded())
        .await
        .unwrap();
    let base = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
    let values = vec![
        Variant::Null,
        Variant::Boolean(true),
        Variant::Double(f64::INFINITY),
        Variant::Float(f32::NEG_INFINITY),
        Variant::String("ünïcode".into()),
        Variant::array(VariantType::Int32, vec![]).unwrap(),
        Variant::array(VariantType::Double, vec![Variant::Double(1.5), Variant::Double(-0.0)]).unwrap(),
    ];
    let records: Vec<ValueRecord> = values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            ValueRecord::new(base + ChronoDuration::seconds(i as i64), v.clone()).with_status(0x4000_0000)
        })
        .collect();
    historian.save_node_values(node_id, &records).await.unwrap();
    historian
        .save_node_value(
            node_id,
            &ValueRecord::new(base + ChronoDuration::seconds(100), Variant::Double(f64::NAN)),
        )
        .await
        .unwrap();

    let page = historian
        .read_node_history(node_id, &ReadRequest::new(Some(base), Some(base + ChronoDuration::hours(1))))
        .await
        .unwrap();
    assert_eq!(page.records.len(), values.len() + 1);
    for (record, expected) in page.records.iter().zip(&values) {
        assert_eq!(record.value.as_ref().unwrap(), expected);
        assert_eq!(record.status_code, 0x4000_0000);
    }
    match page.records.last().unwrap().value {
        Ok(Variant::Double(v)) => assert!(v.is_nan()),
        ref other => panic!("expected NaN, got {other:?}"),
    }
}

pub async fn test_unknown_and_empty_nodes(historian: &PgHistorian) {
    let err = historian
        .save_node_value("ns=2;s=Never.Registered", &ValueRecord::new(Utc::now(), Variant::Int32(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, HistoryError::UnknownNode(_)));

    // Registered but never written: no table yet, empty result.
    historian
        .new_historized_node("ns=2;s=Silent.Node", RetentionPolicy::unbounded())
        .await
        .unwrap();
    let page = historian
        .read_node_history("ns=2;s=Silent.Node", &ReadRequest::new(None, None))
        .await
        .unwrap();
    assert!(page.records.is_empty());
    assert!(page.continuation.is_none());
}

pub async fn test_hostile_node_ids(historian: &PgHistorian) {
    let ids = [
        "ns=2;s=Robert'); DROP TABLE historian_nodes;--",
        "ns=2;s=\"quoted\"",
        "ns=2;s=Robert'); DROP TABLE historian_nodes;-- ",
    ];
    let mut tables = HashSet::new();
    for (i, id) in ids.iter().enumerate() {
        let node = historian
            .new_historized_node(id, RetentionPolicy::unbounded())
            .await
            .unwrap();
        assert!(tables.insert(node.table_name.clone()), "table name reused");
        historian
            .save_node_value(id, &ValueRecord::new(Utc::now(), Variant::Int32(i as i32)))
            .await
            .unwrap();
    }
    for (i, id) in ids.iter().enumerate() {
        let page = historian
            .read_node_history(id, &ReadRequest::new(Some(Utc::now() - ChronoDuration::hours(1)), None))
            .await
            .unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].value, Ok(Variant::Int32(i as i32)));
    }
}

pub async fn test_failed_batch_commits_nothing(historian: &PgHistorian) {
    let node_id = "ns=2;s=Batch.Atomic";
    historian
        .new_historized_node(node_id, RetentionPolicy::unbounded())
        .await
        .unwrap();

    let base = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    let mut records: Vec<ValueRecord> = (0..1500)
        .map(|i| ValueRecord::new(base + ChronoDuration::milliseconds(i), Variant::Int64(i)))
        .collect();
    // Out of PostgreSQL's timestamp range: only the second insert chunk fails.
    records.push(ValueRecord::new(chrono::DateTime::<Utc>::MIN_UTC, Variant::Int64(-1)));
    assert!(historian.save_node_values(node_id, &records).await.is_err());

    let hand_built = Variant::Array {
        element: VariantType::Int32,
        items: vec![Variant::Double(1.5)],
    };
    let err = historian
        .save_node_values(
            node_id,
            &[
                ValueRecord::new(base, Variant::Int32(1)),
                ValueRecord::new(base, hand_built),
            ],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HistoryError::Codec(_)));

    let page = historian
        .read_node_history(
            node_id,
            &ReadRequest::new(Some(base - ChronoDuration::days(1)), Some(base + ChronoDuration::days(1))),
        )
        .await
        .unwrap();
    assert!(page.records.is_empty(), "partial batch committed");
}

/// Run all value history tests.
#[macro_export]
macro_rules! run_value_tests {
    ($historian:expr) => {
        use $crate::history::value_tests::*;

        test_concurrent_writes($historian).await;
        println!("  test_concurrent_writes: PASSED");

        test_pagination($historian).await;
        println!("  test_pagination: PASSED");

        test_equal_timestamps_paginate_by_sequence($historian).await;
        println!("  test_equal_timestamps_paginate_by_sequence: PASSED");

        test_backward_read($historian).await;
        println!("  test_backward_read: PASSED");

        test_retention_period($historian).await;
        println!("  test_retention_period: PASSED");

        test_retention_count($historian).await;
        println!("  test_retention_count: PASSED");

        test_variant_round_trip($historian).await;
        println!("  test_variant_round_trip: PASSED");

        test_unknown_and_empty_nodes($historian).await;
        println!("  test_unknown_and_empty_nodes: PASSED");

        test_hostile_node_ids($historian).await;
        println!("  test_hostile_node_ids: PASSED");

        test_failed_batch_commits_nothing($historian).await;
        println!("  test_failed_batch_commits_nothing: PASSED");
    };
}
