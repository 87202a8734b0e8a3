//! Event history tests: schema growth, merging, select clauses.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};

use pghistorian::{HistoryStorage, PgHistorian, ReadRequest, RetentionPolicy, Variant};

fn fields(pairs: &[(&str, Variant)]) -> HashMap<String, Variant> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

pub async fn test_out_of_order_fields(historian: &PgHistorian) {
    let ts = Utc.with_ymd_and_hms(2024, 8, 1, 0, 0, 0).unwrap();
    historian
        .save_event(
            "SortedFieldsEvent",
            &fields(&[("Field2", Variant::Int32(2)), ("Field1", Variant::String("one".into()))]),
            ts,
        )
        .await
        .expect("save_event should succeed");

    let page = historian
        .read_event_history(
            Some(&["SortedFieldsEvent"][..]),
            None,
            &ReadRequest::new(Some(ts), Some(ts)),
        )
        .await
        .unwrap();
    assert_eq!(page.records.len(), 1);
    let event = &page.records[0];
    assert_eq!(event.event_type, "SortedFieldsEvent");
    assert_eq!(event.fields["Field1"], Ok(Variant::String("one".into())));
    assert_eq!(event.fields["Field2"], Ok(Variant::Int32(2)));
}

pub async fn test_event_schema_grows(historian: &PgHistorian) {
    let event_type = "GrowingEvent";
    let base = Utc.with_ymd_and_hms(2024, 8, 2, 0, 0, 0).unwrap();
    historian
        .save_event(event_type, &fields(&[("Message", Variant::String("first".into()))]), base)
        .await
        .unwrap();
    historian
        .save_event(
            event_type,
            &fields(&[("Severity", Variant::UInt16(500)), ("Message", Variant::String("second".into()))]),
            base + ChronoDuration::seconds(1),
        )
        .await
        .unwrap();

    let page = historian
        .read_event_history(
            Some(&[event_type][..]),
            None,
            &ReadRequest::new(Some(base), Some(base + ChronoDuration::minutes(1))),
        )
        .await
        .unwrap();
    assert_eq!(page.records.len(), 2);
    // The first event predates the Severity column and reads as null.
    assert_eq!(page.records[0].fields["Severity"], Ok(Variant::Null));
    assert_eq!(page.records[1].fields["Severity"], Ok(Variant::UInt16(500)));
}

pub async fn test_concurrent_new_fields(historian: &Arc<PgHistorian>) {
    let event_type = "RacingFieldsEvent";
    let base = Utc.with_ymd_and_hms(2024, 8, 3, 0, 0, 0).unwrap();
    let mut tasks = Vec::new();
    for i in 0..8i64 {
        let historian = Arc::clone(historian);
        tasks.push(tokio::spawn(async move {
            let payload = fields(&[
                ("Shared", Variant::Int64(i)),
                (if i % 2 == 0 { "Even" } else { "Odd" }, Variant::Boolean(true)),
            ]);
            historian
                .save_event(event_type, &payload, base + ChronoDuration::seconds(i))
                .await
                .expect("concurrent save_event should succeed");
        }));
    }
    for task in tasks {
        task.await.expect("task panicked");
    }

    let page = historian
        .read_event_history(
            Some(&[event_type][..]),
            Some(&["Shared", "Even", "Odd"][..]),
            &ReadRequest::new(Some(base), Some(base + ChronoDuration::minutes(1))),
        )
        .await
        .unwrap();
    assert_eq!(page.records.len(), 8);
    for (i, event) in page.records.iter().enumerate() {
        assert_eq!(event.fields["Shared"], Ok(Variant::Int64(i as i64)));
        let (set, unset) = if i % 2 == 0 { ("Even", "Odd") } else { ("Odd", "Even") };
        assert_eq!(event.fields[set], Ok(Variant::Boolean(true)));
        assert_eq!(event.fields[unset], Ok(Variant::Null));
    }
}

pub async fn test_merge_across_event_types(historian: &PgHistorian) {
    let base = Utc.with_ymd_and_hms(2024, 8, 4, 0, 0, 0).unwrap();
    for i in 0..6i64 {
        let event_type = if i % 2 == 0 { "MergeAlpha" } else { "MergeBeta" };
        historian
            .save_event(event_type, &fields(&[("Index", Variant::Int64(i))]), base + ChronoDuration::seconds(i))
            .await
            .unwrap();
    }
    // Same timestamp in both tables.
    for event_type in ["MergeAlpha", "MergeBeta"] {
        historian
            .save_event(event_type, &fields(&[("Index", Variant::Int64(6))]), base + ChronoDuration::seconds(6))
            .await
            .unwrap();
    }

    let range = ReadRequest::new(Some(base), Some(base + ChronoDuration::minutes(1))).with_max_count(3);
    let types = ["MergeAlpha", "MergeBeta"];
    let mut request = range.clone();
    let mut collected = Vec::new();
    loop {
        let page = historian
            .read_event_history(Some(&types[..]), None, &request)
            .await
            .unwrap();
        collected.extend(page.records);
        match page.continuation {
            Some(token) => request = range.clone().with_continuation(token),
            None => break,
        }
    }

    assert_eq!(collected.len(), 8);
    for pair in collected.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
    let indexes: Vec<_> = collected.iter().map(|e| e.fields["Index"].clone().unwrap()).collect();
    let expected: Vec<_> = [0, 1, 2, 3, 4, 5, 6, 6].into_iter().map(Variant::Int64).collect();
    assert_eq!(indexes, expected);
    let last_two: Vec<_> = collected[6..].iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(last_two.len(), 2);
    assert_ne!(last_two[0], last_two[1]);
}

pub async fn test_select_unknown_field(historian: &PgHistorian) {
    let ts = Utc.with_ymd_and_hms(2024, 8, 5, 0, 0, 0).unwrap();
    historian
        .save_event("SelectEvent", &fields(&[("Known", Variant::Int32(1))]), ts)
        .await
        .unwrap();
    let page = historian
        .read_event_history(
            Some(&["SelectEvent"][..]),
            Some(&["Known", "Unknown"][..]),
            &ReadRequest::new(Some(ts), Some(ts)),
        )
        .await
        .unwrap();
    assert_eq!(page.records.len(), 1);
    let event = &page.records[0];
    assert_eq!(event.fields.len(), 2);
    assert_eq!(event.fields["Known"], Ok(Variant::Int32(1)));
    assert_eq!(event.fields["Unknown"], Ok(Variant::Null));
}

pub async fn test_registered_event_retention(historian: &PgHistorian) {
    let event_type = "RetainedEvent";
    let desc = historian
        .register_event_type(event_type, &["Message"], RetentionPolicy::unbounded().with_count(2))
        .await
        .unwrap();
    assert!(desc.column("Message").is_some());

    let base = Utc::now() - ChronoDuration::minutes(10);
    for i in 0..5i64 {
        historian
            .save_event(event_type, &fields(&[("Message", Variant::Int64(i))]), base + ChronoDuration::seconds(i))
            .await
            .unwrap();
    }
    let page = historian
        .read_event_history(Some(&[event_type][..]), None, &ReadRequest::new(Some(base), None))
        .await
        .unwrap();
    let kept: Vec<_> = page.records.iter().map(|e| e.fields["Message"].clone().unwrap()).collect();
    assert_eq!(kept, vec![Variant::Int64(3), Variant::Int64(4)]);
}

pub async fn test_unknown_event_type_reads_empty(historian: &PgHistorian) {
    let page = historian
        .read_event_history(Some(&["NeverWrittenEvent"][..]), None, &ReadRequest::new(None, None))
        .await
        .unwrap();
    assert!(page.records.is_empty());
    assert!(page.continuation.is_none());
}

/// Run all event history tests.
#[macro_export]
macro_rules! run_event_tests {
    ($historian:expr) => {
        use $crate::history::event_tests::*;

        test_out_of_order_fields($historian).await;
        println!("  test_out_of_order_fields: PASSED");

        test_event_schema_grows($historian).await;
        println!("  test_event_schema_grows: PASSED");

        test_concurrent_new_fields($historian).await;
        println!("  test_concurrent_new_fields: PASSED");

        test_merge_across_event_types($historian).await;
        println!("  test_merge_across_event_types: PASSED");

        test_select_unknown_field($historian).await;
        println!("  test_select_unknown_field: PASSED");

        test_registered_event_retention($historian).await;
        println!("  test_registered_event_retention: PASSED");

        test_unknown_event_type_reads_empty($historian).await;
        println!("  test_unknown_event_type_reads_empty: PASSED");
    };
}
