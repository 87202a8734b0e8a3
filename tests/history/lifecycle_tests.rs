//! Engine lifecycle and pool tests.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;

use pghistorian::config::connect_options;
use pghistorian::storage::{ConnectionPool, PoolSettings};
use pghistorian::{
    HistorianOptions, HistoryError, HistoryStorage, PgHistorian, ReadRequest, RetentionPolicy,
    ValueRecord, Variant,
};

pub async fn test_lifecycle(options: &HistorianOptions) {
    let historian = PgHistorian::new(options).expect("options should resolve");
    let node_id = "ns=2;s=Lifecycle.Node";

    let err = historian
        .new_historized_node(node_id, RetentionPolicy::unbounded())
        .await
        .unwrap_err();
    assert!(matches!(err, HistoryError::NotInitialized));
    assert!(!historian.connection_info().await.initialized);

    historian.init().await.expect("init should succeed");
    historian.init().await.expect("second init is a no-op");
    let info = historian.connection_info().await;
    assert!(info.initialized);
    assert_eq!(info.database, options.database);

    historian
        .new_historized_node(node_id, RetentionPolicy::unbounded())
        .await
        .unwrap();
    historian
        .save_node_value(node_id, &ValueRecord::new(Utc::now(), Variant::Boolean(true)))
        .await
        .unwrap();
    let status = historian.pool_status().await.unwrap();
    assert_eq!(status.max_size, options.max_pool_size);
    assert!(status.size >= 1);

    historian.stop().await.unwrap();
    assert!(!historian.connection_info().await.initialized);
    let err = historian
        .read_node_history(node_id, &ReadRequest::new(None, None))
        .await
        .unwrap_err();
    assert!(matches!(err, HistoryError::PoolClosed));
    let err = historian
        .save_event("AfterStop", &HashMap::new(), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, HistoryError::PoolClosed));
}

pub async fn test_registration_survives_restart(options: &HistorianOptions) {
    let node_id = "ns=2;s=Restart.Node";
    let first = PgHistorian::new(options).unwrap();
    first.init().await.unwrap();
    let node = first
        .new_historized_node(node_id, RetentionPolicy::unbounded())
        .await
        .unwrap();
    first
        .save_node_value(node_id, &ValueRecord::new(Utc::now(), Variant::Int32(7)))
        .await
        .unwrap();
    first.stop().await.unwrap();

    // A second engine sees the same assignment without registering again.
    let second = PgHistorian::new(options).unwrap();
    second.init().await.unwrap();
    let again = second
        .new_historized_node(node_id, RetentionPolicy::unbounded())
        .await
        .unwrap();
    assert_eq!(again.table_name, node.table_name);
    let page = second
        .read_node_history(node_id, &ReadRequest::new(None, None))
        .await
        .unwrap();
    assert_eq!(page.records.len(), 1);
    second.stop().await.unwrap();
}

pub async fn test_pool_exhaustion(options: &HistorianOptions) {
    let settings = options.resolve().unwrap();
    let pool = ConnectionPool::connect(
        connect_options(&settings.connection),
        PoolSettings {
            min_size: 0,
            max_size: 1,
            acquire_timeout: Duration::from_millis(300),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let held = pool.acquire().await.unwrap();
    match pool.acquire().await {
        Err(HistoryError::PoolExhausted { waited }) => {
            assert!(waited >= Duration::from_millis(250), "gave up after {waited:?}")
        }
        other => panic!("expected PoolExhausted, got {:?}", other.map(|_| ())),
    }
    drop(held);
    pool.acquire().await.expect("released connection is reusable");
    pool.close().await;
}

pub async fn test_cancelled_operation_releases_connection(options: &HistorianOptions) {
    let settings = options.resolve().unwrap();
    let pool = ConnectionPool::connect(
        connect_options(&settings.connection),
        PoolSettings {
            min_size: 0,
            max_size: 1,
            acquire_timeout: Duration::from_secs(2),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let slow = pool.with_connection(|mut conn| async move {
        sqlx::query("SELECT pg_sleep(5)").execute(&mut *conn).await?;
        Ok(())
    });
    assert!(tokio::time::timeout(Duration::from_millis(200), slow)
        .await
        .is_err());

    let one: i32 = pool
        .with_connection(|mut conn| async move {
            Ok(sqlx::query_scalar("SELECT 1").fetch_one(&mut *conn).await?)
        })
        .await
        .expect("connection should be back in the pool");
    assert_eq!(one, 1);
    pool.close().await;
}

/// Run all lifecycle tests.
#[macro_export]
macro_rules! run_lifecycle_tests {
    ($options:expr) => {
        use $crate::history::lifecycle_tests::*;

        test_lifecycle($options).await;
        println!("  test_lifecycle: PASSED");

        test_registration_survives_restart($options).await;
        println!("  test_registration_survives_restart: PASSED");

        test_pool_exhaustion($options).await;
        println!("  test_pool_exhaustion: PASSED");

        test_cancelled_operation_releases_connection($options).await;
        println!("  test_cancelled_operation_releases_connection: PASSED");
    };
}
