//! PostgreSQL history integration tests using testcontainers.
//!
//! Run with: cargo test --test storage_postgres --features pg-integration -- --nocapture
//!
//! These tests spin up PostgreSQL in a container using testcontainers-rs,
//! initialize the history engine (which applies migrations) and run the
//! shared history scenarios.

mod history;

use std::sync::Arc;
use std::time::Duration;

use pghistorian::{HistorianOptions, HistoryStorage, PgHistorian};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

/// Start PostgreSQL container.
///
/// Returns (container, options) where options point the engine at it.
async fn start_postgres() -> (testcontainers::ContainerAsync<GenericImage>, HistorianOptions) {
    // PostgreSQL prints "database system is ready to accept connections" twice:
    // once during initial setup and once when fully ready.
    // We wait for the message but add a small delay to ensure full readiness.
    let image = GenericImage::new("postgres", "16")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stdout(
            "database system is ready to accept connections",
        ));

    let container = image
        .with_env_var("POSTGRES_USER", "historian")
        .with_env_var("POSTGRES_PASSWORD", "historian")
        .with_env_var("POSTGRES_DB", "opcua")
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start postgres container");

    // Brief delay to ensure PostgreSQL is fully ready to accept connections
    tokio::time::sleep(Duration::from_secs(1)).await;

    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let options = HistorianOptions {
        user: "historian".into(),
        password: "historian".into(),
        database: "opcua".into(),
        host: host.to_string(),
        port,
        min_pool_size: 1,
        max_pool_size: 10,
        ..Default::default()
    };

    println!("PostgreSQL available at: {}:{}", options.host, options.port);

    (container, options)
}

async fn start_historian(options: &HistorianOptions) -> Arc<PgHistorian> {
    let historian = PgHistorian::new(options).expect("options should resolve");
    historian.init().await.expect("init should succeed");
    Arc::new(historian)
}

#[tokio::test]
async fn test_postgres_value_history() {
    println!("=== PostgreSQL value history tests ===");
    println!("Starting PostgreSQL container...");

    let (_container, options) = start_postgres().await;
    let historian = start_historian(&options).await;

    println!("Running value tests...");
    run_value_tests!(&historian);

    historian.stop().await.expect("stop should succeed");
    println!("=== All value history tests PASSED ===");
    // Container is dropped here, stopping PostgreSQL
}

#[tokio::test]
async fn test_postgres_event_history() {
    println!("=== PostgreSQL event history tests ===");
    println!("Starting PostgreSQL container...");

    let (_container, options) = start_postgres().await;
    let historian = start_historian(&options).await;

    println!("Running event tests...");
    run_event_tests!(&historian);

    historian.stop().await.expect("stop should succeed");
    println!("=== All event history tests PASSED ===");
}

#[tokio::test]
async fn test_postgres_lifecycle() {
    println!("=== PostgreSQL lifecycle tests ===");
    println!("Starting PostgreSQL container...");

    let (_container, options) = start_postgres().await;

    println!("Running lifecycle tests...");
    run_lifecycle_tests!(&options);

    println!("=== All lifecycle tests PASSED ===");
}
