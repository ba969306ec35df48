//! Tests against a real container runtime.
//!
//! Ignored by default; run with `cargo test -p testpod-sdk -- --ignored` on
//! a host with Docker or Podman. Containers are started outside any async
//! runtime because readiness probes use blocking I/O.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::{Duration, Instant};

use testpod_sdk::logging::init_test_tracing;
use testpod_sdk::presets::postgres;
use testpod_sdk::{ContainerBuilder, TestScope, options};

#[test]
#[ignore = "requires a container runtime"]
fn postgres_dsn_round_trip() {
    init_test_tracing();
    let scope = TestScope::new("postgres_dsn_round_trip");
    let pg = postgres::start(&scope, []).expect("postgres should start");

    let dsn = pg.create_database(&scope, "testdb").expect("database");
    assert_eq!(dsn, pg.format_dsn("testdb").unwrap());

    let rt = tokio::runtime::Runtime::new().unwrap();
    let one: i32 = rt
        .block_on(async {
            let pool = sqlx::PgPool::connect(&dsn).await?;
            let value: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&pool).await?;
            pool.close().await;
            Ok::<_, sqlx::Error>(value)
        })
        .expect("query through the provisioned DSN");
    assert_eq!(one, 1);
}

#[test]
#[ignore = "requires a container runtime"]
fn parallel_tests_get_distinct_databases() {
    init_test_tracing();
    let suite = TestScope::new("parallel_suite");
    let pg = postgres::start(&suite, []).unwrap();

    let dsns: Vec<String> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let pg = pg.clone();
                s.spawn(move || {
                    let test = TestScope::new(format!("parallel_case_{i}"));
                    pg.create_database(&test, "").unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    for (i, dsn) in dsns.iter().enumerate() {
        assert!(dsn.contains(&format!("/parallel_case_{i}?")));
    }
}

#[test]
#[ignore = "requires a container runtime"]
fn http_wait_and_log_stream() {
    init_test_tracing();
    let scope = TestScope::new("http_wait");
    let start = Instant::now();
    let web = ContainerBuilder::new("nginx:alpine")
        .port("80")
        .with(options::wait_for_http("/", "80", 200, Duration::from_secs(30)))
        .with(options::stream_logs(true))
        .start(&scope)
        .expect("nginx should answer");
    assert!(start.elapsed() < Duration::from_secs(30));
    let endpoint = web.endpoint("80").unwrap();
    assert!(endpoint.starts_with("127.0.0.1:"));
    assert!(web.logs().unwrap().contains("start worker process"));
}
