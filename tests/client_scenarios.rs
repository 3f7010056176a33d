use shelfcache::{
    BreakerSettings, CacheConfig, CircuitState, ClientStatus, Context, ErrorKind, Fault,
    ManualClock, MemoryBackend, Operation, ResilientClient, RetryPolicy,
};
use std::sync::Arc;
use std::time::Duration;

fn config(max_failures: u32) -> CacheConfig {
    CacheConfig::default()
        .with_breaker(BreakerSettings {
            enabled: true,
            max_failures,
            reset_timeout: Duration::from_secs(30),
            half_open_requests: 2,
        })
        .with_retry(RetryPolicy::none())
        .without_health()
}

async fn connected(config: CacheConfig) -> (ResilientClient, Arc<MemoryBackend>, ManualClock) {
    let backend = Arc::new(MemoryBackend::new());
    let clock = ManualClock::new();
    let client = ResilientClient::with_clock(config, backend.clone(), clock.clone()).unwrap();
    client.connect(&Context::background()).await.unwrap();
    (client, backend, clock)
}

#[tokio::test]
async fn three_set_timeouts_open_the_circuit_and_the_fourth_set_never_reaches_the_store() {
    let (client, backend, _) = connected(config(3)).await;
    let ctx = Context::background();
    backend.fail_next(3, Fault::Timeout);

    for _ in 0..3 {
        let err = client.set(&ctx, "book:1", "Dune", Duration::from_secs(60)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
    assert_eq!(backend.calls(Operation::Set), 3);
    assert_eq!(client.circuit_breaker().unwrap().state(), CircuitState::Open);

    let err = client.set(&ctx, "book:1", "Dune", Duration::from_secs(60)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    assert_eq!(backend.calls(Operation::Set), 3, "rejected call must not touch the store");
    assert_eq!(client.status(), ClientStatus::Error);
}

#[tokio::test]
async fn missing_key_on_a_reachable_store_is_a_clean_miss() {
    let (client, backend, _) = connected(config(3)).await;

    let (value, found) = client.get(&Context::background(), "missing-key").await.unwrap();
    assert_eq!(value, "");
    assert!(!found);

    let breaker = client.circuit_breaker().unwrap().metrics();
    assert_eq!(breaker.state, CircuitState::Closed);
    assert_eq!(breaker.consecutive_failures, 0);
    assert_eq!(breaker.total_failures, 0);
    assert_eq!(backend.calls(Operation::Get), 1, "a miss is never retried");
    assert!(client.is_ready());
}

#[tokio::test]
async fn closed_client_refuses_every_operation_without_io() {
    let (client, backend, _) = connected(config(3)).await;
    client.close().await.unwrap();
    let before = backend.total_calls();
    let ctx = Context::background();

    let get = client.get(&ctx, "k").await.unwrap_err();
    let set = client.set(&ctx, "k", "v", Duration::ZERO).await.unwrap_err();
    let del = client.delete(&ctx, ["k"]).await.unwrap_err();
    for err in [get, set, del] {
        assert_eq!(err.kind(), ErrorKind::ClientNotReady);
    }
    assert_eq!(backend.total_calls(), before);
    assert_eq!(client.status(), ClientStatus::Closed);
}

#[tokio::test]
async fn half_open_admits_a_bounded_number_of_probes() {
    let (client, backend, clock) = connected(config(1)).await;
    let ctx = Context::background();
    backend.fail_next(1, Fault::ConnectionLost);
    assert!(client.get(&ctx, "k").await.is_err());
    let breaker = client.circuit_breaker().unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);

    // Two slow probes occupy both half-open slots; a third call is turned away.
    clock.advance(30_001);
    backend.set_latency(Duration::from_millis(200));
    let (a, b, c) = tokio::join!(
        client.get(&ctx, "k"),
        client.get(&ctx, "k"),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            client.get(&ctx, "k").await
        }
    );
    assert!(a.is_ok());
    assert!(b.is_ok());
    assert_eq!(c.unwrap_err().kind(), ErrorKind::CircuitHalfOpenSaturated);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn call_abandoned_after_the_circuit_moved_on_frees_no_probe_slot() {
    let cfg = config(1).with_breaker(BreakerSettings {
        enabled: true,
        max_failures: 1,
        reset_timeout: Duration::from_secs(30),
        half_open_requests: 1,
    });
    let (client, backend, clock) = connected(cfg).await;
    let breaker = client.circuit_breaker().unwrap();
    backend.set_latency(Duration::from_millis(300));
    let ctx = Context::background();
    let short = ctx.with_timeout(Duration::from_millis(150));

    // A is admitted while Closed and outlives its deadline; B is the single half-open probe.
    let (a, b, c) = tokio::join!(
        client.get(&short, "k"),
        async {
            breaker.record_failure();
            clock.advance(30_001);
            client.get(&ctx, "k").await
        },
        async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            client.get(&ctx, "k").await
        }
    );

    assert_eq!(a.unwrap_err().kind(), ErrorKind::Timeout);
    assert_eq!(c.unwrap_err().kind(), ErrorKind::CircuitHalfOpenSaturated);
    assert!(b.is_ok());
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(backend.calls(Operation::Get), 2);
}

#[tokio::test]
async fn failed_probe_reopens_the_circuit() {
    let (client, backend, clock) = connected(config(2)).await;
    let ctx = Context::background();
    backend.set_offline(true);
    for _ in 0..2 {
        let _ = client.ping(&ctx).await;
    }
    clock.advance(30_001);

    let err = client.ping(&ctx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
    assert_eq!(client.circuit_breaker().unwrap().state(), CircuitState::Open);
    assert_eq!(client.ping(&ctx).await.unwrap_err().kind(), ErrorKind::CircuitOpen);
}

#[tokio::test(start_paused = true)]
async fn retries_back_off_and_stop_at_the_caller_deadline() {
    let cfg = config(10).with_retry(RetryPolicy {
        max_retries: 10,
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(1),
        factor: 2.0,
        ..RetryPolicy::default()
    });
    let (client, backend, _) = connected(cfg).await;
    backend.set_offline(true);

    let ctx = Context::background().with_timeout(Duration::from_millis(350));
    let err = client.get(&ctx, "k").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    // Attempts at 0ms, 100ms and 300ms; the next wait would end after the deadline.
    assert_eq!(backend.calls(Operation::Get), 3);
    assert_eq!(client.circuit_breaker().unwrap().metrics().total_failures, 0);
}

#[tokio::test]
async fn caller_cancellation_is_reported_as_cancelled() {
    let (client, backend, _) = connected(config(3)).await;
    backend.set_latency(Duration::from_secs(10));
    let ctx = Context::background();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let err = client.get(&ctx, "k").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(client.circuit_breaker().unwrap().metrics().total_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn health_checker_runs_while_connected() {
    let mut cfg = config(3);
    cfg.health.enabled = true;
    cfg.health.interval = Duration::from_secs(1);
    cfg.health.max_retries = 0;
    let (client, backend, _) = connected(cfg).await;
    assert!(client.health().unwrap().is_running());

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    // One probe from connect, two from the loop.
    assert_eq!(backend.calls(Operation::Ping), 3);
    assert_eq!(client.stats().health.unwrap().checks, 2);

    client.close().await.unwrap();
    assert!(!client.health().unwrap().is_running());
}

#[tokio::test]
async fn stats_serialize_for_status_endpoints() {
    let (client, _, _) = connected(config(3)).await;
    let ctx = Context::background();
    client.set(&ctx, "a", "1", Duration::ZERO).await.unwrap();
    client.get(&ctx, "a").await.unwrap();
    client.get(&ctx, "b").await.unwrap();

    let stats = client.stats();
    assert_eq!(stats.hit_ratio(), 0.5);
    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["status"], "ready");
    assert_eq!(json["circuit"]["state"], "closed");
    assert_eq!(json["cache_hits"], 1);
}

#[tokio::test(start_paused = true)]
async fn close_during_an_in_flight_operation_fails_it_gracefully() {
    let (client, backend, _) = connected(config(3)).await;
    backend.set_latency(Duration::from_millis(200));
    let ctx = Context::background();

    let (get, closed) = tokio::join!(client.get(&ctx, "k"), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.close().await
    });

    closed.unwrap();
    assert_eq!(get.unwrap_err().kind(), ErrorKind::ConnectionFailed);
    assert_eq!(client.status(), ClientStatus::Closed);
    assert_eq!(client.get(&ctx, "k").await.unwrap_err().kind(), ErrorKind::ClientNotReady);
}
