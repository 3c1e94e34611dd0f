use shared::breaker::{
    BreakerBoard, BreakerCheck, BreakerSettings, BreakerTransition, CircuitState,
};
use shared::providers::ProviderId;
use shared::providers::adapter::CallErrorKind;
use tokio::time::{Duration, advance};

const PROVIDER: ProviderId = ProviderId::Perplexity;

fn board() -> BreakerBoard {
    BreakerBoard::new(BreakerSettings::default())
}

fn fail_times(board: &BreakerBoard, times: u32) -> Option<BreakerTransition> {
    let mut last = None;
    for _ in 0..times {
        last = board.on_failure(PROVIDER, CallErrorKind::Transient);
    }
    last
}

#[tokio::test(start_paused = true)]
async fn opens_after_consecutive_failures() {
    let board = board();

    assert_eq!(fail_times(&board, 4), None);
    assert_eq!(board.state(PROVIDER), CircuitState::Closed);
    assert_eq!(board.check(PROVIDER), BreakerCheck::Allow);

    let transition = board.on_failure(PROVIDER, CallErrorKind::Transient);
    assert!(matches!(transition, Some(BreakerTransition::Opened { .. })));
    assert_eq!(board.state(PROVIDER), CircuitState::Open);
    assert!(matches!(
        board.check(PROVIDER),
        BreakerCheck::Deny { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn success_resets_the_consecutive_counter() {
    let board = board();

    fail_times(&board, 4);
    assert_eq!(board.on_success(PROVIDER), None);
    // Four more failures still sit under the threshold after the reset.
    assert_eq!(fail_times(&board, 4), None);
    assert_eq!(board.state(PROVIDER), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn cooldown_admits_a_single_probe() {
    let board = board();
    fail_times(&board, 5);

    advance(Duration::from_secs(61)).await;

    assert_eq!(board.check(PROVIDER), BreakerCheck::Allow);
    assert_eq!(board.state(PROVIDER), CircuitState::HalfOpen);
    // Only one probe may be in flight.
    assert!(matches!(
        board.check(PROVIDER),
        BreakerCheck::Deny { .. }
    ));

    assert_eq!(board.on_success(PROVIDER), Some(BreakerTransition::Closed));
    assert_eq!(board.state(PROVIDER), CircuitState::Closed);
    assert_eq!(board.check(PROVIDER), BreakerCheck::Allow);
}

#[tokio::test(start_paused = true)]
async fn failed_probe_doubles_the_cooldown() {
    let board = board();
    fail_times(&board, 5);

    advance(Duration::from_secs(61)).await;
    assert_eq!(board.check(PROVIDER), BreakerCheck::Allow);

    let transition = board.on_failure(PROVIDER, CallErrorKind::Transient);
    match transition {
        Some(BreakerTransition::Opened { cooldown }) => {
            assert_eq!(cooldown, Duration::from_secs(120));
        }
        other => panic!("expected reopen, got {other:?}"),
    }

    advance(Duration::from_secs(119)).await;
    assert!(matches!(
        board.check(PROVIDER),
        BreakerCheck::Deny { .. }
    ));
    advance(Duration::from_secs(2)).await;
    assert_eq!(board.check(PROVIDER), BreakerCheck::Allow);
}

#[tokio::test(start_paused = true)]
async fn cooldown_doubling_is_capped() {
    let board = BreakerBoard::new(BreakerSettings {
        failure_threshold: 1,
        base_cooldown: Duration::from_secs(60),
        max_cooldown: Duration::from_secs(180),
        non_retryable_hourly_cap: 10,
    });

    board.on_failure(PROVIDER, CallErrorKind::Transient);
    for _ in 0..4 {
        advance(Duration::from_secs(200)).await;
        assert_eq!(board.check(PROVIDER), BreakerCheck::Allow);
        let transition = board.on_failure(PROVIDER, CallErrorKind::Transient);
        if let Some(BreakerTransition::Opened { cooldown }) = transition {
            assert!(cooldown <= Duration::from_secs(180));
        } else {
            panic!("expected reopen");
        }
    }
}

#[tokio::test(start_paused = true)]
async fn auth_failures_never_trip_the_breaker() {
    let board = board();

    for _ in 0..20 {
        assert_eq!(board.on_failure(PROVIDER, CallErrorKind::Auth), None);
    }
    assert_eq!(board.state(PROVIDER), CircuitState::Closed);
    assert_eq!(board.check(PROVIDER), BreakerCheck::Allow);
}

#[tokio::test(start_paused = true)]
async fn non_retryable_failures_stop_counting_at_the_hourly_cap() {
    let board = BreakerBoard::new(BreakerSettings {
        failure_threshold: 3,
        base_cooldown: Duration::from_secs(60),
        max_cooldown: Duration::from_secs(900),
        non_retryable_hourly_cap: 2,
    });

    // Two count, the rest of the hour's worth are absorbed.
    for _ in 0..10 {
        board.on_failure(PROVIDER, CallErrorKind::NonRetryable);
    }
    assert_eq!(board.state(PROVIDER), CircuitState::Closed);

    // One more retryable failure reaches the threshold.
    let transition = board.on_failure(PROVIDER, CallErrorKind::Transient);
    assert!(matches!(transition, Some(BreakerTransition::Opened { .. })));

    // After the window rolls over, non-retryable failures count again.
    let fresh = BreakerBoard::new(BreakerSettings {
        failure_threshold: 2,
        base_cooldown: Duration::from_secs(60),
        max_cooldown: Duration::from_secs(900),
        non_retryable_hourly_cap: 1,
    });
    fresh.on_failure(PROVIDER, CallErrorKind::NonRetryable);
    advance(Duration::from_secs(3_601)).await;
    fresh.on_failure(PROVIDER, CallErrorKind::NonRetryable);
    fresh.on_failure(PROVIDER, CallErrorKind::NonRetryable);
    // Window rolled once, so two counted in total across windows.
    assert_eq!(fresh.state(PROVIDER), CircuitState::Open);
}
