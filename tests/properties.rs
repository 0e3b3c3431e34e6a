//! Behavioural guarantees of the execution pipeline that hold regardless of transport.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use callguard::completion::completion;
use callguard::{
    Backoff, ClientOverrideConfig, ExhaustionReason, Jitter, RetryDecision, RetryMode,
    RetryStrategy, SdkError, SdkRequest, SdkResponse, ServiceFault, SyncClient, TimeoutScope,
    TimeoutTracker, TimerService, TokenBucket, TrackerState, TrackingSleeper,
};
use common::{service, ScriptedTransport, Step};
use rand::rngs::StdRng;
use rand::SeedableRng;

#[test]
fn jittered_backoff_stays_within_the_cap() {
    let max = Duration::from_secs(2);
    let backoff = Backoff::exponential(Duration::from_millis(50)).with_max(max).unwrap();
    let mut rng = StdRng::seed_from_u64(7);

    let mut previous_bound = Duration::ZERO;
    for attempt in 1..=40 {
        let bound = backoff.delay(attempt);
        assert!(bound >= previous_bound, "upper bound shrank at attempt {attempt}");
        assert!(bound <= max);
        previous_bound = bound;

        for jitter in [Jitter::Full, Jitter::None] {
            let delay = jitter.apply_with_rng(bound, &mut rng);
            assert!(delay <= bound, "{jitter:?} produced {delay:?} above {bound:?}");
        }
    }
    assert_eq!(previous_bound, max);
}

#[test]
fn call_deadline_shorter_than_the_attempts_fails_with_call_timeout() {
    let busy = ServiceFault::new(503, "busy").into();
    let slow_failure = Step::SlowFault(Duration::from_millis(60), busy);
    let transport = ScriptedTransport::repeating(slow_failure);
    let strategy = RetryStrategy::builder()
        .max_attempts(5)
        .base_delay(Duration::from_millis(1))
        .with_jitter(Jitter::None)
        .build()
        .unwrap();
    let client = SyncClient::builder(transport.clone())
        .retry_strategy(strategy)
        .override_config(
            ClientOverrideConfig::builder().api_call_timeout(Duration::from_millis(150)).build(),
        )
        .timer_workers(1)
        .build()
        .unwrap();

    let err = client.execute(SdkRequest::get("mem://slow")).unwrap_err();
    assert!(err.is_call_timeout(), "{err:?}");
    assert!(transport.calls() < 5);
}

#[tokio::test(start_paused = true)]
async fn call_deadline_shorter_than_the_attempts_fails_with_call_timeout_async() {
    let busy = ServiceFault::new(503, "busy").into();
    let slow_failure = Step::SlowFault(Duration::from_millis(60), busy);
    let transport = ScriptedTransport::repeating(slow_failure);
    let strategy = RetryStrategy::builder()
        .max_attempts(5)
        .base_delay(Duration::from_millis(1))
        .with_jitter(Jitter::None)
        .build()
        .unwrap();
    let client = callguard::AsyncClient::builder(transport.clone())
        .retry_strategy(strategy)
        .override_config(
            ClientOverrideConfig::builder()
                .api_call_timeout(Duration::from_millis(150))
                .api_call_attempt_timeout(Duration::from_secs(1))
                .build(),
        )
        .build()
        .unwrap();

    let err = client.execute(SdkRequest::get("mem://slow")).await.unwrap_err();
    assert!(err.is_call_timeout(), "{err:?}");
    assert_eq!(transport.calls(), 3);
}

#[test]
fn drained_capacity_pool_stops_retries() {
    let bucket = Arc::new(TokenBucket::new(10).unwrap());
    assert!(bucket.try_acquire(10).acquired);
    assert_eq!(bucket.current(), 0);

    let strategy = RetryStrategy::builder()
        .max_attempts(5)
        .with_jitter(Jitter::None)
        .shared_bucket(bucket.clone())
        .build()
        .unwrap();
    let transport = ScriptedTransport::repeating(service(503));
    let client = SyncClient::builder(transport.clone())
        .retry_strategy(strategy)
        .timer_workers(1)
        .build()
        .unwrap();

    let err = client.execute(SdkRequest::get("mem://thing")).unwrap_err();
    assert_eq!(err.exhaustion_info(), Some((1, ExhaustionReason::CapacityExhausted)));
    assert_eq!(err.root_cause().as_service_fault().map(ServiceFault::status), Some(503));
    assert_eq!(transport.calls(), 1);
    assert_eq!(bucket.current(), 0, "failed calls never refill the pool");
}

#[test]
fn concurrent_withdrawals_never_overdraw_the_pool() {
    let bucket = Arc::new(TokenBucket::new(500).unwrap());
    let granted = Arc::new(AtomicU32::new(0));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let bucket = bucket.clone();
            let granted = granted.clone();
            thread::spawn(move || {
                while bucket.try_acquire(7).acquired {
                    granted.fetch_add(7, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let granted = granted.load(Ordering::SeqCst);
    assert_eq!(granted + bucket.current(), 500);
    assert!(bucket.current() < 7);
}

#[test]
fn cancelling_a_fired_tracker_changes_nothing() {
    let timer = TimerService::dedicated(1).unwrap();
    let fired = Arc::new(AtomicU32::new(0));
    let counter = fired.clone();
    let timeout = Some(Duration::from_millis(10));
    let tracker = TimeoutTracker::arm(&timer, TimeoutScope::Attempt, timeout, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    for _ in 0..200 {
        if tracker.has_fired() && fired.load(Ordering::SeqCst) == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(tracker.state(), TrackerState::Fired);

    assert!(!tracker.cancel());
    assert!(!tracker.cancel());
    assert_eq!(tracker.state(), TrackerState::Fired);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn racing_completions_surface_exactly_one_result() {
    let (done, settled) = completion::<usize>();
    let winners = Arc::new(Mutex::new(Vec::new()));

    let racers: Vec<_> = (0..8)
        .map(|i| {
            let done = done.clone();
            let winners = winners.clone();
            thread::spawn(move || {
                if done.complete(i) {
                    winners.lock().unwrap().push(i);
                }
            })
        })
        .collect();
    for racer in racers {
        racer.join().unwrap();
    }

    let winners = winners.lock().unwrap().clone();
    assert_eq!(winners.len(), 1);
    assert_eq!(settled.await, Some(winners[0]));
    assert!(!done.complete(99));
}

#[test]
fn success_after_a_failure_returns_one_token_to_the_pool() {
    let bucket = Arc::new(TokenBucket::new(500).unwrap());
    let seen_on_retry = Arc::new(AtomicU32::new(0));
    let attempts = Arc::new(AtomicU32::new(0));

    let transport = {
        let bucket = bucket.clone();
        let seen_on_retry = seen_on_retry.clone();
        let attempts = attempts.clone();
        move |_: &SdkRequest, _: &callguard::CancellationToken| -> Result<SdkResponse, SdkError> {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(ServiceFault::new(500, "internal").into());
            }
            seen_on_retry.store(bucket.current(), Ordering::SeqCst);
            Ok(SdkResponse::new(202))
        }
    };
    let strategy = RetryStrategy::builder()
        .base_delay(Duration::from_millis(1))
        .with_jitter(Jitter::None)
        .shared_bucket(bucket.clone())
        .build()
        .unwrap();
    let client = SyncClient::builder(transport)
        .retry_strategy(strategy)
        .timer_workers(1)
        .build()
        .unwrap();

    let response = client.execute(SdkRequest::get("mem://thing")).unwrap();
    assert_eq!(response.status(), 202, "the second attempt's response is returned");
    assert_eq!(seen_on_retry.load(Ordering::SeqCst), 495);
    assert_eq!(bucket.current(), 496);
}

#[test]
fn repeated_retryable_fault_exhausts_at_max_attempts_with_that_fault() {
    let transport = ScriptedTransport::repeating(Step::Fail(
        ServiceFault::new(500, "still broken").with_request_id("req-1").into(),
    ));
    let strategy = RetryStrategy::builder()
        .max_attempts(4)
        .base_delay(Duration::from_millis(1))
        .with_jitter(Jitter::None)
        .build()
        .unwrap();
    let client = SyncClient::builder(transport.clone())
        .retry_strategy(strategy)
        .timer_workers(1)
        .build()
        .unwrap();

    let err = client.execute(SdkRequest::get("mem://thing")).unwrap_err();
    assert!(err.is_retries_exhausted());
    assert_eq!(err.attempts(), Some(4));
    let cause = err.last_cause().and_then(SdkError::as_service_fault).unwrap();
    assert_eq!(cause.message(), "still broken");
    assert_eq!(cause.request_id(), Some("req-1"));
    assert_eq!(transport.calls(), 4);
}

#[test]
fn non_retryable_fault_is_wrapped_after_one_attempt() {
    let transport = ScriptedTransport::repeating(service(400));
    let client = SyncClient::builder(transport.clone()).timer_workers(1).build().unwrap();

    let err = client.execute(SdkRequest::get("mem://thing")).unwrap_err();
    assert_eq!(err.exhaustion_info(), Some((1, ExhaustionReason::NonRetryable)));
    let cause = err.last_cause().and_then(SdkError::as_service_fault);
    assert_eq!(cause.map(ServiceFault::status), Some(400));
}

#[test]
fn retry_after_hint_is_used_verbatim() {
    let hinted = Step::Fail(
        ServiceFault::new(503, "busy").with_retry_after(Duration::from_secs(5)).into(),
    );
    let transport = ScriptedTransport::new([hinted]);
    let sleeper = TrackingSleeper::new();
    let strategy = RetryStrategy::builder()
        .base_delay(Duration::from_millis(10))
        .throttling_base_delay(Duration::from_millis(10))
        .max_backoff(Duration::from_millis(20))
        .build()
        .unwrap();
    let client = SyncClient::builder(transport.clone())
        .retry_strategy(strategy)
        .sleeper(sleeper.clone())
        .timer_workers(1)
        .build()
        .unwrap();

    client.execute(SdkRequest::get("mem://thing")).unwrap();
    assert_eq!(sleeper.calls(), [Duration::from_secs(5)]);
    assert_eq!(transport.calls(), 2);
}

#[test]
fn retry_after_hint_bypasses_backoff_in_classification() {
    let strategy = RetryStrategy::for_mode(RetryMode::Legacy)
        .max_backoff(Duration::from_millis(1))
        .base_delay(Duration::from_millis(1))
        .throttling_base_delay(Duration::from_millis(1))
        .build()
        .unwrap();
    let (mut token, initial) = strategy.acquire_initial_token();
    assert_eq!(initial, Duration::ZERO);

    let mut ctx = callguard::ExecutionContext::default();
    strategy.starting_attempt(&mut token, &mut ctx);
    let fault: SdkError =
        ServiceFault::new(429, "slow down").with_retry_after(Duration::from_secs(5)).into();
    assert_eq!(
        strategy.classify(&mut token, Err(&fault)),
        RetryDecision::Retry(Duration::from_secs(5))
    );
}
