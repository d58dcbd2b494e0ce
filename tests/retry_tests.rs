use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use anyhow::{Result, anyhow};
use marathon::{config::Config, models::retry::RetryConfig, utils::retry_with_backoff};
use tokio::time::Instant;

/// Test: a successful operation runs exactly once
#[tokio::test]
async fn test_success_needs_no_retry() -> Result<()> {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);

    let result = retry_with_backoff(&fast_config(3), || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>("sent")
        }
    })
    .await?;

    assert_eq!(result, "sent");
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    Ok(())
}

/// Test: transient failures are retried until the operation succeeds
#[tokio::test]
async fn test_transient_failures_are_retried() -> Result<()> {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);

    let result = retry_with_backoff(&fast_config(5), || {
        let counter = Arc::clone(&counter);
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(anyhow!("bus unavailable"))
            } else {
                Ok("sent")
            }
        }
    })
    .await?;

    assert_eq!(result, "sent");
    assert_eq!(
        attempts.load(Ordering::SeqCst),
        3,
        "Two failures, then success"
    );

    Ok(())
}

/// Test: a permanent failure stops after exactly max_attempts tries
#[tokio::test]
async fn test_permanent_failure_exhausts_attempts() -> Result<()> {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);

    let result = retry_with_backoff(&fast_config(4), || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(anyhow!("store down"))
        }
    })
    .await;

    assert!(result.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 4);

    Ok(())
}

/// Test: delays grow but never exceed the configured cap
#[tokio::test]
async fn test_backoff_respects_max_delay() -> Result<()> {
    let config = RetryConfig {
        max_attempts: 6,
        initial_delay_ms: 20,
        max_delay_ms: 60,
        backoff_multiplier: 2,
    };

    let start = Instant::now();
    let attempt_times = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let times = Arc::clone(&attempt_times);

    let _ = retry_with_backoff(&config, || {
        let times = Arc::clone(&times);
        async move {
            times.lock().await.push(start.elapsed().as_millis());
            Err::<(), _>(anyhow!("store down"))
        }
    })
    .await;

    let times = attempt_times.lock().await;
    assert_eq!(times.len(), 6);

    for window in times.windows(2) {
        let delay = window[1] - window[0];
        assert!(
            delay <= (config.max_delay_ms * 15 / 10) as u128,
            "Delay {}ms exceeds the cap with jitter headroom",
            delay
        );
    }

    Ok(())
}

/// Test: the worker configuration maps onto the retry knobs
#[test]
fn test_retry_config_comes_from_worker_config() {
    let config = Config {
        max_retry_attempts: 7,
        initial_retry_delay_ms: 123,
        max_retry_delay_ms: 456,
        retry_backoff_multiplier: 3,
        ..Config::default()
    };

    let retry = config.retry_config();
    assert_eq!(retry.max_attempts, 7);
    assert_eq!(retry.initial_delay_ms, 123);
    assert_eq!(retry.max_delay_ms, 456);
    assert_eq!(retry.backoff_multiplier, 3);
}

fn fast_config(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay_ms: 1,
        max_delay_ms: 10,
        backoff_multiplier: 2,
    }
}
