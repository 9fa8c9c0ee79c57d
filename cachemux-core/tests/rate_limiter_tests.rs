use cachemux_core::{ErrorCode, RateLimitConfig, RateLimitPolicy, RateLimitRule, RateLimiter};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_queue_serves_waiters_in_arrival_order() {
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default().with_default_rule(
        RateLimitRule::new(1, Duration::from_secs(1), RateLimitPolicy::Queue { queue_size: 8 }),
    )));
    limiter.check_limit("get", 1).await.unwrap();

    let admitted = Arc::new(Mutex::new(Vec::new()));
    let mut waiters = Vec::new();
    for i in 0..3 {
        let limiter = Arc::clone(&limiter);
        let admitted = Arc::clone(&admitted);
        waiters.push(tokio::spawn(async move {
            limiter.check_limit("get", 1).await.unwrap();
            admitted.lock().push(i);
        }));
        // Let each waiter enqueue before the next arrives
        tokio::task::yield_now().await;
    }
    for waiter in waiters {
        waiter.await.unwrap();
    }

    assert_eq!(*admitted.lock(), vec![0, 1, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reject_mode_admits_exactly_the_limit_under_contention() {
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default().with_default_rule(
        RateLimitRule::new(10, Duration::from_secs(60), RateLimitPolicy::Reject),
    )));
    let admitted = Arc::new(AtomicU32::new(0));
    let rejected = Arc::new(AtomicU32::new(0));

    let tasks: Vec<_> = (0..100)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            let admitted = Arc::clone(&admitted);
            let rejected = Arc::clone(&rejected);
            tokio::spawn(async move {
                match limiter.check_limit("set", 1).await {
                    Ok(()) => admitted.fetch_add(1, Ordering::SeqCst),
                    Err(e) => {
                        assert_eq!(e.code(), ErrorCode::RateLimitExceeded);
                        rejected.fetch_add(1, Ordering::SeqCst)
                    }
                };
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(admitted.load(Ordering::SeqCst), 10);
    assert_eq!(rejected.load(Ordering::SeqCst), 90);
    assert_eq!(limiter.current_usage("set"), 10);
}

#[tokio::test(start_paused = true)]
async fn test_sliding_window_frees_capacity_gradually() {
    let limiter = RateLimiter::new(RateLimitConfig::default().with_default_rule(
        RateLimitRule::new(2, Duration::from_secs(10), RateLimitPolicy::Reject),
    ));

    limiter.check_limit("op", 1).await.unwrap();
    tokio::time::advance(Duration::from_secs(6)).await;
    limiter.check_limit("op", 1).await.unwrap();
    assert!(limiter.check_limit("op", 1).await.is_err());

    // The first sample leaves the window; the second is still inside
    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(limiter.current_usage("op"), 1);
    limiter.check_limit("op", 1).await.unwrap();
    assert!(limiter.check_limit("op", 1).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_batch_counts_consume_capacity() {
    let limiter = RateLimiter::new(
        RateLimitConfig::default()
            .with_rule("get_many", RateLimitRule::new(5, Duration::from_secs(1), RateLimitPolicy::Burst)),
    );

    limiter.check_limit("get_many", 8).await.unwrap();
    assert_eq!(limiter.current_usage("get_many"), 8);
    assert!(limiter.check_limit("get_many", 3).await.is_err());
    limiter.check_limit("get_many", 2).await.unwrap();
}
