use bulwark_core::rate_limit::unix_now;
use bulwark_core::traits::{WindowRequest, WindowStore};
use bulwark_core::{RateLimitConfig, RateLimiter};

use crate::integration::common::setup_test_store;

fn request(key: &str, now: f64, limit: u64, cost: u64) -> WindowRequest<'_> {
    WindowRequest {
        key,
        now,
        window_seconds: 60,
        limit,
        cost,
        ttl_seconds: 120,
    }
}

#[tokio::test]
async fn sixth_request_is_rejected() {
    let (store, _container) = setup_test_store().await;
    let limiter = RateLimiter::new(store, RateLimitConfig::new(5, 60));

    for _ in 0..5 {
        assert!(limiter.admit("insee:acme", 1).await.0);
    }
    let (allowed, info) = limiter.admit("insee:acme", 1).await;
    assert!(!allowed);
    assert!(info.retry_after.unwrap() > 0.0);
    assert_eq!(info.current_score, 5);
}

#[tokio::test]
async fn costs_are_summed() {
    let (store, _container) = setup_test_store().await;
    let now = unix_now();

    let first = store.admit(&request("k", now, 10, 6)).await.unwrap();
    assert!(first.allowed);
    assert_eq!(first.tally.score, 6);
    assert_eq!(first.tally.count, 1);

    let rejected = store.admit(&request("k", now + 0.1, 10, 5)).await.unwrap();
    assert!(!rejected.allowed);
    assert_eq!(rejected.tally.score, 6);

    let fits = store.admit(&request("k", now + 0.2, 10, 4)).await.unwrap();
    assert!(fits.allowed);
    assert_eq!(fits.tally.score, 10);
    assert_eq!(fits.tally.count, 2);
}

#[tokio::test]
async fn entries_leave_the_window() {
    let (store, _container) = setup_test_store().await;
    let start = 1_700_000_000.0;

    assert!(store.admit(&request("k", start, 1, 1)).await.unwrap().allowed);
    assert!(!store.admit(&request("k", start + 30.0, 1, 1)).await.unwrap().allowed);

    let later = store.admit(&request("k", start + 61.0, 1, 1)).await.unwrap();
    assert!(later.allowed);
    assert_eq!(later.tally.oldest, Some(start + 61.0));
}

#[tokio::test]
async fn tally_does_not_mutate_and_clear_resets() {
    let (store, _container) = setup_test_store().await;
    let now = unix_now();

    store.admit(&request("k", now, 5, 2)).await.unwrap();
    let first = store.tally("k", now + 1.0, 60).await.unwrap();
    let second = store.tally("k", now + 1.0, 60).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.score, 2);

    store.clear("k").await.unwrap();
    let cleared = store.tally("k", now + 1.0, 60).await.unwrap();
    assert_eq!(cleared.count, 0);
    assert_eq!(cleared.oldest, None);
}

#[tokio::test]
async fn concurrent_admissions_never_exceed_limit() {
    let (store, _container) = setup_test_store().await;
    let limiter = RateLimiter::new(store, RateLimitConfig::new(10, 60));

    let attempts = (0..40).map(|_| {
        let limiter = limiter.clone();
        tokio::spawn(async move { limiter.admit("shared", 1).await.0 })
    });
    let admitted = futures::future::join_all(attempts)
        .await
        .into_iter()
        .filter(|r| *r.as_ref().unwrap())
        .count();

    assert_eq!(admitted, 10);
    let status = limiter.get_status("shared").await.unwrap();
    assert_eq!(status.current_score, 10);
    assert_eq!(status.remaining, 0);
}
