// Copyright (C) myl7
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use telescrape::cache::Cache;

#[tokio::test]
async fn ttl_expires_and_is_evicted() {
    let cache: Cache<&'static str> = Cache::new();
    cache.set_value("channel", "record", Duration::from_millis(20)).await;
    assert_eq!(cache.value("channel").await, Some("record"));

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(cache.value("channel").await, None);
    assert_eq!(cache.stats().await.len, 0);
}

#[tokio::test]
async fn periodic_sweep_evicts_without_a_read() {
    let cache = std::sync::Arc::new(Cache::<i32>::new());
    cache.set_value("a", 1, Duration::from_millis(10)).await;
    cache.set_value("b", 2, Duration::from_secs(3600)).await;

    let handle = Cache::check_every(&cache, Duration::from_millis(15));
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(cache.stats().await.len, 1);
    handle.cancel();
}
