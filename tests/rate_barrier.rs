// Copyright (C) myl7
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use telescrape::barrier::Barrier;

#[test]
fn admissions_equal_limit_within_window() {
    let barrier = Barrier::new();
    let window = Duration::from_secs(60);
    let mut admitted = 0;
    for _ in 0..10 {
        if barrier.admit("info", 5, window) {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 5);
}

#[test]
fn window_crossing_fully_resets_the_count() {
    let barrier = Barrier::new();
    let window = Duration::from_millis(15);
    assert!(barrier.admit("msgs", 1, window));
    assert!(!barrier.admit("msgs", 1, window));

    std::thread::sleep(Duration::from_millis(30));
    assert!(barrier.admit("msgs", 1, window));
}
