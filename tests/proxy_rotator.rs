// Copyright (C) myl7
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use telescrape::proxy::ProxyRotator;

/// After `mainThreshold + k*proxyThreshold` calls on a `1+m`-entry list
/// (within one pass over the proxy list, `1 <= k <= m`), the cursor lands at
/// `1 + (k mod m)` (spec.md §8, invariant "Proxy Round()").
#[test]
fn round_cursor_arithmetic_matches_the_invariant() {
    let main_threshold = 10u64;
    let proxy_threshold = 3u64;
    let m = 3u64;

    for k in 1..=m {
        let total_calls = main_threshold + k * proxy_threshold;
        let r = ProxyRotator::new(
            vec!["A".into(), "B".into(), "C".into()],
            main_threshold,
            proxy_threshold,
            Duration::from_secs(3600),
        );
        for _ in 0..total_calls {
            r.round();
        }
        let expected_idx = 1 + ((k - 1) % m);
        let expected = ["", "A", "B", "C"][expected_idx as usize];
        assert_eq!(r.current(), expected, "k={k}");
    }
}

#[test]
fn concrete_scenario_main_10_proxy_3() {
    let r = ProxyRotator::new(vec!["A".into(), "B".into(), "C".into()], 10, 3, Duration::from_secs(3600));
    for _ in 0..10 {
        assert_eq!(r.round(), "");
    }
    for expected in ["A", "A", "A", "B", "B", "B", "C", "C", "C", ""] {
        assert_eq!(r.round(), expected);
    }
}
