/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

//! Backoff interval iterators for [`Stream::retry`](crate::Stream::retry).
//!
//! A backoff is just an `Iterator<Item = Duration>`; limit attempts with
//! `take`, cap intervals with [`capped`], add randomness with
//! [`jittered`].

use std::time::Duration;

/// The same interval between every attempt.
pub fn fixed(interval: Duration) -> impl Iterator<Item = Duration> + Send {
    std::iter::repeat(interval)
}

/// Intervals multiplied by `base` after each attempt.
pub fn exponential(initial: Duration, base: f64) -> impl Iterator<Item = Duration> + Send {
    std::iter::successors(Some(initial), move |interval| Some(interval.mul_f64(base)))
}

/// Binary exponential backoff: each interval doubles.
pub fn binary_exponential(initial: Duration) -> impl Iterator<Item = Duration> + Send {
    exponential(initial, 2.0)
}

/// Each interval is the sum of the previous two.
pub fn fibonacci(initial: Duration) -> impl Iterator<Item = Duration> + Send {
    std::iter::successors(Some((initial, initial)), |(current, next)| {
        Some((*next, *current + *next))
    })
    .map(|(current, _)| current)
}

/// Add a uniformly random delay between zero and `jitter` to every
/// interval.
pub fn jittered<B>(inner: B, jitter: Duration) -> impl Iterator<Item = Duration> + Send
where
    B: Iterator<Item = Duration> + Send,
{
    inner.map(move |interval| interval + jitter.mul_f64(rand::random::<f64>()))
}

/// Clamp every interval to at most `max`.
pub fn capped<B>(inner: B, max: Duration) -> impl Iterator<Item = Duration> + Send
where
    B: Iterator<Item = Duration> + Send,
{
    inner.map(move |interval| interval.min(max))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn binary_exponential_doubles() {
        let intervals: Vec<_> = binary_exponential(Duration::from_millis(100))
            .take(4)
            .collect();
        assert_eq!(
            intervals,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
    }

    #[test]
    fn fibonacci_sums_the_previous_two() {
        let intervals: Vec<_> = fibonacci(Duration::from_millis(100)).take(5).collect();
        assert_eq!(
            intervals,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
                Duration::from_millis(500),
            ]
        );
    }

    #[test]
    fn jitter_stays_in_range() {
        for interval in jittered(fixed(Duration::from_millis(100)), Duration::from_millis(50))
            .take(32)
        {
            assert!(interval >= Duration::from_millis(100));
            assert!(interval <= Duration::from_millis(150));
        }
    }

    #[test]
    fn capped_clamps() {
        let intervals: Vec<_> = capped(
            binary_exponential(Duration::from_millis(100)),
            Duration::from_millis(250),
        )
        .take(3)
        .collect();
        assert_eq!(
            intervals,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(250),
            ]
        );
    }
}
