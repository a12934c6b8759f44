/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use proptest::prelude::*;
use pull_core::Cause;
use pull_core::Chunk;
use pull_core::Exit;
use pull_core::Step;
use pull_queue::Queue;
use pull_queue::Strategy;
use pull_scope::Scope;

use crate::backoff;
use crate::channel::Channel;
use crate::channel::FlatMapOptions;
use crate::channel::HaltStrategy;
use crate::channel::MapEffectOptions;
use crate::channel::MergeAllOptions;
use crate::channel::MergeOptions;
use crate::sink::Sink;
use crate::stream::Stream;
use crate::stream::ThrottleOptions;
use crate::stream::ThrottleStrategy;

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("planned failure {0}")]
struct Planned(u32);

// --- End-to-end scenarios ---

#[tokio::test]
async fn collect_round_trip() {
    let collected = Stream::from_iter(vec![1, 2, 3, 4, 5]).run_collect().await;
    assert_matches!(collected, Ok(values) => assert_eq!(values, vec![1, 2, 3, 4, 5]));
}

#[tokio::test]
async fn map_then_take() {
    let collected = Stream::from_iter(vec![1, 2, 3, 4, 5])
        .map(|n| n * 2)
        .take(3)
        .run_collect()
        .await;
    assert_matches!(collected, Ok(values) => assert_eq!(values, vec![2, 4, 6]));
}

#[tokio::test]
async fn flat_map_sequential_expands_in_order() {
    let collected = Stream::from_iter(vec![1, 2, 3])
        .flat_map(
            |n| Stream::from_iter(vec![n, n * 10]),
            FlatMapOptions::default(),
        )
        .run_collect()
        .await;
    assert_matches!(collected, Ok(values) => assert_eq!(values, vec![1, 10, 2, 20, 3, 30]));
}

#[tokio::test]
async fn merge_is_a_fair_permutation() {
    let collected = Stream::from_iter(vec![1, 2, 3])
        .merge(Stream::from_iter(vec![4, 5, 6]), MergeOptions::default())
        .run_collect()
        .await;
    let mut values = collected.expect("merge succeeds");
    assert_eq!(values.len(), 6);
    values.sort_unstable();
    assert_eq!(values, vec![1, 2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn sink_take_returns_the_leftover() {
    let scope = Scope::root();
    let pull = Stream::from_iter(vec![1, 2, 3, 4, 5])
        .into_channel()
        .into_pull(pull_core::halt_void(), scope.clone())
        .await
        .expect("transform succeeds");
    let end = Sink::<Vec<u32>, u32>::take(3)
        .run(pull, scope.clone())
        .await
        .expect("sink succeeds");
    assert_eq!(end.value, vec![1, 2, 3]);
    assert_eq!(end.leftover, Chunk::from_vec(vec![4, 5]));
    scope.close(Ok(())).await;
}

#[tokio::test]
async fn zip_with_ends_with_the_shorter_side() {
    let left = Stream::from_iter(vec!["a", "b", "c"]);
    let right = Stream::from_iter(vec![1, 2]);
    let collected = left
        .zip_with(right, |s, n| format!("{}{}", s, n))
        .run_collect()
        .await;
    assert_matches!(collected, Ok(values) => assert_eq!(values, vec!["a1", "b2"]));
}

// --- Halt is not an element ---

#[tokio::test]
async fn halt_values_are_never_emitted() {
    let queue: Queue<u32, u32> = Queue::unbounded();
    queue.offer_all(vec![1, 2]).await;
    queue.end(99);
    let collected = Channel::from_queue(queue).run_collect().await;
    assert_matches!(collected, Ok(values) => assert_eq!(values, vec![1, 2]));
}

#[tokio::test]
async fn concat_with_consumes_the_done_value() {
    let queue: Queue<u32, u32> = Queue::unbounded();
    queue.offer(1).await;
    queue.end(10);
    let collected = Channel::from_queue(queue)
        .concat_with(|done| Channel::from_iter(vec![done, done + 1]))
        .run_collect()
        .await;
    assert_matches!(collected, Ok(values) => assert_eq!(values, vec![1, 10, 11]));
}

// --- Chunk structure ---

#[tokio::test]
async fn chunks_are_never_empty() {
    let sizes = Stream::from_iter_chunked(1..=10, 3)
        .filter(|n| n % 2 == 0)
        .into_channel()
        .run_fold(Vec::new(), |mut acc, chunk| {
            acc.push(chunk.len());
            acc
        })
        .await
        .expect("stream succeeds");
    assert!(sizes.iter().all(|len| *len >= 1));
}

#[tokio::test]
async fn filter_that_drops_everything_halts_cleanly() {
    let collected = Stream::from_iter(1..=100).filter(|_| false).run_collect().await;
    assert_matches!(collected, Ok(values) => assert!(values.is_empty()));
}

#[tokio::test]
async fn rechunk_repartitions_and_flushes_the_remainder() {
    let sizes = Stream::from_iter_chunked(1..=10, 3)
        .rechunk(4)
        .into_channel()
        .run_fold(Vec::new(), |mut acc, chunk| {
            acc.push(chunk.len());
            acc
        })
        .await
        .expect("stream succeeds");
    assert_eq!(sizes, vec![4, 4, 2]);
}

// --- Finalization ---

#[tokio::test]
async fn release_runs_exactly_once_on_success() {
    let released = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&released);
    let collected = Stream::acquire_release(
        async { Ok(41u32) },
        |resource| Stream::once(*resource + 1),
        move |_resource, _exit| {
            let probe = Arc::clone(&probe);
            async move {
                probe.fetch_add(1, Ordering::SeqCst);
            }
        },
    )
    .run_collect()
    .await;
    assert_matches!(collected, Ok(values) => assert_eq!(values, vec![42]));
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn release_runs_exactly_once_on_failure() {
    let released = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&released);
    let result = Stream::acquire_release(
        async { Ok(0u32) },
        |_resource| Stream::once(1).concat(Stream::fail(Planned(7))),
        move |_resource, exit| {
            let probe = Arc::clone(&probe);
            async move {
                assert!(exit.is_err());
                probe.fetch_add(1, Ordering::SeqCst);
            }
        },
    )
    .run_collect()
    .await;
    assert!(result.is_err());
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn release_runs_exactly_once_on_interrupt() {
    let released = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&released);
    let running = tokio::spawn(
        Stream::acquire_release(
            async { Ok(0u32) },
            |_resource| Stream::<u32>::never(),
            move |_resource, exit| {
                let probe = Arc::clone(&probe);
                async move {
                    assert_matches!(exit, Err(Cause::Interrupt));
                    probe.fetch_add(1, Ordering::SeqCst);
                }
            },
        )
        .run_drain(),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    running.abort();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn on_exit_observes_the_streams_own_exit() {
    let seen: Arc<std::sync::Mutex<Option<Exit<()>>>> = Arc::new(std::sync::Mutex::new(None));
    let probe = Arc::clone(&seen);
    let result = Stream::<u32>::fail(Planned(3))
        .on_exit(move |exit| async move {
            *probe.lock().expect("lock poisoned") = Some(exit);
        })
        .run_drain()
        .await;
    assert!(result.is_err());
    assert_matches!(
        seen.lock().expect("lock poisoned").clone(),
        Some(Err(Cause::Fail(_)))
    );
}

// --- Concat ---

#[tokio::test]
async fn concat_is_associative() {
    let make = |range: std::ops::Range<u32>| move || Stream::from_iter(range.clone());
    let a = make(0..3);
    let b = make(3..6);
    let c = make(6..9);
    let left = a().concat(b()).concat(c()).run_collect().await.expect("left");
    let right = a().concat(b().concat(c())).run_collect().await.expect("right");
    assert_eq!(left, right);
    assert_eq!(left, (0..9).collect::<Vec<_>>());
}

// --- map_effect ---

#[tokio::test(start_paused = true)]
async fn ordered_map_effect_preserves_input_order() {
    let collected = Stream::from_iter(1..=100u64)
        .map_effect(
            |n| async move {
                // Later elements finish sooner.
                tokio::time::sleep(Duration::from_millis(101 - n)).await;
                Ok(n * 2)
            },
            MapEffectOptions {
                concurrency: 8,
                unordered: false,
            },
        )
        .run_collect()
        .await;
    assert_matches!(collected, Ok(values) => {
        assert_eq!(values, (1..=100u64).map(|n| n * 2).collect::<Vec<_>>());
    });
}

#[tokio::test(start_paused = true)]
async fn ordered_map_effect_with_tiny_concurrency_is_sequential() {
    for concurrency in [1, 2] {
        let collected = Stream::from_iter(1..=10u64)
            .map_effect(
                |n| async move {
                    tokio::time::sleep(Duration::from_millis(11 - n)).await;
                    Ok(n)
                },
                MapEffectOptions {
                    concurrency,
                    unordered: false,
                },
            )
            .run_collect()
            .await;
        assert_matches!(collected, Ok(values) => {
            assert_eq!(values, (1..=10u64).collect::<Vec<_>>());
        });
    }
}

#[tokio::test(start_paused = true)]
async fn unordered_map_effect_emits_every_result() {
    let collected = Stream::from_iter(1..=20u64)
        .map_effect(
            |n| async move {
                tokio::time::sleep(Duration::from_millis(21 - n)).await;
                Ok(n)
            },
            MapEffectOptions {
                concurrency: 4,
                unordered: true,
            },
        )
        .run_collect()
        .await;
    let mut values = collected.expect("map_effect succeeds");
    assert_eq!(values.len(), 20);
    values.sort_unstable();
    assert_eq!(values, (1..=20u64).collect::<Vec<_>>());
}

#[tokio::test]
async fn map_effect_failures_terminate_the_stream() {
    let result = Stream::from_iter(1..=10u32)
        .map_effect(
            |n| async move {
                if n == 3 {
                    Err(Cause::fail(Planned(n)))
                } else {
                    Ok(n)
                }
            },
            MapEffectOptions {
                concurrency: 4,
                unordered: false,
            },
        )
        .run_collect()
        .await;
    let cause = result.expect_err("stream fails");
    assert_eq!(cause.downcast_ref::<Planned>(), Some(&Planned(3)));
}

// --- Merge and races ---

#[tokio::test]
async fn merge_halt_strategy_left_ignores_the_right_halt() {
    // The right side ends immediately; under the Left strategy the merge
    // keeps producing until the left side ends.
    let left = Stream::from_iter(1..=5);
    let right = Stream::empty();
    let collected = left
        .merge(
            right,
            MergeOptions {
                halt_strategy: HaltStrategy::Left,
                ..MergeOptions::default()
            },
        )
        .run_collect()
        .await;
    let mut values = collected.expect("merge succeeds");
    values.sort_unstable();
    assert_eq!(values, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn merge_errors_terminate_immediately() {
    let result = Stream::<u32>::never()
        .merge(Stream::fail(Planned(1)), MergeOptions::default())
        .run_collect()
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn merge_all_respects_the_switch_option() {
    let streams = vec![
        Stream::<u32>::never(),
        Stream::<u32>::never(),
        Stream::from_iter(vec![9]),
    ];
    let collected = Stream::merge_all(
        streams,
        MergeAllOptions {
            concurrency: 1,
            switch: true,
            ..MergeAllOptions::default()
        },
    )
    .run_collect()
    .await;
    assert_matches!(collected, Ok(values) => assert_eq!(values, vec![9]));
}

#[tokio::test]
async fn race_selects_the_first_emitter() {
    let collected = Stream::once(1).race(Stream::never()).run_collect().await;
    assert_matches!(collected, Ok(values) => assert_eq!(values, vec![1]));
}

// --- Broadcast and share ---

#[tokio::test]
async fn broadcast_delivers_everything_to_every_subscriber() {
    let scope = Scope::root();
    let consumers = Stream::from_iter(1..=20u32)
        .broadcast(&scope, 3, 64, Strategy::Suspend)
        .await;
    let mut handles = Vec::new();
    for consumer in consumers {
        handles.push(tokio::spawn(consumer.run_collect()));
    }
    for handle in handles {
        let collected = handle.await.expect("consumer task").expect("consumer");
        assert_eq!(collected, (1..=20u32).collect::<Vec<_>>());
    }
    scope.close(Ok(())).await;
}

#[tokio::test]
async fn share_restarts_the_pipeline_after_the_last_unsubscribe() {
    let starts = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&starts);
    let share = Stream::share(
        move || {
            probe.fetch_add(1, Ordering::SeqCst);
            Stream::from_iter(1..=5u32)
        },
        crate::ShareOptions {
            capacity: 64,
            ..crate::ShareOptions::default()
        },
    );
    let first = share.stream().run_collect().await.expect("first run");
    assert_eq!(first, vec![1, 2, 3, 4, 5]);
    let second = share.stream().run_collect().await.expect("second run");
    assert_eq!(second, vec![1, 2, 3, 4, 5]);
    assert_eq!(starts.load(Ordering::SeqCst), 2);
}

// --- Sinks ---

#[tokio::test]
async fn sink_flat_map_feeds_the_leftover_forward() {
    let collected = Stream::from_iter(vec![1, 2, 3, 4, 5])
        .run(Sink::take(3).flat_map(|first| {
            Sink::take(2).map(move |second| (first, second))
        }))
        .await;
    assert_matches!(collected, Ok((first, second)) => {
        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(second, vec![4, 5]);
    });
}

#[tokio::test]
async fn sink_fold_while_stops_and_returns_the_rest() {
    let scope = Scope::root();
    let pull = Stream::from_iter(vec![1, 2, 3, 4, 5])
        .into_channel()
        .into_pull(pull_core::halt_void(), scope.clone())
        .await
        .expect("transform succeeds");
    let end = Sink::fold_while(0u32, |acc| *acc < 6, |acc, n| acc + n)
        .run(pull, scope.clone())
        .await
        .expect("sink succeeds");
    // 1 + 2 + 3 = 6 stops the fold; 4 and 5 are leftover.
    assert_eq!(end.value, 6);
    assert_eq!(end.leftover, Chunk::from_vec(vec![4, 5]));
    scope.close(Ok(())).await;
}

#[tokio::test]
async fn assorted_sinks() {
    assert_matches!(
        Stream::from_iter(vec![1u32, 2, 3]).run(Sink::sum()).await,
        Ok(6)
    );
    assert_matches!(
        Stream::from_iter(vec![1u32, 2, 3]).run(Sink::count()).await,
        Ok(3)
    );
    assert_matches!(
        Stream::from_iter(vec![1u32, 2, 3]).run(Sink::last()).await,
        Ok(Some(3))
    );
    assert_matches!(
        Stream::from_iter(vec![1u32, 2, 3]).run(Sink::head()).await,
        Ok(Some(1))
    );
    assert_matches!(
        Stream::from_iter(vec![1u32, 2, 3])
            .run(Sink::find(|n| n % 2 == 0))
            .await,
        Ok(Some(2))
    );
    assert_matches!(
        Stream::from_iter(vec!["a", "b", "c"])
            .run(Sink::mk_string(", "))
            .await,
        Ok(rendered) => assert_eq!(rendered, "a, b, c")
    );
}

// --- Error handling ---

#[tokio::test]
async fn catch_recovers_only_failures() {
    let recovered = Stream::once(1)
        .concat(Stream::fail(Planned(2)))
        .catch(|_err| Stream::from_iter(vec![8, 9]))
        .run_collect()
        .await;
    assert_matches!(recovered, Ok(values) => assert_eq!(values, vec![1, 8, 9]));

    let defect = Stream::<u32>::die(Planned(2))
        .catch(|_err| Stream::once(0))
        .run_collect()
        .await;
    let cause = defect.expect_err("defects are not caught");
    assert!(cause.is_defect());
}

#[tokio::test]
async fn catch_tag_matches_on_the_error_type() {
    let recovered = Stream::<u32>::fail(Planned(5))
        .catch_tag::<Planned, _>(|err| {
            let n = err.downcast_ref::<Planned>().map(|p| p.0).unwrap_or(0);
            Stream::once(n)
        })
        .run_collect()
        .await;
    assert_matches!(recovered, Ok(values) => assert_eq!(values, vec![5]));

    let unmatched = Stream::<u32>::fail(anyhow::anyhow!("other"))
        .catch_tag::<Planned, _>(|_| Stream::once(0))
        .run_collect()
        .await;
    assert!(unmatched.is_err());
}

#[tokio::test]
async fn or_die_turns_failures_into_defects() {
    let cause = Stream::<u32>::fail(Planned(1))
        .or_die()
        .run_collect()
        .await
        .expect_err("stream fails");
    assert!(cause.is_defect());
}

#[tokio::test]
async fn pipe_to_or_fail_hides_upstream_failures_from_the_transducer() {
    let upstream: Channel<u32> = Channel::from_iter(vec![1]).concat(Channel::fail(Planned(4)));
    let transducer: Channel<u32, (), u32, ()> =
        Channel::new(|upstream, _scope| async move { Ok(upstream) });
    let result = upstream
        .pipe_to_or_fail(transducer.catch(|_err| panic!("the transducer saw the failure")))
        .run_collect()
        .await;
    // Restored to an ordinary failure at the boundary.
    let cause = result.expect_err("failure propagates");
    assert_eq!(cause.downcast_ref::<Planned>(), Some(&Planned(4)));
    assert!(cause.is_failure());
}

#[tokio::test]
async fn retry_reruns_the_factory_with_backoff() {
    tokio::time::pause();
    let collected = Stream::retry(
        |attempt| {
            if attempt < 3 {
                Stream::from_iter(vec![attempt as u32]).concat(Stream::fail(Planned(0)))
            } else {
                Stream::from_iter(vec![7, 8])
            }
        },
        backoff::fixed(Duration::from_millis(10)).take(5),
    )
    .run_collect()
    .await;
    assert_matches!(collected, Ok(values) => assert_eq!(values, vec![1, 2, 7, 8]));
}

#[tokio::test]
async fn retry_gives_up_when_the_backoff_runs_dry() {
    tokio::time::pause();
    let attempts = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&attempts);
    let result = Stream::<u32>::retry(
        move |_attempt| {
            probe.fetch_add(1, Ordering::SeqCst);
            Stream::fail(Planned(1))
        },
        backoff::fixed(Duration::from_millis(1)).take(2),
    )
    .run_collect()
    .await;
    assert!(result.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

// --- Signals and time ---

#[tokio::test]
async fn halt_when_ends_cleanly() {
    let collected = Stream::<u32>::never()
        .halt_when(async { Ok(()) })
        .run_collect()
        .await;
    assert_matches!(collected, Ok(values) => assert!(values.is_empty()));
}

#[tokio::test]
async fn interrupt_when_fails_with_interrupt() {
    let result = Stream::<u32>::never()
        .interrupt_when(async { Ok(()) })
        .run_collect()
        .await;
    assert_matches!(result, Err(Cause::Interrupt));
}

#[tokio::test(start_paused = true)]
async fn timeout_halts_on_idle_upstream() {
    let collected = Stream::once(1u32)
        .concat(Stream::never())
        .timeout(Duration::from_millis(100))
        .run_collect()
        .await;
    assert_matches!(collected, Ok(values) => assert_eq!(values, vec![1]));
}

#[tokio::test(start_paused = true)]
async fn throttle_shape_paces_the_stream() {
    let started = tokio::time::Instant::now();
    let collected = Stream::from_iter_chunked(1..=3u32, 1)
        .throttle(
            |_chunk| 1,
            ThrottleOptions {
                units: 1,
                duration: Duration::from_millis(100),
                burst: 0,
                strategy: ThrottleStrategy::Shape,
            },
        )
        .run_collect()
        .await;
    assert_matches!(collected, Ok(values) => assert_eq!(values, vec![1, 2, 3]));
    // One token is available up front; the other two chunks wait a full
    // refill each.
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn throttle_shape_admits_chunks_costing_more_than_the_bucket() {
    let started = tokio::time::Instant::now();
    let collected = Stream::from_iter_chunked(1..=2u32, 1)
        .throttle(
            |chunk| if *chunk.first() == 1 { 5 } else { 1 },
            ThrottleOptions {
                units: 1,
                duration: Duration::from_millis(100),
                burst: 0,
                strategy: ThrottleStrategy::Shape,
            },
        )
        .run_collect()
        .await;
    assert_matches!(collected, Ok(values) => assert_eq!(values, vec![1, 2]));
    // The oversized first chunk waits for the four tokens it is short of
    // and leaves the bucket four in debt; the second chunk then owes
    // five more refill periods.
    assert!(started.elapsed() >= Duration::from_millis(900));
}

#[tokio::test(start_paused = true)]
async fn throttle_enforce_drops_oversized_chunks() {
    let collected = Stream::from_iter_chunked(1..=5u32, 1)
        .throttle(
            |chunk| if *chunk.first() == 3 { 1000 } else { 0 },
            ThrottleOptions {
                units: 1,
                duration: Duration::from_millis(100),
                burst: 0,
                strategy: ThrottleStrategy::Enforce,
            },
        )
        .run_collect()
        .await;
    assert_matches!(collected, Ok(values) => assert_eq!(values, vec![1, 2, 4, 5]));
}

#[tokio::test(start_paused = true)]
async fn debounce_keeps_the_quiet_period_survivor() {
    let stream = Stream::callback(
        |queue: Queue<u32, ()>| async move {
            queue.offer(1).await;
            queue.offer(2).await;
            tokio::time::sleep(Duration::from_millis(300)).await;
            queue.offer(3).await;
            queue.end(());
            Ok(())
        },
        crate::CallbackOptions::default(),
    );
    let collected = stream.debounce(Duration::from_millis(100)).run_collect().await;
    assert_matches!(collected, Ok(values) => assert_eq!(values, vec![2, 3]));
}

// --- Aggregation ---

#[tokio::test]
async fn aggregate_reruns_the_sink_with_leftovers() {
    let collected = Stream::from_iter(1..=5u32)
        .aggregate(|| Sink::take(2))
        .run_collect()
        .await;
    assert_matches!(collected, Ok(values) => {
        assert_eq!(values, vec![vec![1, 2], vec![3, 4], vec![5]]);
    });
}

#[tokio::test(start_paused = true)]
async fn aggregate_within_flushes_on_the_timer() {
    let stream = Stream::callback(
        |queue: Queue<u32, ()>| async move {
            queue.offer(1).await;
            queue.offer(2).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
            queue.offer(3).await;
            queue.end(());
            Ok(())
        },
        crate::CallbackOptions::default(),
    );
    let collected = stream
        .aggregate_within(Sink::collect_all, Duration::from_millis(100))
        .run_collect()
        .await;
    let windows: Vec<Vec<u32>> = collected
        .expect("aggregate succeeds")
        .into_iter()
        .filter(|window| !window.is_empty())
        .collect();
    assert_eq!(windows, vec![vec![1, 2], vec![3]]);
}

// --- group_by ---

#[tokio::test]
async fn group_by_partitions_by_key() {
    let groups = Stream::from_iter(0..10u32)
        .group_by(|n| n % 2, crate::GroupByOptions::default())
        .run_collect()
        .await
        .expect("group_by succeeds");
    assert_eq!(groups.len(), 2);
    for (key, sub) in groups {
        let values = sub.run_collect().await.expect("sub-stream succeeds");
        assert!(values.iter().all(|n| n % 2 == key));
        assert_eq!(values.len(), 5);
    }
}

// --- zip_latest ---

#[tokio::test]
async fn zip_latest_emits_pairs_of_latest_values() {
    let collected = Stream::once(1u32)
        .zip_latest(Stream::from_iter(vec![10u32, 20]))
        .run_collect()
        .await
        .expect("zip_latest succeeds");
    assert!(!collected.is_empty());
    assert_eq!(*collected.last().expect("non-empty"), (1, 20));
    assert!(collected.iter().all(|(left, _)| *left == 1));
}

#[tokio::test]
async fn zip_latest_halts_when_a_side_ends_without_emitting() {
    let collected = Stream::<u32>::empty()
        .zip_latest(Stream::from_iter(vec![1u32, 2, 3]))
        .run_collect()
        .await
        .expect("zip_latest succeeds");
    assert!(collected.is_empty());
}

#[tokio::test]
async fn zip_latest_all_waits_for_every_source() {
    let rows = Stream::zip_latest_all(vec![
        Stream::from_iter(vec![1u32]),
        Stream::from_iter(vec![2u32]),
        Stream::from_iter(vec![3u32]),
    ])
    .run_collect()
    .await
    .expect("zip_latest_all succeeds");
    assert!(!rows.is_empty());
    let mut last = rows.last().expect("non-empty").clone();
    last.sort_unstable();
    assert_eq!(last, vec![1, 2, 3]);
}

// --- Queues, buffering, embedding ---

#[tokio::test]
async fn buffer_preserves_content() {
    let collected = Stream::from_iter(1..=50u32)
        .buffer(1, Strategy::Suspend)
        .run_collect()
        .await;
    assert_matches!(collected, Ok(values) => assert_eq!(values, (1..=50).collect::<Vec<_>>()));
}

#[tokio::test]
async fn callback_streams_what_the_queue_receives() {
    let collected = Stream::callback(
        |queue: Queue<u32, ()>| async move {
            for n in 1..=5 {
                queue.offer(n).await;
            }
            queue.end(());
            Ok(())
        },
        crate::CallbackOptions::default(),
    )
    .run_collect()
    .await;
    assert_matches!(collected, Ok(values) => assert_eq!(values, vec![1, 2, 3, 4, 5]));
}

#[tokio::test]
async fn callback_failures_fail_the_stream() {
    let result = Stream::<u32>::callback(
        |_queue| async move { Err(Cause::fail(Planned(1))) },
        crate::CallbackOptions::default(),
    )
    .run_collect()
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn embed_input_feeds_the_channel_through_a_side_writer() {
    let queue: Queue<u32, ()> = Queue::unbounded();
    let writer_queue = queue.clone();
    let channel: Channel<u32, (), (), ()> =
        Channel::<u32, (), (), ()>::from_queue(queue).embed_input(move |_upstream: pull_core::Pull<(), ()>| {
            let queue = writer_queue;
            async move {
                queue.offer_all(vec![1, 2, 3]).await;
                queue.end(());
                Ok(())
            }
        });
    let collected = channel.run_collect().await;
    assert_matches!(collected, Ok(values) => assert_eq!(values, vec![1, 2, 3]));
}

#[tokio::test]
async fn run_into_queue_forwards_the_terminal() {
    let queue: Queue<u32, ()> = Queue::unbounded();
    Stream::from_iter(vec![1, 2, 3])
        .run_into_queue(queue.clone())
        .await
        .expect("run succeeds");
    assert_matches!(queue.take().await, Step::Emit(1));
    assert_matches!(queue.take().await, Step::Emit(2));
    assert_matches!(queue.take().await, Step::Emit(3));
    assert_matches!(queue.take().await, Step::Halt(()));
}

#[tokio::test]
async fn shared_pull_allows_two_consumers_to_alternate() {
    let scope = Scope::root();
    let shared = Stream::from_iter_chunked(1..=4u32, 1)
        .into_shared_pull(&scope)
        .await
        .expect("transform succeeds");
    let other = shared.clone();
    let mut seen = Vec::new();
    loop {
        match other.next().await {
            Step::Emit(chunk) => seen.extend(chunk),
            Step::Halt(()) => break,
            Step::Fail(cause) => panic!("unexpected failure: {}", cause),
        }
        match shared.next().await {
            Step::Emit(chunk) => seen.extend(chunk),
            Step::Halt(()) => break,
            Step::Fail(cause) => panic!("unexpected failure: {}", cause),
        }
    }
    assert_eq!(seen, vec![1, 2, 3, 4]);
    scope.close(Ok(())).await;
}

// --- Misc stream transforms ---

#[tokio::test]
async fn take_drop_and_friends() {
    assert_matches!(
        Stream::from_iter(1..=10).take_while(|n| *n < 4).run_collect().await,
        Ok(values) => assert_eq!(values, vec![1, 2, 3])
    );
    assert_matches!(
        Stream::from_iter(1..=10).take_until(|n| *n == 4).run_collect().await,
        Ok(values) => assert_eq!(values, vec![1, 2, 3, 4])
    );
    assert_matches!(
        Stream::from_iter(1..=10).drop(7).run_collect().await,
        Ok(values) => assert_eq!(values, vec![8, 9, 10])
    );
    assert_matches!(
        Stream::from_iter(1..=10).drop_while(|n| *n < 9).run_collect().await,
        Ok(values) => assert_eq!(values, vec![9, 10])
    );
    assert_matches!(
        Stream::from_iter(1..=5).map_accum(0u32, |acc, n| (acc + n, acc + n)).run_collect().await,
        Ok(values) => assert_eq!(values, vec![1, 3, 6, 10, 15])
    );
}

#[tokio::test]
async fn unfold_emits_until_none() {
    let collected = Stream::unfold(0u32, |state| async move {
        if state < 4 {
            Ok(Some((state, state + 1)))
        } else {
            Ok(None)
        }
    })
    .run_collect()
    .await;
    assert_matches!(collected, Ok(values) => assert_eq!(values, vec![0, 1, 2, 3]));
}

#[tokio::test]
async fn flat_map_concurrent_covers_every_element() {
    let collected = Stream::from_iter(1..=5u32)
        .flat_map(
            |n| Stream::from_iter(vec![n, n * 10]),
            FlatMapOptions {
                concurrency: 3,
                ..FlatMapOptions::default()
            },
        )
        .run_collect()
        .await;
    let mut values = collected.expect("flat_map succeeds");
    assert_eq!(values.len(), 10);
    values.sort_unstable();
    let mut expected: Vec<u32> = (1..=5).flat_map(|n| vec![n, n * 10]).collect();
    expected.sort_unstable();
    assert_eq!(values, expected);
}

// --- Property: ordered map_effect under arbitrary delays ---

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]
    #[test]
    fn proptest_ordered_map_effect(delays in prop::collection::vec(0u64..50, 1..64)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .expect("tokio builder succeeded");
        runtime.block_on(async move {
            let inputs: Vec<usize> = (0..delays.len()).collect();
            let delays = Arc::new(delays);
            let collected = Stream::from_iter(inputs.clone())
                .map_effect(
                    move |n| {
                        let delays = Arc::clone(&delays);
                        async move {
                            tokio::time::sleep(Duration::from_millis(delays[n])).await;
                            Ok(n)
                        }
                    },
                    MapEffectOptions {
                        concurrency: 5,
                        unordered: false,
                    },
                )
                .run_collect()
                .await
                .expect("map_effect succeeds");
            assert_eq!(collected, inputs);
        });
    }
}
