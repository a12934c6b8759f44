/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use pull_core::Pull;
use pull_core::Step;
use pull_queue::Queue;
use pull_queue::Strategy;
use slog::debug;
use tokio::time::Instant;

use crate::channel::scoped_pull;
use crate::channel::Channel;
use crate::stream::Stream;
use crate::DEFAULT_GROUP_BUFFER;

/// Options of [`Stream::group_by`].
#[derive(Copy, Clone, Debug)]
pub struct GroupByOptions {
    /// Per-key queue capacity; offers suspend when a group's consumer
    /// lags this far behind.
    pub buffer_size: usize,
    /// Evict a group after this long without traffic. The key starts a
    /// fresh group (and a fresh sub-stream) if it shows up again.
    pub idle_timeout: Option<Duration>,
}

impl Default for GroupByOptions {
    fn default() -> Self {
        GroupByOptions {
            buffer_size: DEFAULT_GROUP_BUFFER,
            idle_timeout: None,
        }
    }
}

struct Group<A> {
    queue: Queue<A, ()>,
    last_touch: Instant,
}

type Groups<K, A> = Arc<Mutex<HashMap<K, Group<A>>>>;

impl<A> Stream<A>
where
    A: Send + 'static,
{
    /// Partition the stream by key, emitting each key exactly once per
    /// group lifetime, paired with the sub-stream of its elements.
    ///
    /// Back-pressure is per group: an unconsumed sub-stream eventually
    /// suspends the partitioning of the whole stream once its buffer
    /// fills.
    pub fn group_by<K, F>(self, mut f: F, options: GroupByOptions) -> Stream<(K, Stream<A>)>
    where
        K: Clone + Eq + Hash + Send + 'static,
        F: FnMut(&A) -> K + Send + 'static,
    {
        let channel = self.channel;
        Stream::from_channel(Channel::new(move |_upstream, scope| async move {
            let mut pull = channel.into_pull(Pull::halt(()), scope.clone()).await?;
            scoped_pull(&scope, move |child| async move {
                let out: Queue<(K, Stream<A>), ()> = Queue::unbounded();
                let teardown = out.clone();
                child
                    .defer(async move {
                        teardown.shutdown();
                    })
                    .await;
                let groups: Groups<K, A> = Arc::new(Mutex::new(HashMap::new()));

                if let Some(idle) = options.idle_timeout {
                    let sweeper_groups = Arc::clone(&groups);
                    let logger = child.logger().clone();
                    child
                        .spawn(async move {
                            loop {
                                tokio::time::sleep(idle / 2).await;
                                let now = Instant::now();
                                let mut evicted = 0usize;
                                {
                                    let mut map =
                                        sweeper_groups.lock().expect("lock poisoned");
                                    map.retain(|_, group| {
                                        if now.duration_since(group.last_touch) >= idle {
                                            group.queue.end(());
                                            evicted += 1;
                                            false
                                        } else {
                                            true
                                        }
                                    });
                                }
                                if evicted > 0 {
                                    debug!(logger, "evicted {} idle groups", evicted);
                                }
                            }
                        })
                        .await
                        .detach();
                }

                let pump_groups = Arc::clone(&groups);
                let outer = out.clone();
                child
                    .spawn(async move {
                        'pump: loop {
                            match pull.next().await {
                                Step::Emit(chunk) => {
                                    for value in chunk {
                                        let key = f(&value);
                                        let (queue, fresh) = {
                                            let mut map =
                                                pump_groups.lock().expect("lock poisoned");
                                            match map.get_mut(&key) {
                                                Some(group) => {
                                                    group.last_touch = Instant::now();
                                                    (group.queue.clone(), false)
                                                }
                                                None => {
                                                    let queue = Queue::bounded(
                                                        options.buffer_size,
                                                        Strategy::Suspend,
                                                    );
                                                    map.insert(
                                                        key.clone(),
                                                        Group {
                                                            queue: queue.clone(),
                                                            last_touch: Instant::now(),
                                                        },
                                                    );
                                                    (queue, true)
                                                }
                                            }
                                        };
                                        if fresh
                                            && !outer
                                                .offer((
                                                    key,
                                                    Stream::from_queue(queue.clone()),
                                                ))
                                                .await
                                        {
                                            break 'pump;
                                        }
                                        queue.offer(value).await;
                                    }
                                }
                                Step::Halt(()) => {
                                    finish_groups(&pump_groups, None);
                                    outer.end(());
                                    break;
                                }
                                Step::Fail(cause) => {
                                    finish_groups(&pump_groups, Some(cause.clone()));
                                    outer.fail_cause(cause);
                                    break;
                                }
                            }
                        }
                    })
                    .await
                    .detach();
                Ok(out.chunk_pull())
            })
            .await
        }))
    }
}

fn finish_groups<K, A>(groups: &Groups<K, A>, cause: Option<pull_core::Cause>)
where
    K: Eq + Hash,
    A: Send + 'static,
{
    let mut map = groups.lock().expect("lock poisoned");
    for (_, group) in map.drain() {
        match &cause {
            None => {
                group.queue.end(());
            }
            Some(cause) => {
                group.queue.fail_cause(cause.clone());
            }
        }
    }
}
