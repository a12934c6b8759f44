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

use pull_core::Exit;
use pull_core::Pull;
use pull_core::Step;
use pull_queue::Queue;
use pull_queue::Strategy;
use pull_scope::Scope;

use crate::channel::scoped_pull;
use crate::channel::Channel;
use crate::DEFAULT_MERGE_BUFFER;

/// Which side's halt terminates a merged channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HaltStrategy {
    /// End when both sides have halted (the default).
    Both,
    /// End on the first side to halt.
    Either,
    /// End when the left side halts; the right side's halt is ignored.
    Left,
    /// End when the right side halts; the left side's halt is ignored.
    Right,
}

/// Options of `merge`.
#[derive(Copy, Clone, Debug)]
pub struct MergeOptions {
    /// Halt strategy governing termination.
    pub halt_strategy: HaltStrategy,
    /// Capacity of the shared output queue; 0 is a rendezvous.
    pub buffer_size: usize,
}

impl Default for MergeOptions {
    fn default() -> Self {
        MergeOptions {
            halt_strategy: HaltStrategy::Both,
            buffer_size: DEFAULT_MERGE_BUFFER,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

impl<OA, OD> Channel<OA, OD>
where
    OA: Send + 'static,
    OD: Clone + Send + 'static,
{
    /// Interleave two channels through a shared bounded queue.
    ///
    /// Each side runs as its own fiber in its own forked scope. An error
    /// from either side terminates the merge immediately; halts follow
    /// the configured [`HaltStrategy`]. There is no cross-side ordering.
    pub fn merge(self, that: Channel<OA, OD>, options: MergeOptions) -> Channel<OA, OD> {
        Channel::new(move |_upstream, scope| async move {
            scoped_pull(&scope, move |child| async move {
                let queue: Queue<OA, OD> =
                    Queue::bounded(options.buffer_size, Strategy::Suspend);
                let teardown = queue.clone();
                child
                    .defer(async move {
                        teardown.shutdown();
                    })
                    .await;
                let open = Arc::new(AtomicUsize::new(2));
                for (side, channel) in [(Side::Left, self), (Side::Right, that)] {
                    let branch = child.fork().await;
                    let copier = copy_side(
                        channel,
                        branch.clone(),
                        queue.clone(),
                        side,
                        options.halt_strategy,
                        Arc::clone(&open),
                    );
                    child.spawn(copier).await.detach();
                }
                Ok(queue.pull())
            })
            .await
        })
    }
}

async fn copy_side<OA, OD>(
    channel: Channel<OA, OD>,
    scope: Scope,
    queue: Queue<OA, OD>,
    side: Side,
    strategy: HaltStrategy,
    open: Arc<AtomicUsize>,
) where
    OA: Send + 'static,
    OD: Clone + Send + 'static,
{
    let mut exit: Exit<()> = Ok(());
    match channel.into_pull(Pull::halt(()), scope.clone()).await {
        Ok(mut pull) => loop {
            match pull.next().await {
                Step::Emit(value) => {
                    if !queue.offer(value).await {
                        break;
                    }
                }
                Step::Halt(done) => {
                    let ends = match strategy {
                        HaltStrategy::Either => true,
                        HaltStrategy::Left => side == Side::Left,
                        HaltStrategy::Right => side == Side::Right,
                        HaltStrategy::Both => open.fetch_sub(1, Ordering::SeqCst) == 1,
                    };
                    if ends {
                        queue.end(done);
                    }
                    break;
                }
                Step::Fail(cause) => {
                    queue.fail_cause(cause.clone());
                    exit = Err(cause);
                    break;
                }
            }
        },
        Err(cause) => {
            queue.fail_cause(cause.clone());
            exit = Err(cause);
        }
    }
    scope.close(exit).await;
}
