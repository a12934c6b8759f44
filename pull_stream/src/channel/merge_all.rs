/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

use std::collections::VecDeque;
use std::sync::Arc;

use pull_core::Cause;
use pull_core::Exit;
use pull_core::Pull;
use pull_core::Step;
use pull_queue::Queue;
use pull_queue::Strategy;
use pull_scope::Scope;
use pull_scope::Task;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;

use crate::channel::scoped_pull;
use crate::channel::Channel;
use crate::DEFAULT_MERGE_BUFFER;

/// Options of `merge_all`.
#[derive(Copy, Clone, Debug)]
pub struct MergeAllOptions {
    /// Maximum number of inner channels run at once.
    pub concurrency: usize,
    /// Capacity of the shared output queue.
    pub buffer_size: usize,
    /// When at the concurrency limit, interrupt the oldest running inner
    /// channel instead of waiting for a slot.
    pub switch: bool,
}

impl Default for MergeAllOptions {
    fn default() -> Self {
        MergeAllOptions {
            concurrency: 4,
            buffer_size: DEFAULT_MERGE_BUFFER,
            switch: false,
        }
    }
}

impl<OA, OD, IA, ID> Channel<Channel<OA>, OD, IA, ID>
where
    OA: Send + 'static,
    OD: Clone + Send + 'static,
    IA: Send + 'static,
    ID: Clone + Send + 'static,
{
    /// Run the channels produced by this channel, up to `concurrency` at
    /// once, interleaving their outputs through a shared bounded queue.
    ///
    /// Each inner channel runs as its own fiber in its own forked scope.
    /// When the outer channel halts, the remaining workers drain before
    /// the output ends with the outer done value; an error anywhere
    /// terminates the output immediately.
    pub fn merge_all(self, options: MergeAllOptions) -> Channel<OA, OD, IA, ID> {
        Channel::new(move |upstream, scope| async move {
            let outer = self.into_pull(upstream, scope.clone()).await?;
            scoped_pull(&scope, move |child| async move {
                let queue: Queue<OA, OD> = Queue::bounded(options.buffer_size, Strategy::Suspend);
                let teardown = queue.clone();
                child
                    .defer(async move {
                        teardown.shutdown();
                    })
                    .await;
                let driver = drive_outer(outer, child.clone(), queue.clone(), options);
                child.spawn(driver).await.detach();
                Ok(queue.pull())
            })
            .await
        })
    }
}

async fn drive_outer<OA, OD>(
    mut outer: Pull<Channel<OA>, OD>,
    scope: Scope,
    queue: Queue<OA, OD>,
    options: MergeAllOptions,
) where
    OA: Send + 'static,
    OD: Clone + Send + 'static,
{
    let concurrency = options.concurrency.max(1);
    let permits = Arc::new(Semaphore::new(concurrency));
    let mut workers: VecDeque<(Task<()>, Scope)> = VecDeque::new();
    loop {
        while workers
            .front()
            .map_or(false, |(task, _)| task.is_finished())
        {
            workers.pop_front();
        }
        match outer.next().await {
            Step::Emit(inner) => {
                let permit = if options.switch {
                    match permits.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            // Interrupt the oldest worker to make room.
                            if let Some((task, branch)) = workers.pop_front() {
                                task.interrupt();
                                branch.close(Err(Cause::Interrupt)).await;
                            }
                            match permits.clone().acquire_owned().await {
                                Ok(permit) => permit,
                                Err(_) => break,
                            }
                        }
                    }
                } else {
                    match permits.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    }
                };
                let branch = scope.fork().await;
                let worker = run_inner(inner, branch.clone(), queue.clone(), permit);
                workers.push_back((Task::spawn(worker), branch));
            }
            Step::Halt(done) => {
                // Let the remaining workers drain into the queue first.
                let _ = permits.acquire_many(concurrency as u32).await;
                queue.end(done);
                break;
            }
            Step::Fail(cause) => {
                queue.fail_cause(cause);
                break;
            }
        }
    }
}

async fn run_inner<OA, OD>(
    inner: Channel<OA>,
    scope: Scope,
    queue: Queue<OA, OD>,
    permit: OwnedSemaphorePermit,
) where
    OA: Send + 'static,
    OD: Clone + Send + 'static,
{
    let mut exit: Exit<()> = Ok(());
    match inner.into_pull(Pull::halt(()), scope.clone()).await {
        Ok(mut pull) => loop {
            match pull.next().await {
                Step::Emit(value) => {
                    if !queue.offer(value).await {
                        break;
                    }
                }
                Step::Halt(()) => break,
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
    drop(permit);
}
