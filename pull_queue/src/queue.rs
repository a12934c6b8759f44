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
use std::sync::Mutex;

use futures::future::BoxFuture;
use pull_core::Cause;
use pull_core::Chunk;
use pull_core::Exit;
use pull_core::Pull;
use pull_core::PullSource;
use pull_core::Step;
use tokio::sync::Notify;

use crate::wait_on;

/// What an offer does when a bounded queue is full.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Block the producer until space frees up. With capacity 0 this is a
    /// rendezvous: the offer waits for a waiting taker.
    Suspend,
    /// Drop the oldest queued element to make room.
    Sliding,
    /// Reject the newly offered element.
    Dropping,
}

struct State<A, D> {
    items: VecDeque<A>,
    terminal: Option<Exit<D>>,
    takers: usize,
}

struct Shared<A, D> {
    state: Mutex<State<A, D>>,
    readable: Notify,
    writable: Notify,
    capacity: Option<usize>,
    strategy: Strategy,
}

impl<A, D> Shared<A, D> {
    fn has_room(&self, state: &State<A, D>) -> bool {
        match self.capacity {
            None => true,
            Some(0) => state.takers > 0 && state.items.is_empty(),
            Some(n) => state.items.len() < n,
        }
    }
}

/// Decrements the taker count when a waiting take is dropped, so a
/// cancelled take cannot leave a rendezvous offer convinced a consumer is
/// still there.
struct TakerGuard<'a, A, D> {
    shared: &'a Shared<A, D>,
}

impl<'a, A, D> TakerGuard<'a, A, D> {
    fn register(shared: &'a Shared<A, D>) -> Self {
        shared.state.lock().expect("lock poisoned").takers += 1;
        shared.writable.notify_waiters();
        TakerGuard { shared }
    }
}

impl<A, D> Drop for TakerGuard<'_, A, D> {
    fn drop(&mut self) {
        self.shared.state.lock().expect("lock poisoned").takers -= 1;
    }
}

/// A many-producer many-consumer queue with a terminal exit.
///
/// The handle is cheap to clone; all clones refer to the same queue.
/// `take` eventually returns either an element or the terminal step once
/// every queued element has been drained. `shutdown` is the impatient
/// variant: queued elements are dropped and the terminal is an interrupt.
pub struct Queue<A, D = ()> {
    shared: Arc<Shared<A, D>>,
}

impl<A, D> Clone for Queue<A, D> {
    fn clone(&self) -> Self {
        Queue {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<A, D> Queue<A, D>
where
    A: Send + 'static,
    D: Clone + Send + 'static,
{
    /// A queue holding at most `capacity` elements.
    ///
    /// Capacity 0 with [`Strategy::Suspend`] is a rendezvous queue; with
    /// the other strategies capacity is clamped to 1.
    pub fn bounded(capacity: usize, strategy: Strategy) -> Self {
        Self::with_capacity(Some(capacity), strategy)
    }

    /// A queue without a capacity bound; offers never wait.
    pub fn unbounded() -> Self {
        Self::with_capacity(None, Strategy::Suspend)
    }

    /// Build a queue from an optional capacity.
    pub fn with_capacity(capacity: Option<usize>, strategy: Strategy) -> Self {
        let capacity = match (capacity, strategy) {
            (Some(0), Strategy::Suspend) => Some(0),
            (Some(n), _) => Some(n.max(1)),
            (None, _) => None,
        };
        Queue {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    items: VecDeque::new(),
                    terminal: None,
                    takers: 0,
                }),
                readable: Notify::new(),
                writable: Notify::new(),
                capacity,
                strategy,
            }),
        }
    }

    /// The configured capacity, `None` for unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.shared.capacity
    }

    /// The configured back-pressure strategy.
    pub fn strategy(&self) -> Strategy {
        self.shared.strategy
    }

    /// Number of elements currently queued.
    pub fn size(&self) -> usize {
        self.shared.state.lock().expect("lock poisoned").items.len()
    }

    /// Whether a terminal exit has been attached.
    pub fn is_done(&self) -> bool {
        self.shared
            .state
            .lock()
            .expect("lock poisoned")
            .terminal
            .is_some()
    }

    /// Offer one element. Returns false if the element was not accepted,
    /// either because the queue reached its terminal or because a full
    /// Dropping queue rejected it.
    pub async fn offer(&self, item: A) -> bool {
        self.offer_inner(item).await.is_ok()
    }

    async fn offer_inner(&self, item: A) -> Result<(), A> {
        match self.shared.strategy {
            Strategy::Suspend => {
                let mut slot = Some(item);
                wait_on(&self.shared.writable, || {
                    let mut state = self.shared.state.lock().expect("lock poisoned");
                    if state.terminal.is_some() {
                        return Some(Err(slot.take().expect("offer slot occupied")));
                    }
                    if self.shared.has_room(&state) {
                        state.items.push_back(slot.take().expect("offer slot occupied"));
                        self.shared.readable.notify_waiters();
                        Some(Ok(()))
                    } else {
                        None
                    }
                })
                .await
            }
            Strategy::Sliding => {
                let mut state = self.shared.state.lock().expect("lock poisoned");
                if state.terminal.is_some() {
                    return Err(item);
                }
                if let Some(cap) = self.shared.capacity {
                    while state.items.len() >= cap.max(1) {
                        state.items.pop_front();
                    }
                }
                state.items.push_back(item);
                self.shared.readable.notify_waiters();
                Ok(())
            }
            Strategy::Dropping => {
                let mut state = self.shared.state.lock().expect("lock poisoned");
                if state.terminal.is_some() {
                    return Err(item);
                }
                if let Some(cap) = self.shared.capacity {
                    if state.items.len() >= cap.max(1) {
                        return Err(item);
                    }
                }
                state.items.push_back(item);
                self.shared.readable.notify_waiters();
                Ok(())
            }
        }
    }

    /// Offer every element, returning the rejected leftovers.
    ///
    /// Under [`Strategy::Suspend`] a rejection can only mean the queue
    /// reached its terminal mid-offer, so the rest of the input is
    /// returned untouched.
    pub async fn offer_all(&self, items: impl IntoIterator<Item = A>) -> Vec<A> {
        let mut rejected = Vec::new();
        let mut iter = items.into_iter();
        match self.shared.strategy {
            Strategy::Suspend => loop {
                let Some(item) = iter.next() else { break };
                if let Err(item) = self.offer_inner(item).await {
                    rejected.push(item);
                    rejected.extend(iter);
                    break;
                }
            },
            Strategy::Sliding | Strategy::Dropping => {
                for item in iter {
                    if let Err(item) = self.offer_inner(item).await {
                        rejected.push(item);
                    }
                }
            }
        }
        rejected
    }

    /// Push without waiting, with Dropping semantics, regardless of the
    /// configured strategy. Used to preload freshly created queues.
    pub(crate) fn offer_now(&self, item: A) -> bool {
        let mut state = self.shared.state.lock().expect("lock poisoned");
        if state.terminal.is_some() {
            return false;
        }
        if let Some(cap) = self.shared.capacity {
            if state.items.len() >= cap.max(1) {
                return false;
            }
        }
        state.items.push_back(item);
        self.shared.readable.notify_waiters();
        true
    }

    /// Take one element, or the terminal step once the queue is drained.
    pub async fn take(&self) -> Step<A, D> {
        let _guard = TakerGuard::register(&self.shared);
        wait_on(&self.shared.readable, || {
            let mut state = self.shared.state.lock().expect("lock poisoned");
            if let Some(item) = state.items.pop_front() {
                self.shared.writable.notify_waiters();
                return Some(Step::Emit(item));
            }
            terminal_step(&state)
        })
        .await
    }

    /// Take everything currently queued as one non-empty chunk, waiting
    /// for at least one element first.
    pub async fn take_all(&self) -> Step<Chunk<A>, D> {
        let _guard = TakerGuard::register(&self.shared);
        wait_on(&self.shared.readable, || {
            let mut state = self.shared.state.lock().expect("lock poisoned");
            if !state.items.is_empty() {
                let drained: Vec<A> = state.items.drain(..).collect();
                self.shared.writable.notify_waiters();
                return Some(Step::Emit(
                    Chunk::from_vec(drained).expect("drained a non-empty queue"),
                ));
            }
            terminal_step(&state)
        })
        .await
    }

    /// Take one element if one is immediately available, or observe the
    /// terminal if the queue is drained and done.
    pub fn try_take(&self) -> Option<Step<A, D>> {
        let mut state = self.shared.state.lock().expect("lock poisoned");
        if let Some(item) = state.items.pop_front() {
            self.shared.writable.notify_waiters();
            return Some(Step::Emit(item));
        }
        terminal_step(&state)
    }

    /// End the queue with a done value. The first terminal wins.
    pub fn end(&self, done: D) -> bool {
        self.finish(Ok(done))
    }

    /// End the queue with a failure.
    pub fn fail(&self, err: impl Into<anyhow::Error>) -> bool {
        self.finish(Err(Cause::fail(err)))
    }

    /// End the queue with a cause.
    pub fn fail_cause(&self, cause: Cause) -> bool {
        self.finish(Err(cause))
    }

    fn finish(&self, exit: Exit<D>) -> bool {
        let mut state = self.shared.state.lock().expect("lock poisoned");
        if state.terminal.is_some() {
            return false;
        }
        state.terminal = Some(exit);
        self.shared.readable.notify_waiters();
        self.shared.writable.notify_waiters();
        true
    }

    /// Shut the queue down immediately: queued elements are dropped,
    /// pending offers fail, pending takes observe an interrupt exit.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock().expect("lock poisoned");
        state.items.clear();
        if state.terminal.is_none() {
            state.terminal = Some(Err(Cause::Interrupt));
        }
        self.shared.readable.notify_waiters();
        self.shared.writable.notify_waiters();
    }

    /// A pull producing this queue's elements one at a time, halting with
    /// the queue's terminal.
    pub fn pull(&self) -> Pull<A, D> {
        Pull::new(QueueSource {
            queue: self.clone(),
        })
    }

    /// A pull producing this queue's elements in drained batches, halting
    /// with the queue's terminal.
    pub fn chunk_pull(&self) -> Pull<Chunk<A>, D> {
        Pull::new(QueueChunkSource {
            queue: self.clone(),
        })
    }
}

fn terminal_step<A, D: Clone, T>(state: &State<A, D>) -> Option<Step<T, D>> {
    match &state.terminal {
        Some(Ok(done)) => Some(Step::Halt(done.clone())),
        Some(Err(cause)) => Some(Step::Fail(cause.clone())),
        None => None,
    }
}

struct QueueSource<A, D> {
    queue: Queue<A, D>,
}

impl<A, D> PullSource<A, D> for QueueSource<A, D>
where
    A: Send + 'static,
    D: Clone + Send + 'static,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<A, D>>
    where
        A: 'a,
        D: 'a,
    {
        Box::pin(async move { self.queue.take().await })
    }
}

struct QueueChunkSource<A, D> {
    queue: Queue<A, D>,
}

impl<A, D> PullSource<Chunk<A>, D> for QueueChunkSource<A, D>
where
    A: Send + 'static,
    D: Clone + Send + 'static,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<Chunk<A>, D>>
    where
        Chunk<A>: 'a,
        D: 'a,
    {
        Box::pin(async move { self.queue.take_all().await })
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn drains_before_observing_the_terminal() {
        let queue: Queue<u32, u32> = Queue::unbounded();
        assert!(queue.offer(1).await);
        assert!(queue.offer(2).await);
        assert!(queue.end(9));
        assert!(!queue.offer(3).await);
        assert_matches!(queue.take().await, Step::Emit(1));
        assert_matches!(queue.take().await, Step::Emit(2));
        assert_matches!(queue.take().await, Step::Halt(9));
        assert_matches!(queue.take().await, Step::Halt(9));
    }

    #[tokio::test]
    async fn first_terminal_wins() {
        let queue: Queue<u32> = Queue::unbounded();
        assert!(queue.end(()));
        assert!(!queue.fail(anyhow::anyhow!("too late")));
        assert_matches!(queue.take().await, Step::Halt(()));
    }

    #[tokio::test]
    async fn shutdown_drops_queued_elements() {
        let queue: Queue<u32> = Queue::unbounded();
        queue.offer(1).await;
        queue.offer(2).await;
        queue.shutdown();
        assert_matches!(queue.take().await, Step::Fail(Cause::Interrupt));
    }

    #[tokio::test]
    async fn suspend_backpressure_delivers_everything() {
        let queue: Queue<u32> = Queue::bounded(1, Strategy::Suspend);
        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                for n in 0..100u32 {
                    assert!(queue.offer(n).await);
                }
                queue.end(());
            })
        };
        let delivered = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&delivered);
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut expect = 0u32;
                loop {
                    match queue.take().await {
                        Step::Emit(n) => {
                            assert_eq!(n, expect);
                            expect += 1;
                            seen.fetch_add(1, Ordering::SeqCst);
                            // Slow consumer.
                            tokio::task::yield_now().await;
                        }
                        Step::Halt(()) => break,
                        Step::Fail(cause) => panic!("queue failed: {}", cause),
                    }
                }
            })
        };
        producer.await.expect("producer");
        consumer.await.expect("consumer");
        assert_eq!(delivered.load(Ordering::SeqCst), 100);
    }

    #[tokio::test]
    async fn suspended_offer_waits_for_the_consumer() {
        let queue: Queue<u32> = Queue::bounded(1, Strategy::Suspend);
        assert!(queue.offer(1).await);
        let pending = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.offer(2).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!pending.is_finished(), "offer must suspend while full");
        assert_matches!(queue.take().await, Step::Emit(1));
        assert!(pending.await.expect("offer task"));
        assert_matches!(queue.take().await, Step::Emit(2));
    }

    #[tokio::test]
    async fn sliding_drops_the_oldest() {
        let queue: Queue<u32> = Queue::bounded(2, Strategy::Sliding);
        for n in 0..4 {
            assert!(queue.offer(n).await);
        }
        assert_matches!(queue.take().await, Step::Emit(2));
        assert_matches!(queue.take().await, Step::Emit(3));
    }

    #[tokio::test]
    async fn dropping_rejects_the_newest() {
        let queue: Queue<u32> = Queue::bounded(2, Strategy::Dropping);
        assert!(queue.offer(0).await);
        assert!(queue.offer(1).await);
        assert!(!queue.offer(2).await);
        let rejected = queue.offer_all(vec![3, 4]).await;
        assert_eq!(rejected, vec![3, 4]);
        assert_matches!(queue.take().await, Step::Emit(0));
    }

    #[tokio::test]
    async fn offer_all_returns_the_tail_when_the_queue_ends() {
        let queue: Queue<u32> = Queue::bounded(1, Strategy::Suspend);
        let offers = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.offer_all(vec![1, 2, 3]).await })
        };
        assert_matches!(queue.take().await, Step::Emit(1));
        // Let the producer queue 2 and suspend on 3, then end the queue
        // under it.
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.end(());
        let rejected = offers.await.expect("offer task");
        assert_eq!(rejected, vec![3]);
        assert_matches!(queue.take().await, Step::Emit(2));
        assert_matches!(queue.take().await, Step::Halt(()));
    }

    #[tokio::test]
    async fn rendezvous_hands_off_only_to_a_waiting_taker() {
        let queue: Queue<u32> = Queue::bounded(0, Strategy::Suspend);
        let offer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.offer(7).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!offer.is_finished(), "no taker, the offer must wait");
        assert_matches!(queue.take().await, Step::Emit(7));
        assert!(offer.await.expect("offer task"));
    }

    #[tokio::test]
    async fn take_all_batches_what_is_available() {
        let queue: Queue<u32> = Queue::unbounded();
        queue.offer_all(vec![1, 2, 3]).await;
        assert_matches!(queue.take_all().await, Step::Emit(chunk) => {
            assert_eq!(chunk.into_vec(), vec![1, 2, 3]);
        });
        queue.end(());
        assert_matches!(queue.take_all().await, Step::Halt(()));
    }

    #[tokio::test]
    async fn pull_halts_with_the_queue_terminal() {
        let queue: Queue<u32, &'static str> = Queue::unbounded();
        queue.offer(5).await;
        queue.end("done");
        let mut pull = queue.pull();
        assert_matches!(pull.next().await, Step::Emit(5));
        assert_matches!(pull.next().await, Step::Halt("done"));
        assert_matches!(pull.next().await, Step::Halt("done"));
    }
}
