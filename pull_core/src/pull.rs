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

use futures::future::BoxFuture;

use crate::cause::Cause;
use crate::step::Step;

/// One step of a lazy producer.
///
/// Implementors own whatever state the producer needs; `next` is invoked
/// at most once at a time by the owning [`Pull`].
pub trait PullSource<A, D>: Send {
    /// Produce the next step.
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<A, D>>
    where
        A: 'a,
        D: 'a;
}

struct FnSource<F>(F);

impl<A, D, F> PullSource<A, D> for FnSource<F>
where
    F: FnMut() -> BoxFuture<'static, Step<A, D>> + Send,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<A, D>>
    where
        A: 'a,
        D: 'a,
    {
        (self.0)()
    }
}

/// Placeholder source for pulls constructed in an already-terminal state.
/// Never invoked because the memoized halt short-circuits.
struct Exhausted;

impl<A: Send, D: Send> PullSource<A, D> for Exhausted {
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<A, D>>
    where
        A: 'a,
        D: 'a,
    {
        Box::pin(futures::future::pending())
    }
}

struct FailSource(Cause);

impl<A: Send, D: Send> PullSource<A, D> for FailSource {
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<A, D>>
    where
        A: 'a,
        D: 'a,
    {
        let cause = self.0.clone();
        Box::pin(async move { Step::Fail(cause) })
    }
}

struct EmitOnce<A>(Option<A>);

impl<A, D> PullSource<A, D> for EmitOnce<A>
where
    A: Send + 'static,
    D: Default + Send,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<A, D>>
    where
        A: 'a,
        D: 'a,
    {
        Box::pin(async move {
            match self.0.take() {
                Some(value) => Step::Emit(value),
                None => Step::Halt(D::default()),
            }
        })
    }
}

struct PrefixSource<A, D> {
    pending: VecDeque<A>,
    inner: Pull<A, D>,
}

impl<A, D> PullSource<A, D> for PrefixSource<A, D>
where
    A: Send + 'static,
    D: Clone + Send + 'static,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<A, D>>
    where
        A: 'a,
        D: 'a,
    {
        Box::pin(async move {
            match self.pending.pop_front() {
                Some(value) => Step::Emit(value),
                None => self.inner.next().await,
            }
        })
    }
}

struct SharedSource<A, D> {
    shared: SharedPull<A, D>,
}

impl<A, D> PullSource<A, D> for SharedSource<A, D>
where
    A: Send + 'static,
    D: Clone + Send + 'static,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<A, D>>
    where
        A: 'a,
        D: 'a,
    {
        Box::pin(async move { self.shared.next().await })
    }
}

/// A one-step lazy producer.
///
/// Invoking [`Pull::next`] yields exactly one [`Step`]. The first halt is
/// memoized: a halted pull returns the same halt on every later
/// invocation, so downstream code may re-pull a terminated producer
/// without observing fresh effects. A failed pull may repeat its failure
/// or surface a new one at the source's discretion; callers must not rely
/// on repetition.
pub struct Pull<A, D = ()> {
    source: Box<dyn PullSource<A, D>>,
    halted: Option<D>,
}

impl<A, D> Pull<A, D>
where
    A: Send + 'static,
    D: Clone + Send + 'static,
{
    /// Wrap a source.
    pub fn new(source: impl PullSource<A, D> + 'static) -> Self {
        Pull {
            source: Box::new(source),
            halted: None,
        }
    }

    /// Build a pull from a closure producing step futures.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnMut() -> BoxFuture<'static, Step<A, D>> + Send + 'static,
    {
        Pull::new(FnSource(f))
    }

    /// A pull that is already terminated with `done`.
    pub fn halt(done: D) -> Self {
        Pull {
            source: Box::new(Exhausted),
            halted: Some(done),
        }
    }

    /// A pull that fails with `cause` on every invocation.
    pub fn fail(cause: Cause) -> Self {
        Pull::new(FailSource(cause))
    }

    /// A pull that emits one value, then halts with the default done.
    pub fn emit_once(value: A) -> Self
    where
        D: Default,
    {
        Pull::new(EmitOnce(Some(value)))
    }

    /// Invoke the producer for its next step.
    pub async fn next(&mut self) -> Step<A, D> {
        if let Some(done) = &self.halted {
            return Step::Halt(done.clone());
        }
        match self.source.next().await {
            Step::Halt(done) => {
                self.halted = Some(done.clone());
                Step::Halt(done)
            }
            step => step,
        }
    }

    /// Serve the given elements before consulting the underlying
    /// producer. Sink composition uses this to feed leftovers back ahead
    /// of fresh upstream data.
    pub fn with_prefix(self, items: impl IntoIterator<Item = A>) -> Pull<A, D> {
        let pending: VecDeque<A> = items.into_iter().collect();
        if pending.is_empty() {
            return self;
        }
        Pull::new(PrefixSource {
            pending,
            inner: self,
        })
    }

    /// Share this pull between several consumers.
    ///
    /// Invocations are serialized through a one-permit async mutex, so two
    /// consumers can never run the producer concurrently.
    pub fn shared(self) -> SharedPull<A, D> {
        SharedPull {
            inner: Arc::new(tokio::sync::Mutex::new(self)),
        }
    }
}

/// A pull that always halts immediately with `()`.
///
/// This is the upstream handed to producers that consume no input.
pub fn halt_void<A: Send + 'static>() -> Pull<A, ()> {
    Pull::halt(())
}

/// A clonable handle to a shared [`Pull`].
///
/// All handles pull from the same underlying producer; a one-permit mutex
/// forbids concurrent invocation.
pub struct SharedPull<A, D = ()> {
    inner: Arc<tokio::sync::Mutex<Pull<A, D>>>,
}

impl<A, D> Clone for SharedPull<A, D> {
    fn clone(&self) -> Self {
        SharedPull {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, D> SharedPull<A, D>
where
    A: Send + 'static,
    D: Clone + Send + 'static,
{
    /// Invoke the shared producer for its next step.
    pub async fn next(&self) -> Step<A, D> {
        self.inner.lock().await.next().await
    }

    /// View this handle as a [`Pull`] again, for APIs that take one by
    /// value.
    pub fn to_pull(&self) -> Pull<A, D> {
        Pull::new(SharedSource {
            shared: self.clone(),
        })
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use assert_matches::assert_matches;

    use super::*;

    fn counting_pull(limit: usize) -> (Pull<usize, ()>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&calls);
        let pull = Pull::from_fn(move || {
            let n = probe.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if n < limit {
                    Step::Emit(n)
                } else {
                    Step::Halt(())
                }
            })
        });
        (pull, calls)
    }

    #[tokio::test]
    async fn halt_is_memoized() {
        let (mut pull, calls) = counting_pull(2);
        assert_matches!(pull.next().await, Step::Emit(0));
        assert_matches!(pull.next().await, Step::Emit(1));
        assert_matches!(pull.next().await, Step::Halt(()));
        // Re-pulling a halted producer must not re-run it.
        assert_matches!(pull.next().await, Step::Halt(()));
        assert_matches!(pull.next().await, Step::Halt(()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn halt_pull_never_runs_a_source() {
        let mut pull = Pull::<u32, u32>::halt(42);
        assert_matches!(pull.next().await, Step::Halt(42));
        assert_matches!(pull.next().await, Step::Halt(42));
    }

    #[tokio::test]
    async fn with_prefix_serves_leftovers_first() {
        let (pull, _) = counting_pull(1);
        let mut pull = pull.with_prefix(vec![10, 11]);
        assert_matches!(pull.next().await, Step::Emit(10));
        assert_matches!(pull.next().await, Step::Emit(11));
        assert_matches!(pull.next().await, Step::Emit(0));
        assert_matches!(pull.next().await, Step::Halt(()));
    }

    #[tokio::test]
    async fn shared_pull_serializes_consumers() {
        let (pull, _) = counting_pull(4);
        let shared = pull.shared();
        let left = shared.clone();
        let right = shared.clone();
        let (a, b) = tokio::join!(left.next(), right.next());
        let mut seen: Vec<usize> = [a, b].into_iter().filter_map(Step::into_emit).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1]);
    }

    #[tokio::test]
    async fn failed_pull_repeats_its_cause() {
        let mut pull = Pull::<u32, ()>::fail(Cause::fail(anyhow::anyhow!("nope")));
        assert_matches!(pull.next().await, Step::Fail(Cause::Fail(_)));
        assert_matches!(pull.next().await, Step::Fail(Cause::Fail(_)));
    }
}
