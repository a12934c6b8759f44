/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

use std::sync::Arc;
use std::sync::Mutex;

use pull_core::Exit;
use tokio::sync::Notify;

use crate::wait_on;

struct Inner {
    state: Mutex<Option<Exit<()>>>,
    notify: Notify,
}

/// A one-shot latch carrying an exit.
///
/// Used as the completion signal of `interrupt_when` / `halt_when`: a
/// watcher task sets the latch once, any number of waiters observe it.
#[derive(Clone)]
pub struct Latch {
    inner: Arc<Inner>,
}

impl Latch {
    /// A fresh, unset latch.
    pub fn new() -> Latch {
        Latch {
            inner: Arc::new(Inner {
                state: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Set the latch. The first set wins.
    pub fn set(&self, exit: Exit<()>) -> bool {
        let mut state = self.inner.state.lock().expect("lock poisoned");
        if state.is_some() {
            return false;
        }
        *state = Some(exit);
        self.inner.notify.notify_waiters();
        true
    }

    /// Whether the latch has been set.
    pub fn is_set(&self) -> bool {
        self.inner.state.lock().expect("lock poisoned").is_some()
    }

    /// The recorded exit, if set.
    pub fn get(&self) -> Option<Exit<()>> {
        self.inner.state.lock().expect("lock poisoned").clone()
    }

    /// Wait for the latch to be set.
    pub async fn wait(&self) -> Exit<()> {
        wait_on(&self.inner.notify, || {
            self.inner.state.lock().expect("lock poisoned").clone()
        })
        .await
    }
}

impl Default for Latch {
    fn default() -> Self {
        Latch::new()
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use pull_core::Cause;

    use super::*;

    #[tokio::test]
    async fn waiters_observe_the_first_set() {
        let latch = Latch::new();
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait().await })
        };
        assert!(latch.set(Ok(())));
        assert!(!latch.set(Err(Cause::Interrupt)));
        assert_matches!(waiter.await.expect("waiter"), Ok(()));
        assert_matches!(latch.wait().await, Ok(()));
    }
}
