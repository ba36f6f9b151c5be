// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hierarchical task supervision with blocking join on subtree shutdown.
//!
//! A [`Scope`] is a node in a cancellation tree. Spawning a task creates a
//! child node; cancelling a node signals every live descendant and blocks
//! until the whole subtree has finished cleanup. This is deliberately not a
//! retry layer — it only guarantees complete, ordered teardown. Retries live
//! in [`retry`](super::retry).
//!
//! Cancellation is one-shot: once a scope observes the signal it stays set.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// How a supervised task's subtree ended.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The task returned without an error before any cancellation.
    Completed,
    /// The task (or something in its subtree via [`Scope::fail`]) failed.
    Failed(Arc<Error>),
    /// The task was cancelled, externally or by its parent.
    Cancelled,
}

impl Outcome {
    /// Returns `true` if the run was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns the failure, if any.
    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

struct Node {
    cancel: CancellationToken,
    /// Live tasks in this subtree: the node's own task plus every descendant.
    outstanding: AtomicUsize,
    idle: Notify,
    /// First failure wins; the `Cancelled` sentinel marks external cancellation.
    error: Mutex<Option<Arc<Error>>>,
    parent: Option<Arc<Node>>,
}

impl Node {
    fn fail(&self, err: Error) {
        {
            let mut slot = self.error.lock();
            if slot.is_none() {
                *slot = Some(Arc::new(err));
            }
        }
        self.cancel.cancel();
    }

    fn outcome(&self) -> Outcome {
        match self.error.lock().clone() {
            Some(err) if err.is_cancelled() => Outcome::Cancelled,
            Some(err) => Outcome::Failed(err),
            None => Outcome::Completed,
        }
    }

    /// Marks one task in this subtree as finished, bubbling the count up the
    /// ancestor chain and waking waiters of every node that becomes idle.
    fn complete_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
        let mut node = self.parent.clone();
        while let Some(n) = node {
            if n.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
                n.idle.notify_waiters();
            }
            node = n.parent.clone();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// A node in the supervision tree.
///
/// Cloning a `Scope` yields another handle to the same node. Tasks receive
/// their own child `Scope` when spawned and use it to observe cancellation,
/// spawn further children, or fail their subtree.
///
/// # Examples
///
/// ```
/// use cradlecast::supervise::Scope;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let root = Scope::root();
/// let handle = root.spawn(|scope| async move {
///     scope.cancelled().await;
///     Ok(())
/// });
///
/// let outcome = handle.cancel().await;
/// assert!(outcome.is_cancelled());
/// # }
/// ```
#[derive(Clone)]
pub struct Scope {
    node: Arc<Node>,
}

impl Scope {
    /// Creates a detached root scope.
    #[must_use]
    pub fn root() -> Self {
        Self {
            node: Arc::new(Node {
                cancel: CancellationToken::new(),
                outstanding: AtomicUsize::new(0),
                idle: Notify::new(),
                error: Mutex::new(None),
                parent: None,
            }),
        }
    }

    /// Runs a task as a new child node and returns its handle.
    ///
    /// The task receives the child scope. Returning `Err` fails the child's
    /// subtree; a clean return after the cancellation signal counts as a
    /// cancelled run. If this scope is already cancelled the task never
    /// starts and the handle reports [`Outcome::Cancelled`].
    pub fn spawn<F, Fut>(&self, task: F) -> TaskHandle
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let child = Arc::new(Node {
            cancel: self.node.cancel.child_token(),
            outstanding: AtomicUsize::new(1),
            idle: Notify::new(),
            error: Mutex::new(None),
            parent: Some(Arc::clone(&self.node)),
        });

        // The whole ancestor chain gains one live task.
        let mut ancestor = Some(Arc::clone(&self.node));
        while let Some(n) = ancestor {
            n.outstanding.fetch_add(1, Ordering::AcqRel);
            ancestor = n.parent.clone();
        }

        if self.node.cancel.is_cancelled() {
            // Do not even start if the scope has already been cancelled.
            child.fail(Error::Cancelled);
            child.complete_one();
            return TaskHandle { node: child };
        }

        let fut = task(Scope {
            node: Arc::clone(&child),
        });
        let node = Arc::clone(&child);
        tokio::spawn(async move {
            if let Err(err) = fut.await {
                node.fail(err);
            } else if node.cancel.is_cancelled() {
                node.fail(Error::Cancelled);
            }
            node.complete_one();
        });

        TaskHandle { node: child }
    }

    /// Blocks until this scope is cancelled.
    pub async fn cancelled(&self) {
        self.node.cancel.cancelled().await;
    }

    /// Returns `true` once the cancellation signal has been set.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.node.cancel.is_cancelled()
    }

    /// Fails this scope's subtree.
    ///
    /// Idempotent: only the first failure is recorded, later calls are
    /// no-ops. Does not await the teardown.
    pub fn fail(&self, err: Error) {
        self.node.fail(err);
    }

    /// Cancels this scope's subtree and blocks until every descendant task
    /// has observed the signal and exited.
    pub async fn cancel(&self) {
        self.node.fail(Error::Cancelled);
        self.node.wait_idle().await;
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("cancelled", &self.node.cancel.is_cancelled())
            .field("outstanding", &self.node.outstanding.load(Ordering::Relaxed))
            .finish()
    }
}

/// Handle to a spawned child task.
pub struct TaskHandle {
    node: Arc<Node>,
}

impl TaskHandle {
    /// Blocks until the child and all of its descendants have finished.
    pub async fn wait(&self) -> Outcome {
        self.node.wait_idle().await;
        self.node.outcome()
    }

    /// Signals cancellation and blocks until the child's whole subtree has
    /// finished cleanup.
    pub async fn cancel(&self) -> Outcome {
        self.node.fail(Error::Cancelled);
        self.wait().await
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("outstanding", &self.node.outstanding.load(Ordering::Relaxed))
            .finish()
    }
}
