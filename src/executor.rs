//! Shared execution plumbing for build steps
//!
//! One [`StepExecutor`] is passed into every step: it bounds concurrency
//! with a semaphore, carries the build-wide cancellation signal, coalesces
//! identical layer work onto one future, and joins parallel step groups
//! with first-failure-wins error aggregation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::sync::{Semaphore, watch};

use crate::cache::CachedLayer;
use crate::digest::Digest;
use crate::error::{BuildError, Result};

/// Cooperative cancellation signal shared by every step of a build.
///
/// Steps observe it at await boundaries; streaming loops check it between
/// chunks so in-flight I/O stops within bounded time.
#[derive(Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        CancelToken {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Fail fast at a checkpoint.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(BuildError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation is signalled.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        while !*receiver.borrow() {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

type SharedLayerFuture = Shared<BoxFuture<'static, std::result::Result<CachedLayer, Arc<BuildError>>>>;

/// Worker-pool sized `min(32, 2 x cores)` unless the caller chooses.
pub fn default_concurrency() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    (2 * cores).min(32)
}

/// The single executor shared by all steps of a [`crate::builder::Containerizer`].
pub struct StepExecutor {
    semaphore: Arc<Semaphore>,
    cancel: CancelToken,
    coalesced: Mutex<HashMap<Digest, SharedLayerFuture>>,
}

impl StepExecutor {
    pub fn new(concurrency: usize) -> Self {
        StepExecutor {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            cancel: CancelToken::new(),
            coalesced: Mutex::new(HashMap::new()),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Signal every outstanding step to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run one step under the concurrency bound, racing it against
    /// cancellation.
    pub async fn run<T>(&self, step: impl Future<Output = Result<T>>) -> Result<T> {
        let _permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| BuildError::Cancelled)?
            }
            _ = self.cancel.cancelled() => return Err(BuildError::Cancelled),
        };
        tokio::select! {
            result = step => result,
            _ = self.cancel.cancelled() => Err(BuildError::Cancelled),
        }
    }

    /// Deduplicate work per layer digest: concurrent callers for the same
    /// digest share one future and one result.
    pub async fn coalesce<F>(&self, digest: &Digest, make: F) -> Result<CachedLayer>
    where
        F: FnOnce() -> BoxFuture<'static, Result<CachedLayer>>,
    {
        let shared = {
            let mut map = self.coalesced.lock().expect("coalesced step map poisoned");
            match map.get(digest) {
                Some(existing) => existing.clone(),
                None => {
                    let future = make()
                        .map(|result| result.map_err(Arc::new))
                        .boxed()
                        .shared();
                    map.insert(digest.clone(), future.clone());
                    future
                }
            }
        };
        shared.await.map_err(|e| e.duplicate())
    }

    /// Await a group of sibling steps. The first failure cancels the rest
    /// and is returned with every later failure attached as a suppressed
    /// cause; successes keep their input order.
    pub async fn join_steps<'a, T: Send + 'a>(
        &self,
        steps: Vec<BoxFuture<'a, Result<T>>>,
    ) -> Result<Vec<T>> {
        let total = steps.len();
        let mut pending: FuturesUnordered<_> = steps
            .into_iter()
            .enumerate()
            .map(|(index, step)| async move { (index, step.await) })
            .collect();

        let mut outputs: Vec<Option<T>> = std::iter::repeat_with(|| None).take(total).collect();
        let mut first_failure: Option<BuildError> = None;
        let mut suppressed = Vec::new();

        while let Some((index, result)) = pending.next().await {
            match result {
                Ok(value) => outputs[index] = Some(value),
                Err(error) => {
                    if first_failure.is_none() {
                        first_failure = Some(error);
                        self.cancel.cancel();
                    } else {
                        suppressed.push(error);
                    }
                }
            }
        }

        match first_failure {
            Some(error) => Err(error.with_suppressed(suppressed)),
            None => Ok(outputs
                .into_iter()
                .map(|value| value.expect("every step reported a result"))
                .collect()),
        }
    }
}

impl Default for StepExecutor {
    fn default() -> Self {
        Self::new(default_concurrency())
    }
}
