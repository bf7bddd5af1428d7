//! Cancellable background tasks.
//!
//! A [`CancellableTask`] is a shared handle to a unit of background work. Any
//! number of clones can await the same outcome; cancelling through one handle
//! cancels the work for all of them. The outcome is an `Option`: `None` means the
//! work failed, was cancelled, or had nothing to report.

use std::fmt;
use std::future::Future;

use futures::future::{self, BoxFuture, FutureExt, Shared};
use log::warn;
use tokio_util::sync::CancellationToken;

/// Handle to a cancellable, awaitable background operation.
pub struct CancellableTask<T> {
    token: CancellationToken,
    result: Shared<BoxFuture<'static, Option<T>>>,
}

impl<T> CancellableTask<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Spawn `work` on the tokio runtime.
    ///
    /// The closure receives the task's cancellation token so long-running work
    /// can stop early; work that ignores it is still abandoned once the token
    /// fires.
    pub fn run<F, Fut>(work: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Option<T>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let work = work(token.clone());
        Self::spawn(token, work)
    }

    /// A task that has already finished with `value`.
    ///
    /// Does not need a runtime.
    pub fn completed(value: Option<T>) -> Self {
        Self {
            token: CancellationToken::new(),
            result: future::ready(value).boxed().shared(),
        }
    }

    fn spawn<Fut>(token: CancellationToken, work: Fut) -> Self
    where
        Fut: Future<Output = Option<T>> + Send + 'static,
    {
        let cancel = token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = work => result,
            }
        });

        let result = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    warn!("Background task failed: {}", e);
                    None
                }
            }
        }
        .boxed()
        .shared();

        Self { token, result }
    }

    /// Chain a continuation that runs with this task's outcome.
    ///
    /// The continuation shares this task's cancellation token: cancelling
    /// either handle cancels the whole chain.
    pub fn then<U, F>(&self, continuation: F) -> CancellableTask<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(Option<T>) -> Option<U> + Send + 'static,
    {
        let upstream = self.result.clone();
        let cancel = self.token.clone();
        CancellableTask::spawn(self.token.clone(), async move {
            let outcome = upstream.await;
            if cancel.is_cancelled() {
                return None;
            }
            continuation(outcome)
        })
    }

    /// Request cancellation. Never blocks.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Check if the outcome is available without waiting.
    pub fn is_finished(&self) -> bool {
        self.peek().is_some()
    }

    /// Get the outcome if the task has finished, without waiting.
    pub fn peek(&self) -> Option<Option<T>> {
        // Shared only caches an outcome once polled
        self.result.clone().now_or_never()
    }

    /// Wait for the outcome.
    pub async fn wait(&self) -> Option<T> {
        self.result.clone().await
    }
}

impl<T: Clone> Clone for CancellableTask<T> {
    fn clone(&self) -> Self {
        Self {
            token: self.token.clone(),
            result: self.result.clone(),
        }
    }
}

impl<T: Clone> fmt::Debug for CancellableTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellableTask")
            .field("cancelled", &self.token.is_cancelled())
            .field("finished", &self.result.clone().now_or_never().is_some())
            .finish()
    }
}
