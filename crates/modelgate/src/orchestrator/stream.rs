//! Streaming wrapper tying a chunk stream to its model's lifetime.

use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::watch;
use tracing::debug;

use crate::error::{OrchestratorError, Result};
use crate::metrics;

/// Resolves once the model is marked terminated (or its entry is gone).
pub(crate) async fn terminated(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|terminated| *terminated).await;
}

struct StreamGuard {
    uid: String,
    finished: bool,
}

impl StreamGuard {
    fn new(uid: String) -> Self {
        metrics::inc_streams();
        Self { uid, finished: false }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        metrics::dec_streams();
        if !self.finished {
            debug!("Stream for model {} dropped before completion", self.uid);
        }
    }
}

pin_project! {
    /// Forwards `inner` until it ends, or yields a single
    /// `TerminatedMidRequest` if the model is terminated first.
    /// `inner`, and with it the backend request, is dropped as soon as the
    /// stream finishes for any reason.
    pub struct TerminationAware<S> {
        #[pin]
        inner: Option<S>,
        terminated: BoxFuture<'static, ()>,
        guard: StreamGuard,
    }
}

impl<S> TerminationAware<S> {
    pub fn new(uid: impl Into<String>, inner: S, rx: watch::Receiver<bool>) -> Self {
        Self {
            inner: Some(inner),
            terminated: terminated(rx).boxed(),
            guard: StreamGuard::new(uid.into()),
        }
    }
}

impl<S, T> Stream for TerminationAware<S>
where
    S: Stream<Item = Result<T>>,
{
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        let Some(inner) = this.inner.as_mut().as_pin_mut() else {
            return Poll::Ready(None);
        };

        if this.terminated.poll_unpin(cx).is_ready() {
            this.inner.set(None);
            this.guard.finished = true;
            debug!("Model {} terminated mid-stream", this.guard.uid);
            return Poll::Ready(Some(Err(OrchestratorError::TerminatedMidRequest(
                this.guard.uid.clone(),
            ))));
        }

        match inner.poll_next(cx) {
            Poll::Ready(None) => {
                this.inner.set(None);
                this.guard.finished = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                this.inner.set(None);
                this.guard.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_forwards_until_end() {
        let (_tx, rx) = watch::channel(false);
        let inner = futures::stream::iter(vec![Ok(1), Ok(2)]);
        let items: Vec<Result<i32>> = TerminationAware::new("m", inner, rx).collect().await;
        assert_eq!(items, vec![Ok(1), Ok(2)]);
    }

    #[tokio::test]
    async fn test_termination_interrupts_pending_stream() {
        let (tx, rx) = watch::channel(false);
        let inner = futures::stream::pending::<Result<i32>>();
        let mut stream = TerminationAware::new("m", inner, rx);

        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            tx.send_replace(true);
        });

        assert_eq!(
            stream.next().await,
            Some(Err(OrchestratorError::TerminatedMidRequest("m".into())))
        );
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_termination_releases_inner_stream() {
        let (tx, rx) = watch::channel(false);
        let backend = std::sync::Arc::new(());
        let held = backend.clone();
        let inner = futures::stream::pending::<Result<i32>>().map(move |item| {
            let _ = &held;
            item
        });
        let mut stream = TerminationAware::new("m", inner, rx);

        tx.send_replace(true);
        assert!(matches!(
            stream.next().await,
            Some(Err(OrchestratorError::TerminatedMidRequest(_)))
        ));
        // Released while the wrapper itself is still alive.
        assert_eq!(std::sync::Arc::strong_count(&backend), 1);
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_backend_error_ends_stream() {
        let (_tx, rx) = watch::channel(false);
        let inner = futures::stream::iter(vec![
            Ok(1),
            Err(OrchestratorError::BackendFailure("boom".into())),
            Ok(3),
        ]);
        let items: Vec<Result<i32>> = TerminationAware::new("m", inner, rx).collect().await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(OrchestratorError::BackendFailure(_))));
    }
}
