//! Completion handles for asynchronous notifications.
//!
//! A [`Pending`] is a future resolving to `Result<()>`. It is either already
//! resolved, backed by a [`Completer`] that some task will fire later, or a
//! join over several other pendings that succeeds only if all of them do.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::{ReplicationError, Result};

/// The completing half of a [`Pending`].
#[derive(Debug)]
pub struct Completer(oneshot::Sender<Result<()>>);

impl Completer {
    /// Resolve the paired pending. Ignored if nobody is waiting any more.
    pub fn complete(self, result: Result<()>) {
        let _ = self.0.send(result);
    }

    pub fn succeed(self) {
        self.complete(Ok(()));
    }

    pub fn fail(self, err: ReplicationError) {
        self.complete(Err(err));
    }
}

#[derive(Debug)]
enum Inner {
    Ready(Option<Result<()>>),
    Waiting(oneshot::Receiver<Result<()>>),
    All {
        remaining: Vec<Pending>,
        first_error: Option<ReplicationError>,
    },
}

/// An eventual `Result<()>`.
///
/// Dropping a `Pending` does not cancel the underlying work.
#[must_use = "a pending result does nothing unless awaited or dropped deliberately"]
#[derive(Debug)]
pub struct Pending {
    inner: Inner,
}

impl Pending {
    /// A connected completer/pending pair.
    pub fn channel() -> (Completer, Pending) {
        let (tx, rx) = oneshot::channel();
        (
            Completer(tx),
            Pending {
                inner: Inner::Waiting(rx),
            },
        )
    }

    /// An already successful result.
    pub fn ok() -> Self {
        Self::ready(Ok(()))
    }

    /// An already failed result.
    pub fn failed(err: ReplicationError) -> Self {
        Self::ready(Err(err))
    }

    pub fn ready(result: Result<()>) -> Self {
        Pending {
            inner: Inner::Ready(Some(result)),
        }
    }

    /// Run `task` on `runtime` and resolve with its output.
    pub fn spawn<F>(runtime: &Handle, task: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let (completer, pending) = Self::channel();
        runtime.spawn(async move {
            completer.complete(task.await);
        });
        pending
    }

    /// Resolve once every pending has resolved. Succeeds only if all of them
    /// succeed; otherwise carries the first error observed.
    pub fn all(pendings: Vec<Pending>) -> Self {
        if pendings.is_empty() {
            return Self::ok();
        }
        Pending {
            inner: Inner::All {
                remaining: pendings,
                first_error: None,
            },
        }
    }

    /// Whether the result is available without waiting.
    pub fn is_ready(&self) -> bool {
        matches!(self.inner, Inner::Ready(Some(_)))
    }
}

impl Future for Pending {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.inner {
            Inner::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(ReplicationError::Abandoned)))
            }
            Inner::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(ReplicationError::Abandoned))),
            Inner::All {
                remaining,
                first_error,
            } => {
                let mut index = 0;
                while index < remaining.len() {
                    match Pin::new(&mut remaining[index]).poll(cx) {
                        Poll::Ready(result) => {
                            if let Err(err) = result {
                                first_error.get_or_insert(err);
                            }
                            drop(remaining.swap_remove(index));
                        }
                        Poll::Pending => index += 1,
                    }
                }
                if !remaining.is_empty() {
                    return Poll::Pending;
                }
                Poll::Ready(match first_error.take() {
                    Some(err) => Err(err),
                    None => Ok(()),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_ready_results() {
        assert_eq!(Pending::ok().await, Ok(()));
        assert_eq!(
            Pending::failed(ReplicationError::Send("down".into())).await,
            Err(ReplicationError::Send("down".into()))
        );
    }

    #[tokio::test]
    async fn test_channel_completion() {
        let (completer, pending) = Pending::channel();
        tokio::spawn(async move { completer.succeed() });
        assert_eq!(pending.await, Ok(()));
    }

    #[tokio::test]
    async fn test_dropped_completer_abandons() {
        let (completer, pending) = Pending::channel();
        drop(completer);
        assert_eq!(pending.await, Err(ReplicationError::Abandoned));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_waits_for_slowest() {
        let (fast, fast_pending) = Pending::channel();
        let (slow, slow_pending) = Pending::channel();
        let joined = tokio::spawn(Pending::all(vec![fast_pending, slow_pending]));

        fast.succeed();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!joined.is_finished());

        slow.succeed();
        assert_eq!(joined.await.expect("join"), Ok(()));
    }

    #[tokio::test]
    async fn test_all_reports_failure() {
        let joined = Pending::all(vec![
            Pending::ok(),
            Pending::failed(ReplicationError::Send("timeout".into())),
            Pending::ok(),
        ]);
        assert_eq!(joined.await, Err(ReplicationError::Send("timeout".into())));
        assert_eq!(Pending::all(Vec::new()).await, Ok(()));
    }

    #[tokio::test]
    async fn test_spawned_task() {
        let pending = Pending::spawn(&Handle::current(), async { Ok(()) });
        assert_eq!(pending.await, Ok(()));
    }
}
