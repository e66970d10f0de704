// System
use std::future::Future;

// Third Party
use futures::{Stream, StreamExt};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::info;

// Local
use crate::error::{TraceError, TraceResult};

/// Derive a token from `parent` that is cancelled by the first item of `notifications`. Later
/// notifications are ignored; the listener stops after the first one.
///
/// The listener also stops, releasing `notifications`, when the returned guard is dropped. Hold
/// it for as long as the token is in use.
pub fn cancel_on_first<S>(
    parent: &CancellationToken,
    notifications: S,
) -> (CancellationToken, DropGuard)
where
    S: Stream<Item = ()> + Send + 'static,
{
    let token = parent.child_token();
    let listener = token.clone();
    let stop = CancellationToken::new();
    let stopped = stop.clone();
    tokio::spawn(async move {
        futures::pin_mut!(notifications);
        tokio::select! {
            _ = listener.cancelled() => {}
            _ = stopped.cancelled() => {}
            notification = notifications.next() => {
                if notification.is_some() {
                    info!("Interrupted, detaching...");
                    listener.cancel();
                }
            }
        }
    });
    (token, stop.drop_guard())
}

/// Derive a token that is cancelled by the first SIGINT or SIGTERM the process receives. The
/// signal listeners are released when the guard is dropped.
pub fn with_standard_signals(
    parent: &CancellationToken,
) -> std::io::Result<(CancellationToken, DropGuard)> {
    Ok(cancel_on_first(parent, standard_signals()?))
}

#[cfg(unix)]
fn standard_signals() -> std::io::Result<impl Stream<Item = ()> + Send + 'static> {
    use tokio::signal::unix::{signal, SignalKind};

    let interrupt = signal(SignalKind::interrupt())?;
    let terminate = signal(SignalKind::terminate())?;
    Ok(futures::stream::unfold(
        (interrupt, terminate),
        |(mut interrupt, mut terminate)| async move {
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
            }
            Some(((), (interrupt, terminate)))
        },
    ))
}

#[cfg(not(unix))]
fn standard_signals() -> std::io::Result<impl Stream<Item = ()> + Send + 'static> {
    Ok(futures::stream::unfold((), |()| async {
        tokio::signal::ctrl_c().await.ok()?;
        Some(((), ()))
    }))
}

/// Run `future` unless `token` is cancelled first. An already cancelled token wins without the
/// future being polled.
pub async fn cancellable<F: Future>(token: &CancellationToken, future: F) -> TraceResult<F::Output> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(TraceError::Cancelled),
        output = future => Ok(output),
    }
}

#[cfg(test)]
mod tests {
    // System
    use std::{sync::Arc, time::Duration};

    // Third Party
    use futures::{channel::mpsc, stream};

    // Local
    use super::*;

    #[tokio::test]
    async fn first_notification_cancels() {
        let parent = CancellationToken::new();
        let (sender, receiver) = mpsc::unbounded();
        let (token, _guard) = cancel_on_first(&parent, receiver);
        assert!(!token.is_cancelled());

        sender.unbounded_send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
        assert!(!parent.is_cancelled());

        // The listener is gone; a second notification changes nothing.
        let _ = sender.unbounded_send(());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn parent_cancellation_propagates() {
        let parent = CancellationToken::new();
        let (_sender, receiver) = mpsc::unbounded::<()>();
        let (token, _guard) = cancel_on_first(&parent, receiver);
        parent.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn closed_notifications_do_not_cancel() {
        let parent = CancellationToken::new();
        let (sender, receiver) = mpsc::unbounded::<()>();
        let (token, _guard) = cancel_on_first(&parent, receiver);
        drop(sender);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn dropping_the_guard_releases_the_listener() {
        let parent = CancellationToken::new();
        let held = Arc::new(());
        let notifications = {
            let held = held.clone();
            stream::pending::<()>().map(move |notification| {
                let _held = &held;
                notification
            })
        };
        let (token, guard) = cancel_on_first(&parent, notifications);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(Arc::strong_count(&held), 2);

        drop(guard);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(Arc::strong_count(&held), 1);
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn listeners_of_sequential_attaches_do_not_pile_up() {
        let parent = CancellationToken::new();
        let held = Arc::new(());
        for _ in 0..3 {
            let notifications = {
                let held = held.clone();
                stream::pending::<()>().map(move |notification| {
                    let _held = &held;
                    notification
                })
            };
            let (token, _guard) = cancel_on_first(&parent, notifications);
            drop(token);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(Arc::strong_count(&held), 1);
    }

    #[tokio::test]
    async fn cancellable_prefers_cancellation() {
        let token = CancellationToken::new();
        assert_eq!(cancellable(&token, async { 7 }).await.unwrap(), 7);

        token.cancel();
        assert!(matches!(
            cancellable(&token, async { 7 }).await,
            Err(TraceError::Cancelled)
        ));
    }
}
