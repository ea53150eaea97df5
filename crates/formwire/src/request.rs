//! Request/reply over the event channel.
//!
//! Every round generates a fresh [`CorrelationId`], subscribes to the
//! response kind *before* publishing the request (responders usually answer
//! synchronously from inside `publish`), and ignores responses carrying any
//! other id. Concurrent rounds therefore never cross-resolve.
//!
//! There is no built-in timeout: a round whose responder never answers stays
//! pending forever. [`with_timeout`] is the opt-in hardening.

use crate::bus::{EventChannel, EventKind, FormEvent};
use crate::core::CorrelationId;
use crate::error::{lock, FormError};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

/// Default bound for the `*_timeout` operations.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Publish one request and wait for the first matching response.
///
/// `matcher` receives the round's correlation id and every event of kind
/// `response`; it returns `Some` for the reply that belongs to this round.
pub async fn request<T, B, M>(channel: &EventChannel, response: EventKind, build: B, matcher: M) -> T
where
    T: Send + 'static,
    B: FnOnce(CorrelationId) -> FormEvent + Send,
    M: Fn(CorrelationId, &FormEvent) -> Option<T> + Send + Sync + 'static,
{
    let correlation_id = CorrelationId::new();
    let (tx, rx) = oneshot::channel();
    let slot = Mutex::new(Some(tx));

    let _subscription = channel.subscribe(response, move |event| {
        if let Some(reply) = matcher(correlation_id, event) {
            if let Some(tx) = lock(&slot).take() {
                let _ = tx.send(reply);
            }
        }
    });
    trace!(%correlation_id, ?response, "request");
    channel.publish(build(correlation_id));

    match rx.await {
        Ok(reply) => reply,
        // The sender lives in our own subscription; losing it means the
        // channel went away, which stalls like any missing responder.
        Err(_) => std::future::pending().await,
    }
}

/// Publish one request and feed every matching response to `accept` until it
/// returns `true`.
pub async fn gather<T, B, M, A>(
    channel: &EventChannel,
    response: EventKind,
    build: B,
    matcher: M,
    mut accept: A,
) where
    T: Send + 'static,
    B: FnOnce(CorrelationId) -> FormEvent + Send,
    M: Fn(CorrelationId, &FormEvent) -> Option<T> + Send + Sync + 'static,
    A: FnMut(T) -> bool + Send,
{
    let correlation_id = CorrelationId::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _subscription = channel.subscribe(response, move |event| {
        if let Some(item) = matcher(correlation_id, event) {
            let _ = tx.send(item);
        }
    });
    trace!(%correlation_id, ?response, "gather");
    channel.publish(build(correlation_id));

    while let Some(item) = rx.recv().await {
        if accept(item) {
            return;
        }
    }
    std::future::pending().await
}

/// Bound `fut` by `after`, mapping expiry to [`FormError::Timeout`].
pub async fn with_timeout<F>(operation: &'static str, after: Duration, fut: F) -> Result<F::Output, FormError>
where
    F: Future,
{
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| FormError::Timeout { operation, after })
}
