//! Per-form publish/subscribe channel.
//!
//! The channel carries a closed set of [`FormEvent`]s. Subscriptions are keyed
//! by [`EventKind`], an enum, so field names travelling as payload can never
//! collide with an event identity.
//!
//! Dispatch is synchronous: `publish` calls every handler subscribed to the
//! event's kind, in subscription order, before returning. Handlers may publish
//! from inside their own invocation. The handler list is snapshotted before
//! dispatch, so a handler added or removed mid-dispatch takes effect from the
//! next `publish`.
//!
//! The channel does not track subscriber liveness. Whoever subscribes holds the
//! returned [`Subscription`] and releases it on unmount; dropping the guard
//! unsubscribes.

use crate::core::{
    ChangedFields, CorrelationId, ErrorSnapshot, FieldName, FieldValue, FormValue, ValueSnapshot,
};
use crate::engine::FormHandle;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Identity of a message type on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Change,
    ErrorsChanged,
    ClearValues,
    ResetValues,
    SetValues,
    RegisterItem,
    UnregisterItem,
    NamesRequest,
    NamesResponse,
    ValueRequest,
    ValueResponse,
    DefaultValueRequest,
    DefaultValueResponse,
    SubmitRequest,
    SubmitResponse,
    Instance,
}

/// Messages exchanged between the form controller and its fields.
#[derive(Debug, Clone)]
pub enum FormEvent {
    /// A new value snapshot was installed.
    Change {
        value: ValueSnapshot,
        changed: ChangedFields,
    },
    /// Submit installed a new error snapshot.
    ErrorsChanged { errors: ErrorSnapshot },
    /// Set the listed names (all registered names when `None`) to absent.
    ClearValues { names: Option<Vec<FieldName>> },
    /// Restore the listed names (all registered names when `None`) to their defaults.
    ResetValues { names: Option<Vec<FieldName>> },
    /// Merge these values into the snapshot.
    SetValues { values: FormValue },
    RegisterItem {
        name: FieldName,
        default_value: FieldValue,
    },
    UnregisterItem { name: FieldName },
    NamesRequest { correlation_id: CorrelationId },
    NamesResponse {
        correlation_id: CorrelationId,
        names: Vec<FieldName>,
    },
    ValueRequest { correlation_id: CorrelationId },
    ValueResponse {
        correlation_id: CorrelationId,
        value: ValueSnapshot,
    },
    DefaultValueRequest {
        correlation_id: CorrelationId,
        name: FieldName,
    },
    DefaultValueResponse {
        correlation_id: CorrelationId,
        default_value: FieldValue,
    },
    SubmitRequest { correlation_id: CorrelationId },
    SubmitResponse {
        correlation_id: CorrelationId,
        name: FieldName,
        messages: Vec<String>,
    },
    /// The form's control surface is ready.
    Instance { handle: FormHandle },
}

impl FormEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            FormEvent::Change { .. } => EventKind::Change,
            FormEvent::ErrorsChanged { .. } => EventKind::ErrorsChanged,
            FormEvent::ClearValues { .. } => EventKind::ClearValues,
            FormEvent::ResetValues { .. } => EventKind::ResetValues,
            FormEvent::SetValues { .. } => EventKind::SetValues,
            FormEvent::RegisterItem { .. } => EventKind::RegisterItem,
            FormEvent::UnregisterItem { .. } => EventKind::UnregisterItem,
            FormEvent::NamesRequest { .. } => EventKind::NamesRequest,
            FormEvent::NamesResponse { .. } => EventKind::NamesResponse,
            FormEvent::ValueRequest { .. } => EventKind::ValueRequest,
            FormEvent::ValueResponse { .. } => EventKind::ValueResponse,
            FormEvent::DefaultValueRequest { .. } => EventKind::DefaultValueRequest,
            FormEvent::DefaultValueResponse { .. } => EventKind::DefaultValueResponse,
            FormEvent::SubmitRequest { .. } => EventKind::SubmitRequest,
            FormEvent::SubmitResponse { .. } => EventKind::SubmitResponse,
            FormEvent::Instance { .. } => EventKind::Instance,
        }
    }

    /// Correlation id of request/response messages.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            FormEvent::NamesRequest { correlation_id }
            | FormEvent::NamesResponse { correlation_id, .. }
            | FormEvent::ValueRequest { correlation_id }
            | FormEvent::ValueResponse { correlation_id, .. }
            | FormEvent::DefaultValueRequest { correlation_id, .. }
            | FormEvent::DefaultValueResponse { correlation_id, .. }
            | FormEvent::SubmitRequest { correlation_id }
            | FormEvent::SubmitResponse { correlation_id, .. } => Some(*correlation_id),
            _ => None,
        }
    }
}

type Handler = Arc<dyn Fn(&FormEvent) + Send + Sync>;

/// Identifies one handler registration on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct ChannelInner {
    handlers: DashMap<EventKind, Vec<(SubscriptionId, Handler)>>,
    next_id: AtomicU64,
}

impl ChannelInner {
    fn remove(&self, kind: EventKind, id: SubscriptionId) -> bool {
        match self.handlers.get_mut(&kind) {
            Some(mut entry) => {
                let before = entry.len();
                entry.retain(|(existing, _)| *existing != id);
                before != entry.len()
            }
            None => false,
        }
    }
}

/// In-memory event channel scoped to one form.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone, Default)]
pub struct EventChannel {
    inner: Arc<ChannelInner>,
}

impl EventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`.
    ///
    /// The handler stays registered until the returned guard is dropped or
    /// [`unsubscribe`](Self::unsubscribe) is called with its id.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&FormEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        trace!(?kind, ?id, "subscribed");

        Subscription {
            channel: Arc::downgrade(&self.inner),
            kind,
            id,
        }
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        self.inner.remove(kind, id)
    }

    /// Deliver `event` to every handler of its kind, synchronously.
    pub fn publish(&self, event: FormEvent) {
        let kind = event.kind();
        // Clone the handler list so no map lock is held while handlers run.
        let handlers: Vec<Handler> = match self.inner.handlers.get(&kind) {
            Some(entry) => entry.iter().map(|(_, handler)| Arc::clone(handler)).collect(),
            None => Vec::new(),
        };
        trace!(?kind, subscribers = handlers.len(), "publish");

        for handler in handlers {
            handler(&event);
        }
    }

    /// Subscribe `f` on behalf of `target` without keeping it alive.
    ///
    /// Owners store their subscriptions, so a strong capture would form a
    /// cycle through the channel.
    pub(crate) fn subscribe_weak<T>(
        &self,
        target: &Arc<T>,
        kind: EventKind,
        f: fn(&Arc<T>, &FormEvent),
    ) -> Subscription
    where
        T: Send + Sync + 'static,
    {
        let weak = Arc::downgrade(target);
        self.subscribe(kind, move |event| {
            if let Some(target) = weak.upgrade() {
                f(&target, event);
            }
        })
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .handlers
            .get(&kind)
            .map(|entry| entry.len())
            .unwrap_or(0)
    }
}

impl fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("kinds", &self.inner.handlers.len())
            .finish()
    }
}

/// RAII guard for a handler registration. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    channel: Weak<ChannelInner>,
    kind: EventKind,
    id: SubscriptionId,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.channel.upgrade() {
            inner.remove(self.kind, self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn clear_all() -> FormEvent {
        FormEvent::ClearValues { names: None }
    }

    #[test]
    fn test_handlers_run_in_subscription_order() {
        let channel = EventChannel::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let _subs: Vec<Subscription> = (0..3)
            .map(|i| {
                let seen = seen.clone();
                channel.subscribe(EventKind::ClearValues, move |_| {
                    seen.lock().unwrap().push(i);
                })
            })
            .collect();

        channel.publish(clear_all());
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_kinds_are_isolated() {
        let channel = EventChannel::new();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        let _sub = channel.subscribe(EventKind::ResetValues, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        channel.publish(clear_all());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        channel.publish(FormEvent::ResetValues { names: None });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_may_publish_reentrantly() {
        let channel = EventChannel::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner_channel = channel.clone();
        let log = seen.clone();
        let _request = channel.subscribe(EventKind::NamesRequest, move |event| {
            log.lock().unwrap().push("request");
            if let Some(correlation_id) = event.correlation_id() {
                inner_channel.publish(FormEvent::NamesResponse {
                    correlation_id,
                    names: vec!["a".into()],
                });
            }
        });
        let log = seen.clone();
        let _response = channel.subscribe(EventKind::NamesResponse, move |_| {
            log.lock().unwrap().push("response");
        });

        channel.publish(FormEvent::NamesRequest {
            correlation_id: CorrelationId::new(),
        });
        assert_eq!(*seen.lock().unwrap(), vec!["request", "response"]);
    }

    #[test]
    fn test_drop_and_explicit_unsubscribe() {
        let channel = EventChannel::new();
        let hits = Arc::new(AtomicU64::new(0));

        let counter = hits.clone();
        let kept = channel.subscribe(EventKind::ClearValues, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = hits.clone();
        let dropped = channel.subscribe(EventKind::ClearValues, move |_| {
            counter.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(channel.subscriber_count(EventKind::ClearValues), 2);

        drop(dropped);
        channel.publish(clear_all());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(channel.unsubscribe(EventKind::ClearValues, kept.id()));
        assert!(!channel.unsubscribe(EventKind::ClearValues, kept.id()));
        channel.publish(clear_all());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_outliving_channel_is_inert() {
        let channel = EventChannel::new();
        let sub = channel.subscribe(EventKind::Change, |_| {});
        drop(channel);
        drop(sub);
    }

    #[test]
    fn test_subscribe_during_publish_applies_next_time() {
        let channel = EventChannel::new();
        let hits = Arc::new(AtomicU64::new(0));
        let late: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));

        let inner_channel = channel.clone();
        let counter = hits.clone();
        let holder = late.clone();
        let _first = channel.subscribe(EventKind::ClearValues, move |_| {
            let counter = counter.clone();
            let sub = inner_channel.subscribe(EventKind::ClearValues, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            holder.lock().unwrap().push(sub);
        });

        channel.publish(clear_all());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        channel.publish(clear_all());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
