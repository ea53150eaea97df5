//! Form controller.
//!
//! The controller owns the value snapshot, the error snapshot and the event
//! channel for one form. It is the only writer of both snapshots: fields and
//! callers request writes by publishing events, and the controller's channel
//! handlers apply them one at a time in emission order. Every applied write
//! purges the changed names from the error snapshot, invokes the change
//! callback and rebroadcasts a `Change` event.
//!
//! `submit` and `reset_values` are request/reply exchanges over the same
//! channel; see [`crate::request`].

use crate::bus::{EventChannel, EventKind, FormEvent, Subscription};
use crate::core::{
    normalize_names, ChangedFields, ErrorMap, ErrorSnapshot, FieldName, FieldValue, FormValue,
    SubmitOutcome, ValueSnapshot,
};
use crate::error::{lock, FormError};
use crate::field::{FieldController, FieldProps};
use crate::request::{gather, request, with_timeout};
use crate::template::TemplateRegistry;
use futures::future::join_all;
use indexmap::IndexMap;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, debug_span, warn, Instrument};

/// Receives the plain value map and the changed names after every write.
pub type ChangeCallback = Arc<dyn Fn(&FormValue, &[FieldName]) + Send + Sync>;

/// Receives the control handle once the form is mounted.
pub type InstanceCallback = Arc<dyn Fn(&FormHandle) + Send + Sync>;

/// Run `fut` on the current tokio runtime, if there is one.
///
/// Channel handlers are synchronous; validation, effects and resets started
/// from them continue as detached tasks.
pub(crate) fn spawn_detached<F>(task: &'static str, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(fut);
        }
        Err(_) => warn!(task, "no tokio runtime available, background work dropped"),
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Configuration for a form, consumed by [`build`](FormBuilder::build).
#[derive(Default)]
pub struct FormBuilder {
    default_values: FormValue,
    component_props: IndexMap<FieldName, Vec<serde_json::Value>>,
    disabled: bool,
    read_only: bool,
    on_change: Option<ChangeCallback>,
    on_instance: Option<InstanceCallback>,
    templates: TemplateRegistry,
}

impl FormBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Externally supplied defaults; these win over a field's own default.
    pub fn default_values(mut self, values: FormValue) -> Self {
        self.default_values.extend(values);
        self
    }

    pub fn default_value(mut self, name: impl Into<FieldName>, value: impl Into<FieldValue>) -> Self {
        self.default_values.insert(name.into(), value.into());
        self
    }

    /// Per-control props for the field `name`, in control order.
    pub fn component_props(mut self, name: impl Into<FieldName>, props: Vec<serde_json::Value>) -> Self {
        self.component_props.insert(name.into(), props);
        self
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn on_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&FormValue, &[FieldName]) + Send + Sync + 'static,
    {
        self.on_change = Some(Arc::new(f));
        self
    }

    pub fn on_instance<F>(mut self, f: F) -> Self
    where
        F: Fn(&FormHandle) + Send + Sync + 'static,
    {
        self.on_instance = Some(Arc::new(f));
        self
    }

    pub fn templates(mut self, templates: TemplateRegistry) -> Self {
        self.templates = templates;
        self
    }

    /// Mount the form: subscribe its handlers and publish its instance.
    pub fn build(self) -> FormController {
        let inner = Arc::new(FormInner {
            channel: EventChannel::new(),
            state: Mutex::new(FormState::default()),
            outbox: Mutex::new(Outbox::default()),
            default_values: self.default_values,
            component_props: self.component_props,
            disabled: self.disabled,
            read_only: self.read_only,
            on_change: self.on_change,
            templates: self.templates,
        });

        let channel = inner.channel.clone();
        let mut subscriptions = vec![
            channel.subscribe_weak(&inner, EventKind::RegisterItem, FormInner::on_register),
            channel.subscribe_weak(&inner, EventKind::UnregisterItem, FormInner::on_unregister),
            channel.subscribe_weak(&inner, EventKind::SetValues, FormInner::on_set_values),
            channel.subscribe_weak(&inner, EventKind::ClearValues, FormInner::on_clear_values),
            channel.subscribe_weak(&inner, EventKind::ResetValues, FormInner::on_reset_values),
            channel.subscribe_weak(&inner, EventKind::NamesRequest, FormInner::on_names_request),
            channel.subscribe_weak(&inner, EventKind::ValueRequest, FormInner::on_value_request),
        ];

        if let Some(on_instance) = self.on_instance {
            subscriptions.push(channel.subscribe(EventKind::Instance, move |event| {
                if let FormEvent::Instance { handle } = event {
                    on_instance(handle);
                }
            }));
        }

        let handle = FormHandle { inner };
        debug!("form mounted");
        channel.publish(FormEvent::Instance {
            handle: handle.clone(),
        });

        FormController {
            handle,
            _subscriptions: subscriptions,
        }
    }
}

// ============================================================================
// Controller state
// ============================================================================

#[derive(Default)]
struct FormState {
    values: ValueSnapshot,
    errors: ErrorSnapshot,
}

/// Change notifications waiting for delivery, in commit order.
#[derive(Default)]
struct Outbox {
    pending: VecDeque<(ValueSnapshot, ChangedFields)>,
    draining: bool,
}

/// Releases the drain flag if a change handler panics mid-delivery.
struct DrainGuard<'a> {
    outbox: &'a Mutex<Outbox>,
    armed: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut outbox = lock(self.outbox);
            outbox.draining = false;
            outbox.pending.clear();
        }
    }
}

struct FormInner {
    channel: EventChannel,
    state: Mutex<FormState>,
    outbox: Mutex<Outbox>,
    default_values: FormValue,
    component_props: IndexMap<FieldName, Vec<serde_json::Value>>,
    disabled: bool,
    read_only: bool,
    on_change: Option<ChangeCallback>,
    templates: TemplateRegistry,
}

impl FormInner {
    fn values(&self) -> ValueSnapshot {
        lock(&self.state).values.clone()
    }

    /// Replace the value snapshot with whatever `next` derives from the
    /// current one, then notify. `None` from `next` means nothing moved.
    ///
    /// A commit made while a change is being delivered (a handler writing
    /// back into the form) is queued behind it. Every observer therefore sees
    /// changes in version order, and the last one it sees is the current
    /// snapshot.
    fn commit<F>(&self, next: F)
    where
        F: FnOnce(&ValueSnapshot) -> Option<(ValueSnapshot, ChangedFields)>,
    {
        let deliver = {
            let mut state = lock(&self.state);
            let Some((value, changed)) = next(&state.values) else {
                return;
            };
            debug!(version = value.version(), changed = ?changed, "value snapshot replaced");
            state.errors = state.errors.purge(&changed);
            state.values = value.clone();

            // Queued under the state lock so the queue order is version order.
            let mut outbox = lock(&self.outbox);
            outbox.pending.push_back((value, changed));
            !std::mem::replace(&mut outbox.draining, true)
        };
        if deliver {
            self.deliver_changes();
        }
    }

    fn deliver_changes(&self) {
        let mut guard = DrainGuard {
            outbox: &self.outbox,
            armed: true,
        };
        loop {
            let (value, changed) = {
                let mut outbox = lock(&self.outbox);
                match outbox.pending.pop_front() {
                    Some(next) => next,
                    None => {
                        outbox.draining = false;
                        break;
                    }
                }
            };
            if let Some(on_change) = &self.on_change {
                on_change(&value.to_plain(), &changed);
            }
            self.channel.publish(FormEvent::Change { value, changed });
        }
        guard.armed = false;
    }

    /// Explicit names, or every registered name when none are given.
    fn targets(current: &ValueSnapshot, names: Option<Vec<FieldName>>) -> Vec<FieldName> {
        let names = normalize_names(names.unwrap_or_default());
        if names.is_empty() {
            current.names()
        } else {
            names
        }
    }

    fn clear(&self, names: Option<Vec<FieldName>>) {
        self.commit(|current| {
            let moved: ChangedFields = Self::targets(current, names)
                .into_iter()
                .filter(|name| matches!(current.get(name), Some(value) if !value.is_absent()))
                .collect();
            if moved.is_empty() {
                return None;
            }
            let next = current.merge(moved.iter().map(|name| (name.clone(), FieldValue::Absent)));
            Some((next, moved))
        });
    }

    async fn reset(&self, names: Option<Vec<FieldName>>) -> ChangedFields {
        let targets = Self::targets(&self.values(), names);
        if targets.is_empty() {
            return ChangedFields::new();
        }

        let span = debug_span!("reset", fields = targets.len());
        async {
            let requests = targets.iter().map(|name| async move {
                let default_value = request(
                    &self.channel,
                    EventKind::DefaultValueResponse,
                    |correlation_id| FormEvent::DefaultValueRequest {
                        correlation_id,
                        name: name.clone(),
                    },
                    |id, event| match event {
                        FormEvent::DefaultValueResponse {
                            correlation_id,
                            default_value,
                        } if *correlation_id == id => Some(default_value.clone()),
                        _ => None,
                    },
                )
                .await;
                (name.clone(), default_value)
            });
            let resolved = join_all(requests).await;

            let changed: ChangedFields = resolved.iter().map(|(name, _)| name.clone()).collect();
            self.commit(|current| Some((current.merge(resolved), changed.clone())));
            debug!(changed = ?changed, "reset applied");
            changed
        }
        .instrument(span)
        .await
    }

    async fn submit(&self) -> SubmitOutcome {
        let span = debug_span!("submit");
        async {
            let names = request(
                &self.channel,
                EventKind::NamesResponse,
                |correlation_id| FormEvent::NamesRequest { correlation_id },
                |id, event| match event {
                    FormEvent::NamesResponse {
                        correlation_id,
                        names,
                    } if *correlation_id == id => Some(names.clone()),
                    _ => None,
                },
            )
            .await;

            let value = request(
                &self.channel,
                EventKind::ValueResponse,
                |correlation_id| FormEvent::ValueRequest { correlation_id },
                |id, event| match event {
                    FormEvent::ValueResponse {
                        correlation_id,
                        value,
                    } if *correlation_id == id => Some(value.clone()),
                    _ => None,
                },
            )
            .await;

            let mut results: IndexMap<FieldName, Vec<String>> = IndexMap::new();
            if !names.is_empty() {
                gather(
                    &self.channel,
                    EventKind::SubmitResponse,
                    |correlation_id| FormEvent::SubmitRequest { correlation_id },
                    |id, event| match event {
                        FormEvent::SubmitResponse {
                            correlation_id,
                            name,
                            messages,
                        } if *correlation_id == id => Some((name.clone(), messages.clone())),
                        _ => None,
                    },
                    |(name, messages)| {
                        if !value.contains(&name) {
                            return false;
                        }
                        let messages = messages.into_iter().filter(|m| !m.is_empty()).collect();
                        results.insert(name, messages);
                        names.iter().all(|name| results.contains_key(name))
                    },
                )
                .await;
            }

            let errors: ErrorMap = results
                .into_iter()
                .filter(|(_, messages)| !messages.is_empty())
                .collect();
            let snapshot = ErrorSnapshot::from_map(errors.clone());
            lock(&self.state).errors = snapshot.clone();
            debug!(fields = names.len(), invalid = errors.len(), "submit settled");
            self.channel.publish(FormEvent::ErrorsChanged { errors: snapshot });

            if errors.is_empty() {
                SubmitOutcome::valid(value.to_plain())
            } else {
                SubmitOutcome::invalid(errors)
            }
        }
        .instrument(span)
        .await
    }

    // ------------------------------------------------------------------------
    // Channel handlers
    // ------------------------------------------------------------------------

    fn on_register(self: &Arc<Self>, event: &FormEvent) {
        let FormEvent::RegisterItem {
            name,
            default_value,
        } = event
        else {
            return;
        };
        self.commit(|current| {
            if name.is_empty() || current.contains(name) {
                return None;
            }
            debug!(field = %name, "field registered");
            let next = current.merge([(name.clone(), default_value.clone())]);
            Some((next, ChangedFields::from_iter([name.clone()])))
        });
    }

    fn on_unregister(self: &Arc<Self>, event: &FormEvent) {
        let FormEvent::UnregisterItem { name } = event else {
            return;
        };
        self.commit(|current| {
            if name.is_empty() || !current.contains(name) {
                return None;
            }
            debug!(field = %name, "field unregistered");
            Some((current.remove(name), ChangedFields::from_iter([name.clone()])))
        });
    }

    fn on_set_values(self: &Arc<Self>, event: &FormEvent) {
        let FormEvent::SetValues { values } = event else {
            return;
        };
        // Unregistered names are accepted and become registered headless fields.
        let updates: Vec<(FieldName, FieldValue)> = values
            .iter()
            .filter(|(name, _)| !name.is_empty())
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        if updates.is_empty() {
            return;
        }
        self.commit(|current| {
            let changed = updates.iter().map(|(name, _)| name.clone()).collect();
            Some((current.merge(updates), changed))
        });
    }

    fn on_clear_values(self: &Arc<Self>, event: &FormEvent) {
        if let FormEvent::ClearValues { names } = event {
            self.clear(names.clone());
        }
    }

    fn on_reset_values(self: &Arc<Self>, event: &FormEvent) {
        if let FormEvent::ResetValues { names } = event {
            let inner = Arc::clone(self);
            let names = names.clone();
            spawn_detached("reset", async move {
                inner.reset(names).await;
            });
        }
    }

    fn on_names_request(self: &Arc<Self>, event: &FormEvent) {
        if let FormEvent::NamesRequest { correlation_id } = event {
            let names = self.values().names();
            self.channel.publish(FormEvent::NamesResponse {
                correlation_id: *correlation_id,
                names,
            });
        }
    }

    fn on_value_request(self: &Arc<Self>, event: &FormEvent) {
        if let FormEvent::ValueRequest { correlation_id } = event {
            let value = self.values();
            self.channel.publish(FormEvent::ValueResponse {
                correlation_id: *correlation_id,
                value,
            });
        }
    }
}

// ============================================================================
// Public surface
// ============================================================================

/// Mounted form. Dropping it unmounts: every controller subscription is
/// released and further requests through a leftover [`FormHandle`] go
/// unanswered.
pub struct FormController {
    handle: FormHandle,
    _subscriptions: Vec<Subscription>,
}

impl FormController {
    pub fn builder() -> FormBuilder {
        FormBuilder::new()
    }

    pub fn handle(&self) -> FormHandle {
        self.handle.clone()
    }

    /// Mount one field into this form.
    pub fn mount_field(&self, props: FieldProps) -> FieldController {
        FieldController::mount(&self.handle, props)
    }

    pub fn mount_fields<I>(&self, props: I) -> Vec<FieldController>
    where
        I: IntoIterator<Item = FieldProps>,
    {
        props.into_iter().map(|props| self.mount_field(props)).collect()
    }

    /// Field descriptors from the form's template registry.
    pub fn template(&self, id: &str, names: &[&str]) -> Vec<FieldProps> {
        self.handle.inner.templates.get_partial_template(id, names)
    }
}

impl Deref for FormController {
    type Target = FormHandle;

    fn deref(&self) -> &FormHandle {
        &self.handle
    }
}

impl fmt::Debug for FormController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormController")
            .field("handle", &self.handle)
            .field("subscriptions", &self._subscriptions.len())
            .finish()
    }
}

/// Cloneable control surface of a form.
///
/// Writes are published on the form's channel and applied by the
/// controller; reads return the current snapshots.
#[derive(Clone)]
pub struct FormHandle {
    inner: Arc<FormInner>,
}

impl FormHandle {
    pub fn channel(&self) -> &EventChannel {
        &self.inner.channel
    }

    pub fn set_value(&self, name: impl Into<FieldName>, value: impl Into<FieldValue>) {
        let mut values = FormValue::new();
        values.insert(name.into(), value.into());
        self.set_values(values);
    }

    /// Merge `values` into the snapshot. Unregistered names become registered.
    pub fn set_values(&self, values: FormValue) {
        self.inner.channel.publish(FormEvent::SetValues { values });
    }

    /// Set the listed names to absent; an empty list means every registered
    /// name. Names already absent do not count as changed.
    pub fn clear_values<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<FieldName>,
    {
        self.inner.channel.publish(FormEvent::ClearValues {
            names: Some(names.into_iter().map(Into::into).collect()),
        });
    }

    pub fn clear_all(&self) {
        self.inner
            .channel
            .publish(FormEvent::ClearValues { names: None });
    }

    /// Restore the listed names (every registered name when empty) to their
    /// fields' resolved defaults, as one change.
    ///
    /// Waits for every named field to answer. A name with no mounted field
    /// never answers and the call never completes; see
    /// [`reset_values_timeout`](Self::reset_values_timeout).
    pub async fn reset_values<I, S>(&self, names: I) -> ChangedFields
    where
        I: IntoIterator<Item = S>,
        S: Into<FieldName>,
    {
        let names = names.into_iter().map(Into::into).collect();
        self.inner.reset(Some(names)).await
    }

    pub async fn reset_all(&self) -> ChangedFields {
        self.inner.reset(None).await
    }

    pub async fn reset_values_timeout<I, S>(&self, names: I, after: Duration) -> Result<ChangedFields, FormError>
    where
        I: IntoIterator<Item = S>,
        S: Into<FieldName>,
    {
        with_timeout("reset", after, self.reset_values(names)).await
    }

    /// Validate every registered field and resolve with either the value
    /// snapshot or the collected errors. Replaces the error snapshot.
    ///
    /// Completes only once each field registered at request time has
    /// answered. A registered name without a live field stalls it forever;
    /// see [`submit_timeout`](Self::submit_timeout).
    ///
    /// Fields validate on detached tokio tasks, so this must be awaited
    /// inside a tokio runtime. Driven by any other executor, the validation
    /// tasks are dropped with a warning and the call never completes.
    ///
    /// Once settled, publishes [`FormEvent::ErrorsChanged`] so mounted fields
    /// re-evaluate conditions that read their error messages.
    pub async fn submit(&self) -> SubmitOutcome {
        self.inner.submit().await
    }

    pub async fn submit_timeout(&self, after: Duration) -> Result<SubmitOutcome, FormError> {
        with_timeout("submit", after, self.inner.submit()).await
    }

    /// `None` when `name` is not registered.
    pub fn get_value(&self, name: &str) -> Option<FieldValue> {
        self.inner.values().get(name).cloned()
    }

    pub fn get_values(&self) -> FormValue {
        self.inner.values().to_plain()
    }

    pub fn values(&self) -> ValueSnapshot {
        self.inner.values()
    }

    pub fn errors(&self) -> ErrorSnapshot {
        lock(&self.inner.state).errors.clone()
    }

    pub fn error_messages(&self, name: &str) -> Option<Vec<String>> {
        self.errors().get(name).map(<[String]>::to_vec)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.values().contains(name)
    }

    pub fn default_values(&self) -> &FormValue {
        &self.inner.default_values
    }

    pub fn component_props(&self, name: &str) -> Option<&[serde_json::Value]> {
        self.inner.component_props.get(name).map(Vec::as_slice)
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.disabled
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.inner.templates
    }
}

impl fmt::Debug for FormHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = self.inner.values();
        f.debug_struct("FormHandle")
            .field("version", &values.version())
            .field("fields", &values.names())
            .finish()
    }
}
