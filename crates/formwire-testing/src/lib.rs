//! Testing utilities for formwire forms.
//!
//! - [`ChangeLog`] records every change callback invocation.
//! - [`EventLog`] records events of chosen kinds straight off the channel.
//! - [`EffectRecorder`] builds effects that record the snapshots they ran with.
//! - [`settle_until`] waits for detached validation, effect and reset tasks
//!   to reach a condition; [`settle`] gives them a fixed number of turns.
//! - [`assert_valid`] / [`assert_invalid`] unwrap submit outcomes with
//!   readable failures.

use anyhow::{anyhow, Result};
use formwire_core::{
    Effect, ErrorMap, EventChannel, EventKind, FieldName, FormBuilder, FormEvent, FormValue,
    SubmitOutcome, Subscription,
};
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Scheduler turns [`settle`] gives away.
pub const SETTLE_TURNS: usize = 32;

/// Scheduler turns [`settle_until`] waits before giving up.
pub const SETTLE_UNTIL_TURNS: usize = 4096;

/// Give detached tasks spawned from channel handlers a fixed
/// [`SETTLE_TURNS`] scheduler turns to run.
///
/// Each request/reply hop they wait on costs at least one turn, so this only
/// covers short chains on a current-thread runtime. Use it to show that
/// something did *not* happen; wait for things that should happen with
/// [`settle_until`].
pub async fn settle() {
    for _ in 0..SETTLE_TURNS {
        tokio::task::yield_now().await;
    }
}

/// Yield until `ready` holds, for at most [`SETTLE_UNTIL_TURNS`] turns.
pub async fn settle_until<F>(mut ready: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    for _ in 0..SETTLE_UNTIL_TURNS {
        if ready() {
            return Ok(());
        }
        tokio::task::yield_now().await;
    }
    if ready() {
        Ok(())
    } else {
        Err(anyhow!("condition not reached after {SETTLE_UNTIL_TURNS} scheduler turns"))
    }
}

// ============================================================================
// Change callback recorder
// ============================================================================

/// One change callback invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub value: FormValue,
    pub changed: Vec<FieldName>,
}

/// Recorder for a form's change callback.
#[derive(Debug, Clone, Default)]
pub struct ChangeLog {
    records: Arc<Mutex<Vec<ChangeRecord>>>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install this log as the builder's change callback.
    pub fn attach(&self, builder: FormBuilder) -> FormBuilder {
        let records = self.records.clone();
        builder.on_change(move |value, changed| {
            lock(&records).push(ChangeRecord {
                value: value.clone(),
                changed: changed.to_vec(),
            });
        })
    }

    pub fn records(&self) -> Vec<ChangeRecord> {
        lock(&self.records).clone()
    }

    /// Changed-name lists, one per invocation.
    pub fn changed(&self) -> Vec<Vec<FieldName>> {
        lock(&self.records).iter().map(|r| r.changed.clone()).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many invocations listed `name` as changed.
    pub fn count_for(&self, name: &str) -> usize {
        lock(&self.records)
            .iter()
            .filter(|r| r.changed.iter().any(|n| n == name))
            .count()
    }

    pub fn last(&self) -> Option<ChangeRecord> {
        lock(&self.records).last().cloned()
    }

    pub fn clear(&self) {
        lock(&self.records).clear();
    }
}

// ============================================================================
// Channel recorder
// ============================================================================

/// Records events of the given kinds until dropped.
pub struct EventLog {
    events: Arc<Mutex<Vec<FormEvent>>>,
    _subscriptions: Vec<Subscription>,
}

impl EventLog {
    pub fn new(channel: &EventChannel, kinds: &[EventKind]) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let subscriptions = kinds
            .iter()
            .map(|kind| {
                let events = events.clone();
                channel.subscribe(*kind, move |event| lock(&events).push(event.clone()))
            })
            .collect();
        Self {
            events,
            _subscriptions: subscriptions,
        }
    }

    pub fn events(&self) -> Vec<FormEvent> {
        lock(&self.events).clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        lock(&self.events).iter().map(FormEvent::kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        lock(&self.events).iter().filter(|e| e.kind() == kind).count()
    }

    /// Submit responses as `(field, messages)` pairs.
    pub fn submit_responses(&self) -> Vec<(FieldName, Vec<String>)> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                FormEvent::SubmitResponse { name, messages, .. } => {
                    Some((name.clone(), messages.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

// ============================================================================
// Effect recorder
// ============================================================================

/// Source of recording effects. Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct EffectRecorder {
    runs: Arc<Mutex<Vec<FormValue>>>,
}

impl EffectRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// An effect on `dependencies` that records the snapshot it saw.
    pub fn effect(&self, dependencies: &[&str]) -> Effect {
        let runs = self.runs.clone();
        let dependencies: Vec<String> = dependencies.iter().map(|d| d.to_string()).collect();
        Effect::from_fn(dependencies, move |value, _| {
            let runs = runs.clone();
            async move {
                lock(&runs).push(value.to_plain());
                Ok(())
            }
        })
    }

    pub fn runs(&self) -> usize {
        lock(&self.runs).len()
    }

    /// Snapshot seen by the most recent run.
    pub fn last_seen(&self) -> Option<FormValue> {
        lock(&self.runs).last().cloned()
    }
}

// ============================================================================
// Outcome assertions
// ============================================================================

pub fn assert_valid(outcome: SubmitOutcome) -> Result<FormValue> {
    outcome
        .into_result()
        .map_err(|errors| anyhow!("expected a valid submit, got errors {errors:?}"))
}

pub fn assert_invalid(outcome: SubmitOutcome) -> Result<ErrorMap> {
    match outcome.into_result() {
        Ok(value) => Err(anyhow!("expected submit errors, got value {value:?}")),
        Err(errors) => Ok(errors),
    }
}

/// JSON view of a plain value map, absent entries dropped.
pub fn to_json(value: &FormValue) -> serde_json::Value {
    serde_json::Value::Object(
        value
            .iter()
            .filter_map(|(name, v)| v.as_json().map(|json| (name.clone(), json.clone())))
            .collect(),
    )
}
