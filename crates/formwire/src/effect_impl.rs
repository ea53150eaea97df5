//! Dependency-driven field effects.
//!
//! An [`Effect`] belongs to one field. When a change broadcast names any of
//! its dependencies, its action runs with the new snapshot and helpers scoped
//! to the owning field. A field's effects are walked in declaration order and
//! the walk stops at the first effect whose dependencies miss the changed set,
//! so effect lists are declared in dependency-priority order.

use crate::bus::{EventChannel, FormEvent};
use crate::core::{FieldName, FieldValue, FormValue, ValueSnapshot};
use crate::error::FormError;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Write helpers handed to an effect action, bound to the owning field.
///
/// Writes are requests on the channel; the form controller applies them.
#[derive(Clone)]
pub struct EffectHelpers {
    name: FieldName,
    channel: EventChannel,
}

impl EffectHelpers {
    pub(crate) fn new(name: FieldName, channel: EventChannel) -> Self {
        Self { name, channel }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(&self, value: impl Into<FieldValue>) {
        let mut values = FormValue::new();
        values.insert(self.name.clone(), value.into());
        self.channel.publish(FormEvent::SetValues { values });
    }

    pub fn clear(&self) {
        self.channel.publish(FormEvent::ClearValues {
            names: Some(vec![self.name.clone()]),
        });
    }

    pub fn reset(&self) {
        self.channel.publish(FormEvent::ResetValues {
            names: Some(vec![self.name.clone()]),
        });
    }
}

impl fmt::Debug for EffectHelpers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectHelpers").field("name", &self.name).finish()
    }
}

#[async_trait]
pub trait EffectAction: Send + Sync + 'static {
    async fn run(&self, value: ValueSnapshot, helpers: EffectHelpers) -> anyhow::Result<()>;
}

/// Adapter for closures returning a future.
pub struct FnEffect<F>(F);

#[async_trait]
impl<F, Fut> EffectAction for FnEffect<F>
where
    F: Fn(ValueSnapshot, EffectHelpers) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, value: ValueSnapshot, helpers: EffectHelpers) -> anyhow::Result<()> {
        (self.0)(value, helpers).await
    }
}

/// Dependency list plus action.
#[derive(Clone)]
pub struct Effect {
    dependencies: Vec<FieldName>,
    action: Arc<dyn EffectAction>,
}

impl Effect {
    pub fn new<I, S, A>(dependencies: I, action: A) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<FieldName>,
        A: EffectAction,
    {
        Self {
            dependencies: dependencies
                .into_iter()
                .map(Into::<FieldName>::into)
                .filter(|name| !name.is_empty())
                .collect(),
            action: Arc::new(action),
        }
    }

    pub fn from_fn<I, S, F, Fut>(dependencies: I, f: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<FieldName>,
        F: Fn(ValueSnapshot, EffectHelpers) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::new(dependencies, FnEffect(f))
    }

    pub fn dependencies(&self) -> &[FieldName] {
        &self.dependencies
    }

    /// Whether `changed` hits a dependency other than the owner itself.
    pub(crate) fn triggers(&self, owner: &str, changed: &[FieldName]) -> bool {
        changed
            .iter()
            .any(|name| name != owner && self.dependencies.contains(name))
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// Walk `effects` for one change broadcast. Returns how many actions ran.
pub(crate) async fn run_effects(
    owner: &str,
    effects: &[Effect],
    value: &ValueSnapshot,
    changed: &[FieldName],
    helpers: &EffectHelpers,
) -> Result<usize, FormError> {
    let mut ran = 0;
    for effect in effects {
        if !effect.triggers(owner, changed) {
            break;
        }
        effect
            .action
            .run(value.clone(), helpers.clone())
            .await
            .map_err(|source| FormError::EffectFailed {
                field: owner.to_string(),
                source,
            })?;
        ran += 1;
    }
    if ran > 0 {
        debug!(field = owner, ran, "effects ran");
    }
    Ok(ran)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventKind;
    use crate::error::lock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn counting(deps: &[&str], hits: &Arc<AtomicUsize>) -> Effect {
        let hits = hits.clone();
        Effect::from_fn(deps.iter().copied(), move |_, _| {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn changed(names: &[&str]) -> Vec<FieldName> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn helpers() -> EffectHelpers {
        EffectHelpers::new("owner".into(), EventChannel::new())
    }

    #[tokio::test]
    async fn test_first_miss_stops_the_walk() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let third = Arc::new(AtomicUsize::new(0));
        let effects = vec![
            counting(&["a"], &first),
            counting(&["b"], &second),
            counting(&["a"], &third),
        ];

        let ran = run_effects(
            "owner",
            &effects,
            &ValueSnapshot::default(),
            &changed(&["a"]),
            &helpers(),
        )
        .await
        .unwrap();

        assert_eq!(ran, 1);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        // Would match, but the walk already stopped at the second effect
        assert_eq!(third.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_own_name_never_triggers() {
        let hits = Arc::new(AtomicUsize::new(0));
        let effects = vec![counting(&["owner", ""], &hits)];

        let ran = run_effects(
            "owner",
            &effects,
            &ValueSnapshot::default(),
            &changed(&["owner"]),
            &helpers(),
        )
        .await
        .unwrap();

        assert_eq!(ran, 0);
        assert_eq!(effects[0].dependencies(), &["owner".to_string()]);
    }

    #[tokio::test]
    async fn test_failing_action_stops_and_reports() {
        let after = Arc::new(AtomicUsize::new(0));
        let effects = vec![
            Effect::from_fn(["a"], |_, _| async { Err(anyhow::anyhow!("boom")) }),
            counting(&["a"], &after),
        ];

        let err = run_effects(
            "owner",
            &effects,
            &ValueSnapshot::default(),
            &changed(&["a"]),
            &helpers(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, FormError::EffectFailed { ref field, .. } if field == "owner"));
        assert_eq!(after.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_helpers_publish_scoped_requests() {
        let channel = EventChannel::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subs: Vec<_> = [EventKind::SetValues, EventKind::ClearValues, EventKind::ResetValues]
            .into_iter()
            .map(|kind| {
                let seen = seen.clone();
                channel.subscribe(kind, move |event| lock(&seen).push(event.clone()))
            })
            .collect();

        let helpers = EffectHelpers::new("city".into(), channel.clone());
        helpers.set("Berlin");
        helpers.clear();
        helpers.reset();
        drop(subs);

        let seen = lock(&seen);
        assert_eq!(seen.len(), 3);
        match &seen[0] {
            FormEvent::SetValues { values } => {
                assert_eq!(values.get("city"), Some(&FieldValue::from("Berlin")));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&seen[1], FormEvent::ClearValues { names: Some(n) } if n == &["city".to_string()]));
        assert!(matches!(&seen[2], FormEvent::ResetValues { names: Some(n) } if n == &["city".to_string()]));
    }
}
