//! Field controller.
//!
//! A field takes part in its form only through the channel. On mount it
//! resolves its default (external default for its name, else its own static
//! default), then registers or unregisters itself according to its
//! register condition. From then on it
//!
//! - re-evaluates its conditions on every change broadcast,
//! - runs its effects when a change hits their dependencies,
//! - answers default-value requests for its name,
//! - answers every submit request with exactly one validation response.
//!
//! ```text
//! Uninitialized ─► DefaultResolved ─► Registered ⇄ Unregistered
//! ```
//!
//! Dropping the controller unmounts it and releases its subscriptions.

use crate::bus::{EventKind, FormEvent, Subscription};
use crate::core::{FieldName, FieldValue, FormValue, ItemContext};
use crate::effect_impl::{run_effects, Effect, EffectHelpers};
use crate::engine::{spawn_detached, FormHandle};
use crate::error::lock;
use crate::validation::{run_validators, RequiredValidator, Validator};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

/// Predicate over a field's item context.
pub type Condition = Arc<dyn Fn(&ItemContext) -> bool + Send + Sync>;

/// Value transform used by [`Serializer`].
pub type Transform = Arc<dyn Fn(&FieldValue) -> FieldValue + Send + Sync>;

/// A boolean that is either fixed or computed from the item context.
#[derive(Clone)]
pub enum Flag {
    Static(bool),
    When(Condition),
}

impl Flag {
    pub fn when<F>(f: F) -> Self
    where
        F: Fn(&ItemContext) -> bool + Send + Sync + 'static,
    {
        Flag::When(Arc::new(f))
    }

    pub fn evaluate(&self, context: &ItemContext) -> bool {
        match self {
            Flag::Static(value) => *value,
            Flag::When(condition) => condition(context),
        }
    }
}

impl Default for Flag {
    fn default() -> Self {
        Flag::Static(false)
    }
}

impl From<bool> for Flag {
    fn from(value: bool) -> Self {
        Flag::Static(value)
    }
}

impl fmt::Debug for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flag::Static(value) => f.debug_tuple("Static").field(value).finish(),
            Flag::When(_) => f.write_str("When(..)"),
        }
    }
}

/// Converts between the stored value and what the rendered control shows.
///
/// `incoming` maps stored → control, `outgoing` maps control → stored. The
/// snapshot always holds the outgoing form.
#[derive(Clone, Default)]
pub struct Serializer {
    incoming: Option<Transform>,
    outgoing: Option<Transform>,
}

impl Serializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incoming<F>(mut self, f: F) -> Self
    where
        F: Fn(&FieldValue) -> FieldValue + Send + Sync + 'static,
    {
        self.incoming = Some(Arc::new(f));
        self
    }

    pub fn outgoing<F>(mut self, f: F) -> Self
    where
        F: Fn(&FieldValue) -> FieldValue + Send + Sync + 'static,
    {
        self.outgoing = Some(Arc::new(f));
        self
    }

    pub fn to_control(&self, stored: &FieldValue) -> FieldValue {
        match &self.incoming {
            Some(incoming) => incoming(stored),
            None => stored.clone(),
        }
    }

    pub fn to_stored(&self, control: &FieldValue) -> FieldValue {
        match &self.outgoing {
            Some(outgoing) => outgoing(control),
            None => control.clone(),
        }
    }
}

impl fmt::Debug for Serializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Serializer")
            .field("incoming", &self.incoming.is_some())
            .field("outgoing", &self.outgoing.is_some())
            .finish()
    }
}

/// Payload of a rendered control's change callback.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlInput {
    /// A native UI change event; only its target value is kept.
    ChangeEvent { target_value: FieldValue },
    /// A plain value.
    Value(FieldValue),
}

impl ControlInput {
    pub fn change_event(target_value: impl Into<FieldValue>) -> Self {
        ControlInput::ChangeEvent {
            target_value: target_value.into(),
        }
    }

    pub fn value(value: impl Into<FieldValue>) -> Self {
        ControlInput::Value(value.into())
    }

    pub fn into_value(self) -> FieldValue {
        match self {
            ControlInput::ChangeEvent { target_value } => target_value,
            ControlInput::Value(value) => value,
        }
    }
}

// ============================================================================
// Field descriptor
// ============================================================================

/// Everything that defines one field. Cheap to clone; templates hand these out.
#[derive(Clone)]
pub struct FieldProps {
    name: FieldName,
    label: Option<String>,
    default_value: FieldValue,
    required: bool,
    validators: Vec<Arc<dyn Validator>>,
    effects: Vec<Effect>,
    serializer: Option<Serializer>,
    disabled: Flag,
    read_only: Flag,
    hide_condition: Option<Flag>,
    register_condition: Option<Condition>,
}

impl FieldProps {
    pub fn new(name: impl Into<FieldName>) -> Self {
        Self {
            name: name.into(),
            label: None,
            default_value: FieldValue::Absent,
            required: false,
            validators: Vec::new(),
            effects: Vec::new(),
            serializer: None,
            disabled: Flag::default(),
            read_only: Flag::default(),
            hide_condition: None,
            register_condition: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// The field's own default, used when the form supplies none.
    pub fn default_value(mut self, value: impl Into<FieldValue>) -> Self {
        self.default_value = value.into();
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Runs on a detached tokio task during submit.
    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validators.push(validator);
        self
    }

    /// Effects run on detached tokio tasks and see the latest snapshot when
    /// they start. Outside a tokio runtime they are skipped with a warning.
    pub fn effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn serializer(mut self, serializer: Serializer) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn disabled(mut self, disabled: impl Into<Flag>) -> Self {
        self.disabled = disabled.into();
        self
    }

    pub fn read_only(mut self, read_only: impl Into<Flag>) -> Self {
        self.read_only = read_only.into();
        self
    }

    /// Presentation only: a hidden field still registers and validates.
    pub fn hide_condition(mut self, hide: impl Into<Flag>) -> Self {
        self.hide_condition = Some(hide.into());
        self
    }

    pub fn register_condition<F>(mut self, f: F) -> Self
    where
        F: Fn(&ItemContext) -> bool + Send + Sync + 'static,
    {
        self.register_condition = Some(Arc::new(f));
        self
    }

    /// Validators to run on submit, the implicit required check first.
    fn submit_validators(&self) -> Vec<Arc<dyn Validator>> {
        let mut validators: Vec<Arc<dyn Validator>> = Vec::with_capacity(self.validators.len() + 1);
        if self.required {
            validators.push(Arc::new(RequiredValidator::default()));
        }
        validators.extend(self.validators.iter().cloned());
        validators
    }
}

impl fmt::Debug for FieldProps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldProps")
            .field("name", &self.name)
            .field("label", &self.label)
            .field("default_value", &self.default_value)
            .field("required", &self.required)
            .field("validators", &self.validators.len())
            .field("effects", &self.effects)
            .finish_non_exhaustive()
    }
}

/// External default wins unless it is null or absent.
fn resolve_default(external: Option<&FieldValue>, own: &FieldValue) -> FieldValue {
    match external {
        Some(value) if !value.is_nullish() => value.clone(),
        _ => own.clone(),
    }
}

// ============================================================================
// Controller
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPhase {
    Uninitialized,
    DefaultResolved,
    Registered,
    Unregistered,
}

/// Presentation state of a field, ready for a renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldView {
    pub name: FieldName,
    pub label: Option<String>,
    pub registered: bool,
    pub hidden: bool,
    pub disabled: bool,
    pub read_only: bool,
    pub required: bool,
    /// Stored value after the incoming transform.
    pub value: FieldValue,
    pub error_messages: Vec<String>,
    pub component_props: Vec<serde_json::Value>,
}

struct FieldState {
    phase: FieldPhase,
    // None until resolved; the resolved default may itself be Absent.
    default_value: Option<FieldValue>,
}

struct FieldInner {
    props: FieldProps,
    form: FormHandle,
    state: Mutex<FieldState>,
}

impl FieldInner {
    fn name(&self) -> &str {
        &self.props.name
    }

    fn resolve_default(&self) {
        let external = self.form.default_values().get(self.name());
        let value = resolve_default(external, &self.props.default_value);
        trace!(field = self.name(), default = ?value, "default resolved");

        let mut state = lock(&self.state);
        state.default_value = Some(value);
        state.phase = FieldPhase::DefaultResolved;
    }

    fn context(&self) -> ItemContext {
        let default_value = lock(&self.state).default_value.clone().unwrap_or_default();
        ItemContext {
            component_props: self.form.component_props(self.name()).map(<[_]>::to_vec),
            default_value,
            error_messages: self.form.error_messages(self.name()),
            form_value: self.form.values(),
        }
    }

    fn hidden(&self, context: &ItemContext) -> bool {
        self.props
            .hide_condition
            .as_ref()
            .is_some_and(|flag| flag.evaluate(context))
    }

    /// Re-evaluate registration against the current context.
    fn refresh(&self) {
        let Some(default_value) = lock(&self.state).default_value.clone() else {
            return;
        };
        let context = self.context();
        let register = self
            .props
            .register_condition
            .as_ref()
            .map_or(true, |condition| condition(&context));
        lock(&self.state).phase = if register {
            FieldPhase::Registered
        } else {
            FieldPhase::Unregistered
        };

        let present = context.form_value.contains(self.name());
        if register && !present {
            debug!(field = self.name(), "requesting registration");
            self.form.channel().publish(FormEvent::RegisterItem {
                name: self.props.name.clone(),
                default_value,
            });
        } else if !register && present {
            debug!(field = self.name(), "requesting unregistration");
            self.form.channel().publish(FormEvent::UnregisterItem {
                name: self.props.name.clone(),
            });
        }
    }

    fn on_change(self: &Arc<Self>, event: &FormEvent) {
        let FormEvent::Change { value, changed } = event else {
            return;
        };
        self.refresh();

        if self.props.effects.is_empty() || !value.contains(self.name()) {
            return;
        }
        let inner = Arc::clone(self);
        let changed = changed.to_vec();
        spawn_detached("effects", async move {
            // Latest snapshot, not the one carried by the triggering change.
            let value = inner.form.values();
            let helpers = EffectHelpers::new(inner.props.name.clone(), inner.form.channel().clone());
            if let Err(err) =
                run_effects(inner.name(), &inner.props.effects, &value, &changed, &helpers).await
            {
                warn!(field = inner.name(), error = %err, "effect failed");
            }
        });
    }

    fn on_errors_changed(self: &Arc<Self>, event: &FormEvent) {
        if let FormEvent::ErrorsChanged { .. } = event {
            self.refresh();
        }
    }

    fn on_submit_request(self: &Arc<Self>, event: &FormEvent) {
        let FormEvent::SubmitRequest { correlation_id } = event else {
            return;
        };
        let correlation_id = *correlation_id;
        let validators = self.props.submit_validators();
        let snapshot = self.form.values();
        let inner = Arc::clone(self);

        spawn_detached("validation", async move {
            let value = snapshot.value_of(inner.name());
            let messages = run_validators(&validators, &value, &snapshot).await;
            trace!(field = inner.name(), %correlation_id, errors = messages.len(), "validated");
            inner.form.channel().publish(FormEvent::SubmitResponse {
                correlation_id,
                name: inner.props.name.clone(),
                messages,
            });
        });
    }

    fn on_default_request(self: &Arc<Self>, event: &FormEvent) {
        let FormEvent::DefaultValueRequest {
            correlation_id,
            name,
        } = event
        else {
            return;
        };
        if name != self.name() {
            return;
        }
        // Answering before resolution would leak the uninitialized state.
        let Some(default_value) = lock(&self.state).default_value.clone() else {
            return;
        };
        self.form.channel().publish(FormEvent::DefaultValueResponse {
            correlation_id: *correlation_id,
            default_value,
        });
    }
}

/// A mounted field.
pub struct FieldController {
    inner: Arc<FieldInner>,
    _subscriptions: Vec<Subscription>,
}

impl FieldController {
    /// Mount `props` into the form behind `form`.
    pub fn mount(form: &FormHandle, props: FieldProps) -> Self {
        let inner = Arc::new(FieldInner {
            props,
            form: form.clone(),
            state: Mutex::new(FieldState {
                phase: FieldPhase::Uninitialized,
                default_value: None,
            }),
        });

        let channel = form.channel();
        let subscriptions = vec![
            channel.subscribe_weak(&inner, EventKind::SubmitRequest, FieldInner::on_submit_request),
            channel.subscribe_weak(&inner, EventKind::Change, FieldInner::on_change),
            channel.subscribe_weak(&inner, EventKind::ErrorsChanged, FieldInner::on_errors_changed),
            channel.subscribe_weak(&inner, EventKind::DefaultValueRequest, FieldInner::on_default_request),
        ];

        inner.resolve_default();
        inner.refresh();

        Self {
            inner,
            _subscriptions: subscriptions,
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn props(&self) -> &FieldProps {
        &self.inner.props
    }

    pub fn phase(&self) -> FieldPhase {
        lock(&self.inner.state).phase
    }

    /// `None` until the default has been resolved.
    pub fn default_value(&self) -> Option<FieldValue> {
        lock(&self.inner.state).default_value.clone()
    }

    pub fn context(&self) -> ItemContext {
        self.inner.context()
    }

    /// Re-evaluate the register condition now.
    pub fn refresh(&self) {
        self.inner.refresh();
    }

    pub fn is_registered(&self) -> bool {
        self.inner.form.is_registered(self.name())
    }

    /// Evaluated against the current values and error messages.
    pub fn is_hidden(&self) -> bool {
        self.inner.hidden(&self.context())
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.form.is_disabled() || self.inner.props.disabled.evaluate(&self.context())
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.form.is_read_only() || self.inner.props.read_only.evaluate(&self.context())
    }

    /// Stored value as the control should display it.
    pub fn control_value(&self) -> FieldValue {
        let stored = self.inner.form.values().value_of(self.name());
        match &self.inner.props.serializer {
            Some(serializer) => serializer.to_control(&stored),
            None => stored,
        }
    }

    /// Feed a control's change back into the form.
    pub fn on_control_change(&self, input: ControlInput) {
        let raw = input.into_value();
        let stored = match &self.inner.props.serializer {
            Some(serializer) => serializer.to_stored(&raw),
            None => raw,
        };
        let mut values = FormValue::new();
        values.insert(self.inner.props.name.clone(), stored);
        self.inner.form.channel().publish(FormEvent::SetValues { values });
    }

    /// Call `render` with the item context, or `None` while unregistered.
    pub fn render<R>(&self, render: impl FnOnce(&ItemContext) -> R) -> Option<R> {
        let context = self.context();
        context
            .form_value
            .contains(self.name())
            .then(|| render(&context))
    }

    pub fn view(&self) -> FieldView {
        let context = self.context();
        let props = &self.inner.props;
        FieldView {
            name: props.name.clone(),
            label: props.label.clone(),
            registered: context.form_value.contains(&props.name),
            hidden: self.inner.hidden(&context),
            disabled: self.inner.form.is_disabled() || props.disabled.evaluate(&context),
            read_only: self.inner.form.is_read_only() || props.read_only.evaluate(&context),
            required: props.required,
            value: self.control_value(),
            error_messages: context.error_messages.clone().unwrap_or_default(),
            component_props: context.component_props.clone().unwrap_or_default(),
        }
    }

    /// Release every subscription. Equivalent to dropping the controller.
    pub fn unmount(self) {}
}

impl fmt::Debug for FieldController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldController")
            .field("name", &self.name())
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FormBuilder;
    use crate::form_values;
    use serde_json::json;

    #[test]
    fn test_default_precedence() {
        let own = FieldValue::from("own");
        assert_eq!(resolve_default(Some(&FieldValue::from("ext")), &own), FieldValue::from("ext"));
        assert_eq!(resolve_default(Some(&FieldValue::from(json!(null))), &own), own);
        assert_eq!(resolve_default(None, &own), own);
        assert_eq!(resolve_default(None, &FieldValue::Absent), FieldValue::Absent);
        // Falsy-but-present external defaults still win
        assert_eq!(resolve_default(Some(&FieldValue::from(0)), &own), FieldValue::from(0));
    }

    #[test]
    fn test_mount_registers_with_resolved_default() {
        let form = FormBuilder::new().default_value("email", "a@b.c").build();
        let email = form.mount_field(FieldProps::new("email").default_value("own"));
        let age = form.mount_field(FieldProps::new("age").default_value(18));
        let note = form.mount_field(FieldProps::new("note"));

        assert_eq!(email.phase(), FieldPhase::Registered);
        assert_eq!(email.default_value(), Some(FieldValue::from("a@b.c")));
        assert_eq!(
            form.get_values(),
            form_values! { "email" => "a@b.c", "age" => 18, "note" => FieldValue::Absent }
        );
        assert!(age.is_registered() && note.is_registered());
    }

    #[test]
    fn test_register_condition_follows_form_value() {
        let form = FormBuilder::new().build();
        let _kind = form.mount_field(FieldProps::new("kind").default_value("person"));
        let company = form.mount_field(
            FieldProps::new("company").register_condition(|ctx| {
                ctx.form_value.value_of("kind") == FieldValue::from("business")
            }),
        );

        assert_eq!(company.phase(), FieldPhase::Unregistered);
        assert!(!form.is_registered("company"));
        assert_eq!(company.render(|_| ()), None);

        form.set_value("kind", "business");
        assert_eq!(company.phase(), FieldPhase::Registered);
        assert!(form.is_registered("company"));

        form.set_value("kind", "person");
        assert_eq!(company.phase(), FieldPhase::Unregistered);
        assert!(!form.is_registered("company"));
    }

    #[test]
    fn test_hide_condition_is_presentation_only() {
        let form = FormBuilder::new().build();
        let secret = form.mount_field(
            FieldProps::new("secret")
                .default_value("x")
                .hide_condition(Flag::when(|ctx| ctx.form_value.value_of("show") != FieldValue::from(true))),
        );
        let always = form.mount_field(FieldProps::new("always").hide_condition(true));
        let plain = form.mount_field(FieldProps::new("plain"));

        assert!(secret.is_hidden());
        assert!(secret.is_registered());
        assert!(always.is_hidden());
        assert!(!plain.is_hidden());

        form.set_value("show", true);
        assert!(!secret.is_hidden());
    }

    #[tokio::test]
    async fn test_hide_condition_sees_errors_from_submit() {
        let form = FormBuilder::new().build();
        // Shown only once something is wrong with it
        let email = form.mount_field(
            FieldProps::new("email")
                .required(true)
                .hide_condition(Flag::when(|ctx| ctx.error_messages.is_none())),
        );
        assert!(email.is_hidden());

        let outcome = form.submit().await;
        assert!(outcome.errors.is_some());
        assert!(!email.is_hidden());
        let view = email.view();
        assert!(!view.hidden);
        assert_eq!(view.error_messages, vec!["It is a required field".to_string()]);

        // Writing the value purges the error and hides it again
        form.set_value("email", "a@b.c");
        assert!(email.is_hidden());
    }

    #[tokio::test]
    async fn test_submit_reevaluates_register_conditions() {
        let evaluations = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = evaluations.clone();
        let form = FormBuilder::new().build();
        let _name = form.mount_field(FieldProps::new("name").required(true));
        let hint = form.mount_field(FieldProps::new("hint").register_condition(move |ctx| {
            seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            ctx.form_value.value_of("name").is_absent()
        }));
        let before = evaluations.load(std::sync::atomic::Ordering::SeqCst);

        form.submit().await;

        assert!(evaluations.load(std::sync::atomic::Ordering::SeqCst) > before);
        assert_eq!(hint.phase(), FieldPhase::Registered);
    }

    #[test]
    fn test_serializer_round_trip_and_storage() {
        let form = FormBuilder::new().build();
        // Stored as cents, shown as a decimal string
        let serializer = Serializer::new()
            .outgoing(|control| {
                let cents = control
                    .as_json()
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<f64>().ok())
                    .map(|amount| (amount * 100.0).round() as i64);
                FieldValue::from(cents.map(serde_json::Value::from))
            })
            .incoming(|stored| match stored.as_json().and_then(|v| v.as_i64()) {
                Some(cents) => FieldValue::from(format!("{:.2}", cents as f64 / 100.0)),
                None => FieldValue::Absent,
            });
        let price = form.mount_field(FieldProps::new("price").serializer(serializer.clone()));

        for shown in ["12.50", "0.99", "100.00"] {
            let x = FieldValue::from(shown);
            assert_eq!(serializer.to_control(&serializer.to_stored(&x)), x);
        }

        price.on_control_change(ControlInput::value("12.50"));
        assert_eq!(form.get_value("price"), Some(FieldValue::from(1250)));
        assert_eq!(price.control_value(), FieldValue::from("12.50"));
    }

    #[test]
    fn test_change_event_payload_is_unwrapped() {
        let form = FormBuilder::new().build();
        let name = form.mount_field(FieldProps::new("name"));

        name.on_control_change(ControlInput::change_event("Ada"));
        assert_eq!(form.get_value("name"), Some(FieldValue::from("Ada")));

        name.on_control_change(ControlInput::value(json!({ "first": "Ada" })));
        assert_eq!(form.get_value("name"), Some(FieldValue::from(json!({ "first": "Ada" }))));
    }

    #[test]
    fn test_flags_combine_with_form_flags() {
        let form = FormBuilder::new()
            .read_only(true)
            .component_props("qty", vec![json!({ "min": 1 })])
            .build();
        let qty = form.mount_field(
            FieldProps::new("qty")
                .label("Quantity")
                .default_value(1)
                .disabled(Flag::when(|ctx| ctx.default_value == FieldValue::from(1))),
        );

        let view = qty.view();
        assert!(view.registered);
        assert!(view.disabled);
        assert!(view.read_only);
        assert_eq!(view.label.as_deref(), Some("Quantity"));
        assert_eq!(view.component_props, vec![json!({ "min": 1 })]);
        assert_eq!(view.value, FieldValue::from(1));
    }

    #[test]
    fn test_effects_are_skipped_without_a_runtime() {
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = ran.clone();
        let form = FormBuilder::new().build();
        let _b = form.mount_field(FieldProps::new("b").effect(Effect::from_fn(["a"], move |_, _| {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            async { Ok(()) }
        })));

        form.set_value("a", 1);

        assert_eq!(form.get_value("a"), Some(FieldValue::from(1)));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_unmount_stops_answering() {
        let form = FormBuilder::new().build();
        let field = form.mount_field(FieldProps::new("a"));
        assert_eq!(form.channel().subscriber_count(EventKind::SubmitRequest), 1);

        field.unmount();
        assert_eq!(form.channel().subscriber_count(EventKind::SubmitRequest), 0);
        // Registration is form state and survives the controller
        assert!(form.is_registered("a"));
    }
}
