//! # Signup Form Demo
//!
//! A headless signup form driven the way a UI would drive it: controls
//! push changes, conditions show and hide fields, an effect keeps a
//! dependent field in sync, and submit collects async validation.
//!
//! Run with `RUST_LOG=formwire_core=debug` to watch the channel traffic.

use anyhow::Result;
use formwire_core::{
    async_validator_fn, validator_fn, ControlInput, Effect, FieldProps, FieldValue, Flag,
    FormController, Serializer, TemplateRegistry, DEFAULT_REQUEST_TIMEOUT,
};
use serde_json::json;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Field definitions
// ============================================================================

const TAKEN_EMAILS: [&str; 2] = ["ada@example.com", "grace@example.com"];

fn account_fields() -> Vec<FieldProps> {
    vec![
        FieldProps::new("email")
            .label("Email")
            .required(true)
            .serializer(Serializer::new().outgoing(|control| {
                match control.as_json().and_then(|v| v.as_str()) {
                    Some(text) => FieldValue::from(text.trim().to_lowercase()),
                    None => control.clone(),
                }
            }))
            .validator(async_validator_fn(|value, _| async move {
                // Stand-in for a uniqueness lookup
                tokio::time::sleep(Duration::from_millis(20)).await;
                let email = value.as_json().and_then(|v| v.as_str()).unwrap_or_default().to_lowercase();
                TAKEN_EMAILS
                    .contains(&email.as_str())
                    .then(|| format!("{email} is already registered"))
            })),
        FieldProps::new("password").label("Password").required(true).validator(
            validator_fn(|value, _| {
                let len = value.as_json().and_then(|v| v.as_str()).map_or(0, str::len);
                (len < 8).then(|| "Use at least 8 characters".to_string())
            }),
        ),
        FieldProps::new("confirm").label("Confirm password").validator(validator_fn(
            |value, form| (value != &form.value_of("password")).then(|| "Passwords differ".to_string()),
        )),
    ]
}

fn plan_fields() -> Vec<FieldProps> {
    vec![
        FieldProps::new("plan").label("Plan").default_value("free"),
        FieldProps::new("seats")
            .label("Seats")
            .default_value(5)
            .register_condition(|ctx| ctx.form_value.value_of("plan") == FieldValue::from("team"))
            .effect(Effect::from_fn(["plan"], |_, helpers| async move {
                helpers.reset();
                Ok(())
            })),
        FieldProps::new("coupon")
            .label("Coupon")
            .hide_condition(Flag::when(|ctx| ctx.form_value.value_of("plan") == FieldValue::from("free"))),
    ]
}

fn templates() -> TemplateRegistry {
    let templates = TemplateRegistry::new();
    templates
        .register("account", |_| account_fields())
        .register("plan", |_| plan_fields())
        .register("signup", |helpers| {
            let mut fields = helpers.get_partial_template("account", &[]);
            fields.extend(helpers.get_partial_template("plan", &["plan", "seats", "coupon"]));
            fields
        });
    templates
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let form = FormController::builder()
        .default_value("email", "Ada@Example.com")
        .component_props("seats", vec![json!({ "min": 1, "max": 50 })])
        .templates(templates())
        .on_change(|_, changed| info!(?changed, "form changed"))
        .on_instance(|handle| info!(?handle, "form ready"))
        .build();

    let fields = form.mount_fields(form.template("signup", &[]));
    let field = |name: &str| fields.iter().find(|f| f.name() == name);

    println!("Initial values: {}", form.values().to_json());

    // First attempt: taken email, no password
    let outcome = form.submit_timeout(DEFAULT_REQUEST_TIMEOUT).await?;
    println!("First submit errors: {}", serde_json::to_string_pretty(&outcome)?);

    // The user fixes things through the controls
    if let Some(email) = field("email") {
        email.on_control_change(ControlInput::change_event("  Linus@Example.com "));
    }
    if let Some(password) = field("password") {
        password.on_control_change(ControlInput::value("correct horse"));
    }
    if let Some(confirm) = field("confirm") {
        confirm.on_control_change(ControlInput::value("correct horse"));
    }
    if let Some(plan) = field("plan") {
        plan.on_control_change(ControlInput::value("team"));
    }
    // Let the seats effect settle
    tokio::time::sleep(Duration::from_millis(10)).await;

    for field in &fields {
        let view = field.view();
        println!(
            "{:<10} registered={:<5} hidden={:<5} value={}",
            view.name,
            view.registered,
            view.hidden,
            serde_json::to_string(&view.value)?
        );
    }

    let outcome = form.submit_timeout(DEFAULT_REQUEST_TIMEOUT).await?;
    match outcome.into_result() {
        Ok(value) => println!("Submitted: {}", serde_json::to_string_pretty(&value)?),
        Err(errors) => println!("Still invalid: {errors:?}"),
    }

    Ok(())
}
