//! Field validators.
//!
//! A validator looks at the field's own value and the whole value snapshot
//! and returns at most one message. `None` and the empty string both mean
//! "no error".

use crate::core::{FieldValue, ValueSnapshot};
use async_trait::async_trait;
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;

/// Message reported by the implicit validator of a required field.
pub const REQUIRED_MESSAGE: &str = "It is a required field";

#[async_trait]
pub trait Validator: Send + Sync + 'static {
    async fn validate(&self, value: &FieldValue, form: &ValueSnapshot) -> Option<String>;
}

/// Adapter for synchronous closures.
pub struct FnValidator<F>(F);

#[async_trait]
impl<F> Validator for FnValidator<F>
where
    F: Fn(&FieldValue, &ValueSnapshot) -> Option<String> + Send + Sync + 'static,
{
    async fn validate(&self, value: &FieldValue, form: &ValueSnapshot) -> Option<String> {
        (self.0)(value, form)
    }
}

/// Adapter for closures returning a future.
pub struct AsyncFnValidator<F>(F);

#[async_trait]
impl<F, Fut> Validator for AsyncFnValidator<F>
where
    F: Fn(FieldValue, ValueSnapshot) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<String>> + Send + 'static,
{
    async fn validate(&self, value: &FieldValue, form: &ValueSnapshot) -> Option<String> {
        (self.0)(value.clone(), form.clone()).await
    }
}

pub fn validator_fn<F>(f: F) -> Arc<dyn Validator>
where
    F: Fn(&FieldValue, &ValueSnapshot) -> Option<String> + Send + Sync + 'static,
{
    Arc::new(FnValidator(f))
}

pub fn async_validator_fn<F, Fut>(f: F) -> Arc<dyn Validator>
where
    F: Fn(FieldValue, ValueSnapshot) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<String>> + Send + 'static,
{
    Arc::new(AsyncFnValidator(f))
}

/// Rejects the absent-marker only. Null, empty strings and zero pass.
#[derive(Debug, Clone)]
pub struct RequiredValidator {
    message: String,
}

impl RequiredValidator {
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Default for RequiredValidator {
    fn default() -> Self {
        Self::with_message(REQUIRED_MESSAGE)
    }
}

#[async_trait]
impl Validator for RequiredValidator {
    async fn validate(&self, value: &FieldValue, _form: &ValueSnapshot) -> Option<String> {
        value.is_absent().then(|| self.message.clone())
    }
}

/// Run every validator concurrently and keep the non-empty messages in
/// declaration order.
pub(crate) async fn run_validators(
    validators: &[Arc<dyn Validator>],
    value: &FieldValue,
    form: &ValueSnapshot,
) -> Vec<String> {
    join_all(validators.iter().map(|validator| validator.validate(value, form)))
        .await
        .into_iter()
        .flatten()
        .filter(|message| !message.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_required_rejects_absent_only() {
        let required = RequiredValidator::default();
        let form = ValueSnapshot::default();

        assert_eq!(
            required.validate(&FieldValue::Absent, &form).await.as_deref(),
            Some(REQUIRED_MESSAGE)
        );
        for value in [json!(null), json!(""), json!(0), json!(false)] {
            assert_eq!(required.validate(&FieldValue::from(value), &form).await, None);
        }
    }

    #[tokio::test]
    async fn test_run_validators_keeps_order_and_drops_empty() {
        let validators = vec![
            async_validator_fn(|_, _| async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Some("slow".to_string())
            }),
            validator_fn(|_, _| Some(String::new())),
            validator_fn(|_, _| None),
            validator_fn(|value, _| {
                (value.as_json() != Some(&json!("ok"))).then(|| "fast".to_string())
            }),
        ];

        let messages =
            run_validators(&validators, &FieldValue::from("nope"), &ValueSnapshot::default()).await;
        assert_eq!(messages, vec!["slow".to_string(), "fast".to_string()]);
    }

    #[tokio::test]
    async fn test_validator_sees_whole_form() {
        let form = ValueSnapshot::default().merge([
            ("password".to_string(), FieldValue::from("hunter2")),
            ("confirm".to_string(), FieldValue::from("hunter3")),
        ]);
        let matches = validator_fn(|value, form| {
            (value != &form.value_of("password")).then(|| "Passwords differ".to_string())
        });

        let messages = run_validators(&[matches], &form.value_of("confirm"), &form).await;
        assert_eq!(messages, vec!["Passwords differ".to_string()]);
    }
}
