//! # Formwire
//!
//! Headless form-state orchestration: one form controller, many field
//! controllers, and a per-form event channel between them.
//!
//! ## Core Concepts
//!
//! Formwire separates **state** from **participants**:
//! - [`FormController`] = the single writer of the value and error snapshots
//! - [`FieldController`] = a participant that registers, validates and reacts
//!
//! The key principle: **fields never touch form state directly**. Every
//! write is a request published on the channel and applied by the form.
//!
//! ## Architecture
//!
//! ```text
//! Caller (UI / API)
//!     │
//!     ▼ set_values() / submit() / reset_values()
//! EventChannel ─────────────────────────────────────┐
//!     │                                             │
//!     ├─► FormController                            │
//!     │      ├─ apply write ─► ValueSnapshot vN+1   │
//!     │      ├─ purge errors, on_change callback    │
//!     │      ├─ publish Change ─────────────────────┤
//!     │      └─ submit settled ─► ErrorsChanged ────┤
//!     │                                             │
//!     └─► FieldController (one per field)           │
//!            ├─ Change / ErrorsChanged ─► register  │
//!            │            condition,                │
//!            │            effects ─► SetValues ─────┤
//!            ├─ SubmitRequest ─► validators         │
//!            │            └─► SubmitResponse ───────┤
//!            └─ DefaultValueRequest                 │
//!                         └─► DefaultValueResponse ─┘
//! ```
//!
//! ## Key Invariants
//!
//! 1. **A name is registered iff it is a key of the value snapshot**
//! 2. **Snapshots are immutable** - every write makes a new revision
//! 3. **Writes purge stale errors** for every changed name
//! 4. **Every submit request gets exactly one response per live field**
//! 5. **Responses never cross-resolve** - correlation ids scope each call
//! 6. **Changes arrive in version order** - writes made from a change
//!    handler are delivered after the change that caused them
//!
//! ## Example
//!
//! ```ignore
//! use formwire_core::{validator_fn, FieldProps, FormController};
//!
//! let form = FormController::builder()
//!     .default_value("email", "ada@example.com")
//!     .on_change(|value, changed| println!("{changed:?} -> {value:?}"))
//!     .build();
//!
//! let _email = form.mount_field(FieldProps::new("email").required(true));
//! let _age = form.mount_field(
//!     FieldProps::new("age").validator(validator_fn(|value, _| {
//!         value.as_json().and_then(|v| v.as_i64()).filter(|age| *age < 18)
//!             .map(|_| "Too young".to_string())
//!     })),
//! );
//!
//! match form.submit().await.into_result() {
//!     Ok(value) => println!("submitted {value:?}"),
//!     Err(errors) => println!("invalid {errors:?}"),
//! }
//! ```
//!
//! ## What This Is Not
//!
//! Formwire is **not**:
//! - A renderer or widget toolkit
//! - A schema validation library
//! - A persistence layer

// Core modules
mod bus;
mod command_macro;
mod core;
mod effect_impl;
mod engine;
mod error;
mod field;
mod request;
mod template;
mod validation;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;


// Re-export core types
pub use crate::core::{
    ChangedFields, CorrelationId, ErrorMap, ErrorSnapshot, FieldName, FieldValue, FormValue,
    ItemContext, SubmitOutcome, ValueSnapshot,
};

// Re-export request helpers (request/reply over the channel)
pub use request::{gather, request, with_timeout, DEFAULT_REQUEST_TIMEOUT};

// Re-export error types
pub use crate::error::FormError;

// Re-export bus types
pub use bus::{EventChannel, EventKind, FormEvent, Subscription, SubscriptionId};

// Re-export validation types
pub use validation::{
    async_validator_fn, validator_fn, AsyncFnValidator, FnValidator, RequiredValidator, Validator,
    REQUIRED_MESSAGE,
};

// Re-export effect types
pub use effect_impl::{Effect, EffectAction, EffectHelpers, FnEffect};

// Re-export field types
pub use field::{
    Condition, ControlInput, FieldController, FieldPhase, FieldProps, FieldView, Flag, Serializer,
    Transform,
};

// Re-export template types
pub use template::{TemplateFn, TemplateHelpers, TemplateRegistry};

// Re-export engine types (primary entry point)
pub use engine::{ChangeCallback, FormBuilder, FormController, FormHandle, InstanceCallback};

// Re-export commonly used external types
pub use async_trait::async_trait;
