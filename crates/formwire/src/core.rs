//! Core data model: field names, values, snapshots and correlation ids.
//!
//! Snapshots are immutable. Every write produces a new snapshot that shares
//! nothing mutable with the previous one, so an observer holding a snapshot
//! never sees it change underneath it.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::SmallVec;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use uuid::Uuid;

/// Name of a field. Empty names are invalid and ignored by every operation.
pub type FieldName = String;

/// Names that changed in one snapshot revision.
pub type ChangedFields = SmallVec<[FieldName; 4]>;

/// Plain, owned value map exported to callers, in registration order.
///
/// Serializes as a JSON object of the present entries only, the same shape
/// as [`ValueSnapshot::to_json`]. An absent entry therefore does not survive
/// an export: re-importing leaves that name untouched rather than turning the
/// absent-marker into an explicit `null`.
#[derive(Clone, Default, PartialEq)]
pub struct FormValue(IndexMap<FieldName, FieldValue>);

impl FormValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> IndexMap<FieldName, FieldValue> {
        self.0
    }
}

impl Deref for FormValue {
    type Target = IndexMap<FieldName, FieldValue>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for FormValue {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl fmt::Debug for FormValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.0.iter()).finish()
    }
}

impl From<IndexMap<FieldName, FieldValue>> for FormValue {
    fn from(map: IndexMap<FieldName, FieldValue>) -> Self {
        Self(map)
    }
}

impl FromIterator<(FieldName, FieldValue)> for FormValue {
    fn from_iter<I: IntoIterator<Item = (FieldName, FieldValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<(FieldName, FieldValue)> for FormValue {
    fn extend<I: IntoIterator<Item = (FieldName, FieldValue)>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl IntoIterator for FormValue {
    type Item = (FieldName, FieldValue);
    type IntoIter = indexmap::map::IntoIter<FieldName, FieldValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a FormValue {
    type Item = (&'a FieldName, &'a FieldValue);
    type IntoIter = indexmap::map::Iter<'a, FieldName, FieldValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Serialize for FormValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let present = self.0.iter().filter(|(_, value)| !value.is_absent());
        serializer.collect_map(present)
    }
}

impl<'de> Deserialize<'de> for FormValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        IndexMap::deserialize(deserializer).map(Self)
    }
}

/// Plain, owned error map: field name to a non-empty list of messages.
pub type ErrorMap = IndexMap<FieldName, Vec<String>>;

pub(crate) fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
}

/// Drop empty names and duplicates, keeping first-seen order.
pub(crate) fn normalize_names<I, S>(names: I) -> Vec<FieldName>
where
    I: IntoIterator<Item = S>,
    S: Into<FieldName>,
{
    let mut out: Vec<FieldName> = Vec::new();
    for name in names {
        let name = name.into();
        if is_valid_name(&name) && !out.contains(&name) {
            out.push(name);
        }
    }
    out
}

// ============================================================================
// Field values
// ============================================================================

/// Value held by a registered field.
///
/// `Absent` is the absent-marker: the field is registered but currently has
/// no value. It is distinct from `Present(Value::Null)` and from the field not
/// being registered at all (no key in the snapshot).
#[derive(Debug, Clone, Default, PartialEq)]
pub enum FieldValue {
    #[default]
    Absent,
    Present(serde_json::Value),
}

impl FieldValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, FieldValue::Absent)
    }

    /// Absent or an explicit JSON null.
    pub fn is_nullish(&self) -> bool {
        matches!(
            self,
            FieldValue::Absent | FieldValue::Present(serde_json::Value::Null)
        )
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            FieldValue::Absent => None,
            FieldValue::Present(value) => Some(value),
        }
    }

    pub fn into_json(self) -> Option<serde_json::Value> {
        match self {
            FieldValue::Absent => None,
            FieldValue::Present(value) => Some(value),
        }
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(value: serde_json::Value) -> Self {
        FieldValue::Present(value)
    }
}

impl From<Option<serde_json::Value>> for FieldValue {
    fn from(value: Option<serde_json::Value>) -> Self {
        value.map_or(FieldValue::Absent, FieldValue::Present)
    }
}

macro_rules! field_value_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for FieldValue {
                fn from(value: $ty) -> Self {
                    FieldValue::Present(serde_json::Value::from(value))
                }
            }
        )*
    };
}

field_value_from!(&str, String, bool, i32, i64, u32, u64, f64);

// A lone absent value serializes as null, as an undefined array element
// would. `FormValue` and `ValueSnapshot::to_json` drop absent entries instead.
impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Absent => serializer.serialize_none(),
            FieldValue::Present(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(FieldValue::Present)
    }
}

// ============================================================================
// Correlation ids
// ============================================================================

/// Per-call token matching a response to its request on the shared channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// Value snapshot
// ============================================================================

/// Immutable, versioned map from field name to value.
///
/// A name is registered iff it is a key here, whatever its value.
/// Cloning is cheap; the map is shared behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct ValueSnapshot {
    version: u64,
    values: Arc<FormValue>,
}

impl ValueSnapshot {
    /// Revision counter, bumped by one on every replacement.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// `None` means the name is not registered.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.values.get(name)
    }

    /// Current value of `name`, `Absent` when unregistered.
    pub fn value_of(&self, name: &str) -> FieldValue {
        self.values.get(name).cloned().unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<FieldName> {
        self.values.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldName, &FieldValue)> {
        self.values.iter()
    }

    /// Plain copy for handing out of the store.
    pub fn to_plain(&self) -> FormValue {
        (*self.values).clone()
    }

    /// JSON object of present values. Absent entries are omitted.
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .values
            .iter()
            .filter_map(|(name, value)| value.as_json().map(|v| (name.clone(), v.clone())))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }

    /// New revision with `updates` merged over this one.
    pub(crate) fn merge<I>(&self, updates: I) -> Self
    where
        I: IntoIterator<Item = (FieldName, FieldValue)>,
    {
        let mut values = (*self.values).clone();
        for (name, value) in updates {
            values.insert(name, value);
        }
        Self {
            version: self.version + 1,
            values: Arc::new(values),
        }
    }

    /// New revision without `name`.
    pub(crate) fn remove(&self, name: &str) -> Self {
        let mut values = (*self.values).clone();
        values.shift_remove(name);
        Self {
            version: self.version + 1,
            values: Arc::new(values),
        }
    }
}

// Versions are bookkeeping; two snapshots are equal when their maps are.
impl PartialEq for ValueSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl From<FormValue> for ValueSnapshot {
    fn from(values: FormValue) -> Self {
        Self {
            version: 0,
            values: Arc::new(values),
        }
    }
}

// ============================================================================
// Error snapshot
// ============================================================================

/// Immutable map from field name to its last known validation messages.
///
/// A missing key means "no known errors", which is not the same as valid:
/// a field that was never validated has no key either.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorSnapshot {
    errors: Arc<ErrorMap>,
}

impl ErrorSnapshot {
    /// Build from a map, dropping names with no messages.
    pub fn from_map(map: ErrorMap) -> Self {
        let errors = map
            .into_iter()
            .filter(|(_, messages)| !messages.is_empty())
            .collect();
        Self {
            errors: Arc::new(errors),
        }
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.errors.get(name).map(Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.errors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn to_map(&self) -> ErrorMap {
        (*self.errors).clone()
    }

    /// Drop entries for `names`. Stale errors must not outlive a value edit.
    pub(crate) fn purge(&self, names: &[FieldName]) -> Self {
        if !names.iter().any(|name| self.errors.contains_key(name)) {
            return self.clone();
        }
        let mut errors = (*self.errors).clone();
        for name in names {
            errors.shift_remove(name);
        }
        Self {
            errors: Arc::new(errors),
        }
    }
}

// ============================================================================
// Submit outcome & item context
// ============================================================================

/// Result of a submit round: exactly one side is populated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<FormValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<ErrorMap>,
}

impl SubmitOutcome {
    pub(crate) fn valid(value: FormValue) -> Self {
        Self {
            value: Some(value),
            errors: None,
        }
    }

    pub(crate) fn invalid(errors: ErrorMap) -> Self {
        Self {
            value: None,
            errors: Some(errors),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_none()
    }

    pub fn into_result(self) -> Result<FormValue, ErrorMap> {
        match (self.value, self.errors) {
            (_, Some(errors)) => Err(errors),
            (value, None) => Ok(value.unwrap_or_default()),
        }
    }
}

/// Everything a field's conditions and renderer may look at.
#[derive(Debug, Clone, Default)]
pub struct ItemContext {
    pub component_props: Option<Vec<serde_json::Value>>,
    pub default_value: FieldValue,
    pub error_messages: Option<Vec<String>>,
    pub form_value: ValueSnapshot,
}
