//! Macros for building value maps.

/// Build a [`FormValue`](crate::FormValue) from `name => value` pairs.
///
/// Values go through `FieldValue::from`, so plain literals, JSON values and
/// `FieldValue::Absent` all work. Insertion order is kept.
///
/// # Example
///
/// ```ignore
/// use formwire_core::{form_values, FieldValue};
///
/// form.set_values(form_values! {
///     "name" => "Ada",
///     "age" => 36,
///     "nickname" => FieldValue::Absent,
/// });
/// ```
#[macro_export]
macro_rules! form_values {
    () => {
        $crate::FormValue::new()
    };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut values = $crate::FormValue::new();
        $(
            values.insert(::std::string::String::from($name), $crate::FieldValue::from($value));
        )+
        values
    }};
}
