//! Reusable field groups addressed by id.
//!
//! A template function returns field descriptors. It receives
//! [`TemplateHelpers`] so it can splice in (parts of) other templates.

use crate::field::FieldProps;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

pub type TemplateFn = Arc<dyn Fn(&TemplateHelpers<'_>) -> Vec<FieldProps> + Send + Sync>;

/// View of the registry handed to a running template.
pub struct TemplateHelpers<'a> {
    registry: &'a TemplateRegistry,
}

impl TemplateHelpers<'_> {
    pub fn get_partial_template(&self, id: &str, names: &[&str]) -> Vec<FieldProps> {
        self.registry.get_partial_template(id, names)
    }
}

/// Template table owned by one form builder. Clones share the table.
#[derive(Clone, Default)]
pub struct TemplateRegistry {
    templates: Arc<DashMap<String, TemplateFn>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the template `id`. Empty ids are ignored.
    pub fn register<F>(&self, id: impl Into<String>, template: F) -> &Self
    where
        F: Fn(&TemplateHelpers<'_>) -> Vec<FieldProps> + Send + Sync + 'static,
    {
        let id = id.into();
        if !id.is_empty() {
            self.templates.insert(id, Arc::new(template));
        }
        self
    }

    pub fn contains(&self, id: &str) -> bool {
        self.templates.contains_key(id)
    }

    /// Items of template `id`.
    ///
    /// Unknown ids give an empty list. Empty `names` give every item;
    /// otherwise the named items in the requested order, unknown names
    /// skipped.
    pub fn get_partial_template(&self, id: &str, names: &[&str]) -> Vec<FieldProps> {
        // Clone out of the map so nested lookups never hold a shard lock.
        let Some(template) = self.templates.get(id).map(|entry| Arc::clone(entry.value())) else {
            trace!(template = id, "unknown template");
            return Vec::new();
        };
        let items = template(&TemplateHelpers { registry: self });

        if names.is_empty() {
            return items;
        }
        names
            .iter()
            .filter_map(|name| items.iter().find(|item| item.name() == *name).cloned())
            .collect()
    }
}

impl fmt::Debug for TemplateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<String> = self.templates.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        f.debug_struct("TemplateRegistry").field("ids", &ids).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[FieldProps]) -> Vec<&str> {
        items.iter().map(FieldProps::name).collect()
    }

    fn registry() -> TemplateRegistry {
        let registry = TemplateRegistry::new();
        registry
            .register("address", |_| {
                vec![
                    FieldProps::new("street"),
                    FieldProps::new("city").required(true),
                    FieldProps::new("zip"),
                ]
            })
            .register("contact", |helpers| {
                let mut items = vec![FieldProps::new("email").required(true)];
                items.extend(helpers.get_partial_template("address", &["city"]));
                items
            });
        registry
    }

    #[test]
    fn test_full_and_partial_lookup() {
        let registry = registry();

        assert_eq!(names(&registry.get_partial_template("address", &[])), ["street", "city", "zip"]);
        assert_eq!(
            names(&registry.get_partial_template("address", &["zip", "missing", "street"])),
            ["zip", "street"]
        );
        assert!(registry.get_partial_template("nope", &[]).is_empty());
    }

    #[test]
    fn test_templates_compose() {
        let registry = registry();
        assert_eq!(names(&registry.get_partial_template("contact", &[])), ["email", "city"]);
    }

    #[test]
    fn test_empty_id_is_ignored() {
        let registry = TemplateRegistry::new();
        registry.register("", |_| vec![FieldProps::new("a")]);
        assert!(!registry.contains(""));
        assert!(registry.get_partial_template("", &[]).is_empty());
    }
}
