//! Point-in-time views of a workflow's observed fields

use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Flat field name → value view of a workflow's state
pub type StateMap = BTreeMap<String, Value>;

/// Replacement for redacted field values
pub const REDACTED: &str = "***";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldPolicy {
    #[default]
    Visible,
    /// Key kept, value masked as [`REDACTED`]
    Redact,
    /// Left out of the snapshot entirely
    Hidden,
}

#[derive(Debug, Clone)]
pub struct ObservedField {
    pub name: String,
    pub value: Value,
    pub policy: FieldPolicy,
}

impl ObservedField {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            policy: FieldPolicy::Visible,
        }
    }

    pub fn redacted(mut self) -> Self {
        self.policy = FieldPolicy::Redact;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.policy = FieldPolicy::Hidden;
        self
    }
}

/// Implemented by the state type a workflow carries to declare which of its
/// fields are observed, and with which policy.
///
/// ```
/// use arborcore::{ObservedField, ObservedState};
///
/// struct Crawl {
///     url: String,
///     api_key: String,
/// }
///
/// impl ObservedState for Crawl {
///     fn observed_fields(&self) -> Vec<ObservedField> {
///         vec![
///             ObservedField::new("url", self.url.as_str()),
///             ObservedField::new("api_key", self.api_key.as_str()).redacted(),
///         ]
///     }
/// }
/// ```
pub trait ObservedState: Send + Sync {
    fn observed_fields(&self) -> Vec<ObservedField>;
}

/// Capture a snapshot of `source`, applying each field's policy.
///
/// A workflow without observed state yields an empty map.
pub fn capture_state(source: Option<&dyn ObservedState>) -> StateMap {
    let Some(source) = source else {
        return StateMap::new();
    };

    source
        .observed_fields()
        .into_iter()
        .filter_map(|field| match field.policy {
            FieldPolicy::Hidden => None,
            FieldPolicy::Redact => Some((field.name, Value::from(REDACTED))),
            FieldPolicy::Visible => Some((field.name, field.value)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Credentials {
        user: String,
        token: String,
        cache_dir: String,
    }

    impl ObservedState for Credentials {
        fn observed_fields(&self) -> Vec<ObservedField> {
            vec![
                ObservedField::new("user", self.user.as_str()),
                ObservedField::new("token", self.token.as_str()).redacted(),
                ObservedField::new("cache_dir", self.cache_dir.as_str()).hidden(),
            ]
        }
    }

    #[test]
    fn applies_field_policies() {
        let state = Credentials {
            user: "ada".into(),
            token: "sk-live-1234".into(),
            cache_dir: "/tmp/cache".into(),
        };

        let snapshot = capture_state(Some(&state));

        assert_eq!(snapshot.get("user"), Some(&Value::from("ada")));
        assert_eq!(snapshot.get("token"), Some(&Value::from(REDACTED)));
        assert!(!snapshot.contains_key("cache_dir"));
    }

    #[test]
    fn redaction_ignores_runtime_value() {
        struct Secret(Value);
        impl ObservedState for Secret {
            fn observed_fields(&self) -> Vec<ObservedField> {
                vec![ObservedField::new("secret", self.0.clone()).redacted()]
            }
        }

        for value in [Value::Null, Value::from(42i64), Value::from(vec![Value::from(true)])] {
            let snapshot = capture_state(Some(&Secret(value)));
            assert_eq!(snapshot["secret"], Value::from(REDACTED));
        }
    }

    #[test]
    fn no_state_is_empty() {
        assert!(capture_state(None).is_empty());
    }
}
