//! Declarative field mapping.
//!
//! Defines how snapshot fields map to the remote wire form and how decoded
//! response fields map back. Every transform is a pure function of its
//! input; missing optional fields are elided, never sent as null or empty
//! string.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::snapshot::Snapshot;
use crate::types::SyncOperation;

/// A mapping from local snapshot fields to one integration's wire form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldMap {
    /// Individual field rules.
    pub rules: Vec<FieldRule>,
}

/// A single field mapping rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldRule {
    /// Field name in the remote payload.
    pub remote_field: String,

    /// Source of the value.
    pub source: FieldSource,

    /// Optional transformation to apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,

    /// Whether the remote will reject the payload if this field is absent.
    #[serde(default)]
    pub required: bool,

    /// Whether to include this rule in register payloads.
    #[serde(default = "default_true")]
    pub on_register: bool,

    /// Whether this field belongs to the synchronized subset sent on update.
    #[serde(default = "default_true")]
    pub on_update: bool,
}

fn default_true() -> bool {
    true
}

impl FieldRule {
    /// Create a rule mapping a snapshot field to a remote field.
    pub fn field(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            remote_field: remote.into(),
            source: FieldSource::Field { name: local.into() },
            transform: None,
            required: false,
            on_register: true,
            on_update: true,
        }
    }

    /// Create a rule emitting a constant.
    pub fn constant(remote: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            remote_field: remote.into(),
            source: FieldSource::Constant { value: value.into() },
            transform: None,
            required: false,
            on_register: true,
            on_update: true,
        }
    }

    /// Mark the rule as required.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Attach a transform.
    #[must_use]
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Exclude the rule from update payloads.
    #[must_use]
    pub fn register_only(mut self) -> Self {
        self.on_update = false;
        self
    }

    fn applies_to(&self, operation: SyncOperation) -> bool {
        match operation {
            SyncOperation::Update => self.on_update,
            _ => self.on_register,
        }
    }
}

/// Source of a remote field value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldSource {
    /// Value of a snapshot field.
    Field {
        /// Name of the field in the snapshot.
        name: String,
    },
    /// A constant value.
    Constant {
        /// The constant value.
        value: String,
    },
    /// Multiple sources concatenated.
    Concat {
        /// Sources to concatenate, each optionally transformed.
        parts: Vec<ConcatPart>,
        /// Separator between values.
        #[serde(default)]
        separator: String,
    },
}

/// One part of a concatenation source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcatPart {
    /// Name of the snapshot field.
    pub name: String,
    /// Transform applied to this part before joining.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
}

/// Pure transformation applied to a field value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transform {
    /// Convert to lowercase.
    Lowercase,
    /// Convert to uppercase.
    Uppercase,
    /// Trim whitespace.
    Trim,
    /// Replace occurrences.
    Replace {
        /// Pattern to find.
        from: String,
        /// Replacement value.
        to: String,
    },
    /// Left-pad a numeric rendering with zeros.
    ZeroPad {
        /// Minimum width.
        width: usize,
    },
    /// Substitute a default when the value renders empty.
    Default {
        /// Default value to use.
        value: String,
    },
    /// Chain multiple transforms in order.
    Chain {
        /// Ordered list of transforms to apply.
        transforms: Vec<Transform>,
    },
}

impl Transform {
    /// Apply the transform to a rendered value.
    #[must_use]
    pub fn apply(&self, input: &str) -> String {
        match self {
            Transform::Lowercase => input.to_lowercase(),
            Transform::Uppercase => input.to_uppercase(),
            Transform::Trim => input.trim().to_string(),
            Transform::Replace { from, to } => input.replace(from.as_str(), to),
            Transform::ZeroPad { width } => {
                if input.len() >= *width {
                    input.to_string()
                } else {
                    let mut padded = "0".repeat(width - input.len());
                    padded.push_str(input);
                    padded
                }
            }
            Transform::Default { value } => {
                if input.is_empty() {
                    value.clone()
                } else {
                    input.to_string()
                }
            }
            Transform::Chain { transforms } => transforms
                .iter()
                .fold(input.to_string(), |acc, t| t.apply(&acc)),
        }
    }
}

impl FieldMap {
    /// Create an empty field map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule using builder pattern.
    #[must_use]
    pub fn with(mut self, rule: FieldRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Remote fields the remote will reject as missing, for an operation.
    #[must_use]
    pub fn required_fields(&self, operation: SyncOperation) -> Vec<String> {
        self.rules
            .iter()
            .filter(|r| r.required && r.applies_to(operation))
            .map(|r| r.remote_field.clone())
            .collect()
    }

    /// Build the remote payload object from a snapshot.
    ///
    /// Returns the payload and the list of required remote fields that could
    /// not be produced. Optional fields without a source value are elided.
    #[must_use]
    pub fn build(&self, snapshot: &Snapshot, operation: SyncOperation) -> (Map<String, Value>, Vec<String>) {
        let mut payload = Map::new();
        let mut missing = Vec::new();

        for rule in self.rules.iter().filter(|r| r.applies_to(operation)) {
            match self.resolve(rule, snapshot) {
                Some(value) => {
                    payload.insert(rule.remote_field.clone(), value);
                }
                None => {
                    if rule.required {
                        missing.push(rule.remote_field.clone());
                    }
                }
            }
        }

        (payload, missing)
    }

    fn resolve(&self, rule: &FieldRule, snapshot: &Snapshot) -> Option<Value> {
        let value = match &rule.source {
            FieldSource::Field { name } => {
                let field = snapshot.get(name)?;
                match &rule.transform {
                    Some(t) => {
                        let rendered = t.apply(&field.render());
                        if rendered.is_empty() {
                            return None;
                        }
                        Value::String(rendered)
                    }
                    // Untransformed values keep their JSON type.
                    None => field.to_json(),
                }
            }
            FieldSource::Constant { value } => {
                let rendered = match &rule.transform {
                    Some(t) => t.apply(value),
                    None => value.clone(),
                };
                Value::String(rendered)
            }
            FieldSource::Concat { parts, separator } => {
                let mut rendered_parts = Vec::with_capacity(parts.len());
                for part in parts {
                    let field = snapshot.get(&part.name)?;
                    let rendered = match &part.transform {
                        Some(t) => t.apply(&field.render()),
                        None => field.render(),
                    };
                    rendered_parts.push(rendered);
                }
                let joined = rendered_parts.join(separator);
                let joined = match &rule.transform {
                    Some(t) => t.apply(&joined),
                    None => joined,
                };
                if joined.is_empty() {
                    return None;
                }
                Value::String(joined)
            }
        };

        // Never send empty strings; the remote treats them as garbage, not
        // as absent.
        if matches!(&value, Value::String(s) if s.is_empty()) {
            return None;
        }
        Some(value)
    }
}

/// Rule extracting a derived local field from a decoded response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractRule {
    /// Name of the derived field on the local side.
    pub local_name: String,
    /// Where the value comes from in the response body.
    pub source: ExtractSource,
    /// Transform applied to the final rendered value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
}

/// Source of an extracted value within a JSON response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExtractSource {
    /// A JSON pointer into the response body.
    Pointer {
        /// RFC 6901 pointer, e.g. `/last4`.
        pointer: String,
        /// Transform applied to this part.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transform: Option<Transform>,
    },
    /// Multiple sources concatenated.
    Concat {
        /// Parts to concatenate.
        parts: Vec<ExtractSource>,
        /// Separator between values.
        #[serde(default)]
        separator: String,
    },
    /// A constant value.
    Constant {
        /// The constant value.
        value: String,
    },
}

impl ExtractRule {
    /// Create a rule extracting a pointer value.
    pub fn pointer(local_name: impl Into<String>, pointer: impl Into<String>) -> Self {
        Self {
            local_name: local_name.into(),
            source: ExtractSource::Pointer {
                pointer: pointer.into(),
                transform: None,
            },
            transform: None,
        }
    }

    /// Resolve the rule against a response body.
    #[must_use]
    pub fn resolve(&self, body: &Value) -> Option<Value> {
        let value = Self::resolve_source(&self.source, body)?;
        match &self.transform {
            Some(t) => Some(Value::String(t.apply(&render_json(&value)))),
            None => Some(value),
        }
    }

    fn resolve_source(source: &ExtractSource, body: &Value) -> Option<Value> {
        match source {
            ExtractSource::Pointer { pointer, transform } => {
                let v = body.pointer(pointer)?;
                if v.is_null() {
                    return None;
                }
                match transform {
                    Some(t) => Some(Value::String(t.apply(&render_json(v)))),
                    None => Some(v.clone()),
                }
            }
            ExtractSource::Concat { parts, separator } => {
                let mut rendered = Vec::with_capacity(parts.len());
                for part in parts {
                    let v = Self::resolve_source(part, body)?;
                    rendered.push(render_json(&v));
                }
                Some(Value::String(rendered.join(separator)))
            }
            ExtractSource::Constant { value } => Some(Value::String(value.clone())),
        }
    }
}

/// Render a JSON scalar the way concatenation sees it (no quotes).
fn render_json(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn card_map() -> FieldMap {
        FieldMap::new()
            .with(FieldRule::field("cardholder_ref", "cardholder").required())
            .with(FieldRule::field("card_type", "type").required())
            .with(
                FieldRule::field("currency", "currency")
                    .required()
                    .with_transform(Transform::Lowercase),
            )
            .with(FieldRule::field("nickname", "nickname"))
    }

    #[test]
    fn test_build_elides_missing_optional() {
        let snap = Snapshot::new()
            .with("cardholder_ref", "CH_42")
            .with("card_type", "virtual")
            .with("currency", "EUR");

        let (payload, missing) = card_map().build(&snap, SyncOperation::Register);
        assert!(missing.is_empty());
        assert_eq!(payload.get("cardholder").unwrap(), &json!("CH_42"));
        assert_eq!(payload.get("currency").unwrap(), &json!("eur"));
        // Optional field with no source value is absent, not null.
        assert!(!payload.contains_key("nickname"));
    }

    #[test]
    fn test_build_reports_missing_required() {
        let snap = Snapshot::new().with("cardholder_ref", "CH_42");
        let (_, missing) = card_map().build(&snap, SyncOperation::Register);
        assert_eq!(missing, vec!["type".to_string(), "currency".to_string()]);
    }

    #[test]
    fn test_required_fields_per_operation() {
        let map = FieldMap::new()
            .with(FieldRule::field("a", "a").required().register_only())
            .with(FieldRule::field("b", "b").required());

        assert_eq!(map.required_fields(SyncOperation::Register), vec!["a", "b"]);
        assert_eq!(map.required_fields(SyncOperation::Update), vec!["b"]);
    }

    #[test]
    fn test_update_sends_synchronized_subset_only() {
        let map = FieldMap::new()
            .with(FieldRule::field("serial", "serial").register_only())
            .with(FieldRule::field("status", "status"));
        let snap = Snapshot::new().with("serial", "S-1").with("status", "active");

        let (register, _) = map.build(&snap, SyncOperation::Register);
        assert!(register.contains_key("serial"));

        let (update, _) = map.build(&snap, SyncOperation::Update);
        assert!(!update.contains_key("serial"));
        assert!(update.contains_key("status"));
    }

    #[test]
    fn test_empty_string_elided() {
        let map = FieldMap::new().with(FieldRule::field("note", "note"));
        let snap = Snapshot::new().with("note", "");
        let (payload, _) = map.build(&snap, SyncOperation::Register);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_transforms() {
        assert_eq!(Transform::Lowercase.apply("ABC"), "abc");
        assert_eq!(Transform::Uppercase.apply("abc"), "ABC");
        assert_eq!(Transform::Trim.apply("  x "), "x");
        assert_eq!(
            Transform::Replace {
                from: "-".to_string(),
                to: "".to_string()
            }
            .apply("a-b-c"),
            "abc"
        );
        assert_eq!(Transform::ZeroPad { width: 2 }.apply("6"), "06");
        assert_eq!(Transform::ZeroPad { width: 2 }.apply("12"), "12");
        assert_eq!(
            Transform::Default {
                value: "none".to_string()
            }
            .apply(""),
            "none"
        );
        assert_eq!(
            Transform::Chain {
                transforms: vec![Transform::Trim, Transform::Uppercase]
            }
            .apply(" ab "),
            "AB"
        );
    }

    #[test]
    fn test_concat_source() {
        let map = FieldMap::new().with(FieldRule {
            remote_field: "full_name".to_string(),
            source: FieldSource::Concat {
                parts: vec![
                    ConcatPart {
                        name: "first".to_string(),
                        transform: None,
                    },
                    ConcatPart {
                        name: "last".to_string(),
                        transform: Some(Transform::Uppercase),
                    },
                ],
                separator: " ".to_string(),
            },
            transform: None,
            required: true,
            on_register: true,
            on_update: true,
        });

        let snap = Snapshot::new().with("first", "Ada").with("last", "Lovelace");
        let (payload, missing) = map.build(&snap, SyncOperation::Register);
        assert!(missing.is_empty());
        assert_eq!(payload.get("full_name").unwrap(), &json!("Ada LOVELACE"));
    }

    #[test]
    fn test_extract_pointer() {
        let body = json!({"id": "ic_001", "last4": "4242"});
        let rule = ExtractRule::pointer("last4", "/last4");
        assert_eq!(rule.resolve(&body), Some(json!("4242")));
    }

    #[test]
    fn test_extract_concat_with_zero_pad() {
        let body = json!({"exp_month": 6, "exp_year": 27});
        let rule = ExtractRule {
            local_name: "expiration".to_string(),
            source: ExtractSource::Concat {
                parts: vec![
                    ExtractSource::Pointer {
                        pointer: "/exp_month".to_string(),
                        transform: Some(Transform::ZeroPad { width: 2 }),
                    },
                    ExtractSource::Pointer {
                        pointer: "/exp_year".to_string(),
                        transform: None,
                    },
                ],
                separator: "/".to_string(),
            },
            transform: None,
        };
        assert_eq!(rule.resolve(&body), Some(json!("06/27")));
    }

    #[test]
    fn test_extract_missing_pointer() {
        let body = json!({"id": "x"});
        let rule = ExtractRule::pointer("last4", "/last4");
        assert_eq!(rule.resolve(&body), None);
    }

    #[test]
    fn test_field_rule_serde() {
        let rule = FieldRule::field("email", "mail")
            .required()
            .with_transform(Transform::Lowercase);
        let json = serde_json::to_string(&rule).unwrap();
        assert!(json.contains("\"remote_field\":\"mail\""));
        assert!(json.contains("\"type\":\"lowercase\""));

        let parsed: FieldRule = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.remote_field, "mail");
        assert!(parsed.required);
    }
}
