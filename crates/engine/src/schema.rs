// SPDX-License-Identifier: Apache-2.0

//! Schema descriptors for payload validation.
//!
//! A [`Schema`] is a builder-time registry of field descriptors: name,
//! expected structural kind, optional nesting, and the named constraints to
//! run against the field's value. The validator walks a structural value
//! against this registry; nothing is derived from the payload type itself, so
//! the same schema can describe payloads decoded by any converter.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Structural kind a field is expected to have.
#[derive(Debug, Clone)]
pub enum FieldKind {
    /// A JSON string.
    String,
    /// Any JSON number.
    Number,
    /// A JSON number with no fractional part.
    Integer,
    /// A JSON boolean.
    Boolean,
    /// A JSON array whose elements all have the given kind.
    Array(Box<FieldKind>),
    /// A JSON object described by a nested schema.
    Object(Schema),
    /// Any value; only constraints apply.
    Any,
}

impl FieldKind {
    /// Label used in `type` violations.
    pub fn label(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Integer => "integer",
            FieldKind::Boolean => "boolean",
            FieldKind::Array(_) => "array",
            FieldKind::Object(_) => "object",
            FieldKind::Any => "any",
        }
    }

    /// Whether the given structural value has this kind.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Array(_) => value.is_array(),
            FieldKind::Object(_) => value.is_object(),
            FieldKind::Any => true,
        }
    }
}

/// A named constraint with its parameters.
///
/// Constraints are identified by tag; the tag is what violation reports and
/// logs carry. A constraint silently passes on values whose structural kind
/// it does not apply to, leaving the mismatch to the field's `type` check.
#[derive(Clone)]
pub enum Constraint {
    /// Number must be strictly greater than zero.
    Positive,
    /// Number must be at least the given bound.
    Min(f64),
    /// Number must be at most the given bound.
    Max(f64),
    /// String must contain at least one non-whitespace character.
    NotBlank,
    /// String or array must have at least this many characters/elements.
    MinLength(usize),
    /// String or array must have at most this many characters/elements.
    MaxLength(usize),
    /// String must match the pattern: a leading `^` anchors to the start, a
    /// trailing `$` to the end, otherwise the pattern matches anywhere.
    Pattern(String),
    /// Value must equal one of the listed values.
    OneOf(Vec<Value>),
    /// A caller-registered check.
    Custom(CustomConstraint),
}

/// A caller-supplied constraint: a tag plus a predicate over the structural
/// value.
#[derive(Clone)]
pub struct CustomConstraint {
    name: String,
    check: Arc<dyn Fn(&Value) -> bool + Send + Sync>,
}

impl CustomConstraint {
    /// Creates a custom constraint with the given tag and predicate. The
    /// predicate returns `true` when the value passes.
    pub fn new(
        name: impl Into<String>,
        check: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }
}

impl fmt::Debug for CustomConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomConstraint")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Positive => write!(f, "Positive"),
            Constraint::Min(bound) => write!(f, "Min({bound})"),
            Constraint::Max(bound) => write!(f, "Max({bound})"),
            Constraint::NotBlank => write!(f, "NotBlank"),
            Constraint::MinLength(len) => write!(f, "MinLength({len})"),
            Constraint::MaxLength(len) => write!(f, "MaxLength({len})"),
            Constraint::Pattern(pattern) => write!(f, "Pattern({pattern:?})"),
            Constraint::OneOf(values) => write!(f, "OneOf({values:?})"),
            Constraint::Custom(custom) => custom.fmt(f),
        }
    }
}

impl Constraint {
    /// The tag carried by violations of this constraint.
    pub fn name(&self) -> &str {
        match self {
            Constraint::Positive => "positive",
            Constraint::Min(_) => "min",
            Constraint::Max(_) => "max",
            Constraint::NotBlank => "not_blank",
            Constraint::MinLength(_) => "min_length",
            Constraint::MaxLength(_) => "max_length",
            Constraint::Pattern(_) => "pattern",
            Constraint::OneOf(_) => "one_of",
            Constraint::Custom(custom) => &custom.name,
        }
    }

    /// Checks the value, returning a violation message when it fails.
    pub(crate) fn violation_message(&self, value: &Value) -> Option<String> {
        match self {
            Constraint::Positive => {
                let number = value.as_f64()?;
                (number <= 0.0).then(|| "must be positive".to_owned())
            }
            Constraint::Min(bound) => {
                let number = value.as_f64()?;
                (number < *bound).then(|| format!("must be at least {bound}"))
            }
            Constraint::Max(bound) => {
                let number = value.as_f64()?;
                (number > *bound).then(|| format!("must be at most {bound}"))
            }
            Constraint::NotBlank => {
                let text = value.as_str()?;
                text.trim()
                    .is_empty()
                    .then(|| "must not be blank".to_owned())
            }
            Constraint::MinLength(len) => {
                let actual = length_of(value)?;
                (actual < *len).then(|| format!("length must be at least {len}"))
            }
            Constraint::MaxLength(len) => {
                let actual = length_of(value)?;
                (actual > *len).then(|| format!("length must be at most {len}"))
            }
            Constraint::Pattern(pattern) => {
                let text = value.as_str()?;
                (!pattern_matches(pattern, text))
                    .then(|| format!("must match pattern {pattern:?}"))
            }
            Constraint::OneOf(allowed) => (!allowed.contains(value))
                .then(|| format!("must be one of {} allowed values", allowed.len())),
            Constraint::Custom(custom) => {
                (!(custom.check)(value)).then(|| format!("failed constraint `{}`", custom.name))
            }
        }
    }
}

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(text) => Some(text.chars().count()),
        Value::Array(items) => Some(items.len()),
        _ => None,
    }
}

fn pattern_matches(pattern: &str, text: &str) -> bool {
    match (pattern.strip_prefix('^'), pattern.strip_suffix('$')) {
        (Some(rest), None) => text.starts_with(rest),
        (None, Some(rest)) => text.ends_with(rest),
        (Some(_), Some(_)) => {
            let exact = &pattern[1..pattern.len() - 1];
            text == exact
        }
        (None, None) => text.contains(pattern),
    }
}

/// Descriptor of one schema field.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    name: String,
    kind: FieldKind,
    required: bool,
    constraints: Vec<Constraint>,
    groups: Vec<String>,
}

impl FieldSpec {
    /// Creates an optional field of the given kind.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            constraints: Vec::new(),
            groups: Vec::new(),
        }
    }

    /// Marks the field as required.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Adds a constraint.
    #[must_use]
    pub fn constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Tags the field with a validation group.
    #[must_use]
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    /// The field name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The expected structural kind.
    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    /// Whether the field must be present.
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// The constraints to run against the field's value.
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// The validation groups this field is tagged with.
    pub fn groups(&self) -> &[String] {
        &self.groups
    }
}

/// A registry of field descriptors for one object shape.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: Vec<FieldSpec>,
}

impl Schema {
    /// Starts building a schema.
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder { fields: Vec::new() }
    }

    /// All field descriptors, in declaration order.
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Looks up a field descriptor by name.
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }
}

/// Builder for [`Schema`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    fields: Vec<FieldSpec>,
}

impl SchemaBuilder {
    /// Adds a field descriptor.
    #[must_use]
    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    /// Finishes the schema.
    pub fn build(self) -> Schema {
        Schema {
            fields: self.fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kinds_match_structural_values() {
        assert!(FieldKind::String.matches(&json!("x")));
        assert!(FieldKind::Number.matches(&json!(1.5)));
        assert!(FieldKind::Integer.matches(&json!(3)));
        assert!(!FieldKind::Integer.matches(&json!(3.5)));
        assert!(FieldKind::Boolean.matches(&json!(true)));
        assert!(FieldKind::Array(Box::new(FieldKind::Any)).matches(&json!([])));
        assert!(FieldKind::Object(Schema::default()).matches(&json!({})));
        assert!(FieldKind::Any.matches(&json!(null)));
    }

    #[test]
    fn numeric_constraints() {
        assert!(Constraint::Positive.violation_message(&json!(1)).is_none());
        assert!(Constraint::Positive.violation_message(&json!(0)).is_some());
        assert!(Constraint::Positive.violation_message(&json!(-5)).is_some());
        assert!(Constraint::Min(2.0).violation_message(&json!(2)).is_none());
        assert!(Constraint::Min(2.0).violation_message(&json!(1)).is_some());
        assert!(Constraint::Max(9.0).violation_message(&json!(10)).is_some());
        // Non-numeric values are left to the type check.
        assert!(Constraint::Positive.violation_message(&json!("x")).is_none());
    }

    #[test]
    fn string_constraints() {
        assert!(Constraint::NotBlank.violation_message(&json!("a")).is_none());
        assert!(
            Constraint::NotBlank
                .violation_message(&json!("  "))
                .is_some()
        );
        assert!(
            Constraint::MinLength(2)
                .violation_message(&json!("ab"))
                .is_none()
        );
        assert!(
            Constraint::MinLength(2)
                .violation_message(&json!("a"))
                .is_some()
        );
        assert!(
            Constraint::MaxLength(1)
                .violation_message(&json!([1, 2]))
                .is_some()
        );
    }

    #[test]
    fn pattern_anchors() {
        let starts = Constraint::Pattern("^ord-".to_owned());
        assert!(starts.violation_message(&json!("ord-17")).is_none());
        assert!(starts.violation_message(&json!("ref-17")).is_some());

        let ends = Constraint::Pattern("-eu$".to_owned());
        assert!(ends.violation_message(&json!("tenant-eu")).is_none());

        let exact = Constraint::Pattern("^done$".to_owned());
        assert!(exact.violation_message(&json!("done")).is_none());
        assert!(exact.violation_message(&json!("done!")).is_some());

        let anywhere = Constraint::Pattern("mid".to_owned());
        assert!(anywhere.violation_message(&json!("amidst")).is_none());
    }

    #[test]
    fn one_of_and_custom() {
        let one_of = Constraint::OneOf(vec![json!("eu"), json!("us")]);
        assert!(one_of.violation_message(&json!("eu")).is_none());
        assert!(one_of.violation_message(&json!("ap")).is_some());

        let even = Constraint::Custom(CustomConstraint::new("even", |value| {
            value.as_i64().is_some_and(|number| number % 2 == 0)
        }));
        assert_eq!(even.name(), "even");
        assert!(even.violation_message(&json!(4)).is_none());
        assert!(even.violation_message(&json!(3)).is_some());
    }

    #[test]
    fn builder_preserves_declaration_order() {
        let schema = Schema::builder()
            .field(FieldSpec::new("order_id", FieldKind::String).required())
            .field(FieldSpec::new("amount", FieldKind::Number))
            .build();
        let names: Vec<_> = schema.fields().iter().map(FieldSpec::name).collect();
        assert_eq!(names, ["order_id", "amount"]);
        assert!(schema.field("amount").is_some());
        assert!(schema.field("missing").is_none());
    }
}
