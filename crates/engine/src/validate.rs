// SPDX-License-Identifier: Apache-2.0

//! Structural payload validation.
//!
//! The validator walks a structural value depth-first against a [`Schema`],
//! producing a flat list of violations. Paths are dotted, with numeric
//! indices for array positions (`items.2.amount`). Validation happens on the
//! structural value, before the payload is materialised, so a failing payload
//! never has to be constructible as the target type.

use crate::schema::{FieldKind, FieldSpec, Schema};
use serde_json::{Map, Value};
use siphon_config::ValidatorOptions;
use std::fmt;

/// One failed constraint check.
#[derive(Debug, Clone)]
pub struct ConstraintViolation {
    /// Dotted path of the offending value within the payload. Empty for the
    /// payload root.
    pub property_path: String,
    /// Tag of the failed constraint (`positive`, `required`, `type`, ...).
    pub constraint: String,
    /// Human-readable description of the failure.
    pub message: String,
    /// The offending value, when the options ask for it.
    pub offending_value: Option<Value>,
}

impl fmt::Display for ConstraintViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.property_path.is_empty() {
            write!(f, "payload {} ({})", self.message, self.constraint)
        } else {
            write!(
                f,
                "`{}` {} ({})",
                self.property_path, self.message, self.constraint
            )
        }
    }
}

/// Runs a [`Schema`] against structural payloads.
#[derive(Debug, Clone)]
pub struct Validator {
    schema: Schema,
}

impl Validator {
    /// Creates a validator for the given schema.
    pub fn new(schema: Schema) -> Self {
        Self { schema }
    }

    /// The schema this validator runs.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Validates a structural value in place.
    ///
    /// With `strip_unknown`, members not described by the schema are removed
    /// from the value; this is the only mutation the validator performs. The
    /// returned violations are in traversal order and empty when the payload
    /// passes.
    pub fn validate(&self, value: &mut Value, options: &ValidatorOptions) -> Vec<ConstraintViolation> {
        let mut walk = Walk {
            options,
            violations: Vec::new(),
            stopped: false,
        };
        match value {
            Value::Object(object) => walk.object(&self.schema, object, ""),
            other => walk.push(
                String::new(),
                "type",
                format!("expected object, got {}", value_kind(other)),
                Some(other),
            ),
        }
        walk.violations
    }
}

struct Walk<'a> {
    options: &'a ValidatorOptions,
    violations: Vec<ConstraintViolation>,
    stopped: bool,
}

impl Walk<'_> {
    fn push(&mut self, path: String, constraint: &str, message: String, value: Option<&Value>) {
        if self.stopped {
            return;
        }
        self.violations.push(ConstraintViolation {
            property_path: path,
            constraint: constraint.to_owned(),
            message,
            offending_value: if self.options.include_value {
                value.cloned()
            } else {
                None
            },
        });
        if self.options.stop_at_first {
            self.stopped = true;
        }
    }

    fn field_enabled(&self, field: &FieldSpec) -> bool {
        if self.options.groups.is_empty() || field.groups().is_empty() {
            return true;
        }
        field
            .groups()
            .iter()
            .any(|group| self.options.groups.contains(group))
    }

    fn object(&mut self, schema: &Schema, object: &mut Map<String, Value>, path: &str) {
        for field in schema.fields() {
            if self.stopped {
                return;
            }
            if !self.field_enabled(field) {
                continue;
            }
            if field.is_required()
                && !self.options.skip_missing
                && !object.contains_key(field.name())
            {
                self.push(
                    join(path, field.name()),
                    "required",
                    "is required".to_owned(),
                    None,
                );
            }
        }

        let unknown: Vec<String> = object
            .keys()
            .filter(|key| schema.field(key).is_none())
            .cloned()
            .collect();
        if self.options.reject_unknown {
            for key in &unknown {
                if self.stopped {
                    return;
                }
                let value = object.get(key.as_str());
                self.push(
                    join(path, key),
                    "unknown",
                    "is not described by the schema".to_owned(),
                    value,
                );
            }
        }
        if self.options.strip_unknown {
            for key in &unknown {
                object.remove(key.as_str());
            }
        }

        for (key, value) in object.iter_mut() {
            if self.stopped {
                return;
            }
            let Some(field) = schema.field(key) else {
                continue;
            };
            if !self.field_enabled(field) {
                continue;
            }
            self.field_value(field, value, join(path, key));
        }
    }

    fn field_value(&mut self, field: &FieldSpec, value: &mut Value, path: String) {
        if !field.kind().matches(value) {
            self.push(
                path,
                "type",
                format!(
                    "expected {}, got {}",
                    field.kind().label(),
                    value_kind(value)
                ),
                Some(value),
            );
            return;
        }
        for constraint in field.constraints() {
            if self.stopped {
                return;
            }
            if let Some(message) = constraint.violation_message(value) {
                self.push(path.clone(), constraint.name(), message, Some(value));
            }
        }
        self.nested(field.kind(), value, &path);
    }

    fn nested(&mut self, kind: &FieldKind, value: &mut Value, path: &str) {
        match (kind, value) {
            (FieldKind::Object(schema), Value::Object(object)) => {
                self.object(schema, object, path);
            }
            (FieldKind::Array(element_kind), Value::Array(items)) => {
                for (index, item) in items.iter_mut().enumerate() {
                    if self.stopped {
                        return;
                    }
                    self.element(element_kind, item, format!("{path}.{index}"));
                }
            }
            _ => {}
        }
    }

    fn element(&mut self, kind: &FieldKind, value: &mut Value, path: String) {
        if !kind.matches(value) {
            self.push(
                path,
                "type",
                format!("expected {}, got {}", kind.label(), value_kind(value)),
                Some(value),
            );
            return;
        }
        self.nested(kind, value, &path);
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_owned()
    } else {
        format!("{path}.{key}")
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
