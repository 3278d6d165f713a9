use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// ParamSchema
// ---------------------------------------------------------------------------

/// Structural schema for tool parameters.
///
/// Tools declare their argument shape as a tagged tree rather than a free
/// JSON blob, so arguments can be validated before dispatch instead of being
/// cast-and-hoped inside the tool body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamSchema {
    String {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        enum_values: Option<Vec<String>>,
    },
    Number {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Boolean {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Array {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        items: Box<ParamSchema>,
    },
    Object {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        properties: BTreeMap<String, ParamSchema>,
        #[serde(default)]
        required: Vec<String>,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("at `{path}`: expected {expected}, got {got}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        got: &'static str,
    },
    #[error("at `{path}`: missing required field `{field}`")]
    MissingField { path: String, field: String },
    #[error("at `{path}`: value `{value}` is not one of the allowed variants")]
    InvalidVariant { path: String, value: String },
}

impl ParamSchema {
    /// Convenience constructors for the common leaves.
    pub fn string(description: impl Into<String>) -> Self {
        ParamSchema::String {
            description: Some(description.into()),
            enum_values: None,
        }
    }

    pub fn number(description: impl Into<String>) -> Self {
        ParamSchema::Number {
            description: Some(description.into()),
        }
    }

    pub fn boolean(description: impl Into<String>) -> Self {
        ParamSchema::Boolean {
            description: Some(description.into()),
        }
    }

    /// An object schema from `(name, schema, required)` triples.
    pub fn object<I>(fields: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, ParamSchema, bool)>,
    {
        let mut properties = BTreeMap::new();
        let mut required = Vec::new();
        for (name, schema, is_required) in fields {
            if is_required {
                required.push(name.to_string());
            }
            properties.insert(name.to_string(), schema);
        }
        ParamSchema::Object {
            description: None,
            properties,
            required,
        }
    }

    /// Validate `value` against this schema.
    pub fn validate(&self, value: &Value) -> Result<(), SchemaError> {
        self.validate_at(value, "$")
    }

    fn validate_at(&self, value: &Value, path: &str) -> Result<(), SchemaError> {
        match self {
            ParamSchema::String { enum_values, .. } => match value {
                Value::String(s) => {
                    if let Some(allowed) = enum_values {
                        if !allowed.iter().any(|v| v == s) {
                            return Err(SchemaError::InvalidVariant {
                                path: path.to_string(),
                                value: s.clone(),
                            });
                        }
                    }
                    Ok(())
                }
                other => Err(type_mismatch(path, "string", other)),
            },
            ParamSchema::Number { .. } => match value {
                Value::Number(_) => Ok(()),
                other => Err(type_mismatch(path, "number", other)),
            },
            ParamSchema::Boolean { .. } => match value {
                Value::Bool(_) => Ok(()),
                other => Err(type_mismatch(path, "boolean", other)),
            },
            ParamSchema::Array { items, .. } => match value {
                Value::Array(elements) => {
                    for (i, element) in elements.iter().enumerate() {
                        items.validate_at(element, &format!("{path}[{i}]"))?;
                    }
                    Ok(())
                }
                other => Err(type_mismatch(path, "array", other)),
            },
            ParamSchema::Object {
                properties,
                required,
                ..
            } => match value {
                Value::Object(map) => {
                    for field in required {
                        if !map.contains_key(field) {
                            return Err(SchemaError::MissingField {
                                path: path.to_string(),
                                field: field.clone(),
                            });
                        }
                    }
                    // Unknown fields pass through untouched; only declared
                    // fields are checked.
                    for (name, schema) in properties {
                        if let Some(field_value) = map.get(name) {
                            schema.validate_at(field_value, &format!("{path}.{name}"))?;
                        }
                    }
                    Ok(())
                }
                other => Err(type_mismatch(path, "object", other)),
            },
        }
    }

    /// Render as a JSON Schema fragment for the provider tool definition.
    pub fn to_json_schema(&self) -> Value {
        match self {
            ParamSchema::String {
                description,
                enum_values,
            } => {
                let mut out = json!({"type": "string"});
                if let Some(d) = description {
                    out["description"] = json!(d);
                }
                if let Some(variants) = enum_values {
                    out["enum"] = json!(variants);
                }
                out
            }
            ParamSchema::Number { description } => with_description("number", description),
            ParamSchema::Boolean { description } => with_description("boolean", description),
            ParamSchema::Array { description, items } => {
                let mut out = json!({"type": "array", "items": items.to_json_schema()});
                if let Some(d) = description {
                    out["description"] = json!(d);
                }
                out
            }
            ParamSchema::Object {
                description,
                properties,
                required,
            } => {
                let props: serde_json::Map<String, Value> = properties
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json_schema()))
                    .collect();
                let mut out = json!({"type": "object", "properties": props});
                if !required.is_empty() {
                    out["required"] = json!(required);
                }
                if let Some(d) = description {
                    out["description"] = json!(d);
                }
                out
            }
        }
    }
}

fn with_description(ty: &str, description: &Option<String>) -> Value {
    let mut out = json!({ "type": ty });
    if let Some(d) = description {
        out["description"] = json!(d);
    }
    out
}

fn type_mismatch(path: &str, expected: &'static str, got: &Value) -> SchemaError {
    let got = match got {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    SchemaError::TypeMismatch {
        path: path.to_string(),
        expected,
        got,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
