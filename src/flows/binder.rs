use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::flows::registry::FlowDescriptor;

/// Declared type of a flow parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Int,
    Float,
    Bool,
    /// Any JSON object, passed through as-is.
    Object,
    List(Box<ParamType>),
    /// JSON object with exactly the declared fields.
    Record(Vec<ParamSpec>),
}

impl ParamType {
    fn describe(&self) -> String {
        match self {
            ParamType::String => "string".to_string(),
            ParamType::Int => "int".to_string(),
            ParamType::Float => "float".to_string(),
            ParamType::Bool => "bool".to_string(),
            ParamType::Object => "object".to_string(),
            ParamType::List(inner) => format!("list<{}>", inner.describe()),
            ParamType::Record(fields) => format!(
                "record {{{}}}",
                fields
                    .iter()
                    .map(|f| f.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

/// A named, typed parameter in a flow's declared parameter list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ParamType,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            optional: true,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum BindError {
    #[error("Constructor parameters [{}] for flow [{flow}] were not provided.", .missing.join(", "))]
    MissingParameters { flow: String, missing: Vec<String> },

    #[error("Additional parameters [{}] for flow [{flow}] found.", .unexpected.join(", "))]
    UnexpectedParameters { flow: String, unexpected: Vec<String> },

    #[error("Parameter [{parameter}] for flow [{flow}] expects {expected}, got {found}.")]
    ParameterType {
        flow: String,
        parameter: String,
        expected: String,
        found: String,
    },
}

/// Bind a named parameter object onto a flow's positional parameter list.
///
/// The supplied names must match the declared names exactly (optional
/// parameters may be omitted and bind as `null`). Values are coerced strictly:
/// no number-to-string or string-to-number conversion, integers widen to
/// floats but floats never narrow to integers. The result follows declaration
/// order, whatever the key order of `supplied`.
pub fn bind(flow: &FlowDescriptor, supplied: &Map<String, Value>) -> Result<Vec<Value>, BindError> {
    let missing: Vec<String> = flow
        .parameters
        .iter()
        .filter(|p| !p.optional && !supplied.contains_key(&p.name))
        .map(|p| p.name.clone())
        .collect();
    if !missing.is_empty() {
        return Err(BindError::MissingParameters {
            flow: flow.name.clone(),
            missing,
        });
    }

    let unexpected: Vec<String> = supplied
        .keys()
        .filter(|k| !flow.parameters.iter().any(|p| &p.name == *k))
        .cloned()
        .collect();
    if !unexpected.is_empty() {
        return Err(BindError::UnexpectedParameters {
            flow: flow.name.clone(),
            unexpected,
        });
    }

    flow.parameters
        .iter()
        .map(|param| {
            let coerced = match supplied.get(&param.name) {
                None | Some(Value::Null) if param.optional => return Ok(Value::Null),
                Some(value) => coerce(value, &param.ty, &param.name),
                None => coerce(&Value::Null, &param.ty, &param.name),
            };
            coerced.map_err(|m| BindError::ParameterType {
                flow: flow.name.clone(),
                parameter: m.path,
                expected: m.expected,
                found: m.found.to_string(),
            })
        })
        .collect()
}

struct Mismatch {
    path: String,
    expected: String,
    found: &'static str,
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn coerce(value: &Value, ty: &ParamType, path: &str) -> Result<Value, Mismatch> {
    let mismatch = |found: &'static str| Mismatch {
        path: path.to_string(),
        expected: ty.describe(),
        found,
    };

    match (ty, value) {
        (ParamType::String, Value::String(_)) => Ok(value.clone()),
        (ParamType::Bool, Value::Bool(_)) => Ok(value.clone()),
        (ParamType::Int, Value::Number(n)) => match n.as_i64() {
            Some(i) if !n.is_f64() => Ok(Value::from(i)),
            _ => Err(mismatch(json_kind(value))),
        },
        (ParamType::Float, Value::Number(n)) => match n.as_f64() {
            Some(f) => Ok(Value::from(f)),
            None => Err(mismatch(json_kind(value))),
        },
        (ParamType::Object, Value::Object(_)) => Ok(value.clone()),
        (ParamType::List(inner), Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| coerce(item, inner, &format!("{}[{}]", path, i)))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        (ParamType::Record(fields), Value::Object(map)) => {
            if let Some(extra) = map.keys().find(|k| !fields.iter().any(|f| &f.name == *k)) {
                return Err(Mismatch {
                    path: format!("{}.{}", path, extra),
                    expected: "no such field".to_string(),
                    found: json_kind(&map[extra]),
                });
            }

            let mut bound = Map::new();
            for field in fields {
                let field_path = format!("{}.{}", path, field.name);
                let value = match map.get(&field.name) {
                    Some(v) if !(v.is_null() && field.optional) => coerce(v, &field.ty, &field_path)?,
                    Some(_) => Value::Null,
                    None if field.optional => Value::Null,
                    None => {
                        return Err(Mismatch {
                            path: field_path,
                            expected: field.ty.describe(),
                            found: "nothing",
                        });
                    }
                };
                bound.insert(field.name.clone(), value);
            }
            Ok(Value::Object(bound))
        }
        _ => Err(mismatch(json_kind(value))),
    }
}
