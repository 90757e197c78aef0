//! Parameter validation. Pure data transformation: never touches the
//! filesystem or spawns anything.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::GateError;
use crate::template::{CommandTemplate, Constraints, ParameterSpec};

/// A validated, typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Parameters that passed validation. Optional parameters with no value and
/// no default are absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ResolvedParams {
    values: BTreeMap<String, ParamValue>,
}

impl ResolvedParams {
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Check submitted arguments against the template schema.
///
/// Unknown names are rejected first, then each declared parameter is resolved
/// (submitted value, else default) and checked in name order.
pub fn validate(
    template: &CommandTemplate,
    submitted: &Map<String, Value>,
) -> Result<ResolvedParams, GateError> {
    if let Some(unknown) = submitted
        .keys()
        .find(|k| !template.parameters.contains_key(k.as_str()))
    {
        return Err(GateError::validation(unknown, "unknown parameter"));
    }

    let mut values = BTreeMap::new();
    for (name, spec) in &template.parameters {
        let value = match submitted.get(name).filter(|v| !v.is_null()) {
            Some(raw) => check_value(spec, raw)?,
            None => match &spec.default {
                Some(default) => default.clone(),
                None if spec.required => {
                    return Err(GateError::validation(name, "required parameter missing"));
                }
                None => continue,
            },
        };
        values.insert(name.clone(), value);
    }

    Ok(ResolvedParams { values })
}

/// Coerce one raw value to the parameter's type, then apply its constraints.
pub(crate) fn check_value(spec: &ParameterSpec, raw: &Value) -> Result<ParamValue, GateError> {
    let name = spec.name.as_str();
    let fail = |reason: String| GateError::validation(name, reason);

    match &spec.constraints {
        Constraints::String {
            pattern,
            min_length,
            max_length,
        } => {
            let s = scalar_text(raw).ok_or_else(|| fail("expected a string".to_owned()))?;
            if s.chars().any(char::is_control) {
                return Err(fail("control characters are not allowed".to_owned()));
            }
            let len = s.chars().count();
            if let Some(min) = min_length
                && len < *min
            {
                return Err(fail(format!("too short (min {min} characters)")));
            }
            if let Some(max) = max_length
                && len > *max
            {
                return Err(fail(format!("too long (max {max} characters)")));
            }
            if let Some(re) = pattern
                && !re.is_match(&s)
            {
                return Err(fail("does not match the required pattern".to_owned()));
            }
            reject_option_like(spec, &s)?;
            Ok(ParamValue::Str(s))
        }
        Constraints::Path { allowed, forbidden } => {
            let raw = raw
                .as_str()
                .ok_or_else(|| fail("expected a path string".to_owned()))?;
            let path = normalize_path(raw).map_err(|r| fail(r.to_owned()))?;
            // Forbidden wins over allowed.
            if let Some(prefix) = forbidden.iter().find(|p| path.starts_with(p)) {
                return Err(fail(format!("path is under forbidden location {}", prefix.display())));
            }
            if !allowed.iter().any(|p| path.starts_with(p)) {
                return Err(fail("path is not under an allowed location".to_owned()));
            }
            let text = path
                .to_str()
                .ok_or_else(|| fail("path is not valid UTF-8".to_owned()))?
                .to_owned();
            Ok(ParamValue::Str(text))
        }
        Constraints::Integer { min, max } => {
            let n = coerce_integer(raw).ok_or_else(|| fail("expected an integer".to_owned()))?;
            if let Some(min) = min
                && n < *min
            {
                return Err(fail(format!("{n} is below the minimum of {min}")));
            }
            if let Some(max) = max
                && n > *max
            {
                return Err(fail(format!("{n} exceeds the maximum of {max}")));
            }
            Ok(ParamValue::Int(n))
        }
        Constraints::Float { min, max } => {
            let x = coerce_float(raw).ok_or_else(|| fail("expected a number".to_owned()))?;
            if let Some(min) = min
                && x < *min
            {
                return Err(fail(format!("{x} is below the minimum of {min}")));
            }
            if let Some(max) = max
                && x > *max
            {
                return Err(fail(format!("{x} exceeds the maximum of {max}")));
            }
            Ok(ParamValue::Float(x))
        }
        Constraints::Boolean => coerce_bool(raw)
            .map(ParamValue::Bool)
            .ok_or_else(|| fail("expected a boolean".to_owned())),
        Constraints::Enum { allowed } => {
            let s = scalar_text(raw).ok_or_else(|| fail("expected a scalar value".to_owned()))?;
            if !allowed.contains(&s) {
                return Err(fail(format!("must be one of: {}", allowed.join(", "))));
            }
            Ok(ParamValue::Str(s))
        }
    }
}

/// Lexically normalize an absolute path: drop `.`, resolve `..` (never above
/// the root). Rejects relative paths and null bytes.
pub(crate) fn normalize_path(raw: &str) -> Result<PathBuf, &'static str> {
    if raw.contains('\0') {
        return Err("contains a null byte");
    }
    let path = Path::new(raw);
    if !path.is_absolute() {
        return Err("must be an absolute path");
    }

    let mut normalized = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    Ok(normalized)
}

fn reject_option_like(spec: &ParameterSpec, value: &str) -> Result<(), GateError> {
    if value.starts_with('-') && !spec.allow_option_like {
        return Err(GateError::validation(
            &spec.name,
            "values starting with '-' are not allowed",
        ));
    }
    Ok(())
}

fn scalar_text(raw: &Value) -> Option<String> {
    match raw {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn coerce_integer(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_float(raw: &Value) -> Option<f64> {
    let x = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }?;
    x.is_finite().then_some(x)
}

fn coerce_bool(raw: &Value) -> Option<bool> {
    match raw {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
