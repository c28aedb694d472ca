//! A structural comparator for JSON documents.
//!
//! [`matches`] walks a resource guided by a pattern: only keys present in the
//! pattern are inspected, so extra resource fields are ignored. The check is
//! therefore asymmetric; structural equality is approximated by matching in
//! both directions.

mod leaf;


use serde_json::{Map, Value};

pub use self::leaf::{validate as validate_leaf, wildcard_match};

/// Label key fragments that are managed by the controller and ignored when
/// comparing labels.
const MANAGED_LABEL_DOMAINS: [&str; 2] = ["kyverno.io", "app.kubernetes.io"];

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message} (path {path})")]
pub struct Mismatch {
    pub path: String,
    pub message: String,
}

/// Checks that `resource` satisfies `pattern`.
///
/// In addition to the structural walk, labels and annotations present on the
/// resource must also be present on the pattern when both declare them.
pub fn matches(resource: &Value, pattern: &Value) -> Result<(), Mismatch> {
    validate_element(resource, pattern, "/")?;
    validate_metadata(resource, pattern)
}

fn validate_element(resource: &Value, pattern: &Value, path: &str) -> Result<(), Mismatch> {
    match pattern {
        Value::Object(pattern) => match resource {
            Value::Object(resource) => validate_map(resource, pattern, path),
            _ => Err(mismatch(
                path,
                format!(
                    "pattern and resource have different structures: expected map, found {}",
                    type_name(resource)
                ),
            )),
        },
        Value::Array(pattern) => match resource {
            Value::Array(resource) => validate_array(resource, pattern, path),
            _ => Err(mismatch(
                path,
                "resource does not satisfy the expected array pattern",
            )),
        },
        leaf => {
            if leaf::validate(resource, leaf) {
                Ok(())
            } else {
                Err(mismatch(
                    path,
                    format!("value '{resource}' does not match '{leaf}'"),
                ))
            }
        }
    }
}

fn validate_map(
    resource: &Map<String, Value>,
    pattern: &Map<String, Value>,
    path: &str,
) -> Result<(), Mismatch> {
    for (key, pattern) in pattern {
        let value = resource.get(key).unwrap_or(&Value::Null);
        if pattern.as_str() == Some("*") {
            if value.is_null() {
                return Err(mismatch(path, format!("field {key} is not present")));
            }
            continue;
        }
        validate_element(value, pattern, &format!("{path}{key}/"))?;
    }
    Ok(())
}

fn validate_array(resource: &[Value], pattern: &[Value], path: &str) -> Result<(), Mismatch> {
    if pattern.is_empty() {
        if resource.is_empty() {
            return Ok(());
        }
        return Err(mismatch(path, "pattern array is empty"));
    }

    if pattern[0].is_object() {
        for pattern in pattern {
            validate_any_element(resource, pattern, path)?;
        }
        return Ok(());
    }

    if resource.len() != pattern.len() {
        return Err(mismatch(
            path,
            format!(
                "array length mismatch: resource has {} elements, pattern has {}",
                resource.len(),
                pattern.len()
            ),
        ));
    }
    for (i, (resource, pattern)) in resource.iter().zip(pattern).enumerate() {
        validate_element(resource, pattern, &format!("{path}{i}/"))?;
    }
    Ok(())
}

/// Succeeds if any element of the resource array satisfies the pattern.
fn validate_any_element(resource: &[Value], pattern: &Value, path: &str) -> Result<(), Mismatch> {
    let mut last = None;
    for (i, element) in resource.iter().enumerate() {
        match validate_element(element, pattern, &format!("{path}{i}/")) {
            Ok(()) => return Ok(()),
            Err(error) => last = Some(error),
        }
    }
    Err(last.unwrap_or_else(|| mismatch(path, "no array element matches the pattern")))
}

fn validate_metadata(resource: &Value, pattern: &Value) -> Result<(), Mismatch> {
    let (Some(resource), Some(pattern)) = (
        resource.get("metadata").and_then(Value::as_object),
        pattern.get("metadata").and_then(Value::as_object),
    ) else {
        return Ok(());
    };

    let fields = |key: &str| {
        resource
            .get(key)
            .and_then(Value::as_object)
            .zip(pattern.get(key).and_then(Value::as_object))
    };

    if let Some((resource, pattern)) = fields("labels") {
        for (key, value) in resource {
            if MANAGED_LABEL_DOMAINS.iter().any(|d| key.contains(d)) {
                continue;
            }
            compare_entry("label", key, value, pattern)?;
        }
    }

    if let Some((resource, pattern)) = fields("annotations") {
        for (key, value) in resource {
            compare_entry("annotation", key, value, pattern)?;
        }
    }

    Ok(())
}

fn compare_entry(
    field: &str,
    key: &str,
    value: &Value,
    pattern: &Map<String, Value>,
) -> Result<(), Mismatch> {
    match pattern.get(key) {
        None => Err(mismatch(
            "/metadata/",
            format!("{field} key '{key}' not present in pattern"),
        )),
        Some(p) if p != value => Err(mismatch(
            "/metadata/",
            format!("{field} value '{value}' is different for key '{key}' in pattern"),
        )),
        Some(_) => Ok(()),
    }
}

fn mismatch(path: &str, message: impl Into<String>) -> Mismatch {
    let message = message.into();
    tracing::trace!(%path, %message, "Pattern mismatch");
    Mismatch {
        path: path.to_string(),
        message,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}
