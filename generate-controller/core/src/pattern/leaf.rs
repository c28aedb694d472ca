use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Number, Value};

static IN_RANGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(-?\d+(?:\.\d+)?)-(-?\d+(?:\.\d+)?)$").expect("range pattern must compile")
});

static NOT_IN_RANGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(-?\d+(?:\.\d+)?)!-(-?\d+(?:\.\d+)?)$").expect("range pattern must compile")
});

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Operator {
    Equal,
    NotEqual,
    More,
    Less,
    MoreEqual,
    LessEqual,
    InRange,
    NotInRange,
}

/// Validates a scalar resource value against a scalar pattern.
pub fn validate(value: &Value, pattern: &Value) -> bool {
    match pattern {
        Value::Bool(p) => value.as_bool() == Some(*p),
        Value::Number(p) => validate_number(value, p),
        Value::Null => validate_null(value),
        Value::Object(_) => value.is_object(),
        Value::String(p) => validate_string_patterns(value, p),
        Value::Array(_) => false,
    }
}

fn validate_number(value: &Value, pattern: &Number) -> bool {
    if let Some(p) = pattern.as_i64() {
        return match value {
            Value::Number(n) => match n.as_i64() {
                Some(v) => v == p,
                None => n
                    .as_f64()
                    .map(|v| v.fract() == 0.0 && v == p as f64)
                    .unwrap_or(false),
            },
            Value::String(s) => s.parse::<i64>().map(|v| v == p).unwrap_or(false),
            _ => false,
        };
    }

    let Some(p) = pattern.as_f64() else {
        return false;
    };
    match value {
        Value::Number(n) if n.is_f64() => n.as_f64() == Some(p),
        Value::Number(n) => p.fract() == 0.0 && n.as_f64() == Some(p),
        Value::String(s) => s.parse::<f64>().map(|v| v == p).unwrap_or(false),
        _ => false,
    }
}

fn validate_null(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

fn validate_string_patterns(value: &Value, pattern: &str) -> bool {
    if value.as_str() == Some(pattern) {
        return true;
    }
    pattern.split('|').any(|any| {
        any.trim()
            .split('&')
            .all(|cond| validate_string_pattern(value, cond.trim()))
    })
}

fn validate_string_pattern(value: &Value, pattern: &str) -> bool {
    let (op, rest) = operator(pattern);
    match op {
        Operator::InRange => match split_range(&IN_RANGE, pattern) {
            Some((lo, hi)) => {
                validate_string(value, lo, Operator::MoreEqual)
                    && validate_string(value, hi, Operator::LessEqual)
            }
            None => false,
        },
        Operator::NotInRange => match split_range(&NOT_IN_RANGE, pattern) {
            Some((lo, hi)) => {
                validate_string(value, lo, Operator::Less)
                    || validate_string(value, hi, Operator::More)
            }
            None => false,
        },
        op => validate_string(value, rest.trim(), op),
    }
}

fn operator(pattern: &str) -> (Operator, &str) {
    if pattern.len() < 2 {
        return (Operator::Equal, pattern);
    }
    for (prefix, op) in [
        (">=", Operator::MoreEqual),
        ("<=", Operator::LessEqual),
        (">", Operator::More),
        ("<", Operator::Less),
        ("!", Operator::NotEqual),
    ] {
        if let Some(rest) = pattern.strip_prefix(prefix) {
            return (op, rest);
        }
    }
    if NOT_IN_RANGE.is_match(pattern) {
        return (Operator::NotInRange, pattern);
    }
    if IN_RANGE.is_match(pattern) {
        return (Operator::InRange, pattern);
    }
    (Operator::Equal, pattern)
}

fn split_range<'p>(re: &Regex, pattern: &'p str) -> Option<(&'p str, &'p str)> {
    let caps = re.captures(pattern)?;
    Some((caps.get(1)?.as_str(), caps.get(2)?.as_str()))
}

fn validate_string(value: &Value, pattern: &str, op: Operator) -> bool {
    if let Some(result) = compare_numbers(value, pattern, op) {
        return result;
    }

    let value = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return false,
    };
    match op {
        Operator::Equal => wildcard_match(pattern, &value),
        Operator::NotEqual => !wildcard_match(pattern, &value),
        _ => false,
    }
}

/// Compares numerically when both sides are numbers. Returns `None` when
/// either side is not numeric.
fn compare_numbers(value: &Value, pattern: &str, op: Operator) -> Option<bool> {
    let pattern = pattern.parse::<f64>().ok()?;
    let value = match value {
        Value::Null => 0.0,
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.parse::<f64>().ok()?,
        _ => return None,
    };
    let result = match op {
        Operator::Equal => value == pattern,
        Operator::NotEqual => value != pattern,
        Operator::More => value > pattern,
        Operator::Less => value < pattern,
        Operator::MoreEqual => value >= pattern,
        Operator::LessEqual => value <= pattern,
        Operator::InRange | Operator::NotInRange => return None,
    };
    Some(result)
}

/// Matches `text` against a glob where `*` matches any run of characters and
/// `?` matches exactly one.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.chars().collect::<Vec<_>>();
    let text = text.chars().collect::<Vec<_>>();
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wildcards() {
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("nginx:*", "nginx:1.25"));
        assert!(wildcard_match("a?c", "abc"));
        assert!(!wildcard_match("a?c", "abbc"));
        assert!(wildcard_match("*-prod-*", "team-prod-1"));
        assert!(!wildcard_match("prod", "production"));
    }

    #[test]
    fn scalars() {
        assert!(validate(&json!(true), &json!(true)));
        assert!(!validate(&json!("true"), &json!(true)));
        assert!(validate(&json!(3), &json!(3)));
        assert!(validate(&json!(3.0), &json!(3)));
        assert!(validate(&json!("3"), &json!(3)));
        assert!(!validate(&json!(3.5), &json!(3)));
        assert!(validate(&json!(2.5), &json!(2.5)));
        assert!(validate(&json!("2.5"), &json!(2.5)));
        assert!(validate(&json!({"a": 1}), &json!({})));
        assert!(!validate(&json!([1]), &json!([1])));
    }

    #[test]
    fn null_pattern() {
        for zero in [json!(null), json!(0), json!(""), json!(false)] {
            assert!(validate(&zero, &json!(null)), "{zero}");
        }
        for non_zero in [json!(1), json!("x"), json!(true), json!({}), json!([])] {
            assert!(!validate(&non_zero, &json!(null)), "{non_zero}");
        }
    }

    #[test]
    fn string_operators() {
        let cases = [
            (json!(5), ">3", true),
            (json!(5), ">=5", true),
            (json!(5), "<5", false),
            (json!("5"), "<=5", true),
            (json!(5), "!5", false),
            (json!("dev"), "!prod", true),
            (json!("prod"), "!prod", false),
            (json!(5), "1-10", true),
            (json!(11), "1-10", false),
            (json!(11), "1!-10", true),
            (json!(5), "1!-10", false),
            (json!("dev"), "prod | dev", true),
            (json!("dev"), "prod | staging", false),
            (json!(5), ">1 & <10", true),
            (json!(50), ">1 & <10", false),
            (json!("abc"), "a*", true),
            (json!(null), "*", false),
            (json!("x"), ">1", false),
        ];
        for (value, pattern, expected) in cases {
            assert_eq!(
                validate(&value, &json!(pattern)),
                expected,
                "{value} against {pattern}"
            );
        }
    }
}
