//! Substitution expression evaluation
//!
//! Expressions are `${name}` or `${a.b.c}` references. A string that is
//! exactly one reference is replaced by the referenced value with its type
//! preserved; references embedded in a larger string interpolate scalar
//! values as text. Unresolved references pass through verbatim, so
//! evaluation is idempotent once every resolvable reference is gone.
//! Interpolating a non-scalar into a string is a hard error.

use anyhow::{bail, Result};
use regex::Regex;
use serde_yaml_ng::{Mapping, Value};
use std::collections::HashMap;
use std::sync::OnceLock;

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z0-9_][A-Za-z0-9_.-]*)\}").expect("reference pattern is valid")
    })
}

/// Lookup scope for one evaluation pass: the substitution set plus the
/// exposed environment variables
pub struct Scope<'a> {
    values: &'a Mapping,
    environment: &'a HashMap<String, String>,
}

impl<'a> Scope<'a> {
    pub fn new(values: &'a Mapping, environment: &'a HashMap<String, String>) -> Self {
        Self {
            values,
            environment,
        }
    }

    fn lookup(&self, reference: &str) -> Option<Value> {
        if let Some(value) = self.lookup_path(reference) {
            return Some(value);
        }
        self.environment
            .get(reference)
            .map(|value| Value::String(value.clone()))
    }

    /// Dotted-path lookup into the substitution set
    fn lookup_path(&self, reference: &str) -> Option<Value> {
        let mut current: Option<&Value> = None;
        for segment in reference.split('.') {
            current = Some(match current {
                None => self.values.get(segment)?,
                Some(value) => value.as_mapping()?.get(segment)?,
            });
        }
        current.cloned()
    }
}

/// Evaluate one pass over a value tree
pub fn evaluate(value: &Value, scope: &Scope<'_>) -> Result<Value> {
    match value {
        Value::String(s) => evaluate_string(s, scope),
        Value::Mapping(mapping) => {
            let mut out = Mapping::new();
            for (key, child) in mapping {
                out.insert(key.clone(), evaluate(child, scope)?);
            }
            Ok(Value::Mapping(out))
        }
        Value::Sequence(items) => items
            .iter()
            .map(|item| evaluate(item, scope))
            .collect::<Result<Vec<_>>>()
            .map(Value::Sequence),
        other => Ok(other.clone()),
    }
}

fn evaluate_string(s: &str, scope: &Scope<'_>) -> Result<Value> {
    let pattern = reference_pattern();

    // A whole-string reference keeps the referenced value's type
    if let Some(captures) = pattern.captures(s) {
        let whole = captures.get(0).expect("capture 0 always present");
        if whole.start() == 0 && whole.end() == s.len() {
            return Ok(scope
                .lookup(&captures[1])
                .unwrap_or_else(|| Value::String(s.to_string())));
        }
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for captures in pattern.captures_iter(s) {
        let whole = captures.get(0).expect("capture 0 always present");
        out.push_str(&s[last..whole.start()]);

        let reference = &captures[1];
        match scope.lookup(reference) {
            Some(value) => match scalar_text(&value) {
                Some(text) => out.push_str(&text),
                None => bail!(
                    "cannot interpolate non-scalar value {:?} into a string",
                    reference
                ),
            },
            // Unresolved references pass through
            None => out.push_str(whole.as_str()),
        }
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(yaml: &str) -> Mapping {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    fn eval_str(s: &str, set: &Mapping, env: &HashMap<String, String>) -> Value {
        evaluate(&Value::String(s.to_string()), &Scope::new(set, env)).unwrap()
    }

    #[test]
    fn test_whole_string_reference_preserves_type() {
        let set = values("count: 3\nenabled: true\nlimits:\n  cpu: 2\n");
        let env = HashMap::new();

        assert_eq!(eval_str("${count}", &set, &env), Value::Number(3.into()));
        assert_eq!(eval_str("${enabled}", &set, &env), Value::Bool(true));
        // Whole-string reference to a mapping substitutes the subtree
        let limits = eval_str("${limits}", &set, &env);
        assert_eq!(limits.get("cpu"), Some(&Value::Number(2.into())));
    }

    #[test]
    fn test_embedded_reference_interpolates() {
        let set = values("host: db.internal\nport: 5432\n");
        let env = HashMap::new();

        assert_eq!(
            eval_str("postgres://${host}:${port}/app", &set, &env),
            Value::String("postgres://db.internal:5432/app".to_string())
        );
    }

    #[test]
    fn test_unresolved_reference_passes_through() {
        let set = values("host: a\n");
        let env = HashMap::new();

        assert_eq!(
            eval_str("${missing}", &set, &env),
            Value::String("${missing}".to_string())
        );
        assert_eq!(
            eval_str("x-${missing}-y", &set, &env),
            Value::String("x-${missing}-y".to_string())
        );
    }

    #[test]
    fn test_dotted_path_lookup() {
        let set = values("app:\n  image:\n    tag: v1.2.3\n");
        let env = HashMap::new();

        assert_eq!(
            eval_str("${app.image.tag}", &set, &env),
            Value::String("v1.2.3".to_string())
        );
    }

    #[test]
    fn test_environment_fallback() {
        let set = values("host: a\n");
        let mut env = HashMap::new();
        env.insert("REGION".to_string(), "eu-west-1".to_string());

        assert_eq!(
            eval_str("${REGION}", &set, &env),
            Value::String("eu-west-1".to_string())
        );
        // The substitution set wins over the environment
        env.insert("host".to_string(), "from-env".to_string());
        assert_eq!(eval_str("${host}", &set, &env), Value::String("a".to_string()));
    }

    #[test]
    fn test_non_scalar_interpolation_is_an_error() {
        let set = values("limits:\n  cpu: 2\n");
        let env = HashMap::new();
        let err = evaluate(
            &Value::String("prefix-${limits}".to_string()),
            &Scope::new(&set, &env),
        )
        .unwrap_err();
        assert!(err.to_string().contains("non-scalar"));
    }

    #[test]
    fn test_evaluation_is_idempotent() {
        let set = values("count: 3\nname: svc\n");
        let env = HashMap::new();
        let doc: Value =
            serde_yaml_ng::from_str("replicas: ${count}\nlabel: app-${name}\nother: ${missing}\n")
                .unwrap();

        let once = evaluate(&doc, &Scope::new(&set, &env)).unwrap();
        let twice = evaluate(&once, &Scope::new(&set, &env)).unwrap();
        assert_eq!(once, twice);
    }
}
