//! The expression evaluator.
//!
//! Expressions are JSON: scalars and arrays are literals, and an object
//! with a `"type"` key is a form. Objects without a `"type"` key are
//! literal maps and not evaluated inside. Forms not known to the
//! evaluator are looked up in the function map supplied by the caller;
//! the analysis engine uses this to provide `outs` and `runfiles` over
//! its dependency resolver.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::configuration::Configuration;
use crate::error::{EvalError, Result};
use crate::value::Value;

/// A host function: receives the evaluator (for evaluating argument
/// fields), the configuration and the raw form.
pub type HostFunction =
    Arc<dyn Fn(&Evaluator, &Configuration, &serde_json::Value) -> Result<Value> + Send + Sync>;

/// Named host functions available during an evaluation.
#[derive(Clone, Default)]
pub struct FunctionMap {
    functions: HashMap<String, HostFunction>,
}

impl FunctionMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function under a form name.
    #[must_use]
    pub fn with(mut self, name: &str, function: HostFunction) -> Self {
        self.functions.insert(name.to_string(), function);
        self
    }

    fn get(&self, name: &str) -> Option<&HostFunction> {
        self.functions.get(name)
    }
}

/// Pure evaluator over JSON expressions.
pub struct Evaluator<'a> {
    functions: &'a FunctionMap,
}

impl<'a> Evaluator<'a> {
    #[must_use]
    pub fn new(functions: &'a FunctionMap) -> Self {
        Self { functions }
    }

    /// Evaluate an expression against a configuration.
    pub fn eval(&self, expr: &serde_json::Value, config: &Configuration) -> Result<Value> {
        match expr {
            serde_json::Value::Array(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|item| self.eval(item, config))
                    .collect::<Result<_>>()?,
            )),
            serde_json::Value::Object(map) => match map.get("type").and_then(|t| t.as_str()) {
                Some(form) => self.eval_form(form, expr, config),
                None => Ok(Value::from_json(expr)),
            },
            literal => Ok(Value::from_json(literal)),
        }
    }

    fn eval_form(
        &self,
        form: &str,
        expr: &serde_json::Value,
        config: &Configuration,
    ) -> Result<Value> {
        match form {
            "var" => {
                let name = required_str(expr, "var", "name")?;
                let value = config.get(name);
                if value == Value::Null {
                    match expr.get("default") {
                        Some(default) => self.eval(default, config),
                        None => Ok(Value::Null),
                    }
                } else {
                    Ok(value)
                }
            }
            "if" => {
                let cond = self.eval(required(expr, "if", "cond")?, config)?;
                if cond.is_true() {
                    self.eval(required(expr, "if", "then")?, config)
                } else {
                    match expr.get("else") {
                        Some(e) => self.eval(e, config),
                        None => Ok(Value::List(vec![])),
                    }
                }
            }
            "==" => {
                let lhs = self.eval(required(expr, "==", "$1")?, config)?;
                let rhs = self.eval(required(expr, "==", "$2")?, config)?;
                Ok(Value::Bool(lhs == rhs))
            }
            "++" => {
                let lists = self.eval(required(expr, "++", "$1")?, config)?;
                let mut flat = Vec::new();
                for item in lists.as_list()? {
                    flat.extend_from_slice(item.as_list()?);
                }
                Ok(Value::List(flat))
            }
            "join" => {
                let items = self.eval(required(expr, "join", "$1")?, config)?;
                let separator = match expr.get("separator") {
                    Some(s) => self.eval(s, config)?.as_str()?.to_string(),
                    None => String::new(),
                };
                let strings: Vec<&str> = items
                    .as_list()?
                    .iter()
                    .map(Value::as_str)
                    .collect::<Result<_>>()?;
                Ok(Value::String(strings.join(&separator)))
            }
            "singleton_map" => {
                let key = self.eval(required(expr, "singleton_map", "key")?, config)?;
                let value = self.eval(required(expr, "singleton_map", "value")?, config)?;
                let mut map = BTreeMap::new();
                map.insert(key.as_str()?.to_string(), value);
                Ok(Value::Map(map))
            }
            "map_union" => {
                let maps = self.eval(required(expr, "map_union", "$1")?, config)?;
                let mut union = BTreeMap::new();
                for item in maps.as_list()? {
                    for (key, value) in item.as_map()? {
                        union.insert(key.clone(), value.clone());
                    }
                }
                Ok(Value::Map(union))
            }
            "foreach" => {
                let var = required_str(expr, "foreach", "var")?;
                let range = self.eval(required(expr, "foreach", "range")?, config)?;
                let body = required(expr, "foreach", "body")?;
                let mut out = Vec::new();
                for item in range.as_list()? {
                    let mut binding = BTreeMap::new();
                    binding.insert(var.to_string(), item.clone());
                    out.push(self.eval(body, &config.update(&binding))?);
                }
                Ok(Value::List(out))
            }
            other => match self.functions.get(other) {
                Some(function) => function(self, config, expr),
                None => Err(EvalError::UnknownForm(other.to_string())),
            },
        }
    }
}

fn required<'e>(
    expr: &'e serde_json::Value,
    form: &str,
    field: &str,
) -> Result<&'e serde_json::Value> {
    expr.get(field).ok_or_else(|| EvalError::Malformed {
        form: form.to_string(),
        reason: format!("missing field `{field}`"),
    })
}

fn required_str<'e>(expr: &'e serde_json::Value, form: &str, field: &str) -> Result<&'e str> {
    required(expr, form, field)?
        .as_str()
        .ok_or_else(|| EvalError::Malformed {
            form: form.to_string(),
            reason: format!("field `{field}` must be a string"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expr: serde_json::Value, config: serde_json::Value) -> Result<Value> {
        let functions = FunctionMap::new();
        Evaluator::new(&functions).eval(&expr, &Configuration::from_json(&config))
    }

    #[test]
    fn literals_pass_through() {
        assert_eq!(
            eval(serde_json::json!("plain"), serde_json::json!({})).unwrap(),
            Value::String("plain".to_string())
        );
        assert_eq!(
            eval(serde_json::json!([1, 2]), serde_json::json!({})).unwrap(),
            Value::List(vec![Value::Number(1.0), Value::Number(2.0)])
        );
    }

    #[test]
    fn var_reads_the_configuration() {
        let expr = serde_json::json!({"type": "var", "name": "OS"});
        assert_eq!(
            eval(expr.clone(), serde_json::json!({"OS": "linux"})).unwrap(),
            Value::String("linux".to_string())
        );
        assert_eq!(eval(expr, serde_json::json!({})).unwrap(), Value::Null);
        let with_default = serde_json::json!({"type": "var", "name": "OS", "default": "any"});
        assert_eq!(
            eval(with_default, serde_json::json!({})).unwrap(),
            Value::String("any".to_string())
        );
    }

    #[test]
    fn conditionals_and_equality() {
        let expr = serde_json::json!({
            "type": "if",
            "cond": {"type": "==", "$1": {"type": "var", "name": "OS"}, "$2": "linux"},
            "then": "gcc",
            "else": "clang",
        });
        assert_eq!(
            eval(expr.clone(), serde_json::json!({"OS": "linux"})).unwrap(),
            Value::String("gcc".to_string())
        );
        assert_eq!(
            eval(expr, serde_json::json!({"OS": "mac"})).unwrap(),
            Value::String("clang".to_string())
        );
    }

    #[test]
    fn join_and_concatenation() {
        let expr = serde_json::json!({
            "type": "join",
            "$1": {"type": "++", "$1": [["echo"], ["hello", "world"]]},
            "separator": " ",
        });
        assert_eq!(
            eval(expr, serde_json::json!({})).unwrap(),
            Value::String("echo hello world".to_string())
        );
    }

    #[test]
    fn foreach_binds_the_variable() {
        let expr = serde_json::json!({
            "type": "foreach",
            "var": "x",
            "range": ["a", "b"],
            "body": {"type": "join", "$1": [{"type": "var", "name": "x"}, ".o"]},
        });
        let result = eval(expr, serde_json::json!({})).unwrap();
        assert_eq!(
            result,
            Value::List(vec![
                Value::String("a.o".to_string()),
                Value::String("b.o".to_string())
            ])
        );
    }

    #[test]
    fn host_functions_are_dispatched() {
        let functions = FunctionMap::new().with(
            "shout",
            Arc::new(|evaluator: &Evaluator, config: &Configuration, expr: &serde_json::Value| {
                let inner = evaluator.eval(
                    expr.get("$1").ok_or(EvalError::Function("missing $1".to_string()))?,
                    config,
                )?;
                Ok(Value::String(inner.as_str()?.to_uppercase()))
            }),
        );
        let evaluator = Evaluator::new(&functions);
        let result = evaluator
            .eval(
                &serde_json::json!({"type": "shout", "$1": "quiet"}),
                &Configuration::empty(),
            )
            .unwrap();
        assert_eq!(result, Value::String("QUIET".to_string()));
    }

    #[test]
    fn unknown_forms_are_errors() {
        let err = eval(serde_json::json!({"type": "nope"}), serde_json::json!({})).unwrap_err();
        assert!(matches!(err, EvalError::UnknownForm(_)));
    }

    #[test]
    fn maps_without_type_are_literal() {
        let expr = serde_json::json!({"key": {"type": "var", "name": "X"}});
        // The inner form is not evaluated; the map is data.
        let result = eval(expr, serde_json::json!({"X": "value"})).unwrap();
        let map = result.as_map().unwrap();
        assert!(matches!(map.get("key"), Some(Value::Map(_))));
    }
}
