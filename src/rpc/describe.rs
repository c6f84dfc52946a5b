//! Command descriptors and argument binding.
//!
//! Every command carries a [`ParamSpec`]: named positional parameters (a
//! suffix of which may have defaults), an optional catch-all for extra
//! positionals, keyword-only parameters and an optional catch-all for extra
//! keywords. [`ParamSpec::bind`] maps a call's `args`/`kwargs` onto that spec
//! using the usual rules: positionals fill named parameters left to right,
//! keywords fill by name, and defaults fill whatever is left.

use crate::error::{AppResult, ScopeError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Parameter layout of a command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamSpec {
    /// Named parameters, fillable positionally or by keyword.
    pub args: Vec<String>,
    /// Defaults for a trailing run of `args`.
    pub defaults: Map<String, Value>,
    /// Receives surplus positionals, if present.
    pub varargs: Option<String>,
    /// Receives surplus keywords, if present.
    pub varkw: Option<String>,
    /// Parameters that may only be passed by keyword.
    pub kwonlyargs: Vec<String>,
    /// Defaults for keyword-only parameters.
    pub kwonlydefaults: Map<String, Value>,
}

impl ParamSpec {
    /// An empty parameter list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a required positional parameter.
    pub fn arg(mut self, name: impl Into<String>) -> Self {
        self.args.push(name.into());
        self
    }

    /// Adds a positional parameter with a default.
    pub fn arg_default(mut self, name: impl Into<String>, default: Value) -> Self {
        let name = name.into();
        self.defaults.insert(name.clone(), default);
        self.args.push(name);
        self
    }

    /// Collects surplus positionals under `name`.
    pub fn varargs(mut self, name: impl Into<String>) -> Self {
        self.varargs = Some(name.into());
        self
    }

    /// Collects surplus keywords under `name`.
    pub fn varkw(mut self, name: impl Into<String>) -> Self {
        self.varkw = Some(name.into());
        self
    }

    /// Adds a required keyword-only parameter.
    pub fn kwonly(mut self, name: impl Into<String>) -> Self {
        self.kwonlyargs.push(name.into());
        self
    }

    /// Adds a keyword-only parameter with a default.
    pub fn kwonly_default(mut self, name: impl Into<String>, default: Value) -> Self {
        let name = name.into();
        self.kwonlydefaults.insert(name.clone(), default);
        self.kwonlyargs.push(name);
        self
    }

    /// Reject layouts that could never bind unambiguously.
    pub fn check(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        let names = self
            .args
            .iter()
            .chain(&self.kwonlyargs)
            .chain(self.varargs.iter())
            .chain(self.varkw.iter());
        for name in names {
            if name.is_empty() {
                return Err("empty parameter name".to_string());
            }
            if !seen.insert(name.as_str()) {
                return Err(format!("duplicate parameter '{name}'"));
            }
        }
        if let Some(first_default) = self.args.iter().position(|a| self.defaults.contains_key(a)) {
            if let Some(bare) = self.args[first_default..]
                .iter()
                .find(|a| !self.defaults.contains_key(*a))
            {
                return Err(format!(
                    "parameter '{bare}' without a default follows a parameter with one"
                ));
            }
        }
        if let Some(stray) = self.defaults.keys().find(|k| !self.args.contains(*k)) {
            return Err(format!("default given for unknown parameter '{stray}'"));
        }
        if let Some(stray) = self
            .kwonlydefaults
            .keys()
            .find(|k| !self.kwonlyargs.contains(*k))
        {
            return Err(format!("default given for unknown keyword '{stray}'"));
        }
        Ok(())
    }

    /// Map a call onto this layout.
    pub fn bind(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> AppResult<BoundArgs> {
        let mut bound = BoundArgs::default();

        let given = args.len();
        for (index, value) in args.into_iter().enumerate() {
            match self.args.get(index) {
                Some(name) => {
                    bound.values.insert(name.clone(), value);
                }
                None if self.varargs.is_some() => bound.extra_args.push(value),
                None => {
                    return Err(ScopeError::Arguments(format!(
                        "takes {} positional argument(s) but {} were given",
                        self.args.len(),
                        given
                    )))
                }
            }
        }

        for (name, value) in kwargs {
            if self.args.contains(&name) || self.kwonlyargs.contains(&name) {
                if bound.values.contains_key(&name) {
                    return Err(ScopeError::Arguments(format!(
                        "got multiple values for argument '{name}'"
                    )));
                }
                bound.values.insert(name, value);
            } else if self.varkw.is_some() {
                bound.extra_kwargs.insert(name, value);
            } else {
                return Err(ScopeError::Arguments(format!(
                    "got an unexpected keyword argument '{name}'"
                )));
            }
        }

        let mut missing = Vec::new();
        for name in &self.args {
            fill_default(&mut bound, name, &self.defaults, &mut missing);
        }
        for name in &self.kwonlyargs {
            fill_default(&mut bound, name, &self.kwonlydefaults, &mut missing);
        }
        if !missing.is_empty() {
            return Err(ScopeError::Arguments(format!(
                "missing required argument(s): {}",
                missing
                    .iter()
                    .map(|name| format!("'{name}'"))
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        Ok(bound)
    }

    /// Human readable signature, e.g. `(x, speed=1.0, *rest, timeout, **extra)`.
    pub fn signature(&self) -> String {
        let mut parts: Vec<String> = self
            .args
            .iter()
            .map(|name| match self.defaults.get(name) {
                Some(default) => format!("{name}={default}"),
                None => name.clone(),
            })
            .collect();
        match &self.varargs {
            Some(varargs) => parts.push(format!("*{varargs}")),
            None if !self.kwonlyargs.is_empty() => parts.push("*".to_string()),
            None => {}
        }
        parts.extend(self.kwonlyargs.iter().map(|name| match self.kwonlydefaults.get(name) {
            Some(default) => format!("{name}={default}"),
            None => name.clone(),
        }));
        if let Some(varkw) = &self.varkw {
            parts.push(format!("**{varkw}"));
        }
        format!("({})", parts.join(", "))
    }
}

fn fill_default(
    bound: &mut BoundArgs,
    name: &str,
    defaults: &Map<String, Value>,
    missing: &mut Vec<String>,
) {
    if bound.values.contains_key(name) {
        return;
    }
    match defaults.get(name) {
        Some(default) => {
            bound.values.insert(name.to_string(), default.clone());
        }
        None => missing.push(name.to_string()),
    }
}

/// Arguments of one call after binding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundArgs {
    values: Map<String, Value>,
    extra_args: Vec<Value>,
    extra_kwargs: Map<String, Value>,
}

impl BoundArgs {
    /// Deserialize a named parameter.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> AppResult<T> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| ScopeError::Arguments(format!("no parameter named '{name}'")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| ScopeError::Arguments(format!("argument '{name}': {e}")))
    }

    /// The bound value of `name`, if any.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Surplus positionals collected by `varargs`.
    pub fn extra_args(&self) -> &[Value] {
        &self.extra_args
    }

    /// Surplus keywords collected by `varkw`.
    pub fn extra_kwargs(&self) -> &Map<String, Value> {
        &self.extra_kwargs
    }
}

type DescriptorTuple = (String, String, ParamSpec);

/// One entry of the describe listing, sent as `[name, doc, params]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "DescriptorTuple", into = "DescriptorTuple")]
pub struct CommandDescriptor {
    /// Fully qualified dotted name.
    pub name: String,
    /// Human-readable docstring.
    pub doc: String,
    /// Parameter layout.
    pub params: ParamSpec,
}

impl From<DescriptorTuple> for CommandDescriptor {
    fn from((name, doc, params): DescriptorTuple) -> Self {
        Self { name, doc, params }
    }
}

impl From<CommandDescriptor> for DescriptorTuple {
    fn from(descriptor: CommandDescriptor) -> Self {
        (descriptor.name, descriptor.doc, descriptor.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kwargs(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn move_spec() -> ParamSpec {
        ParamSpec::new()
            .arg("x")
            .arg_default("speed", json!(1.0))
            .kwonly_default("timeout", json!(null))
    }

    #[test]
    fn test_bind_positional_and_defaults() {
        let bound = move_spec().bind(vec![json!(10)], Map::new()).unwrap();
        assert_eq!(bound.get::<i64>("x").unwrap(), 10);
        assert_eq!(bound.get::<f64>("speed").unwrap(), 1.0);
        assert_eq!(bound.get::<Option<f64>>("timeout").unwrap(), None);
    }

    #[test]
    fn test_bind_keywords() {
        let bound = move_spec()
            .bind(Vec::new(), kwargs(&[("x", json!(3)), ("timeout", json!(2.5))]))
            .unwrap();
        assert_eq!(bound.get::<i64>("x").unwrap(), 3);
        assert_eq!(bound.get::<f64>("timeout").unwrap(), 2.5);
    }

    #[test]
    fn test_bind_errors() {
        let spec = move_spec();
        let err = spec.bind(Vec::new(), Map::new()).unwrap_err();
        assert!(err.to_string().contains("'x'"));

        let err = spec
            .bind(vec![json!(1)], kwargs(&[("x", json!(2))]))
            .unwrap_err();
        assert!(err.to_string().contains("multiple values"));

        let err = spec
            .bind(vec![json!(1)], kwargs(&[("bogus", json!(2))]))
            .unwrap_err();
        assert!(err.to_string().contains("unexpected keyword argument 'bogus'"));

        let err = spec
            .bind(vec![json!(1), json!(2), json!(3)], Map::new())
            .unwrap_err();
        assert!(err.to_string().contains("takes 2 positional"));
    }

    #[test]
    fn test_bind_catch_alls() {
        let spec = ParamSpec::new().arg("a").varargs("rest").varkw("extra");
        let bound = spec
            .bind(vec![json!(1), json!(2), json!(3)], kwargs(&[("z", json!(true))]))
            .unwrap();
        assert_eq!(bound.extra_args(), &[json!(2), json!(3)]);
        assert_eq!(bound.extra_kwargs().get("z"), Some(&json!(true)));
    }

    #[test]
    fn test_check_rejects_bad_layouts() {
        let mut spec = ParamSpec::new().arg_default("a", json!(1)).arg("b");
        assert!(spec.check().is_err());
        spec = ParamSpec::new().arg("a").kwonly("a");
        assert!(spec.check().is_err());
        assert!(move_spec().check().is_ok());
    }

    #[test]
    fn test_signature() {
        assert_eq!(move_spec().signature(), "(x, speed=1.0, *, timeout=null)");
        let spec = ParamSpec::new().arg("a").varargs("rest").varkw("kw");
        assert_eq!(spec.signature(), "(a, *rest, **kw)");
    }

    #[test]
    fn test_descriptor_wire_form() {
        let descriptor = CommandDescriptor {
            name: "scope.stage.get_x".into(),
            doc: "Current x position.".into(),
            params: ParamSpec::new(),
        };
        let value = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(value[0], json!("scope.stage.get_x"));
        assert_eq!(value[1], json!("Current x position."));
        let back: CommandDescriptor = serde_json::from_value(value).unwrap();
        assert_eq!(back, descriptor);
    }
}
