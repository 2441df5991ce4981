//! Variable substitution for templates, scripts and config values.
//!
//! `$NAME`, `$(NAME)` and `${NAME}` all resolve against a [`Variables`] map.
//! Names are normalized to uppercase; an unresolved reference is an error.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value as Json;

use crate::{Error, Result};

static VAR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\$(?:([a-z0-9]+(?:_[a-z0-9]+)*)|\(([\w-]+)\)|\{([\w-]+)\})").expect("static regex")
});

/// Uppercase-keyed variable map threaded through the reconciliation core.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variables {
    values: BTreeMap<String, Json>,
}

impl Variables {
    pub fn new() -> Self { Self::default() }

    /// Snapshot of the process environment. Taken once at startup so nothing
    /// downstream reads ambient state.
    pub fn from_env() -> Self {
        let mut vars = Self::new();
        for (k, v) in std::env::vars() {
            vars.set(&k, v);
        }
        vars
    }

    pub fn set(&mut self, name: &str, value: impl Into<Json>) {
        self.values.insert(name.to_uppercase(), value.into());
    }

    pub fn with(mut self, name: &str, value: impl Into<Json>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Json> { self.values.get(&name.to_uppercase()) }

    pub fn get_str(&self, name: &str) -> Option<String> { self.get(name).map(render) }

    pub fn contains(&self, name: &str) -> bool { self.values.contains_key(&name.to_uppercase()) }

    /// Value of `name` parsed as `T`; absent or unparsable values are `None`.
    pub fn parse<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        self.get_str(name).and_then(|s| s.trim().parse().ok())
    }

    pub fn extend(&mut self, other: &Variables) {
        for (k, v) in other.values.iter() {
            self.values.insert(k.clone(), v.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Json)> { self.values.iter() }
}

fn render(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        Json::Null => String::new(),
        other => other.to_string(),
    }
}

fn captured_name<'t>(caps: &Captures<'t>) -> &'t str {
    caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)).map(|m| m.as_str()).unwrap_or("")
}

/// Uppercase names of every variable `input` refers to, in order of appearance.
pub fn referenced_names(input: &str) -> Vec<String> {
    VAR_RE.captures_iter(input).map(|caps| captured_name(&caps).to_uppercase()).collect()
}

/// Replace every variable reference in `input`.
pub fn substitute_text(input: &str, vars: &Variables) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in VAR_RE.captures_iter(input) {
        let Some(whole) = caps.get(0) else { continue };
        let name = captured_name(&caps).to_uppercase();
        let value = vars.get(&name).ok_or_else(|| Error::config(format!("The variable \"{}\" is not defined.", name)))?;
        out.push_str(&input[last..whole.start()]);
        out.push_str(&render(value));
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}

/// Recursively substitute every string inside a JSON value.
///
/// A string consisting of exactly one reference to a non-string variable keeps
/// the variable's type, so `"$NODE_PORT"` stays a number in request bodies.
pub fn substitute_value(value: &Json, vars: &Variables) -> Result<Json> {
    Ok(match value {
        Json::String(s) => {
            if let Some(caps) = VAR_RE.captures(s) {
                if caps.get(0).is_some_and(|whole| whole.start() == 0 && whole.end() == s.len()) {
                    let name = captured_name(&caps).to_uppercase();
                    match vars.get(&name) {
                        Some(v) if !v.is_string() && !v.is_null() => return Ok(v.clone()),
                        _ => {}
                    }
                }
            }
            Json::String(substitute_text(s, vars)?)
        }
        Json::Array(items) => Json::Array(items.iter().map(|v| substitute_value(v, vars)).collect::<Result<_>>()?),
        Json::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map.iter() {
                out.insert(k.clone(), substitute_value(v, vars)?);
            }
            Json::Object(out)
        }
        other => other.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Variables {
        Variables::new().with("name", "shop").with("NODE_PORT", 31000).with("host_name", "api.example.com")
    }

    #[test]
    fn lists_references() {
        assert_eq!(referenced_names(r#"["--service", "$(endpoint_name)", "${Endpoint_Version}", "$$x", "$APP_PORT"]"#), vec![
            "ENDPOINT_NAME",
            "ENDPOINT_VERSION",
            "X",
            "APP_PORT",
        ]);
        assert!(referenced_names("no refs here").is_empty());
    }

    #[test]
    fn typed_lookup() {
        let v = vars().with("POLL_MS", " 250 ").with("BAD", "x");
        assert_eq!(v.parse::<u16>("node_port"), Some(31000));
        assert_eq!(v.parse::<u64>("poll_ms"), Some(250));
        assert_eq!(v.parse::<u64>("bad"), None);
        assert_eq!(v.parse::<u64>("missing"), None);
    }

    #[test]
    fn all_reference_forms_resolve_case_insensitively() {
        let v = vars();
        assert_eq!(substitute_text("$NAME-hc", &v).unwrap(), "shop-hc");
        assert_eq!(substitute_text("$(name)-map", &v).unwrap(), "shop-map");
        assert_eq!(substitute_text("${Host_Name}/x", &v).unwrap(), "api.example.com/x");
        assert_eq!(substitute_text("port=$NODE_PORT", &v).unwrap(), "port=31000");
        assert_eq!(substitute_text("no refs here", &v).unwrap(), "no refs here");
    }

    #[test]
    fn unresolved_reference_is_an_error() {
        let err = substitute_text("$MISSING", &vars()).unwrap_err();
        assert!(err.to_string().contains("\"MISSING\" is not defined"), "{}", err);
    }

    #[test]
    fn whole_string_reference_keeps_type() {
        let body = json!({"port": "$NODE_PORT", "name": "$NAME", "list": ["${NAME}-a", "$(node_port)"], "n": 3});
        let out = substitute_value(&body, &vars()).unwrap();
        assert_eq!(out, json!({"port": 31000, "name": "shop", "list": ["shop-a", 31000], "n": 3}));
    }

    #[test]
    fn object_key_order_is_preserved() {
        let body = json!({"z": "$NAME", "a": 1, "m": "x"});
        let out = substitute_value(&body, &vars()).unwrap();
        let keys: Vec<_> = out.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }
}
