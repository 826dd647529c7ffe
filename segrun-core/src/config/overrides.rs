//! `key=value` overrides and their resolution to parameter groups.

use super::{Configuration, unknown_field};
use crate::error::SchemaError;
use serde_json::Value;
use std::collections::BTreeMap;

/// Ordered override pairs as supplied by the user or the tracking service.
///
/// Keys are either qualified (`run.architecture`) or bare (`architecture`);
/// later pairs win over earlier ones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    entries: Vec<(String, Value)>,
}

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `key=value` strings, e.g. from the command line.
    pub fn parse<I, S>(pairs: I) -> Result<Self, SchemaError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = Self::new();
        for pair in pairs {
            let raw = pair.as_ref();
            let (key, value) = raw
                .split_once('=')
                .filter(|(key, _)| !key.trim().is_empty())
                .ok_or_else(|| SchemaError::MalformedOverride {
                    raw: raw.to_string(),
                })?;
            overrides.set(key.trim(), parse_value(value));
        }
        Ok(overrides)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.entries.push((key.into(), value.into()));
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Qualify every key with its group and check it exists.
    pub fn resolve(&self) -> Result<ResolvedOverrides, SchemaError> {
        let schema = Configuration::schema();
        let mut resolved = ResolvedOverrides::default();

        for (key, value) in &self.entries {
            let (group, field) = match key.split_once('.') {
                Some((group, field)) => {
                    let (prefix, fields) = schema
                        .iter()
                        .find(|(prefix, _)| *prefix == group)
                        .ok_or_else(|| unknown_field(key.as_str()))?;
                    if !fields.contains(&field) {
                        return Err(unknown_field(key.as_str()));
                    }
                    (*prefix, field)
                }
                None => {
                    let candidates: Vec<&'static str> = schema
                        .iter()
                        .filter(|(_, fields)| fields.contains(&key.as_str()))
                        .map(|(prefix, _)| *prefix)
                        .collect();
                    match candidates.as_slice() {
                        [] => return Err(unknown_field(key.as_str())),
                        [prefix] => (*prefix, key.as_str()),
                        _ => {
                            return Err(SchemaError::AmbiguousField {
                                field: key.clone(),
                                candidates: candidates
                                    .iter()
                                    .map(|prefix| format!("{prefix}.{key}"))
                                    .collect(),
                            });
                        }
                    }
                }
            };
            resolved
                .groups
                .entry(group)
                .or_default()
                .insert(field.to_string(), value.clone());
        }

        Ok(resolved)
    }
}

/// Overrides keyed by group prefix, then field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedOverrides {
    groups: BTreeMap<&'static str, BTreeMap<String, Value>>,
}

impl ResolvedOverrides {
    pub fn group(&self, prefix: &str) -> Option<&BTreeMap<String, Value>> {
        self.groups.get(prefix)
    }

    /// Remove and return one group's fields.
    pub fn take_group(&mut self, prefix: &str) -> BTreeMap<String, Value> {
        self.groups.remove(prefix).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &BTreeMap<String, Value>)> {
        self.groups.iter().map(|(prefix, fields)| (*prefix, fields))
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub(crate) fn into_layer(self) -> BTreeMap<&'static str, BTreeMap<String, Value>> {
        self.groups
    }
}

/// Parse an override value: JSON when it parses, a plain string otherwise.
///
/// Tuple notation `(32,32)` is read as a sequence.
pub fn parse_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    let candidate = match trimmed.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        Some(inner) => format!("[{inner}]"),
        None => trimmed.to_string(),
    };
    serde_json::from_str(&candidate).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_values() {
        assert_eq!(parse_value("SegNet"), json!("SegNet"));
        assert_eq!(parse_value("3e-4"), json!(3e-4));
        assert_eq!(parse_value("true"), json!(true));
        assert_eq!(parse_value("(32, 32)"), json!([32, 32]));
        assert_eq!(parse_value("[0.9, 0.99]"), json!([0.9, 0.99]));
        assert_eq!(parse_value("null"), Value::Null);
    }

    #[test]
    fn test_parse_pairs() {
        let overrides = Overrides::parse(["architecture=SegNet", "run.gpu=0"]).unwrap();
        let pairs: Vec<_> = overrides.iter().collect();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0], ("architecture", &json!("SegNet")));
        assert_eq!(pairs[1], ("run.gpu", &json!(0)));
    }

    #[test]
    fn test_parse_rejects_missing_equals() {
        let err = Overrides::parse(["architecture"]).unwrap_err();
        assert_eq!(
            err,
            SchemaError::MalformedOverride {
                raw: "architecture".into()
            }
        );
        assert!(Overrides::parse(["=SegNet"]).is_err());
    }

    #[test]
    fn test_value_may_contain_equals() {
        let overrides = Overrides::parse(["weights_path=a=b"]).unwrap();
        assert_eq!(overrides.iter().next(), Some(("weights_path", &json!("a=b"))));
    }

    #[test]
    fn test_resolve_bare_and_qualified_keys() {
        let resolved = Overrides::new()
            .with("architecture", "SegNet")
            .with("backbone", "vit")
            .with("optim.max_epochs", 10)
            .resolve()
            .unwrap();
        assert_eq!(resolved.group("run").unwrap()["architecture"], json!("SegNet"));
        assert_eq!(resolved.group("network").unwrap()["backbone"], json!("vit"));
        assert_eq!(resolved.group("optim").unwrap()["max_epochs"], json!(10));
        assert!(resolved.group("data").is_none());
    }

    #[test]
    fn test_resolve_unknown_key() {
        let err = Overrides::new().with("colour", "red").resolve().unwrap_err();
        assert_eq!(err, SchemaError::UnknownField { field: "colour".into() });

        let err = Overrides::new().with("run.colour", "red").resolve().unwrap_err();
        assert_eq!(err, SchemaError::UnknownField { field: "run.colour".into() });

        let err = Overrides::new().with("paint.colour", "red").resolve().unwrap_err();
        assert_eq!(err, SchemaError::UnknownField { field: "paint.colour".into() });
    }

    #[test]
    fn test_resolve_ambiguous_key() {
        let err = Overrides::new().with("max_epochs", 3).resolve().unwrap_err();
        assert_eq!(
            err,
            SchemaError::AmbiguousField {
                field: "max_epochs".into(),
                candidates: vec!["run.max_epochs".into(), "optim.max_epochs".into()],
            }
        );
    }

    #[test]
    fn test_later_pairs_win() {
        let resolved = Overrides::new()
            .with("gpu", 2)
            .with("run.gpu", 0)
            .resolve()
            .unwrap();
        assert_eq!(resolved.group("run").unwrap()["gpu"], json!(0));
    }
}
