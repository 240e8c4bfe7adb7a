//! External labels and the label merge applied to every emitted series.

use crate::error::MigrateError;
use crate::types::{Label, Labels};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Fixed label set attached to every emitted series. Parsed once per run.
///
/// Labels are kept sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalLabels(Vec<Label>);

impl ExternalLabels {
    /// Parses a JSON object of string to string, e.g. `{"env":"prod"}`.
    pub fn parse(json: &str) -> Result<Self, MigrateError> {
        let map: BTreeMap<String, String> =
            serde_json::from_str(json).map_err(MigrateError::ExternalLabels)?;
        Ok(Self(
            map.into_iter()
                .map(|(name, value)| Label { name, value })
                .collect(),
        ))
    }

    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        let map: BTreeMap<&str, &str> = pairs.iter().copied().collect();
        Self(map.into_iter().map(|(n, v)| Label::new(n, v)).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    /// Renders the set back as a JSON object.
    pub fn to_json(&self) -> String {
        let map: BTreeMap<&str, &str> = self
            .0
            .iter()
            .map(|l| (l.name.as_str(), l.value.as_str()))
            .collect();
        serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_string())
    }
}

impl FromStr for ExternalLabels {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// What to do when an external label has the same name as a stored label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LabelCollisionPolicy {
    /// Emit both pairs; downstream must cope with the repeated name.
    #[default]
    Append,
    /// Replace the stored value in place and append only the non-colliding external labels.
    ExternalOverrides,
}

impl LabelCollisionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelCollisionPolicy::Append => "append",
            LabelCollisionPolicy::ExternalOverrides => "external-overrides",
        }
    }
}

impl FromStr for LabelCollisionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "append" => Ok(LabelCollisionPolicy::Append),
            "external-overrides" => Ok(LabelCollisionPolicy::ExternalOverrides),
            other => Err(format!(
                "invalid label collision policy {:?} (expected \"append\" or \"external-overrides\")",
                other
            )),
        }
    }
}

/// Stored labels first, in stored order, then the external labels.
///
/// With an empty external set the result equals `stored`.
pub fn merge_labels(
    stored: &Labels,
    external: &ExternalLabels,
    policy: LabelCollisionPolicy,
) -> Labels {
    if external.is_empty() {
        return stored.clone();
    }
    let mut out: Vec<Label> = Vec::with_capacity(stored.len() + external.len());
    match policy {
        LabelCollisionPolicy::Append => {
            out.extend(stored.iter().cloned());
            out.extend(external.iter().cloned());
        }
        LabelCollisionPolicy::ExternalOverrides => {
            let overrides: BTreeMap<&str, &str> = external
                .iter()
                .map(|l| (l.name.as_str(), l.value.as_str()))
                .collect();
            for l in stored.iter() {
                match overrides.get(l.name.as_str()) {
                    Some(v) => out.push(Label::new(l.name.as_str(), *v)),
                    None => out.push(l.clone()),
                }
            }
            out.extend(
                external
                    .iter()
                    .filter(|l| stored.get(&l.name).is_none())
                    .cloned(),
            );
        }
    }
    Labels::new(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sorts_by_name() {
        let ext = ExternalLabels::parse(r#"{"region":"eu","env":"prod"}"#).unwrap();
        let names: Vec<&str> = ext.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["env", "region"]);
        assert_eq!(ext.to_json(), r#"{"env":"prod","region":"eu"}"#);
    }

    #[test]
    fn parse_rejects_non_objects_and_non_strings() {
        for bad in [r#"["a"]"#, r#"{"a":1}"#, "{", "", "null"] {
            assert!(
                matches!(ExternalLabels::parse(bad), Err(MigrateError::ExternalLabels(_))),
                "{bad:?} should fail"
            );
        }
        assert!(ExternalLabels::parse("{}").unwrap().is_empty());
    }

    #[test]
    fn append_keeps_stored_first_and_both_on_collision() {
        let stored = Labels::from_pairs(&[("job", "x"), ("env", "dev")]);
        let ext = ExternalLabels::from_pairs(&[("env", "prod"), ("dc", "1")]);
        let merged = merge_labels(&stored, &ext, LabelCollisionPolicy::Append);
        assert_eq!(
            merged,
            Labels::from_pairs(&[("job", "x"), ("env", "dev"), ("dc", "1"), ("env", "prod")])
        );
        assert_eq!(merged.duplicate_name(), Some("env"));
    }

    #[test]
    fn external_overrides_replaces_in_place() {
        let stored = Labels::from_pairs(&[("env", "dev"), ("job", "x")]);
        let ext = ExternalLabels::from_pairs(&[("env", "prod"), ("dc", "1")]);
        let merged = merge_labels(&stored, &ext, LabelCollisionPolicy::ExternalOverrides);
        assert_eq!(
            merged,
            Labels::from_pairs(&[("env", "prod"), ("job", "x"), ("dc", "1")])
        );
        assert_eq!(merged.duplicate_name(), None);
    }

    #[test]
    fn empty_external_is_identity() {
        let stored = Labels::from_pairs(&[("job", "x")]);
        for policy in [LabelCollisionPolicy::Append, LabelCollisionPolicy::ExternalOverrides] {
            assert_eq!(merge_labels(&stored, &ExternalLabels::default(), policy), stored);
        }
    }

    #[test]
    fn policy_parses_from_str() {
        assert_eq!(
            "external-overrides".parse::<LabelCollisionPolicy>(),
            Ok(LabelCollisionPolicy::ExternalOverrides)
        );
        assert!("override".parse::<LabelCollisionPolicy>().is_err());
    }
}
