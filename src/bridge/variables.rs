// src/bridge/variables.rs

//! CI variables and `$VAR` expansion.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

/// `$VAR`, `${VAR}` and `%VAR%`.
static VARIABLE_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$([a-zA-Z_][a-zA-Z0-9_]*)|\$\{([a-zA-Z_][a-zA-Z0-9_]*)\}|%([a-zA-Z_][a-zA-Z0-9_]*)%")
        .expect("variable reference pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Variable {
    pub key: String,
    pub value: String,
}

impl Variable {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Ordered list of variables. Later entries win on lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableCollection {
    items: Vec<Variable>,
}

impl VariableCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.items.push(Variable::new(key, value));
        self
    }

    pub fn concat<'a, I>(&mut self, other: I) -> &mut Self
    where
        I: IntoIterator<Item = &'a Variable>,
    {
        self.items.extend(other.into_iter().cloned());
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.items
            .iter()
            .rev()
            .find(|v| v.key == key)
            .map(|v| v.value.as_str())
    }

    /// Key/value lookup table, last definition wins.
    pub fn to_lookup(&self) -> HashMap<&str, &str> {
        self.items
            .iter()
            .map(|v| (v.key.as_str(), v.value.as_str()))
            .collect()
    }

    pub fn into_vec(self) -> Vec<Variable> {
        self.items
    }
}

impl FromIterator<Variable> for VariableCollection {
    fn from_iter<T: IntoIterator<Item = Variable>>(iter: T) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

/// Replace every variable reference in `value`. Unknown variables expand to
/// the empty string. Expansion is a single pass: values pulled in from the
/// lookup are not expanded again.
pub fn expand(value: &str, lookup: &HashMap<&str, &str>) -> String {
    VARIABLE_REFERENCE
        .replace_all(value, |caps: &Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .or_else(|| caps.get(3))
                .map(|m| m.as_str())
                .unwrap_or_default();
            lookup.get(name).copied().unwrap_or_default().to_string()
        })
        .into_owned()
}

/// Keep only the last occurrence of each key while preserving the order in
/// which those last occurrences appear.
pub fn dedup_last_wins(variables: Vec<Variable>) -> Vec<Variable> {
    let mut seen = std::collections::HashSet::new();
    let mut kept: Vec<Variable> = variables
        .into_iter()
        .rev()
        .filter(|v| seen.insert(v.key.clone()))
        .collect();
    kept.reverse();
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup() -> VariableCollection {
        let mut vars = VariableCollection::new();
        vars.append("BRANCH", "main").append("ENV", "staging");
        vars
    }

    #[test]
    fn expands_all_reference_syntaxes() {
        let vars = lookup();
        let table = vars.to_lookup();
        assert_eq!(expand("$BRANCH", &table), "main");
        assert_eq!(expand("release-${ENV}", &table), "release-staging");
        assert_eq!(expand("%BRANCH%/x", &table), "main/x");
    }

    #[test]
    fn unknown_variables_expand_to_empty() {
        let vars = lookup();
        assert_eq!(expand("a-$MISSING-b", &vars.to_lookup()), "a--b");
    }

    #[test]
    fn later_definitions_win() {
        let mut vars = lookup();
        vars.append("BRANCH", "feature");
        assert_eq!(vars.get("BRANCH"), Some("feature"));
        assert_eq!(expand("$BRANCH", &vars.to_lookup()), "feature");
    }

    #[test]
    fn dedup_keeps_last_occurrence() {
        let out = dedup_last_wins(vec![
            Variable::new("A", "1"),
            Variable::new("B", "2"),
            Variable::new("A", "3"),
        ]);
        assert_eq!(out, vec![Variable::new("B", "2"), Variable::new("A", "3")]);
    }
}
