//! Ordered deployment variable dictionary.
//!
//! Keys are matched case-insensitively, the most recent write wins, and
//! iteration follows first-insertion order so serialized output stays stable.

use std::fmt;

use indexmap::IndexMap;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    name: String,
    value: String,
}

/// String-to-string variable mapping shared by every convention of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables {
    entries: IndexMap<String, Entry>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `name`. The stored spelling follows the latest write.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let entry = Entry {
            name,
            value: value.into(),
        };
        self.entries.insert(fold(&entry.name), entry);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(&fold(name)).map(|e| e.value.as_str())
    }

    /// Value of `name`, treating blank values as missing.
    pub fn get_non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|v| !v.trim().is_empty())
    }

    /// Interpret `name` as a boolean flag (`true`/`false`, case-insensitive).
    ///
    /// Missing or unparseable values yield `default`.
    pub fn get_flag(&self, name: &str, default: bool) -> bool {
        match self.get(name).map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "true" => true,
            Some(v) if v == "false" => false,
            _ => default,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&fold(name))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(name, value)` pairs in first-insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .values()
            .map(|e| (e.name.as_str(), e.value.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Variables {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut vars = Variables::new();
        for (k, v) in iter {
            vars.set(k, v);
        }
        vars
    }
}

impl Serialize for Variables {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.iter())
    }
}

impl<'de> Deserialize<'de> for Variables {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(VariablesVisitor)
    }
}

/// Applies entries in document order so a later spelling of a key wins.
struct VariablesVisitor;

impl<'de> Visitor<'de> for VariablesVisitor {
    type Value = Variables;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an object of string variables")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Variables, A::Error> {
        let mut vars = Variables::new();
        while let Some((name, value)) = map.next_entry::<String, String>()? {
            vars.set(name, value);
        }
        Ok(vars)
    }
}

fn fold(name: &str) -> String {
    name.to_lowercase()
}
