//! Metric key aliases.
//!
//! An alias either matches a key verbatim (`ping` -> `agent.ping`) or, when
//! its name ends in `[*]`, matches any key with the same name and splices
//! the key's parameter list into a target that also ends in `[*]`
//! (`cpu[*]` -> `system.cpu.util[*]` rewrites `cpu[1]` into
//! `system.cpu.util[1]`).

use std::borrow::Cow;

use hostmon_common::itemutil::parse_key;

use crate::error::AliasError;

const WILDCARD: &str = "[*]";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Alias {
    name: String,
    target: String,
}

/// Exact aliases are matched before wildcard ones; among wildcard aliases
/// the first configured match wins.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    aliases: Vec<Alias>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table from `(name, target)` pairs.
    ///
    /// # Examples
    ///
    /// ```
    /// use hostmon_scheduler::alias::AliasTable;
    ///
    /// let table = AliasTable::from_pairs([("cpu[*]", "system.cpu.util[*]")]).unwrap();
    /// assert_eq!(table.resolve("cpu[1]"), "system.cpu.util[1]");
    /// assert_eq!(table.resolve("memory"), "memory");
    ///
    /// assert!(AliasTable::from_pairs([("cpu", "a"), ("cpu", "b")]).is_err());
    /// ```
    pub fn from_pairs<I, N, T>(pairs: I) -> Result<Self, AliasError>
    where
        I: IntoIterator<Item = (N, T)>,
        N: Into<String>,
        T: Into<String>,
    {
        let mut table = Self::new();
        for (name, target) in pairs {
            table.add(name, target)?;
        }
        Ok(table)
    }

    /// Builds a table from `name:target` configuration entries.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, AliasError> {
        let mut table = Self::new();
        for entry in entries {
            let (name, target) = split_entry(entry.as_ref())?;
            table.add(name, target)?;
        }
        Ok(table)
    }

    pub fn add(
        &mut self,
        name: impl Into<String>,
        target: impl Into<String>,
    ) -> Result<(), AliasError> {
        let name = name.into();
        let target = target.into();
        for key in [&name, &target] {
            parse_key(key).map_err(|e| AliasError::Invalid {
                entry: format!("{name}:{target}"),
                reason: e.to_string(),
            })?;
        }
        if self.aliases.iter().any(|a| a.name == name) {
            return Err(AliasError::Duplicate(name));
        }
        tracing::debug!(name = %name, target = %target, "Alias added");
        self.aliases.push(Alias { name, target });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    /// Rewrites `key` through the table. Keys that do not parse, or match
    /// no alias, are returned unchanged.
    pub fn resolve<'a>(&'a self, key: &'a str) -> Cow<'a, str> {
        if self.aliases.is_empty() || parse_key(key).is_err() {
            return Cow::Borrowed(key);
        }

        if let Some(alias) = self.aliases.iter().find(|a| a.name == key) {
            return Cow::Borrowed(alias.target.as_str());
        }

        for alias in &self.aliases {
            let Some(prefix) = alias.name.strip_suffix(WILDCARD) else {
                continue;
            };
            // name plus the opening bracket
            let head = &alias.name[..prefix.len() + 1];
            if !key.starts_with(head) {
                continue;
            }
            return match alias.target.strip_suffix(WILDCARD) {
                Some(target_prefix) => {
                    Cow::Owned(format!("{target_prefix}{}", &key[prefix.len()..]))
                }
                None => Cow::Borrowed(alias.target.as_str()),
            };
        }

        Cow::Borrowed(key)
    }
}

/// Splits `name:target` at the first colon that ends a well-formed key, so
/// colons inside quoted parameters of the name are kept.
fn split_entry(entry: &str) -> Result<(&str, &str), AliasError> {
    let invalid = |reason: &str| AliasError::Invalid {
        entry: entry.to_string(),
        reason: reason.to_string(),
    };
    for (pos, _) in entry.match_indices(':') {
        let name = &entry[..pos];
        if parse_key(name).is_ok() {
            let target = entry[pos + 1..].trim();
            if target.is_empty() {
                return Err(invalid("missing target key"));
            }
            return Ok((name, target));
        }
    }
    Err(invalid("expected <name>:<key>"))
}
