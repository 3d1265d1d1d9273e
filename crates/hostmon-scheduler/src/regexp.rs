//! Global regular expressions.
//!
//! Expressions arrive from the server with the active-check configuration
//! and are referenced from item keys as `@name`. All expressions sharing a
//! name must match for the named expression to match.

use std::collections::HashMap;

use hostmon_plugin::{CaseMode, PluginError, RegexpMatcher};
use regex::{Captures, Regex, RegexBuilder};
use serde::Deserialize;

use crate::error::SchedulerError;

/// Expression type codes used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "u8")]
pub enum ExpressionType {
    /// The value contains the body.
    Included,
    /// The value contains any of the delimited substrings of the body.
    AnyIncluded,
    NotIncluded,
    /// The body is a regular expression the value must match.
    True,
    /// The body is a regular expression the value must not match.
    False,
}

impl TryFrom<u8> for ExpressionType {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(ExpressionType::Included),
            1 => Ok(ExpressionType::AnyIncluded),
            2 => Ok(ExpressionType::NotIncluded),
            3 => Ok(ExpressionType::True),
            4 => Ok(ExpressionType::False),
            other => Err(format!("unknown expression type {other}")),
        }
    }
}

fn default_delimiter() -> String {
    ",".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
pub struct Expression {
    pub name: String,
    #[serde(rename = "expression")]
    pub body: String,
    #[serde(rename = "expression_type")]
    pub kind: ExpressionType,
    #[serde(rename = "exp_delimiter", default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default, deserialize_with = "flag")]
    pub case_sensitive: bool,
}

fn flag<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(u8),
    }
    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    })
}

enum Compiled {
    Included(String),
    AnyIncluded(Vec<String>),
    NotIncluded(String),
    True(Regex),
    False(Regex),
}

struct Entry {
    compiled: Compiled,
    case: CaseMode,
}

impl Entry {
    fn compile(expression: &Expression) -> Result<Self, SchedulerError> {
        let case = if expression.case_sensitive {
            CaseMode::Sensitive
        } else {
            CaseMode::Insensitive
        };
        let regex = || {
            build_regex(&expression.body, case).map_err(|e| SchedulerError::InvalidExpression {
                name: expression.name.clone(),
                reason: e.to_string(),
            })
        };
        let compiled = match expression.kind {
            ExpressionType::Included => Compiled::Included(expression.body.clone()),
            ExpressionType::AnyIncluded => {
                let delimiter = expression.delimiter.chars().next().unwrap_or(',');
                Compiled::AnyIncluded(
                    expression
                        .body
                        .split(delimiter)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect(),
                )
            }
            ExpressionType::NotIncluded => Compiled::NotIncluded(expression.body.clone()),
            ExpressionType::True => Compiled::True(regex()?),
            ExpressionType::False => Compiled::False(regex()?),
        };
        Ok(Self { compiled, case })
    }

    /// Returns the template substitution for `True` expressions when a
    /// template is given.
    fn evaluate(&self, value: &str, template: Option<&str>) -> (bool, Option<String>) {
        match &self.compiled {
            Compiled::Included(s) => (contains(value, s, self.case), None),
            Compiled::AnyIncluded(list) => {
                (list.iter().any(|s| contains(value, s, self.case)), None)
            }
            Compiled::NotIncluded(s) => (!contains(value, s, self.case), None),
            Compiled::True(re) => match re.captures(value) {
                Some(caps) => (true, template.map(|t| substitute(t, &caps))),
                None => (false, None),
            },
            Compiled::False(re) => (!re.is_match(value), None),
        }
    }
}

fn contains(value: &str, needle: &str, case: CaseMode) -> bool {
    match case {
        CaseMode::Sensitive => value.contains(needle),
        CaseMode::Insensitive => value.to_lowercase().contains(&needle.to_lowercase()),
    }
}

fn build_regex(pattern: &str, case: CaseMode) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(case == CaseMode::Insensitive)
        .build()
}

/// Expands `\0`..`\9` to capture groups and `\@` to the whole match. Any
/// other backslash sequence is copied as is.
fn substitute(template: &str, caps: &Captures<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some(d @ '0'..='9') => {
                chars.next();
                let group = d as usize - '0' as usize;
                if let Some(m) = caps.get(group) {
                    out.push_str(m.as_str());
                }
            }
            Some('@') => {
                chars.next();
                if let Some(m) = caps.get(0) {
                    out.push_str(m.as_str());
                }
            }
            _ => out.push('\\'),
        }
    }
    out
}

/// Compiled set of global regular expressions, replaced wholesale on every
/// configuration update.
///
/// # Examples
///
/// ```
/// use hostmon_plugin::{CaseMode, RegexpMatcher};
/// use hostmon_scheduler::regexp::GlobalRegexp;
///
/// let re = GlobalRegexp::default();
/// let out = re.matches("load=0.75", r"load=(\d+)", CaseMode::Sensitive, Some(r"\1")).unwrap();
/// assert_eq!(out.as_deref(), Some("0"));
/// ```
#[derive(Default)]
pub struct GlobalRegexp {
    expressions: Vec<Expression>,
    compiled: HashMap<String, Vec<Entry>>,
}

impl GlobalRegexp {
    /// # Errors
    ///
    /// Fails if a regular expression body does not compile.
    pub fn new(mut expressions: Vec<Expression>) -> Result<Self, SchedulerError> {
        expressions.sort();
        let mut compiled: HashMap<String, Vec<Entry>> = HashMap::new();
        for expression in &expressions {
            compiled
                .entry(expression.name.clone())
                .or_default()
                .push(Entry::compile(expression)?);
        }
        Ok(Self {
            expressions,
            compiled,
        })
    }

    /// Whether this bundle was built from the same expressions, in any
    /// order.
    pub fn same_expressions(&self, expressions: &[Expression]) -> bool {
        if expressions.len() != self.expressions.len() {
            return false;
        }
        let mut sorted = expressions.to_vec();
        sorted.sort();
        sorted == self.expressions
    }

    pub fn len(&self) -> usize {
        self.expressions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expressions.is_empty()
    }
}

impl RegexpMatcher for GlobalRegexp {
    fn matches(
        &self,
        value: &str,
        pattern: &str,
        case: CaseMode,
        output_template: Option<&str>,
    ) -> Result<Option<String>, PluginError> {
        if pattern.is_empty() {
            return Ok(Some(value.to_string()));
        }

        let Some(name) = pattern.strip_prefix('@') else {
            let re = build_regex(pattern, case).map_err(|e| PluginError::Regex(e.to_string()))?;
            return Ok(re.captures(value).map(|caps| match output_template {
                Some(t) => substitute(t, &caps),
                None => value.to_string(),
            }));
        };

        let entries = self.compiled.get(name).ok_or_else(|| {
            PluginError::unsupported(format!(
                "Global regular expression \"{name}\" does not exist."
            ))
        })?;
        let mut output = None;
        for entry in entries {
            let (matched, substituted) = entry.evaluate(value, output_template);
            if !matched {
                return Ok(None);
            }
            if substituted.is_some() {
                output = substituted;
            }
        }
        Ok(Some(output.unwrap_or_else(|| value.to_string())))
    }
}
