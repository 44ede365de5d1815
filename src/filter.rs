//! Search filter assembly.
//!
//! Pure string building. Values arrive already escaped; the builder only
//! decides the shape of each predicate and how predicates combine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Predicate shape for a single condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOperation {
    /// `(attr=value)`
    #[serde(rename = "EQ")]
    Equals,
    /// `(attr=*value*)`
    #[serde(rename = "CO")]
    Contains,
    /// `(attr=value*)`
    #[serde(rename = "SW")]
    StartsWith,
    /// `(attr=*value)`
    #[serde(rename = "EW")]
    EndsWith,
}

impl FilterOperation {
    /// Renders `attr` and an escaped `value` as a single predicate.
    pub fn render(self, attribute: &str, value: &str) -> String {
        match self {
            FilterOperation::Equals => format!("({}={})", attribute, value),
            FilterOperation::Contains => format!("({}=*{}*)", attribute, value),
            FilterOperation::StartsWith => format!("({}={}*)", attribute, value),
            FilterOperation::EndsWith => format!("({}=*{})", attribute, value),
        }
    }

    /// Applies the same operation as an in-memory match.
    pub fn matches(self, candidate: &str, value: &str) -> bool {
        match self {
            FilterOperation::Equals => candidate == value,
            FilterOperation::Contains => candidate.contains(value),
            FilterOperation::StartsWith => candidate.starts_with(value),
            FilterOperation::EndsWith => candidate.ends_with(value),
        }
    }
}

impl fmt::Display for FilterOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            FilterOperation::Equals => "EQ",
            FilterOperation::Contains => "CO",
            FilterOperation::StartsWith => "SW",
            FilterOperation::EndsWith => "EW",
        };
        f.write_str(code)
    }
}

/// Builds `(&base cond... (|alt...))` filters.
///
/// Conditions added with `alternate = true` are OR-combined with each other
/// and the resulting clause is AND-combined with everything else.
#[derive(Debug, Clone)]
pub struct FilterBuilder {
    base: String,
    clauses: Vec<String>,
    alternates: Vec<String>,
}

impl FilterBuilder {
    pub fn new(base_filter: impl Into<String>) -> Self {
        Self {
            base: base_filter.into(),
            clauses: Vec::new(),
            alternates: Vec::new(),
        }
    }

    pub fn add_condition(
        &mut self,
        attribute: &str,
        operation: FilterOperation,
        value: &str,
        alternate: bool,
    ) -> &mut Self {
        let clause = operation.render(attribute, value);
        if alternate {
            self.alternates.push(clause);
        } else {
            self.clauses.push(clause);
        }
        self
    }

    /// Appends a pre-rendered predicate to the AND set.
    pub fn add_raw(&mut self, clause: impl Into<String>) -> &mut Self {
        self.clauses.push(clause.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty() && self.alternates.is_empty()
    }

    /// Returns the base filter untouched when nothing was added.
    pub fn build(&self) -> String {
        if self.is_empty() {
            return self.base.clone();
        }
        let mut filter = String::from("(&");
        filter.push_str(&self.base);
        for clause in &self.clauses {
            filter.push_str(clause);
        }
        if !self.alternates.is_empty() {
            filter.push_str("(|");
            for clause in &self.alternates {
                filter.push_str(clause);
            }
            filter.push(')');
        }
        filter.push(')');
        filter
    }
}
