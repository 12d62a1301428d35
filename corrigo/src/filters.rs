//! Shared unit-filter predicates, selectable per module from configuration.
use serde::{Deserialize, Serialize};

use crate::Unit;

/// Token classes the `nonumbers` filter rejects.
const NUMERIC_CLASSES: &[&str] = &[
    "NUMBER",
    "DATE",
    "NUMBER-YEAR",
    "CURRENCY",
    "FRACNUMBER",
    "NUMBER-STRING",
    "STRING-NUMBER",
    "NUMBER-ORDINAL",
    "DATE-REVERSE",
    "SMILEY",
    "REVERSE-SMILEY",
];

/// Named unit filter a module specification may select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    /// Accept units whose text contains at least one alphabetic character
    HasAlpha,
    /// Reject words classed as numeric, date, or symbol tokens
    NoNumbers,
}

impl FilterKind {
    /// Whether the unit passes this filter.
    pub fn accepts(&self, unit: &Unit) -> bool {
        match self {
            FilterKind::HasAlpha => unit.text().chars().any(|c| c.is_alphabetic()),
            FilterKind::NoNumbers => match unit.word() {
                Some(word) => word
                    .class
                    .as_deref()
                    .map(|c| !NUMERIC_CLASSES.contains(&c))
                    .unwrap_or(true),
                None => true,
            },
        }
    }
}
