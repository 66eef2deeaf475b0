//! Amount normalization and fixed-size decimal slot vectors
//!
//! Every ingestion path (manual, bulk file, event stream) converts raw tokens
//! into decimals through [`normalize`] and nothing else. Empty or dirty input
//! never fails: it becomes zero.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Number of amount slots and factor slots carried by a qualification
pub const SLOT_COUNT: usize = 29;

/// Fixed vector of 29 exact decimals, addressed 1-based (`1..=29`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Slots([Decimal; SLOT_COUNT]);

/// Raw monetary amounts (`amount1..amount29`)
pub type AmountSlots = Slots;

/// Normalized allocation factors (`factor1..factor29`)
pub type FactorSlots = Slots;

impl Default for Slots {
    fn default() -> Self {
        Self::zero()
    }
}

impl Slots {
    /// All slots zero
    pub fn zero() -> Self {
        Self([Decimal::ZERO; SLOT_COUNT])
    }

    /// Build from a lookup returning the raw token for slot `i`
    ///
    /// Missing tokens normalize to zero.
    pub fn from_tokens<'a, F>(mut lookup: F) -> Self
    where
        F: FnMut(usize) -> Option<&'a str>,
    {
        let mut slots = Self::zero();
        for index in 1..=SLOT_COUNT {
            slots.set(index, normalize_opt(lookup(index)));
        }
        slots
    }

    /// Value of slot `index` (1-based)
    ///
    /// # Panics
    /// Panics if `index` is outside `1..=29`.
    pub fn get(&self, index: usize) -> Decimal {
        self.0[Self::position(index)]
    }

    /// Overwrite slot `index` (1-based)
    ///
    /// # Panics
    /// Panics if `index` is outside `1..=29`.
    pub fn set(&mut self, index: usize, value: Decimal) {
        self.0[Self::position(index)] = value;
    }

    /// Sum of slots `first..=last`, or `None` when it leaves the decimal range
    pub fn checked_sum(&self, first: usize, last: usize) -> Option<Decimal> {
        (first..=last).try_fold(Decimal::ZERO, |total, index| total.checked_add(self.get(index)))
    }

    /// Slots in order, slot 1 first
    pub fn as_array(&self) -> &[Decimal; SLOT_COUNT] {
        &self.0
    }

    fn position(index: usize) -> usize {
        assert!(
            (1..=SLOT_COUNT).contains(&index),
            "slot index {} outside 1..={}",
            index,
            SLOT_COUNT
        );
        index - 1
    }
}

impl From<[Decimal; SLOT_COUNT]> for Slots {
    fn from(values: [Decimal; SLOT_COUNT]) -> Self {
        Self(values)
    }
}

/// Parse a raw numeric token into an exact decimal
///
/// Accepts `.` or `,` as decimal separator and scientific notation; surrounding
/// whitespace is ignored. Empty or unparsable input yields zero.
pub fn normalize(token: &str) -> Decimal {
    let cleaned = token.trim().replace(',', ".");
    if cleaned.is_empty() {
        return Decimal::ZERO;
    }

    Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .unwrap_or(Decimal::ZERO)
}

/// [`normalize`] for an optional token; `None` yields zero
pub fn normalize_opt(token: Option<&str>) -> Decimal {
    token.map(normalize).unwrap_or(Decimal::ZERO)
}

/// [`normalize`] for a decoded JSON value
///
/// Numbers and strings go through the same textual normalization; anything
/// else (null, bool, arrays, objects) yields zero.
pub fn normalize_json(value: &serde_json::Value) -> Decimal {
    match value {
        serde_json::Value::Number(number) => normalize(&number.to_string()),
        serde_json::Value::String(text) => normalize(text),
        _ => Decimal::ZERO,
    }
}
