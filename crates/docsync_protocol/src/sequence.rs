//! Changes-feed sequence tokens.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position in a store's changes feed.
///
/// Every committed change receives a strictly larger sequence than the one
/// before it. `Sequence::START` sorts before every real change.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sequence(u64);

impl Sequence {
    /// Start of history.
    pub const START: Sequence = Sequence(0);

    /// Creates a sequence from its numeric value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the numeric value.
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Returns the sequence immediately after this one.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Sequence {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
