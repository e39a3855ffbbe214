use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Number of decimal digits in a sequence id.
pub const SEQ_DIGITS: usize = 6;

const SEQ_LIMIT: u32 = 1_000_000;

/// Six-digit sequence id naming one delta file.
///
/// Always rendered zero-padded (`000042`), serialized as a plain integer in
/// the index document. Leading zeros are significant on input: `"42"` is
/// rejected, `"000042"` is accepted.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Seq(u32);

impl Seq {
    /// Parse a seq from its textual form. Requires exactly six ASCII digits.
    ///
    /// ```
    /// use taric_types::Seq;
    ///
    /// assert_eq!(Seq::parse("200000").unwrap().value(), 200_000);
    /// assert!(Seq::parse("20000").is_err());
    /// assert!(Seq::parse("2000001").is_err());
    /// assert!(Seq::parse("20000a").is_err());
    /// ```
    pub fn parse(text: &str) -> Result<Self, TypeError> {
        if text.len() != SEQ_DIGITS || !text.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TypeError::InvalidSeq(text.to_string()));
        }
        text.parse::<u32>()
            .map(Self)
            .map_err(|_| TypeError::InvalidSeq(text.to_string()))
    }

    /// Build a seq from its numeric value.
    pub fn from_value(value: u32) -> Result<Self, TypeError> {
        if value >= SEQ_LIMIT {
            return Err(TypeError::SeqOutOfRange(value));
        }
        Ok(Self(value))
    }

    /// Numeric value of this seq.
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl FromStr for Seq {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<u32> for Seq {
    type Error = TypeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<Seq> for u32 {
    fn from(seq: Seq) -> Self {
        seq.0
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

impl fmt::Debug for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({:06})", self.0)
    }
}
