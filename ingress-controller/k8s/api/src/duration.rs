//! Go `time.Duration` strings, as used by timeout fields and annotations.

use std::{str::FromStr, time::Duration};

/// A non-negative duration written in Go syntax, e.g. `1m30s` or `250ms`.
///
/// The value `infinity` (or `infinite`) disables a timeout.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GoDuration {
    Infinite,
    Finite(Duration),
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("empty duration")]
    Empty,

    #[error("invalid unit {0:?}: {EXPECTED_UNITS}")]
    InvalidUnit(String),

    #[error("missing a unit: {EXPECTED_UNITS}")]
    NoUnit,

    #[error("negative durations are not supported")]
    Negative,

    #[error("invalid number: {0:?}")]
    NotANumber(String),

    #[error("duration is too large")]
    Overflow,
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', or 'h'";

// === impl GoDuration ===

impl GoDuration {
    /// Returns the finite duration, if any.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Infinite => None,
            Self::Finite(d) => Some(*d),
        }
    }
}

impl From<Duration> for GoDuration {
    fn from(d: Duration) -> Self {
        Self::Finite(d)
    }
}

impl FromStr for GoDuration {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "" => return Err(ParseError::Empty),
            "infinity" | "infinite" => return Ok(Self::Infinite),
            _ => {}
        }

        let mut rest = match s.strip_prefix('-') {
            Some(_) => return Err(ParseError::Negative),
            None => s.strip_prefix('+').unwrap_or(s),
        };

        // A bare zero is the only value permitted without a unit.
        if rest == "0" {
            return Ok(Self::Finite(Duration::ZERO));
        }

        let mut nanos = 0u128;
        while !rest.is_empty() {
            let unit_start = rest
                .find(|c: char| c.is_alphabetic())
                .ok_or(ParseError::NoUnit)?;
            let (value, tail) = rest.split_at(unit_start);
            let unit_end = tail
                .find(|c: char| !c.is_alphabetic())
                .unwrap_or(tail.len());
            let (unit, tail) = tail.split_at(unit_end);
            nanos = nanos
                .checked_add(scaled_nanos(value, unit_nanos(unit)?)?)
                .ok_or(ParseError::Overflow)?;
            rest = tail;
        }

        let secs = u64::try_from(nanos / NANOS_PER_SEC).map_err(|_| ParseError::Overflow)?;
        // The remainder is always below one second.
        let subsec = (nanos % NANOS_PER_SEC) as u32;
        Ok(Self::Finite(Duration::new(secs, subsec)))
    }
}

const NANOS_PER_SEC: u128 = 1_000_000_000;

fn unit_nanos(unit: &str) -> Result<u128, ParseError> {
    const MINUTE: u128 = 60 * NANOS_PER_SEC;
    match unit {
        "ns" => Ok(1),
        // U+00B5 is the micro sign; U+03BC is the Greek letter mu.
        "us" | "\u{00b5}s" | "\u{03bc}s" => Ok(1_000),
        "ms" => Ok(1_000_000),
        "s" => Ok(NANOS_PER_SEC),
        "m" => Ok(MINUTE),
        "h" => Ok(MINUTE * 60),
        unit => Err(ParseError::InvalidUnit(unit.to_string())),
    }
}

/// Multiplies a decimal number by a unit without going through floating point.
fn scaled_nanos(value: &str, unit: u128) -> Result<u128, ParseError> {
    let not_a_number = || ParseError::NotANumber(value.to_string());
    let (int, frac) = value.split_once('.').unwrap_or((value, ""));
    if (int.is_empty() && frac.is_empty())
        || !int.bytes().all(|b| b.is_ascii_digit())
        || !frac.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(not_a_number());
    }

    let int = if int.is_empty() {
        0
    } else {
        int.parse::<u128>().map_err(|_| not_a_number())?
    };

    // Digits past nanosecond precision of an hour cannot change the result.
    let mut numerator = 0u128;
    let mut denominator = 1u128;
    for digit in frac.bytes().take(18) {
        numerator = numerator * 10 + u128::from(digit - b'0');
        denominator *= 10;
    }

    int.checked_mul(unit)
        .and_then(|n| n.checked_add(numerator * unit / denominator))
        .ok_or(ParseError::Overflow)
}
