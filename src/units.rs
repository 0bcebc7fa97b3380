//! Time granularity and 18-decimal fixed-point helpers.

use crate::types::{Amount, Timestamp};

pub const WEEK: Timestamp = 7 * 86_400;

/// Longest allowed lock: 4 × 52 weeks.
pub const MAXTIME: Timestamp = 208 * WEEK;

pub const DECIMALS: u8 = 18;

/// One whole token in base units.
pub const UNIT: Amount = 1_000_000_000_000_000_000;

/// Default supply minted to the founder of a fresh token, in whole tokens.
pub const DEFAULT_INITIAL_SUPPLY: u64 = 1_000_000_000;

/// Snap a timestamp down to its epoch (week) boundary.
pub const fn epoch_floor(ts: Timestamp) -> Timestamp {
    ts / WEEK * WEEK
}

/// Convert a human token quantity to base units.
///
/// The value is first scaled to 8 decimals and truncated, then widened to 18,
/// so `to_wei(0.123456789)` drops the ninth digit.
pub fn to_wei(tokens: f64) -> Amount {
    if !tokens.is_finite() || tokens <= 0.0 {
        return 0;
    }
    let scaled = (tokens * 1e8).trunc() as Amount;
    scaled.saturating_mul(10_000_000_000)
}

/// Convert base units to a human quantity rounded to 8 decimals.
pub fn to_ether(amount: Amount) -> f64 {
    (amount as f64 / 1e10).round() / 1e8
}

/// Whole tokens to base units.
pub fn tokens(whole: u64) -> Amount {
    whole as Amount * UNIT
}

/// Amounts inside tagged enums are stored as decimal strings so they survive
/// serde's buffered enum representation.
pub(crate) mod serde_amount {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    use crate::types::Amount;

    pub fn serialize<S>(value: &Amount, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Amount, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        encoded.parse().map_err(D::Error::custom)
    }
}
