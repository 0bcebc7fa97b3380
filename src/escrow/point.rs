use serde::{Deserialize, Serialize};

use crate::types::{Amount, Timestamp};
use crate::units::MAXTIME;

use super::EscrowError;

/// Linear weight segment: `bias` at `ts`, falling by `slope` per second.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Point {
    pub bias: i128,
    pub slope: i128,
    pub ts: Timestamp,
}

impl Point {
    pub fn origin(ts: Timestamp) -> Self {
        Self {
            bias: 0,
            slope: 0,
            ts,
        }
    }

    /// Weight of the account owning a lock, as seen at `now`.
    pub fn for_lock(locked: &LockedBalance, now: Timestamp) -> Result<Self, EscrowError> {
        if locked.end <= now || locked.amount == 0 {
            return Ok(Self::origin(now));
        }
        let amount = i128::try_from(locked.amount).map_err(|_| EscrowError::MathOverflow)?;
        let slope = amount / MAXTIME as i128;
        let bias = slope
            .checked_mul((locked.end - now) as i128)
            .ok_or(EscrowError::MathOverflow)?;
        Ok(Self {
            bias,
            slope,
            ts: now,
        })
    }

    /// Weight at `t`, which must not precede `ts`. Never negative.
    pub fn weight_at(&self, t: Timestamp) -> Amount {
        let elapsed = t.saturating_sub(self.ts) as i128;
        let bias = self.bias - self.slope.saturating_mul(elapsed);
        bias.max(0) as Amount
    }
}

/// Tokens held by an account and the week boundary at which they unlock.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockedBalance {
    pub amount: Amount,
    pub end: Timestamp,
}

impl LockedBalance {
    pub fn is_empty(&self) -> bool {
        self.amount == 0
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::{tokens, WEEK};

    #[test]
    fn full_length_lock_starts_near_amount() {
        let lock = LockedBalance {
            amount: tokens(208),
            end: MAXTIME,
        };
        let point = Point::for_lock(&lock, 0).unwrap();
        assert_eq!(point.slope, tokens(208) as i128 / MAXTIME as i128);
        let start = point.weight_at(0);
        assert!(start <= tokens(208));
        assert!(tokens(208) - start < MAXTIME as Amount);
    }

    #[test]
    fn weight_decays_to_zero_at_end() {
        let lock = LockedBalance {
            amount: tokens(10),
            end: 4 * WEEK,
        };
        let point = Point::for_lock(&lock, 0).unwrap();
        assert!(point.weight_at(2 * WEEK) < point.weight_at(WEEK));
        assert_eq!(point.weight_at(4 * WEEK), 0);
        assert_eq!(point.weight_at(40 * WEEK), 0);
    }

    #[test]
    fn expired_or_empty_lock_has_no_weight() {
        let expired = LockedBalance {
            amount: tokens(1),
            end: WEEK,
        };
        assert_eq!(Point::for_lock(&expired, WEEK).unwrap(), Point::origin(WEEK));
        let empty = LockedBalance::default();
        assert_eq!(Point::for_lock(&empty, 0).unwrap().slope, 0);
    }
}
