//! Vote-escrow ledger ("vcDORA").
//!
//! Accounts lock the bound token until a week boundary and receive voting
//! weight `amount / MAXTIME * (end - t)` that falls linearly to zero at `end`.
//! Aggregate weight is kept as a history of [`Point`]s plus the slope changes
//! scheduled at each lock end, so supply can be read at any past or future
//! timestamp without touching individual locks.

mod point;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::ledger::{TokenError, TokenLedger};
use crate::types::{Address, Amount, CallContext, Timestamp};
use crate::units::{epoch_floor, serde_amount, MAXTIME, WEEK};

pub use point::{LockedBalance, Point};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EscrowError {
    #[error("escrow is not initialized")]
    NotInitialized,
    #[error("escrow is already initialized")]
    AlreadyInitialized,
    #[error("escrow is bound to token {expected}, got {actual}")]
    TokenMismatch { expected: Address, actual: Address },
    #[error("amount must be greater than zero")]
    ZeroAmount,
    #[error("account {account} already holds a lock; withdraw old tokens first")]
    LockExists { account: Address },
    #[error("no existing lock found for {account}")]
    NoLock { account: Address },
    #[error("lock of {account} expired at {end}; withdraw first")]
    LockExpired { account: Address, end: Timestamp },
    #[error("lock of {account} does not expire until {end}")]
    LockNotExpired { account: Address, end: Timestamp },
    #[error("unlock time {unlock} is not in the future (now {now})")]
    UnlockNotInFuture { unlock: Timestamp, now: Timestamp },
    #[error("unlock time {unlock} does not extend current end {current}")]
    UnlockNotLater { unlock: Timestamp, current: Timestamp },
    #[error("unlock time {unlock} exceeds maximum lock end {max}")]
    LockTooLong { unlock: Timestamp, max: Timestamp },
    #[error("math overflow")]
    MathOverflow,
    #[error(transparent)]
    Token(#[from] TokenError),
}

/// Set once by `init`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EscrowConfig {
    pub admin: Address,
    pub token: Address,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DepositKind {
    DepositFor,
    CreateLock,
    IncreaseAmount,
    IncreaseUnlockTime,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EscrowEvent {
    Deposit {
        provider: Address,
        #[serde(with = "serde_amount")]
        value: Amount,
        locktime: Timestamp,
        kind: DepositKind,
        ts: Timestamp,
    },
    Withdraw {
        provider: Address,
        #[serde(with = "serde_amount")]
        value: Amount,
        ts: Timestamp,
    },
    Supply {
        #[serde(with = "serde_amount")]
        prev_supply: Amount,
        #[serde(with = "serde_amount")]
        supply: Amount,
    },
}

/// A lock change with every fallible computation already done.
struct DepositPlan {
    account: Address,
    value: Amount,
    old: LockedBalance,
    new: LockedBalance,
    old_point: Point,
    new_point: Point,
    supply: Amount,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteEscrow {
    address: Address,
    config: Option<EscrowConfig>,
    supply: Amount,
    locked: BTreeMap<Address, LockedBalance>,
    point_history: Vec<Point>,
    user_point_history: BTreeMap<Address, Vec<Point>>,
    slope_changes: BTreeMap<Timestamp, i128>,
    events: Vec<EscrowEvent>,
}

impl VoteEscrow {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            config: None,
            supply: 0,
            locked: BTreeMap::new(),
            point_history: Vec::new(),
            user_point_history: BTreeMap::new(),
            slope_changes: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn is_initialized(&self) -> bool {
        self.config.is_some()
    }

    pub fn config(&self) -> Option<&EscrowConfig> {
        self.config.as_ref()
    }

    pub fn admin(&self) -> Option<Address> {
        self.config.as_ref().map(|c| c.admin)
    }

    pub fn token(&self) -> Option<Address> {
        self.config.as_ref().map(|c| c.token)
    }

    /// Total tokens currently held in locks.
    pub fn supply(&self) -> Amount {
        self.supply
    }

    pub fn locked(&self, account: &Address) -> LockedBalance {
        self.locked.get(account).copied().unwrap_or_default()
    }

    pub fn lock_end(&self, account: &Address) -> Timestamp {
        self.locked(account).end
    }

    pub fn point_history(&self) -> &[Point] {
        &self.point_history
    }

    pub fn user_point_history(&self, account: &Address) -> &[Point] {
        self.user_point_history
            .get(account)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn slope_change(&self, ts: Timestamp) -> i128 {
        self.slope_changes.get(&ts).copied().unwrap_or(0)
    }

    pub fn events(&self) -> &[EscrowEvent] {
        &self.events
    }

    pub fn lockers(&self) -> impl Iterator<Item = (&Address, &LockedBalance)> {
        self.locked.iter().filter(|(_, l)| !l.is_empty())
    }

    pub fn init(
        &mut self,
        ctx: &CallContext,
        token: &dyn TokenLedger,
        name: &str,
        symbol: &str,
    ) -> Result<(), EscrowError> {
        if self.config.is_some() {
            return Err(EscrowError::AlreadyInitialized);
        }
        self.config = Some(EscrowConfig {
            admin: ctx.caller,
            token: token.address(),
            name: name.to_string(),
            symbol: symbol.to_string(),
            decimals: token.decimals(),
        });
        self.point_history.push(Point::origin(ctx.now));
        info!(escrow = %self.address, admin = %ctx.caller, token = %token.address(), name, symbol, "escrow initialized");
        Ok(())
    }

    pub fn create_lock(
        &mut self,
        ctx: &CallContext,
        token: &mut dyn TokenLedger,
        value: Amount,
        unlock_time: Timestamp,
    ) -> Result<(), EscrowError> {
        self.ensure_token(&*token)?;
        let unlock = epoch_floor(unlock_time);
        let locked = self.locked(&ctx.caller);

        if value == 0 {
            return Err(EscrowError::ZeroAmount);
        }
        if !locked.is_empty() {
            return Err(EscrowError::LockExists {
                account: ctx.caller,
            });
        }
        if unlock <= ctx.now {
            return Err(EscrowError::UnlockNotInFuture {
                unlock,
                now: ctx.now,
            });
        }
        let max = ctx.now + MAXTIME;
        if unlock > max {
            return Err(EscrowError::LockTooLong { unlock, max });
        }

        let plan = self.plan_deposit(ctx.caller, value, Some(unlock), locked, ctx.now)?;
        token.transfer_from(&self.address, &ctx.caller, &self.address, value)?;
        self.commit_deposit(plan, DepositKind::CreateLock, ctx.now);
        Ok(())
    }

    /// Add tokens to the caller's lock without changing its end.
    pub fn increase_amount(
        &mut self,
        ctx: &CallContext,
        token: &mut dyn TokenLedger,
        value: Amount,
    ) -> Result<(), EscrowError> {
        self.top_up(ctx, token, ctx.caller, value, DepositKind::IncreaseAmount)
    }

    /// Add tokens paid by the caller to another account's lock.
    pub fn deposit_for(
        &mut self,
        ctx: &CallContext,
        token: &mut dyn TokenLedger,
        account: Address,
        value: Amount,
    ) -> Result<(), EscrowError> {
        self.top_up(ctx, token, account, value, DepositKind::DepositFor)
    }

    pub fn increase_unlock_time(
        &mut self,
        ctx: &CallContext,
        unlock_time: Timestamp,
    ) -> Result<(), EscrowError> {
        self.ensure_initialized()?;
        let unlock = epoch_floor(unlock_time);
        let locked = self.locked(&ctx.caller);
        self.ensure_active(&ctx.caller, &locked, ctx.now)?;
        if unlock <= locked.end {
            return Err(EscrowError::UnlockNotLater {
                unlock,
                current: locked.end,
            });
        }
        let max = ctx.now + MAXTIME;
        if unlock > max {
            return Err(EscrowError::LockTooLong { unlock, max });
        }

        let plan = self.plan_deposit(ctx.caller, 0, Some(unlock), locked, ctx.now)?;
        self.commit_deposit(plan, DepositKind::IncreaseUnlockTime, ctx.now);
        Ok(())
    }

    /// Return all tokens of an expired lock to the caller.
    pub fn withdraw(
        &mut self,
        ctx: &CallContext,
        token: &mut dyn TokenLedger,
    ) -> Result<Amount, EscrowError> {
        self.ensure_token(&*token)?;
        let account = ctx.caller;
        let locked = self.locked(&account);
        if locked.is_empty() {
            return Err(EscrowError::NoLock { account });
        }
        if !locked.is_expired(ctx.now) {
            return Err(EscrowError::LockNotExpired {
                account,
                end: locked.end,
            });
        }

        let value = locked.amount;
        let prev_supply = self.supply;
        let supply = prev_supply.checked_sub(value).ok_or(EscrowError::MathOverflow)?;
        token.transfer(&self.address, &account, value)?;

        self.supply = supply;
        self.locked.remove(&account);
        let cleared = LockedBalance::default();
        self.write_checkpoint(
            Some(UserDelta {
                account,
                old: locked,
                new: cleared,
                old_point: Point::origin(ctx.now),
                new_point: Point::origin(ctx.now),
            }),
            ctx.now,
        );
        self.events.push(EscrowEvent::Withdraw {
            provider: account,
            value,
            ts: ctx.now,
        });
        self.events.push(EscrowEvent::Supply { prev_supply, supply });
        info!(escrow = %self.address, account = %account, value, "lock withdrawn");
        Ok(value)
    }

    /// Bring the global history up to `now`.
    pub fn checkpoint(&mut self, ctx: &CallContext) -> Result<(), EscrowError> {
        self.ensure_initialized()?;
        self.write_checkpoint(None, ctx.now);
        Ok(())
    }

    /// Voting weight of one account at `t`.
    pub fn balance_of(&self, account: &Address, t: Timestamp) -> Amount {
        let history = self.user_point_history(account);
        let idx = history.partition_point(|p| p.ts <= t);
        if idx == 0 {
            return 0;
        }
        history[idx - 1].weight_at(t)
    }

    /// Aggregate voting weight at `t`, past or future.
    pub fn total_supply_at(&self, t: Timestamp) -> Amount {
        let idx = self.point_history.partition_point(|p| p.ts <= t);
        if idx == 0 {
            return 0;
        }
        self.supply_at(self.point_history[idx - 1], t)
    }

    pub fn total_supply_at_future(&self, t: Timestamp) -> Amount {
        self.total_supply_at(t)
    }

    pub fn total_supply(&self, now: Timestamp) -> Amount {
        self.total_supply_at(now)
    }

    fn supply_at(&self, point: Point, t: Timestamp) -> Amount {
        let mut last = point;
        let mut t_i = epoch_floor(last.ts);
        loop {
            t_i += WEEK;
            let mut d_slope = 0;
            if t_i > t {
                t_i = t;
            } else {
                d_slope = self.slope_change(t_i);
            }
            last.bias -= last.slope * (t_i - last.ts) as i128;
            if t_i == t {
                break;
            }
            last.slope += d_slope;
            last.ts = t_i;
            if last.slope <= 0 {
                break;
            }
        }
        last.bias.max(0) as Amount
    }

    fn top_up(
        &mut self,
        ctx: &CallContext,
        token: &mut dyn TokenLedger,
        account: Address,
        value: Amount,
        kind: DepositKind,
    ) -> Result<(), EscrowError> {
        self.ensure_token(&*token)?;
        if value == 0 {
            return Err(EscrowError::ZeroAmount);
        }
        let locked = self.locked(&account);
        self.ensure_active(&account, &locked, ctx.now)?;

        let plan = self.plan_deposit(account, value, None, locked, ctx.now)?;
        token.transfer_from(&self.address, &ctx.caller, &self.address, value)?;
        self.commit_deposit(plan, kind, ctx.now);
        Ok(())
    }

    fn plan_deposit(
        &self,
        account: Address,
        value: Amount,
        unlock: Option<Timestamp>,
        old: LockedBalance,
        now: Timestamp,
    ) -> Result<DepositPlan, EscrowError> {
        let supply = self
            .supply
            .checked_add(value)
            .ok_or(EscrowError::MathOverflow)?;
        // every bias and slope is bounded by the locked supply
        i128::try_from(supply).map_err(|_| EscrowError::MathOverflow)?;

        let mut new = old;
        new.amount = new
            .amount
            .checked_add(value)
            .ok_or(EscrowError::MathOverflow)?;
        if let Some(end) = unlock {
            new.end = end;
        }
        Ok(DepositPlan {
            account,
            value,
            old,
            new,
            old_point: Point::for_lock(&old, now)?,
            new_point: Point::for_lock(&new, now)?,
            supply,
        })
    }

    fn commit_deposit(&mut self, plan: DepositPlan, kind: DepositKind, now: Timestamp) {
        let prev_supply = self.supply;
        self.supply = plan.supply;
        self.locked.insert(plan.account, plan.new);
        self.write_checkpoint(
            Some(UserDelta {
                account: plan.account,
                old: plan.old,
                new: plan.new,
                old_point: plan.old_point,
                new_point: plan.new_point,
            }),
            now,
        );
        self.events.push(EscrowEvent::Deposit {
            provider: plan.account,
            value: plan.value,
            locktime: plan.new.end,
            kind,
            ts: now,
        });
        self.events.push(EscrowEvent::Supply {
            prev_supply,
            supply: plan.supply,
        });
        info!(
            escrow = %self.address,
            account = %plan.account,
            value = plan.value,
            end = plan.new.end,
            ?kind,
            "lock updated"
        );
    }

    fn write_checkpoint(&mut self, user: Option<UserDelta>, now: Timestamp) {
        let (mut old_dslope, mut new_dslope) = match &user {
            Some(delta) => {
                let old = self.slope_change(delta.old.end);
                let new = if delta.new.end == delta.old.end {
                    old
                } else {
                    self.slope_change(delta.new.end)
                };
                (old, new)
            }
            None => (0, 0),
        };

        let mut last = self
            .point_history
            .last()
            .copied()
            .unwrap_or_else(|| Point::origin(now));
        let now = now.max(last.ts);
        let mut t_i = epoch_floor(last.ts);
        let mut filled = 0usize;
        loop {
            t_i += WEEK;
            let mut d_slope = 0;
            if t_i > now {
                t_i = now;
            } else {
                d_slope = self.slope_change(t_i);
            }
            last.bias = (last.bias - last.slope * (t_i - last.ts) as i128).max(0);
            last.slope = (last.slope + d_slope).max(0);
            last.ts = t_i;
            if t_i == now {
                break;
            }
            self.point_history.push(last);
            filled += 1;
        }

        if let Some(delta) = &user {
            last.slope = (last.slope + delta.new_point.slope - delta.old_point.slope).max(0);
            last.bias = (last.bias + delta.new_point.bias - delta.old_point.bias).max(0);
        }
        self.point_history.push(last);
        debug!(epoch = self.point_history.len() - 1, filled, bias = last.bias, slope = last.slope, "checkpoint");

        let Some(delta) = user else {
            return;
        };
        if delta.old.end > now {
            old_dslope += delta.old_point.slope;
            if delta.new.end == delta.old.end {
                old_dslope -= delta.new_point.slope;
            }
            self.set_slope_change(delta.old.end, old_dslope);
        }
        if delta.new.end > now && delta.new.end > delta.old.end {
            new_dslope -= delta.new_point.slope;
            self.set_slope_change(delta.new.end, new_dslope);
        }
        self.user_point_history
            .entry(delta.account)
            .or_default()
            .push(delta.new_point);
    }

    fn set_slope_change(&mut self, ts: Timestamp, d_slope: i128) {
        if d_slope == 0 {
            self.slope_changes.remove(&ts);
        } else {
            self.slope_changes.insert(ts, d_slope);
        }
    }

    fn ensure_initialized(&self) -> Result<&EscrowConfig, EscrowError> {
        self.config.as_ref().ok_or(EscrowError::NotInitialized)
    }

    fn ensure_token(&self, token: &dyn TokenLedger) -> Result<(), EscrowError> {
        let config = self.ensure_initialized()?;
        if config.token != token.address() {
            return Err(EscrowError::TokenMismatch {
                expected: config.token,
                actual: token.address(),
            });
        }
        Ok(())
    }

    fn ensure_active(
        &self,
        account: &Address,
        locked: &LockedBalance,
        now: Timestamp,
    ) -> Result<(), EscrowError> {
        if locked.is_empty() {
            return Err(EscrowError::NoLock { account: *account });
        }
        if locked.is_expired(now) {
            return Err(EscrowError::LockExpired {
                account: *account,
                end: locked.end,
            });
        }
        Ok(())
    }
}

struct UserDelta {
    account: Address,
    old: LockedBalance,
    new: LockedBalance,
    old_point: Point,
    new_point: Point,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{TestToken, TokenMetadata};
    use crate::units::{to_ether, to_wei, tokens};

    // Thursday 2024-06-13 10:00:00 UTC, mid-epoch
    const NOW: Timestamp = 1_718_272_800;

    struct Fixture {
        token: TestToken,
        escrow: VoteEscrow,
        founder: Address,
        u1: Address,
        u2: Address,
    }

    fn fixture() -> Fixture {
        let founder = Address::from_label("founder");
        let u1 = Address::from_label("u1");
        let u2 = Address::from_label("u2");
        let mut token = TestToken::new(
            Address::for_contract(&founder, 0),
            founder,
            tokens(1_000_000_000),
            TokenMetadata::default(),
        );
        token.transfer(&founder, &u1, to_wei(1000.0)).unwrap();
        token.transfer(&founder, &u2, to_wei(1000.0)).unwrap();
        let mut escrow = VoteEscrow::new(Address::for_contract(&founder, 1));
        escrow
            .init(&CallContext::new(founder, NOW), &token, "vcDORA", "VCD")
            .unwrap();
        for user in [u1, u2] {
            token.approve(&user, &escrow.address(), to_wei(1e5));
        }
        Fixture {
            token,
            escrow,
            founder,
            u1,
            u2,
        }
    }

    fn epochs() -> Vec<Timestamp> {
        (0..10).map(|i| epoch_floor(NOW) + i * WEEK).collect()
    }

    #[test]
    fn init_sets_admin_once() {
        let mut f = fixture();
        assert_eq!(f.escrow.admin(), Some(f.founder));
        let config = f.escrow.config().unwrap();
        assert_eq!(config.symbol, "VCD");
        assert_eq!(config.decimals, 18);
        let err = f
            .escrow
            .init(&CallContext::new(f.u1, NOW), &f.token, "other", "OTH")
            .unwrap_err();
        assert_eq!(err, EscrowError::AlreadyInitialized);
        assert_eq!(f.escrow.admin(), Some(f.founder));
    }

    #[test]
    fn uninitialized_escrow_rejects_locks() {
        let mut f = fixture();
        let mut fresh = VoteEscrow::new(Address::from_label("fresh"));
        let err = fresh
            .create_lock(&CallContext::new(f.u1, NOW), &mut f.token, tokens(1), NOW + 4 * WEEK)
            .unwrap_err();
        assert_eq!(err, EscrowError::NotInitialized);
        assert_eq!(fresh.total_supply_at(NOW + WEEK), 0);
        assert_eq!(fresh.admin(), None);
    }

    #[test]
    fn supply_decays_across_epochs() {
        let mut f = fixture();
        let epoch = epochs();

        f.escrow
            .create_lock(&CallContext::new(f.u1, NOW), &mut f.token, to_wei(208.0), NOW + 208 * WEEK)
            .unwrap();
        assert_eq!(to_ether(f.escrow.total_supply_at_future(epoch[1])), 207.0);

        f.escrow
            .create_lock(&CallContext::new(f.u2, NOW), &mut f.token, to_wei(208.0), NOW + 2 * WEEK)
            .unwrap();
        assert_eq!(to_ether(f.escrow.total_supply_at_future(epoch[1])), 208.0);
        assert_eq!(to_ether(f.escrow.total_supply_at_future(epoch[2])), 206.0);
        assert_eq!(to_ether(f.escrow.total_supply_at_future(epoch[3])), 205.0);

        assert_eq!(f.escrow.lock_end(&f.u2), epoch[2]);
        assert_eq!(f.escrow.balance_of(&f.u2, epoch[2]), 0);
        assert_eq!(f.escrow.supply(), to_wei(416.0));
        assert_eq!(f.token.balance_of(&f.escrow.address()), to_wei(416.0));
        assert_eq!(f.token.balance_of(&f.u1), to_wei(792.0));
    }

    #[test]
    fn repeated_queries_are_stable() {
        let mut f = fixture();
        f.escrow
            .create_lock(&CallContext::new(f.u1, NOW), &mut f.token, to_wei(50.0), NOW + 10 * WEEK)
            .unwrap();
        let t = NOW + 3 * WEEK;
        let first = f.escrow.total_supply_at_future(t);
        assert_eq!(first, f.escrow.total_supply_at_future(t));
        assert_eq!(f.escrow.balance_of(&f.u1, t), f.escrow.balance_of(&f.u1, t));
    }

    #[test]
    fn supply_before_first_lock_and_after_expiry_is_zero() {
        let mut f = fixture();
        f.escrow
            .create_lock(&CallContext::new(f.u1, NOW), &mut f.token, to_wei(100.0), NOW + 3 * WEEK)
            .unwrap();
        assert_eq!(f.escrow.total_supply_at(NOW - 1), 0);
        assert_eq!(f.escrow.total_supply_at(epoch_floor(NOW + 3 * WEEK)), 0);
        assert_eq!(f.escrow.total_supply_at(NOW + 300 * WEEK), 0);
        assert_eq!(f.escrow.balance_of(&f.u1, NOW - 1), 0);
    }

    #[test]
    fn weight_at_creation_matches_locked_amount_for_full_term() {
        let mut f = fixture();
        let start = epoch_floor(NOW) + WEEK;
        f.escrow
            .create_lock(&CallContext::new(f.u1, start), &mut f.token, to_wei(208.0), start + MAXTIME)
            .unwrap();
        assert_eq!(to_ether(f.escrow.balance_of(&f.u1, start)), 208.0);
        assert_eq!(to_ether(f.escrow.total_supply_at(start)), 208.0);
    }

    #[test]
    fn create_lock_validation() {
        let mut f = fixture();
        let ctx = CallContext::new(f.u1, NOW);
        assert_eq!(
            f.escrow.create_lock(&ctx, &mut f.token, 0, NOW + 2 * WEEK),
            Err(EscrowError::ZeroAmount)
        );
        // snaps down to the current epoch, which is already past
        assert!(matches!(
            f.escrow.create_lock(&ctx, &mut f.token, tokens(1), NOW + 60),
            Err(EscrowError::UnlockNotInFuture { .. })
        ));
        assert!(matches!(
            f.escrow.create_lock(&ctx, &mut f.token, tokens(1), NOW + MAXTIME + 2 * WEEK),
            Err(EscrowError::LockTooLong { .. })
        ));
        f.escrow
            .create_lock(&ctx, &mut f.token, tokens(1), NOW + 2 * WEEK)
            .unwrap();
        assert_eq!(
            f.escrow.create_lock(&ctx, &mut f.token, tokens(1), NOW + 4 * WEEK),
            Err(EscrowError::LockExists { account: f.u1 })
        );
    }

    #[test]
    fn failed_lock_leaves_no_trace() {
        let mut f = fixture();
        let stranger = Address::from_label("stranger");
        f.token.transfer(&f.founder, &stranger, tokens(10)).unwrap();
        let escrow_before = f.escrow.clone();
        let token_before = f.token.clone();

        // no allowance granted
        let err = f
            .escrow
            .create_lock(&CallContext::new(stranger, NOW), &mut f.token, tokens(5), NOW + 4 * WEEK)
            .unwrap_err();
        assert!(matches!(err, EscrowError::Token(TokenError::InsufficientAllowance { .. })));
        assert_eq!(f.escrow, escrow_before);
        assert_eq!(f.token, token_before);

        // allowance but not enough balance
        f.token.approve(&stranger, &f.escrow.address(), tokens(100));
        let err = f
            .escrow
            .create_lock(&CallContext::new(stranger, NOW), &mut f.token, tokens(50), NOW + 4 * WEEK)
            .unwrap_err();
        assert!(matches!(err, EscrowError::Token(TokenError::InsufficientBalance { .. })));
        assert_eq!(f.escrow, escrow_before);
    }

    #[test]
    fn wrong_token_is_rejected() {
        let mut f = fixture();
        let mut other = TestToken::new(
            Address::from_label("other-token"),
            f.u1,
            tokens(10),
            TokenMetadata::default(),
        );
        let err = f
            .escrow
            .create_lock(&CallContext::new(f.u1, NOW), &mut other, tokens(1), NOW + 4 * WEEK)
            .unwrap_err();
        assert!(matches!(err, EscrowError::TokenMismatch { .. }));
    }

    #[test]
    fn withdraw_only_after_expiry() {
        let mut f = fixture();
        let end = epoch_floor(NOW + 3 * WEEK);
        f.escrow
            .create_lock(&CallContext::new(f.u1, NOW), &mut f.token, tokens(100), end)
            .unwrap();

        let early = CallContext::new(f.u1, end - 1);
        assert_eq!(
            f.escrow.withdraw(&early, &mut f.token),
            Err(EscrowError::LockNotExpired { account: f.u1, end })
        );

        let ctx = CallContext::new(f.u1, end);
        assert_eq!(f.escrow.withdraw(&ctx, &mut f.token).unwrap(), tokens(100));
        assert_eq!(f.token.balance_of(&f.u1), tokens(1000));
        assert_eq!(f.escrow.supply(), 0);
        assert!(f.escrow.locked(&f.u1).is_empty());
        assert_eq!(f.escrow.balance_of(&f.u1, end), 0);
        assert_eq!(
            f.escrow.withdraw(&ctx, &mut f.token),
            Err(EscrowError::NoLock { account: f.u1 })
        );

        // a fresh lock is allowed once the old one is gone
        f.escrow
            .create_lock(&ctx, &mut f.token, tokens(10), end + 4 * WEEK)
            .unwrap();
    }

    #[test]
    fn increase_amount_keeps_end_and_adds_weight() {
        let mut f = fixture();
        let ctx = CallContext::new(f.u1, NOW);
        let end = epoch_floor(NOW + 10 * WEEK);
        f.escrow.create_lock(&ctx, &mut f.token, tokens(100), end).unwrap();
        let before = f.escrow.balance_of(&f.u1, NOW + WEEK);

        let later = CallContext::new(f.u1, NOW + WEEK);
        f.escrow.increase_amount(&later, &mut f.token, tokens(100)).unwrap();
        let locked = f.escrow.locked(&f.u1);
        assert_eq!(locked.amount, tokens(200));
        assert_eq!(locked.end, end);
        assert!(f.escrow.balance_of(&f.u1, NOW + WEEK) > before);
        assert_eq!(
            f.escrow.total_supply_at(NOW + 2 * WEEK),
            f.escrow.balance_of(&f.u1, NOW + 2 * WEEK)
        );

        let expired = CallContext::new(f.u1, end);
        assert!(matches!(
            f.escrow.increase_amount(&expired, &mut f.token, tokens(1)),
            Err(EscrowError::LockExpired { .. })
        ));
        assert_eq!(
            f.escrow.increase_amount(&CallContext::new(f.u2, NOW), &mut f.token, tokens(1)),
            Err(EscrowError::NoLock { account: f.u2 })
        );
    }

    #[test]
    fn increase_unlock_time_extends_decay() {
        let mut f = fixture();
        let ctx = CallContext::new(f.u1, NOW);
        let end = epoch_floor(NOW + 4 * WEEK);
        f.escrow.create_lock(&ctx, &mut f.token, tokens(100), end).unwrap();
        assert_eq!(f.escrow.total_supply_at(end), 0);

        assert!(matches!(
            f.escrow.increase_unlock_time(&ctx, end),
            Err(EscrowError::UnlockNotLater { .. })
        ));
        f.escrow.increase_unlock_time(&ctx, end + 4 * WEEK).unwrap();
        assert_eq!(f.escrow.lock_end(&f.u1), end + 4 * WEEK);
        assert!(f.escrow.total_supply_at(end) > 0);
        assert_eq!(f.escrow.total_supply_at(end + 4 * WEEK), 0);
        assert_eq!(f.escrow.slope_change(end), 0);
        assert!(f.escrow.slope_change(end + 4 * WEEK) < 0);
    }

    #[test]
    fn deposit_for_is_paid_by_caller() {
        let mut f = fixture();
        f.escrow
            .create_lock(&CallContext::new(f.u1, NOW), &mut f.token, tokens(10), NOW + 8 * WEEK)
            .unwrap();
        f.escrow
            .deposit_for(&CallContext::new(f.u2, NOW), &mut f.token, f.u1, tokens(5))
            .unwrap();
        assert_eq!(f.escrow.locked(&f.u1).amount, tokens(15));
        assert_eq!(f.token.balance_of(&f.u2), tokens(995));
        assert!(f.escrow.locked(&f.u2).is_empty());
    }

    #[test]
    fn total_supply_matches_sum_of_balances() {
        let mut f = fixture();
        let lockers: Vec<(Address, u64, Timestamp)> = (0..5)
            .map(|i| (Address::from_label(&format!("locker-{i}")), 10 + i * 7, NOW + (i + 2) * 9 * WEEK))
            .collect();
        for (idx, (who, amount, end)) in lockers.iter().enumerate() {
            f.token.transfer(&f.founder, who, tokens(*amount)).unwrap();
            f.token.approve(who, &f.escrow.address(), tokens(*amount));
            let at = NOW + idx as Timestamp * 3600;
            f.escrow
                .create_lock(&CallContext::new(*who, at), &mut f.token, tokens(*amount), *end)
                .unwrap();
        }
        let start = NOW + 5 * 3600;
        for week in 1..60 {
            let t = epoch_floor(start) + week * WEEK;
            let summed: Amount = lockers.iter().map(|(who, _, _)| f.escrow.balance_of(who, t)).sum();
            let total = f.escrow.total_supply_at(t);
            let tolerance = lockers.len() as Amount * 2;
            assert!(
                total.abs_diff(summed) <= tolerance,
                "week {week}: total {total} vs summed {summed}"
            );
        }
    }

    #[test]
    fn checkpoint_fills_weekly_history() {
        let mut f = fixture();
        f.escrow
            .create_lock(&CallContext::new(f.u1, NOW), &mut f.token, tokens(100), NOW + 20 * WEEK)
            .unwrap();
        let len = f.escrow.point_history().len();
        let later = NOW + 5 * WEEK;
        f.escrow.checkpoint(&CallContext::new(f.founder, later)).unwrap();
        assert_eq!(f.escrow.point_history().len(), len + 6);
        let summary = f.escrow.total_supply_at(later);
        assert_eq!(summary, f.escrow.balance_of(&f.u1, later));
        let ts: Vec<Timestamp> = f.escrow.point_history().iter().map(|p| p.ts).collect();
        assert!(ts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn events_record_deposits_and_supply() {
        let mut f = fixture();
        f.escrow
            .create_lock(&CallContext::new(f.u1, NOW), &mut f.token, tokens(3), NOW + 4 * WEEK)
            .unwrap();
        match &f.escrow.events()[..] {
            [EscrowEvent::Deposit { provider, value, kind, .. }, EscrowEvent::Supply { prev_supply, supply }] => {
                assert_eq!(*provider, f.u1);
                assert_eq!(*value, tokens(3));
                assert_eq!(*kind, DepositKind::CreateLock);
                assert_eq!(*prev_supply, 0);
                assert_eq!(*supply, tokens(3));
            }
            other => panic!("unexpected events {other:?}"),
        }
    }
}
