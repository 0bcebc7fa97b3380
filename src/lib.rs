//! Vote-escrow ledger toolkit.
//!
//! This crate models a small contract host with two residents:
//!
//! * [`ledger`]: `TestToken`, a fungible balance ledger with allowances.
//! * [`escrow`]: `vcDORA`, a vote-escrow ledger whose locks grant voting
//!   weight decaying linearly to zero at a week-aligned unlock time.
//!
//! [`host`] executes calls against them serially and persists the result,
//! [`config`] carries the CLI settings, and [`units`] holds the week/decimal
//! constants plus the fixed-point helpers used to talk about amounts.

pub mod clock;
pub mod config;
pub mod escrow;
pub mod host;
pub mod ledger;
pub mod types;
pub mod units;

pub use clock::{Clock, ManualClock, SystemClock};
pub use escrow::{EscrowError, VoteEscrow};
pub use host::{Call, Host, HostError};
pub use ledger::{TestToken, TokenError, TokenLedger};
pub use types::{Address, Amount, CallContext, Timestamp};
