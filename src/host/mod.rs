//! Serial call runtime hosting token and escrow contracts.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::escrow::{EscrowError, VoteEscrow};
use crate::ledger::{TestToken, TokenError, TokenLedger, TokenMetadata};
use crate::types::{Address, Amount, CallContext, Timestamp};
use crate::units::serde_amount;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("no contract deployed at {0}")]
    UnknownContract(Address),
    #[error("no {0} deployed")]
    NoDeployment(&'static str),
    #[error("clock moved backwards: now {now}, last call at {last}")]
    ClockWentBackwards { now: Timestamp, last: Timestamp },
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Escrow(#[from] EscrowError),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Call {
    Transfer {
        token: Address,
        to: Address,
        #[serde(with = "serde_amount")]
        amount: Amount,
    },
    Approve {
        token: Address,
        spender: Address,
        #[serde(with = "serde_amount")]
        amount: Amount,
    },
    TransferFrom {
        token: Address,
        from: Address,
        to: Address,
        #[serde(with = "serde_amount")]
        amount: Amount,
    },
    Init {
        escrow: Address,
        token: Address,
        name: String,
        symbol: String,
    },
    CreateLock {
        escrow: Address,
        #[serde(with = "serde_amount")]
        amount: Amount,
        unlock_time: Timestamp,
    },
    IncreaseAmount {
        escrow: Address,
        #[serde(with = "serde_amount")]
        amount: Amount,
    },
    IncreaseUnlockTime {
        escrow: Address,
        unlock_time: Timestamp,
    },
    DepositFor {
        escrow: Address,
        account: Address,
        #[serde(with = "serde_amount")]
        amount: Amount,
    },
    Withdraw {
        escrow: Address,
    },
    Checkpoint {
        escrow: Address,
    },
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::Transfer { .. } => "transfer",
            Call::Approve { .. } => "approve",
            Call::TransferFrom { .. } => "transfer_from",
            Call::Init { .. } => "init",
            Call::CreateLock { .. } => "create_lock",
            Call::IncreaseAmount { .. } => "increase_amount",
            Call::IncreaseUnlockTime { .. } => "increase_unlock_time",
            Call::DepositFor { .. } => "deposit_for",
            Call::Withdraw { .. } => "withdraw",
            Call::Checkpoint { .. } => "checkpoint",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receipt {
    pub id: String,
    pub height: u64,
    pub caller: Address,
    pub timestamp: Timestamp,
    pub call: Call,
}

impl Receipt {
    fn digest(previous: Option<&str>, caller: &Address, timestamp: Timestamp, call: &Call) -> Result<String, HostError> {
        let mut hasher = Sha256::new();
        hasher.update(previous.unwrap_or_default().as_bytes());
        hasher.update(caller.as_bytes());
        hasher.update(timestamp.to_le_bytes());
        hasher.update(serde_json::to_vec(call)?);
        Ok(hex::encode(hasher.finalize()))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SnapshotMetadata {
    pub height: u64,
    pub timestamp: Timestamp,
    pub last_receipt: Option<String>,
}

/// Everything the host persists.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct HostSnapshot {
    pub meta: SnapshotMetadata,
    pub deploy_nonce: u64,
    pub primary_token: Option<Address>,
    pub primary_escrow: Option<Address>,
    pub tokens: BTreeMap<Address, TestToken>,
    pub escrows: BTreeMap<Address, VoteEscrow>,
    pub receipts: Vec<Receipt>,
}

pub struct Host {
    state: HostSnapshot,
    clock: Box<dyn Clock>,
}

impl Host {
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self::from_snapshot(HostSnapshot::default(), clock)
    }

    pub fn from_snapshot(state: HostSnapshot, clock: impl Clock + 'static) -> Self {
        Self {
            state,
            clock: Box::new(clock),
        }
    }

    pub fn load(path: &Path, clock: impl Clock + 'static) -> Result<Self, HostError> {
        let bytes = fs::read(path).map_err(|source| HostError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let state: HostSnapshot = serde_json::from_slice(&bytes)?;
        Ok(Self::from_snapshot(state, clock))
    }

    /// Write the snapshot next to `path` and rename it into place.
    pub fn save(&self, path: &Path) -> Result<(), HostError> {
        let io_err = |source| HostError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let encoded = serde_json::to_vec_pretty(&self.state)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, encoded).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }

    pub fn snapshot(&self) -> &HostSnapshot {
        &self.state
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn deploy_token(
        &mut self,
        deployer: Address,
        founder: Address,
        initial_supply: Amount,
        metadata: TokenMetadata,
    ) -> Address {
        let address = self.next_address(&deployer);
        info!(token = %address, founder = %founder, initial_supply, symbol = %metadata.symbol, "token deployed");
        self.state.tokens.insert(
            address,
            TestToken::new(address, founder, initial_supply, metadata),
        );
        self.state.primary_token.get_or_insert(address);
        address
    }

    pub fn deploy_escrow(&mut self, deployer: Address) -> Address {
        let address = self.next_address(&deployer);
        info!(escrow = %address, deployer = %deployer, "escrow deployed");
        self.state.escrows.insert(address, VoteEscrow::new(address));
        self.state.primary_escrow.get_or_insert(address);
        address
    }

    pub fn token(&self, address: &Address) -> Result<&TestToken, HostError> {
        self.state
            .tokens
            .get(address)
            .ok_or(HostError::UnknownContract(*address))
    }

    pub fn escrow(&self, address: &Address) -> Result<&VoteEscrow, HostError> {
        self.state
            .escrows
            .get(address)
            .ok_or(HostError::UnknownContract(*address))
    }

    pub fn primary_token(&self) -> Result<&TestToken, HostError> {
        let address = self.state.primary_token.ok_or(HostError::NoDeployment("token"))?;
        self.token(&address)
    }

    pub fn primary_escrow(&self) -> Result<&VoteEscrow, HostError> {
        let address = self
            .state
            .primary_escrow
            .ok_or(HostError::NoDeployment("escrow"))?;
        self.escrow(&address)
    }

    pub fn receipts(&self) -> &[Receipt] {
        &self.state.receipts
    }

    /// Run one call at the current clock time. A failed call changes nothing.
    pub fn execute(&mut self, caller: Address, call: Call) -> Result<&Receipt, HostError> {
        let now = self.clock.now();
        let last = self.state.meta.timestamp;
        if now < last {
            return Err(HostError::ClockWentBackwards { now, last });
        }
        let id = Receipt::digest(self.state.meta.last_receipt.as_deref(), &caller, now, &call)?;
        let ctx = CallContext::new(caller, now);
        if let Err(err) = self.dispatch(&ctx, &call) {
            warn!(call = call.name(), caller = %caller, error = %err, "call rejected");
            return Err(err);
        }

        self.state.meta.height += 1;
        self.state.meta.timestamp = now;
        self.state.meta.last_receipt = Some(id.clone());
        self.state.receipts.push(Receipt {
            id,
            height: self.state.meta.height,
            caller,
            timestamp: now,
            call,
        });
        Ok(&self.state.receipts[self.state.receipts.len() - 1])
    }

    fn dispatch(&mut self, ctx: &CallContext, call: &Call) -> Result<(), HostError> {
        match call {
            Call::Transfer { token, to, amount } => {
                self.token_mut(token)?.transfer(&ctx.caller, to, *amount)?;
            }
            Call::Approve {
                token,
                spender,
                amount,
            } => {
                self.token_mut(token)?.approve(&ctx.caller, spender, *amount);
            }
            Call::TransferFrom {
                token,
                from,
                to,
                amount,
            } => {
                self.token_mut(token)?
                    .transfer_from(&ctx.caller, from, to, *amount)?;
            }
            Call::Init {
                escrow,
                token,
                name,
                symbol,
            } => {
                let token = self
                    .state
                    .tokens
                    .get(token)
                    .ok_or(HostError::UnknownContract(*token))?;
                let escrow = self
                    .state
                    .escrows
                    .get_mut(escrow)
                    .ok_or(HostError::UnknownContract(*escrow))?;
                escrow.init(ctx, token, name, symbol)?;
            }
            Call::CreateLock {
                escrow,
                amount,
                unlock_time,
            } => {
                let (escrow, token) = self.escrow_and_token(escrow)?;
                escrow.create_lock(ctx, token, *amount, *unlock_time)?;
            }
            Call::IncreaseAmount { escrow, amount } => {
                let (escrow, token) = self.escrow_and_token(escrow)?;
                escrow.increase_amount(ctx, token, *amount)?;
            }
            Call::IncreaseUnlockTime {
                escrow,
                unlock_time,
            } => {
                self.escrow_mut(escrow)?
                    .increase_unlock_time(ctx, *unlock_time)?;
            }
            Call::DepositFor {
                escrow,
                account,
                amount,
            } => {
                let (escrow, token) = self.escrow_and_token(escrow)?;
                escrow.deposit_for(ctx, token, *account, *amount)?;
            }
            Call::Withdraw { escrow } => {
                let (escrow, token) = self.escrow_and_token(escrow)?;
                escrow.withdraw(ctx, token)?;
            }
            Call::Checkpoint { escrow } => {
                self.escrow_mut(escrow)?.checkpoint(ctx)?;
            }
        }
        Ok(())
    }

    fn token_mut(&mut self, address: &Address) -> Result<&mut TestToken, HostError> {
        self.state
            .tokens
            .get_mut(address)
            .ok_or(HostError::UnknownContract(*address))
    }

    fn escrow_mut(&mut self, address: &Address) -> Result<&mut VoteEscrow, HostError> {
        self.state
            .escrows
            .get_mut(address)
            .ok_or(HostError::UnknownContract(*address))
    }

    fn escrow_and_token(
        &mut self,
        address: &Address,
    ) -> Result<(&mut VoteEscrow, &mut dyn TokenLedger), HostError> {
        let escrow = self
            .state
            .escrows
            .get_mut(address)
            .ok_or(HostError::UnknownContract(*address))?;
        let token_address = escrow.token().ok_or(EscrowError::NotInitialized)?;
        let token: &mut dyn TokenLedger = self
            .state
            .tokens
            .get_mut(&token_address)
            .ok_or(HostError::UnknownContract(token_address))?;
        Ok((escrow, token))
    }

    fn next_address(&mut self, deployer: &Address) -> Address {
        let address = Address::for_contract(deployer, self.state.deploy_nonce);
        self.state.deploy_nonce += 1;
        address
    }
}
