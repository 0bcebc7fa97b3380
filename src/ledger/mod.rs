//! Fungible balance ledger ("TestToken").

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::types::{Address, Amount};
use crate::units::{serde_amount, DECIMALS};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("insufficient balance in account {account}: have {available}, need {required}")]
    InsufficientBalance {
        account: Address,
        available: Amount,
        required: Amount,
    },
    #[error("insufficient allowance from {owner} to {spender}: have {available}, need {required}")]
    InsufficientAllowance {
        owner: Address,
        spender: Address,
        available: Amount,
        required: Amount,
    },
    #[error("transfer to the zero address")]
    ZeroAddress,
    #[error("balance overflow in account {account}")]
    Overflow { account: Address },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenMetadata {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

impl Default for TokenMetadata {
    fn default() -> Self {
        Self {
            name: "TestToken".into(),
            symbol: "TST".into(),
            decimals: DECIMALS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TokenEvent {
    Transfer {
        from: Address,
        to: Address,
        #[serde(with = "serde_amount")]
        value: Amount,
    },
    Approval {
        owner: Address,
        spender: Address,
        #[serde(with = "serde_amount")]
        value: Amount,
    },
}

/// What the escrow needs from the token it custodies.
pub trait TokenLedger {
    fn address(&self) -> Address;

    fn decimals(&self) -> u8;

    fn balance_of(&self, account: &Address) -> Amount;

    fn transfer(&mut self, caller: &Address, to: &Address, amount: Amount) -> Result<(), TokenError>;

    fn transfer_from(
        &mut self,
        spender: &Address,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), TokenError>;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestToken {
    address: Address,
    metadata: TokenMetadata,
    total_supply: Amount,
    balances: BTreeMap<Address, Amount>,
    allowances: BTreeMap<Address, BTreeMap<Address, Amount>>,
    events: Vec<TokenEvent>,
}

impl TestToken {
    /// Deploy a token at `address`, minting `initial_supply` base units to `founder`.
    pub fn new(
        address: Address,
        founder: Address,
        initial_supply: Amount,
        metadata: TokenMetadata,
    ) -> Self {
        let mut balances = BTreeMap::new();
        balances.insert(founder, initial_supply);
        Self {
            address,
            metadata,
            total_supply: initial_supply,
            balances,
            allowances: BTreeMap::new(),
            events: vec![TokenEvent::Transfer {
                from: Address::ZERO,
                to: founder,
                value: initial_supply,
            }],
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn symbol(&self) -> &str {
        &self.metadata.symbol
    }

    pub fn metadata(&self) -> &TokenMetadata {
        &self.metadata
    }

    pub fn total_supply(&self) -> Amount {
        self.total_supply
    }

    pub fn allowance(&self, owner: &Address, spender: &Address) -> Amount {
        self.allowances
            .get(owner)
            .and_then(|m| m.get(spender))
            .copied()
            .unwrap_or(0)
    }

    pub fn events(&self) -> &[TokenEvent] {
        &self.events
    }

    pub fn holders(&self) -> impl Iterator<Item = (&Address, &Amount)> {
        self.balances.iter().filter(|(_, b)| **b > 0)
    }

    pub fn approve(&mut self, caller: &Address, spender: &Address, amount: Amount) {
        self.allowances
            .entry(*caller)
            .or_default()
            .insert(*spender, amount);
        self.events.push(TokenEvent::Approval {
            owner: *caller,
            spender: *spender,
            value: amount,
        });
        debug!(owner = %caller, spender = %spender, amount, "approval set");
    }

    /// Merkle root over balances and allowances.
    pub fn state_root(&self) -> [u8; 32] {
        let mut leaves: Vec<[u8; 32]> = Vec::new();
        for (account, balance) in &self.balances {
            let mut hasher = Sha256::new();
            hasher.update(b"bal");
            hasher.update(account.as_bytes());
            hasher.update(balance.to_le_bytes());
            leaves.push(hasher.finalize().into());
        }
        for (owner, spenders) in &self.allowances {
            for (spender, amount) in spenders {
                let mut hasher = Sha256::new();
                hasher.update(b"allow");
                hasher.update(owner.as_bytes());
                hasher.update(spender.as_bytes());
                hasher.update(amount.to_le_bytes());
                leaves.push(hasher.finalize().into());
            }
        }
        build_merkle(leaves)
    }

    fn move_balance(&mut self, from: &Address, to: &Address, amount: Amount) -> Result<(), TokenError> {
        if to.is_zero() {
            return Err(TokenError::ZeroAddress);
        }
        let available = self.balance_of(from);
        if available < amount {
            return Err(TokenError::InsufficientBalance {
                account: *from,
                available,
                required: amount,
            });
        }
        if from != to {
            let credited = self
                .balance_of(to)
                .checked_add(amount)
                .ok_or(TokenError::Overflow { account: *to })?;
            self.balances.insert(*from, available - amount);
            self.balances.insert(*to, credited);
        }
        self.events.push(TokenEvent::Transfer {
            from: *from,
            to: *to,
            value: amount,
        });
        debug!(from = %from, to = %to, amount, "transfer");
        Ok(())
    }
}

impl TokenLedger for TestToken {
    fn address(&self) -> Address {
        self.address
    }

    fn decimals(&self) -> u8 {
        self.metadata.decimals
    }

    fn balance_of(&self, account: &Address) -> Amount {
        self.balances.get(account).copied().unwrap_or(0)
    }

    fn transfer(&mut self, caller: &Address, to: &Address, amount: Amount) -> Result<(), TokenError> {
        self.move_balance(caller, to, amount)
    }

    fn transfer_from(
        &mut self,
        spender: &Address,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), TokenError> {
        let allowed = self.allowance(from, spender);
        if allowed < amount {
            return Err(TokenError::InsufficientAllowance {
                owner: *from,
                spender: *spender,
                available: allowed,
                required: amount,
            });
        }
        self.move_balance(from, to, amount)?;
        self.allowances
            .entry(*from)
            .or_default()
            .insert(*spender, allowed - amount);
        Ok(())
    }
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"vcdora-token-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for pair in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(pair[0]);
            hasher.update(pair.get(1).unwrap_or(&pair[0]));
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::tokens;

    use proptest::prelude::*;

    fn fixture() -> (TestToken, Address, Address, Address) {
        let founder = Address::from_label("founder");
        let u1 = Address::from_label("u1");
        let u2 = Address::from_label("u2");
        let token = TestToken::new(
            Address::for_contract(&founder, 0),
            founder,
            tokens(1_000_000),
            TokenMetadata::default(),
        );
        (token, founder, u1, u2)
    }

    #[test]
    fn founder_receives_initial_supply() {
        let (token, founder, u1, _) = fixture();
        assert_eq!(token.balance_of(&founder), tokens(1_000_000));
        assert_eq!(token.balance_of(&u1), 0);
        assert_eq!(token.total_supply(), tokens(1_000_000));
        assert_eq!(token.events().len(), 1);
    }

    #[test]
    fn transfer_moves_balance() {
        let (mut token, founder, u1, u2) = fixture();
        token.transfer(&founder, &u1, tokens(1000)).unwrap();
        token.transfer(&founder, &u2, tokens(1000)).unwrap();
        assert_eq!(token.balance_of(&u1), 1000 * 10u128.pow(18));
        assert_eq!(token.balance_of(&u2), tokens(1000));
        assert_eq!(token.balance_of(&founder), tokens(998_000));
    }

    #[test]
    fn transfer_rejects_overdraft_without_side_effects() {
        let (mut token, founder, u1, u2) = fixture();
        token.transfer(&founder, &u1, tokens(10)).unwrap();
        let before = token.clone();
        let err = token.transfer(&u1, &u2, tokens(11)).unwrap_err();
        assert_eq!(
            err,
            TokenError::InsufficientBalance {
                account: u1,
                available: tokens(10),
                required: tokens(11),
            }
        );
        assert_eq!(token, before);
    }

    #[test]
    fn transfer_from_consumes_allowance() {
        let (mut token, founder, u1, u2) = fixture();
        let escrow = Address::from_label("escrow");
        token.transfer(&founder, &u1, tokens(1000)).unwrap();
        token.approve(&u1, &escrow, tokens(300));

        token.transfer_from(&escrow, &u1, &escrow, tokens(200)).unwrap();
        assert_eq!(token.allowance(&u1, &escrow), tokens(100));
        assert_eq!(token.balance_of(&escrow), tokens(200));

        let err = token
            .transfer_from(&escrow, &u1, &u2, tokens(101))
            .unwrap_err();
        assert!(matches!(err, TokenError::InsufficientAllowance { .. }));
        assert_eq!(token.balance_of(&u2), 0);
        assert_eq!(token.allowance(&u1, &escrow), tokens(100));
    }

    #[test]
    fn transfer_from_with_allowance_but_no_balance_keeps_allowance() {
        let (mut token, _, u1, u2) = fixture();
        token.approve(&u1, &u2, tokens(5));
        let err = token.transfer_from(&u2, &u1, &u2, tokens(5)).unwrap_err();
        assert!(matches!(err, TokenError::InsufficientBalance { .. }));
        assert_eq!(token.allowance(&u1, &u2), tokens(5));
    }

    #[test]
    fn zero_address_is_not_a_recipient() {
        let (mut token, founder, _, _) = fixture();
        assert_eq!(
            token.transfer(&founder, &Address::ZERO, 1),
            Err(TokenError::ZeroAddress)
        );
    }

    #[test]
    fn state_root_tracks_balances() {
        let (mut token, founder, u1, _) = fixture();
        let root1 = token.state_root();
        assert_eq!(root1, token.state_root());
        token.transfer(&founder, &u1, 1).unwrap();
        assert_ne!(root1, token.state_root());
    }

    proptest! {
        #[test]
        fn transfers_conserve_supply(moves in prop::collection::vec((0usize..4, 0usize..4, 0u64..2_000_000), 1..40)) {
            let (mut token, founder, u1, u2) = fixture();
            let accounts = [founder, u1, u2, Address::from_label("u3")];
            for (from, to, whole) in moves {
                let _ = token.transfer(&accounts[from], &accounts[to], tokens(whole));
            }
            let sum: Amount = accounts.iter().map(|a| token.balance_of(a)).sum();
            prop_assert_eq!(sum, token.total_supply());
        }
    }
}
