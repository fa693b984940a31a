use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type AccountId = String;
pub type Amount = u128;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("insufficient funds in account {account}: need {needed}, have {available}")]
    InsufficientFunds {
        account: AccountId,
        needed: Amount,
        available: Amount,
    },
    #[error("unknown account {account}")]
    UnknownAccount { account: AccountId },
    #[error("account {account} rejects incoming payments")]
    RecipientRejected { account: AccountId },
    #[error("balance of account {account} would overflow")]
    BalanceOverflow { account: AccountId },
    #[error("account {account} already exists")]
    DuplicateAccount { account: AccountId },
    #[error("no transfer to undo")]
    NothingToUndo,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AccountBalance {
    pub available: Amount,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub rejects_payments: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SnapshotMetadata {
    pub height: u64,
    pub timestamp: u64,
    pub block_hash: [u8; 32],
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub meta: SnapshotMetadata,
    pub accounts: BTreeMap<AccountId, AccountBalance>,
    pub events: Vec<LedgerEvent>,
    pub state_root: [u8; 32],
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    Genesis {
        to: AccountId,
        amount: Amount,
    },
    Transfer {
        from: AccountId,
        to: AccountId,
        amount: Amount,
        memo: Option<String>,
    },
}

/// Balance book of the host environment. Every mutating method either
/// completes or returns an error before touching any balance.
#[derive(Clone, Debug, Default)]
pub struct LedgerState {
    pub meta: SnapshotMetadata,
    accounts: BTreeMap<AccountId, AccountBalance>,
    events: Vec<LedgerEvent>,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_account(&mut self, account: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        if self.accounts.contains_key(account) {
            return Err(LedgerError::DuplicateAccount {
                account: account.clone(),
            });
        }
        self.accounts.insert(
            account.clone(),
            AccountBalance {
                available: amount,
                rejects_payments: false,
            },
        );
        if amount > 0 {
            self.events.push(LedgerEvent::Genesis {
                to: account.clone(),
                amount,
            });
        }
        Ok(())
    }

    /// Marks an existing account as one whose incoming transfers always fail.
    pub fn set_rejects_payments(
        &mut self,
        account: &AccountId,
        rejects: bool,
    ) -> Result<(), LedgerError> {
        let balance = self
            .accounts
            .get_mut(account)
            .ok_or_else(|| LedgerError::UnknownAccount {
                account: account.clone(),
            })?;
        balance.rejects_payments = rejects;
        Ok(())
    }

    pub fn balance_of(&self, account: &str) -> Amount {
        self.accounts.get(account).map(|b| b.available).unwrap_or(0)
    }

    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    pub fn total_supply(&self) -> Amount {
        self.accounts.values().map(|b| b.available).sum()
    }

    fn check_credit(&self, account: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        if self.accounts.get(account).map_or(false, |b| b.rejects_payments) {
            return Err(LedgerError::RecipientRejected {
                account: account.clone(),
            });
        }
        self.balance_of(account)
            .checked_add(amount)
            .map(|_| ())
            .ok_or_else(|| LedgerError::BalanceOverflow {
                account: account.clone(),
            })
    }

    fn check_debit(&self, account: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        let balance = self
            .accounts
            .get(account)
            .ok_or_else(|| LedgerError::UnknownAccount {
                account: account.clone(),
            })?;
        if balance.available < amount {
            return Err(LedgerError::InsufficientFunds {
                account: account.clone(),
                needed: amount,
                available: balance.available,
            });
        }
        Ok(())
    }

    /// Moves `amount` from `from` to `to`. All checks run before either
    /// balance changes, so a failed transfer leaves the ledger untouched.
    pub fn transfer(
        &mut self,
        from: &AccountId,
        to: &AccountId,
        amount: Amount,
        memo: Option<String>,
    ) -> Result<(), LedgerError> {
        self.check_debit(from, amount)?;
        if from != to {
            self.check_credit(to, amount)?;
        }

        if let Some(balance) = self.accounts.get_mut(from) {
            balance.available -= amount;
        }
        self.accounts.entry(to.clone()).or_default().available += amount;
        self.events.push(LedgerEvent::Transfer {
            from: from.clone(),
            to: to.clone(),
            amount,
            memo,
        });
        Ok(())
    }

    /// Reverses the most recent transfer and drops its event. The recipient
    /// must have existed before that transfer.
    pub(crate) fn undo_last_transfer(&mut self) -> Result<(), LedgerError> {
        let Some(LedgerEvent::Transfer {
            from, to, amount, ..
        }) = self.events.last().cloned()
        else {
            return Err(LedgerError::NothingToUndo);
        };
        if let Some(balance) = self.accounts.get_mut(&to) {
            balance.available -= amount;
        }
        if let Some(balance) = self.accounts.get_mut(&from) {
            balance.available += amount;
        }
        self.events.pop();
        Ok(())
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            meta: self.meta.clone(),
            accounts: self.accounts.clone(),
            events: self.events.clone(),
            state_root: compute_state_root(&self.accounts),
        }
    }

    pub fn state_root(&self) -> [u8; 32] {
        compute_state_root(&self.accounts)
    }
}

fn compute_state_root(accounts: &BTreeMap<AccountId, AccountBalance>) -> [u8; 32] {
    let leaves: Vec<[u8; 32]> = accounts
        .iter()
        .map(|(account, balance)| {
            let mut hasher = Sha256::new();
            hasher.update(b"acct");
            hasher.update((account.len() as u64).to_le_bytes());
            hasher.update(account.as_bytes());
            hasher.update(balance.available.to_le_bytes());
            hasher.update([balance.rejects_payments as u8]);
            hasher.finalize().into()
        })
        .collect();
    build_merkle(leaves)
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"lottery-ledger-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            if chunk.len() == 2 {
                hasher.update(chunk[1]);
            } else {
                hasher.update(chunk[0]);
            }
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn funded() -> LedgerState {
        let mut ledger = LedgerState::new();
        ledger.open_account(&"alice".to_string(), 1_000).unwrap();
        ledger.open_account(&"bob".to_string(), 2_000).unwrap();
        ledger
    }

    #[test]
    fn state_root_is_deterministic() {
        let ledger = funded();
        assert_eq!(ledger.snapshot().state_root, funded().snapshot().state_root);
        assert_ne!(ledger.state_root(), LedgerState::new().state_root());
    }

    #[test]
    fn transfer_moves_balance_and_records_event() {
        let mut ledger = funded();
        ledger
            .transfer(&"alice".into(), &"carol".into(), 400, Some("gift".into()))
            .unwrap();
        assert_eq!(ledger.balance_of("alice"), 600);
        assert_eq!(ledger.balance_of("carol"), 400);
        assert_eq!(ledger.total_supply(), 3_000);
        assert_eq!(ledger.events().len(), 3);
    }

    #[test]
    fn failed_transfers_leave_state_untouched() {
        let mut ledger = funded();
        ledger.set_rejects_payments(&"bob".into(), true).unwrap();
        let root = ledger.state_root();
        let events = ledger.events().len();

        let err = ledger
            .transfer(&"alice".into(), &"bob".into(), 10, None)
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::RecipientRejected {
                account: "bob".into()
            }
        );
        let err = ledger
            .transfer(&"alice".into(), &"carol".into(), 5_000, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { needed: 5_000, .. }));
        let err = ledger
            .transfer(&"nobody".into(), &"carol".into(), 1, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnknownAccount { .. }));

        assert_eq!(ledger.state_root(), root);
        assert_eq!(ledger.events().len(), events);
    }

    #[test]
    fn rejecting_flag_needs_an_existing_account() {
        let mut ledger = funded();
        let root = ledger.state_root();
        assert_eq!(
            ledger.set_rejects_payments(&"mallory".into(), true),
            Err(LedgerError::UnknownAccount {
                account: "mallory".into()
            })
        );
        assert_eq!(
            ledger.set_rejects_payments(&"mallory".into(), false),
            Err(LedgerError::UnknownAccount {
                account: "mallory".into()
            })
        );
        assert_eq!(ledger.state_root(), root);
        assert_eq!(ledger.balance_of("mallory"), 0);
        assert!(!ledger.snapshot().accounts.contains_key("mallory"));
    }

    #[test]
    fn undo_reverses_only_transfers() {
        let mut ledger = funded();
        let root = ledger.state_root();
        assert_eq!(ledger.undo_last_transfer(), Err(LedgerError::NothingToUndo));
        assert_eq!(ledger.state_root(), root);
        assert_eq!(ledger.events().len(), 2);

        ledger
            .transfer(&"alice".into(), &"bob".into(), 250, None)
            .unwrap();
        ledger.undo_last_transfer().unwrap();
        assert_eq!(ledger.state_root(), root);
        assert_eq!(ledger.balance_of("alice"), 1_000);
        assert_eq!(ledger.events().len(), 2);
    }

    #[test]
    fn duplicate_accounts_are_rejected() {
        let mut ledger = funded();
        assert!(matches!(
            ledger.open_account(&"alice".into(), 1),
            Err(LedgerError::DuplicateAccount { .. })
        ));
    }
}
