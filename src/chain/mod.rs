//! In-process host for the lottery contract.
//!
//! The host owns the balance ledger and the deployed contract, executes one
//! call at a time and mines a block per state-changing call. A rejected call
//! still mines its block but leaves balances, players and pool unchanged.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::entropy::BlockEntropy;
use crate::ledger::{AccountId, Amount, LedgerError, LedgerSnapshot, LedgerState};
use crate::lottery::{LotteryError, LotteryEvent, LotteryLedger, PayoutSink, Settlement};

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error(transparent)]
    Lottery(#[from] LotteryError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("no lottery has been deployed")]
    NotDeployed,
    #[error("lottery already deployed at {address}")]
    AlreadyDeployed { address: AccountId },
    #[error("minimum stake must be positive")]
    ZeroMinimumStake,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenesisAccount {
    pub id: AccountId,
    pub balance: Amount,
    #[serde(default)]
    pub rejects_payments: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainParams {
    pub seed: u64,
    pub block_time_secs: u64,
    pub genesis_timestamp: u64,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            seed: 0,
            block_time_secs: 12,
            genesis_timestamp: 1_700_000_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Call {
    Deploy {
        from: AccountId,
        minimum_stake: Amount,
    },
    Enter {
        from: AccountId,
        value: Amount,
    },
    PickWinner {
        from: AccountId,
    },
}

impl Call {
    fn absorb(&self, hasher: &mut Sha256) {
        let (tag, from, value): (&[u8], &AccountId, Amount) = match self {
            Call::Deploy {
                from,
                minimum_stake,
            } => (&b"deploy"[..], from, *minimum_stake),
            Call::Enter { from, value } => (&b"enter"[..], from, *value),
            Call::PickWinner { from } => (&b"pick_winner"[..], from, 0),
        };
        hasher.update(tag);
        hasher.update((from.len() as u64).to_le_bytes());
        hasher.update(from.as_bytes());
        hasher.update(value.to_le_bytes());
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReceiptOutcome {
    Accepted {
        events: Vec<LotteryEvent>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        round: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        settlement: Option<Settlement>,
    },
    Reverted {
        reason: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallReceipt {
    pub block: u64,
    pub block_hash: String,
    pub call: Call,
    pub outcome: ReceiptOutcome,
}

impl CallReceipt {
    pub fn is_accepted(&self) -> bool {
        matches!(self.outcome, ReceiptOutcome::Accepted { .. })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainSnapshot {
    pub ledger: LedgerSnapshot,
    pub contract: Option<AccountId>,
    pub lottery: Option<LotteryLedger>,
}

#[derive(Clone, Debug)]
struct Deployment {
    address: AccountId,
    lottery: LotteryLedger,
    // settled rounds, counted by the host
    rounds: u64,
}

/// What an accepted call produced, before it is sealed into a receipt.
enum Effects {
    Deployed,
    Entered(LotteryEvent),
    Settled { round: u64, settlement: Settlement },
}

/// Pays lottery winners out of the contract's account.
struct ContractPayout<'a> {
    ledger: &'a mut LedgerState,
    contract: &'a AccountId,
}

impl PayoutSink for ContractPayout<'_> {
    type Error = LedgerError;

    fn pay(&mut self, to: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        self.ledger
            .transfer(self.contract, to, amount, Some("lottery payout".into()))
    }
}

#[derive(Clone, Debug)]
pub struct Chain {
    params: ChainParams,
    ledger: LedgerState,
    nonces: BTreeMap<AccountId, u64>,
    deployment: Option<Deployment>,
    receipts: Vec<CallReceipt>,
}

impl Chain {
    pub fn new(params: ChainParams, accounts: &[GenesisAccount]) -> Result<Self, ChainError> {
        let mut ledger = LedgerState::new();
        for account in accounts {
            ledger.open_account(&account.id, account.balance)?;
            if account.rejects_payments {
                ledger.set_rejects_payments(&account.id, true)?;
            }
        }
        ledger.meta.height = 0;
        ledger.meta.timestamp = params.genesis_timestamp;
        ledger.meta.block_hash = genesis_hash(params.seed);
        tracing::debug!(
            accounts = accounts.len(),
            genesis = %hex::encode(ledger.meta.block_hash),
            "chain initialised"
        );
        Ok(Self {
            params,
            ledger,
            nonces: BTreeMap::new(),
            deployment: None,
            receipts: Vec::new(),
        })
    }

    pub fn height(&self) -> u64 {
        self.ledger.meta.height
    }

    pub fn ledger(&self) -> &LedgerState {
        &self.ledger
    }

    pub fn receipts(&self) -> &[CallReceipt] {
        &self.receipts
    }

    pub fn balance_of(&self, account: &str) -> Amount {
        self.ledger.balance_of(account)
    }

    pub fn contract_address(&self) -> Option<&AccountId> {
        self.deployment.as_ref().map(|d| &d.address)
    }

    pub fn contract_balance(&self) -> Amount {
        self.contract_address()
            .map(|address| self.ledger.balance_of(address))
            .unwrap_or(0)
    }

    pub fn lottery(&self) -> Result<&LotteryLedger, ChainError> {
        self.deployment
            .as_ref()
            .map(|d| &d.lottery)
            .ok_or(ChainError::NotDeployed)
    }

    pub fn players(&self) -> Result<Vec<AccountId>, ChainError> {
        Ok(self.lottery()?.get_players())
    }

    /// Number of rounds settled since deployment.
    pub fn rounds(&self) -> Result<u64, ChainError> {
        self.deployment
            .as_ref()
            .map(|d| d.rounds)
            .ok_or(ChainError::NotDeployed)
    }

    /// Marks an account as refusing incoming payments, e.g. a contract
    /// wallet that reverts on receive.
    pub fn set_rejects_payments(
        &mut self,
        account: &AccountId,
        rejects: bool,
    ) -> Result<(), ChainError> {
        Ok(self.ledger.set_rejects_payments(account, rejects)?)
    }

    pub fn snapshot(&self) -> ChainSnapshot {
        ChainSnapshot {
            ledger: self.ledger.snapshot(),
            contract: self.contract_address().cloned(),
            lottery: self.deployment.as_ref().map(|d| d.lottery.clone()),
        }
    }

    /// Deploys the lottery with `manager` as its manager and returns the
    /// contract address.
    pub fn deploy(
        &mut self,
        manager: &AccountId,
        minimum_stake: Amount,
    ) -> Result<AccountId, ChainError> {
        let call = Call::Deploy {
            from: manager.clone(),
            minimum_stake,
        };
        let result = self.deploy_inner(manager, minimum_stake);
        self.finish(call, result.as_ref().map(|_| Effects::Deployed));
        result
    }

    fn deploy_inner(
        &mut self,
        manager: &AccountId,
        minimum_stake: Amount,
    ) -> Result<AccountId, ChainError> {
        if let Some(existing) = &self.deployment {
            return Err(ChainError::AlreadyDeployed {
                address: existing.address.clone(),
            });
        }
        if minimum_stake == 0 {
            return Err(ChainError::ZeroMinimumStake);
        }
        let nonce = self.nonces.entry(manager.clone()).or_insert(0);
        let address = derive_address(manager, *nonce);
        self.ledger.open_account(&address, 0)?;
        *nonce += 1;
        self.deployment = Some(Deployment {
            address: address.clone(),
            lottery: LotteryLedger::create(manager.clone(), minimum_stake),
            rounds: 0,
        });
        tracing::info!(%manager, %address, minimum_stake, "lottery deployed");
        Ok(address)
    }

    /// Sends `value` from `caller` into the lottery and registers the entry.
    pub fn enter(&mut self, caller: &AccountId, value: Amount) -> Result<(), ChainError> {
        let call = Call::Enter {
            from: caller.clone(),
            value,
        };
        let result = self.enter_inner(caller, value);
        self.finish(call, result.as_ref().map(|event| Effects::Entered(event.clone())));
        result.map(|_| ())
    }

    fn enter_inner(
        &mut self,
        caller: &AccountId,
        value: Amount,
    ) -> Result<LotteryEvent, ChainError> {
        let deployment = self.deployment.as_mut().ok_or(ChainError::NotDeployed)?;
        self.ledger
            .transfer(caller, &deployment.address, value, Some("lottery entry".into()))?;
        match deployment.lottery.enter(caller, value) {
            Ok(event) => Ok(event),
            Err(err) => {
                self.ledger.undo_last_transfer()?;
                Err(err.into())
            }
        }
    }

    /// Settles the current round using entropy from the block being built.
    pub fn pick_winner(&mut self, caller: &AccountId) -> Result<Settlement, ChainError> {
        let call = Call::PickWinner {
            from: caller.clone(),
        };
        let result = self.pick_winner_inner(caller);
        self.finish(
            call,
            result.as_ref().map(|(round, settlement)| Effects::Settled {
                round: *round,
                settlement: settlement.clone(),
            }),
        );
        result.map(|(_, settlement)| settlement)
    }

    fn pick_winner_inner(&mut self, caller: &AccountId) -> Result<(u64, Settlement), ChainError> {
        let timestamp = self.next_timestamp();
        let deployment = self.deployment.as_mut().ok_or(ChainError::NotDeployed)?;
        let entropy = BlockEntropy {
            parent_hash: self.ledger.meta.block_hash,
            height: self.ledger.meta.height.saturating_add(1),
            timestamp,
            contract: deployment.address.clone(),
        };
        let payout = ContractPayout {
            ledger: &mut self.ledger,
            contract: &deployment.address,
        };
        let settlement = deployment.lottery.pick_winner(caller, entropy, payout)?;
        let round = deployment.rounds;
        deployment.rounds += 1;
        tracing::debug!(round, winner = %settlement.winner, "round closed");
        Ok((round, settlement))
    }

    /// Runs a call and returns its receipt, whatever the outcome.
    pub fn execute(&mut self, call: Call) -> CallReceipt {
        let result = match &call {
            Call::Deploy {
                from,
                minimum_stake,
            } => self.deploy_inner(from, *minimum_stake).map(|_| Effects::Deployed),
            Call::Enter { from, value } => self.enter_inner(from, *value).map(Effects::Entered),
            Call::PickWinner { from } => self
                .pick_winner_inner(from)
                .map(|(round, settlement)| Effects::Settled { round, settlement }),
        };
        match result {
            Ok(effects) => self.finish(call, Ok(effects)),
            Err(err) => self.finish(call, Err(&err)),
        }
    }

    fn finish(&mut self, call: Call, result: Result<Effects, &ChainError>) -> CallReceipt {
        let outcome = match result {
            Ok(Effects::Deployed) => ReceiptOutcome::Accepted {
                events: Vec::new(),
                round: None,
                settlement: None,
            },
            Ok(Effects::Entered(event)) => ReceiptOutcome::Accepted {
                events: vec![event],
                round: None,
                settlement: None,
            },
            Ok(Effects::Settled { round, settlement }) => ReceiptOutcome::Accepted {
                events: vec![LotteryEvent::from(&settlement)],
                round: Some(round),
                settlement: Some(settlement),
            },
            Err(err) => {
                tracing::warn!(?call, %err, "call reverted");
                ReceiptOutcome::Reverted {
                    reason: err.to_string(),
                }
            }
        };
        self.mine_block(&call);
        let receipt = CallReceipt {
            block: self.ledger.meta.height,
            block_hash: hex::encode(self.ledger.meta.block_hash),
            call,
            outcome,
        };
        self.receipts.push(receipt.clone());
        receipt
    }

    /// Timestamp of the block being built. The clock stops at `u64::MAX`.
    fn next_timestamp(&self) -> u64 {
        self.ledger
            .meta
            .timestamp
            .saturating_add(self.params.block_time_secs)
    }

    fn mine_block(&mut self, call: &Call) {
        let timestamp = self.next_timestamp();
        let meta = &mut self.ledger.meta;
        meta.height = meta.height.saturating_add(1);
        meta.timestamp = timestamp;
        let mut hasher = Sha256::new();
        hasher.update(b"block");
        hasher.update(meta.block_hash);
        hasher.update(meta.height.to_le_bytes());
        hasher.update(meta.timestamp.to_le_bytes());
        call.absorb(&mut hasher);
        meta.block_hash = hasher.finalize().into();
    }
}

fn genesis_hash(seed: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"genesis");
    hasher.update(seed.to_le_bytes());
    hasher.finalize().into()
}

/// Contract address derived from the deployer and its deployment count.
pub fn derive_address(deployer: &AccountId, nonce: u64) -> AccountId {
    let mut hasher = Sha256::new();
    hasher.update(b"contract");
    hasher.update(deployer.as_bytes());
    hasher.update(nonce.to_le_bytes());
    let digest = hasher.finalize();
    format!("0x{}", hex::encode(&digest[..20]))
}

/// Host handle shared between threads. The mutex serialises every call, so
/// each one observes the complete effects of the previous one.
#[derive(Clone, Debug)]
pub struct SharedChain {
    inner: Arc<Mutex<Chain>>,
}

impl SharedChain {
    pub fn new(chain: Chain) -> Self {
        Self {
            inner: Arc::new(Mutex::new(chain)),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Chain) -> R) -> R {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    pub fn enter(&self, caller: &AccountId, value: Amount) -> Result<(), ChainError> {
        self.with(|chain| chain.enter(caller, value))
    }

    pub fn pick_winner(&self, caller: &AccountId) -> Result<Settlement, ChainError> {
        self.with(|chain| chain.pick_winner(caller))
    }

    pub fn players(&self) -> Result<Vec<AccountId>, ChainError> {
        self.with(|chain| chain.players())
    }
}
