use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::chain::{Call, Chain, ChainError, ChainParams, GenesisAccount};
use crate::ledger::{AccountId, Amount};
use crate::units::{parse_amount, UnitsError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read scenario {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid scenario json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid amount for {field}: {source}")]
    Amount {
        field: String,
        #[source]
        source: UnitsError,
    },
    #[error("account {0} is listed twice")]
    DuplicateAccount(AccountId),
    #[error("minimum stake must be positive")]
    ZeroMinimumStake,
    #[error("block time of {secs}s is above the {}s limit", MAX_BLOCK_TIME_SECS)]
    BlockTime { secs: u64 },
}

/// Longest block interval a scenario may ask for: one day.
pub const MAX_BLOCK_TIME_SECS: u64 = 86_400;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountSpec {
    pub id: AccountId,
    pub balance: String,
    #[serde(default)]
    pub rejects_payments: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallSpec {
    Enter { from: AccountId, value: String },
    PickWinner { from: AccountId },
    Players,
}

/// A scripted run: genesis balances, lottery parameters and a call list.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scenario {
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_block_time")]
    pub block_time_secs: u64,
    pub manager: AccountId,
    pub minimum_stake: String,
    #[serde(default)]
    pub accounts: Vec<AccountSpec>,
    #[serde(default)]
    pub calls: Vec<CallSpec>,
}

fn default_block_time() -> u64 {
    ChainParams::default().block_time_secs
}

/// Call list with every amount resolved to wei. `None` marks a
/// read-only `players` query.
pub type ResolvedCalls = Vec<Option<Call>>;

fn amount(field: impl Into<String>, raw: &str) -> Result<Amount, ConfigError> {
    parse_amount(raw).map_err(|source| ConfigError::Amount {
        field: field.into(),
        source,
    })
}

impl Scenario {
    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&bytes)
    }

    pub fn params(&self) -> Result<ChainParams, ConfigError> {
        if self.block_time_secs > MAX_BLOCK_TIME_SECS {
            return Err(ConfigError::BlockTime {
                secs: self.block_time_secs,
            });
        }
        Ok(ChainParams {
            seed: self.seed,
            block_time_secs: self.block_time_secs,
            ..ChainParams::default()
        })
    }

    pub fn minimum_stake(&self) -> Result<Amount, ConfigError> {
        let stake = amount("minimum_stake", &self.minimum_stake)?;
        if stake == 0 {
            return Err(ConfigError::ZeroMinimumStake);
        }
        Ok(stake)
    }

    /// Genesis allocations; the manager gets an empty account when the
    /// scenario does not fund it.
    pub fn genesis(&self) -> Result<Vec<GenesisAccount>, ConfigError> {
        let mut seen = BTreeSet::new();
        let mut accounts = Vec::with_capacity(self.accounts.len() + 1);
        for spec in &self.accounts {
            if !seen.insert(spec.id.clone()) {
                return Err(ConfigError::DuplicateAccount(spec.id.clone()));
            }
            accounts.push(GenesisAccount {
                id: spec.id.clone(),
                balance: amount(format!("accounts.{}.balance", spec.id), &spec.balance)?,
                rejects_payments: spec.rejects_payments,
            });
        }
        if !seen.contains(&self.manager) {
            accounts.push(GenesisAccount {
                id: self.manager.clone(),
                balance: 0,
                rejects_payments: false,
            });
        }
        Ok(accounts)
    }

    pub fn resolve_calls(&self) -> Result<ResolvedCalls, ConfigError> {
        self.calls
            .iter()
            .enumerate()
            .map(|(idx, spec)| match spec {
                CallSpec::Enter { from, value } => Ok(Some(Call::Enter {
                    from: from.clone(),
                    value: amount(format!("calls[{idx}].value"), value)?,
                })),
                CallSpec::PickWinner { from } => Ok(Some(Call::PickWinner { from: from.clone() })),
                CallSpec::Players => Ok(None),
            })
            .collect()
    }

    /// Builds the chain and deploys the lottery from the manager account.
    pub fn build_chain(&self) -> Result<Chain, ScenarioError> {
        let minimum_stake = self.minimum_stake()?;
        let mut chain = Chain::new(self.params()?, &self.genesis()?)?;
        chain.deploy(&self.manager, minimum_stake)?;
        Ok(chain)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Chain(#[from] ChainError),
}
