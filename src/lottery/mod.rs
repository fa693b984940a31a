use serde::{Deserialize, Serialize};

use crate::entropy::{draw_index, EntropySource};
use crate::ledger::{AccountId, Amount};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Number of entrants needed before a draw is allowed.
pub const MIN_PLAYERS: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum LotteryError {
    #[error("stake {stake} is below the minimum of {minimum}")]
    InsufficientStake { stake: Amount, minimum: Amount },
    #[error("{caller} is not the lottery manager")]
    Unauthorized { caller: AccountId },
    #[error("{count} player(s) entered, at least {} required", MIN_PLAYERS)]
    InsufficientPlayers { count: usize },
    #[error("payout to {recipient} failed: {source}")]
    PayoutFailed {
        recipient: AccountId,
        #[source]
        source: BoxError,
    },
    #[error("pool would overflow")]
    PoolOverflow,
}

/// Value-transfer primitive used to pay the winner. An `Err` must mean that
/// no value moved.
pub trait PayoutSink {
    type Error: std::error::Error + Send + Sync + 'static;

    fn pay(&mut self, to: &AccountId, amount: Amount) -> Result<(), Self::Error>;
}

impl<T: PayoutSink + ?Sized> PayoutSink for &mut T {
    type Error = T::Error;

    fn pay(&mut self, to: &AccountId, amount: Amount) -> Result<(), Self::Error> {
        (**self).pay(to, amount)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settlement {
    pub winner: AccountId,
    pub index: usize,
    pub payout: Amount,
    pub entrants: usize,
}

/// Emitted by a successful call. The contract keeps no log of its own; the
/// caller decides where events go.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LotteryEvent {
    Entered {
        player: AccountId,
        stake: Amount,
    },
    WinnerPicked {
        winner: AccountId,
        index: usize,
        payout: Amount,
        entrants: usize,
    },
}

impl From<&Settlement> for LotteryEvent {
    fn from(settlement: &Settlement) -> Self {
        LotteryEvent::WinnerPicked {
            winner: settlement.winner.clone(),
            index: settlement.index,
            payout: settlement.payout,
            entrants: settlement.entrants,
        }
    }
}

/// Pooled-wager state machine.
///
/// Players join with at least `minimum_stake`; the manager settles a round,
/// paying the whole pool to one entry chosen uniformly over the players
/// array. An identity that entered `k` times holds `k` entries and so `k`
/// chances. Every operation either succeeds completely or leaves the state
/// exactly as it was.
///
/// The state is the manager, the minimum stake, the players and the pool,
/// nothing else. It never grows across rounds.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LotteryLedger {
    manager: AccountId,
    minimum_stake: Amount,
    players: Vec<AccountId>,
    pool: Amount,
}

impl LotteryLedger {
    pub fn create(manager: AccountId, minimum_stake: Amount) -> Self {
        Self {
            manager,
            minimum_stake,
            players: Vec::new(),
            pool: 0,
        }
    }

    pub fn manager(&self) -> &AccountId {
        &self.manager
    }

    pub fn minimum_stake(&self) -> Amount {
        self.minimum_stake
    }

    pub fn pool(&self) -> Amount {
        self.pool
    }

    /// Snapshot of the current entries in insertion order.
    pub fn get_players(&self) -> Vec<AccountId> {
        self.players.clone()
    }

    pub fn enter(
        &mut self,
        caller: &AccountId,
        stake: Amount,
    ) -> Result<LotteryEvent, LotteryError> {
        if stake < self.minimum_stake {
            tracing::warn!(%caller, stake, minimum = self.minimum_stake, "entry rejected");
            return Err(LotteryError::InsufficientStake {
                stake,
                minimum: self.minimum_stake,
            });
        }
        let pool = self
            .pool
            .checked_add(stake)
            .ok_or(LotteryError::PoolOverflow)?;

        self.pool = pool;
        self.players.push(caller.clone());
        tracing::debug!(%caller, stake, pool, entrants = self.players.len(), "player entered");
        Ok(LotteryEvent::Entered {
            player: caller.clone(),
            stake,
        })
    }

    /// Settles the round: draws a winner, pays the whole pool, then clears
    /// the players and the pool. Checks run in order (manager, player
    /// count, payout) and the first failure is returned untouched.
    pub fn pick_winner<E, P>(
        &mut self,
        caller: &AccountId,
        mut entropy: E,
        mut payout: P,
    ) -> Result<Settlement, LotteryError>
    where
        E: EntropySource,
        P: PayoutSink,
    {
        if caller != &self.manager {
            tracing::warn!(%caller, "settlement attempted by non-manager");
            return Err(LotteryError::Unauthorized {
                caller: caller.clone(),
            });
        }
        if self.players.len() < MIN_PLAYERS {
            return Err(LotteryError::InsufficientPlayers {
                count: self.players.len(),
            });
        }

        let seed = entropy.entropy();
        let index = draw_index(&seed, &self.players).ok_or(LotteryError::InsufficientPlayers {
            count: self.players.len(),
        })?;
        let winner = self.players[index].clone();
        let amount = self.pool;

        payout
            .pay(&winner, amount)
            .map_err(|err| LotteryError::PayoutFailed {
                recipient: winner.clone(),
                source: Box::new(err),
            })?;

        let settlement = Settlement {
            winner,
            index,
            payout: amount,
            entrants: self.players.len(),
        };
        self.players.clear();
        self.pool = 0;
        tracing::info!(
            winner = %settlement.winner,
            payout = settlement.payout,
            entrants = settlement.entrants,
            seed = %hex::encode(seed),
            "winner picked"
        );
        Ok(settlement)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::entropy::{FixedEntropy, SeededEntropy};

    #[derive(Debug, thiserror::Error)]
    #[error("recipient refused")]
    struct Refused;

    #[derive(Default)]
    struct Wallets {
        balances: BTreeMap<AccountId, Amount>,
        refuse: bool,
    }

    impl PayoutSink for Wallets {
        type Error = Refused;

        fn pay(&mut self, to: &AccountId, amount: Amount) -> Result<(), Refused> {
            if self.refuse {
                return Err(Refused);
            }
            *self.balances.entry(to.clone()).or_default() += amount;
            Ok(())
        }
    }

    fn lottery() -> LotteryLedger {
        LotteryLedger::create("manager".into(), 100)
    }

    #[test]
    fn create_starts_open_and_empty() {
        let lottery = lottery();
        assert_eq!(lottery.manager(), "manager");
        assert_eq!(lottery.minimum_stake(), 100);
        assert!(lottery.get_players().is_empty());
        assert_eq!(lottery.pool(), 0);
    }

    #[test]
    fn entries_grow_players_and_pool() {
        let mut lottery = lottery();
        lottery.enter(&"alice".into(), 100).unwrap();
        let event = lottery.enter(&"bob".into(), 250).unwrap();
        lottery.enter(&"manager".into(), 100).unwrap();
        assert_eq!(lottery.get_players(), vec!["alice", "bob", "manager"]);
        assert_eq!(lottery.pool(), 450);
        assert_eq!(
            event,
            LotteryEvent::Entered {
                player: "bob".into(),
                stake: 250
            }
        );
    }

    #[test]
    fn low_stake_is_rejected_without_side_effects() {
        let mut lottery = lottery();
        lottery.enter(&"alice".into(), 100).unwrap();
        let before = lottery.clone();
        let err = lottery.enter(&"bob".into(), 99).unwrap_err();
        assert!(matches!(
            err,
            LotteryError::InsufficientStake {
                stake: 99,
                minimum: 100
            }
        ));
        assert_eq!(lottery, before);
    }

    #[test]
    fn pool_overflow_is_rejected() {
        let mut lottery = LotteryLedger::create("manager".into(), 1);
        lottery.enter(&"alice".into(), Amount::MAX).unwrap();
        let before = lottery.clone();
        assert!(matches!(
            lottery.enter(&"bob".into(), 1),
            Err(LotteryError::PoolOverflow)
        ));
        assert_eq!(lottery, before);
    }

    #[test]
    fn only_manager_can_pick() {
        let mut lottery = lottery();
        lottery.enter(&"alice".into(), 100).unwrap();
        lottery.enter(&"bob".into(), 100).unwrap();
        let before = lottery.clone();
        let mut wallets = Wallets::default();
        let err = lottery
            .pick_winner(&"alice".into(), FixedEntropy([0u8; 32]), &mut wallets)
            .unwrap_err();
        assert!(matches!(err, LotteryError::Unauthorized { ref caller } if caller == "alice"));
        assert_eq!(lottery, before);
        assert!(wallets.balances.is_empty());
    }

    #[test]
    fn authorization_is_checked_before_player_count() {
        let mut lottery = lottery();
        let err = lottery
            .pick_winner(&"bob".into(), FixedEntropy([0u8; 32]), Wallets::default())
            .unwrap_err();
        assert!(matches!(err, LotteryError::Unauthorized { .. }));
    }

    #[test]
    fn needs_two_players() {
        let mut lottery = lottery();
        for expected in 0..MIN_PLAYERS {
            let before = lottery.clone();
            let err = lottery
                .pick_winner(&"manager".into(), FixedEntropy([0u8; 32]), Wallets::default())
                .unwrap_err();
            assert!(matches!(err, LotteryError::InsufficientPlayers { count } if count == expected));
            assert_eq!(lottery, before);
            lottery.enter(&"alice".into(), 100).unwrap();
        }
    }

    #[test]
    fn settlement_pays_pool_and_resets() {
        let mut lottery = lottery();
        lottery.enter(&"alice".into(), 200).unwrap();
        lottery.enter(&"bob".into(), 200).unwrap();
        let entrants = lottery.get_players();
        let mut wallets = Wallets::default();

        let settlement = lottery
            .pick_winner(&"manager".into(), SeededEntropy::new(1), &mut wallets)
            .unwrap();

        assert!(entrants.contains(&settlement.winner));
        assert_eq!(entrants[settlement.index], settlement.winner);
        assert_eq!(settlement.payout, 400);
        assert_eq!(settlement.entrants, 2);
        assert_eq!(wallets.balances[&settlement.winner], 400);
        assert_eq!(wallets.balances.values().sum::<Amount>(), 400);
        assert!(lottery.get_players().is_empty());
        assert_eq!(lottery.pool(), 0);
        assert!(matches!(
            LotteryEvent::from(&settlement),
            LotteryEvent::WinnerPicked { payout: 400, .. }
        ));
    }

    #[test]
    fn failed_payout_keeps_round_open() {
        let mut lottery = lottery();
        lottery.enter(&"alice".into(), 100).unwrap();
        lottery.enter(&"bob".into(), 100).unwrap();
        let before = lottery.clone();
        let mut wallets = Wallets {
            refuse: true,
            ..Wallets::default()
        };
        let err = lottery
            .pick_winner(&"manager".into(), FixedEntropy([3u8; 32]), &mut wallets)
            .unwrap_err();
        assert!(matches!(err, LotteryError::PayoutFailed { .. }));
        assert!(err.to_string().ends_with("recipient refused"));
        assert_eq!(lottery, before);

        wallets.refuse = false;
        lottery
            .pick_winner(&"manager".into(), FixedEntropy([3u8; 32]), &mut wallets)
            .unwrap();
        assert_eq!(lottery.pool(), 0);
    }

    #[test]
    fn rounds_repeat() {
        let mut lottery = lottery();
        let mut entropy = SeededEntropy::new(5);
        let mut wallets = Wallets::default();
        for _ in 0..3 {
            lottery.enter(&"alice".into(), 100).unwrap();
            lottery.enter(&"bob".into(), 100).unwrap();
            lottery.enter(&"alice".into(), 100).unwrap();
            let settlement = lottery
                .pick_winner(&"manager".into(), &mut entropy, &mut wallets)
                .unwrap();
            assert_eq!(settlement.entrants, 3);
        }
        assert_eq!(wallets.balances.values().sum::<Amount>(), 900);
    }

    #[test]
    fn settled_state_does_not_grow_across_rounds() {
        let fresh = lottery();
        let fresh_len = serde_json::to_vec(&fresh).unwrap().len();
        let mut lottery = lottery();
        let mut entropy = SeededEntropy::new(11);
        let mut wallets = Wallets::default();
        for _ in 0..500 {
            lottery.enter(&"alice".into(), 100).unwrap();
            lottery.enter(&"bob".into(), 100).unwrap();
            lottery
                .pick_winner(&"manager".into(), &mut entropy, &mut wallets)
                .unwrap();
        }
        assert_eq!(lottery, fresh);
        assert_eq!(serde_json::to_vec(&lottery).unwrap().len(), fresh_len);
        assert_eq!(wallets.balances.values().sum::<Amount>(), 100_000);
    }

    #[test]
    fn same_seed_and_players_pick_the_same_entry() {
        let build = || {
            let mut lottery = lottery();
            for name in ["alice", "bob", "carol", "dave"] {
                lottery.enter(&name.to_string(), 100).unwrap();
            }
            lottery
        };
        let a = build()
            .pick_winner(&"manager".into(), FixedEntropy([9u8; 32]), Wallets::default())
            .unwrap();
        let b = build()
            .pick_winner(&"manager".into(), FixedEntropy([9u8; 32]), Wallets::default())
            .unwrap();
        assert_eq!(a, b);
    }
}
