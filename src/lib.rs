//! Pooled-wager lottery contract and the in-process host that runs it.
//!
//! * [`lottery`] — the contract state machine: entries, stake checks,
//!   winner selection, payout and reset.
//! * [`entropy`] — pluggable seed sources and the uniform index draw.
//! * [`ledger`] — host balance book with atomic transfers and a Merkle
//!   state root.
//! * [`chain`] — serial call execution, blocks, receipts and a shared handle
//!   for concurrent callers.
//! * [`config`] — JSON scenarios for the CLI.
//! * [`units`] — wei/gwei/finney/ether amounts.

pub mod chain;
pub mod config;
pub mod entropy;
pub mod ledger;
pub mod lottery;
pub mod units;

pub use chain::{Chain, ChainError, SharedChain};
pub use ledger::{AccountId, Amount};
pub use lottery::{LotteryError, LotteryLedger, Settlement};
