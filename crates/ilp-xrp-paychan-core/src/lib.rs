//! # ilp-xrp-paychan-core
//!
//! Core account lifecycle, claim accounting, and settlement logic for an ILP
//! connector plugin backed by asymmetric XRP payment channels: one channel funded
//! by the peer into the server (the peer's liability ceiling) and, once the peer
//! has proven trustworthy, one funded by the server back out to the peer.
//!
//! This crate is a library: it never opens a socket, runs a ledger node, or speaks
//! BTP/HTTP itself. The host process owns the transport and wires it to the three
//! trait boundaries defined here — [`ledger::LedgerClient`], [`store::PaychanStore`],
//! and [`dispatcher::DataHandler`] — plus the [`dispatcher::dispatch`] entry point,
//! which is the whole surface a host needs to drive an account's sub-protocol traffic.

pub mod account;
pub mod admission;
pub mod claim;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod ildcp;
pub mod ledger;
pub mod orchestrator;
pub mod settlement;
pub mod store;
pub mod tx_submitter;
pub mod validation;
pub mod watcher;

pub use account::{Account, AccountId, AccountState};
pub use config::{Config, ConfigBuilder};
pub use dispatcher::{dispatch, ContentType, DataHandler, DispatchContext, DispatchOutcome, ProtocolData};
pub use error::{LedgerError, PaychanError, StoreError};
pub use ledger::{ChannelId, Drops, LedgerClient};
pub use orchestrator::{AccountSnapshot, Orchestrator};
pub use settlement::FundingDecision;
pub use store::PaychanStore;
