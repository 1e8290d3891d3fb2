//! Per-account persisted state, the readiness state machine, and the derived
//! helpers the rest of the crate reads off it.
//!
//! Modeled on `interledger-service::Account`: a plain, synchronous data holder with
//! small getters, while the actual ledger/store I/O that drives transitions lives
//! in `orchestrator.rs` (mirroring how `interledger-service`'s services own the I/O
//! and only touch `Account` as data).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ledger::{ChannelId, Drops, PaymentChannel, Rounding};
use crate::error::PaychanError;

/// Opaque client identifier, derived by the host from the peer's ILP address
/// suffix. Newtype'd so it can't be confused with a channel id or a raw string key.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: String) -> Self {
        AccountId(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The ledger-observed fields of a channel, as last refreshed by the orchestrator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaychanSnapshot {
    pub amount: Drops,
    pub balance: Drops,
    #[serde(with = "hex_vec")]
    pub public_key: Vec<u8>,
    pub destination: String,
    pub settle_delay_secs: u64,
    pub has_cancel_after: bool,
    pub has_expiration: bool,
}

mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

impl From<&PaymentChannel> for PaychanSnapshot {
    fn from(channel: &PaymentChannel) -> Self {
        PaychanSnapshot {
            amount: channel.amount,
            balance: channel.balance,
            public_key: channel.public_key.clone(),
            destination: channel.destination.clone(),
            settle_delay_secs: channel.settle_delay.as_secs(),
            has_cancel_after: channel.cancel_after.is_some(),
            has_expiration: channel.expiration.is_some(),
        }
    }
}

/// The largest validly signed claim ever received. `amount == 0` means no claim has
/// arrived yet. Monotonic for the lifetime of a given `incoming_channel`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IncomingClaim {
    pub amount: Drops,
    #[serde(with = "hex_vec_opt")]
    pub signature: Vec<u8>,
}

mod hex_vec_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Readiness state machine. `Blocked` is terminal; everything else is transient
/// while the account is loading, or locked while a ledger round-trip to adopt a
/// channel is in flight.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum AccountState {
    Initial,
    LoadingChannel,
    EstablishingChannel,
    PreparingChannel,
    LoadingClientChannel,
    EstablishingClientChannel,
    PreparingClientChannel,
    Ready,
    Blocked,
}

impl AccountState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountState::Initial => "INITIAL",
            AccountState::LoadingChannel => "LOADING_CHANNEL",
            AccountState::EstablishingChannel => "ESTABLISHING_CHANNEL",
            AccountState::PreparingChannel => "PREPARING_CHANNEL",
            AccountState::LoadingClientChannel => "LOADING_CLIENT_CHANNEL",
            AccountState::EstablishingClientChannel => "ESTABLISHING_CLIENT_CHANNEL",
            AccountState::PreparingClientChannel => "PREPARING_CLIENT_CHANNEL",
            AccountState::Ready => "READY",
            AccountState::Blocked => "BLOCKED",
        }
    }
}

/// Per-peer account state: persisted balances, last claim, channel ids, and the
/// in-memory readiness state machine. See the crate's data model docs for the
/// invariants this type is responsible for upholding.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Account {
    pub account_id: AccountId,
    pub state: AccountState,

    pub incoming_channel: Option<ChannelId>,
    pub incoming_paychan: Option<PaychanSnapshot>,
    pub incoming_claim: IncomingClaim,

    pub client_channel: Option<ChannelId>,
    pub client_paychan: Option<PaychanSnapshot>,

    /// The ledger `balance` reflected after the last observed claim submission.
    pub last_claimed_amount: Drops,
    /// Running sum of in-flight incoming PREPARE amounts (the design's "prepared").
    pub prepared: Drops,
    /// Cumulative amount promised via signed outgoing claims.
    pub outgoing_balance: Drops,
    /// Amount owed to the peer because a settlement attempt failed to produce a claim.
    pub owed_balance: Drops,

    pub blocked: bool,
    pub block_reason: Option<String>,

    /// Non-reentrancy guard for in-flight client-channel funding transactions.
    #[serde(skip, default)]
    pub funding: bool,
}

impl Account {
    pub fn new(account_id: AccountId) -> Self {
        Account {
            account_id,
            state: AccountState::Initial,
            incoming_channel: None,
            incoming_paychan: None,
            incoming_claim: IncomingClaim::default(),
            client_channel: None,
            client_paychan: None,
            last_claimed_amount: Drops::ZERO,
            prepared: Drops::ZERO,
            outgoing_balance: Drops::ZERO,
            owed_balance: Drops::ZERO,
            blocked: false,
            block_reason: None,
            funding: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == AccountState::Ready
    }

    pub fn state_string(&self) -> &'static str {
        self.state.as_str()
    }

    /// Fails with a descriptive `Protocol` error if the account isn't in one of the
    /// expected states, per the design's `_assertState`.
    pub fn assert_state(&self, expected: &[AccountState]) -> Result<(), PaychanError> {
        if expected.contains(&self.state) {
            Ok(())
        } else {
            Err(PaychanError::Protocol(format!(
                "account {} expected state in {:?}, got {}",
                self.account_id,
                expected.iter().map(AccountState::as_str).collect::<Vec<_>>(),
                self.state_string(),
            )))
        }
    }

    /// `prepared - incoming_claim.amount`: the server's momentary credit risk.
    pub fn unsecured(&self) -> Drops {
        self.prepared.saturating_sub(self.incoming_claim.amount)
    }

    pub fn incoming_capacity(&self) -> Drops {
        self.incoming_paychan
            .as_ref()
            .map(|p| p.amount)
            .unwrap_or(Drops::ZERO)
    }

    pub fn client_capacity(&self) -> Drops {
        self.client_paychan
            .as_ref()
            .map(|p| p.amount)
            .unwrap_or(Drops::ZERO)
    }

    /// Terminal: rejects all future data. Idempotent.
    pub fn block(&mut self, reason: impl Into<String>) {
        if self.blocked {
            return;
        }
        self.blocked = true;
        self.block_reason = Some(reason.into());
        self.state = AccountState::Blocked;
    }

    /// Invoked only once the channel is confirmed gone from the ledger: returns the
    /// escrowed-but-unsecured liability to zero and clears the channel fields.
    pub fn delete_channel(&mut self) {
        self.prepared = self.prepared.saturating_sub(self.last_claimed_amount);
        self.incoming_channel = None;
        self.incoming_paychan = None;
    }

    /// Adopts (or refreshes) the incoming channel once validation has passed.
    pub fn set_incoming_channel(&mut self, channel_id: ChannelId, snapshot: PaychanSnapshot) {
        self.incoming_channel = Some(channel_id);
        self.incoming_paychan = Some(snapshot);
    }

    pub fn set_client_channel(&mut self, channel_id: ChannelId, snapshot: PaychanSnapshot) {
        self.client_channel = Some(channel_id);
        self.client_paychan = Some(snapshot);
    }

    /// `amount` in base units scaled to drops against the incoming channel's escrow.
    pub fn incoming_drops(&self, amount: u64, currency_scale: u8) -> Drops {
        crate::ledger::scale_to_drops(amount, currency_scale, Rounding::Down)
    }
}
