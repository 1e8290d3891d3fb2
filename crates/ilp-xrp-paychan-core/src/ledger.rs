//! Types and the trait boundary for the XRP ledger client.
//!
//! Per the design, the ledger client itself (submitting transactions, subscribing to
//! account events, querying channels) is an external collaborator. This module gives
//! it a narrow, async trait interface, the same way `interledger-settlement-engines`'s
//! `eth_engine.rs` abstracts over `web3::Web3` through the `EthereumAccount`/
//! `EthereumStore` traits rather than calling it directly from the claim logic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};

use crate::error::LedgerError;

/// A 32-byte payment channel identifier, hex-encoded on the wire.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ChannelId(#[serde(with = "hex_bytes32")] pub [u8; 32]);

impl ChannelId {
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(ChannelId(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.to_hex())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

mod hex_bytes32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode_upper(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let mut out = [0u8; 32];
        hex::decode_to_slice(&s, &mut out).map_err(serde::de::Error::custom)?;
        Ok(out)
    }
}

/// An amount of drops (the smallest indivisible unit of XRP). Arithmetic is checked;
/// every place the design calls out an invariant ("never sign above channel capacity")
/// is expressed with `checked_*` so a violation is a recoverable error, not a panic.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Drops(pub u64);

impl Drops {
    pub const ZERO: Drops = Drops(0);

    pub fn checked_add(self, other: Drops) -> Option<Drops> {
        self.0.checked_add(other.0).map(Drops)
    }

    pub fn checked_sub(self, other: Drops) -> Option<Drops> {
        self.0.checked_sub(other.0).map(Drops)
    }

    pub fn saturating_sub(self, other: Drops) -> Drops {
        Drops(self.0.saturating_sub(other.0))
    }

    pub fn saturating_add(self, other: Drops) -> Drops {
        Drops(self.0.saturating_add(other.0))
    }
}

impl fmt::Display for Drops {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rounding direction for scaling a base-unit amount into drops.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Rounding {
    Down,
    Up,
}

/// Converts an amount denominated in the account's base unit (`currency_scale`
/// decimal places) into drops (always 6 decimal places, per XRP). This is the
/// `xrpToDrops`-equivalent conversion named throughout the design.
pub fn scale_to_drops(amount: u64, currency_scale: u8, rounding: Rounding) -> Drops {
    const DROP_SCALE: i32 = 6;
    let diff = currency_scale as i32 - DROP_SCALE;
    if diff == 0 {
        Drops(amount)
    } else if diff > 0 {
        let divisor = 10u64.pow(diff as u32);
        let drops = match rounding {
            Rounding::Down => amount / divisor,
            Rounding::Up => (amount + divisor - 1) / divisor,
        };
        Drops(drops)
    } else {
        let multiplier = 10u64.pow((-diff) as u32);
        Drops(amount.saturating_mul(multiplier))
    }
}

/// The ledger-observed state of a payment channel, as returned by
/// `LedgerClient::get_payment_channel`.
#[derive(Clone, Debug)]
pub struct PaymentChannel {
    /// The channel's source account (the party who can claim it closed/extended).
    pub account: String,
    /// The channel's destination account (the party who can cash claims).
    pub destination: String,
    /// Total amount escrowed in the channel.
    pub amount: Drops,
    /// Amount already claimed on-ledger.
    pub balance: Drops,
    /// The 33-byte (prefix + raw key) Ed25519 public key declared for the channel.
    pub public_key: Vec<u8>,
    pub settle_delay: Duration,
    pub cancel_after: Option<SystemTime>,
    pub expiration: Option<SystemTime>,
    pub source_tag: Option<u32>,
    pub previous_affecting_transaction_id: Option<String>,
    pub previous_affecting_transaction_ledger_version: Option<u32>,
}

/// Request to open a new unidirectional channel from the server to a peer.
#[derive(Clone, Debug)]
pub struct ChannelCreateRequest {
    pub destination: String,
    pub amount: Drops,
    pub settle_delay: Duration,
    pub public_key: Vec<u8>,
    pub source_tag: Option<u32>,
    pub cancel_after: Option<SystemTime>,
}

/// Request to top up an already-open channel the server owns (design §4.6 step 5),
/// distinct from `ChannelCreateRequest`: same channel id, increased capacity.
#[derive(Clone, Debug)]
pub struct ChannelFundRequest {
    pub channel_id: ChannelId,
    pub amount: Drops,
}

/// Request to submit (or close with) a signed claim against a channel the server owns.
#[derive(Clone, Debug)]
pub struct ChannelClaimRequest {
    pub channel_id: ChannelId,
    pub balance: Drops,
    pub amount: Drops,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
    pub close: bool,
}

/// The validated, final outcome of a submitted transaction.
#[derive(Clone, Debug)]
pub struct TxOutcome {
    pub channel_id: Option<ChannelId>,
    pub validated_ledger_version: u32,
    pub hash: String,
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn get_payment_channel(&self, id: ChannelId) -> Result<PaymentChannel, LedgerError>;
    async fn get_fee(&self) -> Result<Drops, LedgerError>;
    async fn submit_channel_create(
        &self,
        request: ChannelCreateRequest,
    ) -> Result<TxOutcome, LedgerError>;
    async fn submit_channel_fund(
        &self,
        request: ChannelFundRequest,
    ) -> Result<TxOutcome, LedgerError>;
    async fn submit_channel_claim(
        &self,
        request: ChannelClaimRequest,
    ) -> Result<TxOutcome, LedgerError>;
}
