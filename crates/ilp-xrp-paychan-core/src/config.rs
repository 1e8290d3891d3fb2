//! Plugin configuration (design §2, translating spec.md §6's option table).
//!
//! Grounded on `EthereumLedgerSettlementEngineBuilder`
//! (`interledger-settlement-engines`): an `Option<T>`-per-knob builder that
//! resolves to concrete defaults in a single `build()` step, rather than a
//! `serde`-derived struct with `#[serde(default = ...)]` scattered across fields.

use std::time::Duration;

use crate::ledger::Drops;

/// `maxPacketAmount`'s default, named in spec.md §6: no per-PREPARE ceiling beyond
/// what bandwidth/escrow already impose.
pub const DEFAULT_MAX_PACKET_AMOUNT: Drops = Drops(u64::MAX);

/// `maxFeePercent`'s default (spec.md §4.8).
pub const DEFAULT_MAX_FEE_PERCENT: f64 = 0.01;

/// `claimInterval`'s default: how often the auto-claim task re-evaluates profitability.
pub const DEFAULT_CLAIM_INTERVAL: Duration = Duration::from_secs(60);

/// `assetScale`/`currencyScale`'s default: XRP is quoted in drops at scale 6.
pub const DEFAULT_CURRENCY_SCALE: u8 = 6;

/// Resolved plugin configuration. Built via [`ConfigBuilder`]; every field here is a
/// concrete value, never an `Option`, so the rest of the crate never has to
/// re-derive a default at the call site.
#[derive(Clone, Debug)]
pub struct Config {
    /// `xrpServer`: the ledger RPC endpoint the host's `LedgerClient` connects to.
    /// Opaque to this crate — passed through only so `Config` is the single place a
    /// deployment's settings live.
    pub xrp_server: String,
    /// `address`: the server's own XRP account, used to validate that incoming
    /// channels are paid to us and that outgoing channels are opened from us.
    pub address: String,
    /// `secret`: HMAC key material for deriving per-account channel seeds. Never
    /// logged, never serialized.
    pub secret: Vec<u8>,
    /// `assetScale`/`currencyScale`: base-unit exponent relating the ILP packet
    /// amount field to drops.
    pub currency_scale: u8,
    /// `maxBalance`/`bandwidth`: unsecured liability ceiling per account.
    pub bandwidth: Drops,
    /// `maxPacketAmount`: per-PREPARE upper bound.
    pub max_packet_amount: Drops,
    /// `maxFeePercent`: fraction of claim income spendable as an on-ledger fee.
    pub max_fee_percent: f64,
    /// `claimInterval`: auto-claim task period.
    pub claim_interval: Duration,
    /// Minimum settle delay this server accepts on an incoming channel (design
    /// §4.3); not named directly in spec.md's table but implied by "meets the
    /// paychan acceptance rules".
    pub min_settle_delay: Duration,
    /// Minimum escrow a client must lock up before `fund_channel` will open a
    /// reverse channel (spec.md §4.4 bullet 4, `MIN_INCOMING_CHANNEL`).
    pub min_incoming_channel: Drops,
    /// Amount escrowed into a freshly opened outgoing channel (spec.md §4.6).
    pub outgoing_channel_default_amount: Drops,
}

/// Builder for [`Config`]. `_store` and `log` from spec.md §6's table are
/// deliberately absent: the backing store and logger sink are external
/// collaborators the host wires up directly (a `PaychanStore` impl and `tracing`
/// subscriber respectively), not settings this crate resolves.
pub struct ConfigBuilder {
    xrp_server: Option<String>,
    address: Option<String>,
    secret: Option<Vec<u8>>,
    currency_scale: Option<u8>,
    bandwidth: Option<Drops>,
    max_packet_amount: Option<Drops>,
    max_fee_percent: Option<f64>,
    claim_interval: Option<Duration>,
    min_settle_delay: Option<Duration>,
    min_incoming_channel: Option<Drops>,
    outgoing_channel_default_amount: Option<Drops>,
}

impl ConfigBuilder {
    pub fn new(xrp_server: impl Into<String>, address: impl Into<String>, secret: Vec<u8>) -> Self {
        ConfigBuilder {
            xrp_server: Some(xrp_server.into()),
            address: Some(address.into()),
            secret: Some(secret),
            currency_scale: None,
            bandwidth: None,
            max_packet_amount: None,
            max_fee_percent: None,
            claim_interval: None,
            min_settle_delay: None,
            min_incoming_channel: None,
            outgoing_channel_default_amount: None,
        }
    }

    pub fn currency_scale(&mut self, scale: u8) -> &mut Self {
        self.currency_scale = Some(scale);
        self
    }

    pub fn bandwidth(&mut self, bandwidth: Drops) -> &mut Self {
        self.bandwidth = Some(bandwidth);
        self
    }

    pub fn max_packet_amount(&mut self, max_packet_amount: Drops) -> &mut Self {
        self.max_packet_amount = Some(max_packet_amount);
        self
    }

    pub fn max_fee_percent(&mut self, max_fee_percent: f64) -> &mut Self {
        self.max_fee_percent = Some(max_fee_percent);
        self
    }

    pub fn claim_interval(&mut self, interval: Duration) -> &mut Self {
        self.claim_interval = Some(interval);
        self
    }

    pub fn min_settle_delay(&mut self, delay: Duration) -> &mut Self {
        self.min_settle_delay = Some(delay);
        self
    }

    pub fn min_incoming_channel(&mut self, min: Drops) -> &mut Self {
        self.min_incoming_channel = Some(min);
        self
    }

    pub fn outgoing_channel_default_amount(&mut self, amount: Drops) -> &mut Self {
        self.outgoing_channel_default_amount = Some(amount);
        self
    }

    pub fn build(&self) -> Config {
        Config {
            xrp_server: self.xrp_server.clone().unwrap_or_default(),
            address: self.address.clone().unwrap_or_default(),
            secret: self.secret.clone().unwrap_or_default(),
            currency_scale: self.currency_scale.unwrap_or(DEFAULT_CURRENCY_SCALE),
            bandwidth: self.bandwidth.unwrap_or(Drops::ZERO),
            max_packet_amount: self.max_packet_amount.unwrap_or(DEFAULT_MAX_PACKET_AMOUNT),
            max_fee_percent: self.max_fee_percent.unwrap_or(DEFAULT_MAX_FEE_PERCENT),
            claim_interval: self.claim_interval.unwrap_or(DEFAULT_CLAIM_INTERVAL),
            min_settle_delay: self
                .min_settle_delay
                .unwrap_or(crate::validation::MIN_SETTLE_DELAY),
            min_incoming_channel: self.min_incoming_channel.unwrap_or(Drops(1_000_000)),
            outgoing_channel_default_amount: self
                .outgoing_channel_default_amount
                .unwrap_or(crate::settlement::OUTGOING_CHANNEL_DEFAULT_AMOUNT),
        }
    }
}
