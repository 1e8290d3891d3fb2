use interledger_packet::{ErrorCode, MaxPacketAmountDetails};
use thiserror::Error;

/// Everything that can go wrong while running an account through its lifecycle,
/// the claim/admission engine, or the sub-protocol dispatcher.
///
/// Variants map to the error kinds in the design: a `channel`/`fund_channel` failure
/// surfaces one of these directly to the peer, while an `ilp` failure is converted to
/// an ILP Reject by [`PaychanError::to_ilp_error_code`] and friends.
#[derive(Debug, Error)]
pub enum PaychanError {
    /// Malformed sub-protocol data, a handler invoked from the wrong account state, or
    /// a missing required field (e.g. `channel` without `channel_signature`).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The channel (or its refreshed ledger state) does not meet the paychan
    /// acceptance rules, or is already bound to a different account.
    #[error("validation error: {0}")]
    Validation(String),

    /// A claim's Ed25519 signature did not verify.
    #[error("Invalid claim: invalid signature")]
    Signature,

    /// A claim (incoming or outgoing) would exceed the capacity of its channel.
    #[error("Invalid claim: claim amount {claimed} exceeds channel balance {capacity}")]
    Capacity { claimed: u64, capacity: u64 },

    /// Insufficient bandwidth or escrow to admit a PREPARE. Carries the ILP T04 code.
    #[error("Insufficient bandwidth, used: {used} max: {max}")]
    Liquidity { used: u64, max: u64 },

    /// No usable channel, or the account is blocked. Carries the ILP F02 code.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// PREPARE amount exceeded `maxPacketAmount`. Carries the ILP F08 code.
    #[error("packet amount too large: received {received} maximum {maximum}")]
    TooLarge { received: u64, maximum: u64 },

    /// A ledger query/submission failed in a way that should be retried.
    #[error("transient ledger error: {0}")]
    Transient(String),

    /// The ledger told us authoritatively that a channel is gone; the account is blocked.
    #[error("terminal ledger error: {0}")]
    Terminal(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crypto(#[from] ring::error::Unspecified),

    #[error("malformed stored record: {0}")]
    Serde(#[from] serde_json::Error),
}

impl PaychanError {
    /// The ILP error code an `ilp` sub-protocol REJECT should carry for this error,
    /// per the codes named in the design's error handling section.
    pub fn to_ilp_error_code(&self) -> ErrorCode {
        match self {
            PaychanError::Unreachable(_) => ErrorCode::F02_UNREACHABLE,
            PaychanError::TooLarge { .. } => ErrorCode::F08_AMOUNT_TOO_LARGE,
            PaychanError::Liquidity { .. } => ErrorCode::T04_INSUFFICIENT_LIQUIDITY,
            PaychanError::Transient(_) => ErrorCode::T00_INTERNAL_ERROR,
            _ => ErrorCode::F00_BAD_REQUEST,
        }
    }

    /// `MaxPacketAmountDetails` to attach as the Reject's data when this is a
    /// [`PaychanError::TooLarge`].
    pub fn max_packet_amount_details(&self) -> Option<MaxPacketAmountDetails> {
        match self {
            PaychanError::TooLarge { received, maximum } => {
                Some(MaxPacketAmountDetails::new(*received, *maximum))
            }
            _ => None,
        }
    }

    pub fn is_t04(&self) -> bool {
        matches!(self, PaychanError::Liquidity { .. })
    }
}

/// Errors from the backing key-value store, exposed narrowly because the store
/// itself is an external collaborator (see crate docs).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store read failed for key {key}: {source}")]
    Read {
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("store write failed for key {key}: {source}")]
    Write {
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Errors from the ledger client, classified by whether a retry can help.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The ledger authoritatively reports the entry does not exist (`entryNotFound`).
    #[error("entry not found: {0}")]
    EntryNotFound(String),

    /// A request timed out or the ledger is temporarily unavailable.
    #[error("transient ledger failure: {0}")]
    Transient(String),

    /// A transaction was rejected for a reason that will never succeed on retry
    /// (e.g. `temMALFORMED`).
    #[error("terminal ledger failure: {0}")]
    Terminal(String),
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Transient(_))
    }
}

impl From<LedgerError> for PaychanError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::EntryNotFound(msg) => PaychanError::Terminal(msg),
            LedgerError::Transient(msg) => PaychanError::Transient(msg),
            LedgerError::Terminal(msg) => PaychanError::Terminal(msg),
        }
    }
}
