//! Paychan acceptance rules (design §4.3), checked every time a channel is adopted
//! or refreshed, and the `channel_signature` check for the incoming `channel`
//! sub-protocol.

use std::time::Duration;

use crate::codec;
use crate::error::PaychanError;
use crate::ledger::{ChannelId, Drops, PaymentChannel};

/// Platform minimum settle delay: one hour, expressed as seconds on the ledger.
pub const MIN_SETTLE_DELAY: Duration = Duration::from_secs(3600);

/// Every channel adopted (incoming or after a refresh) must satisfy these rules.
pub fn validate_paychan(
    channel: &PaymentChannel,
    server_address: &str,
    min_settle_delay: Duration,
) -> Result<(), PaychanError> {
    if channel.settle_delay < min_settle_delay {
        return Err(PaychanError::Validation(format!(
            "settle delay of incoming payment channel too low: {}s, minimum is {}s",
            channel.settle_delay.as_secs(),
            min_settle_delay.as_secs(),
        )));
    }
    if channel.cancel_after.is_some() {
        return Err(PaychanError::Validation(
            "channel has a cancelAfter".to_string(),
        ));
    }
    if channel.expiration.is_some() {
        return Err(PaychanError::Validation("channel closing".to_string()));
    }
    if channel.destination != server_address {
        return Err(PaychanError::Validation(format!(
            "incoming payment channel destination is not the server address: {}",
            channel.destination,
        )));
    }
    Ok(())
}

/// Verifies the peer's `channel_signature`: an ed25519 signature over
/// `(channel_id, account_full_address)` using the channel's declared public key.
/// This reuses `codec::verify_claim`'s key-unwrapping but signs a different tuple,
/// so it has its own canonical encoding.
pub fn verify_channel_proof(
    public_key: &[u8],
    channel_id: ChannelId,
    account_full_address: &str,
    signature: &[u8],
) -> Result<(), PaychanError> {
    codec::verify_channel_proof(public_key, channel_id, account_full_address, signature)
}

/// Checks that the reverse index either doesn't yet name an owner for this channel,
/// or already names this account — i.e. the bind is either fresh or a safe replay.
pub fn check_channel_ownership(
    existing_owner: Option<&str>,
    this_account: &str,
) -> Result<(), PaychanError> {
    match existing_owner {
        None => Ok(()),
        Some(owner) if owner == this_account => Ok(()),
        Some(owner) => Err(PaychanError::Validation(format!(
            "this channel has already been associated with a different account. account={} associated={}",
            this_account, owner,
        ))),
    }
}

/// `incoming_claim.amount` may never exceed the channel's escrow (invariant
/// checked whenever a claim is accepted or a channel is adopted/refreshed).
pub fn check_capacity(claimed: Drops, capacity: Drops) -> Result<(), PaychanError> {
    if claimed > capacity {
        Err(PaychanError::Capacity {
            claimed: claimed.0,
            capacity: capacity.0,
        })
    } else {
        Ok(())
    }
}
