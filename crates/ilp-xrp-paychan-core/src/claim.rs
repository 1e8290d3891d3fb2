//! Incoming claim handling (design §4.7): verifying a peer's signed claim and
//! folding it into `account.incoming_claim` if, and only if, it increases the
//! secured amount. Grounded on the same "verify, then monotonic compare-and-swap"
//! shape as `interledger-settlement::core::idempotency`'s accept/no-op/reject split,
//! adapted here to ed25519 claims instead of idempotency keys.

use tracing::debug;

use crate::account::{Account, IncomingClaim};
use crate::codec;
use crate::error::PaychanError;
use crate::ledger::{ChannelId, Drops};
use crate::validation;

/// What happened to an incoming `last_claim` payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClaimOutcome {
    /// The claim increased `incoming_claim.amount`; the account should persist it.
    Accepted,
    /// The claim's amount did not exceed the currently held claim; safe to ignore.
    Stale,
}

/// Verifies and (if newer) accepts an incoming claim for `channel_id` against the
/// account's current incoming channel.
///
/// Order of checks mirrors the design: the claim must name the account's bound
/// channel, must verify against the channel's declared public key, and must not
/// exceed the channel's escrowed capacity. Only then is monotonicity checked.
pub fn handle_incoming_claim(
    account: &mut Account,
    channel_id: ChannelId,
    amount: Drops,
    signature: &[u8],
) -> Result<ClaimOutcome, PaychanError> {
    let bound_channel = account
        .incoming_channel
        .ok_or_else(|| PaychanError::Protocol("no incoming channel bound to this account".into()))?;
    if bound_channel != channel_id {
        return Err(PaychanError::Protocol(format!(
            "claim names channel {} but account is bound to {}",
            channel_id, bound_channel,
        )));
    }

    let paychan = account
        .incoming_paychan
        .as_ref()
        .ok_or_else(|| PaychanError::Protocol("incoming channel snapshot missing".into()))?;

    codec::verify_claim(&paychan.public_key, channel_id, amount, signature)?;
    validation::check_capacity(amount, paychan.amount)?;

    if amount <= account.incoming_claim.amount {
        debug!(
            account = %account.account_id,
            held = account.incoming_claim.amount.0,
            offered = amount.0,
            "ignoring stale or equal incoming claim",
        );
        return Ok(ClaimOutcome::Stale);
    }

    account.incoming_claim = IncomingClaim {
        amount,
        signature: signature.to_vec(),
    };
    Ok(ClaimOutcome::Accepted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountId, PaychanSnapshot};
    use crate::codec::DerivedSeed;

    fn account_with_channel(channel_id: ChannelId, capacity: Drops, seed: &DerivedSeed) -> Account {
        let mut account = Account::new(AccountId::new("peer".into()));
        account.incoming_channel = Some(channel_id);
        account.incoming_paychan = Some(PaychanSnapshot {
            amount: capacity,
            balance: Drops::ZERO,
            public_key: codec::public_key_bytes(seed).unwrap(),
            destination: "rServer".into(),
            settle_delay_secs: 3600,
            has_cancel_after: false,
            has_expiration: false,
        });
        account
    }

    #[test]
    fn accepts_first_valid_claim() {
        let seed = DerivedSeed::derive(b"secret", &AccountId::new("peer".into()));
        let channel = ChannelId([9u8; 32]);
        let mut account = account_with_channel(channel, Drops(1_000_000), &seed);
        let signature = codec::sign_claim(&seed, channel, Drops(500)).unwrap();

        let outcome = handle_incoming_claim(&mut account, channel, Drops(500), &signature).unwrap();
        assert_eq!(outcome, ClaimOutcome::Accepted);
        assert_eq!(account.incoming_claim.amount, Drops(500));
    }

    #[test]
    fn ignores_non_increasing_claim() {
        let seed = DerivedSeed::derive(b"secret", &AccountId::new("peer".into()));
        let channel = ChannelId([9u8; 32]);
        let mut account = account_with_channel(channel, Drops(1_000_000), &seed);
        account.incoming_claim.amount = Drops(800);
        let signature = codec::sign_claim(&seed, channel, Drops(800)).unwrap();

        let outcome = handle_incoming_claim(&mut account, channel, Drops(800), &signature).unwrap();
        assert_eq!(outcome, ClaimOutcome::Stale);
        assert_eq!(account.incoming_claim.amount, Drops(800));
    }

    #[test]
    fn rejects_claim_exceeding_capacity() {
        let seed = DerivedSeed::derive(b"secret", &AccountId::new("peer".into()));
        let channel = ChannelId([9u8; 32]);
        let mut account = account_with_channel(channel, Drops(1_000), &seed);
        let signature = codec::sign_claim(&seed, channel, Drops(2_000)).unwrap();

        let err = handle_incoming_claim(&mut account, channel, Drops(2_000), &signature).unwrap_err();
        assert!(matches!(err, PaychanError::Capacity { .. }));
    }

    #[test]
    fn rejects_claim_against_wrong_channel() {
        let seed = DerivedSeed::derive(b"secret", &AccountId::new("peer".into()));
        let bound = ChannelId([1u8; 32]);
        let other = ChannelId([2u8; 32]);
        let mut account = account_with_channel(bound, Drops(1_000_000), &seed);
        let signature = codec::sign_claim(&seed, other, Drops(100)).unwrap();

        let err = handle_incoming_claim(&mut account, other, Drops(100), &signature).unwrap_err();
        assert!(matches!(err, PaychanError::Protocol(_)));
    }

    #[test]
    fn rejects_claim_with_bad_signature() {
        let seed = DerivedSeed::derive(b"secret", &AccountId::new("peer".into()));
        let channel = ChannelId([9u8; 32]);
        let mut account = account_with_channel(channel, Drops(1_000_000), &seed);
        let signature = codec::sign_claim(&seed, channel, Drops(500)).unwrap();

        let err = handle_incoming_claim(&mut account, channel, Drops(501), &signature).unwrap_err();
        assert!(matches!(err, PaychanError::Signature));
    }
}
