//! Outgoing settlement and claim signing (design §4.6), plus the auto-claim
//! profitability check (§4.8). Grounded on `interledger-settlement::core::settlement_client`'s
//! split between "decide whether to settle" and "produce the wire payload", and on
//! `interledger-service-util::balance_service`'s owed-balance bookkeeping on failure.

use tracing::warn;

use crate::account::{Account, AccountState};
use crate::codec::{self, DerivedSeed};
use crate::error::PaychanError;
use crate::ledger::{scale_to_drops, ChannelId, Drops, Rounding};

/// Outbound claim payload, ready to be framed as the `claim` sub-protocol.
#[derive(Clone, Debug)]
pub struct SignedClaim {
    pub channel_id: ChannelId,
    pub amount: Drops,
    pub signature: Vec<u8>,
}

/// Half of this amount is the threshold at which a client channel is topped up.
/// Exposed so the orchestrator's `Config` can override it per deployment.
pub const OUTGOING_CHANNEL_DEFAULT_AMOUNT: Drops = Drops(10_000_000);

/// Whether the caller should also kick off a non-reentrant funding transaction
/// after persisting the claim below.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FundingDecision {
    None,
    Start,
}

/// `_sendMoneyToAccount` (design §4.6, steps 1-6), minus the actual ledger I/O for
/// funding, which the orchestrator drives once this returns `FundingDecision::Start`.
///
/// `amount` is in the account's base currency unit; the channel capacity and
/// `outgoing_balance` on `Account` are both tracked in drops.
pub fn sign_outgoing_claim(
    account: &mut Account,
    server_secret: &[u8],
    currency_scale: u8,
    amount: u64,
) -> Result<(SignedClaim, FundingDecision), PaychanError> {
    account.assert_state(&[AccountState::Ready])?;
    let channel_id = account
        .client_channel
        .ok_or_else(|| PaychanError::Protocol("no client channel to settle against".into()))?;
    let paychan = account
        .client_paychan
        .clone()
        .ok_or_else(|| PaychanError::Protocol("client channel snapshot missing".into()))?;

    let amount_drops = scale_to_drops(amount, currency_scale, Rounding::Up);
    let new_outgoing = account
        .outgoing_balance
        .checked_add(amount_drops)
        .ok_or_else(|| PaychanError::Capacity {
            claimed: u64::MAX,
            capacity: paychan.amount.0,
        })?;

    if new_outgoing > paychan.amount {
        return Err(PaychanError::Capacity {
            claimed: new_outgoing.0,
            capacity: paychan.amount.0,
        });
    }

    let funding_threshold = paychan
        .amount
        .saturating_sub(Drops(OUTGOING_CHANNEL_DEFAULT_AMOUNT.0 / 2));
    let funding = if new_outgoing > funding_threshold && !account.funding {
        FundingDecision::Start
    } else {
        FundingDecision::None
    };

    let seed = DerivedSeed::derive(server_secret, &account.account_id);
    let signature = codec::sign_claim(&seed, channel_id, new_outgoing)?;

    account.outgoing_balance = new_outgoing;

    Ok((
        SignedClaim {
            channel_id,
            amount: new_outgoing,
            signature,
        },
        funding,
    ))
}

/// Applied when a FULFILL for `prepare_amount` arrives for this account: rolls
/// `owed_balance` into the settlement amount, then either clears it (success) or
/// grows it by the prepare amount (failure), per §4.6's bullet list.
pub fn settle_on_fulfill(
    account: &mut Account,
    server_secret: &[u8],
    currency_scale: u8,
    prepare_amount: u64,
) -> Result<SignedClaim, PaychanError> {
    let owed_before = account.owed_balance;
    let amount = owed_before.0.saturating_add(prepare_amount);

    match sign_outgoing_claim(account, server_secret, currency_scale, amount) {
        Ok((claim, funding)) => {
            account.owed_balance = Drops::ZERO;
            if funding == FundingDecision::Start {
                account.funding = true;
            }
            Ok(claim)
        }
        Err(err) => {
            account.owed_balance = owed_before.saturating_add(Drops(prepare_amount));
            warn!(
                account = %account.account_id,
                %err,
                owed = account.owed_balance.0,
                "settlement failed, deferring to owed_balance",
            );
            Err(err)
        }
    }
}

/// Opportunistic settlement of just the outstanding `owed_balance`, triggered when
/// the downstream REJECT carries a T04 code (the peer is momentarily illiquid, but
/// whatever we already owe from past failures is still worth trying to pay).
pub fn settle_owed_balance_on_t04(
    account: &mut Account,
    server_secret: &[u8],
    currency_scale: u8,
) -> Option<Result<SignedClaim, PaychanError>> {
    if account.owed_balance == Drops::ZERO {
        return None;
    }
    Some(settle_on_fulfill(account, server_secret, currency_scale, 0))
}

/// Marks funding as complete; the orchestrator calls this once the funding
/// transaction is validated and `client_paychan` has been reloaded.
pub fn finish_funding(account: &mut Account) {
    account.funding = false;
}

/// Auto-claim profitability check (design §4.8): `income = incomingClaim.amount -
/// lastClaimedAmount`; submit iff `income > 0` and `fee / income <= maxFeePercent`.
pub fn should_submit_auto_claim(account: &Account, fee: Drops, max_fee_percent: f64) -> bool {
    let income = account
        .incoming_claim
        .amount
        .checked_sub(account.last_claimed_amount);
    match income {
        Some(income) if income.0 > 0 => {
            (fee.0 as f64) / (income.0 as f64) <= max_fee_percent
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountId, PaychanSnapshot};

    fn ready_account_with_client_channel(capacity: Drops, outgoing: Drops) -> Account {
        let mut account = Account::new(AccountId::new("peer".into()));
        account.state = AccountState::Ready;
        account.outgoing_balance = outgoing;
        account.client_channel = Some(ChannelId([3u8; 32]));
        account.client_paychan = Some(PaychanSnapshot {
            amount: capacity,
            balance: Drops::ZERO,
            public_key: vec![0xED; 33],
            destination: "rPeer".into(),
            settle_delay_secs: 3600,
            has_cancel_after: false,
            has_expiration: false,
        });
        account
    }

    #[test]
    fn signs_claim_and_advances_outgoing_balance() {
        let mut account = ready_account_with_client_channel(Drops(1_000_000), Drops(0));
        let (claim, funding) =
            sign_outgoing_claim(&mut account, b"secret", 6, 500).unwrap();
        assert_eq!(claim.amount, Drops(500));
        assert_eq!(account.outgoing_balance, Drops(500));
        assert_eq!(funding, FundingDecision::None);
    }

    #[test]
    fn refuses_to_exceed_channel_capacity() {
        let mut account = ready_account_with_client_channel(Drops(1_000), Drops(900));
        let err = sign_outgoing_claim(&mut account, b"secret", 6, 200).unwrap_err();
        assert!(matches!(err, PaychanError::Capacity { .. }));
        // A failed signing attempt must not have mutated outgoing_balance.
        assert_eq!(account.outgoing_balance, Drops(900));
    }

    #[test]
    fn triggers_funding_past_half_default_threshold() {
        let capacity = Drops(OUTGOING_CHANNEL_DEFAULT_AMOUNT.0);
        let mut account = ready_account_with_client_channel(capacity, Drops(0));
        let almost_full = capacity.0 - OUTGOING_CHANNEL_DEFAULT_AMOUNT.0 / 2 + 1;
        let (_, funding) =
            sign_outgoing_claim(&mut account, b"secret", 6, almost_full).unwrap();
        assert_eq!(funding, FundingDecision::Start);
    }

    #[test]
    fn funding_not_retriggered_while_already_in_progress() {
        let capacity = Drops(OUTGOING_CHANNEL_DEFAULT_AMOUNT.0);
        let mut account = ready_account_with_client_channel(capacity, Drops(0));
        account.funding = true;
        let almost_full = capacity.0 - OUTGOING_CHANNEL_DEFAULT_AMOUNT.0 / 2 + 1;
        let (_, funding) =
            sign_outgoing_claim(&mut account, b"secret", 6, almost_full).unwrap();
        assert_eq!(funding, FundingDecision::None);
    }

    #[test]
    fn fulfill_settlement_pays_prior_owed_balance() {
        let mut account = ready_account_with_client_channel(Drops(10_000_000), Drops(0));
        account.owed_balance = Drops(10);
        let claim = settle_on_fulfill(&mut account, b"secret", 6, 123).unwrap();
        assert_eq!(claim.amount, Drops(133));
        assert_eq!(account.outgoing_balance, Drops(133));
        assert_eq!(account.owed_balance, Drops::ZERO);
    }

    #[test]
    fn failed_settlement_accumulates_owed_balance() {
        let mut account = ready_account_with_client_channel(Drops(100), Drops(90));
        account.owed_balance = Drops(0);
        let err = settle_on_fulfill(&mut account, b"secret", 6, 50).unwrap_err();
        assert!(matches!(err, PaychanError::Capacity { .. }));
        assert_eq!(account.owed_balance, Drops(50));
        assert_eq!(account.outgoing_balance, Drops(90));
    }

    #[test]
    fn auto_claim_boundary_at_exact_max_fee_percent() {
        let mut account = Account::new(AccountId::new("peer".into()));
        account.incoming_claim.amount = Drops(13901);
        account.last_claimed_amount = Drops(12300);
        // income = 1601; fee/income must be <= 0.01 to submit.
        let fee_at_boundary = Drops(16); // 16/1601 ≈ 0.009994 <= 0.01
        assert!(should_submit_auto_claim(&account, fee_at_boundary, 0.01));
        let fee_over = Drops(17); // 17/1601 ≈ 0.01062 > 0.01
        assert!(!should_submit_auto_claim(&account, fee_over, 0.01));
    }

    #[test]
    fn auto_claim_skips_when_no_new_income() {
        let mut account = Account::new(AccountId::new("peer".into()));
        account.incoming_claim.amount = Drops(1000);
        account.last_claimed_amount = Drops(1000);
        assert!(!should_submit_auto_claim(&account, Drops(0), 0.01));
    }
}
