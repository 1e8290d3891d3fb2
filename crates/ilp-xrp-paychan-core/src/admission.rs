//! Admission control on incoming PREPAREs (design §4.5) and its rollback on
//! REJECT. Pure functions: the caller (the dispatcher) is responsible for actually
//! mutating `account.prepared` with the result, which keeps this module trivially
//! unit-testable without any store/ledger fakes — the same split
//! `interledger-service-util::validator` and `balance_service` draw between pure
//! policy checks and stateful balance bookkeeping.

use crate::account::Account;
use crate::error::PaychanError;
use crate::ledger::Drops;

/// The result of a successful admission check: what `account.prepared` should
/// become if the caller decides to forward the packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Admitted {
    pub new_prepared: Drops,
}

/// Runs the four checks from the design in order, first failure wins.
pub fn check_admission(
    account: &Account,
    amount: Drops,
    max_packet_amount: Drops,
    bandwidth: Drops,
) -> Result<Admitted, PaychanError> {
    if !account.is_ready() {
        return Err(PaychanError::Unreachable(format!(
            "account {} is not ready (state: {})",
            account.account_id,
            account.state_string(),
        )));
    }

    if amount > max_packet_amount {
        return Err(PaychanError::TooLarge {
            received: amount.0,
            maximum: max_packet_amount.0,
        });
    }

    let new_prepared = account
        .prepared
        .checked_add(amount)
        .ok_or_else(|| PaychanError::Liquidity {
            used: u64::MAX,
            max: bandwidth.0,
        })?;
    let unsecured = new_prepared.saturating_sub(account.incoming_claim.amount);
    if unsecured > bandwidth {
        return Err(PaychanError::Liquidity {
            used: unsecured.0,
            max: bandwidth.0,
        });
    }

    let incoming_capacity = account.incoming_capacity();
    if new_prepared > incoming_capacity {
        return Err(PaychanError::Liquidity {
            used: new_prepared.0,
            max: incoming_capacity.0,
        });
    }

    Ok(Admitted { new_prepared })
}

/// Applies an admitted PREPARE: `account.prepared := new_prepared`.
pub fn apply_admission(account: &mut Account, admitted: Admitted) {
    account.prepared = admitted.new_prepared;
}

/// On REJECT, the in-flight amount is returned to the unprepared pool.
/// On FULFILL, `prepared` is deliberately left untouched (it is absorbed into the
/// next signed claim the peer sends, per the design).
pub fn rollback_prepare(account: &mut Account, amount: Drops) {
    account.prepared = account.prepared.saturating_sub(amount);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountId, PaychanSnapshot};

    fn ready_account(incoming_capacity: Drops, prepared: Drops, claimed: Drops) -> Account {
        let mut account = Account::new(AccountId::new("a".into()));
        account.state = crate::account::AccountState::Ready;
        account.prepared = prepared;
        account.incoming_claim.amount = claimed;
        account.incoming_paychan = Some(PaychanSnapshot {
            amount: incoming_capacity,
            balance: Drops::ZERO,
            public_key: vec![0xED; 33],
            destination: "rServer".into(),
            settle_delay_secs: 3600,
            has_cancel_after: false,
            has_expiration: false,
        });
        account
    }

    #[test]
    fn rejects_when_not_ready() {
        let account = Account::new(AccountId::new("a".into()));
        let err = check_admission(&account, Drops(1), Drops(100), Drops(100)).unwrap_err();
        assert!(matches!(err, PaychanError::Unreachable(_)));
    }

    #[test]
    fn rejects_amount_over_max_packet_amount() {
        let account = ready_account(Drops(10_000_000), Drops(0), Drops(0));
        let err = check_admission(&account, Drops(101), Drops(100), Drops(1_000_000)).unwrap_err();
        assert!(matches!(
            err,
            PaychanError::TooLarge {
                received: 101,
                maximum: 100
            }
        ));
    }

    #[test]
    fn accepts_amount_exactly_at_max_packet_amount() {
        let account = ready_account(Drops(10_000_000), Drops(0), Drops(0));
        check_admission(&account, Drops(100), Drops(100), Drops(1_000_000)).unwrap();
    }

    #[test]
    fn t04_when_bandwidth_exceeded() {
        // bandwidth=1_000_000, prior prepared=0, claim=0, amount=1_234_567
        let account = ready_account(Drops(10_000_000), Drops(0), Drops(0));
        let err = check_admission(&account, Drops(1_234_567), Drops(u64::MAX), Drops(1_000_000))
            .unwrap_err();
        match err {
            PaychanError::Liquidity { used, max } => {
                assert_eq!(used, 1_234_567);
                assert_eq!(max, 1_000_000);
            }
            other => panic!("expected Liquidity error, got {:?}", other),
        }
    }

    #[test]
    fn t04_when_exceeding_incoming_escrow() {
        let account = ready_account(Drops(1_000_000), Drops(900_000), Drops(900_000));
        let err = check_admission(&account, Drops(200_000), Drops(u64::MAX), Drops(10_000_000))
            .unwrap_err();
        assert!(matches!(err, PaychanError::Liquidity { .. }));
    }

    #[test]
    fn rollback_returns_prepared_amount() {
        let mut account = ready_account(Drops(10_000_000), Drops(500), Drops(0));
        rollback_prepare(&mut account, Drops(200));
        assert_eq!(account.prepared, Drops(300));
    }

    #[test]
    fn fulfill_leaves_prepared_untouched() {
        let mut account = ready_account(Drops(10_000_000), Drops(500), Drops(0));
        let before = account.prepared;
        // FULFILL: no-op on prepared by design; nothing to call here.
        assert_eq!(account.prepared, before);
    }
}
