//! Serialized, retried submission of ledger transactions (design §4.10).
//!
//! Grounded on `interledger-settlement::core::settlement_client::SettlementClient`'s
//! `FutureRetry` + `ErrorHandler` pairing: transient failures back off and retry,
//! terminal failures propagate immediately. Here the distinction is already made for
//! us by [`LedgerError::is_transient`] rather than by inspecting HTTP status codes.

use futures_retry::{ErrorHandler, FutureRetry, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::LedgerError;
use crate::ledger::{ChannelClaimRequest, ChannelCreateRequest, ChannelFundRequest, LedgerClient, TxOutcome};

const DEFAULT_MAX_RETRIES: usize = 10;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Serializes every transaction submitted for one (address, secret) pair through a
/// single mutex, matching the design's "serializes on-ledger transactions per
/// (address, secret)" requirement — the underlying ledger rejects out-of-order
/// sequence numbers from the same account.
pub struct TxSubmitter<L: LedgerClient> {
    ledger: Arc<L>,
    lock: Mutex<()>,
    max_retries: usize,
}

impl<L: LedgerClient> TxSubmitter<L> {
    pub fn new(ledger: Arc<L>) -> Self {
        TxSubmitter {
            ledger,
            lock: Mutex::new(()),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub async fn submit_channel_create(
        &self,
        request: ChannelCreateRequest,
    ) -> Result<TxOutcome, LedgerError> {
        let _permit = self.lock.lock().await;
        FutureRetry::new(
            move || self.ledger.submit_channel_create(request.clone()),
            LedgerErrorHandler::new(self.max_retries),
        )
        .await
        .map(|(outcome, _attempts)| outcome)
        .map_err(|(err, _attempts)| err)
    }

    pub async fn submit_channel_fund(
        &self,
        request: ChannelFundRequest,
    ) -> Result<TxOutcome, LedgerError> {
        let _permit = self.lock.lock().await;
        FutureRetry::new(
            move || self.ledger.submit_channel_fund(request.clone()),
            LedgerErrorHandler::new(self.max_retries),
        )
        .await
        .map(|(outcome, _attempts)| outcome)
        .map_err(|(err, _attempts)| err)
    }

    pub async fn submit_channel_claim(
        &self,
        request: ChannelClaimRequest,
    ) -> Result<TxOutcome, LedgerError> {
        let _permit = self.lock.lock().await;
        FutureRetry::new(
            move || self.ledger.submit_channel_claim(request.clone()),
            LedgerErrorHandler::new(self.max_retries),
        )
        .await
        .map(|(outcome, _attempts)| outcome)
        .map_err(|(err, _attempts)| err)
    }
}

struct LedgerErrorHandler {
    max_attempts: usize,
}

impl LedgerErrorHandler {
    fn new(max_attempts: usize) -> Self {
        LedgerErrorHandler { max_attempts }
    }
}

impl ErrorHandler<LedgerError> for LedgerErrorHandler {
    type OutError = LedgerError;

    fn handle(&mut self, attempt: usize, err: LedgerError) -> RetryPolicy<LedgerError> {
        if attempt >= self.max_attempts {
            return RetryPolicy::ForwardError(err);
        }
        if err.is_transient() {
            trace!(attempt, %err, "ledger submission failed transiently, retrying");
            RetryPolicy::WaitRetry(DEFAULT_RETRY_BACKOFF)
        } else {
            RetryPolicy::ForwardError(err)
        }
    }
}
