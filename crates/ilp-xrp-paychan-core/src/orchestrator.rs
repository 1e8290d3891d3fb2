//! Plugin Orchestrator (design §4, item 8; detailed in §4.2's `connect()`, §4.8's
//! auto-claim loop, and §4.9's watcher callback).
//!
//! Owns the account registry, the `channelId -> accountId` reverse index, and wires
//! together the pieces built in the other modules. Grounded on
//! `interledger-store-redis`'s `RedisStore`: a single struct holding the store
//! handle plus in-process indices, with per-account mutation serialized by a
//! per-account lock rather than one global lock over the whole registry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::account::{Account, AccountId, AccountState};
use crate::codec::DerivedSeed;
use crate::config::Config;
use crate::dispatcher::{ContentType, ProtocolData};
use crate::error::{LedgerError, PaychanError};
use crate::ledger::{ChannelClaimRequest, ChannelFundRequest, ChannelId, LedgerClient};
use crate::settlement::{self, FundingDecision};
use crate::store::{PaychanStore, StoreWrapper};
use crate::tx_submitter::TxSubmitter;
use crate::validation;
use crate::watcher::{ChannelCloseEvent, ChannelWatcher};

fn account_key(account_id: &AccountId) -> String {
    format!("accounts:{}", account_id.as_str())
}

fn channel_index_key(channel_id: ChannelId) -> String {
    format!("channel:{}", channel_id.to_hex())
}

/// A plain, `Serialize`-able projection of an account's persisted and derived
/// fields (design §3, supplemented per SPEC_FULL §3) — what the `info` sub-protocol
/// and observability code both want, without exposing `Account` itself.
#[derive(Clone, Debug, serde::Serialize)]
pub struct AccountSnapshot {
    pub account_id: String,
    pub state: &'static str,
    pub blocked: bool,
    pub incoming_channel: Option<String>,
    pub client_channel: Option<String>,
    pub incoming_claim_amount: u64,
    pub last_claimed_amount: u64,
    pub prepared: u64,
    pub outgoing_balance: u64,
    pub owed_balance: u64,
    pub unsecured: u64,
}

impl From<&Account> for AccountSnapshot {
    fn from(account: &Account) -> Self {
        AccountSnapshot {
            account_id: account.account_id.as_str().to_string(),
            state: account.state_string(),
            blocked: account.blocked,
            incoming_channel: account.incoming_channel.map(|c| c.to_hex()),
            client_channel: account.client_channel.map(|c| c.to_hex()),
            incoming_claim_amount: account.incoming_claim.amount.0,
            last_claimed_amount: account.last_claimed_amount.0,
            prepared: account.prepared.0,
            outgoing_balance: account.outgoing_balance.0,
            owed_balance: account.owed_balance.0,
            unsecured: account.unsecured().0,
        }
    }
}

/// Owns every account's lifecycle, the reverse channel index, and the background
/// tasks (auto-claim timers, the channel watcher's close-event consumer).
pub struct Orchestrator<L: LedgerClient, S: PaychanStore> {
    config: Config,
    ledger: Arc<L>,
    store: Arc<StoreWrapper<S>>,
    tx_submitter: Arc<TxSubmitter<L>>,
    watcher: Arc<ChannelWatcher<L>>,
    accounts: RwLock<HashMap<AccountId, Arc<Mutex<Account>>>>,
    channel_index: RwLock<HashMap<ChannelId, AccountId>>,
    claim_timers: Mutex<HashMap<AccountId, JoinHandle<()>>>,
}

impl<L: LedgerClient + 'static, S: PaychanStore> Orchestrator<L, S> {
    pub fn new(config: Config, ledger: Arc<L>, store: S) -> Arc<Self> {
        let (watcher, events) = ChannelWatcher::new(ledger.clone());
        let orchestrator = Arc::new(Orchestrator {
            config,
            ledger: ledger.clone(),
            store: Arc::new(StoreWrapper::new(store)),
            tx_submitter: Arc::new(TxSubmitter::new(ledger)),
            watcher,
            accounts: RwLock::new(HashMap::new()),
            channel_index: RwLock::new(HashMap::new()),
            claim_timers: Mutex::new(HashMap::new()),
        });
        orchestrator.clone().spawn_close_event_consumer(events);
        orchestrator
    }

    /// `connect()` (design §4.2): loads persisted state, honors a persisted block,
    /// and drives `LOADING_CHANNEL`/`LOADING_CLIENT_CHANNEL` as far as the persisted
    /// record allows. Idempotent: reconnecting an already-registered account returns
    /// its existing handle without touching the ledger again.
    pub async fn connect(self: &Arc<Self>, account_id: AccountId) -> Result<Arc<Mutex<Account>>, PaychanError> {
        if let Some(existing) = self.accounts.read().await.get(&account_id) {
            return Ok(existing.clone());
        }

        let key = account_key(&account_id);
        self.store.load(&key).await;
        let mut account = self
            .store
            .get_object::<Account>(&key)
            .await?
            .unwrap_or_else(|| Account::new(account_id.clone()));
        // Crash safety (design §5): re-derive state from persisted fields rather
        // than trusting whatever state was serialized mid-transition.
        account.state = AccountState::Initial;

        if account.blocked {
            // `Account::block` no-ops once `blocked` is already set, so the state
            // has to be restored directly rather than through that entry point.
            account.state = AccountState::Blocked;
        } else {
            account.state = AccountState::LoadingChannel;
            self.load_incoming_channel(&mut account).await;
            if account.state != AccountState::Blocked {
                self.load_client_channel(&mut account).await;
            }
        }

        if let Some(channel_id) = account.incoming_channel {
            self.channel_index.write().await.insert(channel_id, account_id.clone());
            self.watcher.watch(channel_id).await;
        }

        self.store.set_object(&account_key(&account_id), &account).await?;
        let handle = Arc::new(Mutex::new(account));
        self.accounts.write().await.insert(account_id.clone(), handle.clone());
        self.spawn_claim_timer(account_id).await;
        Ok(handle)
    }

    async fn load_incoming_channel(&self, account: &mut Account) {
        let Some(channel_id) = account.incoming_channel else {
            account.state = AccountState::EstablishingChannel;
            return;
        };
        match self.ledger.get_payment_channel(channel_id).await {
            Ok(channel) => match validation::validate_paychan(
                &channel,
                &self.config.address,
                self.config.min_settle_delay,
            ) {
                Ok(()) => {
                    account.set_incoming_channel(channel_id, (&channel).into());
                    account.state = AccountState::LoadingClientChannel;
                }
                Err(err) => {
                    warn!(%account.account_id, %err, "persisted incoming channel failed validation on reload");
                    account.block(err.to_string());
                }
            },
            Err(LedgerError::EntryNotFound(msg)) => {
                account.block(format!("incoming channel no longer exists: {msg}"));
                account.delete_channel();
            }
            Err(err) => {
                // A transient failure here leaves the account in LOADING_CHANNEL;
                // the caller is expected to retry `connect` on a future peer message.
                warn!(%account.account_id, %err, "transient failure loading incoming channel");
            }
        }
    }

    async fn load_client_channel(&self, account: &mut Account) {
        if account.state != AccountState::LoadingClientChannel {
            return;
        }
        let Some(channel_id) = account.client_channel else {
            account.state = AccountState::EstablishingClientChannel;
            return;
        };
        match self.ledger.get_payment_channel(channel_id).await {
            Ok(channel) => {
                account.set_client_channel(channel_id, (&channel).into());
                account.state = AccountState::Ready;
            }
            Err(LedgerError::EntryNotFound(msg)) => {
                warn!(%account.account_id, %msg, "persisted client channel no longer exists");
                account.client_channel = None;
                account.client_paychan = None;
                account.state = AccountState::EstablishingClientChannel;
            }
            Err(err) => {
                warn!(%account.account_id, %err, "transient failure loading client channel");
            }
        }
    }

    /// Disconnect (design §5): cancels the auto-claim timer and evicts the account
    /// from the in-memory registry. Persisted state is untouched — a future
    /// `connect()` reloads it.
    pub async fn disconnect(&self, account_id: &AccountId) {
        self.accounts.write().await.remove(account_id);
        if let Some(handle) = self.claim_timers.lock().await.remove(account_id) {
            handle.abort();
        }
    }

    /// Persists the account's current fields. Callers mutate the `Account` behind
    /// the returned lock, then call this to flush it through `StoreWrapper`.
    pub async fn save(&self, account: &Account) -> Result<(), PaychanError> {
        self.store.set_object(&account_key(&account.account_id), account).await.map_err(PaychanError::from)
    }

    /// Binds a freshly adopted incoming channel into the reverse index, rejecting
    /// the bind if another account already owns it (design §4.3's ownership check).
    pub async fn bind_channel(&self, channel_id: ChannelId, account_id: &AccountId) -> Result<(), PaychanError> {
        let key = channel_index_key(channel_id);
        self.store.load(&key).await;
        let existing = self.store.get(&key).await;
        validation::check_channel_ownership(existing.as_deref(), account_id.as_str())?;
        self.store.set(&key, account_id.as_str().to_string()).await;
        self.channel_index.write().await.insert(channel_id, account_id.clone());
        self.watcher.watch(channel_id).await;
        Ok(())
    }

    async fn spawn_claim_timer(self: &Arc<Self>, account_id: AccountId) {
        let orchestrator = self.clone();
        let interval = self.config.claim_interval;
        let ticker_id = account_id.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = orchestrator.run_auto_claim(&ticker_id).await {
                    warn!(%ticker_id, %err, "auto-claim tick failed");
                }
                if !orchestrator.accounts.read().await.contains_key(&ticker_id) {
                    return;
                }
            }
        });
        // Replacing any prior handle for this id (there shouldn't be one, since
        // `connect` only reaches here on first registration) aborts the stale one.
        if let Some(old) = self.claim_timers.lock().await.insert(account_id, handle) {
            old.abort();
        }
    }

    /// `_submitClaim` / auto-claim evaluation (design §4.8).
    async fn run_auto_claim(&self, account_id: &AccountId) -> Result<(), PaychanError> {
        let Some(handle) = self.accounts.read().await.get(account_id).cloned() else {
            return Ok(());
        };
        let mut account = handle.lock().await;
        if !account.is_ready() {
            return Ok(());
        }
        let Some(channel_id) = account.incoming_channel else {
            return Ok(());
        };
        let fee = self.ledger.get_fee().await?;
        if !settlement::should_submit_auto_claim(&account, fee, self.config.max_fee_percent) {
            return Ok(());
        }

        let channel = self.ledger.get_payment_channel(channel_id).await?;
        if channel.balance >= account.incoming_claim.amount {
            account.last_claimed_amount = channel.balance;
            self.save(&account).await?;
            return Ok(());
        }

        self.submit_incoming_claim(&mut account, channel_id, false).await?;
        self.save(&account).await?;
        Ok(())
    }

    async fn submit_incoming_claim(
        &self,
        account: &mut Account,
        channel_id: ChannelId,
        close: bool,
    ) -> Result<(), PaychanError> {
        let paychan = account
            .incoming_paychan
            .clone()
            .ok_or_else(|| PaychanError::Protocol("no incoming channel snapshot to claim against".into()))?;
        let outcome = self
            .tx_submitter
            .submit_channel_claim(ChannelClaimRequest {
                channel_id,
                balance: paychan.balance,
                amount: account.incoming_claim.amount,
                signature: account.incoming_claim.signature.clone(),
                public_key: paychan.public_key,
                close,
            })
            .await?;
        info!(%account.account_id, hash = %outcome.hash, close, "submitted incoming claim");
        account.last_claimed_amount = account.incoming_claim.amount;
        Ok(())
    }

    /// Drives the §4.6 step-5 funding trigger `sign_outgoing_claim` hands back: tops
    /// up the client channel by `OUTGOING_CHANNEL_DEFAULT_AMOUNT`, reloads the
    /// snapshot, clears the non-reentrancy guard, and returns the `channel` frame
    /// the caller should relay to the peer. A no-op unless `decision` is `Start`.
    pub async fn drive_funding(
        &self,
        account_id: &AccountId,
        decision: FundingDecision,
    ) -> Result<Option<ProtocolData>, PaychanError> {
        if decision != FundingDecision::Start {
            return Ok(None);
        }
        let Some(handle) = self.accounts.read().await.get(account_id).cloned() else {
            return Ok(None);
        };
        let mut account = handle.lock().await;
        let channel_id = account
            .client_channel
            .ok_or_else(|| PaychanError::Protocol("no client channel to fund".into()))?;

        let outcome = self
            .tx_submitter
            .submit_channel_fund(ChannelFundRequest {
                channel_id,
                amount: settlement::OUTGOING_CHANNEL_DEFAULT_AMOUNT,
            })
            .await?;
        info!(%account.account_id, hash = %outcome.hash, "submitted client channel funding transaction");

        let channel = self.ledger.get_payment_channel(channel_id).await?;
        account.set_client_channel(channel_id, (&channel).into());
        settlement::finish_funding(&mut account);
        self.save(&account).await?;

        Ok(Some(ProtocolData {
            protocol_name: "channel".to_string(),
            content_type: ContentType::TextPlainUtf8,
            data: channel_id.to_hex().into_bytes(),
        }))
    }

    fn spawn_close_event_consumer(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ChannelCloseEvent>) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(err) = self.handle_channel_close(event.channel_id).await {
                    error!(channel_id = %event.channel_id, %err, "failed to handle channel close event");
                }
            }
        });
    }

    /// `_channelClaim(account, close=true)` racing the peer's closure (design
    /// §4.9): blocks the account, then submits a final claim with `close: true`.
    async fn handle_channel_close(&self, channel_id: ChannelId) -> Result<(), PaychanError> {
        let Some(account_id) = self.channel_index.read().await.get(&channel_id).cloned() else {
            debug!(%channel_id, "close event for an unwatched channel, ignoring");
            return Ok(());
        };
        let Some(handle) = self.accounts.read().await.get(&account_id).cloned() else {
            return Ok(());
        };
        let mut account = handle.lock().await;
        account.block("incoming channel entering settle-delay window");
        let result = self.submit_incoming_claim(&mut account, channel_id, true).await;
        self.save(&account).await?;
        self.watcher.unwatch(channel_id).await;
        result
    }

    /// Derives and returns the public key the server would declare when opening a
    /// reverse channel for this account, without touching any state — used by the
    /// host before calling `fund_channel`'s ledger submission path directly.
    pub fn derive_public_key(&self, account_id: &AccountId) -> Result<Vec<u8>, PaychanError> {
        let seed = DerivedSeed::derive(&self.config.secret, account_id);
        crate::codec::public_key_bytes(&seed)
    }

    pub async fn snapshot(&self, account_id: &AccountId) -> Option<AccountSnapshot> {
        let handle = self.accounts.read().await.get(account_id).cloned()?;
        let account = handle.lock().await;
        Some(AccountSnapshot::from(&*account))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LedgerError, StoreError};
    use crate::ledger::{
        ChannelClaimRequest, ChannelCreateRequest, ChannelFundRequest, Drops, PaymentChannel, TxOutcome,
    };
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration as StdDuration;

    #[derive(Default)]
    struct FakeStore {
        data: StdMutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl PaychanStore for FakeStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            Ok(self.data.lock().unwrap().get(key).cloned())
        }
        async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
            self.data.lock().unwrap().insert(key.to_string(), value);
            Ok(())
        }
        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.data.lock().unwrap().remove(key);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeLedger {
        channels: StdMutex<HashMap<ChannelId, PaymentChannel>>,
        fee: StdMutex<Drops>,
        claims: StdMutex<Vec<ChannelClaimRequest>>,
    }

    #[async_trait]
    impl LedgerClient for FakeLedger {
        async fn get_payment_channel(&self, id: ChannelId) -> Result<PaymentChannel, LedgerError> {
            self.channels
                .lock()
                .unwrap()
                .get(&id)
                .cloned()
                .ok_or_else(|| LedgerError::EntryNotFound(id.to_hex()))
        }
        async fn get_fee(&self) -> Result<Drops, LedgerError> {
            Ok(*self.fee.lock().unwrap())
        }
        async fn submit_channel_create(
            &self,
            _request: ChannelCreateRequest,
        ) -> Result<TxOutcome, LedgerError> {
            unimplemented!()
        }
        async fn submit_channel_fund(
            &self,
            request: ChannelFundRequest,
        ) -> Result<TxOutcome, LedgerError> {
            let mut channels = self.channels.lock().unwrap();
            let channel = channels
                .get_mut(&request.channel_id)
                .ok_or_else(|| LedgerError::EntryNotFound(request.channel_id.to_hex()))?;
            channel.amount = channel
                .amount
                .checked_add(request.amount)
                .ok_or_else(|| LedgerError::Terminal("overflow funding channel".into()))?;
            Ok(TxOutcome {
                channel_id: Some(request.channel_id),
                validated_ledger_version: 1,
                hash: "FAKEHASH-FUND".to_string(),
            })
        }
        async fn submit_channel_claim(
            &self,
            request: ChannelClaimRequest,
        ) -> Result<TxOutcome, LedgerError> {
            let channel_id = request.channel_id;
            self.claims.lock().unwrap().push(request);
            Ok(TxOutcome {
                channel_id: Some(channel_id),
                validated_ledger_version: 1,
                hash: "FAKEHASH".to_string(),
            })
        }
    }

    fn base_channel(destination: &str) -> PaymentChannel {
        PaymentChannel {
            account: "rServer".into(),
            destination: destination.into(),
            amount: Drops(1_000_000),
            balance: Drops::ZERO,
            public_key: vec![0xED; 33],
            settle_delay: StdDuration::from_secs(3600),
            cancel_after: None,
            expiration: None,
            source_tag: None,
            previous_affecting_transaction_id: None,
            previous_affecting_transaction_ledger_version: None,
        }
    }

    fn test_config() -> Config {
        crate::config::ConfigBuilder::new("wss://xrp.example", "rServer", b"secret".to_vec())
            .claim_interval(StdDuration::from_millis(10))
            .build()
    }

    #[tokio::test]
    async fn connect_fresh_account_reaches_establishing_channel() {
        let orchestrator = Orchestrator::new(test_config(), Arc::new(FakeLedger::default()), FakeStore::default());
        let handle = orchestrator.connect(AccountId::new("peer".into())).await.unwrap();
        let account = handle.lock().await;
        assert_eq!(account.state, AccountState::EstablishingChannel);
        orchestrator.disconnect(&AccountId::new("peer".into())).await;
    }

    #[tokio::test]
    async fn connect_with_incoming_channel_but_no_client_channel_reaches_establishing_client_channel() {
        let account_id = AccountId::new("peer".into());
        let channel_id = ChannelId([1u8; 32]);
        let ledger = FakeLedger::default();
        ledger.channels.lock().unwrap().insert(channel_id, base_channel("rServer"));
        let ledger = Arc::new(ledger);

        let store = FakeStore::default();
        let mut persisted = Account::new(account_id.clone());
        persisted.incoming_channel = Some(channel_id);
        store
            .put(&account_key(&account_id), serde_json::to_string(&persisted).unwrap())
            .await
            .unwrap();

        let orchestrator = Orchestrator::new(test_config(), ledger, store);
        let handle = orchestrator.connect(account_id.clone()).await.unwrap();
        let account = handle.lock().await;
        assert_eq!(account.state, AccountState::EstablishingClientChannel);
        assert!(account.incoming_paychan.is_some());
    }

    #[tokio::test]
    async fn connect_with_both_channels_persisted_reaches_ready() {
        let account_id = AccountId::new("peer".into());
        let incoming_id = ChannelId([2u8; 32]);
        let client_id = ChannelId([3u8; 32]);
        let ledger = FakeLedger::default();
        ledger.channels.lock().unwrap().insert(incoming_id, base_channel("rServer"));
        ledger.channels.lock().unwrap().insert(client_id, base_channel("rPeer"));
        let ledger = Arc::new(ledger);

        let store = FakeStore::default();
        let mut persisted = Account::new(account_id.clone());
        persisted.incoming_channel = Some(incoming_id);
        persisted.client_channel = Some(client_id);
        store
            .put(&account_key(&account_id), serde_json::to_string(&persisted).unwrap())
            .await
            .unwrap();

        let orchestrator = Orchestrator::new(test_config(), ledger, store);
        let handle = orchestrator.connect(account_id).await.unwrap();
        let account = handle.lock().await;
        assert_eq!(account.state, AccountState::Ready);
    }

    #[tokio::test]
    async fn connect_honors_persisted_block() {
        let account_id = AccountId::new("peer".into());
        let store = FakeStore::default();
        let mut persisted = Account::new(account_id.clone());
        persisted.block("fraud detected");
        store
            .put(&account_key(&account_id), serde_json::to_string(&persisted).unwrap())
            .await
            .unwrap();

        let orchestrator = Orchestrator::new(test_config(), Arc::new(FakeLedger::default()), store);
        let handle = orchestrator.connect(account_id).await.unwrap();
        let account = handle.lock().await;
        assert_eq!(account.state, AccountState::Blocked);
        assert_eq!(account.block_reason.as_deref(), Some("fraud detected"));
    }

    #[tokio::test]
    async fn disconnect_cancels_the_claim_timer() {
        let account_id = AccountId::new("peer".into());
        let orchestrator = Orchestrator::new(test_config(), Arc::new(FakeLedger::default()), FakeStore::default());
        orchestrator.connect(account_id.clone()).await.unwrap();
        assert!(orchestrator.claim_timers.lock().await.contains_key(&account_id));
        orchestrator.disconnect(&account_id).await;
        assert!(!orchestrator.claim_timers.lock().await.contains_key(&account_id));
        assert!(orchestrator.accounts.read().await.get(&account_id).is_none());
    }

    #[tokio::test]
    async fn run_auto_claim_submits_when_profitable() {
        let account_id = AccountId::new("peer".into());
        let channel_id = ChannelId([4u8; 32]);
        let ledger = FakeLedger::default();
        let mut channel = base_channel("rServer");
        channel.balance = Drops(100);
        ledger.channels.lock().unwrap().insert(channel_id, channel);
        *ledger.fee.lock().unwrap() = Drops(1);
        let ledger = Arc::new(ledger);

        let orchestrator = Orchestrator::new(test_config(), ledger.clone(), FakeStore::default());
        let handle = orchestrator.connect(account_id.clone()).await.unwrap();
        {
            let mut account = handle.lock().await;
            account.state = AccountState::Ready;
            account.incoming_channel = Some(channel_id);
            account.incoming_paychan = Some((&base_channel("rServer")).into());
            account.incoming_claim.amount = Drops(1000);
            account.incoming_claim.signature = vec![0u8; 64];
            account.last_claimed_amount = Drops(0);
        }

        orchestrator.run_auto_claim(&account_id).await.unwrap();

        assert_eq!(ledger.claims.lock().unwrap().len(), 1);
        let account = handle.lock().await;
        assert_eq!(account.last_claimed_amount, Drops(1000));
    }

    #[tokio::test]
    async fn run_auto_claim_skips_when_ledger_already_covers_the_claim() {
        let account_id = AccountId::new("peer".into());
        let channel_id = ChannelId([5u8; 32]);
        let ledger = FakeLedger::default();
        let mut channel = base_channel("rServer");
        channel.balance = Drops(1000);
        ledger.channels.lock().unwrap().insert(channel_id, channel);
        *ledger.fee.lock().unwrap() = Drops(1);
        let ledger = Arc::new(ledger);

        let orchestrator = Orchestrator::new(test_config(), ledger.clone(), FakeStore::default());
        let handle = orchestrator.connect(account_id.clone()).await.unwrap();
        {
            let mut account = handle.lock().await;
            account.state = AccountState::Ready;
            account.incoming_channel = Some(channel_id);
            account.incoming_paychan = Some((&base_channel("rServer")).into());
            account.incoming_claim.amount = Drops(1000);
            account.incoming_claim.signature = vec![0u8; 64];
            account.last_claimed_amount = Drops(0);
        }

        orchestrator.run_auto_claim(&account_id).await.unwrap();

        assert!(ledger.claims.lock().unwrap().is_empty());
        let account = handle.lock().await;
        assert_eq!(account.last_claimed_amount, Drops(1000));
    }

    #[tokio::test]
    async fn handle_channel_close_blocks_account_and_submits_final_claim() {
        let account_id = AccountId::new("peer".into());
        let channel_id = ChannelId([6u8; 32]);
        let ledger = Arc::new(FakeLedger::default());

        let orchestrator = Orchestrator::new(test_config(), ledger.clone(), FakeStore::default());
        let handle = orchestrator.connect(account_id.clone()).await.unwrap();
        {
            let mut account = handle.lock().await;
            account.state = AccountState::Ready;
            account.incoming_channel = Some(channel_id);
            account.incoming_paychan = Some((&base_channel("rServer")).into());
            account.incoming_claim.amount = Drops(42);
            account.incoming_claim.signature = vec![0u8; 64];
        }
        orchestrator.bind_channel(channel_id, &account_id).await.unwrap();

        orchestrator.handle_channel_close(channel_id).await.unwrap();

        let account = handle.lock().await;
        assert!(account.blocked);
        let claims = ledger.claims.lock().unwrap();
        assert_eq!(claims.len(), 1);
        assert!(claims[0].close);
        assert_eq!(claims[0].amount, Drops(42));
    }

    #[tokio::test]
    async fn drive_funding_tops_up_client_channel_and_resets_funding_flag() {
        let account_id = AccountId::new("peer".into());
        let client_id = ChannelId([7u8; 32]);
        let ledger = FakeLedger::default();
        ledger.channels.lock().unwrap().insert(client_id, base_channel("rPeer"));
        let ledger = Arc::new(ledger);

        let orchestrator = Orchestrator::new(test_config(), ledger.clone(), FakeStore::default());
        let handle = orchestrator.connect(account_id.clone()).await.unwrap();
        {
            let mut account = handle.lock().await;
            account.state = AccountState::Ready;
            account.client_channel = Some(client_id);
            account.client_paychan = Some((&base_channel("rPeer")).into());
            account.funding = true;
        }

        let frame = orchestrator
            .drive_funding(&account_id, FundingDecision::Start)
            .await
            .unwrap()
            .expect("Start decision must produce a channel frame");
        assert_eq!(frame.protocol_name, "channel");

        let account = handle.lock().await;
        assert!(!account.funding);
        assert_eq!(
            account.client_paychan.as_ref().unwrap().amount,
            Drops(1_000_000).checked_add(settlement::OUTGOING_CHANNEL_DEFAULT_AMOUNT).unwrap(),
        );
    }

    #[tokio::test]
    async fn drive_funding_is_a_no_op_without_a_start_decision() {
        let account_id = AccountId::new("peer".into());
        let orchestrator = Orchestrator::new(test_config(), Arc::new(FakeLedger::default()), FakeStore::default());
        orchestrator.connect(account_id.clone()).await.unwrap();

        let frame = orchestrator
            .drive_funding(&account_id, FundingDecision::None)
            .await
            .unwrap();
        assert!(frame.is_none());
    }
}

