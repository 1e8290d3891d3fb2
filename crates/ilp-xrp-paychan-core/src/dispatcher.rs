//! Sub-protocol multiplexer over the peer message framing (design §4.4).
//!
//! `ProtocolData`/`ContentType` mirror `interledger-btp::packet::{ProtocolData,
//! ContentType}` — the peer framing itself is an external collaborator (see crate
//! docs), so only the small struct shape is reproduced here rather than depending
//! on the whole BTP transport crate. Forwarding an `ilp` PREPARE past this account is
//! likewise external: it's modeled as the `DataHandler` trait, the same seam
//! `interledger-service::IncomingService` draws between "decide locally" and "pass to
//! the next service", reusing its `IlpResult = Result<Fulfill, Reject>` shape.

use async_trait::async_trait;
use interledger_packet::{ErrorCode, Fulfill, Packet, Prepare, Reject, RejectBuilder};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::timeout;
use tracing::{error, warn};

use crate::account::{Account, AccountState};
use crate::admission;
use crate::claim::{handle_incoming_claim, ClaimOutcome};
use crate::codec::public_key_bytes;
use crate::error::PaychanError;
use crate::ildcp::is_peer_config_request;
use crate::ledger::{ChannelClaimRequest, ChannelCreateRequest, ChannelId, Drops, LedgerClient};
use crate::settlement::{self, FundingDecision, SignedClaim};
use crate::store::{PaychanStore, StoreWrapper};
use crate::validation;

/// Default deadline for non-PREPARE sub-protocols, named in the design.
const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContentType {
    ApplicationOctetStream,
    TextPlainUtf8,
}

impl From<ContentType> for u8 {
    fn from(ct: ContentType) -> Self {
        match ct {
            ContentType::ApplicationOctetStream => 0,
            ContentType::TextPlainUtf8 => 1,
        }
    }
}

/// One named sub-protocol frame within a peer message.
#[derive(Clone, Debug)]
pub struct ProtocolData {
    pub protocol_name: String,
    pub content_type: ContentType,
    pub data: Vec<u8>,
}

impl ProtocolData {
    fn json(protocol_name: &str, body: &impl Serialize) -> Result<Self, PaychanError> {
        Ok(ProtocolData {
            protocol_name: protocol_name.to_string(),
            content_type: ContentType::ApplicationOctetStream,
            data: serde_json::to_vec(body)?,
        })
    }
}

/// Forwards a PREPARE to the rest of the connector's pipeline. The production
/// wiring of this is out of scope for this crate (see crate docs); tests supply a
/// stub.
#[async_trait]
pub trait DataHandler: Send + Sync {
    async fn handle_prepare(&self, prepare: Prepare) -> Result<Fulfill, Reject>;
}

/// The read-only context every dispatch needs: identity, policy knobs, and the
/// out-of-scope collaborators. `store` is only consulted for the `fund_channel`
/// optimistic lock below — the account registry itself is handled by the
/// orchestrator, not here.
pub struct DispatchContext<'a, L: LedgerClient, D: DataHandler, S: PaychanStore> {
    pub server_address: &'a str,
    pub server_secret: &'a [u8],
    pub currency_scale: u8,
    pub max_packet_amount: Drops,
    pub bandwidth: Drops,
    pub min_settle_delay: Duration,
    pub min_incoming_channel: Drops,
    pub outgoing_channel_default_amount: Drops,
    pub ledger: Arc<L>,
    pub data_handler: Arc<D>,
    pub store: Arc<StoreWrapper<S>>,
}

/// Reply to `last_claim`: the account's currently held incoming claim.
#[derive(Serialize, Deserialize)]
struct LastClaimReply {
    amount: String,
    signature: String,
}

/// Reply to `info`.
#[derive(Serialize, Deserialize)]
struct InfoReply {
    address: String,
    account: String,
    currency_scale: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_channel: Option<String>,
}

fn handle_last_claim(account: &Account) -> Result<ProtocolData, PaychanError> {
    ProtocolData::json(
        "last_claim",
        &LastClaimReply {
            amount: account.incoming_claim.amount.0.to_string(),
            signature: hex::encode_upper(&account.incoming_claim.signature),
        },
    )
}

fn handle_info(account: &Account, server_address: &str, currency_scale: u8) -> Result<ProtocolData, PaychanError> {
    let advanced_past_preparing_channel = !matches!(
        account.state,
        AccountState::Initial | AccountState::LoadingChannel | AccountState::EstablishingChannel | AccountState::PreparingChannel
    );
    let reply = InfoReply {
        address: server_address.to_string(),
        account: account.account_id.as_str().to_string(),
        currency_scale,
        channel: if advanced_past_preparing_channel {
            account.incoming_channel.map(|id| id.to_hex())
        } else {
            None
        },
        client_channel: if account.is_ready() {
            account.client_channel.map(|id| id.to_hex())
        } else {
            None
        },
    };
    ProtocolData::json("info", &reply)
}

/// Adopts or refreshes the incoming channel named by the `channel` sub-protocol
/// (design §4.2/§4.3). Requires a `channel_signature` frame binding the channel to
/// this account's full ILP address.
async fn handle_channel<L: LedgerClient>(
    account: &mut Account,
    channel_id_hex: &str,
    channel_signature: &[u8],
    account_full_address: &str,
    server_address: &str,
    min_settle_delay: Duration,
    existing_owner: Option<&str>,
    ledger: &L,
) -> Result<(), PaychanError> {
    account.assert_state(&[AccountState::Ready, AccountState::EstablishingChannel])?;

    let channel_id = ChannelId::from_hex(channel_id_hex)
        .map_err(|err| PaychanError::Protocol(format!("malformed channel id: {err}")))?;

    let channel = ledger.get_payment_channel(channel_id).await?;
    validation::check_channel_ownership(existing_owner, account.account_id.as_str())?;
    validation::verify_channel_proof(
        &channel.public_key,
        channel_id,
        account_full_address,
        channel_signature,
    )?;
    validation::validate_paychan(&channel, server_address, min_settle_delay)?;

    account.set_incoming_channel(channel_id, (&channel).into());
    // A reconnecting account may already have a client channel on file (loaded by
    // the orchestrator before this rebind); a fresh bind still needs `fund_channel`.
    account.state = if account.client_channel.is_some() {
        AccountState::Ready
    } else {
        AccountState::EstablishingClientChannel
    };
    Ok(())
}

/// `fund_channel` (design §4.4, item 4): opens the reverse channel once the
/// incoming escrow clears `min_incoming_channel`.
///
/// Guarded by a store-backed optimistic lock (design §4.1): `Orchestrator::connect`
/// can race two `Account` instances for the same freshly-seen account id into
/// existence before either is registered, and each could otherwise reach this point
/// independently and submit its own `submit_channel_create`. The lock lives in the
/// shared `StoreWrapper` cache rather than on `Account` itself so it's visible across
/// those two independent instances.
async fn handle_fund_channel<L: LedgerClient, S: PaychanStore>(
    account: &mut Account,
    peer_xrp_address: &str,
    min_incoming_channel: Drops,
    default_outgoing_amount: Drops,
    server_secret: &[u8],
    min_settle_delay: Duration,
    ledger: &L,
    store: &StoreWrapper<S>,
) -> Result<ChannelId, PaychanError> {
    account.assert_state(&[AccountState::EstablishingClientChannel])?;

    let incoming_capacity = account.incoming_capacity();
    if incoming_capacity < min_incoming_channel {
        return Err(PaychanError::Unreachable(format!(
            "incoming channel escrow {} below minimum {}",
            incoming_capacity, min_incoming_channel,
        )));
    }

    let lock_key = format!("funding_client_channel:{}", account.account_id.as_str());
    store.load(&lock_key).await;
    if store.get(&lock_key).await.is_some() {
        return Err(PaychanError::Validation(format!(
            "client channel funding already in progress for account={}",
            account.account_id,
        )));
    }
    store.set_cache(&lock_key, "1".to_string()).await;

    account.state = AccountState::PreparingClientChannel;
    let seed = crate::codec::DerivedSeed::derive(server_secret, &account.account_id);
    let public_key = public_key_bytes(&seed)?;

    let result = ledger
        .submit_channel_create(ChannelCreateRequest {
            destination: peer_xrp_address.to_string(),
            amount: default_outgoing_amount,
            settle_delay: min_settle_delay,
            public_key,
            source_tag: None,
            cancel_after: None,
        })
        .await;
    store.delete(&lock_key).await;
    let outcome = result?;
    let channel_id = outcome
        .channel_id
        .ok_or_else(|| PaychanError::Protocol("ledger did not return a channel id".into()))?;

    let channel = ledger.get_payment_channel(channel_id).await?;
    account.set_client_channel(channel_id, (&channel).into());
    account.state = AccountState::Ready;
    Ok(channel_id)
}

/// The outcome of dispatching the `ilp` sub-protocol: either a packet to send back,
/// or a signed claim that should also go out alongside it.
pub struct IlpOutcome {
    pub reply: Vec<u8>,
    pub outgoing_claim: Option<SignedClaim>,
    pub funding: FundingDecision,
}

async fn handle_ilp<L: LedgerClient, D: DataHandler, S: PaychanStore>(
    account: &mut Account,
    packet_bytes: Vec<u8>,
    account_full_address: &str,
    ctx: &DispatchContext<'_, L, D, S>,
) -> Result<IlpOutcome, PaychanError> {
    let packet = Packet::try_from(bytes::BytesMut::from(&packet_bytes[..]))
        .map_err(|err| PaychanError::Protocol(format!("malformed ILP packet: {err}")))?;

    let prepare = match packet {
        Packet::Prepare(prepare) => prepare,
        _ => {
            return Err(PaychanError::Protocol(
                "ilp sub-protocol only accepts PREPARE packets from peers".into(),
            ))
        }
    };

    if is_peer_config_request(&prepare) {
        let address_bytes = bytes::Bytes::from(account_full_address.as_bytes().to_vec());
        let config = crate::ildcp::IldcpConfig::new(
            interledger_packet::Address::try_from(address_bytes)
                .map_err(|err| PaychanError::Protocol(format!("invalid account address: {err}")))?,
        );
        let fulfill = config.into_fulfill();
        return Ok(IlpOutcome {
            reply: fulfill_to_bytes(fulfill),
            outgoing_claim: None,
            funding: FundingDecision::None,
        });
    }

    let destination = prepare.destination();
    let amount = Drops(prepare.amount());
    let admitted = admission::check_admission(account, amount, ctx.max_packet_amount, ctx.bandwidth);
    let admitted = match admitted {
        Ok(admitted) => admitted,
        Err(err) => {
            let reject = error_to_reject(&err, &destination);
            return Ok(IlpOutcome {
                reply: reject_to_bytes(reject),
                outgoing_claim: None,
                funding: FundingDecision::None,
            });
        }
    };
    admission::apply_admission(account, admitted);

    // PREPARE uses its own expiry as the deadline, uncapped; the 30s default below is
    // only for non-PREPARE sub-protocols (design §5 "cancellation and timeouts").
    let deadline = prepare
        .expires_at()
        .duration_since(SystemTime::now())
        .unwrap_or(Duration::from_secs(0));
    let deadline = deadline.max(Duration::from_millis(1));

    let outcome = timeout(deadline, ctx.data_handler.handle_prepare(prepare)).await;

    match outcome {
        Err(_elapsed) => {
            admission::rollback_prepare(account, amount);
            let reject = error_to_reject(
                &PaychanError::Transient("downstream handler timed out".into()),
                &destination,
            );
            Ok(IlpOutcome {
                reply: reject_to_bytes(reject),
                outgoing_claim: None,
                funding: FundingDecision::None,
            })
        }
        Ok(Err(reject)) => {
            admission::rollback_prepare(account, amount);
            if reject.code() == ErrorCode::T04_INSUFFICIENT_LIQUIDITY {
                if let Some(Err(err)) =
                    settlement::settle_owed_balance_on_t04(account, ctx.server_secret, ctx.currency_scale)
                {
                    warn!(account = %account.account_id, %err, "opportunistic owed-balance settlement failed");
                }
            }
            Ok(IlpOutcome {
                reply: reject_to_bytes(reject),
                outgoing_claim: None,
                funding: FundingDecision::None,
            })
        }
        Ok(Ok(fulfill)) => {
            let (claim, funding) = match settlement::settle_on_fulfill(
                account,
                ctx.server_secret,
                ctx.currency_scale,
                amount.0,
            ) {
                Ok(claim) => {
                    let funding = if account.funding {
                        FundingDecision::Start
                    } else {
                        FundingDecision::None
                    };
                    (Some(claim), funding)
                }
                Err(err) => {
                    warn!(account = %account.account_id, %err, "settlement on fulfill failed");
                    (None, FundingDecision::None)
                }
            };
            Ok(IlpOutcome {
                reply: fulfill_to_bytes(fulfill),
                outgoing_claim: claim,
                funding,
            })
        }
    }
}

fn fulfill_to_bytes(fulfill: Fulfill) -> Vec<u8> {
    let buf: bytes::BytesMut = fulfill.into();
    buf.to_vec()
}

fn reject_to_bytes(reject: Reject) -> Vec<u8> {
    let buf: bytes::BytesMut = reject.into();
    buf.to_vec()
}

/// Builds the peer-visible REJECT for a `PaychanError` surfaced from the `ilp`
/// sub-protocol, per design §7's propagation rule.
pub fn error_to_reject(err: &PaychanError, triggered_by: &interledger_packet::Address) -> Reject {
    let message = err.to_string();
    let data = err.max_packet_amount_details().map(|d| d.to_bytes().to_vec());
    RejectBuilder {
        code: err.to_ilp_error_code(),
        message: message.as_bytes(),
        triggered_by: Some(triggered_by),
        data: data.as_deref().unwrap_or(&[]),
    }
    .build()
}

/// What `dispatch` produced: the reply frames to send back, plus whatever the
/// orchestrator needs to drive outside this call — currently only the §4.6 step 5
/// funding decision, which requires ledger I/O this layer doesn't own.
pub struct DispatchOutcome {
    pub reply: Vec<ProtocolData>,
    pub funding: FundingDecision,
}

/// Incoming `channel_signature`/`channel`/`fund_channel`/`ilp`/`last_claim`/`info`
/// sub-protocols are examined in this fixed order on every peer message (design
/// §4.4): each is independent and any subset may co-occur.
pub async fn dispatch<L: LedgerClient, D: DataHandler, S: PaychanStore>(
    account: &mut Account,
    request: &[ProtocolData],
    account_full_address: &str,
    existing_channel_owner: Option<&str>,
    ctx: &DispatchContext<'_, L, D, S>,
) -> Result<DispatchOutcome, PaychanError> {
    let mut reply = Vec::new();
    let mut funding = FundingDecision::None;

    if request.iter().any(|p| p.protocol_name == "last_claim") {
        reply.push(handle_last_claim(account)?);
    }

    if request.iter().any(|p| p.protocol_name == "info") {
        reply.push(handle_info(account, ctx.server_address, ctx.currency_scale)?);
    }

    if let Some(channel_frame) = request.iter().find(|p| p.protocol_name == "channel") {
        let signature = request
            .iter()
            .find(|p| p.protocol_name == "channel_signature")
            .map(|p| p.data.as_slice())
            .ok_or_else(|| PaychanError::Protocol("channel frame missing channel_signature".into()))?;
        let channel_id_hex = hex::encode_upper(&channel_frame.data);
        timeout(
            DEFAULT_HANDLER_TIMEOUT,
            handle_channel(
                account,
                &channel_id_hex,
                signature,
                account_full_address,
                ctx.server_address,
                ctx.min_settle_delay,
                existing_channel_owner,
                ctx.ledger.as_ref(),
            ),
        )
        .await
        .map_err(|_| PaychanError::Transient("channel sub-protocol timed out".into()))??;
    }

    if let Some(claim_frame) = request.iter().find(|p| p.protocol_name == "claim") {
        #[derive(Deserialize)]
        struct ClaimPayload {
            amount: String,
            signature: String,
        }
        let payload: ClaimPayload = serde_json::from_slice(&claim_frame.data)?;
        let amount: u64 = payload
            .amount
            .parse()
            .map_err(|_| PaychanError::Protocol("malformed claim amount".into()))?;
        let signature = hex::decode(&payload.signature)
            .map_err(|_| PaychanError::Protocol("malformed claim signature".into()))?;
        let drops = account.incoming_drops(amount, ctx.currency_scale);
        let channel_id = account
            .incoming_channel
            .ok_or_else(|| PaychanError::Protocol("no incoming channel bound".into()))?;
        match handle_incoming_claim(account, channel_id, drops, &signature)? {
            ClaimOutcome::Accepted | ClaimOutcome::Stale => {}
        }
    }

    if let Some(fund_frame) = request.iter().find(|p| p.protocol_name == "fund_channel") {
        let peer_address = std::str::from_utf8(&fund_frame.data)
            .map_err(|_| PaychanError::Protocol("fund_channel address is not valid UTF-8".into()))?;
        let channel_id = timeout(
            DEFAULT_HANDLER_TIMEOUT,
            handle_fund_channel(
                account,
                peer_address,
                ctx.min_incoming_channel,
                ctx.outgoing_channel_default_amount,
                ctx.server_secret,
                ctx.min_settle_delay,
                ctx.ledger.as_ref(),
                ctx.store.as_ref(),
            ),
        )
        .await
        .map_err(|_| PaychanError::Transient("fund_channel sub-protocol timed out".into()))??;
        reply.push(ProtocolData {
            protocol_name: "fund_channel".to_string(),
            content_type: ContentType::TextPlainUtf8,
            data: channel_id.to_hex().into_bytes(),
        });
    }

    if let Some(ilp_frame) = request.iter().find(|p| p.protocol_name == "ilp") {
        let outcome = handle_ilp(account, ilp_frame.data.clone(), account_full_address, ctx).await?;
        if let Some(claim) = outcome.outgoing_claim {
            reply.push(ProtocolData::json(
                "claim",
                &LastClaimReply {
                    amount: claim.amount.0.to_string(),
                    signature: hex::encode_upper(&claim.signature),
                },
            )?);
        }
        reply.push(ProtocolData {
            protocol_name: "ilp".to_string(),
            content_type: ContentType::ApplicationOctetStream,
            data: outcome.reply,
        });
        funding = outcome.funding;
    }

    Ok(DispatchOutcome { reply, funding })
}
