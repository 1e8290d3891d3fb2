//! Canonical claim encoding, ed25519 signing/verification, and the per-account
//! HMAC key derivation.
//!
//! The HMAC derivation mirrors `interledger-store::crypto::generate_keys`'s use of
//! `ring::hmac` to turn one server secret into per-purpose keys; here the purpose
//! string is fixed and the "purpose" varies per account instead.

use ring::hmac;
use ring::signature::{self, Ed25519KeyPair, KeyPair};
use zeroize::Zeroize;

use crate::account::AccountId;
use crate::error::PaychanError;
use crate::ledger::{ChannelId, Drops};

const CHANNEL_KEYS: &[u8] = b"ilp-xrp-paychan-channel-keys";
const CLAIM_PREFIX: &[u8] = b"CLM\0";

/// XRPL encodes ed25519 public keys as a single 0xED prefix byte followed by the
/// 32-byte raw key. The channel's declared `public_key` carries this prefix.
const ED25519_PREFIX: u8 = 0xED;

/// Derives the 32-byte seed used to sign claims for one account, without ever
/// exposing the server's root secret to callers. Zeroized on drop.
pub struct DerivedSeed([u8; 32]);

impl Drop for DerivedSeed {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl DerivedSeed {
    /// `HMAC(secret, CHANNEL_KEYS || accountId)`, per the design's key derivation rule.
    pub fn derive(server_secret: &[u8], account_id: &AccountId) -> Self {
        let key = hmac::Key::new(hmac::HMAC_SHA256, server_secret);
        let mut message = Vec::with_capacity(CHANNEL_KEYS.len() + account_id.as_str().len());
        message.extend_from_slice(CHANNEL_KEYS);
        message.extend_from_slice(account_id.as_str().as_bytes());
        let tag = hmac::sign(&key, &message);
        let mut seed = [0u8; 32];
        seed.copy_from_slice(tag.as_ref());
        DerivedSeed(seed)
    }

    pub fn to_keypair(&self) -> Result<Ed25519KeyPair, PaychanError> {
        Ed25519KeyPair::from_seed_unchecked(&self.0)
            .map_err(|_| PaychanError::Crypto(ring::error::Unspecified))
    }
}

/// The canonical `(channelId, amount)` encoding that gets ed25519-signed, matching
/// the XRPL `CLM\0 || channel_id || amount` claim-signing format named in the
/// design's glossary.
pub fn encode_claim(channel_id: ChannelId, amount: Drops) -> [u8; 44] {
    let mut buf = [0u8; 44];
    buf[0..4].copy_from_slice(CLAIM_PREFIX);
    buf[4..36].copy_from_slice(&channel_id.0);
    buf[36..44].copy_from_slice(&amount.0.to_be_bytes());
    buf
}

pub fn sign_claim(seed: &DerivedSeed, channel_id: ChannelId, amount: Drops) -> Result<Vec<u8>, PaychanError> {
    let keypair = seed.to_keypair()?;
    let message = encode_claim(channel_id, amount);
    Ok(keypair.sign(&message).as_ref().to_vec())
}

/// Verifies a claim's signature against the channel's declared public key, stripping
/// the XRPL ed25519 prefix byte first. Returns `PaychanError::Signature` on any
/// mismatch, matching the design's fixed `"Invalid claim: invalid signature"` message.
pub fn verify_claim(
    public_key: &[u8],
    channel_id: ChannelId,
    amount: Drops,
    signature: &[u8],
) -> Result<(), PaychanError> {
    let raw_key = match public_key {
        [ED25519_PREFIX, rest @ ..] if rest.len() == 32 => rest,
        _ => return Err(PaychanError::Signature),
    };
    let message = encode_claim(channel_id, amount);
    let public_key = signature::UnparsedPublicKey::new(&signature::ED25519, raw_key);
    public_key
        .verify(&message, signature)
        .map_err(|_| PaychanError::Signature)
}

/// The full 33-byte (prefix + raw) public key for a locally-derived signing seed,
/// as it should be declared when opening the reverse channel.
pub fn public_key_bytes(seed: &DerivedSeed) -> Result<Vec<u8>, PaychanError> {
    let keypair = seed.to_keypair()?;
    let mut out = Vec::with_capacity(33);
    out.push(ED25519_PREFIX);
    out.extend_from_slice(keypair.public_key().as_ref());
    Ok(out)
}

/// Signs the `channel_signature` payload described in [`verify_channel_proof`].
/// Used only in tests here; in production the peer (not the server) produces it.
pub fn sign_channel_proof(
    seed: &DerivedSeed,
    channel_id: ChannelId,
    account_full_address: &str,
) -> Result<Vec<u8>, PaychanError> {
    let keypair = seed.to_keypair()?;
    let mut message = Vec::with_capacity(32 + account_full_address.len());
    message.extend_from_slice(&channel_id.0);
    message.extend_from_slice(account_full_address.as_bytes());
    Ok(keypair.sign(&message).as_ref().to_vec())
}

/// Verifies the `channel_signature` sub-protocol payload: an ed25519 signature
/// over `(channel_id, account_full_address)`, proving the peer who opened the
/// channel controls the ILP address it's binding to.
pub fn verify_channel_proof(
    public_key: &[u8],
    channel_id: ChannelId,
    account_full_address: &str,
    signature: &[u8],
) -> Result<(), PaychanError> {
    let raw_key = match public_key {
        [ED25519_PREFIX, rest @ ..] if rest.len() == 32 => rest,
        _ => return Err(PaychanError::Signature),
    };
    let mut message = Vec::with_capacity(32 + account_full_address.len());
    message.extend_from_slice(&channel_id.0);
    message.extend_from_slice(account_full_address.as_bytes());
    let public_key = signature::UnparsedPublicKey::new(&signature::ED25519, raw_key);
    public_key
        .verify(&message, signature)
        .map_err(|_| PaychanError::Signature)
}
