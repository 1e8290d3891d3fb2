//! The `peer.config` short-circuit named in the dispatcher (design §4.4): detect an
//! ILDCP request and answer it directly from the account's own configuration,
//! without ever reaching the `ilp` sub-protocol's normal forwarding path.
//!
//! Thin wrapper over `interledger_ildcp`, which already implements the ILDCP wire
//! format (see `interledger-ildcp::server::IldcpService` for the upstream version of
//! this same intercept, written against the generic `IncomingService` pipeline this
//! crate doesn't use).

use interledger_ildcp::{is_ildcp_request, IldcpResponseBuilder};
use interledger_packet::{Address, Fulfill, Prepare};

/// The asset this crate always reports to ILDCP peers: XRP at drop scale.
pub const ASSET_CODE: &str = "XRP";
pub const ASSET_SCALE: u8 = 6;

/// The client's assigned ILP address and asset details, as handed back on a
/// `peer.config` request.
#[derive(Clone, Debug)]
pub struct IldcpConfig {
    pub client_address: Address,
}

impl IldcpConfig {
    pub fn new(client_address: Address) -> Self {
        IldcpConfig { client_address }
    }

    pub fn into_fulfill(self) -> Fulfill {
        let response = IldcpResponseBuilder {
            ilp_address: &self.client_address,
            asset_scale: ASSET_SCALE,
            asset_code: ASSET_CODE,
        }
        .build();
        Fulfill::from(response)
    }
}

/// Whether `prepare` is an ILDCP config request (destination `peer.config` with the
/// fixed peer-protocol execution condition).
pub fn is_peer_config_request(prepare: &Prepare) -> bool {
    is_ildcp_request(prepare)
}
