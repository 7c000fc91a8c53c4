//! NAT-PMP port leasing.
//!
//! NAT-PMP has no "extend" operation, so a renewal is a fresh mapping
//! request with the same internal port. Both TCP and UDP are always
//! requested and must come back with the same external port.
//!
//! - [`codec`]: RFC 6886 wire format
//! - [`NatPmpGateway`]: UDP transport
//! - [`LeaseClient`]: acquisition, renewal and release of the pair

pub mod codec;
mod client;
mod error;
mod gateway;

pub use client::{LeaseClient, LeaseOutcome, LeasePair, LeaseSettings, PortLease};
pub use codec::{MappingRequest, MappingResponse, Protocol};
pub use error::{CodecError, LeaseError, LeaseResult};
pub use gateway::{NAT_PMP_PORT, NatPmpGateway};

use std::net::Ipv4Addr;

/// Capability to talk to a NAT-PMP gateway.
#[allow(async_fn_in_trait)]
pub trait MappingGateway {
    /// Send one mapping request. No retries.
    async fn map(&mut self, request: MappingRequest) -> LeaseResult<MappingResponse>;

    /// Ask the gateway for its public address.
    async fn public_address(&mut self) -> LeaseResult<Ipv4Addr>;
}
