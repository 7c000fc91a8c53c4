//! NAT-PMP gateway transport over UDP.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::debug;

use super::codec::{
    MappingRequest, MappingResponse, decode_mapping_response, decode_public_address_response,
    encode_mapping_request, encode_public_address_request,
};
use super::error::{LeaseError, LeaseResult};
use super::MappingGateway;

/// NAT-PMP server port.
pub const NAT_PMP_PORT: u16 = 5351;

/// A NAT-PMP gateway reached over UDP, one datagram per request.
#[derive(Debug, Clone)]
pub struct NatPmpGateway {
    addr: SocketAddr,
    timeout: Duration,
}

impl NatPmpGateway {
    /// Gateway at `address` on the standard NAT-PMP port.
    pub fn new(address: Ipv4Addr, timeout: Duration) -> Self {
        Self::with_addr(SocketAddr::from((address, NAT_PMP_PORT)), timeout)
    }

    /// Gateway at an explicit socket address.
    pub fn with_addr(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    fn io_error(&self, source: std::io::Error) -> LeaseError {
        LeaseError::Io {
            gateway: self.addr.to_string(),
            source,
        }
    }

    /// Send one datagram and wait for one reply.
    async fn exchange(&self, request: &[u8]) -> LeaseResult<Vec<u8>> {
        let bind = if self.addr.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind).await.map_err(|e| self.io_error(e))?;
        socket.connect(self.addr).await.map_err(|e| self.io_error(e))?;
        socket.send(request).await.map_err(|e| self.io_error(e))?;

        let mut buf = [0_u8; 64];
        let size = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| LeaseError::Timeout {
                gateway: self.addr.to_string(),
                timeout: self.timeout,
            })?
            .map_err(|e| self.io_error(e))?;
        Ok(buf[..size].to_vec())
    }
}

impl MappingGateway for NatPmpGateway {
    async fn map(&mut self, request: MappingRequest) -> LeaseResult<MappingResponse> {
        debug!(
            "NAT-PMP {} request to {}: internal {} suggested {} lifetime {}",
            request.protocol,
            self.addr,
            request.internal_port,
            request.suggested_external_port,
            request.lifetime
        );
        let reply = self.exchange(&encode_mapping_request(&request)).await?;
        decode_mapping_response(request.protocol, &reply).map_err(|source| LeaseError::Protocol {
            protocol: request.protocol,
            source,
        })
    }

    async fn public_address(&mut self) -> LeaseResult<Ipv4Addr> {
        let reply = self.exchange(&encode_public_address_request()).await?;
        decode_public_address_response(&reply).map_err(LeaseError::PublicAddress)
    }
}
