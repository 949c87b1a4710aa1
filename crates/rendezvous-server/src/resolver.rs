//! Maps an observed peer socket address to the address advertised to that
//! peer's friends.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::ServerConfig;

pub trait AddressResolver: Send + Sync {
    fn advertised_address(&self, peer: SocketAddr) -> String;
}

/// Advertises the IP the server observed on the connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct PeerAddressResolver;

impl AddressResolver for PeerAddressResolver {
    fn advertised_address(&self, peer: SocketAddr) -> String {
        peer.ip().to_canonical().to_string()
    }
}

/// Advertises a fixed address for every peer (`ADVERTISE_ADDR`).
#[derive(Debug, Clone)]
pub struct FixedAddressResolver {
    address: String,
}

impl FixedAddressResolver {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

impl AddressResolver for FixedAddressResolver {
    fn advertised_address(&self, _peer: SocketAddr) -> String {
        self.address.clone()
    }
}

pub fn resolver_from_config(config: &ServerConfig) -> Arc<dyn AddressResolver> {
    match &config.advertise_addr {
        Some(addr) => Arc::new(FixedAddressResolver::new(addr.clone())),
        None => Arc::new(PeerAddressResolver),
    }
}
