//! On-disk form of one recorded TCP exchange

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub timestamp: DateTime<Utc>,
    /// Address of the sandboxed client
    pub client: SocketAddr,
    /// Address the client originally connected to
    pub server: SocketAddr,
    pub request: Vec<u8>,
    pub response: Vec<u8>,
}

impl TrafficRecord {
    pub fn new(client: SocketAddr, server: SocketAddr, request: Vec<u8>, response: Vec<u8>) -> Self {
        Self {
            timestamp: Utc::now(),
            client,
            server,
            request,
            response,
        }
    }
}
