//! Keeps the group membership in sync
//!
//! The master accepts control connections, registers peers on LOGIN and
//! broadcasts the member list on every change ([master::MasterControl]).
//! Peers join, follow the updates and forward their telemetry
//! ([peer::PeerClient]).

use std::net::{IpAddr, SocketAddr};

pub mod master;
pub mod peer;

/// Public name of a peer: its HTTP base URL, built from the address the
/// master sees and the HTTP port the peer announces
pub fn peer_name(ip: IpAddr, port: u16) -> String {
    format!("http://{}", SocketAddr::new(ip, port))
}
