//! Packet handling utilities for Ethernet, ARP and IPv4.
//!
//! Only the fields the tap adapter and the bridge need are decoded; the data
//! path otherwise treats frames as opaque bytes.

pub mod arp;
pub mod ethernet;
pub mod ipv4;

pub use arp::{ArpOperation, ArpPacket};
pub use ethernet::{
    format_mac, is_multicast, random_mac, wrap_ip_in_ethernet, EtherType, EthernetHeader, MacAddr,
    BROADCAST_MAC, HEADER_SIZE, ZERO_MAC,
};
pub use ipv4::Ipv4Header;
