//! lanlink: an overlay virtual LAN.
//!
//! Endpoints ([`worker::Worker`]) attach a TUN/TAP device to a switch over
//! TCP or UDP; the switch ([`switch::SwitchServer`]) bridges the frames of
//! every endpoint in the same network.

pub mod adapter;
pub mod bridge;
pub mod config;
pub mod error;
pub mod packet;
pub mod platform;
pub mod protocol;
pub mod session;
pub mod status;
pub mod switch;
pub mod transport;
pub mod worker;

pub use config::{AccessConfig, SwitchConfig};
pub use error::{Error, Result};
pub use switch::SwitchServer;
pub use worker::Worker;

/// Default configuration file of the endpoint.
pub const DEFAULT_ACCESS_CONFIG: &str = "access.json";

/// Default configuration file of the switch.
pub const DEFAULT_SWITCH_CONFIG: &str = "switch.json";
