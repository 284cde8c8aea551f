//! Switch side of the overlay: request handling, leases and the TCP server.

mod handler;
mod lease;
mod server;

pub use handler::{
    ClientRecord, Outcome, RequestHandler, LOGIN_FAILED, PLACEHOLDER_ADDR, PLACEHOLDER_NETMASK,
};
pub use lease::{Lease, LeaseKind, LeasePool};
pub use server::SwitchServer;
