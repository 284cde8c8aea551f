//! Overlay wire protocol.
//!
//! This module contains:
//! - Frame: size/flags header, control actions and the streaming codec
//! - Message: JSON bodies of the control actions

mod frame;
mod message;

pub use frame::{
    Action, Frame, FrameCodec, ACTION_SIZE, DEFAULT_MAX_SIZE, FLAG_CONTROL, HEADER_SIZE,
};
pub use message::{
    netmask_to_prefix, network_equal, prefix_to_netmask, unix_nanos, NeighborInfo, Network,
    PingMessage, Route, User, DEFAULT_NETWORK, LOGIN_OKAY,
};
