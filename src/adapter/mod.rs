//! Virtual network devices and the tap adapter built on them.
//!
//! A [`Device`] is a raw packet pipe to the kernel (or to a test harness).
//! The [`TapAdapter`] owns one, reopens it after failures and, in TUN mode,
//! turns IP packets into Ethernet frames and back.

mod memory;
mod neighbor;
mod tap;

#[cfg(target_os = "linux")]
mod tun_linux;

pub use memory::{MemoryDevice, MemoryDeviceHandle, MemoryFactory};
pub use neighbor::{Neighbor, NeighborCache, NEIGHBOR_INTERVAL, NEIGHBOR_TICK, NEIGHBOR_TIMEOUT};
pub use tap::{TapAdapter, TapConfig, TapEvent, TapListener, REOPEN_DELAY};

#[cfg(target_os = "linux")]
pub use tun_linux::{KernelFactory, KernelTap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::Result;

/// Framing exchanged with the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Raw IP packets.
    Tun,
    /// Full Ethernet frames.
    #[default]
    Tap,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Tun => write!(f, "tun"),
            DeviceKind::Tap => write!(f, "tap"),
        }
    }
}

/// Parameters for opening a device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Requested interface name; empty lets the kernel choose.
    pub name: String,
    pub kind: DeviceKind,
    pub mtu: u16,
}

/// A virtual network interface.
///
/// `read` and `write` take `&self` so one task can block in `read` while
/// another writes. `close` must make a pending `read` return an error.
#[async_trait]
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> DeviceKind;

    /// Read one packet (TUN) or frame (TAP).
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write one packet (TUN) or frame (TAP).
    async fn write(&self, buf: &[u8]) -> Result<usize>;

    async fn close(&self);
}

/// Opens devices; called again on every reopen.
pub trait DeviceFactory: Send + Sync {
    fn open(&self, config: &DeviceConfig) -> Result<Arc<dyn Device>>;
}
