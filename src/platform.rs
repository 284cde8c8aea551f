//! Host networking collaborator.
//!
//! The core never touches interface addresses or routes itself; it asks a
//! [`Platform`] to. On Linux that is the `ip` command, elsewhere a logger.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::Route;

/// Address and route manipulation on the host.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Assign `addr` (CIDR) to `device`.
    async fn add_address(&self, device: &str, addr: &str, gateway: &str) -> Result<()>;

    async fn delete_address(&self, device: &str, addr: &str) -> Result<()>;

    async fn add_routes(&self, device: &str, routes: &[Route]) -> Result<()>;

    async fn delete_routes(&self, device: &str, routes: &[Route]) -> Result<()>;

    /// Bring a freshly opened device up.
    async fn on_interface_ready(&self, device: &str, mtu: u16) -> Result<()>;

    /// Enslave `device` to the host bridge `bridge`.
    async fn set_master(&self, device: &str, bridge: &str) -> Result<()>;
}

/// Drives the Linux `ip` tool.
#[derive(Debug, Default)]
pub struct IpCommandPlatform;

impl IpCommandPlatform {
    async fn ip(&self, args: &[&str]) -> Result<()> {
        debug!(command = %args.join(" "), "ip");
        let output = Command::new("ip").args(args).output().await?;
        if !output.status.success() {
            return Err(Error::device(format!(
                "ip {}: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Platform for IpCommandPlatform {
    async fn add_address(&self, device: &str, addr: &str, gateway: &str) -> Result<()> {
        self.ip(&["address", "add", addr, "dev", device]).await?;
        info!(device, addr, gateway, "Address added");
        Ok(())
    }

    async fn delete_address(&self, device: &str, addr: &str) -> Result<()> {
        self.ip(&["address", "del", addr, "dev", device]).await?;
        info!(device, addr, "Address deleted");
        Ok(())
    }

    async fn add_routes(&self, device: &str, routes: &[Route]) -> Result<()> {
        for route in routes {
            let metric = route.metric.to_string();
            let res = self
                .ip(&[
                    "route", "replace", &route.prefix, "via", &route.nexthop, "metric", &metric,
                    "dev", device,
                ])
                .await;
            match res {
                Ok(()) => info!(device, %route, "Route added"),
                // One bad route must not block the rest.
                Err(e) => warn!(device, %route, error = %e, "Failed to add route"),
            }
        }
        Ok(())
    }

    async fn delete_routes(&self, device: &str, routes: &[Route]) -> Result<()> {
        for route in routes {
            if let Err(e) = self
                .ip(&["route", "del", &route.prefix, "via", &route.nexthop, "dev", device])
                .await
            {
                debug!(device, %route, error = %e, "Failed to delete route");
            }
        }
        Ok(())
    }

    async fn on_interface_ready(&self, device: &str, mtu: u16) -> Result<()> {
        let mtu = mtu.to_string();
        self.ip(&["link", "set", "dev", device, "mtu", &mtu, "up"]).await
    }

    async fn set_master(&self, device: &str, bridge: &str) -> Result<()> {
        self.ip(&["link", "set", "dev", device, "master", bridge]).await?;
        info!(device, bridge, "Device added to bridge");
        Ok(())
    }
}

/// Logs requests and changes nothing.
#[derive(Debug, Default)]
pub struct NullPlatform;

#[async_trait]
impl Platform for NullPlatform {
    async fn add_address(&self, device: &str, addr: &str, gateway: &str) -> Result<()> {
        info!(device, addr, gateway, "Address requested (not applied)");
        Ok(())
    }

    async fn delete_address(&self, device: &str, addr: &str) -> Result<()> {
        debug!(device, addr, "Address removal requested (not applied)");
        Ok(())
    }

    async fn add_routes(&self, device: &str, routes: &[Route]) -> Result<()> {
        for route in routes {
            info!(device, %route, "Route requested (not applied)");
        }
        Ok(())
    }

    async fn delete_routes(&self, device: &str, routes: &[Route]) -> Result<()> {
        debug!(device, count = routes.len(), "Route removal requested (not applied)");
        Ok(())
    }

    async fn on_interface_ready(&self, device: &str, mtu: u16) -> Result<()> {
        debug!(device, mtu, "Interface ready");
        Ok(())
    }

    async fn set_master(&self, device: &str, bridge: &str) -> Result<()> {
        debug!(device, bridge, "Bridge membership requested (not applied)");
        Ok(())
    }
}

/// The platform for the running OS.
pub fn default_platform() -> std::sync::Arc<dyn Platform> {
    if cfg!(target_os = "linux") {
        std::sync::Arc::new(IpCommandPlatform)
    } else {
        std::sync::Arc::new(NullPlatform)
    }
}
