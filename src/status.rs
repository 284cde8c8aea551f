//! Endpoint status snapshot written for external consumers.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::protocol::Network;

/// What an endpoint looks like from the outside.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub err_pkt: u64,
    /// Seconds since the worker started.
    pub uptime: u64,
    /// Seconds since the active connection was established.
    pub alive_time: u64,
    pub state: String,
    pub device: String,
    pub network: String,
    pub protocol: String,
    pub user: String,
    pub remote: String,
    pub uuid: String,
    pub alias: String,
    pub system: String,
    pub latency_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Network>,
}

impl EndpointStatus {
    /// Write the snapshot as pretty JSON, replacing the file atomically.
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let data = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&data)?)
    }
}
