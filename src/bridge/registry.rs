//! Bridges of one switch, keyed by network name.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::LearningBridge;

/// Owns the switch's bridges. Created at switch start, shut down at stop.
pub struct Registry {
    mac_timeout: Duration,
    bridges: RwLock<HashMap<String, Arc<LearningBridge>>>,
}

impl Registry {
    pub fn new(mac_timeout: Duration) -> Self {
        Self {
            mac_timeout,
            bridges: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, network: &str) -> Option<Arc<LearningBridge>> {
        self.bridges.read().get(network).cloned()
    }

    /// The bridge of `network`, created and started on first use.
    pub fn get_or_create(&self, network: &str) -> Arc<LearningBridge> {
        if let Some(bridge) = self.get(network) {
            return bridge;
        }
        let mut bridges = self.bridges.write();
        let bridge = bridges
            .entry(network.to_string())
            .or_insert_with(|| {
                info!(network, "Creating bridge");
                Arc::new(LearningBridge::new(network, self.mac_timeout))
            })
            .clone();
        bridge.start();
        bridge
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bridges.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop every bridge and forget them.
    pub async fn shutdown(&self) {
        let bridges: Vec<Arc<LearningBridge>> =
            self.bridges.write().drain().map(|(_, b)| b).collect();
        for bridge in bridges {
            bridge.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_one_bridge_per_network() {
        let registry = Registry::new(Duration::from_secs(300));
        let a = registry.get_or_create("corp");
        let b = registry.get_or_create("corp");
        assert!(Arc::ptr_eq(&a, &b));
        registry.get_or_create("lab");
        assert_eq!(registry.names(), vec!["corp", "lab"]);

        registry.shutdown().await;
        assert!(registry.get("corp").is_none());
    }
}
