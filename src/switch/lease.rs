//! Address leases of one network.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseKind {
    Dynamic,
    Static,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub alias: String,
    pub address: Ipv4Addr,
    pub network: String,
    pub kind: LeaseKind,
}

#[derive(Default)]
struct Tables {
    by_alias: HashMap<String, Lease>,
    by_addr: HashMap<Ipv4Addr, String>,
}

/// Hands out addresses from an inclusive range, keyed by endpoint alias.
pub struct LeasePool {
    network: String,
    range: Option<(Ipv4Addr, Ipv4Addr)>,
    tables: RwLock<Tables>,
}

impl LeasePool {
    pub fn new(network: &str, range: Option<(Ipv4Addr, Ipv4Addr)>) -> Self {
        Self {
            network: network.to_string(),
            range,
            tables: RwLock::new(Tables::default()),
        }
    }

    pub fn get(&self, alias: &str) -> Option<Lease> {
        self.tables.read().by_alias.get(alias).cloned()
    }

    pub fn get_by_addr(&self, address: Ipv4Addr) -> Option<Lease> {
        let tables = self.tables.read();
        tables
            .by_addr
            .get(&address)
            .and_then(|alias| tables.by_alias.get(alias))
            .cloned()
    }

    /// The alias's lease, allocating the first free address if it has none.
    pub fn lease(&self, alias: &str) -> Option<Lease> {
        let mut tables = self.tables.write();
        if let Some(lease) = tables.by_alias.get(alias) {
            return Some(lease.clone());
        }
        let (start, end) = self.range?;
        let address = (u32::from(start)..=u32::from(end))
            .map(Ipv4Addr::from)
            .find(|addr| !tables.by_addr.contains_key(addr))?;
        Some(self.insert(&mut tables, alias, address, LeaseKind::Dynamic))
    }

    /// Give `address` to `alias`. Fails if another alias holds it.
    pub fn bind(&self, alias: &str, address: Ipv4Addr) -> Option<Lease> {
        let mut tables = self.tables.write();
        match tables.by_addr.get(&address) {
            Some(owner) if owner == alias => return tables.by_alias.get(alias).cloned(),
            Some(owner) => {
                debug!(network = %self.network, %address, owner = %owner, alias, "Address in use");
                return None;
            }
            None => {}
        }
        if let Some(old) = tables.by_alias.get(alias) {
            if old.kind == LeaseKind::Static {
                return None;
            }
            let old = old.address;
            tables.by_addr.remove(&old);
        }
        Some(self.insert(&mut tables, alias, address, LeaseKind::Dynamic))
    }

    /// Reserve `address` for `alias` permanently.
    pub fn add_static(&self, alias: &str, address: Ipv4Addr) -> Lease {
        let mut tables = self.tables.write();
        if let Some(old) = tables.by_alias.get(alias).map(|l| l.address) {
            tables.by_addr.remove(&old);
        }
        if let Some(owner) = tables.by_addr.get(&address).cloned() {
            tables.by_alias.remove(&owner);
        }
        self.insert(&mut tables, alias, address, LeaseKind::Static)
    }

    /// Return a dynamic lease to the pool. Static leases stay.
    pub fn release(&self, alias: &str) -> Option<Lease> {
        let mut tables = self.tables.write();
        match tables.by_alias.get(alias) {
            Some(lease) if lease.kind == LeaseKind::Dynamic => {}
            _ => return None,
        }
        let lease = tables.by_alias.remove(alias)?;
        tables.by_addr.remove(&lease.address);
        info!(network = %self.network, alias, address = %lease.address, "Lease released");
        Some(lease)
    }

    pub fn list(&self) -> Vec<Lease> {
        let mut leases: Vec<Lease> = self.tables.read().by_alias.values().cloned().collect();
        leases.sort_by_key(|l| l.address);
        leases
    }

    fn insert(&self, tables: &mut Tables, alias: &str, address: Ipv4Addr, kind: LeaseKind) -> Lease {
        let lease = Lease {
            alias: alias.to_string(),
            address,
            network: self.network.clone(),
            kind,
        };
        tables.by_addr.insert(address, alias.to_string());
        tables.by_alias.insert(alias.to_string(), lease.clone());
        info!(network = %self.network, alias, %address, ?kind, "Lease added");
        lease
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> LeasePool {
        LeasePool::new(
            "corp",
            Some((Ipv4Addr::new(10, 0, 0, 100), Ipv4Addr::new(10, 0, 0, 102))),
        )
    }

    #[test]
    fn test_allocate_first_free() {
        let pool = pool();
        let a = pool.lease("a").unwrap();
        assert_eq!(a.address, Ipv4Addr::new(10, 0, 0, 100));
        assert_eq!(pool.lease("a").unwrap(), a);
        assert_eq!(pool.lease("b").unwrap().address, Ipv4Addr::new(10, 0, 0, 101));

        pool.release("a");
        assert_eq!(pool.lease("c").unwrap().address, Ipv4Addr::new(10, 0, 0, 100));
        assert_eq!(pool.lease("d").unwrap().address, Ipv4Addr::new(10, 0, 0, 102));
        assert!(pool.lease("e").is_none());
    }

    #[test]
    fn test_bind_requested_address() {
        let pool = pool();
        let addr = Ipv4Addr::new(10, 0, 0, 5);
        assert_eq!(pool.bind("a", addr).unwrap().address, addr);
        assert!(pool.bind("b", addr).is_none());

        // Rebinding moves the alias and frees the old address
        let other = Ipv4Addr::new(10, 0, 0, 6);
        pool.bind("a", other).unwrap();
        assert!(pool.get_by_addr(addr).is_none());
        assert_eq!(pool.get_by_addr(other).unwrap().alias, "a");
    }

    #[test]
    fn test_static_leases_survive_release() {
        let pool = pool();
        pool.add_static("printer", Ipv4Addr::new(10, 0, 0, 100));
        assert!(pool.release("printer").is_none());
        assert_eq!(pool.get("printer").unwrap().kind, LeaseKind::Static);

        // Allocation skips the reserved address
        assert_eq!(pool.lease("a").unwrap().address, Ipv4Addr::new(10, 0, 0, 101));
        assert!(pool.bind("printer", Ipv4Addr::new(10, 0, 0, 50)).is_none());
        assert_eq!(pool.list().len(), 2);
    }
}
