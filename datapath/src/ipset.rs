//! In-memory IP-sets with start-up reconciliation.
//!
//! Members present before start are marked stale. Re-adding a member clears
//! the mark, and `init_done` flushes whatever is still stale.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use node_manager::ipset::{Family, IpSetManager};

#[derive(Debug)]
struct Set {
    family: Family,
    members: BTreeSet<IpAddr>,
    stale: BTreeSet<IpAddr>,
}

impl Set {
    fn new(family: Family) -> Self {
        Self {
            family,
            members: BTreeSet::new(),
            stale: BTreeSet::new(),
        }
    }

    fn accepts(&self, ip: &IpAddr) -> bool {
        match self.family {
            Family::Inet => ip.is_ipv4(),
            Family::Inet6 => ip.is_ipv6(),
        }
    }
}

#[derive(Debug, Default)]
pub struct IpSetStore {
    sets: RwLock<HashMap<String, Set>>,
    initialized: RwLock<bool>,
}

impl IpSetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a set with members left over from a previous run.
    pub fn with_existing(self, name: &str, family: Family, addrs: &[IpAddr]) -> Self {
        {
            let mut sets = self.sets.write();
            let set = sets.entry(name.to_string()).or_insert_with(|| Set::new(family));
            for ip in addrs {
                if !set.accepts(ip) {
                    continue;
                }
                set.members.insert(*ip);
                set.stale.insert(*ip);
            }
        }
        self
    }

    pub fn members(&self, name: &str) -> BTreeSet<IpAddr> {
        self.sets
            .read()
            .get(name)
            .map(|s| s.members.clone())
            .unwrap_or_default()
    }

    pub fn is_initialized(&self) -> bool {
        *self.initialized.read()
    }

    /// Member count per set, for status output.
    pub fn summary(&self) -> BTreeMap<String, usize> {
        self.sets
            .read()
            .iter()
            .map(|(name, set)| (name.clone(), set.members.len()))
            .collect()
    }
}

impl IpSetManager for IpSetStore {
    fn add_to_ip_set(&self, name: &str, family: Family, addrs: &[IpAddr]) {
        let mut sets = self.sets.write();
        let set = sets.entry(name.to_string()).or_insert_with(|| Set::new(family));
        if set.family != family {
            warn!(set = name, ?family, existing = ?set.family, "IP-set family mismatch, ignoring add");
            return;
        }
        for ip in addrs {
            if !set.accepts(ip) {
                warn!(set = name, %ip, "Address family does not match IP-set");
                continue;
            }
            set.stale.remove(ip);
            if set.members.insert(*ip) {
                debug!(set = name, %ip, "added IP-set member");
            }
        }
    }

    fn remove_from_ip_set(&self, name: &str, addrs: &[IpAddr]) {
        let mut sets = self.sets.write();
        let Some(set) = sets.get_mut(name) else {
            return;
        };
        for ip in addrs {
            set.stale.remove(ip);
            if set.members.remove(ip) {
                debug!(set = name, %ip, "removed IP-set member");
            }
        }
    }

    fn init_done(&self) {
        let mut initialized = self.initialized.write();
        if *initialized {
            return;
        }
        let mut sets = self.sets.write();
        for (name, set) in sets.iter_mut() {
            let stale = std::mem::take(&mut set.stale);
            if stale.is_empty() {
                continue;
            }
            info!(set = %name, count = stale.len(), "Flushing stale IP-set members");
            for ip in &stale {
                set.members.remove(ip);
            }
        }
        *initialized = true;
    }
}
